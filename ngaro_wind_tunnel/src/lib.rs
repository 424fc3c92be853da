// Copyright 2026 the Ngaro VM Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Benchmark crate for `ngaro_vm`; see `benches/`.
