// Copyright 2026 the Ngaro VM Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Conformance suite for `ngaro_vm`; everything lives in `tests/`.
