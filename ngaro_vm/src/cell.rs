// Copyright 2026 the Ngaro VM Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The raw cell type stored in memory locations, stack slots and ports.
//!
//! The cell width is fixed at build time: 32 bits by default, 64 bits with
//! the `cell64` feature. Images of either width can still be loaded and
//! saved through [`crate::image`], as long as every value fits the
//! destination width.

/// A signed machine cell.
#[cfg(not(feature = "cell64"))]
pub type Cell = i32;

/// A signed machine cell.
#[cfg(feature = "cell64")]
pub type Cell = i64;

/// The unsigned counterpart of [`Cell`], used for logical shifts.
#[cfg(not(feature = "cell64"))]
pub type UCell = u32;

/// The unsigned counterpart of [`Cell`], used for logical shifts.
#[cfg(feature = "cell64")]
pub type UCell = u64;

/// Cell width in bits. Reported by the port-5 capability query.
pub const CELL_BITS: u32 = Cell::BITS;
