// Copyright 2026 the Ngaro VM Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! `ngaro_vm`: an embeddable Ngaro virtual machine.
//!
//! The Ngaro VM is the small stack machine that hosts the Retro Forth
//! language: a cell-addressable memory image, a data stack, an address
//! stack, and a bank of I/O ports flushed through handlers by the `wait`
//! instruction. This crate provides the execution engine, the default I/O
//! port model, the image codec, and a symbolic assembler/disassembler.
//!
//! ## Example
//!
//! ```
//! use ngaro_vm::asm::assemble;
//! use ngaro_vm::vm::Instance;
//!
//! let img = assemble("sum", "2 3 +")?;
//! let mut vm = Instance::new(img, "");
//! vm.run().unwrap();
//! assert_eq!(vm.machine().data(), &[5]);
//! # Ok::<(), ngaro_vm::asm::AsmError>(())
//! ```
//!
//! Embedders talk to a running program through the port model: bind
//! handlers with [`vm::Instance::bind_in_handler`],
//! [`vm::Instance::bind_out_handler`] and
//! [`vm::Instance::bind_wait_handler`], feed input with
//! [`vm::Instance::push_input`], and attach a [`term::Terminal`] for
//! output.

pub mod asm;
pub mod cell;
pub mod disasm;
pub mod image;
pub mod input;
pub mod io;
pub mod opcode;
pub mod stack;
pub mod term;
pub mod vm;

pub use cell::{CELL_BITS, Cell, UCell};
pub use opcode::{OPCODE_COUNT, Opcode};
