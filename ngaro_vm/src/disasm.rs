// Copyright 2026 the Ngaro VM Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The disassembler.
//!
//! One instruction per line: the address, the mnemonic and any immediate
//! argument. The output round-trips: feeding a full disassembly back
//! through [`crate::asm::assemble`] reproduces the image, because
//!
//! - `lit` prints its value alone (re-assembling as an implicit `lit`),
//! - cells outside the opcode range print as `.dat N` with a `( call N )`
//!   comment hinting at the implicit-call reading.
//!
//! A trailing argument cut off by the end of the image prints `???`; such
//! truncated images are not expected to round-trip.

use std::io::{self, Write};

use crate::cell::Cell;
use crate::opcode::{OPCODE_COUNT, Opcode};

/// Disassembles the instruction at `pc` to `w` and returns the position of
/// the next instruction.
pub fn disassemble(cells: &[Cell], pc: usize, w: &mut dyn Write) -> io::Result<usize> {
    let op = cells[pc];
    let decoded = Opcode::from_cell(op);
    match decoded {
        None if op >= OPCODE_COUNT => write!(w, ".dat {op}\t( call {op} )")?,
        None => write!(w, ".dat {op}")?,
        Some(Opcode::Lit) => {}
        Some(op) => write!(w, "{}", op.mnemonic())?,
    }
    let next = pc + 1;
    if let Some(op) = decoded
        && op.has_argument()
    {
        if next < cells.len() {
            if op != Opcode::Lit {
                w.write_all(b" ")?;
            }
            write!(w, "{}", cells[next])?;
            return Ok(next + 1);
        }
        w.write_all(b"???")?;
    }
    Ok(next)
}

/// Disassembles every instruction in `cells` to `w`, one per line, with an
/// address column. `base` offsets the printed addresses for partial
/// disassemblies.
pub fn disassemble_all(cells: &[Cell], base: usize, w: &mut dyn Write) -> io::Result<()> {
    let mut pc = 0;
    while pc < cells.len() {
        write!(w, "{:>10}\t", base + pc)?;
        pc = disassemble(cells, pc, w)?;
        writeln!(w)?;
    }
    Ok(())
}

/// Convenience wrapper returning the disassembly as a string.
pub fn disassemble_to_string(cells: &[Cell], base: usize) -> String {
    let mut buf = Vec::new();
    // Writing to a Vec cannot fail.
    let _ = disassemble_all(cells, base, &mut buf);
    String::from_utf8_lossy(&buf).into_owned()
}
