// Copyright 2026 the Ngaro VM Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Stack and image dump in the format expected by the external Python
//! test harness: three sections (data stack, address stack, file-cell
//! prefix of the image), the first prefixed by `0x1C`, the others by
//! `0x1D`; decimal cells separated by single spaces, no trailing
//! whitespace.

use std::io::{self, Write};

use ngaro_vm::Cell;
use ngaro_vm::vm::Machine;

const SECTION_START: u8 = 0x1C;
const SECTION_SEP: u8 = 0x1D;

fn dump_cells(w: &mut dyn Write, cells: &[Cell]) -> io::Result<()> {
    for (i, c) in cells.iter().enumerate() {
        if i > 0 {
            w.write_all(b" ")?;
        }
        write!(w, "{c}")?;
    }
    Ok(())
}

/// Dumps the machine's stacks and the loaded image prefix to `w`.
pub fn dump_machine(m: &Machine, w: &mut dyn Write) -> io::Result<()> {
    w.write_all(&[SECTION_START])?;
    dump_cells(w, m.data())?;
    w.write_all(&[SECTION_SEP])?;
    dump_cells(w, m.address())?;
    w.write_all(&[SECTION_SEP])?;
    dump_cells(w, &m.image()[..m.file_cells()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use ngaro_vm::vm::Instance;

    #[test]
    fn sections_and_separators() {
        let mut i = Instance::new(vec![1, 5, 1, 7, 5], "");
        i.machine_mut().set_file_cells(5);
        i.run().unwrap();
        let mut out = Vec::new();
        dump_machine(i.machine(), &mut out).unwrap();
        assert_eq!(out, b"\x1c5\x1d7\x1d1 5 1 7 5");
    }

    #[test]
    fn empty_sections_have_no_padding() {
        let mut i = Instance::new(vec![0], "");
        i.machine_mut().set_file_cells(0);
        i.run().unwrap();
        let mut out = Vec::new();
        dump_machine(i.machine(), &mut out).unwrap();
        assert_eq!(out, b"\x1c\x1d\x1d");
    }
}
