// Copyright 2026 the Ngaro VM Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The Ngaro instruction set.
//!
//! Opcodes `0..=30` are fixed. Any code cell holding a value greater than
//! [`OPCODE_COUNT`] minus one is executed as an implicit call to that
//! address; negative cells are custom opcodes (or plain data) handled by an
//! embedder-registered opcode handler.

use crate::cell::Cell;

/// Number of reserved opcodes. Code cells `>= OPCODE_COUNT` are implicit
/// calls.
pub const OPCODE_COUNT: Cell = 31;

/// A decoded Ngaro opcode.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// No operation.
    Nop = 0,
    /// Push the next cell as a literal.
    Lit = 1,
    /// Duplicate TOS.
    Dup = 2,
    /// Drop TOS.
    Drop = 3,
    /// Swap TOS and NOS.
    Swap = 4,
    /// Move TOS to the address stack.
    Push = 5,
    /// Move the top of the address stack to TOS.
    Pop = 6,
    /// Decrement TOS; branch to the next cell while it stays positive.
    Loop = 7,
    /// Unconditional branch to the next cell.
    Jump = 8,
    /// Return: pop the address stack and resume after the call site.
    Return = 9,
    /// Branch if NOS > TOS.
    GtJump = 10,
    /// Branch if NOS < TOS.
    LtJump = 11,
    /// Branch if NOS != TOS.
    NeJump = 12,
    /// Branch if NOS == TOS.
    EqJump = 13,
    /// Fetch: TOS = mem[TOS].
    Fetch = 14,
    /// Store: mem[TOS] = NOS.
    Store = 15,
    /// Addition.
    Add = 16,
    /// Subtraction.
    Sub = 17,
    /// Multiplication.
    Mul = 18,
    /// Combined remainder/quotient.
    DivMod = 19,
    /// Bitwise and.
    And = 20,
    /// Bitwise or.
    Or = 21,
    /// Bitwise xor.
    Xor = 22,
    /// Logical left shift by the low byte of TOS.
    Shl = 23,
    /// Arithmetic right shift by the low byte of TOS.
    Shr = 24,
    /// Return if TOS is zero, dropping it.
    ZeroExit = 25,
    /// Increment TOS.
    Inc = 26,
    /// Decrement TOS.
    Dec = 27,
    /// Read a port.
    In = 28,
    /// Write a port.
    Out = 29,
    /// Run a WAIT cycle over the bound port handlers.
    Wait = 30,
}

/// Canonical mnemonics, indexed by opcode value.
const MNEMONICS: [&str; OPCODE_COUNT as usize] = [
    "nop", "lit", "dup", "drop", "swap", "push", "pop", "loop", "jump", ";", ">jump", "<jump",
    "!jump", "=jump", "@", "!", "+", "-", "*", "/mod", "and", "or", "xor", "<<", ">>", "0;", "1+",
    "1-", "in", "out", "wait",
];

/// Accepted alias mnemonics.
const ALIASES: [(&str, Opcode); 14] = [
    ("jmp", Opcode::Jump),
    ("ret", Opcode::Return),
    ("jgt", Opcode::GtJump),
    ("jlt", Opcode::LtJump),
    ("jne", Opcode::NeJump),
    ("jeq", Opcode::EqJump),
    ("add", Opcode::Add),
    ("sub", Opcode::Sub),
    ("mul", Opcode::Mul),
    ("shl", Opcode::Shl),
    ("asr", Opcode::Shr),
    ("0ret", Opcode::ZeroExit),
    ("inc", Opcode::Inc),
    ("dec", Opcode::Dec),
];

impl Opcode {
    /// Decodes a cell into an opcode. Returns `None` for implicit calls
    /// (`>= OPCODE_COUNT`) and custom opcodes (`< 0`).
    #[must_use]
    pub fn from_cell(c: Cell) -> Option<Self> {
        Some(match c {
            0 => Self::Nop,
            1 => Self::Lit,
            2 => Self::Dup,
            3 => Self::Drop,
            4 => Self::Swap,
            5 => Self::Push,
            6 => Self::Pop,
            7 => Self::Loop,
            8 => Self::Jump,
            9 => Self::Return,
            10 => Self::GtJump,
            11 => Self::LtJump,
            12 => Self::NeJump,
            13 => Self::EqJump,
            14 => Self::Fetch,
            15 => Self::Store,
            16 => Self::Add,
            17 => Self::Sub,
            18 => Self::Mul,
            19 => Self::DivMod,
            20 => Self::And,
            21 => Self::Or,
            22 => Self::Xor,
            23 => Self::Shl,
            24 => Self::Shr,
            25 => Self::ZeroExit,
            26 => Self::Inc,
            27 => Self::Dec,
            28 => Self::In,
            29 => Self::Out,
            30 => Self::Wait,
            _ => return None,
        })
    }

    /// Resolves a mnemonic (canonical or alias) to an opcode.
    #[must_use]
    pub fn from_mnemonic(s: &str) -> Option<Self> {
        if let Some(i) = MNEMONICS.iter().position(|&m| m == s) {
            return Self::from_cell(i as Cell);
        }
        ALIASES.iter().find(|(a, _)| *a == s).map(|&(_, op)| op)
    }

    /// Returns the canonical mnemonic.
    #[must_use]
    pub fn mnemonic(self) -> &'static str {
        MNEMONICS[self as usize]
    }

    /// Returns the opcode's cell value.
    #[must_use]
    pub fn cell(self) -> Cell {
        self as Cell
    }

    /// Returns `true` if the opcode consumes a second cell at `PC + 1`.
    #[must_use]
    pub fn has_argument(self) -> bool {
        matches!(
            self,
            Self::Lit
                | Self::Loop
                | Self::Jump
                | Self::GtJump
                | Self::LtJump
                | Self::NeJump
                | Self::EqJump
        )
    }
}
