// Copyright 2026 the Ngaro VM Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The terminal collaborator.
//!
//! Port 2 writes bytes, port 3 flushes, the port-5 query reports the window
//! size, and port 8 drives cursor and color control. [`Terminal`] is the
//! capability set the engine needs; [`Vt100Terminal`] builds the whole set
//! around any byte writer by emitting VT100 escape sequences.

use std::io::{self, Write};

use crate::cell::Cell;

/// Capabilities the I/O port model expects from an output device.
pub trait Terminal {
    /// Writes raw bytes.
    fn write(&mut self, buf: &[u8]) -> io::Result<()>;
    /// Flushes buffered output.
    fn flush(&mut self) -> io::Result<()>;
    /// Reports `(width, height)` in character cells, or `(0, 0)` when
    /// unknown.
    fn size(&self) -> (Cell, Cell);
    /// Clears the screen and homes the cursor.
    fn clear(&mut self) -> io::Result<()>;
    /// Moves the cursor to `row`, `col` (1-based).
    fn move_cursor(&mut self, row: Cell, col: Cell) -> io::Result<()>;
    /// Sets the foreground color index.
    fn fg_color(&mut self, fg: Cell) -> io::Result<()>;
    /// Sets the background color index.
    fn bg_color(&mut self, bg: Cell) -> io::Result<()>;
    /// Reports whether the port-8 extended subset is wired up.
    fn port8_enabled(&self) -> bool {
        false
    }
}

/// A [`Terminal`] implementing the extended subset with VT100 escapes.
///
/// The size callback is optional; without one the terminal reports
/// `(0, 0)` and programs fall back to their own defaults.
pub struct Vt100Terminal<W: Write> {
    w: W,
    size: Option<Box<dyn Fn() -> (Cell, Cell)>>,
}

impl<W: Write> Vt100Terminal<W> {
    /// Wraps `w` with no size reporting.
    pub fn new(w: W) -> Self {
        Self { w, size: None }
    }

    /// Wraps `w` with a window size callback.
    pub fn with_size(w: W, size: impl Fn() -> (Cell, Cell) + 'static) -> Self {
        Self {
            w,
            size: Some(Box::new(size)),
        }
    }

    /// Returns the wrapped writer.
    pub fn into_inner(self) -> W {
        self.w
    }
}

impl<W: Write> Terminal for Vt100Terminal<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        self.w.write_all(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.w.flush()
    }

    fn size(&self) -> (Cell, Cell) {
        self.size.as_ref().map_or((0, 0), |f| f())
    }

    fn clear(&mut self) -> io::Result<()> {
        self.w.write_all(b"\x1b[2J\x1b[1;1H")
    }

    fn move_cursor(&mut self, row: Cell, col: Cell) -> io::Result<()> {
        write!(self.w, "\x1b[{row};{col}H")
    }

    fn fg_color(&mut self, fg: Cell) -> io::Result<()> {
        self.w
            .write_all(&[0x1b, b'[', b'3', b'0'.wrapping_add(fg as u8), b'm'])
    }

    fn bg_color(&mut self, bg: Cell) -> io::Result<()> {
        self.w
            .write_all(&[0x1b, b'[', b'4', b'0'.wrapping_add(bg as u8), b'm'])
    }

    fn port8_enabled(&self) -> bool {
        true
    }
}
