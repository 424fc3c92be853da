// Copyright 2026 the Ngaro VM Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Default I/O port semantics.
//!
//! A WAIT cycle flushes every nonzero port with a bound handler (the
//! standard ports 1, 2, 4, 5 and 8 always count as bound) until port 0
//! reads 1. Handlers acknowledge through [`Machine::wait_reply`]; a user
//! handler may delegate to [`Machine::wait`] to decorate the default
//! behavior instead of replacing it.
//!
//! Port assignments:
//!
//! | Port | Role |
//! |---|---|
//! | 0 | ready flag |
//! | 1 | byte input from the input stack |
//! | 2 | byte output (negative values clear the screen) |
//! | 3 | output flush (on `out`, no WAIT handler) |
//! | 4 | file and image sub-protocol |
//! | 5 | capability queries |
//! | 8 | extended terminal control |

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::cell::{CELL_BITS, Cell};
use crate::image::{self, CellWidth};
use crate::vm::{Fault, Handlers, Machine};

/// Ports with default WAIT behavior.
pub const DEFAULT_WAIT_PORTS: [Cell; 5] = [1, 2, 4, 5, 8];

/// File open modes for the port-4 open command.
const MODE_READ: Cell = 0;
const MODE_WRITE: Cell = 1;
const MODE_APPEND: Cell = 2;
const MODE_READ_WRITE: Cell = 3;

/// Open files tracked by the port-4 sub-protocol, keyed by descriptor.
#[derive(Debug)]
pub struct FileTable {
    files: BTreeMap<Cell, File>,
    next: Cell,
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FileTable {
    /// Creates an empty table. Descriptors start at 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            files: BTreeMap::new(),
            next: 1,
        }
    }

    fn insert(&mut self, f: File) -> Cell {
        let fd = self.next;
        self.next = self.next.wrapping_add(1).max(1);
        self.files.insert(fd, f);
        fd
    }

    fn get_mut(&mut self, fd: Cell) -> Option<&mut File> {
        self.files.get_mut(&fd)
    }

    fn remove(&mut self, fd: Cell) -> Option<File> {
        self.files.remove(&fd)
    }

    /// Number of open descriptors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Returns `true` when no descriptor is open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Runs one WAIT cycle: every bound port with a nonzero value is flushed
/// through its handler while port 0 is not 1.
pub(crate) fn wait_cycle(m: &mut Machine, h: &mut Handlers) -> Result<(), Fault> {
    for p in DEFAULT_WAIT_PORTS {
        if m.ports()[0] == 1 {
            return Ok(());
        }
        let v = m.ports()[p as usize];
        if v == 0 {
            continue;
        }
        match h.wait.get_mut(&p) {
            Some(f) => f(m, v, p)?,
            None => m.wait(v, p)?,
        }
    }
    for (&p, f) in &mut h.wait {
        if DEFAULT_WAIT_PORTS.contains(&p) {
            continue;
        }
        if m.ports()[0] == 1 {
            return Ok(());
        }
        let Some(&v) = usize::try_from(p).ok().and_then(|i| m.ports().get(i)) else {
            continue;
        };
        if v == 0 {
            continue;
        }
        f(m, v, p)?;
    }
    Ok(())
}

impl Machine {
    /// The default WAIT behavior for `port`, with `v` the port value that
    /// triggered it. Custom wait handlers can delegate here.
    pub fn wait(&mut self, v: Cell, port: Cell) -> Result<(), Fault> {
        match port {
            1 => self.wait_input(v),
            2 => self.wait_output(v),
            4 => self.wait_files(v),
            5 => self.wait_query(v),
            8 => self.wait_terminal(v),
            _ => Ok(()),
        }
    }

    fn wait_input(&mut self, v: Cell) -> Result<(), Fault> {
        if v != 1 {
            return Ok(());
        }
        match self.input.read_byte()? {
            Some(b) => {
                self.wait_reply(Cell::from(b), 1);
                Ok(())
            }
            None => {
                self.wait_reply(-1, 1);
                Err(Fault::InputExhausted)
            }
        }
    }

    fn wait_output(&mut self, v: Cell) -> Result<(), Fault> {
        if v != 1 {
            return Ok(());
        }
        let c = self.data.pop();
        if let Some(t) = &mut self.output {
            if c < 0 {
                t.clear()?;
            } else {
                t.write(&[c as u8])?;
            }
        }
        self.wait_reply(0, 2);
        Ok(())
    }

    fn wait_files(&mut self, v: Cell) -> Result<(), Fault> {
        self.ports[0] = 1;
        let result = match v {
            // Save the memory image through the configured hook.
            1 => {
                self.save_image()?;
                0
            }
            // Include: push the named file onto the input stack.
            2 => {
                let addr = self.data.pop();
                let name = self.image_string(addr)?;
                let f = File::open(&name)?;
                self.input.push(std::io::BufReader::new(f));
                0
            }
            -1 => self.file_open()?,
            -2 => self.file_read(),
            -3 => self.file_write(),
            -4 => {
                let fd = self.data.pop();
                self.files.remove(fd);
                0
            }
            -5 => {
                let fd = self.data.pop();
                match self.files.get_mut(fd).and_then(|f| f.stream_position().ok()) {
                    Some(pos) => clamp_cell(pos as i64),
                    None => -1,
                }
            }
            -6 => {
                let fd = self.data.pop();
                let offset = self.data.pop();
                match self
                    .files
                    .get_mut(fd)
                    .and_then(|f| f.seek(SeekFrom::Start(offset.max(0) as u64)).ok())
                {
                    Some(pos) => clamp_cell(pos as i64),
                    None => -1,
                }
            }
            -7 => {
                let fd = self.data.pop();
                match self.files.get_mut(fd).and_then(|f| f.metadata().ok()) {
                    Some(md) => clamp_cell(md.len() as i64),
                    None => -1,
                }
            }
            -8 => {
                let addr = self.data.pop();
                let name = self.image_string(addr)?;
                if std::fs::remove_file(&name).is_ok() { -1 } else { 0 }
            }
            _ => 0,
        };
        self.ports[4] = result;
        Ok(())
    }

    fn save_image(&mut self) -> Result<(), Fault> {
        if let Some(mut hook) = self.save.take() {
            let result = hook(&self.image_file, &self.image);
            self.save = Some(hook);
            result
        } else {
            image::save(&self.image_file, &self.image, CellWidth::Native)?;
            Ok(())
        }
    }

    fn file_open(&mut self) -> Result<Cell, Fault> {
        let mode = self.data.pop();
        let addr = self.data.pop();
        let name = self.image_string(addr)?;
        let mut opts = OpenOptions::new();
        match mode {
            MODE_READ => opts.read(true),
            MODE_WRITE => opts.write(true).create(true).truncate(true),
            MODE_APPEND => opts.read(true).append(true).create(true),
            MODE_READ_WRITE => opts.read(true).write(true).create(true),
            _ => return Ok(0),
        };
        Ok(match opts.open(&name) {
            Ok(f) => self.files.insert(f),
            Err(_) => 0,
        })
    }

    fn file_read(&mut self) -> Cell {
        let fd = self.data.pop();
        let mut b = [0u8; 1];
        match self.files.get_mut(fd) {
            Some(f) => match f.read(&mut b) {
                Ok(1) => Cell::from(b[0]),
                _ => 0,
            },
            None => 0,
        }
    }

    fn file_write(&mut self) -> Cell {
        let fd = self.data.pop();
        let b = self.data.pop();
        match self.files.get_mut(fd) {
            Some(f) => match f.write_all(&[b as u8]) {
                Ok(()) => 1,
                Err(_) => 0,
            },
            None => 0,
        }
    }

    fn wait_query(&mut self, v: Cell) -> Result<(), Fault> {
        let result = match v {
            -1 => clamp_cell(self.image.len() as i64),
            -5 => clamp_cell(self.data.depth() as i64),
            -6 => clamp_cell(self.address.depth() as i64),
            -8 => clamp_cell(epoch_seconds()),
            -9 => {
                // VM exit: park the PC one short of the end; the normal
                // post-WAIT increment finishes the run.
                self.pc = self.image.len().saturating_sub(1);
                0
            }
            -10 => {
                self.env_query()?;
                0
            }
            -11 => self.output.as_ref().map_or(0, |t| t.size().0),
            -12 => self.output.as_ref().map_or(0, |t| t.size().1),
            -13 => CELL_BITS as Cell,
            -14 => Cell::from(cfg!(target_endian = "big")),
            -15 => {
                if self.output.as_ref().is_some_and(|t| t.port8_enabled()) {
                    -1
                } else {
                    0
                }
            }
            -16 => clamp_cell(self.data.capacity() as i64),
            -17 => clamp_cell(self.address.capacity() as i64),
            _ => 0,
        };
        self.wait_reply(result, 5);
        Ok(())
    }

    fn env_query(&mut self) -> Result<(), Fault> {
        let name_addr = self.data.pop();
        let dest = self.data.pop();
        let name = self.image_string(name_addr)?;
        let value = std::env::var(&name).unwrap_or_default();
        let codec = self.codec.take().ok_or(Fault::MissingStringCodec)?;
        codec.encode(&mut self.image, dest, value.as_bytes());
        self.codec = Some(codec);
        Ok(())
    }

    fn wait_terminal(&mut self, v: Cell) -> Result<(), Fault> {
        let enabled = self.output.as_ref().is_some_and(|t| t.port8_enabled());
        if enabled {
            match v {
                1 => {
                    let row = self.data.pop();
                    let col = self.data.pop();
                    if let Some(t) = &mut self.output {
                        t.move_cursor(row, col)?;
                    }
                }
                2 => {
                    let fg = self.data.pop();
                    if let Some(t) = &mut self.output {
                        t.fg_color(fg)?;
                    }
                }
                3 => {
                    let bg = self.data.pop();
                    if let Some(t) = &mut self.output {
                        t.bg_color(bg)?;
                    }
                }
                _ => {}
            }
        }
        self.wait_reply(0, 8);
        Ok(())
    }

    /// Reads a string from the image through the configured codec.
    ///
    /// Fails with [`Fault::MissingStringCodec`] when no codec is set.
    pub fn image_string(&self, addr: Cell) -> Result<String, Fault> {
        let codec = self.codec.as_ref().ok_or(Fault::MissingStringCodec)?;
        let bytes = codec.decode(&self.image, addr);
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

fn clamp_cell(v: i64) -> Cell {
    Cell::try_from(v).unwrap_or(Cell::MAX)
}

fn epoch_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as i64)
}
