// Copyright 2026 the Ngaro VM Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The execution engine.
//!
//! An [`Instance`] owns the machine state ([`Machine`]: image, stacks,
//! ports, input stack, output terminal) plus the embedder-bound handler
//! tables, and drives the decode/dispatch loop over the 31 fixed opcodes.
//! Cells outside the opcode range execute as implicit calls (positive) or
//! are routed to the bound custom-opcode handler (negative).
//!
//! `run` returns when the PC moves past the end of the image (the clean
//! exit condition), when the input stack runs dry during a port-1 WAIT, or
//! on the first fault.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use std::collections::BTreeMap;

use crate::cell::{CELL_BITS, Cell, UCell};
use crate::image::CodecError;
use crate::input::InputStack;
use crate::io::{FileTable, wait_cycle};
use crate::opcode::{OPCODE_COUNT, Opcode};
use crate::stack::{DEFAULT_STACK_SIZE, ResizeError, Stack};
use crate::term::Terminal;

/// Number of I/O ports.
pub const PORT_COUNT: usize = 1024;

/// Which of the two stacks a fault refers to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StackKind {
    /// The data stack.
    Data,
    /// The address (return) stack.
    Address,
}

impl fmt::Display for StackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data => write!(f, "data stack"),
            Self::Address => write!(f, "address stack"),
        }
    }
}

/// A fatal condition raised while executing.
#[derive(Debug)]
pub enum Fault {
    /// A memory index (or branch target) fell outside the image.
    MemOutOfRange {
        /// The offending index.
        index: i64,
    },
    /// A port number fell outside the port array.
    PortOutOfRange {
        /// The offending port.
        port: i64,
    },
    /// A push on a full stack.
    Overflow {
        /// Which stack overflowed.
        stack: StackKind,
    },
    /// `/mod` with a zero divisor.
    DivideByZero,
    /// A negative code cell was executed with no opcode handler bound.
    CustomOpcode {
        /// The cell value.
        opcode: i64,
    },
    /// The input stack ran dry while port 1 requested a byte.
    ///
    /// Embedders commonly treat this as a normal exit.
    InputExhausted,
    /// A port-4 or port-5 operation needed the string codec and none is
    /// configured.
    MissingStringCodec,
    /// An image load/save failure (port-4 save, include).
    Codec(CodecError),
    /// A host I/O failure.
    Io(io::Error),
    /// A user-registered handler failed.
    Handler(Box<dyn std::error::Error + Send + Sync>),
}

impl Fault {
    /// Wraps an arbitrary error as a handler fault.
    pub fn handler(e: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Handler(e.into())
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MemOutOfRange { index } => write!(f, "memory index {index} out of range"),
            Self::PortOutOfRange { port } => write!(f, "port {port} out of range"),
            Self::Overflow { stack } => write!(f, "{stack} overflow"),
            Self::DivideByZero => write!(f, "division by zero"),
            Self::CustomOpcode { opcode } => {
                write!(f, "custom opcode {opcode} with no opcode handler bound")
            }
            Self::InputExhausted => write!(f, "end of input"),
            Self::MissingStringCodec => write!(f, "no string codec configured"),
            Self::Codec(e) => write!(f, "{e}"),
            Self::Io(e) => write!(f, "i/o failed: {e}"),
            Self::Handler(e) => write!(f, "handler failed: {e}"),
        }
    }
}

impl std::error::Error for Fault {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Codec(e) => Some(e),
            Self::Io(e) => Some(e),
            Self::Handler(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<io::Error> for Fault {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<CodecError> for Fault {
    fn from(e: CodecError) -> Self {
        Self::Codec(e)
    }
}

/// A [`Fault`] annotated with the PC and stack sizes at the time it was
/// raised.
#[derive(Debug)]
pub struct FaultInfo {
    /// PC of the faulting instruction.
    pub pc: usize,
    /// Image length in cells.
    pub image_len: usize,
    /// Data stack depth.
    pub depth: usize,
    /// Data stack capacity.
    pub data_capacity: usize,
    /// Address stack depth.
    pub rdepth: usize,
    /// Address stack capacity.
    pub address_capacity: usize,
    /// The underlying fault.
    pub fault: Fault,
}

impl FaultInfo {
    /// Returns `true` when the run ended because the input stack ran dry,
    /// which most front-ends treat as a clean exit.
    #[must_use]
    pub fn is_end_of_input(&self) -> bool {
        matches!(self.fault, Fault::InputExhausted)
    }
}

impl fmt::Display for FaultInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fault at pc={}/{}, stack {}/{}, rstack {}/{}: {}",
            self.pc,
            self.image_len,
            self.depth,
            self.data_capacity,
            self.rdepth,
            self.address_capacity,
            self.fault
        )
    }
}

impl std::error::Error for FaultInfo {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.fault)
    }
}

/// Handler invoked for `in` on a bound port. The port number has already
/// been dropped; the handler pushes the result.
pub type InHandler = Box<dyn FnMut(&mut Machine, Cell) -> Result<(), Fault>>;

/// Handler invoked for `out` on a bound port, with the written value and
/// the port number.
pub type OutHandler = Box<dyn FnMut(&mut Machine, Cell, Cell) -> Result<(), Fault>>;

/// Handler invoked during a WAIT cycle for a bound port holding a nonzero
/// value. Handlers acknowledge by calling [`Machine::wait_reply`].
pub type WaitHandler = Box<dyn FnMut(&mut Machine, Cell, Cell) -> Result<(), Fault>>;

/// Handler invoked for negative code cells. The handler is responsible for
/// advancing (or redirecting) the PC.
pub type OpcodeHandler = Box<dyn FnMut(&mut Machine, Cell) -> Result<(), Fault>>;

/// Hook for saving the memory image (port 4, command 1).
pub type SaveHook = Box<dyn FnMut(&Path, &[Cell]) -> Result<(), Fault>>;

/// A hook invoked every `granularity()` executed instructions.
pub trait Tick {
    /// Called with the quiescent machine. Errors terminate the run.
    fn tick(&mut self, m: &mut Machine) -> Result<(), Fault>;

    /// Instruction interval between ticks; rounded up to a power of two by
    /// the engine and re-read after every tick.
    fn granularity(&self) -> u64 {
        1 << 10
    }
}

/// Adapts a closure into a [`Tick`] firing every `every` instructions.
pub struct TickFn<F> {
    f: F,
    every: u64,
}

impl<F: FnMut(&mut Machine) -> Result<(), Fault>> TickFn<F> {
    /// Wraps `f`; `every` is rounded up to a power of two by the engine.
    pub fn new(f: F, every: u64) -> Self {
        Self { f, every }
    }
}

impl<F: FnMut(&mut Machine) -> Result<(), Fault>> Tick for TickFn<F> {
    fn tick(&mut self, m: &mut Machine) -> Result<(), Fault> {
        (self.f)(m)
    }

    fn granularity(&self) -> u64 {
        self.every
    }
}

const MAX_LIMITER_GRANULARITY: u64 = 1 << 20;

/// A [`Tick`] that throttles execution to a target clock frequency.
///
/// Every tick it sleeps the remainder of the configured period. The
/// granularity grows whenever the sleep interval would undershoot the
/// configured resolution, so the limiter converges on few, long sleeps
/// while preserving the average frequency.
pub struct ClockLimiter {
    period: Duration,
    resolution: Duration,
    every: u64,
    last: Option<Instant>,
}

impl ClockLimiter {
    /// Creates a limiter targeting `freq_khz` thousand instructions per
    /// second, sleeping no shorter than `resolution` at a time.
    #[must_use]
    pub fn new(freq_khz: u64, resolution: Duration) -> Self {
        let period = Duration::from_nanos(1_000_000 / freq_khz.max(1));
        let per_sleep = if period.is_zero() {
            MAX_LIMITER_GRANULARITY
        } else {
            (resolution.as_nanos() / period.as_nanos().max(1)) as u64
        };
        Self {
            period,
            resolution,
            every: per_sleep.clamp(1, MAX_LIMITER_GRANULARITY).next_power_of_two(),
            last: None,
        }
    }
}

impl Tick for ClockLimiter {
    fn tick(&mut self, _m: &mut Machine) -> Result<(), Fault> {
        let now = Instant::now();
        if let Some(last) = self.last {
            let target = self.period * self.every as u32;
            let remainder = target.saturating_sub(now - last);
            if !remainder.is_zero() {
                std::thread::sleep(remainder);
            }
            if remainder < self.resolution && self.every < MAX_LIMITER_GRANULARITY {
                self.every *= 2;
            }
        }
        self.last = Some(Instant::now());
        Ok(())
    }

    fn granularity(&self) -> u64 {
        self.every
    }
}

/// The machine state: image, stacks, ports, input stack and output
/// terminal.
///
/// Handlers receive `&mut Machine`, so everything here is reachable from
/// embedder callbacks; the handler tables themselves live on [`Instance`].
pub struct Machine {
    pub(crate) pc: usize,
    pub(crate) image: Vec<Cell>,
    pub(crate) file_cells: usize,
    pub(crate) image_file: PathBuf,
    pub(crate) data: Stack,
    pub(crate) address: Stack,
    pub(crate) ports: Vec<Cell>,
    pub(crate) input: InputStack,
    pub(crate) output: Option<Box<dyn Terminal>>,
    pub(crate) codec: Option<Box<dyn crate::image::StringCodec>>,
    pub(crate) save: Option<SaveHook>,
    pub(crate) files: FileTable,
    pub(crate) ins_count: u64,
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("pc", &self.pc)
            .field("image_len", &self.image.len())
            .field("depth", &self.data.depth())
            .field("rdepth", &self.address.depth())
            .field("ins_count", &self.ins_count)
            .finish_non_exhaustive()
    }
}

impl Machine {
    fn new(image: Vec<Cell>, image_file: PathBuf) -> Self {
        let file_cells = image.len();
        Self {
            pc: 0,
            image,
            file_cells,
            image_file,
            data: Stack::new(DEFAULT_STACK_SIZE),
            address: Stack::new(DEFAULT_STACK_SIZE),
            ports: vec![0; PORT_COUNT],
            input: InputStack::new(),
            output: None,
            codec: None,
            save: None,
            files: FileTable::new(),
            ins_count: 0,
        }
    }

    /// Current program counter.
    #[must_use]
    pub fn pc(&self) -> usize {
        self.pc
    }

    /// Sets the program counter. Setting it to the image length (or past
    /// it) makes the run loop exit cleanly.
    pub fn set_pc(&mut self, pc: usize) {
        self.pc = pc;
    }

    /// The memory image.
    #[must_use]
    pub fn image(&self) -> &[Cell] {
        &self.image
    }

    /// Mutable access to the memory image.
    pub fn image_mut(&mut self) -> &mut [Cell] {
        &mut self.image
    }

    /// Number of cells loaded from the image file, as remembered for
    /// dumps. Defaults to the full image length.
    #[must_use]
    pub fn file_cells(&self) -> usize {
        self.file_cells
    }

    /// Records the number of cells that came from the image file.
    pub fn set_file_cells(&mut self, cells: usize) {
        self.file_cells = cells.min(self.image.len());
    }

    /// The filename used by the default port-4 image save.
    #[must_use]
    pub fn image_file(&self) -> &Path {
        &self.image_file
    }

    /// The port array.
    #[must_use]
    pub fn ports(&self) -> &[Cell] {
        &self.ports
    }

    /// Mutable access to the port array.
    pub fn ports_mut(&mut self) -> &mut [Cell] {
        &mut self.ports
    }

    /// Live data stack, bottom to top.
    #[must_use]
    pub fn data(&self) -> &[Cell] {
        self.data.as_slice()
    }

    /// Live address stack, bottom to top.
    #[must_use]
    pub fn address(&self) -> &[Cell] {
        self.address.as_slice()
    }

    /// Data stack depth.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.data.depth()
    }

    /// Address stack depth.
    #[must_use]
    pub fn rdepth(&self) -> usize {
        self.address.depth()
    }

    /// Top of the data stack (0 when empty).
    #[must_use]
    pub fn tos(&self) -> Cell {
        self.data.tos()
    }

    /// Next on the data stack (0 when fewer than two cells are live).
    #[must_use]
    pub fn nos(&self) -> Cell {
        self.data.nos()
    }

    /// Pushes on the data stack.
    pub fn push(&mut self, v: Cell) -> Result<(), Fault> {
        self.data.push(v).map_err(|_| Fault::Overflow {
            stack: StackKind::Data,
        })
    }

    /// Pops the data stack (0 when empty).
    pub fn pop(&mut self) -> Cell {
        self.data.pop()
    }

    /// Pushes on the address stack.
    pub fn rpush(&mut self, v: Cell) -> Result<(), Fault> {
        self.address.push(v).map_err(|_| Fault::Overflow {
            stack: StackKind::Address,
        })
    }

    /// Pops the address stack (0 when empty).
    pub fn rpop(&mut self) -> Cell {
        self.address.pop()
    }

    /// Instructions executed since the current `run` started.
    #[must_use]
    pub fn instruction_count(&self) -> u64 {
        self.ins_count
    }

    /// Pushes a new input source; it becomes the current one.
    pub fn push_input(&mut self, r: impl io::Read + 'static) {
        self.input.push(r);
    }

    /// Flushes the output terminal, if any.
    pub fn flush_output(&mut self) -> io::Result<()> {
        match &mut self.output {
            Some(t) => t.flush(),
            None => Ok(()),
        }
    }

    /// Completes a WAIT: stores `v` on `port` and sets port 0 to 1.
    pub fn wait_reply(&mut self, v: Cell, port: Cell) {
        if let Ok(idx) = usize::try_from(port)
            && idx < self.ports.len()
        {
            self.ports[idx] = v;
            self.ports[0] = 1;
        }
    }

    /// The default `in` behavior: pushes the port value and zeroes the
    /// port. Custom in-handlers can delegate here.
    pub fn port_in(&mut self, port: Cell) -> Result<(), Fault> {
        let v = self.port_read(port)?;
        self.push(v)
    }

    pub(crate) fn port_read(&mut self, port: Cell) -> Result<Cell, Fault> {
        let idx = self.port_index(port)?;
        let v = self.ports[idx];
        self.ports[idx] = 0;
        Ok(v)
    }

    /// The default `out` behavior: stores the value; port 3 flushes the
    /// output. Custom out-handlers can delegate here.
    pub fn port_write(&mut self, v: Cell, port: Cell) -> Result<(), Fault> {
        let idx = self.port_index(port)?;
        self.ports[idx] = v;
        if idx == 3 {
            self.flush_output()?;
        }
        Ok(())
    }

    fn port_index(&self, port: Cell) -> Result<usize, Fault> {
        usize::try_from(port)
            .ok()
            .filter(|&p| p < self.ports.len())
            .ok_or(Fault::PortOutOfRange { port: port as i64 })
    }

    fn arg(&self) -> Result<Cell, Fault> {
        self.image
            .get(self.pc + 1)
            .copied()
            .ok_or(Fault::MemOutOfRange {
                index: (self.pc + 1) as i64,
            })
    }

    fn set_pc_cell(&mut self, target: Cell) -> Result<(), Fault> {
        self.pc = usize::try_from(target).map_err(|_| Fault::MemOutOfRange {
            index: target as i64,
        })?;
        Ok(())
    }

    fn branch(&mut self) -> Result<(), Fault> {
        let target = self.arg()?;
        self.set_pc_cell(target)
    }

    fn cond_branch(&mut self, rel: impl Fn(Cell, Cell) -> bool) -> Result<(), Fault> {
        if rel(self.data.nos(), self.data.tos()) {
            self.branch()?;
        } else {
            self.pc += 2;
        }
        self.data.drop2();
        Ok(())
    }

    fn binop(&mut self, f: impl Fn(Cell, Cell) -> Cell) {
        let rhs = self.data.pop();
        let lhs = self.data.tos();
        self.data.set_tos(f(lhs, rhs));
        self.pc += 1;
    }

    fn mem_read(&self, addr: Cell) -> Result<Cell, Fault> {
        usize::try_from(addr)
            .ok()
            .and_then(|i| self.image.get(i).copied())
            .ok_or(Fault::MemOutOfRange {
                index: addr as i64,
            })
    }

    fn mem_write(&mut self, addr: Cell, v: Cell) -> Result<(), Fault> {
        let slot = usize::try_from(addr)
            .ok()
            .and_then(|i| self.image.get_mut(i))
            .ok_or(Fault::MemOutOfRange {
                index: addr as i64,
            })?;
        *slot = v;
        Ok(())
    }

    pub(crate) fn fault_info(&self, fault: Fault) -> FaultInfo {
        FaultInfo {
            pc: self.pc,
            image_len: self.image.len(),
            depth: self.data.depth(),
            data_capacity: self.data.capacity(),
            rdepth: self.address.depth(),
            address_capacity: self.address.capacity(),
            fault,
        }
    }
}

pub(crate) struct Handlers {
    pub(crate) input: BTreeMap<Cell, InHandler>,
    pub(crate) output: BTreeMap<Cell, OutHandler>,
    pub(crate) wait: BTreeMap<Cell, WaitHandler>,
    pub(crate) opcode: Option<OpcodeHandler>,
    tick: Option<Box<dyn Tick>>,
}

/// An Ngaro virtual machine instance.
///
/// Created over a cell buffer (usually from [`crate::image::load`]),
/// configured through the `set_*`/`bind_*` methods, then driven with
/// [`Instance::run`]. The instance owns the buffer for its lifetime;
/// [`Instance::into_image`] hands it back for saving.
pub struct Instance {
    m: Machine,
    h: Handlers,
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance").field("machine", &self.m).finish()
    }
}

impl Instance {
    /// Creates an instance over `image`. `image_file` is the filename used
    /// by the default port-4 image save.
    pub fn new(image: Vec<Cell>, image_file: impl Into<PathBuf>) -> Self {
        Self {
            m: Machine::new(image, image_file.into()),
            h: Handlers {
                input: BTreeMap::new(),
                output: BTreeMap::new(),
                wait: BTreeMap::new(),
                opcode: None,
                tick: None,
            },
        }
    }

    /// The machine state.
    #[must_use]
    pub fn machine(&self) -> &Machine {
        &self.m
    }

    /// Mutable machine state.
    pub fn machine_mut(&mut self) -> &mut Machine {
        &mut self.m
    }

    /// Resizes the data stack. Shrinking below the live depth is rejected
    /// with no state change.
    pub fn set_data_size(&mut self, cells: usize) -> Result<(), ResizeError> {
        self.m.data.resize(cells)
    }

    /// Resizes the address stack. Shrinking below the live depth is
    /// rejected with no state change.
    pub fn set_address_size(&mut self, cells: usize) -> Result<(), ResizeError> {
        self.m.address.resize(cells)
    }

    /// Pushes an input source (see [`InputStack`]).
    pub fn push_input(&mut self, r: impl io::Read + 'static) {
        self.m.input.push(r);
    }

    /// Sets the output terminal.
    pub fn set_output(&mut self, t: impl Terminal + 'static) {
        self.m.output = Some(Box::new(t));
    }

    /// Sets the string codec used by the port-4 and port-5 protocols.
    pub fn set_string_codec(&mut self, codec: impl crate::image::StringCodec + 'static) {
        self.m.codec = Some(Box::new(codec));
    }

    /// Sets the hook used by port-4 command 1 to save the image.
    pub fn set_save_hook(
        &mut self,
        hook: impl FnMut(&Path, &[Cell]) -> Result<(), Fault> + 'static,
    ) {
        self.m.save = Some(Box::new(hook));
    }

    /// Binds an `in` handler for `port`, replacing any previous one.
    pub fn bind_in_handler(
        &mut self,
        port: Cell,
        f: impl FnMut(&mut Machine, Cell) -> Result<(), Fault> + 'static,
    ) {
        self.h.input.insert(port, Box::new(f));
    }

    /// Binds an `out` handler for `port`, replacing any previous one.
    pub fn bind_out_handler(
        &mut self,
        port: Cell,
        f: impl FnMut(&mut Machine, Cell, Cell) -> Result<(), Fault> + 'static,
    ) {
        self.h.output.insert(port, Box::new(f));
    }

    /// Binds a WAIT handler for `port`, replacing the default behavior on
    /// the standard ports or extending the cycle to a custom port.
    pub fn bind_wait_handler(
        &mut self,
        port: Cell,
        f: impl FnMut(&mut Machine, Cell, Cell) -> Result<(), Fault> + 'static,
    ) {
        self.h.wait.insert(port, Box::new(f));
    }

    /// Binds the handler for negative code cells. The handler must advance
    /// the PC.
    pub fn bind_opcode_handler(
        &mut self,
        f: impl FnMut(&mut Machine, Cell) -> Result<(), Fault> + 'static,
    ) {
        self.h.opcode = Some(Box::new(f));
    }

    /// Installs the tick hook (see [`Tick`]).
    pub fn set_tick(&mut self, t: impl Tick + 'static) {
        self.h.tick = Some(Box::new(t));
    }

    /// Resets the PC, the stacks and the ports so the instance can be run
    /// again. Bound handlers, inputs and the image are kept.
    pub fn reset(&mut self) {
        self.m.pc = 0;
        self.m.data.clear();
        self.m.address.clear();
        self.m.ports.fill(0);
    }

    /// Tears the instance down and returns the image buffer, e.g. for
    /// saving.
    #[must_use]
    pub fn into_image(self) -> Vec<Cell> {
        self.m.image
    }

    /// Runs until clean exit, end of input, or a fault.
    ///
    /// On `Ok(())` the PC is at (or past) the image length. On error the
    /// PC points at the faulting instruction.
    pub fn run(&mut self) -> Result<(), FaultInfo> {
        self.m.ins_count = 0;
        let mut tick_mask = self.h.tick.as_ref().map(|t| pow2_mask(t.granularity()));

        while self.m.pc < self.m.image.len() {
            if let Err(fault) = self.step() {
                return Err(self.m.fault_info(fault));
            }
            self.m.ins_count += 1;
            if let Some(mask) = tick_mask
                && self.m.ins_count & mask == 0
                && let Some(t) = &mut self.h.tick
            {
                if let Err(fault) = t.tick(&mut self.m) {
                    return Err(self.m.fault_info(fault));
                }
                tick_mask = Some(pow2_mask(t.granularity()));
            }
        }
        Ok(())
    }

    fn step(&mut self) -> Result<(), Fault> {
        let m = &mut self.m;
        let h = &mut self.h;
        let op = m.image[m.pc];
        match Opcode::from_cell(op) {
            Some(Opcode::Nop) => m.pc += 1,
            Some(Opcode::Lit) => {
                let v = m.arg()?;
                m.push(v)?;
                m.pc += 2;
            }
            Some(Opcode::Dup) => {
                let v = m.data.tos();
                m.push(v)?;
                m.pc += 1;
            }
            Some(Opcode::Drop) => {
                m.data.drop_top();
                m.pc += 1;
            }
            Some(Opcode::Swap) => {
                m.data.swap();
                m.pc += 1;
            }
            Some(Opcode::Push) => {
                let v = m.data.pop();
                m.rpush(v)?;
                m.pc += 1;
            }
            Some(Opcode::Pop) => {
                let v = m.address.pop();
                m.push(v)?;
                m.pc += 1;
            }
            Some(Opcode::Loop) => {
                let v = m.data.tos().wrapping_sub(1);
                if v > 0 {
                    m.data.set_tos(v);
                    m.branch()?;
                } else {
                    m.data.drop_top();
                    m.pc += 2;
                }
            }
            Some(Opcode::Jump) => m.branch()?,
            Some(Opcode::Return) => {
                let r = m.address.pop();
                m.set_pc_cell(r.wrapping_add(1))?;
            }
            Some(Opcode::GtJump) => m.cond_branch(|nos, tos| nos > tos)?,
            Some(Opcode::LtJump) => m.cond_branch(|nos, tos| nos < tos)?,
            Some(Opcode::NeJump) => m.cond_branch(|nos, tos| nos != tos)?,
            Some(Opcode::EqJump) => m.cond_branch(|nos, tos| nos == tos)?,
            Some(Opcode::Fetch) => {
                let v = m.mem_read(m.data.tos())?;
                m.data.set_tos(v);
                m.pc += 1;
            }
            Some(Opcode::Store) => {
                let addr = m.data.tos();
                let v = m.data.nos();
                m.mem_write(addr, v)?;
                m.data.drop2();
                m.pc += 1;
            }
            Some(Opcode::Add) => m.binop(Cell::wrapping_add),
            Some(Opcode::Sub) => m.binop(Cell::wrapping_sub),
            Some(Opcode::Mul) => m.binop(Cell::wrapping_mul),
            Some(Opcode::DivMod) => {
                let divisor = m.data.tos();
                if divisor == 0 {
                    return Err(Fault::DivideByZero);
                }
                let dividend = m.data.nos();
                m.data.set_nos(dividend.wrapping_rem(divisor));
                m.data.set_tos(dividend.wrapping_div(divisor));
                m.pc += 1;
            }
            Some(Opcode::And) => m.binop(|a, b| a & b),
            Some(Opcode::Or) => m.binop(|a, b| a | b),
            Some(Opcode::Xor) => m.binop(|a, b| a ^ b),
            Some(Opcode::Shl) => m.binop(|v, n| {
                let sh = (n as UCell & 0xff) as u32;
                if sh >= CELL_BITS { 0 } else { v << sh }
            }),
            Some(Opcode::Shr) => m.binop(|v, n| {
                let sh = (n as UCell & 0xff) as u32;
                if sh >= CELL_BITS {
                    if v < 0 { -1 } else { 0 }
                } else {
                    v >> sh
                }
            }),
            Some(Opcode::ZeroExit) => {
                if m.data.tos() == 0 {
                    let r = m.address.pop();
                    m.data.drop_top();
                    m.set_pc_cell(r.wrapping_add(1))?;
                } else {
                    m.pc += 1;
                }
            }
            Some(Opcode::Inc) => {
                m.data.set_tos(m.data.tos().wrapping_add(1));
                m.pc += 1;
            }
            Some(Opcode::Dec) => {
                m.data.set_tos(m.data.tos().wrapping_sub(1));
                m.pc += 1;
            }
            Some(Opcode::In) => {
                let port = m.data.tos();
                match h.input.get_mut(&port) {
                    Some(f) => {
                        m.data.drop_top();
                        f(m, port)?;
                    }
                    None => {
                        let v = m.port_read(port)?;
                        m.data.set_tos(v);
                    }
                }
                m.pc += 1;
            }
            Some(Opcode::Out) => {
                let v = m.data.nos();
                let port = m.data.tos();
                m.data.drop2();
                match h.output.get_mut(&port) {
                    Some(f) => f(m, v, port)?,
                    None => m.port_write(v, port)?,
                }
                m.pc += 1;
            }
            Some(Opcode::Wait) => {
                wait_cycle(m, h)?;
                m.pc += 1;
            }
            None if op >= OPCODE_COUNT => {
                m.rpush(m.pc as Cell)?;
                let mut pc = op as usize;
                // Skip the nop run at the call target; only the call itself
                // shows up in the instruction count.
                while pc < m.image.len() && m.image[pc] == 0 {
                    pc += 1;
                }
                m.pc = pc;
            }
            None => match h.opcode.as_mut() {
                Some(f) => f(m, op)?,
                None => return Err(Fault::CustomOpcode { opcode: op as i64 }),
            },
        }
        Ok(())
    }
}

fn pow2_mask(granularity: u64) -> u64 {
    granularity.max(1).next_power_of_two() - 1
}
