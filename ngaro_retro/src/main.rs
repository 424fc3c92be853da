// Copyright 2026 the Ngaro VM Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The `retro` command: a thin front-end around [`ngaro_vm`].
//!
//! Loads a memory image, wires buffered stdin/stdout to the VM, runs it,
//! and optionally dumps the machine state for the external test harness.

mod dump;

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;

use ngaro_vm::cell::CELL_BITS;
use ngaro_vm::image::{self, CellWidth, ZeroTerminated};
use ngaro_vm::term::Vt100Terminal;
use ngaro_vm::vm::{ClockLimiter, Fault, Instance};

fn parse_bits(s: &str) -> Result<u32, String> {
    match s {
        "32" => Ok(32),
        "64" => Ok(64),
        _ => Err(format!("{s} bits cells are not supported")),
    }
}

#[derive(Parser, Debug)]
#[command(name = "retro", about = "Ngaro virtual machine for Retro Forth images")]
struct Args {
    /// Memory image to load.
    #[arg(long, value_name = "FILE", default_value = "retroImage")]
    image: PathBuf,

    /// Filename to use when saving the memory image (defaults to the
    /// loaded image).
    #[arg(short = 'o', long = "output", value_name = "FILE")]
    output: Option<PathBuf>,

    /// Runtime memory image size in cells.
    #[arg(long, value_name = "N", default_value_t = 100_000)]
    size: usize,

    /// Cell size in bits of the loaded memory image.
    #[arg(long, value_name = "BITS", value_parser = parse_bits, default_value_t = CELL_BITS)]
    ibits: u32,

    /// Cell size in bits of the saved memory image.
    #[arg(long, value_name = "BITS", value_parser = parse_bits, default_value_t = CELL_BITS)]
    obits: u32,

    /// Append FILE to the input stack (repeatable; files are read in the
    /// order given, before stdin).
    #[arg(long = "with", value_name = "FILE")]
    with: Vec<PathBuf>,

    /// When saving, keep the full image instead of shrinking to HERE.
    #[arg(long)]
    noshrink: bool,

    /// Disable raw terminal I/O. Accepted for compatibility; this build
    /// always uses buffered line I/O.
    #[arg(long)]
    noraw: bool,

    /// Dump stacks and the loaded image prefix to stdout on exit.
    #[arg(long)]
    dump: bool,

    /// Print PC and stack diagnostics on error.
    #[arg(long)]
    debug: bool,

    /// Clock frequency throttling in KHz (0 disables throttling).
    #[arg(long, value_name = "KHZ", default_value_t = 0)]
    clkfreq: u64,

    /// Minimum sleep interval in milliseconds when throttling.
    #[arg(long, value_name = "MS", default_value_t = 16)]
    clkslp: u64,

    /// Print instruction count and MIPS on exit.
    #[arg(long)]
    stats: bool,
}

fn main() -> ExitCode {
    match run(Args::parse()) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("\n{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<ExitCode> {
    let in_width = CellWidth::from_bits(args.ibits).unwrap_or(CellWidth::Native);
    let out_width = CellWidth::from_bits(args.obits).unwrap_or(CellWidth::Native);

    let (mem, file_cells) = image::load(&args.image, args.size, in_width)
        .with_context(|| format!("load {} failed", args.image.display()))?;

    let save_name = args.output.clone().unwrap_or_else(|| args.image.clone());
    let mut vm = Instance::new(mem, save_name);
    vm.machine_mut().set_file_cells(file_cells);
    vm.set_output(Vt100Terminal::new(BufWriter::new(io::stdout())));
    vm.set_string_codec(ZeroTerminated);

    let shrink = !args.noshrink;
    vm.set_save_hook(move |path, mem| {
        let mut cells = mem;
        if shrink && mem.len() > 3 {
            // Retro keeps HERE in cell 3; an implausible value disables
            // shrinking for this save.
            if let Ok(here) = usize::try_from(mem[3])
                && here <= mem.len()
            {
                cells = &mem[..here];
            }
        }
        image::save(path, cells, out_width).map_err(Fault::Codec)
    });

    if args.clkfreq > 0 {
        vm.set_tick(ClockLimiter::new(
            args.clkfreq,
            Duration::from_millis(args.clkslp),
        ));
    }

    // Stdin sits at the bottom of the input stack; the -with files go on
    // top in reverse so they are consumed in command-line order.
    vm.push_input(io::stdin());
    for path in args.with.iter().rev() {
        let f = File::open(path).with_context(|| format!("open {} failed", path.display()))?;
        vm.push_input(BufReader::new(f));
    }

    let start = Instant::now();
    let result = vm.run();
    let elapsed = start.elapsed();
    let _ = vm.machine_mut().flush_output();

    let mut clean = true;
    match result {
        Ok(()) => {}
        Err(e) if e.is_end_of_input() => {}
        Err(e) => {
            clean = false;
            eprintln!("\n{e}");
            if args.debug {
                let m = vm.machine();
                if m.pc() < m.image().len() {
                    eprintln!(
                        "PC: {} ({}), Stack: {:?}, Addr: {:?}",
                        m.pc(),
                        m.image()[m.pc()],
                        m.data(),
                        m.address()
                    );
                } else {
                    eprintln!(
                        "PC: {}, Stack: {:?}, Addr: {:?}",
                        m.pc(),
                        m.data(),
                        m.address()
                    );
                }
            }
        }
    }

    if args.stats {
        let count = vm.machine().instruction_count();
        let mips = count as f64 / elapsed.as_secs_f64().max(f64::EPSILON) / 1e6;
        eprintln!("Executed {count} instructions in {elapsed:?} ({mips:.3} MIPS).");
    }

    if args.dump && clean {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        dump::dump_machine(vm.machine(), &mut out)?;
        out.flush()?;
    }

    Ok(if clean {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
