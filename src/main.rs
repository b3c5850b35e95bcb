#![forbid(unsafe_code)]

use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use pcat_cpu_core::{CpuModel, Gpr, Seg};
use pcat_machine::{CpuSnapshot, Machine, MachineConfig, RunExit};
use tracing_subscriber::EnvFilter;

const SLICE_INST_BUDGET: u64 = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Model {
    #[value(name = "286")]
    I286,
    #[value(name = "386")]
    I386,
}

impl From<Model> for CpuModel {
    fn from(model: Model) -> Self {
        match model {
            Model::I286 => CpuModel::I80286,
            Model::I386 => CpuModel::I80386,
        }
    }
}

#[derive(Debug, Parser)]
#[command(about = "Runs a raw real-mode image on an emulated 80286/80386 PC/AT")]
struct Args {
    /// Raw image copied into guest RAM.
    #[arg(long)]
    image: Option<PathBuf>,

    /// Physical address the image is loaded at and started from (below 1 MiB).
    #[arg(long, default_value = "0x7c00", value_parser = parse_addr)]
    load_addr: u32,

    #[arg(long, value_enum, default_value_t = Model::I386)]
    model: Model,

    /// Guest RAM size in MiB. Defaults to 1 for the 286 and 4 for the 386.
    #[arg(long)]
    ram: Option<usize>,

    /// Stop after executing at most N instructions.
    #[arg(long, default_value_t = 1_000_000)]
    max_insts: u64,

    /// Disable the prefetch queue model; instructions are fetched straight from memory.
    #[arg(long)]
    no_prefetch: bool,

    /// Restore machine state from this file before running.
    #[arg(long)]
    load_state: Option<PathBuf>,

    /// Save machine state to this file on exit.
    #[arg(long)]
    save_state: Option<PathBuf>,
}

fn parse_addr(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid address {s:?}: {e}"))
}

/// Real-mode `CS:IP` for a physical address below 1 MiB, preferring CS = 0.
fn start_vector(addr: u32) -> Result<(u16, u16)> {
    if addr >= 0x10_0000 {
        bail!("load address {addr:#x} is not reachable from real mode");
    }
    Ok(match u16::try_from(addr) {
        Ok(ip) => (0, ip),
        Err(_) => ((addr >> 4) as u16, (addr & 0xF) as u16),
    })
}

fn machine_config(args: &Args) -> Result<MachineConfig> {
    let mut cfg = MachineConfig::pc_at(args.model.into());
    if let Some(mib) = args.ram {
        cfg.ram_size = mib.checked_mul(1024 * 1024).context("RAM size overflow")?;
    }
    cfg.cpu.prefetch = !args.no_prefetch;
    cfg.reset_vector = Some(start_vector(args.load_addr)?);
    Ok(cfg)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let cfg = machine_config(&args)?;
    let mut machine = Machine::new(cfg).context("failed to create machine")?;

    if let Some(path) = &args.image {
        let image = std::fs::read(path).with_context(|| format!("failed to read image: {}", path.display()))?;
        machine
            .load_image(args.load_addr, &image)
            .with_context(|| format!("failed to load {} at {:#x}", path.display(), args.load_addr))?;
        tracing::info!(image = %path.display(), len = image.len(), load_addr = args.load_addr, "image loaded");
    }
    if let Some(path) = &args.load_state {
        machine
            .restore_state_file(path)
            .with_context(|| format!("failed to restore state from {}", path.display()))?;
        tracing::info!(state = %path.display(), "machine state restored");
    }

    let mut stdout = io::stdout().lock();
    let mut total_executed = 0u64;
    while total_executed < args.max_insts {
        let budget = (args.max_insts - total_executed).min(SLICE_INST_BUDGET);
        let exit = machine.run_instructions(budget);
        total_executed = total_executed.saturating_add(exit.executed());
        stdout.write_all(&machine.take_debugcon_output())?;

        match exit {
            RunExit::Completed { .. } => {}
            RunExit::Halted { .. } => {
                eprintln!("guest halted after {total_executed} instructions");
                break;
            }
            RunExit::ResetRequested { .. } => {
                eprintln!("guest requested reset (continuing)");
                machine.reset();
            }
            RunExit::Shutdown { .. } => {
                eprintln!("processor shut down after {total_executed} instructions");
                break;
            }
        }
    }
    stdout.flush()?;

    dump_registers(&CpuSnapshot::capture(machine.cpu()), machine.config().model());

    if let Some(path) = &args.save_state {
        machine
            .save_state_file(path)
            .with_context(|| format!("failed to save state to {}", path.display()))?;
    }
    Ok(())
}

fn dump_registers(snap: &CpuSnapshot, model: CpuModel) {
    const NAMES: [&str; 8] = ["AX", "CX", "DX", "BX", "SP", "BP", "SI", "DI"];
    let wide = model == CpuModel::I80386;
    let mut line = String::new();
    for (name, reg) in NAMES.iter().zip(Gpr::ALL) {
        let val = snap.gpr(reg);
        if wide {
            line.push_str(&format!("E{name}={val:08x} "));
        } else {
            line.push_str(&format!("{name}={:04x} ", val & 0xFFFF));
        }
    }
    eprintln!("{}", line.trim_end());

    let segs: Vec<String> = Seg::ALL
        .iter()
        .filter(|&&seg| wide || !matches!(seg, Seg::Fs | Seg::Gs))
        .map(|&seg| format!("{}={:04x}", seg.name(), snap.sreg(seg)))
        .collect();
    eprintln!(
        "{} EIP={:08x} EFLAGS={:08x} CR0={:08x} CPL={}",
        segs.join(" "),
        snap.eip,
        snap.eflags,
        snap.cr0,
        snap.cpl
    );
    eprintln!(
        "instructions={} cycles={} mode={}{}",
        snap.instructions,
        snap.cycles,
        if snap.protected_mode { "protected" } else { "real" },
        if snap.halted { " halted" } else if snap.shutdown { " shutdown" } else { "" }
    );
}
