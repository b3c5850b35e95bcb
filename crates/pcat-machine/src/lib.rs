#![forbid(unsafe_code)]

//! A PC/AT class machine: one 80286 or 80386 core, its physical address space and the
//! I/O port space, driven one slice at a time from the thread that owns it.
//!
//! Other threads observe the machine through a [`MachineMonitor`] and never touch the
//! processor directly.

mod board;
mod debugcon;
mod monitor;
mod state;

use std::sync::mpsc::{self, Sender};
use std::sync::Arc;

use pcat_cpu_core::{Cpu, CpuConfig, CpuExit, CpuModel, StateError};
use pcat_mem::{IoPorts, Memory, MemoryError, PortHandler};
use pcat_snapshot::SnapshotError;
use thiserror::Error;

use board::Board;
pub use board::SYSTEM_CONTROL_A;
pub use debugcon::{DebugCon, DebugConLog, DEBUGCON_PORT};
pub use monitor::{CpuSnapshot, MachineMonitor, RunCounters};
pub use state::MEMORY_SECTION;

/// Physical address of the first instruction after RESET.
pub const RESET_ADDRESS: u32 = 0xF_FFF0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineConfig {
    pub ram_size: usize,
    pub cpu: CpuConfig,
    /// State of the A20 line at power-on and after reset.
    pub a20_enabled: bool,
    /// Attach the port 0x92 A20/reset control.
    pub enable_a20_gate: bool,
    /// Attach the debug console at port 0xE9.
    pub enable_debugcon: bool,
    pub ram_wait_states: u32,
    /// `CS:IP` to start from. When set, reset plants a far jump at the reset address so
    /// an image can run without firmware.
    pub reset_vector: Option<(u16, u16)>,
}

impl MachineConfig {
    /// An AT-class machine with 1 MiB of RAM (286) or 4 MiB (386), one wait state and
    /// A20 enabled.
    pub fn pc_at(model: CpuModel) -> Self {
        let ram_size = match model {
            CpuModel::I80286 => 0x10_0000,
            CpuModel::I80386 => 0x40_0000,
        };
        Self {
            ram_size,
            cpu: CpuConfig::new(model),
            a20_enabled: true,
            enable_a20_gate: true,
            enable_debugcon: true,
            ram_wait_states: 1,
            reset_vector: None,
        }
    }

    pub fn model(&self) -> CpuModel {
        self.cpu.model
    }

    pub fn validate(&self) -> Result<(), MachineError> {
        let addr_bits = self.model().addr_bits();
        if self.ram_size == 0 || self.ram_size as u64 > 1u64 << addr_bits {
            return Err(MachineError::InvalidRamSize {
                size: self.ram_size,
                addr_bits,
            });
        }
        if self.reset_vector.is_some() && self.ram_size < (RESET_ADDRESS + 5) as usize {
            return Err(MachineError::ResetVectorOutsideRam {
                ram_size: self.ram_size,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum MachineError {
    #[error("{size} bytes of RAM do not fit a {addr_bits}-bit physical address space")]
    InvalidRamSize { size: usize, addr_bits: u8 },

    #[error("a reset vector needs RAM up to 1 MiB, only {ram_size} bytes are configured")]
    ResetVectorOutsideRam { ram_size: usize },

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error("CPU state: {0}")]
    CpuState(#[from] StateError),

    #[error("saved state has {saved} bytes of RAM, this machine has {current}")]
    RamSizeMismatch { saved: u64, current: u64 },

    #[error("corrupt machine state: {0}")]
    Corrupt(&'static str),
}

/// Why a run slice returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// The instruction or cycle budget was used up.
    Completed { executed: u64, cycles: u64 },
    /// HLT with nothing pending that could wake the processor.
    Halted { executed: u64, cycles: u64 },
    /// The guest pulsed the reset line; call [`Machine::reset`] to honour it.
    ResetRequested { executed: u64, cycles: u64 },
    /// Triple fault. Only a reset recovers.
    Shutdown { executed: u64, cycles: u64 },
}

impl RunExit {
    /// Instructions retired in the slice.
    pub fn executed(&self) -> u64 {
        match *self {
            RunExit::Completed { executed, .. }
            | RunExit::Halted { executed, .. }
            | RunExit::ResetRequested { executed, .. }
            | RunExit::Shutdown { executed, .. } => executed,
        }
    }

    pub fn cycles(&self) -> u64 {
        match *self {
            RunExit::Completed { cycles, .. }
            | RunExit::Halted { cycles, .. }
            | RunExit::ResetRequested { cycles, .. }
            | RunExit::Shutdown { cycles, .. } => cycles,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Budget {
    Instructions(u64),
    Cycles(u64),
}

impl Budget {
    fn spent(self, executed: u64, cycles: u64) -> bool {
        match self {
            Budget::Instructions(max) => executed >= max,
            Budget::Cycles(max) => cycles >= max,
        }
    }
}

pub struct Machine {
    cfg: MachineConfig,
    cpu: Cpu,
    board: Board,
    debugcon: DebugConLog,
    counters: Arc<RunCounters>,
    snapshots: Option<Sender<CpuSnapshot>>,
}

impl Machine {
    pub fn new(cfg: MachineConfig) -> Result<Self, MachineError> {
        cfg.validate()?;
        let mut mem = Memory::new(cfg.ram_size, cfg.model().addr_bits());
        mem.set_ram_wait_states(cfg.ram_wait_states);
        mem.set_a20(cfg.a20_enabled);

        let mut io = IoPorts::new();
        let debugcon = DebugConLog::default();
        if cfg.enable_debugcon {
            io.register(DEBUGCON_PORT, 1, Box::new(DebugCon::new(debugcon.clone())))?;
        }

        let cpu = Cpu::new(cfg.cpu.clone());
        tracing::debug!(
            model = %cfg.model(),
            ram = cfg.ram_size,
            a20 = cfg.a20_enabled,
            "machine created"
        );
        let mut machine = Self {
            board: Board::new(mem, io, cfg.enable_a20_gate),
            cfg,
            cpu,
            debugcon,
            counters: Arc::default(),
            snapshots: None,
        };
        machine.plant_reset_vector();
        Ok(machine)
    }

    /// Processor and device RESET. RAM contents survive.
    pub fn reset(&mut self) {
        self.cpu.reset();
        self.board.io.reset();
        self.board.mem.set_a20(self.cfg.a20_enabled);
        self.board.take_reset_request();
        self.plant_reset_vector();
        tracing::debug!("machine reset");
    }

    fn plant_reset_vector(&mut self) {
        let Some((cs, ip)) = self.cfg.reset_vector else {
            return;
        };
        let [ip_lo, ip_hi] = ip.to_le_bytes();
        let [cs_lo, cs_hi] = cs.to_le_bytes();
        let start = RESET_ADDRESS as usize;
        if let Some(slot) = self.board.mem.ram_mut().get_mut(start..start + 5) {
            slot.copy_from_slice(&[0xEA, ip_lo, ip_hi, cs_lo, cs_hi]);
        }
    }

    pub fn config(&self) -> &MachineConfig {
        &self.cfg
    }

    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut Cpu {
        &mut self.cpu
    }

    pub fn memory(&self) -> &Memory {
        &self.board.mem
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.board.mem
    }

    /// Copies an image into RAM.
    pub fn load_image(&mut self, addr: u32, image: &[u8]) -> Result<(), MachineError> {
        self.board.mem.load(addr, image)?;
        tracing::debug!(addr = format_args!("{addr:#x}"), len = image.len(), "image loaded");
        Ok(())
    }

    pub fn map_rom(&mut self, start: u32, data: Vec<u8>, wait_states: u32) -> Result<(), MachineError> {
        Ok(self.board.mem.map_rom(start, data, wait_states)?)
    }

    pub fn register_port(&mut self, start: u16, len: u16, handler: Box<dyn PortHandler>) -> Result<(), MachineError> {
        Ok(self.board.io.register(start, len, handler)?)
    }

    /// Queues a maskable interrupt vector, as an interrupt controller would.
    pub fn raise_interrupt(&mut self, vector: u8) {
        self.cpu.raise_interrupt(vector);
    }

    pub fn raise_nmi(&mut self) {
        self.cpu.raise_nmi();
    }

    /// Drains the bytes the guest wrote to the debug console.
    pub fn take_debugcon_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut *self.debugcon.borrow_mut())
    }

    /// Hands out an observer for other threads. A previous monitor stops receiving
    /// snapshots.
    pub fn monitor(&mut self) -> MachineMonitor {
        let (tx, rx) = mpsc::channel();
        self.snapshots = Some(tx);
        MachineMonitor {
            snapshots: rx,
            counters: Arc::clone(&self.counters),
        }
    }

    pub fn run_instructions(&mut self, max_insts: u64) -> RunExit {
        self.run(Budget::Instructions(max_insts))
    }

    pub fn run_cycles(&mut self, max_cycles: u64) -> RunExit {
        self.run(Budget::Cycles(max_cycles))
    }

    fn run(&mut self, budget: Budget) -> RunExit {
        self.counters.set_running(true);
        let start = self.cpu.instructions();
        let mut cycles = 0u64;
        let exit = loop {
            let executed = self.cpu.instructions() - start;
            if budget.spent(executed, cycles) {
                break RunExit::Completed { executed, cycles };
            }
            match self.cpu.step(&mut self.board) {
                Ok(clocks) => cycles += u64::from(clocks),
                Err(CpuExit::Shutdown) => {
                    let executed = self.cpu.instructions() - start;
                    break RunExit::Shutdown { executed, cycles };
                }
            }
            if self.board.take_reset_request() {
                let executed = self.cpu.instructions() - start;
                break RunExit::ResetRequested { executed, cycles };
            }
            if self.cpu.is_halted() && !self.cpu.has_pending_interrupt() {
                let executed = self.cpu.instructions() - start;
                break RunExit::Halted { executed, cycles };
            }
        };
        self.counters.record(exit.executed(), exit.cycles());
        self.counters.set_running(false);
        self.publish();
        exit
    }

    fn publish(&mut self) {
        let Some(tx) = &self.snapshots else {
            return;
        };
        if tx.send(CpuSnapshot::capture(&self.cpu)).is_err() {
            tracing::debug!("machine monitor dropped");
            self.snapshots = None;
        }
    }
}
