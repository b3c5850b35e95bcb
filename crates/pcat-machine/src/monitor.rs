//! Read-only views of a running machine for other threads.
//!
//! The processor itself is owned by the machine thread. Observers get copies: a
//! [`CpuSnapshot`] pushed through a channel after every run slice, and atomic counters
//! that can be sampled at any time.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;

use pcat_cpu_core::{Cpu, Gpr, Seg};

/// Register file and run state at a slice boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuSnapshot {
    pub regs: [u32; 8],
    pub eip: u32,
    pub eflags: u32,
    /// Selectors in ES, CS, SS, DS, FS, GS order.
    pub sregs: [u16; 6],
    pub cr0: u32,
    pub cpl: u8,
    pub protected_mode: bool,
    pub halted: bool,
    pub shutdown: bool,
    pub instructions: u64,
    pub cycles: u64,
}

impl CpuSnapshot {
    pub fn capture(cpu: &Cpu) -> Self {
        let mut regs = [0; 8];
        for (slot, reg) in regs.iter_mut().zip(Gpr::ALL) {
            *slot = cpu.gpr(reg);
        }
        let mut sregs = [0; 6];
        for (slot, seg) in sregs.iter_mut().zip(Seg::ALL) {
            *slot = cpu.sreg(seg).selector.0;
        }
        Self {
            regs,
            eip: cpu.eip(),
            eflags: cpu.flags().bits(),
            sregs,
            cr0: cpu.cr0().bits(),
            cpl: cpu.cpl(),
            protected_mode: cpu.protected_mode(),
            halted: cpu.is_halted(),
            shutdown: cpu.is_shutdown(),
            instructions: cpu.instructions(),
            cycles: cpu.cycles(),
        }
    }

    pub fn gpr(&self, reg: Gpr) -> u32 {
        self.regs[reg as usize]
    }

    pub fn sreg(&self, seg: Seg) -> u16 {
        self.sregs[seg.index()]
    }
}

/// Counters updated by the machine thread after each slice.
#[derive(Debug, Default)]
pub struct RunCounters {
    instructions: AtomicU64,
    cycles: AtomicU64,
    slices: AtomicU64,
    running: AtomicBool,
}

impl RunCounters {
    pub(crate) fn record(&self, instructions: u64, cycles: u64) {
        self.instructions.fetch_add(instructions, Ordering::Relaxed);
        self.cycles.fetch_add(cycles, Ordering::Relaxed);
        self.slices.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Relaxed);
    }

    pub fn instructions(&self) -> u64 {
        self.instructions.load(Ordering::Relaxed)
    }

    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub fn slices(&self) -> u64 {
        self.slices.load(Ordering::Relaxed)
    }

    /// True while a run slice is executing.
    pub fn running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

/// The observer's end, handed out by [`crate::Machine::monitor`].
#[derive(Debug)]
pub struct MachineMonitor {
    pub(crate) snapshots: Receiver<CpuSnapshot>,
    pub(crate) counters: Arc<RunCounters>,
}

impl MachineMonitor {
    /// The newest snapshot published since the last call, if any. Older ones are
    /// discarded.
    pub fn latest(&self) -> Option<CpuSnapshot> {
        let mut latest = None;
        loop {
            match self.snapshots.try_recv() {
                Ok(snap) => latest = Some(snap),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => return latest,
            }
        }
    }

    /// Blocks until the machine publishes the next snapshot. `None` once the machine is
    /// gone.
    pub fn wait(&self) -> Option<CpuSnapshot> {
        self.snapshots.recv().ok()
    }

    pub fn counters(&self) -> &RunCounters {
        &self.counters
    }
}
