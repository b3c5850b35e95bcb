#![forbid(unsafe_code)]

//! 80286/80386 processor core: the prefetching bus unit, segmentation and paging, the
//! interpreter, interrupt delivery and hardware task switching.
//!
//! The core owns no memory. Every step borrows the machine's buses through
//! [`SystemBus`], so a single [`Cpu`] can be driven by any memory/I/O model.

mod bus_unit;
mod config;
mod cpu;
mod descriptor;
mod exec;
mod fault;
mod flags;
mod interrupts;
mod memory;
mod paging;
mod segment;
mod state;
mod step;
mod task;
mod traps;

pub use bus_unit::{BusUnit, PQ_CAPACITY};
pub use config::{ControlTimings, CpuConfig};
pub use cpu::{Cpu, Gpr, SegReg, TableReg};
pub use descriptor::{
    Descriptor, Gate, Selector, SystemType, ACC_ACCESSED, ACC_CODE, ACC_DC, ACC_PRESENT, ACC_RW,
    ACC_SEGMENT, FLAG_AVL, FLAG_BIG, FLAG_GRANULAR,
};
pub use fault::{CpuException, CpuFault, Exception};
pub use flags::{Cr0, Eflags};
pub use paging::{AccessKind, Mmu, PageFault};
pub use state::{StateError, BUS_SECTION, CORE_SECTION};
pub use step::CpuExit;
pub use traps::{InFlight, MemoryAccess, MemoryTrapFn, TrapEvent, TrapFn, Traps};

pub use pcat_cpu_decoder::{CpuModel, CycleEntry, CycleKey, Instruction, Seg};

use pcat_mem::{IoBus, MemoryBus};

/// Everything the processor reaches outside the chip: physical memory and I/O ports.
pub trait SystemBus: MemoryBus + IoBus {}

impl<T: MemoryBus + IoBus + ?Sized> SystemBus for T {}
