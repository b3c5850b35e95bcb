//! Physical address space and I/O port space of a PC/AT class machine.
//!
//! The CPU core only sees the [`MemoryBus`] and [`IoBus`] traits; [`Memory`] and
//! [`IoPorts`] are the concrete implementations used by the machine.
#![forbid(unsafe_code)]

mod bus;
mod io;
mod memory;

pub use bus::{IoBus, MemoryBus, NoIo};
pub use io::{IoPorts, PortHandler};
pub use memory::{Memory, MemoryError, MmioHandler, RegionKind};

/// Value observed on reads from addresses no device drives.
pub const OPEN_BUS: u8 = 0xFF;
