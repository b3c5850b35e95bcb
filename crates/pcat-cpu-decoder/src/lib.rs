//! Instruction decoding and cycle timing tables for the 80286 and 80386.
#![forbid(unsafe_code)]

pub mod cycles;
mod decoder;
mod instruction;

use std::fmt;
use std::str::FromStr;

pub use cycles::{CycleEntry, CycleTable};
pub use decoder::{ByteSource, CycleKey, Decoder, SliceSource};
pub use instruction::{
    AluForm, AluOp, BitOp, Cond, Count, Instruction, LoopKind, ModRm, Op, RepPrefix, Seg,
    ShiftOp, Sib, StringOp, Sz,
};

/// Processor generation being emulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum CpuModel {
    #[default]
    I80286,
    I80386,
}

impl CpuModel {
    /// Longest legal instruction, prefixes included.
    pub const fn max_instr_size(self) -> u8 {
        match self {
            CpuModel::I80286 => 10,
            CpuModel::I80386 => 15,
        }
    }

    /// Prefetch queue capacity in bytes.
    pub const fn pq_size(self) -> usize {
        match self {
            CpuModel::I80286 => 6,
            CpuModel::I80386 => 16,
        }
    }

    /// Physical address lines.
    pub const fn addr_bits(self) -> u8 {
        match self {
            CpuModel::I80286 => 24,
            CpuModel::I80386 => 32,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            CpuModel::I80286 => "80286",
            CpuModel::I80386 => "80386",
        }
    }
}

impl fmt::Display for CpuModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CpuModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "286" | "80286" | "i286" => Ok(CpuModel::I80286),
            "386" | "80386" | "i386" => Ok(CpuModel::I80386),
            other => Err(format!("unknown CPU model `{other}` (expected 286 or 386)")),
        }
    }
}
