//! Per-opcode execution timings for the 80286 and 80386.
//!
//! Figures are the processor manuals' clock counts for the instruction itself, excluding
//! the "+m" refill term for control transfers: the prefetch queue model charges that.

mod i286;
mod i386;

use crate::CpuModel;

/// Timing record of one opcode (or one member of an opcode group).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct CycleEntry {
    /// Register-operand (or operand-less) form.
    pub base: u16,
    /// Memory-operand form.
    pub mem: u16,
    /// REP-prefixed string instruction: overhead charged once per repeat, also when the
    /// count register starts at zero.
    pub rep: u16,
    /// REP-prefixed string instruction: cost of each iteration.
    pub rep_iter: u16,
    /// Extra cycles when executed in protected mode.
    pub pmode: u16,
    /// Conditional branch not taken.
    pub noj: u16,
    /// Bus unit adjustment: positive values are internal cycles during which the bus is
    /// free for prefetching, negative values are cycles the bus stays busy.
    pub bu: i8,
}

impl CycleEntry {
    pub const NULL: CycleEntry = CycleEntry {
        base: 0,
        mem: 0,
        rep: 0,
        rep_iter: 0,
        pmode: 0,
        noj: 0,
        bu: 0,
    };

    pub const fn new(base: u16, mem: u16) -> CycleEntry {
        CycleEntry {
            base,
            mem,
            ..CycleEntry::NULL
        }
    }

    pub const fn pm(self, pmode: u16) -> CycleEntry {
        CycleEntry { pmode, ..self }
    }

    pub const fn nj(self, noj: u16) -> CycleEntry {
        CycleEntry { noj, ..self }
    }

    pub const fn rp(self, rep: u16, rep_iter: u16) -> CycleEntry {
        CycleEntry {
            rep,
            rep_iter,
            ..self
        }
    }

    pub const fn bu(self, bu: i8) -> CycleEntry {
        CycleEntry { bu, ..self }
    }

    pub const fn is_null(&self) -> bool {
        self.base == 0
            && self.mem == 0
            && self.rep == 0
            && self.rep_iter == 0
            && self.pmode == 0
            && self.noj == 0
            && self.bu == 0
    }
}

/// Shorthand used by the timing tables.
pub(crate) const fn c(base: u16, mem: u16) -> CycleEntry {
    CycleEntry::new(base, mem)
}

pub const GROUP_COUNT: usize = 16;

/// Group number of opcodes whose operation is selected by ModRM.reg.
pub const fn group_of(opcode: u16) -> Option<usize> {
    match opcode {
        0x80 | 0x82 => Some(0),
        0x81 => Some(1),
        0x83 => Some(2),
        0xC0 => Some(3),
        0xC1 => Some(4),
        0xD0 => Some(5),
        0xD1 => Some(6),
        0xD2 => Some(7),
        0xD3 => Some(8),
        0xF6 => Some(9),
        0xF7 => Some(10),
        0xFE => Some(11),
        0xFF => Some(12),
        0x0F00 => Some(13),
        0x0F01 => Some(14),
        0x0FBA => Some(15),
        _ => None,
    }
}

/// All timings of one processor generation. Every lookup is a direct array index.
pub struct CycleTable {
    pub primary: [CycleEntry; 256],
    pub extended: [CycleEntry; 256],
    pub groups: [[CycleEntry; 8]; GROUP_COUNT],
}

impl CycleTable {
    pub fn for_model(model: CpuModel) -> &'static CycleTable {
        match model {
            CpuModel::I80286 => &i286::TABLE,
            CpuModel::I80386 => &i386::TABLE,
        }
    }

    /// Timing of `opcode` (`0x0F00 | b` for two-byte opcodes); `reg` selects the group
    /// member and is ignored otherwise.
    pub fn lookup(&self, opcode: u16, reg: u8) -> CycleEntry {
        if let Some(group) = group_of(opcode) {
            return self.groups[group][usize::from(reg & 7)];
        }
        let idx = usize::from(opcode & 0xFF);
        if opcode & 0xFF00 == 0x0F00 {
            self.extended[idx]
        } else {
            self.primary[idx]
        }
    }
}

/// Expands `(first, last, entry)` ranges into a full 256-entry table.
pub(crate) const fn expand(ranges: &[(u8, u8, CycleEntry)]) -> [CycleEntry; 256] {
    let mut table = [CycleEntry::NULL; 256];
    let mut i = 0;
    while i < ranges.len() {
        let (first, last, entry) = ranges[i];
        let mut op = first as usize;
        while op <= last as usize {
            table[op] = entry;
            op += 1;
        }
        i += 1;
    }
    table
}
