//! Selectors and the cached form of GDT/LDT/IDT entries.

use pcat_cpu_decoder::CpuModel;

/// A segment selector: table index, table indicator and requested privilege level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Selector(pub u16);

impl Selector {
    pub const fn index(self) -> u16 {
        self.0 >> 3
    }

    /// Selects the LDT instead of the GDT.
    pub const fn is_local(self) -> bool {
        self.0 & 4 != 0
    }

    pub const fn rpl(self) -> u8 {
        (self.0 & 3) as u8
    }

    /// Index 0 of the GDT, whatever the RPL.
    pub const fn is_null(self) -> bool {
        self.0 & 0xFFFC == 0
    }

    /// Byte offset of the entry within its table.
    pub const fn table_offset(self) -> u32 {
        (self.0 & 0xFFF8) as u32
    }

    /// The selector as it appears in fault error codes.
    pub const fn error_code(self) -> u16 {
        self.0 & 0xFFFC
    }

    pub const fn with_rpl(self, rpl: u8) -> Selector {
        Selector((self.0 & 0xFFFC) | (rpl as u16 & 3))
    }
}

pub const ACC_ACCESSED: u8 = 1 << 0;
/// Readable for code segments, writable for data segments.
pub const ACC_RW: u8 = 1 << 1;
/// Conforming for code segments, expand-down for data segments.
pub const ACC_DC: u8 = 1 << 2;
pub const ACC_CODE: u8 = 1 << 3;
/// Code/data segment (as opposed to a system descriptor).
pub const ACC_SEGMENT: u8 = 1 << 4;
pub const ACC_PRESENT: u8 = 1 << 7;

pub const FLAG_AVL: u8 = 1 << 0;
pub const FLAG_BIG: u8 = 1 << 2;
pub const FLAG_GRANULAR: u8 = 1 << 3;

/// Types of system descriptors (access byte with S clear).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SystemType {
    Tss16 = 0x1,
    Ldt = 0x2,
    Tss16Busy = 0x3,
    CallGate16 = 0x4,
    TaskGate = 0x5,
    IntGate16 = 0x6,
    TrapGate16 = 0x7,
    Tss32 = 0x9,
    Tss32Busy = 0xB,
    CallGate32 = 0xC,
    IntGate32 = 0xE,
    TrapGate32 = 0xF,
}

impl SystemType {
    /// Decodes a system type nibble. The 286 only knows the 16-bit types.
    pub const fn from_type(typ: u8, model: CpuModel) -> Option<SystemType> {
        let t = match typ & 0xF {
            0x1 => SystemType::Tss16,
            0x2 => SystemType::Ldt,
            0x3 => SystemType::Tss16Busy,
            0x4 => SystemType::CallGate16,
            0x5 => SystemType::TaskGate,
            0x6 => SystemType::IntGate16,
            0x7 => SystemType::TrapGate16,
            0x9 => SystemType::Tss32,
            0xB => SystemType::Tss32Busy,
            0xC => SystemType::CallGate32,
            0xE => SystemType::IntGate32,
            0xF => SystemType::TrapGate32,
            _ => return None,
        };
        if matches!(model, CpuModel::I80286) && (t as u8) >= 8 {
            return None;
        }
        Some(t)
    }

    pub const fn is_tss(self) -> bool {
        matches!(
            self,
            SystemType::Tss16 | SystemType::Tss16Busy | SystemType::Tss32 | SystemType::Tss32Busy
        )
    }

    pub const fn is_available_tss(self) -> bool {
        matches!(self, SystemType::Tss16 | SystemType::Tss32)
    }

    pub const fn is_busy_tss(self) -> bool {
        matches!(self, SystemType::Tss16Busy | SystemType::Tss32Busy)
    }

    pub const fn is_call_gate(self) -> bool {
        matches!(self, SystemType::CallGate16 | SystemType::CallGate32)
    }

    /// 386 types: 32-bit gate frames and the 386 TSS layout.
    pub const fn is_32bit(self) -> bool {
        (self as u8) & 8 != 0
    }
}

/// Cached interpretation of a descriptor table entry.
///
/// `limit` is the effective byte limit (granularity already applied). A descriptor with
/// `valid == false` must not be used for memory accesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Descriptor {
    pub base: u32,
    pub limit: u32,
    pub access: u8,
    /// High nibble of byte 6 (G, D/B, AVL); always zero on the 286.
    pub flags: u8,
    pub valid: bool,
}

impl Descriptor {
    pub const fn new(base: u32, limit: u32, access: u8, flags: u8) -> Self {
        Descriptor {
            base,
            limit,
            access,
            flags,
            valid: true,
        }
    }

    /// Parses the 8 raw bytes of a table entry. The 286 ignores the last word.
    pub fn parse(raw: u64, model: CpuModel) -> Self {
        let limit_lo = (raw & 0xFFFF) as u32;
        let base_lo = ((raw >> 16) & 0xFF_FFFF) as u32;
        let access = (raw >> 40) as u8;
        match model {
            CpuModel::I80286 => Descriptor::new(base_lo, limit_lo, access, 0),
            CpuModel::I80386 => {
                let limit_hi = ((raw >> 48) & 0xF) as u32;
                let flags = ((raw >> 52) & 0xF) as u8;
                let base_hi = ((raw >> 56) & 0xFF) as u32;
                let mut limit = limit_lo | (limit_hi << 16);
                if flags & FLAG_GRANULAR != 0 {
                    limit = (limit << 12) | 0xFFF;
                }
                Descriptor::new(base_lo | (base_hi << 24), limit, access, flags)
            }
        }
    }

    /// Encodes back into table form. Limits above 1 MiB are stored page-granular.
    pub fn to_raw(&self) -> u64 {
        let mut flags = self.flags;
        let mut limit = self.limit;
        if flags & FLAG_GRANULAR != 0 || limit > 0xF_FFFF {
            flags |= FLAG_GRANULAR;
            limit >>= 12;
        }
        u64::from(limit & 0xFFFF)
            | (u64::from(self.base & 0xFF_FFFF) << 16)
            | (u64::from(self.access) << 40)
            | (u64::from((limit >> 16) & 0xF) << 48)
            | (u64::from(flags & 0xF) << 52)
            | (u64::from(self.base >> 24) << 56)
    }

    /// Segment cache contents after a real-mode load.
    pub const fn real_mode(selector: u16) -> Self {
        Descriptor::new(
            (selector as u32) << 4,
            0xFFFF,
            ACC_PRESENT | ACC_SEGMENT | ACC_RW | ACC_ACCESSED,
            0,
        )
    }

    /// Segment cache contents after a load in virtual-8086 mode.
    pub const fn v86(selector: u16) -> Self {
        Descriptor::new(
            (selector as u32) << 4,
            0xFFFF,
            ACC_PRESENT | (3 << 5) | ACC_SEGMENT | ACC_RW | ACC_ACCESSED,
            0,
        )
    }

    pub const fn present(&self) -> bool {
        self.access & ACC_PRESENT != 0
    }

    pub const fn dpl(&self) -> u8 {
        (self.access >> 5) & 3
    }

    pub const fn is_segment(&self) -> bool {
        self.access & ACC_SEGMENT != 0
    }

    pub const fn is_system(&self) -> bool {
        !self.is_segment()
    }

    pub const fn is_code(&self) -> bool {
        self.is_segment() && self.access & ACC_CODE != 0
    }

    pub const fn is_data(&self) -> bool {
        self.is_segment() && self.access & ACC_CODE == 0
    }

    pub const fn conforming(&self) -> bool {
        self.is_code() && self.access & ACC_DC != 0
    }

    pub const fn readable(&self) -> bool {
        self.is_data() || (self.is_code() && self.access & ACC_RW != 0)
    }

    pub const fn writable(&self) -> bool {
        self.is_data() && self.access & ACC_RW != 0
    }

    pub const fn expand_down(&self) -> bool {
        self.is_data() && self.access & ACC_DC != 0
    }

    /// D/B bit: 32-bit default operand size for code, 32-bit stack pointer and 4 GiB
    /// expand-down bound for data.
    pub const fn big(&self) -> bool {
        self.flags & FLAG_BIG != 0
    }

    /// Highest offset of an expand-down segment.
    pub const fn upper_bound(&self) -> u32 {
        if self.big() {
            0xFFFF_FFFF
        } else {
            0xFFFF
        }
    }

    pub fn system_type(&self, model: CpuModel) -> Option<SystemType> {
        if self.is_segment() {
            None
        } else {
            SystemType::from_type(self.access & 0xF, model)
        }
    }
}

/// A call, interrupt, trap or task gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gate {
    pub kind: SystemType,
    /// Target code segment, or the TSS selector of a task gate.
    pub selector: Selector,
    pub offset: u32,
    /// Words (dwords for 386 gates) copied by an inner-privilege call gate.
    pub params: u8,
    pub dpl: u8,
    pub present: bool,
}

impl Gate {
    pub fn parse(raw: u64, model: CpuModel) -> Option<Gate> {
        let access = (raw >> 40) as u8;
        if access & ACC_SEGMENT != 0 {
            return None;
        }
        let kind = SystemType::from_type(access & 0xF, model)?;
        if kind.is_tss() || kind == SystemType::Ldt {
            return None;
        }
        let mut offset = (raw & 0xFFFF) as u32;
        if kind.is_32bit() {
            offset |= ((raw >> 48) as u32) << 16;
        }
        Some(Gate {
            kind,
            selector: Selector((raw >> 16) as u16),
            offset,
            params: ((raw >> 32) & 0x1F) as u8,
            dpl: (access >> 5) & 3,
            present: access & ACC_PRESENT != 0,
        })
    }

    pub fn to_raw(&self) -> u64 {
        let access = (u8::from(self.present) << 7) | ((self.dpl & 3) << 5) | self.kind as u8;
        u64::from(self.offset & 0xFFFF)
            | (u64::from(self.selector.0) << 16)
            | (u64::from(self.params & 0x1F) << 32)
            | (u64::from(access) << 40)
            | (u64::from(self.offset >> 16) << 48)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_fields() {
        let sel = Selector(0x002F);
        assert_eq!(sel.index(), 5);
        assert!(sel.is_local());
        assert_eq!(sel.rpl(), 3);
        assert_eq!(sel.error_code(), 0x002C);
        assert!(Selector(3).is_null());
        assert!(!Selector(4).is_null());
    }

    #[test]
    fn parse_and_encode_agree() {
        let cases = [
            Descriptor::new(0x0012_3456, 0xFFFF, 0x93, 0),
            Descriptor::new(0x8000_0000, 0xFFFF_FFFF, 0x9B, FLAG_BIG | FLAG_GRANULAR),
            Descriptor::new(0x0000_1000, 0x6_7FFF, 0xF3, FLAG_AVL),
            Descriptor::new(0x0001_0000, 0x67, 0x89, 0),
        ];
        for d in cases {
            let back = Descriptor::parse(d.to_raw(), CpuModel::I80386);
            assert_eq!(back.base, d.base);
            assert_eq!(back.limit, d.limit);
            assert_eq!(back.access, d.access);
            assert_eq!(back.dpl(), d.dpl());
            assert_eq!(back.present(), d.present());
            assert_eq!(back.big(), d.big());
        }
    }

    #[test]
    fn the_286_ignores_the_high_word() {
        let raw = Descriptor::new(0xFF12_3456, 0xF_FFFF, 0x93, FLAG_BIG).to_raw();
        let d = Descriptor::parse(raw, CpuModel::I80286);
        assert_eq!(d.base, 0x12_3456);
        assert_eq!(d.limit, 0xFFFF);
        assert!(!d.big());
    }

    #[test]
    fn type_predicates() {
        let code_xo = Descriptor::new(0, 0xFFFF, 0x98, 0);
        assert!(code_xo.is_code() && !code_xo.readable() && !code_xo.writable());
        let conforming = Descriptor::new(0, 0xFFFF, 0x9E, 0);
        assert!(conforming.conforming() && conforming.readable());
        let stack = Descriptor::new(0, 0x0FFF, 0x97, 0);
        assert!(stack.expand_down() && stack.writable());
        assert_eq!(stack.upper_bound(), 0xFFFF);
        let tss = Descriptor::new(0, 0x67, 0x8B, 0);
        assert_eq!(
            tss.system_type(CpuModel::I80386),
            Some(SystemType::Tss32Busy)
        );
        assert_eq!(tss.system_type(CpuModel::I80286), None);
    }

    #[test]
    fn gates_round_trip() {
        let gate = Gate {
            kind: SystemType::IntGate32,
            selector: Selector(0x08),
            offset: 0x1234_5678,
            params: 0,
            dpl: 3,
            present: true,
        };
        assert_eq!(Gate::parse(gate.to_raw(), CpuModel::I80386), Some(gate));

        let call = Gate {
            kind: SystemType::CallGate16,
            selector: Selector(0x10),
            offset: 0x0100,
            params: 2,
            dpl: 0,
            present: true,
        };
        assert_eq!(Gate::parse(call.to_raw(), CpuModel::I80286), Some(call));
        assert_eq!(Gate::parse(Descriptor::new(0, 0xFFFF, 0x93, 0).to_raw(), CpuModel::I80286), None);
    }
}
