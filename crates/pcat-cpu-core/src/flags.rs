use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Eflags: u32 {
        const CF = 1 << 0;
        const RESERVED1 = 1 << 1;
        const PF = 1 << 2;
        const AF = 1 << 4;
        const ZF = 1 << 6;
        const SF = 1 << 7;
        const TF = 1 << 8;
        const IF = 1 << 9;
        const DF = 1 << 10;
        const OF = 1 << 11;
        const IOPL = 3 << 12;
        const NT = 1 << 14;
        const RF = 1 << 16;
        const VM = 1 << 17;
    }
}

impl Eflags {
    /// Arithmetic status flags.
    pub const STATUS: Eflags = Eflags::CF
        .union(Eflags::PF)
        .union(Eflags::AF)
        .union(Eflags::ZF)
        .union(Eflags::SF)
        .union(Eflags::OF);

    pub fn iopl(self) -> u8 {
        ((self.bits() >> 12) & 3) as u8
    }

    pub fn set_iopl(&mut self, iopl: u8) {
        *self = Eflags::from_bits_retain((self.bits() & !Eflags::IOPL.bits()) | (u32::from(iopl & 3) << 12));
    }
}

impl Default for Eflags {
    fn default() -> Self {
        Eflags::RESERVED1
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Cr0: u32 {
        const PE = 1 << 0;
        const MP = 1 << 1;
        const EM = 1 << 2;
        const TS = 1 << 3;
        const ET = 1 << 4;
        const PG = 1 << 31;
    }
}

impl Cr0 {
    /// The machine status word (low 16 bits) as seen by LMSW/SMSW.
    pub const MSW: Cr0 = Cr0::PE.union(Cr0::MP).union(Cr0::EM).union(Cr0::TS);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iopl_round_trips() {
        let mut f = Eflags::default() | Eflags::IF;
        f.set_iopl(3);
        assert_eq!(f.iopl(), 3);
        assert!(f.contains(Eflags::IF));
        f.set_iopl(1);
        assert_eq!(f.bits() & Eflags::IOPL.bits(), 1 << 12);
    }
}
