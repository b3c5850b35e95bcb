use pcat_cpu_decoder::{AluForm, AluOp, Count, Instruction, ShiftOp};

use crate::cpu::{Cpu, Width};
use crate::fault::Fallible;
use crate::flags::Eflags;
use crate::SystemBus;

use super::operand::width;

pub(crate) fn parity(byte: u8) -> bool {
    byte.count_ones() % 2 == 0
}

/// Sets ZF, SF and PF from `result`.
pub(crate) fn set_szp(flags: &mut Eflags, result: u32, w: Width) {
    let result = result & w.mask();
    flags.set(Eflags::ZF, result == 0);
    flags.set(Eflags::SF, result & w.sign_bit() != 0);
    flags.set(Eflags::PF, parity(result as u8));
}

pub(crate) fn add_with_flags(flags: &mut Eflags, dest: u32, src: u32, carry_in: bool, w: Width) -> u32 {
    let mask = w.mask();
    let dest = dest & mask;
    let src = src & mask;
    let full = u64::from(dest) + u64::from(src) + u64::from(carry_in);
    let result = full as u32 & mask;

    let sb = w.sign_bit();
    flags.set(Eflags::CF, full > u64::from(mask));
    flags.set(Eflags::OF, (dest ^ result) & (src ^ result) & sb != 0);
    flags.set(Eflags::AF, (dest ^ src ^ result) & 0x10 != 0);
    set_szp(flags, result, w);
    result
}

pub(crate) fn sub_with_flags(flags: &mut Eflags, dest: u32, src: u32, borrow_in: bool, w: Width) -> u32 {
    let mask = w.mask();
    let dest = dest & mask;
    let src = src & mask;
    let subtrahend = u64::from(src) + u64::from(borrow_in);
    let result = u64::from(dest).wrapping_sub(subtrahend) as u32 & mask;

    let sb = w.sign_bit();
    flags.set(Eflags::CF, u64::from(dest) < subtrahend);
    flags.set(Eflags::OF, (dest ^ src) & (dest ^ result) & sb != 0);
    flags.set(Eflags::AF, (dest ^ src ^ result) & 0x10 != 0);
    set_szp(flags, result, w);
    result
}

pub(crate) fn logic_with_flags(flags: &mut Eflags, result: u32, w: Width) -> u32 {
    let result = result & w.mask();
    flags.remove(Eflags::CF | Eflags::OF | Eflags::AF);
    set_szp(flags, result, w);
    result
}

/// Two-operand ALU operation. Returns `None` for CMP, which only sets flags.
pub(crate) fn alu(flags: &mut Eflags, op: AluOp, dest: u32, src: u32, w: Width) -> Option<u32> {
    let cf = flags.contains(Eflags::CF);
    let result = match op {
        AluOp::Add => add_with_flags(flags, dest, src, false, w),
        AluOp::Adc => add_with_flags(flags, dest, src, cf, w),
        AluOp::Sub => sub_with_flags(flags, dest, src, false, w),
        AluOp::Sbb => sub_with_flags(flags, dest, src, cf, w),
        AluOp::Cmp => {
            sub_with_flags(flags, dest, src, false, w);
            return None;
        }
        AluOp::And => logic_with_flags(flags, dest & src, w),
        AluOp::Or => logic_with_flags(flags, dest | src, w),
        AluOp::Xor => logic_with_flags(flags, dest ^ src, w),
    };
    Some(result)
}

/// Shift or rotate by an already masked, non-zero count.
pub(crate) fn shift(flags: &mut Eflags, op: ShiftOp, val: u32, count: u32, w: Width) -> u32 {
    let bits = w.bits();
    let mask = w.mask();
    let sb = w.sign_bit();
    let val = val & mask;
    let cf_in = flags.contains(Eflags::CF);
    match op {
        ShiftOp::Rol => {
            let n = count % bits;
            let r = if n == 0 { val } else { ((val << n) | (val >> (bits - n))) & mask };
            let cf = r & 1 != 0;
            flags.set(Eflags::CF, cf);
            flags.set(Eflags::OF, (r & sb != 0) != cf);
            r
        }
        ShiftOp::Ror => {
            let n = count % bits;
            let r = if n == 0 { val } else { ((val >> n) | (val << (bits - n))) & mask };
            flags.set(Eflags::CF, r & sb != 0);
            flags.set(Eflags::OF, ((r ^ (r << 1)) & sb) != 0);
            r
        }
        ShiftOp::Rcl => {
            let n = count % (bits + 1);
            let wide = u64::from(val) | (u64::from(cf_in) << bits);
            let total = bits + 1;
            let rot = if n == 0 {
                wide
            } else {
                ((wide << n) | (wide >> (total - n))) & ((1u64 << total) - 1)
            };
            let r = rot as u32 & mask;
            let cf = (rot >> bits) & 1 != 0;
            flags.set(Eflags::CF, cf);
            flags.set(Eflags::OF, (r & sb != 0) != cf);
            r
        }
        ShiftOp::Rcr => {
            let n = count % (bits + 1);
            let wide = u64::from(val) | (u64::from(cf_in) << bits);
            let total = bits + 1;
            let rot = if n == 0 {
                wide
            } else {
                ((wide >> n) | (wide << (total - n))) & ((1u64 << total) - 1)
            };
            let r = rot as u32 & mask;
            flags.set(Eflags::CF, (rot >> bits) & 1 != 0);
            flags.set(Eflags::OF, ((r ^ (r << 1)) & sb) != 0);
            r
        }
        ShiftOp::Shl | ShiftOp::Sal => {
            let wide = u64::from(val) << count;
            let r = wide as u32 & mask;
            let cf = (wide >> bits) & 1 != 0;
            flags.set(Eflags::CF, cf);
            flags.set(Eflags::OF, (r & sb != 0) != cf);
            flags.remove(Eflags::AF);
            set_szp(flags, r, w);
            r
        }
        ShiftOp::Shr => {
            let r = (u64::from(val) >> count) as u32;
            let cf = count <= bits && (val >> (count - 1)) & 1 != 0;
            flags.set(Eflags::CF, cf);
            flags.set(Eflags::OF, val & sb != 0);
            flags.remove(Eflags::AF);
            set_szp(flags, r, w);
            r
        }
        ShiftOp::Sar => {
            let signed = i64::from(w.sign_extend(val) as i32);
            let n = count.min(bits);
            let r = (signed >> n) as u32 & mask;
            flags.set(Eflags::CF, (signed >> (n - 1)) & 1 != 0);
            flags.remove(Eflags::OF | Eflags::AF);
            set_szp(flags, r, w);
            r
        }
    }
}

/// SHLD/SHRD of `dest` with bits from `src`, by a masked, non-zero count.
pub(crate) fn double_shift(flags: &mut Eflags, left: bool, dest: u32, src: u32, count: u32, w: Width) -> u32 {
    let bits = w.bits();
    let mask = w.mask();
    let (dest, src) = (dest & mask, src & mask);
    let (r, cf) = if left {
        let wide = (u64::from(dest) << bits) | u64::from(src);
        let shifted = wide << count;
        (
            (shifted >> bits) as u32 & mask,
            (shifted >> (2 * bits)) & 1 != 0,
        )
    } else {
        let wide = (u64::from(src) << bits) | u64::from(dest);
        ((wide >> count) as u32 & mask, (wide >> (count - 1)) & 1 != 0)
    };
    flags.set(Eflags::CF, cf);
    flags.set(Eflags::OF, ((r ^ dest) & w.sign_bit()) != 0);
    set_szp(flags, r, w);
    r
}

impl Cpu {
    pub(super) fn exec_alu<B: SystemBus>(&mut self, bus: &mut B, ins: &Instruction, op: AluOp, form: AluForm) -> Fallible {
        let w = width(ins);
        match form {
            AluForm::RmReg => {
                let target = self.rm_operand(ins);
                let dest = self.read_operand(bus, target, w)?;
                let src = self.reg(ins.reg(), w);
                if let Some(r) = alu(&mut self.flags, op, dest, src, w) {
                    self.write_operand(bus, target, w, r)?;
                }
            }
            AluForm::RegRm => {
                let src = self.read_rm(bus, ins, w)?;
                let dest = self.reg(ins.reg(), w);
                if let Some(r) = alu(&mut self.flags, op, dest, src, w) {
                    self.set_reg(ins.reg(), w, r);
                }
            }
            AluForm::AccImm => {
                let dest = self.reg(0, w);
                if let Some(r) = alu(&mut self.flags, op, dest, ins.imm, w) {
                    self.set_reg(0, w, r);
                }
            }
            AluForm::RmImm => {
                let target = self.rm_operand(ins);
                let dest = self.read_operand(bus, target, w)?;
                if let Some(r) = alu(&mut self.flags, op, dest, ins.imm, w) {
                    self.write_operand(bus, target, w, r)?;
                }
            }
        }
        Ok(())
    }

    /// INC/DEC leave CF alone.
    pub(super) fn exec_inc_dec<B: SystemBus>(&mut self, bus: &mut B, ins: &Instruction, inc: bool, reg_form: bool) -> Fallible {
        let (target, w) = if reg_form {
            (super::operand::Operand::Reg(ins.opcode_reg()), Width::of(ins.op32))
        } else {
            (self.rm_operand(ins), width(ins))
        };
        let val = self.read_operand(bus, target, w)?;
        let cf = self.flags.contains(Eflags::CF);
        let r = if inc {
            add_with_flags(&mut self.flags, val, 1, false, w)
        } else {
            sub_with_flags(&mut self.flags, val, 1, false, w)
        };
        self.flags.set(Eflags::CF, cf);
        self.write_operand(bus, target, w, r)
    }

    pub(super) fn exec_test<B: SystemBus>(&mut self, bus: &mut B, ins: &Instruction, src: Option<u32>) -> Fallible {
        let w = width(ins);
        let dest = self.read_rm(bus, ins, w)?;
        let src = src.unwrap_or_else(|| self.reg(ins.reg(), w));
        logic_with_flags(&mut self.flags, dest & src, w);
        Ok(())
    }

    pub(super) fn exec_not_neg<B: SystemBus>(&mut self, bus: &mut B, ins: &Instruction, neg: bool) -> Fallible {
        let w = width(ins);
        let target = self.rm_operand(ins);
        let val = self.read_operand(bus, target, w)?;
        let r = if neg {
            sub_with_flags(&mut self.flags, 0, val, false, w)
        } else {
            !val & w.mask()
        };
        self.write_operand(bus, target, w, r)
    }

    fn shift_count(&self, ins: &Instruction, count: Count) -> u32 {
        match count {
            Count::One => 1,
            Count::Cl => self.reg(1, Width::Byte),
            Count::Imm => ins.imm & 0xFF,
        }
    }

    pub(super) fn exec_shift<B: SystemBus>(&mut self, bus: &mut B, ins: &Instruction, op: ShiftOp, count: Count) -> Fallible {
        let w = width(ins);
        let raw = self.shift_count(ins, count);
        let n = raw & 0x1F;
        if !self.is_386() {
            // 286 shifts take one clock per bit position.
            self.extra_cycles += n;
        }
        let target = self.rm_operand(ins);
        let val = self.read_operand(bus, target, w)?;
        if n == 0 {
            return Ok(());
        }
        let r = shift(&mut self.flags, op, val, n, w);
        self.write_operand(bus, target, w, r)
    }

    pub(super) fn exec_double_shift<B: SystemBus>(&mut self, bus: &mut B, ins: &Instruction, left: bool, count: Count) -> Fallible {
        let w = Width::of(ins.op32);
        let n = self.shift_count(ins, count) & 0x1F;
        let target = self.rm_operand(ins);
        let dest = self.read_operand(bus, target, w)?;
        if n == 0 {
            return Ok(());
        }
        let src = self.reg(ins.reg(), w);
        let r = double_shift(&mut self.flags, left, dest, src, n, w);
        self.write_operand(bus, target, w, r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags() -> Eflags {
        Eflags::default()
    }

    #[test]
    fn add_and_sub_flags() {
        let mut f = flags();
        assert_eq!(add_with_flags(&mut f, 0x7F, 1, false, Width::Byte), 0x80);
        assert!(f.contains(Eflags::OF | Eflags::SF | Eflags::AF));
        assert!(!f.contains(Eflags::CF));

        assert_eq!(add_with_flags(&mut f, 0xFFFF, 1, false, Width::Word), 0);
        assert!(f.contains(Eflags::CF | Eflags::ZF | Eflags::PF));

        assert_eq!(sub_with_flags(&mut f, 0, 1, false, Width::Dword), 0xFFFF_FFFF);
        assert!(f.contains(Eflags::CF | Eflags::SF));
        assert!(!f.contains(Eflags::OF));

        assert_eq!(sub_with_flags(&mut f, 0x80, 1, false, Width::Byte), 0x7F);
        assert!(f.contains(Eflags::OF));
    }

    #[test]
    fn cmp_only_sets_flags() {
        let mut f = flags();
        assert_eq!(alu(&mut f, AluOp::Cmp, 5, 5, Width::Word), None);
        assert!(f.contains(Eflags::ZF));
        assert_eq!(alu(&mut f, AluOp::Xor, 0xF0, 0xFF, Width::Byte), Some(0x0F));
        assert!(!f.contains(Eflags::ZF | Eflags::CF));
    }

    #[test]
    fn shifts_and_rotates() {
        let mut f = flags();
        assert_eq!(shift(&mut f, ShiftOp::Shl, 0x81, 1, Width::Byte), 0x02);
        assert!(f.contains(Eflags::CF | Eflags::OF));

        assert_eq!(shift(&mut f, ShiftOp::Sar, 0x8000, 4, Width::Word), 0xF800);
        assert!(!f.contains(Eflags::CF));

        assert_eq!(shift(&mut f, ShiftOp::Shr, 0x01, 1, Width::Byte), 0);
        assert!(f.contains(Eflags::CF | Eflags::ZF));

        assert_eq!(shift(&mut f, ShiftOp::Rol, 0x80, 1, Width::Byte), 0x01);
        assert!(f.contains(Eflags::CF));

        f.remove(Eflags::CF);
        assert_eq!(shift(&mut f, ShiftOp::Rcr, 0x01, 1, Width::Byte), 0x00);
        assert!(f.contains(Eflags::CF));
        assert_eq!(shift(&mut f, ShiftOp::Rcl, 0x00, 1, Width::Byte), 0x01);
        assert!(!f.contains(Eflags::CF));

        // Shifting a word by more than its width clears it.
        assert_eq!(shift(&mut f, ShiftOp::Shl, 0xFFFF, 17, Width::Word), 0);
    }

    #[test]
    fn double_shifts() {
        let mut f = flags();
        assert_eq!(double_shift(&mut f, true, 0x1234, 0xABCD, 4, Width::Word), 0x234A);
        assert!(f.contains(Eflags::CF));
        assert_eq!(double_shift(&mut f, false, 0x1234, 0xABCD, 4, Width::Word), 0xD123);
        assert!(!f.contains(Eflags::CF));
    }
}
