//! Multiply, divide, decimal adjust and sign extension of the accumulator.

use pcat_cpu_decoder::Instruction;

use crate::cpu::{Cpu, Gpr, Width};
use crate::fault::{CpuFault, Fallible};
use crate::flags::Eflags;
use crate::SystemBus;

use super::alu::set_szp;
use super::operand::width;

const AX: u8 = Gpr::Eax as u8;
const DX: u8 = Gpr::Edx as u8;

impl Cpu {
    /// Accumulator-pair value (`AX`, `DX:AX` or `EDX:EAX`) used by DIV/IDIV.
    fn dividend(&self, w: Width) -> u64 {
        match w {
            Width::Byte => u64::from(self.reg(AX, Width::Word)),
            _ => (u64::from(self.reg(DX, w)) << w.bits()) | u64::from(self.reg(AX, w)),
        }
    }

    /// Stores a double-width product into `AX`, `DX:AX` or `EDX:EAX`.
    fn store_wide(&mut self, w: Width, val: u64) {
        match w {
            Width::Byte => self.set_reg(AX, Width::Word, val as u32),
            _ => {
                self.set_reg(AX, w, val as u32);
                self.set_reg(DX, w, (val >> w.bits()) as u32);
            }
        }
    }

    pub(super) fn exec_mul<B: SystemBus>(&mut self, bus: &mut B, ins: &Instruction, signed: bool) -> Fallible {
        let w = width(ins);
        let src = self.read_rm(bus, ins, w)?;
        let acc = self.reg(AX, w);
        let (product, overflow) = if signed {
            let p = i64::from(w.sign_extend(acc) as i32) * i64::from(w.sign_extend(src) as i32);
            let low = w.sign_extend(p as u32 & w.mask()) as i32;
            (p as u64, i64::from(low) != p)
        } else {
            let p = u64::from(acc) * u64::from(src);
            (p, p >> w.bits() != 0)
        };
        self.store_wide(w, product);
        self.flags.set(Eflags::CF | Eflags::OF, overflow);
        set_szp(&mut self.flags, product as u32, w);
        Ok(())
    }

    /// Two- and three-operand IMUL: the product is truncated to the destination.
    pub(super) fn exec_imul_reg<B: SystemBus>(&mut self, bus: &mut B, ins: &Instruction, imm: Option<u32>) -> Fallible {
        let w = Width::of(ins.op32);
        let src = self.read_rm(bus, ins, w)?;
        let other = match imm {
            Some(imm) => imm,
            None => self.reg(ins.reg(), w),
        };
        let p = i64::from(w.sign_extend(src) as i32) * i64::from(w.sign_extend(other) as i32);
        let result = p as u32 & w.mask();
        let overflow = i64::from(w.sign_extend(result) as i32) != p;
        self.set_reg(ins.reg(), w, result);
        self.flags.set(Eflags::CF | Eflags::OF, overflow);
        set_szp(&mut self.flags, result, w);
        Ok(())
    }

    /// DIV/IDIV. A zero divisor or a quotient that does not fit raises #DE with the
    /// registers untouched.
    pub(super) fn exec_div<B: SystemBus>(&mut self, bus: &mut B, ins: &Instruction, signed: bool) -> Fallible {
        let w = width(ins);
        let divisor = self.read_rm(bus, ins, w)?;
        if divisor == 0 {
            return Err(CpuFault::de());
        }
        let dividend = self.dividend(w);
        let (quotient, remainder) = if signed {
            let total_bits = 2 * w.bits();
            let dividend = ((dividend as i128) << (128 - total_bits)) >> (128 - total_bits);
            let divisor = i128::from(w.sign_extend(divisor) as i32);
            let q = dividend / divisor;
            let r = dividend % divisor;
            let half = 1i128 << (w.bits() - 1);
            if q < -half || q >= half {
                return Err(CpuFault::de());
            }
            (q as u32 & w.mask(), r as u32 & w.mask())
        } else {
            let q = dividend / u64::from(divisor);
            if q > u64::from(w.mask()) {
                return Err(CpuFault::de());
            }
            (q as u32, (dividend % u64::from(divisor)) as u32)
        };
        match w {
            Width::Byte => {
                self.set_reg(AX, Width::Byte, quotient);
                self.set_reg(4, Width::Byte, remainder);
            }
            _ => {
                self.set_reg(AX, w, quotient);
                self.set_reg(DX, w, remainder);
            }
        }
        Ok(())
    }

    pub(super) fn exec_daa_das(&mut self, subtract: bool) {
        let old_al = self.reg(AX, Width::Byte);
        let old_cf = self.flags.contains(Eflags::CF);
        let mut al = old_al;
        let mut cf = false;
        if al & 0x0F > 9 || self.flags.contains(Eflags::AF) {
            let adjusted = if subtract { al.wrapping_sub(6) } else { al + 6 };
            cf = old_cf || adjusted > 0xFF;
            al = adjusted & 0xFF;
            self.flags.insert(Eflags::AF);
        } else {
            self.flags.remove(Eflags::AF);
        }
        if old_al > 0x99 || old_cf {
            al = (if subtract { al.wrapping_sub(0x60) } else { al + 0x60 }) & 0xFF;
            cf = true;
        }
        self.set_reg(AX, Width::Byte, al);
        self.flags.set(Eflags::CF, cf);
        set_szp(&mut self.flags, al, Width::Byte);
    }

    pub(super) fn exec_aaa_aas(&mut self, subtract: bool) {
        let al = self.reg(AX, Width::Byte);
        let adjust = al & 0x0F > 9 || self.flags.contains(Eflags::AF);
        if adjust {
            let ax = self.reg(AX, Width::Word);
            let ax = if subtract { ax.wrapping_sub(0x106) } else { ax.wrapping_add(0x106) };
            self.set_reg(AX, Width::Word, ax);
        }
        self.flags.set(Eflags::AF | Eflags::CF, adjust);
        let al = self.reg(AX, Width::Byte) & 0x0F;
        self.set_reg(AX, Width::Byte, al);
    }

    pub(super) fn exec_aam(&mut self, base: u8) -> Fallible {
        if base == 0 {
            return Err(CpuFault::de());
        }
        let al = self.reg(AX, Width::Byte);
        let base = u32::from(base);
        self.set_reg(4, Width::Byte, al / base);
        self.set_reg(AX, Width::Byte, al % base);
        set_szp(&mut self.flags, al % base, Width::Byte);
        Ok(())
    }

    pub(super) fn exec_aad(&mut self, base: u8) {
        let al = self.reg(AX, Width::Byte);
        let ah = self.reg(4, Width::Byte);
        let result = (al + ah * u32::from(base)) & 0xFF;
        self.set_reg(AX, Width::Word, result);
        set_szp(&mut self.flags, result, Width::Byte);
    }

    /// CBW / CWDE.
    pub(super) fn exec_cbw(&mut self, op32: bool) {
        if op32 {
            let ax = self.reg(AX, Width::Word);
            self.set_reg(AX, Width::Dword, Width::Word.sign_extend(ax));
        } else {
            let al = self.reg(AX, Width::Byte);
            self.set_reg(AX, Width::Word, Width::Byte.sign_extend(al));
        }
    }

    /// CWD / CDQ.
    pub(super) fn exec_cwd(&mut self, op32: bool) {
        let w = Width::of(op32);
        let negative = self.reg(AX, w) & w.sign_bit() != 0;
        self.set_reg(DX, w, if negative { w.mask() } else { 0 });
    }
}
