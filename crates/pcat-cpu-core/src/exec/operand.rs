//! ModRM operand resolution: 16- and 32-bit effective addresses, register or memory
//! operands.

use pcat_cpu_decoder::{Instruction, ModRm, Seg, Sib, Sz};

use crate::cpu::{Cpu, Gpr, Width};
use crate::fault::Fallible;
use crate::SystemBus;

/// A resolved r/m operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Operand {
    Reg(u8),
    Mem { seg: Seg, off: u32 },
}

/// Operand width of an instruction's `b`/`v` form.
pub(crate) fn width(ins: &Instruction) -> Width {
    match ins.width {
        Sz::B => Width::Byte,
        Sz::V => Width::of(ins.op32),
    }
}

impl Cpu {
    fn ea16(&self, modrm: ModRm, disp: u32) -> (u32, Seg) {
        let r = |g: Gpr| self.regs[g as usize];
        let (base, seg) = match modrm.rm {
            0 => (r(Gpr::Ebx).wrapping_add(r(Gpr::Esi)), Seg::Ds),
            1 => (r(Gpr::Ebx).wrapping_add(r(Gpr::Edi)), Seg::Ds),
            2 => (r(Gpr::Ebp).wrapping_add(r(Gpr::Esi)), Seg::Ss),
            3 => (r(Gpr::Ebp).wrapping_add(r(Gpr::Edi)), Seg::Ss),
            4 => (r(Gpr::Esi), Seg::Ds),
            5 => (r(Gpr::Edi), Seg::Ds),
            6 if modrm.mode == 0 => (0, Seg::Ds),
            6 => (r(Gpr::Ebp), Seg::Ss),
            _ => (r(Gpr::Ebx), Seg::Ds),
        };
        (base.wrapping_add(disp) & 0xFFFF, seg)
    }

    fn ea32(&self, modrm: ModRm, sib: Option<Sib>, disp: u32) -> (u32, Seg) {
        let stack_base = |base: u8| base == Gpr::Esp as u8 || base == Gpr::Ebp as u8;
        match sib {
            Some(sib) => {
                let (base, seg) = if sib.base == 5 && modrm.mode == 0 {
                    (0, Seg::Ds)
                } else if stack_base(sib.base) {
                    (self.regs[usize::from(sib.base)], Seg::Ss)
                } else {
                    (self.regs[usize::from(sib.base)], Seg::Ds)
                };
                let index = if sib.index == 4 {
                    0
                } else {
                    self.regs[usize::from(sib.index)] << sib.scale
                };
                (base.wrapping_add(index).wrapping_add(disp), seg)
            }
            None if modrm.mode == 0 && modrm.rm == 5 => (disp, Seg::Ds),
            None => {
                let seg = if modrm.rm == Gpr::Ebp as u8 { Seg::Ss } else { Seg::Ds };
                (self.regs[usize::from(modrm.rm)].wrapping_add(disp), seg)
            }
        }
    }

    /// Segment and offset of the instruction's memory operand.
    pub(crate) fn effective_address(&self, ins: &Instruction) -> (Seg, u32) {
        let modrm = ins.modrm.unwrap_or_default();
        let (off, default) = if ins.addr32 {
            self.ea32(modrm, ins.sib, ins.disp)
        } else {
            self.ea16(modrm, ins.disp)
        };
        (ins.seg.unwrap_or(default), off)
    }

    pub(crate) fn rm_operand(&self, ins: &Instruction) -> Operand {
        match ins.modrm {
            Some(m) if m.is_reg() => Operand::Reg(m.rm),
            _ => {
                let (seg, off) = self.effective_address(ins);
                Operand::Mem { seg, off }
            }
        }
    }

    /// Data segment of an instruction without a ModRM memory operand.
    pub(crate) fn data_seg(&self, ins: &Instruction) -> Seg {
        ins.seg.unwrap_or(Seg::Ds)
    }

    pub(crate) fn read_operand<B: SystemBus>(&mut self, bus: &mut B, op: Operand, w: Width) -> Fallible<u32> {
        match op {
            Operand::Reg(r) => Ok(self.reg(r, w)),
            Operand::Mem { seg, off } => self.read(bus, seg, off, w),
        }
    }

    pub(crate) fn write_operand<B: SystemBus>(&mut self, bus: &mut B, op: Operand, w: Width, val: u32) -> Fallible {
        match op {
            Operand::Reg(r) => {
                self.set_reg(r, w, val);
                Ok(())
            }
            Operand::Mem { seg, off } => self.write(bus, seg, off, w, val),
        }
    }

    pub(crate) fn read_rm<B: SystemBus>(&mut self, bus: &mut B, ins: &Instruction, w: Width) -> Fallible<u32> {
        let op = self.rm_operand(ins);
        self.read_operand(bus, op, w)
    }

    pub(crate) fn write_rm<B: SystemBus>(&mut self, bus: &mut B, ins: &Instruction, w: Width, val: u32) -> Fallible {
        let op = self.rm_operand(ins);
        self.write_operand(bus, op, w, val)
    }

    /// Reads `offset:selector` from memory, as LxS and indirect far transfers do.
    pub(crate) fn read_far_pointer<B: SystemBus>(&mut self, bus: &mut B, ins: &Instruction) -> Fallible<(u32, u16)> {
        let w = Width::of(ins.op32);
        let (seg, off) = self.effective_address(ins);
        let offset = self.read(bus, seg, off, w)?;
        let sel_off = off.wrapping_add(w.bytes());
        let sel_off = if ins.addr32 { sel_off } else { sel_off & 0xFFFF };
        let selector = self.read_u16(bus, seg, sel_off)?;
        Ok((offset, selector))
    }
}
