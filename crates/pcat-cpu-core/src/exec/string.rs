//! One iteration of a string primitive. Repetition lives in the caller.

use pcat_cpu_decoder::{Instruction, Seg, StringOp};
use pcat_mem::IoBus;

use crate::cpu::{Cpu, Gpr, Width};
use crate::fault::Fallible;
use crate::flags::Eflags;
use crate::SystemBus;

use super::alu::sub_with_flags;
use super::operand::width;

const SI: u8 = Gpr::Esi as u8;
const DI: u8 = Gpr::Edi as u8;

impl Cpu {
    /// Advances SI or DI by one element in the direction DF selects.
    fn step_index(&mut self, reg: u8, ins: &Instruction, w: Width) {
        let aw = if ins.addr32 { Width::Dword } else { Width::Word };
        let cur = self.reg(reg, aw);
        let next = if self.flags.contains(Eflags::DF) {
            cur.wrapping_sub(w.bytes())
        } else {
            cur.wrapping_add(w.bytes())
        };
        self.set_reg(reg, aw, next & aw.mask());
    }

    fn index(&self, reg: u8, ins: &Instruction) -> u32 {
        self.reg(reg, if ins.addr32 { Width::Dword } else { Width::Word })
    }

    pub(super) fn string_op<B: SystemBus>(&mut self, bus: &mut B, ins: &Instruction, op: StringOp) -> Fallible {
        let w = width(ins);
        let src = self.data_seg(ins);
        let si = self.index(SI, ins);
        let di = self.index(DI, ins);
        match op {
            StringOp::Movs => {
                let val = self.read(bus, src, si, w)?;
                self.write(bus, Seg::Es, di, w, val)?;
                self.step_index(SI, ins, w);
                self.step_index(DI, ins, w);
            }
            StringOp::Cmps => {
                let a = self.read(bus, src, si, w)?;
                let b = self.read(bus, Seg::Es, di, w)?;
                sub_with_flags(&mut self.flags, a, b, false, w);
                self.step_index(SI, ins, w);
                self.step_index(DI, ins, w);
            }
            StringOp::Stos => {
                let acc = self.reg(0, w);
                self.write(bus, Seg::Es, di, w, acc)?;
                self.step_index(DI, ins, w);
            }
            StringOp::Lods => {
                let val = self.read(bus, src, si, w)?;
                self.set_reg(0, w, val);
                self.step_index(SI, ins, w);
            }
            StringOp::Scas => {
                let acc = self.reg(0, w);
                let b = self.read(bus, Seg::Es, di, w)?;
                sub_with_flags(&mut self.flags, acc, b, false, w);
                self.step_index(DI, ins, w);
            }
            StringOp::Ins => {
                let port = self.reg(Gpr::Edx as u8, Width::Word) as u16;
                self.check_io(bus, port, w.bytes())?;
                // The destination is checked before the port is read.
                self.seg_check_write(Seg::Es, di, w.bytes())?;
                self.bus_unit.flush_writes(bus);
                let val = IoBus::io_read(bus, port, w.bytes() as u8);
                self.write(bus, Seg::Es, di, w, val)?;
                self.step_index(DI, ins, w);
            }
            StringOp::Outs => {
                let port = self.reg(Gpr::Edx as u8, Width::Word) as u16;
                self.check_io(bus, port, w.bytes())?;
                let val = self.read(bus, src, si, w)?;
                self.bus_unit.flush_writes(bus);
                IoBus::io_write(bus, port, w.bytes() as u8, val);
                self.step_index(SI, ins, w);
            }
        }
        Ok(())
    }
}
