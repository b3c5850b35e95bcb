use pcat_cpu_decoder::{BitOp, Instruction};

use crate::cpu::{Cpu, Width};
use crate::fault::Fallible;
use crate::flags::Eflags;
use crate::SystemBus;

use super::operand::Operand;

impl Cpu {
    /// BT/BTS/BTR/BTC. A register bit offset addressing memory is signed and may select
    /// a bit outside the operand the ModRM names.
    pub(super) fn exec_bit<B: SystemBus>(&mut self, bus: &mut B, ins: &Instruction, op: BitOp, imm: bool) -> Fallible {
        let w = Width::of(ins.op32);
        let bits = w.bits();
        let offset = if imm { ins.imm } else { self.reg(ins.reg(), w) };
        let target = match self.rm_operand(ins) {
            Operand::Mem { seg, off } if !imm => {
                let signed = w.sign_extend(offset) as i32;
                let step = signed.div_euclid(bits as i32) * w.bytes() as i32;
                let off = off.wrapping_add(step as u32);
                let off = if ins.addr32 { off } else { off & 0xFFFF };
                Operand::Mem { seg, off }
            }
            other => other,
        };
        let bit = offset & (bits - 1);
        let val = self.read_operand(bus, target, w)?;
        self.flags.set(Eflags::CF, (val >> bit) & 1 != 0);
        let result = match op {
            BitOp::Bt => return Ok(()),
            BitOp::Bts => val | (1 << bit),
            BitOp::Btr => val & !(1 << bit),
            BitOp::Btc => val ^ (1 << bit),
        };
        self.write_operand(bus, target, w, result)
    }

    /// BSF/BSR. A zero source sets ZF and leaves the destination alone.
    pub(super) fn exec_bit_scan<B: SystemBus>(&mut self, bus: &mut B, ins: &Instruction, reverse: bool) -> Fallible {
        let w = Width::of(ins.op32);
        let src = self.read_rm(bus, ins, w)?;
        if src == 0 {
            self.flags.insert(Eflags::ZF);
            return Ok(());
        }
        self.flags.remove(Eflags::ZF);
        let index = if reverse {
            31 - src.leading_zeros()
        } else {
            src.trailing_zeros()
        };
        self.set_reg(ins.reg(), w, index);
        Ok(())
    }
}
