//! The interpreter: one decoded instruction at a time against the architectural state.
//!
//! Every handler either completes or returns a fault with the visible state as it was
//! before the instruction. `execute` resets EIP to the instruction start on any fault.

mod alu;
mod arith;
mod bits;
mod control;
mod data;
mod operand;
mod string;
mod system;

use pcat_cpu_decoder::{Instruction, LoopKind, Op, RepPrefix, Seg};

use crate::cpu::{Cpu, Gpr, Width};
use crate::fault::{CpuFault, Fallible};
use crate::flags::Eflags;
use crate::SystemBus;

impl Cpu {
    /// Executes `ins`, already decoded at CS:EIP. Returns the clocks it took.
    pub fn execute<B: SystemBus>(&mut self, bus: &mut B, ins: &Instruction) -> Result<u32, CpuFault> {
        self.fault_eip = self.eip;
        self.branch_not_taken = false;
        self.eip = self.eip.wrapping_add(u32::from(ins.size)) & self.ip_mask();
        if self.traps.has_interrupt_traps() {
            let cs = self.sreg(Seg::Cs).selector.0;
            let ax = self.regs[Gpr::Eax as usize] as u16;
            self.traps.on_instruction(cs, self.fault_eip, ax);
        }

        let first_iteration = !self.rep_active;
        match self.execute_checked(bus, ins) {
            Ok(ran) => Ok(self.instruction_cycles(ins, first_iteration, ran)),
            Err(fault) => {
                self.eip = self.fault_eip;
                self.rep_active = false;
                Err(fault)
            }
        }
    }

    /// Returns false for a repeated string instruction that found its count at zero.
    fn execute_checked<B: SystemBus>(&mut self, bus: &mut B, ins: &Instruction) -> Fallible<bool> {
        if !ins.valid {
            return Err(CpuFault::ud());
        }
        let last = self.fault_eip.wrapping_add(u32::from(ins.size)).wrapping_sub(1);
        if ins.size > self.model().max_instr_size() || last > self.sreg(Seg::Cs).desc.limit {
            return Err(CpuFault::gp(0));
        }
        if let (Some(rep), Op::String(_)) = (ins.rep, ins.op) {
            return self.execute_rep(bus, ins, rep);
        }
        self.dispatch(bus, ins)?;
        Ok(true)
    }

    fn count_width(ins: &Instruction) -> Width {
        if ins.addr32 {
            Width::Dword
        } else {
            Width::Word
        }
    }

    /// One iteration of a repeated string instruction. While the repeat is unfinished
    /// EIP stays on the instruction so interrupts can be taken between iterations.
    fn execute_rep<B: SystemBus>(&mut self, bus: &mut B, ins: &Instruction, rep: RepPrefix) -> Fallible<bool> {
        let Op::String(op) = ins.op else {
            return Ok(true);
        };
        let cw = Self::count_width(ins);
        let count = self.reg(Gpr::Ecx as u8, cw);
        if count == 0 {
            self.rep_active = false;
            return Ok(false);
        }
        self.string_op(bus, ins, op)?;
        let count = count.wrapping_sub(1) & cw.mask();
        self.set_reg(Gpr::Ecx as u8, cw, count);

        let zf = self.flags.contains(Eflags::ZF);
        let stop_on_zf = op.checks_zf()
            && match rep {
                RepPrefix::Rep => !zf,
                RepPrefix::Repne => zf,
            };
        if count == 0 || stop_on_zf {
            self.rep_active = false;
        } else {
            self.rep_active = true;
            self.eip = self.fault_eip;
        }
        Ok(true)
    }

    fn instruction_cycles(&mut self, ins: &Instruction, first_iteration: bool, ran: bool) -> u32 {
        let t = ins.cycles;
        let mut cycles = if ins.rep.is_some() && ins.is_string() {
            let setup = if first_iteration { u32::from(t.rep) } else { 0 };
            setup + if ran { u32::from(t.rep_iter) } else { 0 }
        } else {
            let base = if self.branch_not_taken && ins.op.is_conditional_branch() {
                t.noj
            } else if ins.has_memory_operand() {
                t.mem
            } else {
                t.base
            };
            let mut c = u32::from(base);
            if self.protected_mode() {
                c += u32::from(t.pmode);
            }
            c
        };
        cycles += std::mem::take(&mut self.extra_cycles);
        cycles
    }

    fn dispatch<B: SystemBus>(&mut self, bus: &mut B, ins: &Instruction) -> Fallible {
        match ins.op {
            Op::Invalid | Op::Group(_) => Err(CpuFault::ud()),

            Op::Alu(op, form) => self.exec_alu(bus, ins, op, form),
            Op::IncReg => self.exec_inc_dec(bus, ins, true, true),
            Op::DecReg => self.exec_inc_dec(bus, ins, false, true),
            Op::IncRm => self.exec_inc_dec(bus, ins, true, false),
            Op::DecRm => self.exec_inc_dec(bus, ins, false, false),
            Op::TestRmReg => self.exec_test(bus, ins, None),
            Op::TestRmImm => self.exec_test(bus, ins, Some(ins.imm)),
            Op::TestAccImm => {
                let w = operand::width(ins);
                let acc = self.reg(0, w);
                alu::logic_with_flags(&mut self.flags, acc & ins.imm, w);
                Ok(())
            }
            Op::Not => self.exec_not_neg(bus, ins, false),
            Op::Neg => self.exec_not_neg(bus, ins, true),
            Op::Mul => self.exec_mul(bus, ins, false),
            Op::Imul => self.exec_mul(bus, ins, true),
            Op::Div => self.exec_div(bus, ins, false),
            Op::Idiv => self.exec_div(bus, ins, true),
            Op::ImulImm => self.exec_imul_reg(bus, ins, Some(ins.imm)),
            Op::ImulRegRm => self.exec_imul_reg(bus, ins, None),
            Op::Shift(op, count) => self.exec_shift(bus, ins, op, count),
            Op::Shld(count) => self.exec_double_shift(bus, ins, true, count),
            Op::Shrd(count) => self.exec_double_shift(bus, ins, false, count),
            Op::Daa => {
                self.exec_daa_das(false);
                Ok(())
            }
            Op::Das => {
                self.exec_daa_das(true);
                Ok(())
            }
            Op::Aaa => {
                self.exec_aaa_aas(false);
                Ok(())
            }
            Op::Aas => {
                self.exec_aaa_aas(true);
                Ok(())
            }
            Op::Aam => self.exec_aam(ins.imm as u8),
            Op::Aad => {
                self.exec_aad(ins.imm as u8);
                Ok(())
            }
            Op::Salc => {
                let al = if self.flags.contains(Eflags::CF) { 0xFF } else { 0 };
                self.set_reg(0, Width::Byte, al);
                Ok(())
            }
            Op::Cbw => {
                self.exec_cbw(ins.op32);
                Ok(())
            }
            Op::Cwd => {
                self.exec_cwd(ins.op32);
                Ok(())
            }

            Op::MovRmReg => {
                let w = operand::width(ins);
                let val = self.reg(ins.reg(), w);
                self.write_rm(bus, ins, w, val)
            }
            Op::MovRegRm => {
                let w = operand::width(ins);
                let val = self.read_rm(bus, ins, w)?;
                self.set_reg(ins.reg(), w, val);
                Ok(())
            }
            Op::MovRmImm => self.write_rm(bus, ins, operand::width(ins), ins.imm),
            Op::MovRegImm => {
                let w = operand::width(ins);
                self.set_reg(ins.opcode_reg(), w, ins.imm);
                Ok(())
            }
            Op::MovAccMoffs => {
                let w = operand::width(ins);
                let val = self.read(bus, self.data_seg(ins), ins.imm, w)?;
                self.set_reg(0, w, val);
                Ok(())
            }
            Op::MovMoffsAcc => {
                let w = operand::width(ins);
                let val = self.reg(0, w);
                self.write(bus, self.data_seg(ins), ins.imm, w, val)
            }
            Op::MovRmSeg => self.exec_mov_rm_seg(bus, ins),
            Op::MovSegRm => self.exec_mov_seg_rm(bus, ins),
            Op::Lea => {
                let (_, off) = self.effective_address(ins);
                self.set_reg(ins.reg(), Width::of(ins.op32), off);
                Ok(())
            }
            Op::XchgRmReg => self.exec_xchg(bus, ins),
            Op::XchgAccReg => {
                let w = Width::of(ins.op32);
                let r = ins.opcode_reg();
                let (a, b) = (self.reg(0, w), self.reg(r, w));
                self.set_reg(0, w, b);
                self.set_reg(r, w, a);
                Ok(())
            }
            Op::Xlat => self.exec_xlat(bus, ins),
            Op::Lahf => {
                let ah = self.flags.bits() & 0xFF;
                self.set_reg(4, Width::Byte, ah);
                Ok(())
            }
            Op::Sahf => {
                self.exec_sahf();
                Ok(())
            }
            Op::Movzx => self.exec_movx(bus, ins, false),
            Op::Movsx => self.exec_movx(bus, ins, true),
            Op::LoadFar(seg) => self.exec_load_far(bus, ins, seg),
            Op::Setcc(cond) => {
                let val = u32::from(self.condition(cond));
                self.write_rm(bus, ins, Width::Byte, val)
            }

            Op::PushReg => {
                let w = Width::of(ins.op32);
                let val = self.reg(ins.opcode_reg(), w);
                self.push(bus, val, w)
            }
            Op::PopReg => {
                let w = Width::of(ins.op32);
                let val = self.pop(bus, w)?;
                self.set_reg(ins.opcode_reg(), w, val);
                Ok(())
            }
            Op::PushSeg(seg) => {
                let sel = u32::from(self.sreg(seg).selector.0);
                self.push(bus, sel, Width::of(ins.op32))
            }
            Op::PopSeg(seg) => self.exec_pop_seg(bus, ins, seg),
            Op::PushImm => self.push(bus, ins.imm, Width::of(ins.op32)),
            Op::PushRm => {
                let w = Width::of(ins.op32);
                let val = self.read_rm(bus, ins, w)?;
                self.push(bus, val, w)
            }
            Op::PopRm => self.exec_pop_rm(bus, ins),
            Op::Pusha => self.exec_pusha(bus, ins),
            Op::Popa => self.exec_popa(bus, ins),
            Op::Pushf => self.exec_pushf(bus, ins),
            Op::Popf => self.exec_popf(bus, ins),
            Op::Enter => self.exec_enter(bus, ins),
            Op::Leave => self.exec_leave(bus, ins),

            Op::Jcc(cond) => {
                if self.condition(cond) {
                    self.branch_relative(ins)
                } else {
                    self.branch_not_taken = true;
                    Ok(())
                }
            }
            Op::JmpRel => self.branch_relative(ins),
            Op::CallRel => {
                let ret = self.eip;
                let target = self.eip.wrapping_add(ins.imm) & self.ip_mask();
                self.check_near_target(target)?;
                self.push(bus, ret, Width::of(ins.op32))?;
                self.branch_near(target)
            }
            Op::JmpRm => {
                let target = self.read_rm(bus, ins, Width::of(ins.op32))?;
                self.branch_near(target)
            }
            Op::CallRm => {
                let w = Width::of(ins.op32);
                let target = self.read_rm(bus, ins, w)?;
                self.check_near_target(target)?;
                let ret = self.eip;
                self.push(bus, ret, w)?;
                self.branch_near(target)
            }
            Op::JmpFar => self.jmp_far(bus, ins.imm2, ins.imm, ins.op32),
            Op::CallFar => self.call_far(bus, ins.imm2, ins.imm, ins.op32),
            Op::JmpFarRm => {
                let (off, sel) = self.read_far_pointer(bus, ins)?;
                self.jmp_far(bus, sel, off, ins.op32)
            }
            Op::CallFarRm => {
                let (off, sel) = self.read_far_pointer(bus, ins)?;
                self.call_far(bus, sel, off, ins.op32)
            }
            Op::Ret => self.exec_ret(bus, ins),
            Op::Retf => self.ret_far(bus, ins.imm, ins.op32),
            Op::Iret => self.iret(bus, ins.op32),
            Op::Loop(kind) => self.exec_loop(ins, kind),
            Op::Int3 => self.exec_int(bus, 3),
            Op::Int => self.exec_int(bus, ins.imm as u8),
            Op::Into => {
                if self.flags.contains(Eflags::OF) {
                    self.exec_int(bus, 4)
                } else {
                    Ok(())
                }
            }
            Op::Int1 => self.deliver_exception(bus, 1, None),
            Op::Bound => self.exec_bound(bus, ins),
            Op::Hlt => self.exec_hlt(),

            Op::Cmc => {
                self.flags.toggle(Eflags::CF);
                Ok(())
            }
            Op::Clc => {
                self.flags.remove(Eflags::CF);
                Ok(())
            }
            Op::Stc => {
                self.flags.insert(Eflags::CF);
                Ok(())
            }
            Op::Cli => self.exec_cli_sti(false),
            Op::Sti => self.exec_cli_sti(true),
            Op::Cld => {
                self.flags.remove(Eflags::DF);
                Ok(())
            }
            Op::Std => {
                self.flags.insert(Eflags::DF);
                Ok(())
            }

            Op::String(op) => self.string_op(bus, ins, op),
            Op::InImm => self.exec_in(bus, ins, ins.imm as u16),
            Op::InDx => {
                let port = self.reg(Gpr::Edx as u8, Width::Word) as u16;
                self.exec_in(bus, ins, port)
            }
            Op::OutImm => self.exec_out(bus, ins, ins.imm as u16),
            Op::OutDx => {
                let port = self.reg(Gpr::Edx as u8, Width::Word) as u16;
                self.exec_out(bus, ins, port)
            }

            Op::Sldt => self.exec_sldt_str(bus, ins, false),
            Op::Str => self.exec_sldt_str(bus, ins, true),
            Op::Lldt => self.exec_lldt(bus, ins),
            Op::Ltr => self.exec_ltr(bus, ins),
            Op::Verr => self.exec_verify(bus, ins, false),
            Op::Verw => self.exec_verify(bus, ins, true),
            Op::Sgdt => self.exec_store_table(bus, ins, false),
            Op::Sidt => self.exec_store_table(bus, ins, true),
            Op::Lgdt => self.exec_load_table(bus, ins, false),
            Op::Lidt => self.exec_load_table(bus, ins, true),
            Op::Smsw => self.exec_smsw(bus, ins),
            Op::Lmsw => self.exec_lmsw(bus, ins),
            Op::Lar => self.exec_lar_lsl(bus, ins, false),
            Op::Lsl => self.exec_lar_lsl(bus, ins, true),
            Op::Clts => self.exec_clts(),
            Op::Arpl => self.exec_arpl(bus, ins),
            Op::MovRegCr => self.exec_mov_from_cr(ins),
            Op::MovCrReg => self.exec_mov_to_cr(ins),
            Op::MovRegDr => self.exec_mov_from_dr(ins),
            Op::MovDrReg => self.exec_mov_to_dr(ins),

            Op::BitReg(op) => self.exec_bit(bus, ins, op, false),
            Op::BitImm(op) => self.exec_bit(bus, ins, op, true),
            Op::Bsf => self.exec_bit_scan(bus, ins, false),
            Op::Bsr => self.exec_bit_scan(bus, ins, true),

            Op::Nop => Ok(()),
            Op::Wait => self.exec_wait(),
            Op::Esc => self.exec_esc(),
        }
    }

    /// LOOP/LOOPE/LOOPNE/JCXZ. The count register follows the address size and is only
    /// written once the branch target has been checked.
    fn exec_loop(&mut self, ins: &Instruction, kind: LoopKind) -> Fallible {
        let cw = Self::count_width(ins);
        let count = self.reg(Gpr::Ecx as u8, cw);
        let (taken, count) = if kind == LoopKind::Jcxz {
            (count == 0, count)
        } else {
            let count = count.wrapping_sub(1) & cw.mask();
            let zf = self.flags.contains(Eflags::ZF);
            let taken = count != 0
                && match kind {
                    LoopKind::Loope => zf,
                    LoopKind::Loopne => !zf,
                    _ => true,
                };
            (taken, count)
        };
        if taken {
            self.branch_relative(ins)?;
        } else {
            self.branch_not_taken = true;
        }
        self.set_reg(Gpr::Ecx as u8, cw, count);
        Ok(())
    }
}
