//! Control transfer: near and far branches, call gates, returns, software interrupts,
//! and the IOPL-sensitive instructions.

use pcat_cpu_decoder::{Cond, Instruction, Seg};
use pcat_mem::IoBus;

use crate::cpu::{Cpu, Gpr, SegReg, Width};
use crate::descriptor::{Descriptor, Gate, Selector, SystemType};
use crate::fault::{CpuFault, Exception, Fallible};
use crate::flags::Eflags;
use crate::task::TaskSource;
use crate::SystemBus;

use super::operand::width;

/// Offset of the I/O map base field in a 32-bit TSS.
const TSS_IOMAP_BASE: u32 = 0x66;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FarKind {
    Jmp,
    Call,
}

impl FarKind {
    fn task_source(self) -> TaskSource {
        match self {
            FarKind::Jmp => TaskSource::Jmp,
            FarKind::Call => TaskSource::Call,
        }
    }
}

fn offset_mask(op32: bool) -> u32 {
    if op32 {
        0xFFFF_FFFF
    } else {
        0xFFFF
    }
}

impl Cpu {
    pub(super) fn condition(&self, cond: Cond) -> bool {
        let f = self.flags;
        let cf = f.contains(Eflags::CF);
        let zf = f.contains(Eflags::ZF);
        let sf = f.contains(Eflags::SF);
        let of = f.contains(Eflags::OF);
        let pf = f.contains(Eflags::PF);
        match cond {
            Cond::O => of,
            Cond::No => !of,
            Cond::B => cf,
            Cond::Ae => !cf,
            Cond::E => zf,
            Cond::Ne => !zf,
            Cond::Be => cf || zf,
            Cond::A => !(cf || zf),
            Cond::S => sf,
            Cond::Ns => !sf,
            Cond::P => pf,
            Cond::Np => !pf,
            Cond::L => sf != of,
            Cond::Ge => sf == of,
            Cond::Le => zf || sf != of,
            Cond::G => !zf && sf == of,
        }
    }

    pub(super) fn check_near_target(&self, target: u32) -> Fallible {
        if target > self.sreg(Seg::Cs).desc.limit {
            return Err(CpuFault::gp(0));
        }
        Ok(())
    }

    pub(super) fn branch_near(&mut self, target: u32) -> Fallible {
        self.check_near_target(target)?;
        self.eip = target;
        self.bus_unit.invalidate_pq();
        Ok(())
    }

    pub(super) fn branch_relative(&mut self, ins: &Instruction) -> Fallible {
        let target = self.eip.wrapping_add(ins.imm) & offset_mask(ins.op32);
        self.branch_near(target)
    }

    pub(super) fn exec_ret<B: SystemBus>(&mut self, bus: &mut B, ins: &Instruction) -> Fallible {
        let w = Width::of(ins.op32);
        let target = self.stack_peek(bus, 0, w)?;
        self.check_near_target(target)?;
        self.release_stack(w.bytes() + ins.imm);
        self.branch_near(target)
    }

    pub(super) fn exec_int<B: SystemBus>(&mut self, bus: &mut B, vector: u8) -> Fallible {
        if self.traps.has_interrupt_traps() {
            let cs = self.sreg(Seg::Cs).selector.0;
            let ax = self.regs[Gpr::Eax as usize] as u16;
            self.traps.on_interrupt(vector, cs, self.eip, ax);
        }
        self.software_interrupt(bus, vector)
    }

    pub(super) fn exec_bound<B: SystemBus>(&mut self, bus: &mut B, ins: &Instruction) -> Fallible {
        let w = Width::of(ins.op32);
        let index = w.sign_extend(self.reg(ins.reg(), w)) as i32;
        let (seg, off) = self.effective_address(ins);
        let lower = w.sign_extend(self.read(bus, seg, off, w)?) as i32;
        let upper_off = off.wrapping_add(w.bytes()) & if ins.addr32 { 0xFFFF_FFFF } else { 0xFFFF };
        let upper = w.sign_extend(self.read(bus, seg, upper_off, w)?) as i32;
        if index < lower || index > upper {
            return Err(CpuFault::br());
        }
        Ok(())
    }

    pub(super) fn exec_hlt(&mut self) -> Fallible {
        if self.protected_mode() && self.cpl() != 0 {
            return Err(CpuFault::gp(0));
        }
        self.halted = true;
        Ok(())
    }

    pub(super) fn exec_cli_sti(&mut self, set: bool) -> Fallible {
        if self.protected_mode() && self.cpl() > self.flags.iopl() {
            return Err(CpuFault::gp(0));
        }
        if set {
            if !self.flags.contains(Eflags::IF) {
                self.pending.inhibit = 1;
            }
            self.flags.insert(Eflags::IF);
        } else {
            self.flags.remove(Eflags::IF);
        }
        Ok(())
    }

    /// I/O permission: CPL <= IOPL, otherwise (386) every port bit in the TSS
    /// permission bitmap must be clear.
    pub(super) fn check_io<B: SystemBus>(&mut self, bus: &mut B, port: u16, len: u32) -> Fallible {
        if !self.protected_mode() || (!self.v86_mode() && self.cpl() <= self.flags.iopl()) {
            return Ok(());
        }
        let tr = self.tr;
        let tss32 = self.tr_tss_is_32bit() == Some(true);
        if !self.is_386() || !tss32 || tr.desc.limit < TSS_IOMAP_BASE + 1 {
            return Err(CpuFault::gp(0));
        }
        let map_base = self.read_linear(bus, tr.desc.base.wrapping_add(TSS_IOMAP_BASE), 2)?;
        let byte = map_base + u32::from(port) / 8;
        if byte + 1 > tr.desc.limit {
            return Err(CpuFault::gp(0));
        }
        let bits = self.read_linear(bus, tr.desc.base.wrapping_add(byte), 2)?;
        let mask = ((1u32 << len) - 1) << (port & 7);
        if bits & mask != 0 {
            return Err(CpuFault::gp(0));
        }
        Ok(())
    }

    pub(super) fn exec_in<B: SystemBus>(&mut self, bus: &mut B, ins: &Instruction, port: u16) -> Fallible {
        let w = width(ins);
        self.check_io(bus, port, w.bytes())?;
        self.bus_unit.flush_writes(bus);
        let val = IoBus::io_read(bus, port, w.bytes() as u8);
        self.set_reg(0, w, val);
        Ok(())
    }

    pub(super) fn exec_out<B: SystemBus>(&mut self, bus: &mut B, ins: &Instruction, port: u16) -> Fallible {
        let w = width(ins);
        self.check_io(bus, port, w.bytes())?;
        self.bus_unit.flush_writes(bus);
        let val = self.reg(0, w);
        IoBus::io_write(bus, port, w.bytes() as u8, val);
        Ok(())
    }

    fn far_real(&mut self, sel: u16, off: u32) -> Fallible {
        if off > 0xFFFF {
            return Err(CpuFault::gp(0));
        }
        self.load_segment_real(Seg::Cs, sel);
        self.eip = off;
        self.bus_unit.invalidate_pq();
        Ok(())
    }

    pub(super) fn jmp_far<B: SystemBus>(&mut self, bus: &mut B, sel: u16, off: u32, op32: bool) -> Fallible {
        let off = off & offset_mask(op32);
        tracing::trace!(sel, off, "far jump");
        if !self.protected_mode() || self.v86_mode() {
            return self.far_real(sel, off);
        }
        self.far_pmode(bus, FarKind::Jmp, Selector(sel), off, op32)
    }

    pub(super) fn call_far<B: SystemBus>(&mut self, bus: &mut B, sel: u16, off: u32, op32: bool) -> Fallible {
        let off = off & offset_mask(op32);
        tracing::trace!(sel, off, "far call");
        if !self.protected_mode() || self.v86_mode() {
            if off > 0xFFFF {
                return Err(CpuFault::gp(0));
            }
            let frame = [u32::from(self.sreg(Seg::Cs).selector.0), self.eip];
            self.push_values(bus, &frame, Width::of(op32))?;
            return self.far_real(sel, off);
        }
        self.far_pmode(bus, FarKind::Call, Selector(sel), off, op32)
    }

    fn far_pmode<B: SystemBus>(&mut self, bus: &mut B, kind: FarKind, sel: Selector, off: u32, op32: bool) -> Fallible {
        if sel.is_null() {
            return Err(CpuFault::gp(0));
        }
        let raw = self.fetch_descriptor(bus, sel, Exception::GeneralProtection)?;
        let desc = Descriptor::parse(raw, self.model());
        if desc.is_segment() {
            return self.far_direct(bus, kind, sel, desc, off, op32);
        }

        let cpl = self.cpl();
        if desc.system_type(self.model()).is_some_and(SystemType::is_available_tss) {
            if desc.dpl() < cpl || desc.dpl() < sel.rpl() {
                return Err(CpuFault::gp(sel.error_code()));
            }
            return self.task_switch(bus, sel, kind.task_source(), None);
        }
        let gate = Gate::parse(raw, self.model()).ok_or(CpuFault::gp(sel.error_code()))?;
        match gate.kind {
            SystemType::CallGate16 | SystemType::CallGate32 => {
                if gate.dpl < cpl || gate.dpl < sel.rpl() {
                    return Err(CpuFault::gp(sel.error_code()));
                }
                if !gate.present {
                    return Err(CpuFault::np(sel.error_code()));
                }
                self.through_call_gate(bus, kind, gate)
            }
            SystemType::TaskGate => {
                if gate.dpl < cpl || gate.dpl < sel.rpl() {
                    return Err(CpuFault::gp(sel.error_code()));
                }
                if !gate.present {
                    return Err(CpuFault::np(sel.error_code()));
                }
                self.task_switch(bus, gate.selector, kind.task_source(), None)
            }
            _ => Err(CpuFault::gp(sel.error_code())),
        }
    }

    /// Far transfer straight to a code segment, without privilege change.
    fn far_direct<B: SystemBus>(
        &mut self,
        bus: &mut B,
        kind: FarKind,
        sel: Selector,
        desc: Descriptor,
        off: u32,
        op32: bool,
    ) -> Fallible {
        let cpl = self.cpl();
        if !desc.is_code() {
            return Err(CpuFault::gp(sel.error_code()));
        }
        let allowed = if desc.conforming() {
            desc.dpl() <= cpl
        } else {
            sel.rpl() <= cpl && desc.dpl() == cpl
        };
        if !allowed {
            return Err(CpuFault::gp(sel.error_code()));
        }
        if !desc.present() {
            return Err(CpuFault::np(sel.error_code()));
        }
        if off > desc.limit {
            return Err(CpuFault::gp(0));
        }
        if kind == FarKind::Call {
            let frame = [u32::from(self.sreg(Seg::Cs).selector.0), self.eip];
            self.push_values(bus, &frame, Width::of(op32))?;
        }
        self.commit_cs(bus, sel, desc, cpl, off)
    }

    fn through_call_gate<B: SystemBus>(&mut self, bus: &mut B, kind: FarKind, gate: Gate) -> Fallible {
        let cpl = self.cpl();
        let code_sel = gate.selector;
        let code = self.check_code_segment(bus, code_sel, Exception::GeneralProtection)?;
        let allowed = match kind {
            FarKind::Call => code.dpl() <= cpl,
            FarKind::Jmp if code.conforming() => code.dpl() <= cpl,
            FarKind::Jmp => code.dpl() == cpl,
        };
        if !allowed {
            return Err(CpuFault::gp(code_sel.error_code()));
        }
        if !code.present() {
            return Err(CpuFault::np(code_sel.error_code()));
        }
        let w = if gate.kind.is_32bit() { Width::Dword } else { Width::Word };
        let offset = gate.offset & w.mask();

        if kind == FarKind::Call && !code.conforming() && code.dpl() < cpl {
            return self.call_gate_inner(bus, gate, code_sel, code, offset, w);
        }
        if offset > code.limit {
            return Err(CpuFault::gp(0));
        }
        if kind == FarKind::Call {
            let frame = [u32::from(self.sreg(Seg::Cs).selector.0), self.eip];
            self.push_values(bus, &frame, w)?;
        }
        tracing::trace!(gate = ?gate.kind, sel = code_sel.0, offset, "call gate, same privilege");
        self.extra_cycles += self.config.timings.call_gate;
        self.commit_cs(bus, code_sel, code, cpl, offset)
    }

    /// CALL through a gate to a more privileged level: switch to the TSS stack of that
    /// level and copy the gate's parameter words across.
    fn call_gate_inner<B: SystemBus>(
        &mut self,
        bus: &mut B,
        gate: Gate,
        code_sel: Selector,
        code: Descriptor,
        offset: u32,
        w: Width,
    ) -> Fallible {
        let new_cpl = code.dpl();
        let (ss_sel, sp) = self.tss_stack(bus, new_cpl)?;
        let ss = self.check_inner_stack(bus, ss_sel, new_cpl, 0)?;
        if offset > code.limit {
            return Err(CpuFault::gp(0));
        }

        let count = u32::from(gate.params & 0x1F);
        let mut frame = Vec::with_capacity(count as usize + 4);
        frame.push(u32::from(self.sreg(Seg::Ss).selector.0));
        frame.push(self.regs[Gpr::Esp as usize]);
        for i in (0..count).rev() {
            frame.push(self.stack_peek(bus, i * w.bytes(), w)?);
        }
        frame.push(u32::from(self.sreg(Seg::Cs).selector.0));
        frame.push(self.eip);
        let new_sp = self.write_frame(bus, &ss, sp, &frame, w, false)?;

        tracing::trace!(
            sel = code_sel.0,
            offset,
            new_cpl,
            params = count,
            "call gate, inner privilege"
        );
        self.sregs[Seg::Ss.index()] = ss;
        self.set_sp(new_sp);
        self.commit_cs(bus, code_sel, code, new_cpl, offset)?;
        let t = self.config.timings;
        self.extra_cycles += t.call_gate_inner + count * t.call_gate_param;
        Ok(())
    }

    /// RETF [imm]: to the same level, or to an outer one with the caller's stack.
    pub(super) fn ret_far<B: SystemBus>(&mut self, bus: &mut B, imm: u32, op32: bool) -> Fallible {
        let w = Width::of(op32);
        let n = w.bytes();
        let eip = self.stack_peek(bus, 0, w)?;
        let cs = self.stack_peek(bus, n, w)? as u16;
        if !self.protected_mode() || self.v86_mode() {
            self.far_real(cs, eip)?;
            self.release_stack(2 * n + imm);
            return Ok(());
        }

        let cs_sel = Selector(cs);
        let cpl = self.cpl();
        if cs_sel.is_null() {
            return Err(CpuFault::gp(0));
        }
        let rpl = cs_sel.rpl();
        if rpl < cpl {
            return Err(CpuFault::gp(cs_sel.error_code()));
        }
        let desc = self.check_code_segment(bus, cs_sel, Exception::GeneralProtection)?;
        let allowed = if desc.conforming() {
            desc.dpl() <= rpl
        } else {
            desc.dpl() == rpl
        };
        if !allowed {
            return Err(CpuFault::gp(cs_sel.error_code()));
        }
        if !desc.present() {
            return Err(CpuFault::np(cs_sel.error_code()));
        }

        if rpl == cpl {
            if eip > desc.limit {
                return Err(CpuFault::gp(0));
            }
            self.commit_cs(bus, cs_sel, desc, rpl, eip)?;
            self.release_stack(2 * n + imm);
            return Ok(());
        }

        let new_sp = self.stack_peek(bus, 2 * n + imm, w)?;
        let ss_sel = Selector(self.stack_peek(bus, 3 * n + imm, w)? as u16);
        let ss: SegReg = self.check_ss(bus, ss_sel, rpl, Exception::GeneralProtection)?;
        if eip > desc.limit {
            return Err(CpuFault::gp(0));
        }
        tracing::trace!(cs = cs, eip, rpl, "far return to outer level");
        self.commit_cs(bus, cs_sel, desc, rpl, eip)?;
        self.sregs[Seg::Ss.index()] = ss;
        self.set_sp(new_sp.wrapping_add(imm));
        self.invalidate_data_segments(rpl);
        self.extra_cycles += self.config.timings.return_outer;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CpuConfig;
    use pcat_cpu_decoder::CpuModel;

    #[test]
    fn conditions_follow_the_flags() {
        let mut cpu = Cpu::new(CpuConfig::new(CpuModel::I80286));
        cpu.flags = Eflags::RESERVED1 | Eflags::SF;
        assert!(cpu.condition(Cond::L));
        assert!(cpu.condition(Cond::Le));
        assert!(!cpu.condition(Cond::G));
        cpu.flags.insert(Eflags::OF);
        assert!(cpu.condition(Cond::Ge));
        assert!(cpu.condition(Cond::G));
        cpu.flags.insert(Eflags::CF);
        assert!(cpu.condition(Cond::Be));
        assert!(!cpu.condition(Cond::A));
    }

    #[test]
    fn cli_requires_iopl_in_protected_mode() {
        let mut cpu = Cpu::new(CpuConfig::new(CpuModel::I80286));
        cpu.set_cr0(crate::flags::Cr0::PE);
        cpu.sregs[Seg::Cs.index()].selector = Selector(0x0B);
        assert_eq!(cpu.exec_cli_sti(false), Err(CpuFault::gp(0)));
        cpu.flags.set_iopl(3);
        cpu.exec_cli_sti(true).unwrap();
        assert!(cpu.flags.contains(Eflags::IF));
        assert_eq!(cpu.pending.inhibit, 1);
    }
}
