//! Interrupt and exception delivery, and IRET.

use std::collections::VecDeque;

use pcat_cpu_decoder::Seg;

use crate::cpu::{Cpu, Gpr, SegReg, Width};
use crate::descriptor::{Descriptor, Gate, Selector, SystemType};
use crate::fault::{CpuFault, Exception, Fallible};
use crate::flags::Eflags;
use crate::task::TaskSource;
use crate::SystemBus;

/// Events waiting for the next instruction boundary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct PendingEvents {
    pub nmi: bool,
    /// Set from NMI delivery until the next IRET.
    pub nmi_blocked: bool,
    /// Distinct vectors in arrival order.
    pub external: VecDeque<u8>,
    /// Instructions left before maskable interrupts are recognised again (MOV SS, STI).
    pub inhibit: u8,
}

/// What is being delivered; decides the privilege check, the EXT bit and error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IntSource {
    /// INT n, INT3, INTO, BOUND: checked against the gate DPL.
    Software,
    Exception { error_code: Option<u16> },
    External,
}

impl IntSource {
    fn ext(self) -> u16 {
        match self {
            IntSource::Software => 0,
            _ => 1,
        }
    }

    fn error_code(self) -> Option<u16> {
        match self {
            IntSource::Exception { error_code } => error_code,
            _ => None,
        }
    }
}

impl Cpu {
    /// Delivers `vector` now. Registers are only modified once every check passed.
    pub(crate) fn interrupt<B: SystemBus>(&mut self, bus: &mut B, vector: u8, source: IntSource) -> Fallible {
        tracing::trace!(vector, ?source, cs = self.sreg(Seg::Cs).selector.0, eip = self.eip, "interrupt");
        self.halted = false;
        if !self.protected_mode() {
            return self.interrupt_real(bus, vector);
        }
        if self.v86_mode() && source == IntSource::Software && self.flags.iopl() < 3 {
            return Err(CpuFault::gp(0));
        }
        self.interrupt_pmode(bus, vector, source)
    }

    fn interrupt_real<B: SystemBus>(&mut self, bus: &mut B, vector: u8) -> Fallible {
        let entry = u32::from(vector) * 4;
        if entry + 3 > u32::from(self.idtr.limit) {
            return Err(CpuFault::gp(0));
        }
        let target = self.read_linear(bus, self.idtr.base.wrapping_add(entry), 4)?;
        let cs = self.sreg(Seg::Cs).selector.0;
        let frame = [self.flags_image(), u32::from(cs), self.eip];
        self.push_values(bus, &frame, Width::Word)?;
        self.flags.remove(Eflags::IF | Eflags::TF | Eflags::RF);
        self.load_segment_real(Seg::Cs, (target >> 16) as u16);
        self.eip = target & 0xFFFF;
        Ok(())
    }

    fn interrupt_pmode<B: SystemBus>(&mut self, bus: &mut B, vector: u8, source: IntSource) -> Fallible {
        let idt_code = idt_error_code(vector, source.ext() != 0);
        let entry = u32::from(vector) * 8;
        if entry + 7 > u32::from(self.idtr.limit) {
            return Err(CpuFault::gp(idt_code));
        }
        let raw = self.read_linear_u64(bus, self.idtr.base.wrapping_add(entry))?;
        let gate = match Gate::parse(raw, self.model()) {
            Some(gate)
                if matches!(
                    gate.kind,
                    SystemType::TaskGate
                        | SystemType::IntGate16
                        | SystemType::TrapGate16
                        | SystemType::IntGate32
                        | SystemType::TrapGate32
                ) =>
            {
                gate
            }
            _ => return Err(CpuFault::gp(idt_code)),
        };
        let cpl = self.cpl();
        if source == IntSource::Software && gate.dpl < cpl {
            return Err(CpuFault::gp(idt_code));
        }
        if !gate.present {
            return Err(CpuFault::np(idt_code));
        }
        if gate.kind == SystemType::TaskGate {
            return self.task_switch(bus, gate.selector, TaskSource::Int, source.error_code());
        }

        let sel = gate.selector;
        if sel.is_null() {
            return Err(CpuFault::gp(source.ext()));
        }
        let raw = self.fetch_descriptor(bus, sel, Exception::GeneralProtection)?;
        let desc = Descriptor::parse(raw, self.model());
        if !desc.is_code() || desc.dpl() > cpl {
            return Err(CpuFault::gp(sel.error_code() | source.ext()));
        }
        if !desc.present() {
            return Err(CpuFault::np(sel.error_code() | source.ext()));
        }
        let w = if gate.kind.is_32bit() { Width::Dword } else { Width::Word };
        let offset = if w == Width::Dword { gate.offset } else { gate.offset & 0xFFFF };
        let clear_if = matches!(gate.kind, SystemType::IntGate16 | SystemType::IntGate32);

        if !desc.conforming() && desc.dpl() < cpl {
            self.interrupt_inner_privilege(bus, sel, desc, offset, w, clear_if, source)
        } else if self.v86_mode() {
            Err(CpuFault::gp(sel.error_code()))
        } else {
            self.interrupt_same_privilege(bus, sel, desc, offset, w, clear_if, source)
        }
    }

    /// Ring stack for privilege level `dpl` from the current TSS.
    pub(crate) fn tss_stack<B: SystemBus>(&mut self, bus: &mut B, dpl: u8) -> Fallible<(Selector, u32)> {
        let tr = self.tr;
        let Some(tss32) = self.tr_tss_is_32bit() else {
            return Err(CpuFault::ts(tr.selector.error_code()));
        };
        let (sp_off, ss_off, sp_len) = if tss32 {
            (4 + 8 * u32::from(dpl), 8 + 8 * u32::from(dpl), 4)
        } else {
            (2 + 4 * u32::from(dpl), 4 + 4 * u32::from(dpl), 2)
        };
        if ss_off + 1 > tr.desc.limit {
            return Err(CpuFault::ts(tr.selector.error_code()));
        }
        let sp = self.read_linear(bus, tr.desc.base.wrapping_add(sp_off), sp_len)?;
        let ss = self.read_linear(bus, tr.desc.base.wrapping_add(ss_off), 2)?;
        Ok((Selector(ss as u16), sp))
    }

    /// Validates the stack a privilege change switches to. Faults are #TS, except a
    /// not-present segment which raises #SS.
    pub(crate) fn check_inner_stack<B: SystemBus>(&mut self, bus: &mut B, sel: Selector, dpl: u8, ext: u16) -> Fallible<SegReg> {
        if sel.is_null() {
            return Err(CpuFault::ts(ext));
        }
        self.check_ss(bus, sel, dpl, Exception::InvalidTss).map_err(|e| match e {
            CpuFault::Exception(mut ex) if ex.vector == Exception::InvalidTss.vector() => {
                ex.error_code = ex.error_code.map(|c| c | ext);
                CpuFault::Exception(ex)
            }
            other => other,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn interrupt_inner_privilege<B: SystemBus>(
        &mut self,
        bus: &mut B,
        sel: Selector,
        desc: Descriptor,
        offset: u32,
        w: Width,
        clear_if: bool,
        source: IntSource,
    ) -> Fallible {
        let v86 = self.v86_mode();
        let new_cpl = desc.dpl();
        if v86 && new_cpl != 0 {
            return Err(CpuFault::gp(sel.error_code()));
        }
        let (ss_sel, sp) = self.tss_stack(bus, new_cpl)?;
        let ss = self.check_inner_stack(bus, ss_sel, new_cpl, source.ext())?;
        if offset > desc.limit {
            return Err(CpuFault::gp(0));
        }

        let mut frame = Vec::with_capacity(10);
        if v86 {
            for seg in [Seg::Gs, Seg::Fs, Seg::Ds, Seg::Es] {
                frame.push(u32::from(self.sreg(seg).selector.0));
            }
        }
        frame.push(u32::from(self.sreg(Seg::Ss).selector.0));
        frame.push(self.regs[Gpr::Esp as usize]);
        frame.push(self.flags_image());
        frame.push(u32::from(self.sreg(Seg::Cs).selector.0));
        frame.push(self.eip);
        if let Some(code) = source.error_code() {
            frame.push(u32::from(code));
        }
        let new_sp = self.write_frame(bus, &ss, sp, &frame, w, false)?;

        self.sregs[Seg::Ss.index()] = ss;
        self.set_sp(new_sp);
        if v86 {
            for seg in [Seg::Gs, Seg::Fs, Seg::Ds, Seg::Es] {
                self.sregs[seg.index()] = SegReg::invalid(0);
            }
        }
        self.flags.remove(Eflags::TF | Eflags::NT | Eflags::RF | Eflags::VM);
        if clear_if {
            self.flags.remove(Eflags::IF);
        }
        self.commit_cs(bus, sel, desc, new_cpl, offset)?;
        self.extra_cycles += if v86 {
            self.config.timings.interrupt_v86
        } else {
            self.config.timings.interrupt_inner
        };
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn interrupt_same_privilege<B: SystemBus>(
        &mut self,
        bus: &mut B,
        sel: Selector,
        desc: Descriptor,
        offset: u32,
        w: Width,
        clear_if: bool,
        source: IntSource,
    ) -> Fallible {
        if offset > desc.limit {
            return Err(CpuFault::gp(0));
        }
        let cpl = self.cpl();
        let mut frame = vec![
            self.flags_image(),
            u32::from(self.sreg(Seg::Cs).selector.0),
            self.eip,
        ];
        if let Some(code) = source.error_code() {
            frame.push(u32::from(code));
        }
        self.push_values(bus, &frame, w)?;
        self.flags.remove(Eflags::TF | Eflags::NT | Eflags::RF);
        if clear_if {
            self.flags.remove(Eflags::IF);
        }
        self.commit_cs(bus, sel, desc, cpl, offset)
    }

    pub(crate) fn iret<B: SystemBus>(&mut self, bus: &mut B, op32: bool) -> Fallible {
        self.pending.nmi_blocked = false;
        let w = Width::of(op32);
        if !self.protected_mode() || self.v86_mode() {
            if self.v86_mode() && self.flags.iopl() < 3 {
                return Err(CpuFault::gp(0));
            }
            let eip = self.stack_peek(bus, 0, w)?;
            let cs = self.stack_peek(bus, w.bytes(), w)?;
            let flags = self.stack_peek(bus, 2 * w.bytes(), w)?;
            if eip > self.sreg(Seg::Cs).desc.limit {
                return Err(CpuFault::gp(0));
            }
            self.release_stack(3 * w.bytes());
            self.load_segment_real(Seg::Cs, cs as u16);
            self.eip = eip;
            if self.v86_mode() {
                // IOPL and VM are out of reach from virtual-8086 mode.
                let keep = Eflags::IOPL | Eflags::VM;
                let bits = (flags & !keep.bits()) | (self.flags.bits() & keep.bits());
                self.write_flags(bits, op32);
            } else {
                self.write_flags(flags, op32);
            }
            return Ok(());
        }
        if self.flags.contains(Eflags::NT) {
            let link = self.read_linear(bus, self.tr.desc.base, 2)? as u16;
            return self.task_switch(bus, Selector(link), TaskSource::Iret, None);
        }
        self.iret_pmode(bus, op32)
    }

    fn iret_pmode<B: SystemBus>(&mut self, bus: &mut B, op32: bool) -> Fallible {
        let w = Width::of(op32);
        let n = w.bytes();
        let eip = self.stack_peek(bus, 0, w)?;
        let cs_sel = Selector(self.stack_peek(bus, n, w)? as u16);
        let flags = self.stack_peek(bus, 2 * n, w)?;
        let cpl = self.cpl();

        if op32 && flags & Eflags::VM.bits() != 0 && cpl == 0 {
            return self.iret_to_v86(bus, eip, cs_sel, flags);
        }

        let desc = self.check_code_segment(bus, cs_sel, Exception::GeneralProtection)?;
        let rpl = cs_sel.rpl();
        if rpl < cpl
            || (desc.conforming() && desc.dpl() > rpl)
            || (!desc.conforming() && desc.dpl() != rpl)
        {
            return Err(CpuFault::gp(cs_sel.error_code()));
        }
        if !desc.present() {
            return Err(CpuFault::np(cs_sel.error_code()));
        }
        let eip = if op32 { eip } else { eip & 0xFFFF };

        if rpl == cpl {
            if eip > desc.limit {
                return Err(CpuFault::gp(0));
            }
            self.commit_cs(bus, cs_sel, desc, rpl, eip)?;
            self.release_stack(3 * n);
            self.write_flags(flags, op32);
            return Ok(());
        }

        let new_sp = self.stack_peek(bus, 3 * n, w)?;
        let ss_sel = Selector(self.stack_peek(bus, 4 * n, w)? as u16);
        let ss = self.check_ss(bus, ss_sel, rpl, Exception::GeneralProtection)?;
        if eip > desc.limit {
            return Err(CpuFault::gp(0));
        }
        // Flags are written while still at the old privilege level.
        self.write_flags(flags, op32);
        self.commit_cs(bus, cs_sel, desc, rpl, eip)?;
        self.sregs[Seg::Ss.index()] = ss;
        if op32 || self.stack_big() {
            self.set_sp(new_sp);
        } else {
            self.set_sp(new_sp & 0xFFFF);
        }
        self.invalidate_data_segments(rpl);
        self.extra_cycles += self.config.timings.return_outer;
        Ok(())
    }

    fn iret_to_v86<B: SystemBus>(&mut self, bus: &mut B, eip: u32, cs: Selector, flags: u32) -> Fallible {
        let mut vals = [0u32; 6];
        for (i, slot) in vals.iter_mut().enumerate() {
            *slot = self.stack_peek(bus, 12 + 4 * i as u32, Width::Dword)?;
        }
        let [esp, ss, es, ds, fs, gs] = vals;
        tracing::debug!(cs = cs.0, eip, "IRET to virtual-8086 mode");
        self.flags = Eflags::from_bits_truncate(flags) | Eflags::RESERVED1;
        for (seg, sel) in [
            (Seg::Cs, cs.0),
            (Seg::Ss, ss as u16),
            (Seg::Es, es as u16),
            (Seg::Ds, ds as u16),
            (Seg::Fs, fs as u16),
            (Seg::Gs, gs as u16),
        ] {
            self.load_segment_real(seg, sel);
        }
        self.regs[Gpr::Esp as usize] = esp;
        self.eip = eip & 0xFFFF;
        self.bus_unit.invalidate_pq();
        Ok(())
    }

    /// Exception entry used by the stepping loop.
    pub(crate) fn deliver_exception<B: SystemBus>(&mut self, bus: &mut B, vector: u8, error_code: Option<u16>) -> Fallible {
        let error_code = if self.protected_mode() { error_code } else { None };
        self.interrupt(bus, vector, IntSource::Exception { error_code })
    }

    pub(crate) fn software_interrupt<B: SystemBus>(&mut self, bus: &mut B, vector: u8) -> Fallible {
        self.interrupt(bus, vector, IntSource::Software)
    }
}

/// Error code of a fault on the IDT entry of `vector`.
pub(crate) fn idt_error_code(vector: u8, ext: bool) -> u16 {
    u16::from(vector) * 8 + 2 + u16::from(ext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::fault;

    #[test]
    fn idt_error_codes_carry_the_table_bit() {
        assert_eq!(idt_error_code(0x21, false), 0x10A);
        assert_eq!(idt_error_code(0x0D, true), 0x6B);
    }

    #[test]
    fn only_exceptions_carry_error_codes() {
        assert_eq!(IntSource::Software.error_code(), None);
        assert_eq!(IntSource::External.ext(), 1);
        let src = IntSource::Exception { error_code: Some(0x10) };
        assert_eq!(src.error_code(), Some(0x10));
        assert_eq!(fault(Exception::GeneralProtection, 8), CpuFault::gp(8));
    }
}
