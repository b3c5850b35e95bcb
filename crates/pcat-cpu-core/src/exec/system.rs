//! System instructions: descriptor table registers, LDTR/TR, access rights queries,
//! the machine status word, control and debug registers, coprocessor escapes.

use pcat_cpu_decoder::{Instruction, Seg};

use crate::cpu::{Cpu, SegReg, TableReg, Width};
use crate::descriptor::{Descriptor, Selector, SystemType};
use crate::fault::{CpuFault, Exception, Fallible};
use crate::flags::{Cr0, Eflags};
use crate::paging::AccessKind;
use crate::SystemBus;

use super::operand::Operand;

const TSS_BUSY: u8 = 1 << 1;

impl Cpu {
    /// Protected-mode-only instructions raise #UD in real and virtual-8086 mode.
    fn require_protected(&self) -> Fallible {
        if !self.protected_mode() || self.v86_mode() {
            return Err(CpuFault::ud());
        }
        Ok(())
    }

    fn require_cpl0(&self) -> Fallible {
        if self.protected_mode() && self.cpl() != 0 {
            return Err(CpuFault::gp(0));
        }
        Ok(())
    }

    /// Stores a selector-sized result: zero-extended into a 32-bit register, a word in
    /// memory.
    fn store_selector<B: SystemBus>(&mut self, bus: &mut B, ins: &Instruction, val: u32) -> Fallible {
        match self.rm_operand(ins) {
            op @ Operand::Reg(_) => self.write_operand(bus, op, Width::of(ins.op32), val),
            op => self.write_operand(bus, op, Width::Word, val),
        }
    }

    pub(super) fn exec_sldt_str<B: SystemBus>(&mut self, bus: &mut B, ins: &Instruction, task: bool) -> Fallible {
        self.require_protected()?;
        let sel = if task { self.tr.selector } else { self.ldtr.selector };
        self.store_selector(bus, ins, u32::from(sel.0))
    }

    pub(super) fn exec_lldt<B: SystemBus>(&mut self, bus: &mut B, ins: &Instruction) -> Fallible {
        self.require_protected()?;
        self.require_cpl0()?;
        let sel = Selector(self.read_rm(bus, ins, Width::Word)? as u16);
        self.load_ldtr(bus, sel, Exception::GeneralProtection)
    }

    pub(super) fn exec_ltr<B: SystemBus>(&mut self, bus: &mut B, ins: &Instruction) -> Fallible {
        self.require_protected()?;
        self.require_cpl0()?;
        let sel = Selector(self.read_rm(bus, ins, Width::Word)? as u16);
        if sel.is_null() {
            return Err(CpuFault::gp(0));
        }
        if sel.is_local() {
            return Err(CpuFault::gp(sel.error_code()));
        }
        let raw = self.fetch_descriptor(bus, sel, Exception::GeneralProtection)?;
        let mut desc = Descriptor::parse(raw, self.model());
        if !desc.system_type(self.model()).is_some_and(SystemType::is_available_tss) {
            return Err(CpuFault::gp(sel.error_code()));
        }
        if !desc.present() {
            return Err(CpuFault::np(sel.error_code()));
        }
        desc.access |= TSS_BUSY;
        let addr = self.descriptor_addr(sel, Exception::GeneralProtection)?;
        self.write_linear(bus, addr.wrapping_add(5), 1, u32::from(desc.access))?;
        tracing::debug!(selector = sel.0, base = desc.base, limit = desc.limit, "task register loaded");
        self.tr = SegReg { selector: sel, desc };
        Ok(())
    }

    /// Descriptor named by `sel` for LAR/LSL/VERR/VERW, or `None` when the selector is
    /// null or outside its table. These instructions report that through ZF.
    fn probe_descriptor<B: SystemBus>(&mut self, bus: &mut B, sel: Selector) -> Fallible<Option<(u64, Descriptor)>> {
        if sel.is_null() {
            return Ok(None);
        }
        let Ok(addr) = self.descriptor_addr(sel, Exception::GeneralProtection) else {
            return Ok(None);
        };
        let raw = self.read_linear_u64(bus, addr)?;
        Ok(Some((raw, Descriptor::parse(raw, self.model()))))
    }

    /// Data and non-conforming code segments are only visible at or above their DPL.
    fn visible(&self, sel: Selector, desc: &Descriptor) -> bool {
        if desc.is_code() && desc.conforming() {
            return true;
        }
        desc.dpl() >= self.cpl() && desc.dpl() >= sel.rpl()
    }

    pub(super) fn exec_verify<B: SystemBus>(&mut self, bus: &mut B, ins: &Instruction, write: bool) -> Fallible {
        self.require_protected()?;
        let sel = Selector(self.read_rm(bus, ins, Width::Word)? as u16);
        let ok = match self.probe_descriptor(bus, sel)? {
            Some((_, desc)) if desc.is_segment() => {
                let usable = if write { desc.writable() } else { desc.readable() };
                usable && self.visible(sel, &desc)
            }
            _ => false,
        };
        self.flags.set(Eflags::ZF, ok);
        Ok(())
    }

    pub(super) fn exec_lar_lsl<B: SystemBus>(&mut self, bus: &mut B, ins: &Instruction, limit: bool) -> Fallible {
        self.require_protected()?;
        let sel = Selector(self.read_rm(bus, ins, Width::Word)? as u16);
        let Some((raw, desc)) = self.probe_descriptor(bus, sel)? else {
            self.flags.remove(Eflags::ZF);
            return Ok(());
        };
        let type_ok = desc.is_segment()
            || match desc.system_type(self.model()) {
                Some(SystemType::Ldt) => true,
                Some(t) if t.is_tss() => true,
                Some(SystemType::CallGate16 | SystemType::CallGate32 | SystemType::TaskGate) => !limit,
                _ => false,
            };
        if !type_ok || !self.visible(sel, &desc) {
            self.flags.remove(Eflags::ZF);
            return Ok(());
        }
        let w = Width::of(ins.op32);
        let val = if limit {
            desc.limit
        } else if self.is_386() {
            (raw >> 32) as u32 & 0x00F0_FF00
        } else {
            (raw >> 32) as u32 & 0xFF00
        };
        self.set_reg(ins.reg(), w, val);
        self.flags.insert(Eflags::ZF);
        Ok(())
    }

    pub(super) fn exec_arpl<B: SystemBus>(&mut self, bus: &mut B, ins: &Instruction) -> Fallible {
        self.require_protected()?;
        let target = self.rm_operand(ins);
        let dest = self.read_operand(bus, target, Width::Word)?;
        let src_rpl = self.reg(ins.reg(), Width::Word) & 3;
        if dest & 3 < src_rpl {
            self.write_operand(bus, target, Width::Word, (dest & !3) | src_rpl)?;
            self.flags.insert(Eflags::ZF);
        } else {
            self.flags.remove(Eflags::ZF);
        }
        Ok(())
    }

    /// SGDT/SIDT. The 286 stores 0xFF in the unused top base byte.
    pub(super) fn exec_store_table<B: SystemBus>(&mut self, bus: &mut B, ins: &Instruction, idt: bool) -> Fallible {
        let table = if idt { self.idtr } else { self.gdtr };
        let (seg, off) = self.effective_address(ins);
        let base = if !self.is_386() {
            (table.base & 0x00FF_FFFF) | 0xFF00_0000
        } else if ins.op32 {
            table.base
        } else {
            table.base & 0x00FF_FFFF
        };
        self.seg_check(self.sreg(seg), seg == Seg::Ss, off, 6, AccessKind::Write)?;
        self.write(bus, seg, off, Width::Word, u32::from(table.limit))?;
        self.write(bus, seg, off.wrapping_add(2), Width::Dword, base)
    }

    /// LGDT/LIDT. A 16-bit operand loads a 24-bit base.
    pub(super) fn exec_load_table<B: SystemBus>(&mut self, bus: &mut B, ins: &Instruction, idt: bool) -> Fallible {
        self.require_cpl0()?;
        let (seg, off) = self.effective_address(ins);
        let limit = self.read(bus, seg, off, Width::Word)? as u16;
        let base = self.read(bus, seg, off.wrapping_add(2), Width::Dword)?;
        let base = if ins.op32 && self.is_386() { base } else { base & 0x00FF_FFFF };
        let table = TableReg { base, limit };
        tracing::debug!(idt, base, limit, "descriptor table register loaded");
        if idt {
            self.idtr = table;
        } else {
            self.gdtr = table;
        }
        Ok(())
    }

    pub(super) fn exec_smsw<B: SystemBus>(&mut self, bus: &mut B, ins: &Instruction) -> Fallible {
        let msw = if self.is_386() {
            self.cr0.bits()
        } else {
            0xFFF0 | (self.cr0 & Cr0::MSW).bits()
        };
        self.store_selector(bus, ins, msw & if ins.op32 { 0xFFFF_FFFF } else { 0xFFFF })
    }

    /// LMSW writes PE, MP, EM and TS. It can set PE but not clear it.
    pub(super) fn exec_lmsw<B: SystemBus>(&mut self, bus: &mut B, ins: &Instruction) -> Fallible {
        self.require_cpl0()?;
        let val = self.read_rm(bus, ins, Width::Word)?;
        let msw = Cr0::from_bits_truncate(val) & Cr0::MSW;
        let keep_pe = self.cr0 & Cr0::PE;
        let cr0 = (self.cr0 - Cr0::MSW) | msw | keep_pe;
        self.set_cr0(cr0);
        Ok(())
    }

    pub(super) fn exec_clts(&mut self) -> Fallible {
        self.require_cpl0()?;
        self.cr0.remove(Cr0::TS);
        Ok(())
    }

    fn rm_register(ins: &Instruction) -> u8 {
        ins.modrm.map_or(0, |m| m.rm)
    }

    pub(super) fn exec_mov_from_cr(&mut self, ins: &Instruction) -> Fallible {
        self.require_cpl0()?;
        let val = match ins.reg() {
            0 => self.cr0.bits(),
            2 => self.cr2,
            3 => self.mmu.cr3(),
            _ => return Err(CpuFault::ud()),
        };
        self.set_reg(Self::rm_register(ins), Width::Dword, val);
        Ok(())
    }

    pub(super) fn exec_mov_to_cr(&mut self, ins: &Instruction) -> Fallible {
        self.require_cpl0()?;
        let val = self.reg(Self::rm_register(ins), Width::Dword);
        match ins.reg() {
            0 => {
                let cr0 = Cr0::from_bits_truncate(val);
                if cr0.contains(Cr0::PG) && !cr0.contains(Cr0::PE) {
                    return Err(CpuFault::gp(0));
                }
                self.set_cr0(cr0);
                self.mmu.flush();
                self.bus_unit.invalidate_pq();
            }
            2 => self.cr2 = val,
            3 => self.mmu.set_cr3(val & 0xFFFF_F000),
            _ => return Err(CpuFault::ud()),
        }
        Ok(())
    }

    /// DR4 and DR5 alias DR6 and DR7.
    fn debug_register(ins: &Instruction) -> usize {
        match ins.reg() {
            4 => 6,
            5 => 7,
            r => usize::from(r),
        }
    }

    pub(super) fn exec_mov_from_dr(&mut self, ins: &Instruction) -> Fallible {
        self.require_cpl0()?;
        let val = self.dr[Self::debug_register(ins)];
        self.set_reg(Self::rm_register(ins), Width::Dword, val);
        Ok(())
    }

    pub(super) fn exec_mov_to_dr(&mut self, ins: &Instruction) -> Fallible {
        self.require_cpl0()?;
        self.dr[Self::debug_register(ins)] = self.reg(Self::rm_register(ins), Width::Dword);
        Ok(())
    }

    /// No coprocessor is attached: escapes only trap when CR0 asks for emulation or a
    /// task switch left TS set.
    pub(super) fn exec_esc(&self) -> Fallible {
        if self.cr0.intersects(Cr0::EM | Cr0::TS) {
            return Err(CpuFault::nm());
        }
        Ok(())
    }

    pub(super) fn exec_wait(&self) -> Fallible {
        if self.cr0.contains(Cr0::MP | Cr0::TS) {
            return Err(CpuFault::nm());
        }
        Ok(())
    }
}
