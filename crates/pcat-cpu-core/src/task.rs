//! Hardware task switching through TSS descriptors and task gates.
//!
//! A switch runs in two halves around a commit point. Everything before it (new TSS
//! checks, reading the new image, saving into the old TSS) can fault with the old task
//! intact. From the commit on TR, CR0.TS and the busy bits belong to the new task, and
//! faults raised while its segments are validated are delivered in the new context.

use pcat_cpu_decoder::Seg;

use crate::cpu::{Cpu, SegReg, Width};
use crate::descriptor::{Descriptor, Selector, SystemType};
use crate::fault::{CpuFault, Exception, Fallible};
use crate::flags::{Cr0, Eflags};
use crate::segment::fault;
use crate::SystemBus;

/// Minimum limits of a 16-bit TSS that is switched to, and of one switched away from.
const TSS16_MIN_LIMIT: u32 = 0x2B;
const TSS16_MIN_OLD_LIMIT: u32 = 0x29;
const TSS32_MIN_LIMIT: u32 = 0x67;
const TSS32_MIN_OLD_LIMIT: u32 = 0x5F;

const TSS_BUSY: u8 = 1 << 1;

/// Instruction or event that started a task switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskSource {
    Jmp,
    Call,
    /// Interrupt or exception through a task gate.
    Int,
    /// IRET with NT set.
    Iret,
}

impl TaskSource {
    /// CALL and INT nest the new task inside the old one.
    fn nests(self) -> bool {
        matches!(self, TaskSource::Call | TaskSource::Int)
    }
}

/// Field offsets of one TSS format.
struct TssLayout {
    eip: u32,
    eflags: u32,
    regs: u32,
    /// ES, CS, SS, DS, then FS and GS when present.
    sregs: u32,
    sreg_count: usize,
    ldt: u32,
    cr3: Option<u32>,
    width: Width,
}

const TSS16: TssLayout = TssLayout {
    eip: 0x0E,
    eflags: 0x10,
    regs: 0x12,
    sregs: 0x22,
    sreg_count: 4,
    ldt: 0x2A,
    cr3: None,
    width: Width::Word,
};

const TSS32: TssLayout = TssLayout {
    eip: 0x20,
    eflags: 0x24,
    regs: 0x28,
    sregs: 0x48,
    sreg_count: 6,
    ldt: 0x60,
    cr3: Some(0x1C),
    width: Width::Dword,
};

impl TssLayout {
    fn of(tss32: bool) -> &'static TssLayout {
        if tss32 {
            &TSS32
        } else {
            &TSS16
        }
    }

    fn stride(&self) -> u32 {
        self.width.bytes()
    }
}

/// Register state read out of the incoming TSS before the commit point.
#[derive(Debug, Clone, Default)]
struct TssImage {
    eip: u32,
    eflags: u32,
    regs: [u32; 8],
    /// Indexed like [`Seg::ALL`].
    sregs: [u16; 6],
    ldt: u16,
    cr3: Option<u32>,
}

/// TSS segment register order to [`Seg`].
const TSS_SEG_ORDER: [Seg; 6] = [Seg::Es, Seg::Cs, Seg::Ss, Seg::Ds, Seg::Fs, Seg::Gs];

impl Cpu {
    /// Whether the TSS in TR has the 386 layout, or `None` while TR is not loaded.
    ///
    /// LTR, task switches and state restore only ever put a TSS descriptor in TR, so
    /// any other type is a broken invariant and aborts.
    pub(crate) fn tr_tss_is_32bit(&self) -> Option<bool> {
        let tr = &self.tr;
        if !tr.desc.valid {
            return None;
        }
        match tr.desc.system_type(self.model()) {
            Some(kind) if kind.is_tss() => Some(kind.is_32bit()),
            kind => {
                tracing::error!(
                    selector = tr.selector.0,
                    access = tr.desc.access,
                    ?kind,
                    eip = self.eip,
                    "task register does not hold a TSS"
                );
                panic!(
                    "task register {:#06x} holds a non-TSS descriptor (access {:#04x})",
                    tr.selector.0, tr.desc.access
                );
            }
        }
    }

    pub(crate) fn task_switch<B: SystemBus>(
        &mut self,
        bus: &mut B,
        sel: Selector,
        source: TaskSource,
        error_code: Option<u16>,
    ) -> Fallible {
        self.extra_cycles += self.config.timings.task_switch;
        let model = self.model();
        let vector = if source == TaskSource::Iret {
            Exception::InvalidTss
        } else {
            Exception::GeneralProtection
        };

        if sel.is_local() {
            return Err(fault(vector, sel.error_code()));
        }
        let raw = self.fetch_descriptor(bus, sel, vector)?;
        let mut desc = Descriptor::parse(raw, model);
        let kind = desc.system_type(model);
        let type_ok = match source {
            TaskSource::Iret => kind.is_some_and(|t| t.is_busy_tss()),
            _ => kind.is_some_and(|t| t.is_available_tss()),
        };
        if !type_ok {
            return Err(fault(vector, sel.error_code()));
        }
        if !desc.present() {
            return Err(CpuFault::np(sel.error_code()));
        }

        let new_layout = TssLayout::of(kind.is_some_and(SystemType::is_32bit));
        let min_new = if new_layout.cr3.is_some() { TSS32_MIN_LIMIT } else { TSS16_MIN_LIMIT };
        if desc.limit < min_new {
            return Err(CpuFault::ts(sel.error_code()));
        }
        let old_tr = self.tr;
        let Some(old_tss32) = self.tr_tss_is_32bit() else {
            return Err(CpuFault::ts(old_tr.selector.error_code()));
        };
        let old_layout = TssLayout::of(old_tss32);
        let min_old = if old_tss32 { TSS32_MIN_OLD_LIMIT } else { TSS16_MIN_OLD_LIMIT };
        if old_tr.desc.limit < min_old {
            return Err(CpuFault::ts(old_tr.selector.error_code()));
        }
        tracing::debug!(
            from = old_tr.selector.0,
            to = sel.0,
            ?source,
            "task switch: limits checked"
        );

        let image = self.read_tss(bus, desc.base, new_layout)?;

        if matches!(source, TaskSource::Jmp | TaskSource::Iret) {
            self.set_tss_busy(bus, old_tr.selector, old_tr.desc.access & !TSS_BUSY)?;
        }
        let mut old_flags = self.flags_image();
        if source == TaskSource::Iret {
            old_flags &= !Eflags::NT.bits();
        }
        self.save_tss(bus, old_tr.desc.base, old_layout, old_flags)?;
        if source.nests() {
            self.write_linear(bus, desc.base, 2, u32::from(old_tr.selector.0))?;
        }
        tracing::debug!(tss = old_tr.selector.0, "task switch: old state saved");

        // Commit point.
        if source != TaskSource::Iret {
            desc.access |= TSS_BUSY;
            self.set_tss_busy(bus, sel, desc.access)?;
        }
        self.tr = SegReg { selector: sel, desc };
        self.cr0.insert(Cr0::TS);
        self.load_tss_image(&image, new_layout);
        if source.nests() {
            self.flags.insert(Eflags::NT);
        }
        tracing::debug!(tss = sel.0, eip = image.eip, "task switch: committed");

        self.validate_task_segments(bus, &image)?;

        if let Some(code) = error_code {
            self.push(bus, u32::from(code), new_layout.width)?;
        }
        if self.eip > self.sreg(Seg::Cs).desc.limit {
            return Err(CpuFault::gp(0));
        }
        self.bus_unit.invalidate_pq();
        Ok(())
    }

    fn read_tss<B: SystemBus>(&mut self, bus: &mut B, base: u32, layout: &TssLayout) -> Fallible<TssImage> {
        let n = layout.stride();
        let mut image = TssImage {
            eip: self.read_linear(bus, base + layout.eip, n)?,
            eflags: self.read_linear(bus, base + layout.eflags, n)?,
            ..TssImage::default()
        };
        for (i, slot) in image.regs.iter_mut().enumerate() {
            *slot = self.read_linear(bus, base + layout.regs + n * i as u32, n)?;
        }
        for (i, seg) in TSS_SEG_ORDER.iter().take(layout.sreg_count).enumerate() {
            let sel = self.read_linear(bus, base + layout.sregs + n * i as u32, 2)?;
            image.sregs[seg.index()] = sel as u16;
        }
        image.ldt = self.read_linear(bus, base + layout.ldt, 2)? as u16;
        if let Some(off) = layout.cr3 {
            image.cr3 = Some(self.read_linear(bus, base + off, 4)?);
        }
        Ok(image)
    }

    fn save_tss<B: SystemBus>(&mut self, bus: &mut B, base: u32, layout: &TssLayout, flags: u32) -> Fallible {
        let n = layout.stride();
        let mask = layout.width.mask();
        self.write_linear(bus, base + layout.eip, n, self.eip & mask)?;
        self.write_linear(bus, base + layout.eflags, n, flags & mask)?;
        for i in 0..8 {
            let val = self.regs[i] & mask;
            self.write_linear(bus, base + layout.regs + n * i as u32, n, val)?;
        }
        for (i, seg) in TSS_SEG_ORDER.iter().take(layout.sreg_count).enumerate() {
            let sel = u32::from(self.sreg(*seg).selector.0);
            self.write_linear(bus, base + layout.sregs + n * i as u32, 2, sel)?;
        }
        Ok(())
    }

    fn set_tss_busy<B: SystemBus>(&mut self, bus: &mut B, sel: Selector, access: u8) -> Fallible {
        let addr = self.descriptor_addr(sel, Exception::InvalidTss)?;
        self.write_linear(bus, addr + 5, 1, u32::from(access))
    }

    /// Register file from the new TSS. Segment registers are selected but unusable
    /// until validated.
    fn load_tss_image(&mut self, image: &TssImage, layout: &TssLayout) {
        if layout.width == Width::Dword {
            self.regs = image.regs;
            self.flags = Eflags::from_bits_truncate(image.eflags) | Eflags::RESERVED1;
        } else {
            for (i, &val) in image.regs.iter().enumerate() {
                self.set_reg(i as u8, Width::Word, val);
            }
            self.flags = Eflags::from_bits_truncate(image.eflags & 0xFFFF) | Eflags::RESERVED1;
        }
        self.eip = image.eip;
        self.fault_eip = image.eip;
        for seg in Seg::ALL {
            self.sregs[seg.index()] = SegReg::invalid(image.sregs[seg.index()]);
        }
        self.ldtr = SegReg::invalid(image.ldt);
        if let Some(cr3) = image.cr3 {
            self.mmu.set_cr3(cr3);
        }
    }

    /// Post-commit loads: LDTR, SS, the data registers, then CS. Data segments that fail
    /// are left selected but invalid; the fault surfaces on their first use.
    fn validate_task_segments<B: SystemBus>(&mut self, bus: &mut B, image: &TssImage) -> Fallible {
        let ts = Exception::InvalidTss;
        self.load_ldtr(bus, Selector(image.ldt), ts)?;

        if self.flags.contains(Eflags::VM) && self.is_386() {
            for seg in Seg::ALL {
                self.load_segment_real(seg, image.sregs[seg.index()]);
            }
            tracing::debug!("task switch: entered virtual-8086 task");
            return Ok(());
        }

        let cs_sel = Selector(image.sregs[Seg::Cs.index()]);
        let cpl = cs_sel.rpl();
        self.load_ss(bus, Selector(image.sregs[Seg::Ss.index()]), cpl, ts)?;

        for seg in [Seg::Ds, Seg::Es, Seg::Fs, Seg::Gs] {
            let sel = Selector(image.sregs[seg.index()]);
            if let Err(err) = self.load_data_segment(bus, seg, sel, cpl, ts) {
                tracing::debug!(seg = seg.name(), selector = sel.0, %err, "task switch: segment left invalid");
                self.sregs[seg.index()] = SegReg::invalid(sel.0);
            }
        }

        let desc = self.check_code_segment(bus, cs_sel, ts)?;
        if (desc.conforming() && desc.dpl() > cpl) || (!desc.conforming() && desc.dpl() != cpl) {
            return Err(CpuFault::ts(cs_sel.error_code()));
        }
        if !desc.present() {
            return Err(CpuFault::np(cs_sel.error_code()));
        }
        let eip = self.eip;
        self.commit_cs(bus, cs_sel, desc, cpl, eip)?;
        tracing::debug!(cs = cs_sel.0, "task switch: segments validated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CpuConfig;
    use pcat_cpu_decoder::CpuModel;

    #[test]
    fn layouts_cover_the_minimum_limits() {
        assert_eq!(TSS16.ldt + 1, TSS16_MIN_LIMIT);
        assert_eq!(TSS16.sregs + 2 * 4 - 1, TSS16_MIN_OLD_LIMIT);
        assert_eq!(TSS32.sregs + 4 * 6 - 1, TSS32_MIN_OLD_LIMIT);
        assert_eq!(TSS32.regs + 4 * 8, TSS32.sregs);
        assert_eq!(TSS16.regs + 2 * 8, TSS16.sregs);
    }

    #[test]
    fn unloaded_task_register_has_no_layout() {
        let cpu = Cpu::new(CpuConfig::new(CpuModel::I80386));
        assert_eq!(cpu.tr_tss_is_32bit(), None);
    }

    #[test]
    fn task_register_width_follows_the_tss_type() {
        let mut cpu = Cpu::new(CpuConfig::new(CpuModel::I80386));
        cpu.tr = SegReg {
            selector: Selector(0x28),
            desc: Descriptor::new(0x3000, 0x67, 0x80 | SystemType::Tss32Busy as u8, 0),
        };
        assert_eq!(cpu.tr_tss_is_32bit(), Some(true));
        cpu.tr.desc.access = 0x80 | SystemType::Tss16Busy as u8;
        assert_eq!(cpu.tr_tss_is_32bit(), Some(false));
    }

    #[test]
    #[should_panic(expected = "non-TSS descriptor")]
    fn task_register_holding_a_gate_aborts() {
        let mut cpu = Cpu::new(CpuConfig::new(CpuModel::I80386));
        cpu.tr = SegReg {
            selector: Selector(0x28),
            desc: Descriptor::new(0x3000, 0x67, 0x80 | SystemType::CallGate32 as u8, 0),
        };
        cpu.tr_tss_is_32bit();
    }

    #[test]
    fn nesting_sources_set_the_back_link() {
        assert!(TaskSource::Call.nests());
        assert!(TaskSource::Int.nests());
        assert!(!TaskSource::Jmp.nests());
        assert!(!TaskSource::Iret.nests());
    }
}
