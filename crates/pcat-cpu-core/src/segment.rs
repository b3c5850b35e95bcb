//! Selector resolution and segment register loads.

use pcat_cpu_decoder::Seg;

use crate::cpu::{Cpu, SegReg};
use crate::descriptor::{Descriptor, Selector, SystemType, ACC_ACCESSED};
use crate::fault::{CpuFault, Exception, Fallible};
use crate::SystemBus;

pub(crate) fn fault(vector: Exception, code: u16) -> CpuFault {
    CpuFault::new(vector, Some(code))
}

impl Cpu {
    /// Linear address of the table entry `sel` names. Fails with `vector` if the
    /// index lies beyond the table limit or there is no usable LDT.
    pub(crate) fn descriptor_addr(&self, sel: Selector, vector: Exception) -> Fallible<u32> {
        let (base, limit) = if sel.is_local() {
            if !self.ldtr.desc.valid || self.ldtr.selector.is_null() {
                return Err(fault(vector, sel.error_code()));
            }
            (self.ldtr.desc.base, self.ldtr.desc.limit)
        } else {
            (self.gdtr.base, u32::from(self.gdtr.limit))
        };
        let offset = sel.table_offset();
        if offset + 7 > limit {
            return Err(fault(vector, sel.error_code()));
        }
        Ok(base.wrapping_add(offset))
    }

    pub(crate) fn fetch_descriptor<B: SystemBus>(
        &mut self,
        bus: &mut B,
        sel: Selector,
        vector: Exception,
    ) -> Fallible<u64> {
        let addr = self.descriptor_addr(sel, vector)?;
        self.read_linear_u64(bus, addr)
    }

    /// Sets the accessed bit in the table entry and the cached copy.
    pub(crate) fn mark_accessed<B: SystemBus>(
        &mut self,
        bus: &mut B,
        sel: Selector,
        desc: &mut Descriptor,
    ) -> Fallible {
        if desc.access & ACC_ACCESSED == 0 {
            desc.access |= ACC_ACCESSED;
            let addr = self.descriptor_addr(sel, Exception::GeneralProtection)?;
            self.write_linear(bus, addr.wrapping_add(5), 1, u32::from(desc.access))?;
        }
        Ok(())
    }

    /// MOV/POP/LxS to a segment register other than CS.
    pub fn load_segment<B: SystemBus>(&mut self, bus: &mut B, seg: Seg, sel: u16) -> Result<(), CpuFault> {
        if !self.protected_mode() || self.v86_mode() {
            self.load_segment_real(seg, sel);
            return Ok(());
        }
        let cpl = self.cpl();
        match seg {
            Seg::Ss => self.load_ss(bus, Selector(sel), cpl, Exception::GeneralProtection),
            Seg::Cs => Err(CpuFault::ud()),
            _ => self.load_data_segment(bus, seg, Selector(sel), cpl, Exception::GeneralProtection),
        }
    }

    /// Protected-mode data segment load (DS, ES, FS, GS). `vector` replaces #GP during a
    /// task switch.
    pub(crate) fn load_data_segment<B: SystemBus>(
        &mut self,
        bus: &mut B,
        seg: Seg,
        sel: Selector,
        cpl: u8,
        vector: Exception,
    ) -> Fallible {
        if sel.is_null() {
            self.sregs[seg.index()] = SegReg::invalid(sel.0);
            return Ok(());
        }
        let raw = self.fetch_descriptor(bus, sel, vector)?;
        let mut desc = Descriptor::parse(raw, self.model());
        if !desc.is_segment() || (desc.is_code() && !desc.readable()) {
            return Err(fault(vector, sel.error_code()));
        }
        if (desc.is_data() || !desc.conforming()) && (sel.rpl() > desc.dpl() || cpl > desc.dpl()) {
            return Err(fault(vector, sel.error_code()));
        }
        if !desc.present() {
            return Err(CpuFault::np(sel.error_code()));
        }
        self.mark_accessed(bus, sel, &mut desc)?;
        self.sregs[seg.index()] = SegReg { selector: sel, desc };
        Ok(())
    }

    /// Validates a stack segment for privilege level `cpl` without loading it.
    pub(crate) fn check_ss<B: SystemBus>(
        &mut self,
        bus: &mut B,
        sel: Selector,
        cpl: u8,
        vector: Exception,
    ) -> Fallible<SegReg> {
        if sel.is_null() {
            return Err(fault(vector, 0));
        }
        let raw = self.fetch_descriptor(bus, sel, vector)?;
        let mut desc = Descriptor::parse(raw, self.model());
        if sel.rpl() != cpl || !desc.writable() || desc.dpl() != cpl {
            return Err(fault(vector, sel.error_code()));
        }
        if !desc.present() {
            return Err(CpuFault::ss(sel.error_code()));
        }
        self.mark_accessed(bus, sel, &mut desc)?;
        Ok(SegReg { selector: sel, desc })
    }

    pub(crate) fn load_ss<B: SystemBus>(
        &mut self,
        bus: &mut B,
        sel: Selector,
        cpl: u8,
        vector: Exception,
    ) -> Fallible {
        let ss = self.check_ss(bus, sel, cpl, vector)?;
        self.sregs[Seg::Ss.index()] = ss;
        Ok(())
    }

    /// Fetches the code segment a far transfer targets; privilege checks are the
    /// caller's.
    pub(crate) fn check_code_segment<B: SystemBus>(
        &mut self,
        bus: &mut B,
        sel: Selector,
        vector: Exception,
    ) -> Fallible<Descriptor> {
        if sel.is_null() {
            return Err(fault(vector, 0));
        }
        let raw = self.fetch_descriptor(bus, sel, vector)?;
        let desc = Descriptor::parse(raw, self.model());
        if !desc.is_code() {
            return Err(fault(vector, sel.error_code()));
        }
        Ok(desc)
    }

    /// Commits a new CS. The offset must already be checked against the limit.
    pub(crate) fn commit_cs<B: SystemBus>(
        &mut self,
        bus: &mut B,
        sel: Selector,
        mut desc: Descriptor,
        cpl: u8,
        eip: u32,
    ) -> Fallible {
        self.mark_accessed(bus, sel, &mut desc)?;
        self.sregs[Seg::Cs.index()] = SegReg {
            selector: sel.with_rpl(cpl),
            desc,
        };
        self.eip = eip;
        self.bus_unit.invalidate_pq();
        Ok(())
    }

    /// After a return to an outer level, data registers the new level may not use are
    /// nulled.
    pub(crate) fn invalidate_data_segments(&mut self, cpl: u8) {
        for seg in [Seg::Es, Seg::Ds, Seg::Fs, Seg::Gs] {
            let sreg = self.sregs[seg.index()];
            let desc = sreg.desc;
            if !desc.valid {
                continue;
            }
            if (desc.is_data() || !desc.conforming()) && desc.dpl() < cpl {
                self.sregs[seg.index()] = SegReg::invalid(0);
            }
        }
    }

    /// LLDT, and the LDTR load of a task switch.
    pub(crate) fn load_ldtr<B: SystemBus>(&mut self, bus: &mut B, sel: Selector, vector: Exception) -> Fallible {
        if sel.is_null() {
            self.ldtr = SegReg::invalid(sel.0);
            return Ok(());
        }
        if sel.is_local() {
            return Err(fault(vector, sel.error_code()));
        }
        let raw = self.fetch_descriptor(bus, sel, vector)?;
        let desc = Descriptor::parse(raw, self.model());
        if desc.system_type(self.model()) != Some(SystemType::Ldt) {
            return Err(fault(vector, sel.error_code()));
        }
        if !desc.present() {
            let code = sel.error_code();
            return Err(if vector == Exception::InvalidTss {
                CpuFault::ts(code)
            } else {
                CpuFault::np(code)
            });
        }
        tracing::debug!(selector = sel.0, base = desc.base, limit = desc.limit, "LDT loaded");
        self.ldtr = SegReg { selector: sel, desc };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CpuConfig;
    use crate::cpu::TableReg;
    use crate::flags::Cr0;
    use pcat_cpu_decoder::CpuModel;
    use pcat_mem::{IoBus, MemoryBus};

    struct Bus(Vec<u8>);

    impl MemoryBus for Bus {
        fn read_u8(&mut self, paddr: u32) -> u8 {
            self.0[paddr as usize]
        }

        fn write_u8(&mut self, paddr: u32, val: u8) {
            self.0[paddr as usize] = val;
        }
    }

    impl IoBus for Bus {
        fn io_read(&mut self, _port: u16, _size: u8) -> u32 {
            0
        }

        fn io_write(&mut self, _port: u16, _size: u8, _val: u32) {}
    }

    fn pmode_cpu(bus: &mut Bus) -> Cpu {
        let gdt: [u64; 4] = [
            0,
            Descriptor::new(0, 0xFFFF, 0x9B, 0).to_raw(),
            Descriptor::new(0x2000, 0xFFF, 0x93, 0).to_raw(),
            Descriptor::new(0x3000, 0xFFF, 0x13, 0).to_raw(),
        ];
        for (i, d) in gdt.iter().enumerate() {
            bus.0[0x100 + i * 8..0x108 + i * 8].copy_from_slice(&d.to_le_bytes());
        }
        let mut cpu = Cpu::new(CpuConfig::new(CpuModel::I80286));
        cpu.set_gdtr(TableReg {
            base: 0x100,
            limit: 0x1F,
        });
        cpu.set_cr0(Cr0::PE);
        cpu.sregs[Seg::Cs.index()] = SegReg {
            selector: Selector(0x08),
            desc: Descriptor::new(0, 0xFFFF, 0x9B, 0),
        };
        cpu
    }

    #[test]
    fn data_load_caches_descriptor_and_sets_accessed() {
        let mut bus = Bus(vec![0; 0x10000]);
        let mut cpu = pmode_cpu(&mut bus);
        cpu.load_segment(&mut bus, Seg::Ds, 0x10).unwrap();
        cpu.bus_unit.flush_writes(&mut bus);
        assert_eq!(cpu.sreg(Seg::Ds).desc.base, 0x2000);
        assert_eq!(bus.0[0x115], 0x93);
        let first = *cpu.sreg(Seg::Ds);
        cpu.load_segment(&mut bus, Seg::Ds, 0x10).unwrap();
        assert_eq!(*cpu.sreg(Seg::Ds), first);
    }

    #[test]
    fn not_present_and_out_of_table_selectors_fault() {
        let mut bus = Bus(vec![0; 0x10000]);
        let mut cpu = pmode_cpu(&mut bus);
        assert_eq!(
            cpu.load_segment(&mut bus, Seg::Es, 0x18),
            Err(CpuFault::np(0x18))
        );
        assert_eq!(
            cpu.load_segment(&mut bus, Seg::Es, 0x20),
            Err(CpuFault::gp(0x20))
        );
        assert_eq!(cpu.load_segment(&mut bus, Seg::Ss, 0), Err(CpuFault::gp(0)));
        cpu.load_segment(&mut bus, Seg::Es, 0).unwrap();
        assert!(!cpu.sreg(Seg::Es).desc.valid);
    }
}
