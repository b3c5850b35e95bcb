//! Save/restore of the processor into named [`StateBuf`] sections.

use std::collections::VecDeque;

use pcat_cpu_decoder::{CpuModel, Seg};
use pcat_snapshot::{ReadLeExt, SegmentRecord, SnapshotError, StateBuf, WriteLeExt};
use thiserror::Error;

use crate::cpu::{Cpu, SegReg, TableReg};
use crate::descriptor::{Descriptor, Selector, SystemType};
use crate::flags::{Cr0, Eflags};

/// Registers, descriptor caches, pending events and interrupt-trap bookkeeping.
pub const CORE_SECTION: &str = "CPUCore";
/// Prefetch queue and write buffer.
pub const BUS_SECTION: &str = "CPUBus";

#[derive(Debug, Error)]
pub enum StateError {
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error("state was saved by a {saved:?} core, this core is a {current:?}")]
    ModelMismatch { saved: CpuModel, current: CpuModel },

    #[error("corrupt CPU state: {0}")]
    Corrupt(&'static str),
}

fn model_tag(model: CpuModel) -> u8 {
    match model {
        CpuModel::I80286 => 0,
        CpuModel::I80386 => 1,
    }
}

impl From<&SegReg> for SegmentRecord {
    fn from(s: &SegReg) -> Self {
        SegmentRecord {
            selector: s.selector.0,
            base: s.desc.base,
            limit: s.desc.limit,
            access: s.desc.access,
            flags: s.desc.flags,
            valid: s.desc.valid,
        }
    }
}

impl From<SegmentRecord> for SegReg {
    fn from(r: SegmentRecord) -> Self {
        SegReg {
            selector: Selector(r.selector),
            desc: Descriptor {
                base: r.base,
                limit: r.limit,
                access: r.access,
                flags: r.flags,
                valid: r.valid,
            },
        }
    }
}

impl Cpu {
    /// Adds the [`CORE_SECTION`] and [`BUS_SECTION`] sections to `buf`.
    pub fn save_state(&self, buf: &mut StateBuf) -> Result<(), StateError> {
        let mut core = Vec::new();
        let out = &mut core;
        out.write_u8(model_tag(self.model()))?;
        for r in self.regs {
            out.write_u32_le(r)?;
        }
        out.write_u32_le(self.eip)?;
        out.write_u32_le(self.flags.bits())?;
        for seg in Seg::ALL {
            out.write_segment(&SegmentRecord::from(&self.sregs[seg.index()]))?;
        }
        out.write_segment(&SegmentRecord::from(&self.ldtr))?;
        out.write_segment(&SegmentRecord::from(&self.tr))?;
        for table in [self.gdtr, self.idtr] {
            out.write_u32_le(table.base)?;
            out.write_u16_le(table.limit)?;
        }
        out.write_u32_le(self.cr0.bits())?;
        out.write_u32_le(self.cr2)?;
        out.write_u32_le(self.mmu.cr3())?;
        for d in self.dr {
            out.write_u32_le(d)?;
        }
        out.write_bool(self.pending.nmi)?;
        out.write_bool(self.pending.nmi_blocked)?;
        out.write_u8(self.pending.inhibit)?;
        out.write_u32_le(self.pending.external.len() as u32)?;
        for &v in &self.pending.external {
            out.write_u8(v)?;
        }
        out.write_bool(self.halted)?;
        out.write_bool(self.shutdown)?;
        out.write_bool(self.rep_active)?;
        out.write_u64_le(self.cycles)?;
        out.write_u64_le(self.instructions)?;
        self.traps.save(out)?;
        buf.insert(CORE_SECTION, core)?;

        let mut bus = Vec::new();
        self.bus_unit.save(&mut bus)?;
        buf.insert(BUS_SECTION, bus)?;
        Ok(())
    }

    /// Restores both sections. Interrupt traps must already be registered: in-flight
    /// return traps are re-matched to them by vector.
    pub fn restore_state(&mut self, buf: &StateBuf) -> Result<(), StateError> {
        let mut r: &[u8] = buf.get(CORE_SECTION)?;
        let saved = match r.read_u8()? {
            0 => CpuModel::I80286,
            1 => CpuModel::I80386,
            _ => return Err(StateError::Corrupt("unknown processor model")),
        };
        if saved != self.model() {
            return Err(StateError::ModelMismatch {
                saved,
                current: self.model(),
            });
        }
        for slot in &mut self.regs {
            *slot = r.read_u32_le()?;
        }
        self.eip = r.read_u32_le()?;
        self.flags = Eflags::from_bits_retain(r.read_u32_le()?) | Eflags::RESERVED1;
        for seg in Seg::ALL {
            self.sregs[seg.index()] = SegReg::from(r.read_segment()?);
        }
        self.ldtr = SegReg::from(r.read_segment()?);
        let tr = SegReg::from(r.read_segment()?);
        if tr.desc.valid && !tr.desc.system_type(saved).is_some_and(SystemType::is_tss) {
            return Err(StateError::Corrupt("task register holds a non-TSS descriptor"));
        }
        self.tr = tr;
        let mut tables = [TableReg::default(); 2];
        for table in &mut tables {
            table.base = r.read_u32_le()?;
            table.limit = r.read_u16_le()?;
        }
        [self.gdtr, self.idtr] = tables;
        let cr0 = Cr0::from_bits(r.read_u32_le()?).ok_or(StateError::Corrupt("reserved CR0 bits"))?;
        self.cr2 = r.read_u32_le()?;
        let cr3 = r.read_u32_le()?;
        for slot in &mut self.dr {
            *slot = r.read_u32_le()?;
        }
        self.pending.nmi = r.read_bool()?;
        self.pending.nmi_blocked = r.read_bool()?;
        self.pending.inhibit = r.read_u8()?;
        let count = r.read_u32_le()? as usize;
        if count > 256 || count > r.len() {
            return Err(StateError::Corrupt("pending interrupt queue length"));
        }
        let mut external = VecDeque::with_capacity(count);
        for _ in 0..count {
            let vector = r.read_u8()?;
            if external.contains(&vector) {
                return Err(StateError::Corrupt("interrupt vector pending twice"));
            }
            external.push_back(vector);
        }
        self.pending.external = external;
        self.halted = r.read_bool()?;
        self.shutdown = r.read_bool()?;
        self.rep_active = r.read_bool()?;
        self.cycles = r.read_u64_le()?;
        self.instructions = r.read_u64_le()?;
        self.traps.restore(&mut r)?;
        if !r.is_empty() {
            return Err(StateError::Corrupt("trailing bytes in core state"));
        }

        self.cr0 = cr0;
        self.mmu.set_enabled(cr0.contains(Cr0::PG | Cr0::PE));
        self.mmu.set_cr3(cr3);
        self.fault_eip = self.eip;
        self.branch_not_taken = false;
        self.extra_cycles = 0;

        self.bus_unit.restore(buf.get(BUS_SECTION)?)?;
        tracing::debug!(
            cs = self.sregs[Seg::Cs.index()].selector.0,
            eip = self.eip,
            protected = self.protected_mode(),
            "processor state restored"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CpuConfig;
    use crate::cpu::Gpr;

    #[test]
    fn round_trip_preserves_registers_and_pending_events() {
        let mut cpu = Cpu::new(CpuConfig::new(CpuModel::I80386));
        cpu.set_gpr(Gpr::Ebx, 0xDEAD_BEEF);
        cpu.set_eip(0x1234);
        cpu.sregs[Seg::Es.index()] = SegReg {
            selector: Selector(0x23),
            desc: Descriptor::new(0x10_0000, 0xF_FFFF, 0xF3, 0x4),
        };
        cpu.cr2 = 0x8000_1000;
        cpu.raise_interrupt(0x08);
        cpu.raise_interrupt(0x70);

        let mut buf = StateBuf::new();
        cpu.save_state(&mut buf).unwrap();
        let bytes = buf.to_bytes().unwrap();

        let mut other = Cpu::new(CpuConfig::new(CpuModel::I80386));
        other.restore_state(&StateBuf::from_bytes(&bytes).unwrap()).unwrap();
        assert_eq!(other.gpr(Gpr::Ebx), 0xDEAD_BEEF);
        assert_eq!(other.eip(), 0x1234);
        assert_eq!(other.sreg(Seg::Es), cpu.sreg(Seg::Es));
        assert_eq!(other.cr2(), 0x8000_1000);
        assert_eq!(other.pending.external, cpu.pending.external);
    }

    #[test]
    fn model_mismatch_is_rejected() {
        let cpu = Cpu::new(CpuConfig::new(CpuModel::I80286));
        let mut buf = StateBuf::new();
        cpu.save_state(&mut buf).unwrap();
        let mut other = Cpu::new(CpuConfig::new(CpuModel::I80386));
        assert!(matches!(
            other.restore_state(&buf),
            Err(StateError::ModelMismatch {
                saved: CpuModel::I80286,
                current: CpuModel::I80386
            })
        ));
    }

    #[test]
    fn task_register_must_hold_a_tss() {
        let mut cpu = Cpu::new(CpuConfig::new(CpuModel::I80386));
        // A present LDT descriptor.
        cpu.tr = SegReg {
            selector: Selector(0x28),
            desc: Descriptor::new(0x3000, 0x67, 0x82, 0),
        };
        let mut buf = StateBuf::new();
        cpu.save_state(&mut buf).unwrap();
        let mut other = Cpu::new(CpuConfig::new(CpuModel::I80386));
        assert!(matches!(other.restore_state(&buf), Err(StateError::Corrupt(_))));
        assert!(!other.tr().desc.valid);
    }

    #[test]
    fn truncated_core_section_is_an_error() {
        let cpu = Cpu::new(CpuConfig::new(CpuModel::I80286));
        let mut buf = StateBuf::new();
        cpu.save_state(&mut buf).unwrap();
        let core = buf.get(CORE_SECTION).unwrap().to_vec();
        buf.replace(CORE_SECTION, core[..core.len() - 3].to_vec());
        let mut other = Cpu::new(CpuConfig::new(CpuModel::I80286));
        assert!(other.restore_state(&buf).is_err());
    }
}
