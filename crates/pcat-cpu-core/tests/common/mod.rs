#![allow(dead_code)]

use pcat_cpu_core::{
    Cpu, CpuConfig, CpuModel, Cr0, Descriptor, Gate, Gpr, Seg, Selector, SystemType, TableReg,
    ACC_CODE, ACC_PRESENT, ACC_RW, ACC_SEGMENT,
};
use pcat_mem::{IoBus, MemoryBus};

/// Where [`boot`] leaves execution: 0000:1000.
pub const REAL_CODE: u32 = 0x1000;
/// Where [`enter_protected`] leaves execution: 0008:2000.
pub const PM_CODE: u32 = 0x2000;
pub const GDT_BASE: u32 = 0x800;
/// Room for 32 descriptors.
pub const GDT_MAX_ENTRIES: usize = 32;
/// A full 256-vector table, clear of the GDT, code, TSS and stack areas.
pub const IDT_BASE: u32 = 0xA000;
pub const IDT_BYTES: u32 = 256 * 8;
pub const STACK_TOP: u32 = 0x8000;

const _: () = {
    let gdt_end = GDT_BASE + GDT_MAX_ENTRIES as u32 * 8;
    assert!(gdt_end <= REAL_CODE);
    assert!(IDT_BASE >= gdt_end || IDT_BASE + IDT_BYTES <= GDT_BASE);
};

pub const CODE_SEL: u16 = 0x08;
pub const DATA_SEL: u16 = 0x10;

pub struct TestBus {
    pub mem: Vec<u8>,
    pub io_writes: Vec<(u16, u8, u32)>,
}

impl TestBus {
    pub fn new() -> Self {
        Self {
            mem: vec![0; 0x20_0000],
            io_writes: Vec::new(),
        }
    }

    pub fn load(&mut self, addr: u32, bytes: &[u8]) {
        let start = addr as usize;
        self.mem[start..start + bytes.len()].copy_from_slice(bytes);
    }

    pub fn put_u16(&mut self, addr: u32, val: u16) {
        self.load(addr, &val.to_le_bytes());
    }

    pub fn put_u32(&mut self, addr: u32, val: u32) {
        self.load(addr, &val.to_le_bytes());
    }

    pub fn put_u64(&mut self, addr: u32, val: u64) {
        self.load(addr, &val.to_le_bytes());
    }

    pub fn u16_at(&self, addr: u32) -> u16 {
        let a = addr as usize;
        u16::from_le_bytes([self.mem[a], self.mem[a + 1]])
    }

    pub fn u32_at(&self, addr: u32) -> u32 {
        let a = addr as usize;
        u32::from_le_bytes([self.mem[a], self.mem[a + 1], self.mem[a + 2], self.mem[a + 3]])
    }
}

impl MemoryBus for TestBus {
    fn read_u8(&mut self, paddr: u32) -> u8 {
        self.mem.get(paddr as usize).copied().unwrap_or(0xFF)
    }

    fn write_u8(&mut self, paddr: u32, val: u8) {
        if let Some(slot) = self.mem.get_mut(paddr as usize) {
            *slot = val;
        }
    }
}

impl IoBus for TestBus {
    fn io_read(&mut self, _port: u16, size: u8) -> u32 {
        match size {
            1 => 0xFF,
            2 => 0xFFFF,
            _ => 0xFFFF_FFFF,
        }
    }

    fn io_write(&mut self, port: u16, size: u8, val: u32) {
        self.io_writes.push((port, size, val));
    }
}

pub fn code_desc(dpl: u8) -> u64 {
    Descriptor::new(0, 0xFFFF, ACC_PRESENT | (dpl << 5) | ACC_SEGMENT | ACC_CODE | ACC_RW, 0).to_raw()
}

pub fn data_desc(base: u32, limit: u32, dpl: u8) -> u64 {
    Descriptor::new(base, limit, ACC_PRESENT | (dpl << 5) | ACC_SEGMENT | ACC_RW, 0).to_raw()
}

/// An available TSS descriptor of the given system type.
pub fn tss_desc(base: u32, limit: u32, kind: SystemType) -> u64 {
    Descriptor::new(base, limit, ACC_PRESENT | kind as u8, 0).to_raw()
}

pub fn gate(kind: SystemType, selector: u16, offset: u32, dpl: u8) -> u64 {
    Gate {
        kind,
        selector: Selector(selector),
        offset,
        params: 0,
        dpl,
        present: true,
    }
    .to_raw()
}

pub fn set_idt_entry(bus: &mut TestBus, vector: u8, raw: u64) {
    bus.put_u64(IDT_BASE + u32::from(vector) * 8, raw);
}

/// Resets a processor and runs the far jump planted at the reset vector, landing at
/// 0000:[`REAL_CODE`] with SS:SP = 0000:[`STACK_TOP`].
pub fn boot(model: CpuModel, bus: &mut TestBus, code: &[u8]) -> Cpu {
    bus.load(0xF_FFF0, &[0xEA, 0x00, 0x10, 0x00, 0x00]);
    bus.load(REAL_CODE, code);
    let mut cpu = Cpu::new(CpuConfig::new(model));
    cpu.step(bus).unwrap();
    assert_eq!(cpu.eip(), REAL_CODE);
    assert_eq!(cpu.sreg(Seg::Cs).selector.0, 0);
    cpu.set_gpr(Gpr::Esp, STACK_TOP);
    cpu
}

/// Boots, installs `gdt` (entry 1 must be ring-0 code, entry 2 ring-0 data) and an IDT
/// of 32 vectors, sets PE and jumps to 0008:[`PM_CODE`] where `code` is placed. SS, DS
/// and ES are loaded with the data selector.
pub fn enter_protected(model: CpuModel, bus: &mut TestBus, gdt: &[u64], code: &[u8]) -> Cpu {
    assert!(gdt.len() <= GDT_MAX_ENTRIES, "GDT would run into the code area");
    for (i, &raw) in gdt.iter().enumerate() {
        bus.put_u64(GDT_BASE + 8 * i as u32, raw);
    }
    bus.load(PM_CODE, code);
    let mut cpu = boot(model, bus, &[0xEA, 0x00, 0x20, 0x08, 0x00]);
    cpu.set_gdtr(TableReg {
        base: GDT_BASE,
        limit: (gdt.len() * 8 - 1) as u16,
    });
    cpu.set_idtr(TableReg {
        base: IDT_BASE,
        limit: 32 * 8 - 1,
    });
    cpu.set_cr0(cpu.cr0() | Cr0::PE);
    cpu.step(bus).unwrap();
    assert_eq!(cpu.sreg(Seg::Cs).selector.0, CODE_SEL);
    assert_eq!(cpu.eip(), PM_CODE);
    for seg in [Seg::Ss, Seg::Ds, Seg::Es] {
        cpu.load_segment(bus, seg, DATA_SEL).unwrap();
    }
    cpu
}

/// The minimal flat GDT: null, ring-0 code, ring-0 data.
pub fn flat_gdt() -> Vec<u64> {
    vec![0, code_desc(0), data_desc(0, 0xFFFF, 0)]
}
