mod common;

use common::*;
use pcat_cpu_core::{Cpu, CpuModel, Cr0, Gpr, Seg, SystemType};

const PAGE_DIR: u32 = 0x1_0000;
const PAGE_TABLE: u32 = 0x1_1000;
const PTE_FLAGS: u32 = 0x7;
const PTE_ACCESSED: u32 = 0x20;
const PTE_DIRTY: u32 = 0x40;

const MISSING_SEL: u16 = 0x18;
const MAPPED_SEL: u16 = 0x20;

/// Identity-maps the low 2 MiB except page 0x50, enters protected mode and enables
/// paging. A #PF handler is installed at 0008:4000.
fn paged_cpu(bus: &mut TestBus, code: &[u8]) -> Cpu {
    bus.put_u32(PAGE_DIR, PAGE_TABLE | PTE_FLAGS);
    for page in 0..0x200u32 {
        let pte = if page == 0x50 { 0 } else { (page << 12) | PTE_FLAGS };
        bus.put_u32(PAGE_TABLE + page * 4, pte);
    }
    set_idt_entry(bus, 14, gate(SystemType::IntGate32, CODE_SEL, 0x4000, 0));

    let mut gdt = flat_gdt();
    gdt.push(data_desc(0x5_0000, 0xFFFF, 0));
    gdt.push(data_desc(0x6_0000, 0xFFFF, 0));
    let mut cpu = enter_protected(CpuModel::I80386, bus, &gdt, code);
    cpu.set_cr3(PAGE_DIR);
    cpu.set_cr0(cpu.cr0() | Cr0::PG);
    cpu
}

#[test]
fn read_of_missing_page_faults_with_cr2() {
    let mut bus = TestBus::new();
    let mut cpu = paged_cpu(&mut bus, &[0x8A, 0x07]);
    cpu.load_segment(&mut bus, Seg::Ds, MISSING_SEL).unwrap();
    cpu.set_gpr(Gpr::Ebx, 0);

    cpu.step(&mut bus).unwrap();

    assert_eq!(cpu.cr2(), 0x5_0000);
    assert_eq!(cpu.eip(), 0x4000);
    assert_eq!(cpu.gpr(Gpr::Esp), 0x7FF0);
    assert_eq!(bus.u32_at(0x7FF0), 0, "not-present supervisor read");
    assert_eq!(bus.u32_at(0x7FF4), PM_CODE);
}

#[test]
fn write_sets_accessed_and_dirty() {
    let mut bus = TestBus::new();
    let mut cpu = paged_cpu(&mut bus, &[0x88, 0x07]);
    cpu.load_segment(&mut bus, Seg::Ds, MAPPED_SEL).unwrap();
    cpu.set_gpr(Gpr::Ebx, 0x10);
    cpu.set_gpr(Gpr::Eax, 0xA5);

    cpu.step(&mut bus).unwrap();

    assert_eq!(cpu.eip(), PM_CODE + 2);
    assert_eq!(bus.mem[0x6_0010], 0xA5);
    let pte = bus.u32_at(PAGE_TABLE + 0x60 * 4);
    assert_eq!(pte & (PTE_ACCESSED | PTE_DIRTY), PTE_ACCESSED | PTE_DIRTY);
    assert_ne!(bus.u32_at(PAGE_DIR) & PTE_ACCESSED, 0);
}

#[test]
fn read_sets_accessed_only() {
    let mut bus = TestBus::new();
    let mut cpu = paged_cpu(&mut bus, &[0x8A, 0x07]);
    cpu.load_segment(&mut bus, Seg::Ds, MAPPED_SEL).unwrap();
    cpu.set_gpr(Gpr::Ebx, 0);

    cpu.step(&mut bus).unwrap();

    let pte = bus.u32_at(PAGE_TABLE + 0x60 * 4);
    assert_eq!(pte & (PTE_ACCESSED | PTE_DIRTY), PTE_ACCESSED);
}
