mod common;

use common::*;
use pcat_cpu_core::{Cpu, CpuExit, CpuFault, CpuModel, Eflags, Gpr, Seg};
use pcat_cpu_decoder::{Decoder, SliceSource};

fn set_vector(bus: &mut TestBus, vector: u8, seg: u16, off: u16) {
    let entry = u32::from(vector) * 4;
    bus.put_u16(entry, off);
    bus.put_u16(entry + 2, seg);
}

fn enable_interrupts(cpu: &mut Cpu) {
    let flags = cpu.flags() | Eflags::IF;
    cpu.set_flags(flags);
}

#[test]
fn int_pushes_flags_cs_ip_and_clears_if() {
    let mut bus = TestBus::new();
    set_vector(&mut bus, 0x21, 0x0200, 0x0100);
    let mut cpu = boot(CpuModel::I80286, &mut bus, &[0xCD, 0x21]);
    enable_interrupts(&mut cpu);

    cpu.step(&mut bus).unwrap();

    assert_eq!(cpu.gpr(Gpr::Esp), 0x7FFA);
    assert_eq!(bus.u16_at(0x7FFA), 0x1002);
    assert_eq!(bus.u16_at(0x7FFC), 0x0000);
    assert_ne!(bus.u16_at(0x7FFE) & Eflags::IF.bits() as u16, 0);
    assert!(!cpu.flags().contains(Eflags::IF));
    assert_eq!(cpu.sreg(Seg::Cs).selector.0, 0x0200);
    assert_eq!(cpu.sreg(Seg::Cs).base(), 0x2000);
    assert_eq!(cpu.eip(), 0x0100);
}

#[test]
fn overlong_instruction_is_gp_and_leaves_ip() {
    let mut bus = TestBus::new();
    let mut cpu = boot(CpuModel::I80286, &mut bus, &[0x90]);
    let mut ins = Decoder::new(CpuModel::I80286).decode(&mut SliceSource::new(&[0x90]), false);
    assert!(ins.valid);
    ins.size = 11;

    assert_eq!(cpu.execute(&mut bus, &ins), Err(CpuFault::gp(0)));
    assert_eq!(cpu.eip(), REAL_CODE);
}

#[test]
fn push_with_sp_one_shuts_down() {
    let mut bus = TestBus::new();
    let mut cpu = boot(CpuModel::I80286, &mut bus, &[0x50]);
    cpu.set_gpr(Gpr::Esp, 1);

    assert_eq!(cpu.step(&mut bus), Err(CpuExit::Shutdown));
    assert!(cpu.is_shutdown());
    assert_eq!(cpu.step(&mut bus), Err(CpuExit::Shutdown));
}

#[test]
fn rep_stos_is_interruptible_between_iterations() {
    let mut bus = TestBus::new();
    set_vector(&mut bus, 0x30, 0x0000, 0x4000);
    bus.load(0x4000, &[0xCF]);
    let mut cpu = boot(CpuModel::I80286, &mut bus, &[0xF3, 0xAA]);
    enable_interrupts(&mut cpu);
    cpu.set_gpr(Gpr::Ecx, 3);
    cpu.set_gpr(Gpr::Edi, 0x3000);
    cpu.set_gpr(Gpr::Eax, 0x55);

    cpu.step(&mut bus).unwrap();
    assert_eq!(cpu.gpr(Gpr::Ecx), 2);
    assert_eq!(cpu.eip(), REAL_CODE);

    cpu.raise_interrupt(0x30);
    cpu.step(&mut bus).unwrap();
    assert_eq!(cpu.eip(), 0x4000);
    assert_eq!(cpu.gpr(Gpr::Ecx), 2);
    assert_eq!(bus.u16_at(cpu.gpr(Gpr::Esp)), REAL_CODE as u16);

    cpu.step(&mut bus).unwrap();
    assert_eq!(cpu.eip(), REAL_CODE);

    cpu.step(&mut bus).unwrap();
    assert_eq!(cpu.gpr(Gpr::Ecx), 1);
    assert_eq!(cpu.eip(), REAL_CODE);

    cpu.step(&mut bus).unwrap();
    assert_eq!(cpu.gpr(Gpr::Ecx), 0);
    assert_eq!(cpu.eip(), REAL_CODE + 2);
    assert_eq!(&bus.mem[0x3000..0x3004], &[0x55, 0x55, 0x55, 0x00]);
    assert_eq!(cpu.gpr(Gpr::Edi), 0x3003);
}

#[test]
fn repne_scasb_stops_on_match() {
    let mut bus = TestBus::new();
    bus.load(0x3000, b"hello");
    let mut cpu = boot(CpuModel::I80286, &mut bus, &[0xF2, 0xAE]);
    cpu.set_gpr(Gpr::Ecx, 10);
    cpu.set_gpr(Gpr::Edi, 0x3000);
    cpu.set_gpr(Gpr::Eax, u32::from(b'l'));

    for _ in 0..10 {
        if cpu.eip() != REAL_CODE {
            break;
        }
        cpu.step(&mut bus).unwrap();
    }

    assert_eq!(cpu.eip(), REAL_CODE + 2);
    assert_eq!(cpu.gpr(Gpr::Ecx), 7);
    assert_eq!(cpu.gpr(Gpr::Edi), 0x3003);
    assert!(cpu.flags().contains(Eflags::ZF));
}

#[test]
fn rep_with_zero_count_does_nothing() {
    let mut bus = TestBus::new();
    let mut cpu = boot(CpuModel::I80386, &mut bus, &[0xF3, 0xAA]);
    cpu.set_gpr(Gpr::Edi, 0x3000);
    cpu.set_gpr(Gpr::Eax, 0x55);

    cpu.step(&mut bus).unwrap();

    assert_eq!(cpu.eip(), REAL_CODE + 2);
    assert_eq!(bus.mem[0x3000], 0);
    assert_eq!(cpu.gpr(Gpr::Edi), 0x3000);
}

#[test]
fn masked_interrupt_waits_for_if() {
    let mut bus = TestBus::new();
    set_vector(&mut bus, 0x08, 0x0000, 0x4000);
    let mut cpu = boot(CpuModel::I80286, &mut bus, &[0x90, 0xFB, 0x90, 0x90]);
    cpu.raise_interrupt(0x08);

    cpu.step(&mut bus).unwrap();
    assert_eq!(cpu.eip(), REAL_CODE + 1);
    assert!(cpu.has_pending_interrupt());

    // STI, then one more instruction runs in its shadow.
    cpu.step(&mut bus).unwrap();
    cpu.step(&mut bus).unwrap();
    assert_eq!(cpu.eip(), REAL_CODE + 3);

    cpu.step(&mut bus).unwrap();
    assert_eq!(cpu.eip(), 0x4000);
    assert!(!cpu.has_pending_interrupt());
}

#[test]
fn nmi_ignores_if() {
    let mut bus = TestBus::new();
    set_vector(&mut bus, 0x02, 0x0000, 0x4000);
    let mut cpu = boot(CpuModel::I80386, &mut bus, &[0x90]);
    assert!(!cpu.flags().contains(Eflags::IF));
    cpu.raise_nmi();

    cpu.step(&mut bus).unwrap();

    assert_eq!(cpu.eip(), 0x4000);
    assert_eq!(bus.u16_at(cpu.gpr(Gpr::Esp)), REAL_CODE as u16);
}

#[test]
fn reset_state_matches_the_model() {
    let cpu = Cpu::new(pcat_cpu_core::CpuConfig::new(CpuModel::I80386));
    assert_eq!(cpu.gpr(Gpr::Edx), 0x0303);
    assert_eq!(cpu.sreg(Seg::Cs).selector.0, 0xF000);
    assert_eq!(cpu.eip(), 0xFFF0);
    assert!(!cpu.protected_mode());

    let cpu = Cpu::new(pcat_cpu_core::CpuConfig::new(CpuModel::I80286));
    assert_eq!(cpu.gpr(Gpr::Edx), 0);
    assert_eq!(cpu.idtr().limit, 0x3FF);
}
