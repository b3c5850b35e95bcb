use pcat_cpu_core::{CpuModel, Gpr};
use pcat_machine::{CpuSnapshot, Machine, MachineConfig, MachineError, RunExit};

const LOAD_ADDR: u32 = 0x1000;

fn config(model: CpuModel) -> MachineConfig {
    MachineConfig {
        reset_vector: Some((0, LOAD_ADDR as u16)),
        ..MachineConfig::pc_at(model)
    }
}

fn machine(model: CpuModel, program: &[u8]) -> Machine {
    let mut m = Machine::new(config(model)).unwrap();
    m.load_image(LOAD_ADDR, program).unwrap();
    m
}

#[test]
fn debugcon_collects_guest_output() {
    // mov al,'h'; out 0xe9,al; mov al,'i'; out 0xe9,al; hlt
    let program = [0xB0, b'h', 0xE6, 0xE9, 0xB0, b'i', 0xE6, 0xE9, 0xF4];
    for model in [CpuModel::I80286, CpuModel::I80386] {
        let mut m = machine(model, &program);
        let exit = m.run_instructions(100);
        // The reset jump plus five program instructions.
        assert_eq!(exit.executed(), 6);
        assert!(matches!(exit, RunExit::Halted { .. }), "{model}: {exit:?}");
        assert_eq!(m.take_debugcon_output(), b"hi");
        assert!(m.take_debugcon_output().is_empty());
    }
}

#[test]
fn instruction_and_cycle_budgets() {
    // jmp $
    let mut m = machine(CpuModel::I80286, &[0xEB, 0xFE]);
    let monitor = m.monitor();

    let exit = m.run_instructions(10);
    assert!(matches!(exit, RunExit::Completed { executed: 10, .. }));
    assert!(exit.cycles() > 0);
    assert_eq!(m.cpu().instructions(), 10);

    let exit = m.run_cycles(500);
    assert!(matches!(exit, RunExit::Completed { .. }));
    assert!(exit.cycles() >= 500);
    assert!(exit.executed() > 0);

    let counters = monitor.counters();
    assert_eq!(counters.slices(), 2);
    assert_eq!(counters.instructions(), 10 + exit.executed());
    assert!(!counters.running());
    assert_eq!(monitor.latest().map(|s| s.instructions), Some(m.cpu().instructions()));
}

#[test]
fn interrupt_wakes_halted_processor() {
    // 0000:1000: sti; hlt; hlt
    let mut m = machine(CpuModel::I80286, &[0xFB, 0xF4, 0xF4]);
    // IVT[0x20] -> 0000:1100: mov al,'!'; out 0xe9,al; iret
    m.load_image(0x20 * 4, &[0x00, 0x11, 0x00, 0x00]).unwrap();
    m.load_image(0x1100, &[0xB0, b'!', 0xE6, 0xE9, 0xCF]).unwrap();

    let exit = m.run_instructions(100);
    assert!(matches!(exit, RunExit::Halted { executed: 3, .. }));
    assert!(m.cpu().is_halted());

    m.raise_interrupt(0x20);
    let exit = m.run_instructions(100);
    assert!(matches!(exit, RunExit::Halted { executed: 4, .. }), "{exit:?}");
    assert_eq!(m.cpu().eip(), 0x1003);
    assert_eq!(m.take_debugcon_output(), b"!");
}

#[test]
fn triple_fault_shuts_down_until_reset() {
    // lidt [0x500] with an all-zero pseudo-descriptor; int3
    let mut m = machine(CpuModel::I80286, &[0x0F, 0x01, 0x1E, 0x00, 0x05, 0xCC]);
    let exit = m.run_instructions(100);
    assert!(matches!(exit, RunExit::Shutdown { .. }), "{exit:?}");
    assert!(m.cpu().is_shutdown());
    assert!(matches!(m.run_instructions(10), RunExit::Shutdown { executed: 0, .. }));

    m.reset();
    assert!(!m.cpu().is_shutdown());
    assert_eq!(m.cpu().eip(), 0xFFF0);
    assert!(matches!(m.run_instructions(1), RunExit::Completed { executed: 1, .. }));
    assert_eq!(m.cpu().eip(), LOAD_ADDR);
}

#[test]
fn system_control_port_drives_a20_and_reset() {
    let program = [
        0xE4, 0x92, // in al,0x92
        0x88, 0xC3, // mov bl,al
        0xB0, 0x00, // mov al,0
        0xE6, 0x92, // out 0x92,al
        0xE4, 0x92, // in al,0x92
        0x88, 0xC7, // mov bh,al
        0xB0, 0x01, // mov al,1
        0xE6, 0x92, // out 0x92,al
        0xF4, // hlt
    ];
    let mut m = machine(CpuModel::I80386, &program);
    let exit = m.run_instructions(100);
    assert!(matches!(exit, RunExit::ResetRequested { executed: 9, .. }), "{exit:?}");
    assert_eq!(m.cpu().gpr(Gpr::Ebx) & 0xFFFF, 0x0002);
    assert!(!m.memory().a20_enabled());

    m.reset();
    assert!(m.memory().a20_enabled());
    assert_eq!(m.cpu().eip(), 0xFFF0);
}

#[test]
fn restored_state_continues_identically() {
    // 0000:1000: inc ax; mov [0x2000],ax; jmp 0x1000
    let program = [0x40, 0xA3, 0x00, 0x20, 0xEB, 0xFA];
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("machine.state");

    for model in [CpuModel::I80286, CpuModel::I80386] {
        let mut original = machine(model, &program);
        original.run_instructions(50);
        original.save_state_file(&path).unwrap();
        original.run_instructions(37);
        let expected = CpuSnapshot::capture(original.cpu());

        let mut restored = Machine::new(config(model)).unwrap();
        restored.restore_state_file(&path).unwrap();
        restored.run_instructions(37);

        assert_eq!(CpuSnapshot::capture(restored.cpu()), expected, "{model}");
        assert_eq!(restored.memory().ram()[0x2000..0x2002], original.memory().ram()[0x2000..0x2002]);
    }
}

#[test]
fn restore_rejects_other_ram_size() {
    let m = machine(CpuModel::I80286, &[0xF4]);
    let state = m.save_state().unwrap();

    let mut bigger = Machine::new(MachineConfig {
        ram_size: 0x20_0000,
        ..config(CpuModel::I80286)
    })
    .unwrap();
    let err = bigger.restore_state(&state).unwrap_err();
    assert!(matches!(
        err,
        MachineError::RamSizeMismatch {
            saved: 0x10_0000,
            current: 0x20_0000
        }
    ));
}

#[test]
fn restore_rejects_other_model() {
    let m = machine(CpuModel::I80286, &[0xF4]);
    let state = m.save_state().unwrap();
    let mut other = Machine::new(MachineConfig {
        ram_size: 0x10_0000,
        ..config(CpuModel::I80386)
    })
    .unwrap();
    assert!(matches!(other.restore_state(&state), Err(MachineError::CpuState(_))));
}

#[test]
fn monitor_receives_snapshots_on_another_thread() {
    let mut m = machine(CpuModel::I80386, &[0xEB, 0xFE]);
    let monitor = m.monitor();
    let observer = std::thread::spawn(move || {
        let snap = monitor.wait().unwrap();
        (snap, monitor.counters().slices())
    });

    m.run_instructions(5);
    let (snap, slices) = observer.join().unwrap();
    assert_eq!(snap.instructions, 5);
    assert_eq!(snap.eip, LOAD_ADDR);
    assert!(!snap.protected_mode);
    assert_eq!(slices, 1);

    // Nobody is listening any more; running on must not fail.
    assert_eq!(m.run_instructions(3).executed(), 3);
}

#[test]
fn config_validation() {
    let zero = MachineConfig {
        ram_size: 0,
        ..MachineConfig::pc_at(CpuModel::I80286)
    };
    assert!(matches!(zero.validate(), Err(MachineError::InvalidRamSize { .. })));

    let too_big = MachineConfig {
        ram_size: 32 << 20,
        ..MachineConfig::pc_at(CpuModel::I80286)
    };
    assert!(matches!(
        too_big.validate(),
        Err(MachineError::InvalidRamSize { addr_bits: 24, .. })
    ));

    let small_with_vector = MachineConfig {
        ram_size: 512 << 10,
        ..config(CpuModel::I80286)
    };
    assert!(matches!(
        Machine::new(small_with_vector),
        Err(MachineError::ResetVectorOutsideRam { .. })
    ));

    assert!(MachineConfig::pc_at(CpuModel::I80386).validate().is_ok());
}
