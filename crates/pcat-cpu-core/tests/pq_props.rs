mod common;

use common::TestBus;
use pcat_cpu_core::{BusUnit, CpuConfig, CpuModel, Mmu};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Action {
    Update(u32),
    Fetch(u8),
    Invalidate,
    Begin(u16),
}

fn action() -> impl Strategy<Value = Action> {
    prop_oneof![
        (0u32..40).prop_map(Action::Update),
        (1u8..20).prop_map(Action::Fetch),
        Just(Action::Invalidate),
        any::<u16>().prop_map(Action::Begin),
    ]
}

fn model() -> impl Strategy<Value = CpuModel> {
    prop_oneof![Just(CpuModel::I80286), Just(CpuModel::I80386)]
}

proptest! {
    #[test]
    fn queue_window_stays_consistent(model in model(), actions in prop::collection::vec(action(), 1..64)) {
        let mut bus = TestBus::new();
        for (i, b) in bus.mem.iter_mut().take(0x2_0000).enumerate() {
            *b = i as u8;
        }
        let mut mmu = Mmu::new();
        let mut unit = BusUnit::new(&CpuConfig::new(model));
        unit.begin_instruction(0);

        for action in actions {
            match action {
                Action::Update(cycles) => {
                    let cseip = unit.cseip();
                    unit.update(&mut bus, &mut mmu, false, cseip, cycles);
                }
                Action::Fetch(n) => {
                    for _ in 0..n {
                        let addr = unit.cseip();
                        let b = unit.fetch_u8(&mut bus, &mut mmu, false);
                        if unit.pq_valid() {
                            prop_assert_eq!(b, addr as u8);
                        }
                    }
                }
                Action::Invalidate => unit.invalidate_pq(),
                Action::Begin(addr) => unit.begin_instruction(u32::from(addr)),
            }

            let used = unit.pq_tail().wrapping_sub(unit.pq_head());
            prop_assert!(used <= unit.pq_size(), "queue holds {} of {}", used, unit.pq_size());
            // Consumed bytes leave the queue as they are read.
            prop_assert_eq!(unit.cseip(), unit.pq_head());
        }
    }
}
