use pcat_cpu_decoder::{CpuModel, Decoder, Op, SliceSource};
use proptest::prelude::*;

fn model_strategy() -> impl Strategy<Value = CpuModel> {
    prop_oneof![Just(CpuModel::I80286), Just(CpuModel::I80386)]
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 2048,
        .. ProptestConfig::default()
    })]

    #[test]
    fn size_matches_bytes_consumed(
        model in model_strategy(),
        default32 in any::<bool>(),
        bytes in proptest::collection::vec(any::<u8>(), 32),
    ) {
        let decoder = Decoder::new(model);
        let mut src = SliceSource::new(&bytes);
        let ins = decoder.decode(&mut src, default32);
        let max = usize::from(model.max_instr_size());
        let consumed = src.position();

        if usize::from(ins.size) > consumed {
            // Only a run of prefixes reaching the limit reports more than it consumed.
            prop_assert_eq!(consumed, max);
            prop_assert_eq!(usize::from(ins.size), max + 1);
        } else {
            prop_assert_eq!(usize::from(ins.size), consumed);
        }
        prop_assert!(consumed <= max + 14);
    }

    #[test]
    fn decoded_ops_are_never_unresolved_groups(
        model in model_strategy(),
        bytes in proptest::collection::vec(any::<u8>(), 32),
    ) {
        let ins = Decoder::new(model).decode(&mut SliceSource::new(&bytes), false);
        prop_assert!(!matches!(ins.op, Op::Group(_)));
        if ins.op == Op::Invalid {
            prop_assert!(!ins.valid);
        }
        if model == CpuModel::I80286 {
            prop_assert!(!ins.op32 && !ins.addr32);
        }
    }
}
