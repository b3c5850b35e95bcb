use pcat_snapshot::{ReadLeExt, SnapshotError, StateBuf, WriteLeExt};
use proptest::prelude::*;

#[test]
fn sections_survive_a_file_round_trip_in_order() {
    let mut buf = StateBuf::new();
    let mut core = Vec::new();
    core.write_u32_le(0xDEAD_BEEF).unwrap();
    core.write_u16_le(0xF000).unwrap();
    buf.insert("CPUCore", core).unwrap();
    buf.insert("CPUBus", vec![0xAA; 40]).unwrap();
    buf.insert("Memory", Vec::new()).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("machine.state");
    buf.save_file(&path).unwrap();
    let loaded = StateBuf::load_file(&path).unwrap();

    assert_eq!(loaded, buf);
    assert_eq!(
        loaded.names().collect::<Vec<_>>(),
        ["CPUCore", "CPUBus", "Memory"]
    );
    let mut core = loaded.get("CPUCore").unwrap();
    assert_eq!(core.read_u32_le().unwrap(), 0xDEAD_BEEF);
    assert_eq!(core.read_u16_le().unwrap(), 0xF000);
}

#[test]
fn trailing_garbage_is_corrupt() {
    let mut bytes = StateBuf::new().to_bytes().unwrap();
    bytes.push(0);
    assert!(matches!(
        StateBuf::from_bytes(&bytes),
        Err(SnapshotError::Corrupt(_))
    ));
}

proptest! {
    #[test]
    fn truncated_files_never_panic(cut in 0usize..64) {
        let mut buf = StateBuf::new();
        buf.insert("CPUCore", vec![7; 20]).unwrap();
        buf.insert("CPUBus", vec![9; 20]).unwrap();
        let bytes = buf.to_bytes().unwrap();
        let cut = cut.min(bytes.len() - 1);
        prop_assert!(StateBuf::from_bytes(&bytes[..cut]).is_err());
    }
}
