use std::cell::RefCell;
use std::rc::Rc;

use pcat_mem::{Memory, MemoryBus, MmioHandler, RegionKind, OPEN_BUS};

#[derive(Default)]
struct Recorder {
    accesses: Vec<(bool, u32, u8, u32)>,
}

struct SharedRecorder(Rc<RefCell<Recorder>>);

impl MmioHandler for SharedRecorder {
    fn read(&mut self, offset: u32, size: u8) -> u32 {
        self.0.borrow_mut().accesses.push((false, offset, size, 0));
        0x5A
    }

    fn write(&mut self, offset: u32, size: u8, val: u32) {
        self.0.borrow_mut().accesses.push((true, offset, size, val));
    }
}

#[test]
fn rom_shadows_ram_and_ignores_writes() {
    let mut mem = Memory::new(0x10_0000, 24);
    mem.load(0xF0000, &[0x11, 0x22]).unwrap();
    mem.map_rom(0xF0000, vec![0xEA, 0x5B], 2).unwrap();

    assert_eq!(mem.read_u16(0xF0000), 0x5BEA);
    mem.write_u8(0xF0000, 0x00);
    assert_eq!(mem.read_u8(0xF0000), 0xEA);
    assert_eq!(mem.wait_states(0xF0001), 2);
    assert_eq!(mem.wait_states(0x1000), 0);

    assert_eq!(mem.unmap(0xF0000), Some(RegionKind::Rom));
    assert_eq!(mem.read_u16(0xF0000), 0x2211);
}

#[test]
fn unmapped_addresses_read_open_bus() {
    let mut mem = Memory::new(0x1000, 24);
    assert_eq!(mem.read_u8(0x2000), OPEN_BUS);
    assert_eq!(mem.read_u16(0x0FFF), 0xFF00);
    mem.write_u8(0x2000, 0x12);
    assert_eq!(mem.read_u8(0x2000), OPEN_BUS);
}

#[test]
fn mmio_receives_whole_accesses_inside_window() {
    let rec = Rc::new(RefCell::new(Recorder::default()));
    let mut mem = Memory::new(0x1000, 32);
    mem.map_mmio(0xA0000, 0x10, Box::new(SharedRecorder(rec.clone())), 1)
        .unwrap();

    mem.write_u32(0xA0004, 0xDEAD_BEEF);
    mem.write_u16(0xA000F, 0xAABB);
    let _ = mem.read_u16(0xA0002);

    let log = rec.borrow().accesses.clone();
    assert_eq!(log[0], (true, 4, 4, 0xDEAD_BEEF));
    // The straddling word is split: one byte lands in the window, the other is dropped.
    assert_eq!(log[1], (true, 0xF, 1, 0xBB));
    assert_eq!(log[2], (false, 2, 2, 0));
    assert_eq!(log.len(), 3);
}

#[test]
fn load_checks_ram_bounds() {
    let mut mem = Memory::new(0x100, 24);
    assert!(mem.load(0xF0, &[0; 0x10]).is_ok());
    assert!(mem.load(0xF1, &[0; 0x10]).is_err());
}
