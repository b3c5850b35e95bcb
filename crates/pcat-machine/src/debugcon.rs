//! Byte sink at I/O port 0xE9, the Bochs/QEMU debug console.

use std::cell::RefCell;
use std::rc::Rc;

use pcat_mem::PortHandler;

pub const DEBUGCON_PORT: u16 = 0xE9;

/// Output captured from the guest, shared between the port handler and the machine.
pub type DebugConLog = Rc<RefCell<Vec<u8>>>;

#[derive(Debug)]
pub struct DebugCon {
    log: DebugConLog,
}

impl DebugCon {
    pub fn new(log: DebugConLog) -> Self {
        Self { log }
    }
}

impl PortHandler for DebugCon {
    /// Reads return 0xE9 so guests can probe for the device.
    fn read(&mut self, _port: u16, _size: u8) -> u32 {
        u32::from(DEBUGCON_PORT as u8)
    }

    fn write(&mut self, _port: u16, size: u8, val: u32) {
        let bytes = val.to_le_bytes();
        let len = usize::from(size).clamp(1, 4);
        self.log.borrow_mut().extend_from_slice(&bytes[..len]);
    }

    fn reset(&mut self) {
        self.log.borrow_mut().clear();
    }
}
