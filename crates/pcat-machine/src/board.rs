use pcat_mem::{IoBus, IoPorts, Memory, MemoryBus};

/// System control port A: bit 1 drives the A20 line, writing bit 0 pulses a reset.
pub const SYSTEM_CONTROL_A: u16 = 0x92;

/// Everything the processor reaches outside the chip.
pub(crate) struct Board {
    pub mem: Memory,
    pub io: IoPorts,
    pub a20_gate: bool,
    reset_requested: bool,
}

impl Board {
    pub fn new(mem: Memory, io: IoPorts, a20_gate: bool) -> Self {
        Self {
            mem,
            io,
            a20_gate,
            reset_requested: false,
        }
    }

    pub fn take_reset_request(&mut self) -> bool {
        std::mem::take(&mut self.reset_requested)
    }

    fn owns_port(&self, port: u16, size: u8) -> bool {
        self.a20_gate && port == SYSTEM_CONTROL_A && size == 1
    }
}

impl MemoryBus for Board {
    fn read_u8(&mut self, paddr: u32) -> u8 {
        self.mem.read_u8(paddr)
    }

    fn write_u8(&mut self, paddr: u32, val: u8) {
        self.mem.write_u8(paddr, val)
    }

    fn read_u16(&mut self, paddr: u32) -> u16 {
        self.mem.read_u16(paddr)
    }

    fn read_u32(&mut self, paddr: u32) -> u32 {
        self.mem.read_u32(paddr)
    }

    fn write_u16(&mut self, paddr: u32, val: u16) {
        self.mem.write_u16(paddr, val)
    }

    fn write_u32(&mut self, paddr: u32, val: u32) {
        self.mem.write_u32(paddr, val)
    }

    fn wait_states(&self, paddr: u32) -> u32 {
        self.mem.wait_states(paddr)
    }
}

impl IoBus for Board {
    fn io_read(&mut self, port: u16, size: u8) -> u32 {
        if self.owns_port(port, size) {
            return u32::from(self.mem.a20_enabled()) << 1;
        }
        self.io.io_read(port, size)
    }

    fn io_write(&mut self, port: u16, size: u8, val: u32) {
        if self.owns_port(port, size) {
            self.mem.set_a20(val & 0x02 != 0);
            if val & 0x01 != 0 {
                tracing::debug!("reset requested through port 0x92");
                self.reset_requested = true;
            }
            return;
        }
        self.io.io_write(port, size, val)
    }
}
