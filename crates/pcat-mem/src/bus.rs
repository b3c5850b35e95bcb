/// Physical memory as seen from the CPU bus.
///
/// Accesses are infallible: unmapped addresses float high and writes to them are dropped.
/// Multi-byte accessors are little-endian and may be overridden by implementations that
/// can service them faster than byte-by-byte.
pub trait MemoryBus {
    fn read_u8(&mut self, paddr: u32) -> u8;
    fn write_u8(&mut self, paddr: u32, val: u8);

    fn read_u16(&mut self, paddr: u32) -> u16 {
        u16::from_le_bytes([self.read_u8(paddr), self.read_u8(paddr.wrapping_add(1))])
    }

    fn read_u32(&mut self, paddr: u32) -> u32 {
        let mut buf = [0u8; 4];
        self.read_bytes(paddr, &mut buf);
        u32::from_le_bytes(buf)
    }

    fn write_u16(&mut self, paddr: u32, val: u16) {
        self.write_bytes(paddr, &val.to_le_bytes());
    }

    fn write_u32(&mut self, paddr: u32, val: u32) {
        self.write_bytes(paddr, &val.to_le_bytes());
    }

    fn read_bytes(&mut self, paddr: u32, buf: &mut [u8]) {
        for (i, slot) in buf.iter_mut().enumerate() {
            *slot = self.read_u8(paddr.wrapping_add(i as u32));
        }
    }

    fn write_bytes(&mut self, paddr: u32, buf: &[u8]) {
        for (i, byte) in buf.iter().enumerate() {
            self.write_u8(paddr.wrapping_add(i as u32), *byte);
        }
    }

    /// Extra bus cycles a single transfer to `paddr` costs on top of the zero-wait-state
    /// DRAM timing.
    fn wait_states(&self, _paddr: u32) -> u32 {
        0
    }
}

impl<T: MemoryBus + ?Sized> MemoryBus for &mut T {
    fn read_u8(&mut self, paddr: u32) -> u8 {
        (**self).read_u8(paddr)
    }

    fn write_u8(&mut self, paddr: u32, val: u8) {
        (**self).write_u8(paddr, val)
    }

    fn read_u16(&mut self, paddr: u32) -> u16 {
        (**self).read_u16(paddr)
    }

    fn read_u32(&mut self, paddr: u32) -> u32 {
        (**self).read_u32(paddr)
    }

    fn write_u16(&mut self, paddr: u32, val: u16) {
        (**self).write_u16(paddr, val)
    }

    fn write_u32(&mut self, paddr: u32, val: u32) {
        (**self).write_u32(paddr, val)
    }

    fn read_bytes(&mut self, paddr: u32, buf: &mut [u8]) {
        (**self).read_bytes(paddr, buf)
    }

    fn write_bytes(&mut self, paddr: u32, buf: &[u8]) {
        (**self).write_bytes(paddr, buf)
    }

    fn wait_states(&self, paddr: u32) -> u32 {
        (**self).wait_states(paddr)
    }
}

/// Port I/O as seen from the CPU.
///
/// `size` is always 1, 2 or 4.
pub trait IoBus {
    fn io_read(&mut self, port: u16, size: u8) -> u32;
    fn io_write(&mut self, port: u16, size: u8, val: u32);
}

impl<T: IoBus + ?Sized> IoBus for &mut T {
    fn io_read(&mut self, port: u16, size: u8) -> u32 {
        (**self).io_read(port, size)
    }

    fn io_write(&mut self, port: u16, size: u8, val: u32) {
        (**self).io_write(port, size, val)
    }
}

/// An I/O space with nothing attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoIo;

impl IoBus for NoIo {
    fn io_read(&mut self, _port: u16, size: u8) -> u32 {
        all_ones(size)
    }

    fn io_write(&mut self, _port: u16, _size: u8, _val: u32) {}
}

pub(crate) fn all_ones(size: u8) -> u32 {
    match size {
        1 => 0xFF,
        2 => 0xFFFF,
        _ => 0xFFFF_FFFF,
    }
}
