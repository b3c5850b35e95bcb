use std::collections::HashMap;

use crate::bus::{all_ones, IoBus};
use crate::MemoryError;

/// A device attached to one or more I/O ports.
pub trait PortHandler {
    fn read(&mut self, port: u16, size: u8) -> u32;
    fn write(&mut self, port: u16, size: u8, val: u32);

    /// Returns the device to its power-on state.
    fn reset(&mut self) {}
}

struct PortRange {
    start: u16,
    len: u16,
    handler: Box<dyn PortHandler>,
}

impl PortRange {
    fn end(&self) -> u32 {
        u32::from(self.start) + u32::from(self.len)
    }

    fn contains(&self, port: u16) -> bool {
        port >= self.start && u32::from(port) < self.end()
    }
}

/// The 64 KiB I/O port space.
///
/// Ranges are kept sorted and disjoint. Reads from unassigned ports float high; the first
/// access to each unassigned port is logged.
#[derive(Default)]
pub struct IoPorts {
    ranges: Vec<PortRange>,
    // Accesses seen per unassigned port, for diagnostics.
    unassigned: HashMap<u16, u64>,
}

impl IoPorts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        start: u16,
        len: u16,
        handler: Box<dyn PortHandler>,
    ) -> Result<(), MemoryError> {
        let end = u64::from(start) + u64::from(len);
        if len == 0 {
            return Err(MemoryError::EmptyRegion {
                start: u32::from(start),
            });
        }
        if end > 0x1_0000 {
            return Err(MemoryError::OutOfRange {
                start: u64::from(start),
                end,
                bits: 16,
            });
        }

        let idx = self.ranges.partition_point(|r| r.start < start);
        for other in [idx.checked_sub(1), Some(idx)].into_iter().flatten() {
            let Some(other) = self.ranges.get(other) else {
                continue;
            };
            if !(end <= u64::from(other.start) || u64::from(other.end()) <= u64::from(start)) {
                return Err(MemoryError::Overlap {
                    start: u64::from(start),
                    end,
                    other_start: u64::from(other.start),
                    other_end: u64::from(other.end()),
                });
            }
        }

        self.ranges.insert(idx, PortRange { start, len, handler });
        Ok(())
    }

    pub fn unregister(&mut self, start: u16) -> Option<Box<dyn PortHandler>> {
        let idx = self.ranges.iter().position(|r| r.start == start)?;
        Some(self.ranges.remove(idx).handler)
    }

    pub fn reset(&mut self) {
        for range in &mut self.ranges {
            range.handler.reset();
        }
    }

    /// Number of accesses that hit `port` while nothing was attached to it.
    pub fn unassigned_accesses(&self, port: u16) -> u64 {
        self.unassigned.get(&port).copied().unwrap_or(0)
    }

    fn find(&mut self, port: u16) -> Option<&mut PortRange> {
        let idx = self.ranges.partition_point(|r| r.start <= port);
        let range = self.ranges.get_mut(idx.checked_sub(1)?)?;
        range.contains(port).then_some(range)
    }

    fn note_unassigned(&mut self, port: u16, write: bool) {
        let count = self.unassigned.entry(port).or_default();
        *count += 1;
        if *count == 1 {
            tracing::warn!(port = format_args!("{port:#06x}"), write, "unassigned I/O port");
        }
    }
}

impl IoBus for IoPorts {
    fn io_read(&mut self, port: u16, size: u8) -> u32 {
        if let Some(range) = self.find(port) {
            return range.handler.read(port, size);
        }
        self.note_unassigned(port, false);
        all_ones(size)
    }

    fn io_write(&mut self, port: u16, size: u8, val: u32) {
        if let Some(range) = self.find(port) {
            range.handler.write(port, size, val);
            return;
        }
        self.note_unassigned(port, true);
    }
}
