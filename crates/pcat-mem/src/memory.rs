use std::fmt;

use thiserror::Error;

use crate::bus::MemoryBus;
use crate::OPEN_BUS;

/// A device that answers physical memory accesses within a registered window.
///
/// `offset` is relative to the start of the window and `size` is 1, 2 or 4. Accesses that
/// straddle the end of the window are split into byte accesses before reaching the handler.
pub trait MmioHandler {
    fn read(&mut self, offset: u32, size: u8) -> u32;
    fn write(&mut self, offset: u32, size: u8, val: u32);
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("region at {start:#x} has zero length")]
    EmptyRegion { start: u32 },
    #[error(
        "region [{start:#x}, {end:#x}) overlaps existing region [{other_start:#x}, {other_end:#x})"
    )]
    Overlap {
        start: u64,
        end: u64,
        other_start: u64,
        other_end: u64,
    },
    #[error("region [{start:#x}, {end:#x}) lies outside the {bits}-bit physical address space")]
    OutOfRange { start: u64, end: u64, bits: u8 },
    #[error("image of {len} bytes at {addr:#x} does not fit in {ram_size} bytes of RAM")]
    LoadOutOfRange {
        addr: u32,
        len: usize,
        ram_size: usize,
    },
}

/// What backs a mapped region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Rom,
    Mmio,
}

enum Backing {
    Rom(Vec<u8>),
    Mmio(Box<dyn MmioHandler>),
}

struct Region {
    start: u32,
    len: u32,
    wait_states: u32,
    backing: Backing,
}

impl Region {
    fn end(&self) -> u64 {
        u64::from(self.start) + u64::from(self.len)
    }

    fn contains(&self, addr: u32) -> bool {
        addr >= self.start && u64::from(addr) < self.end()
    }

    fn kind(&self) -> RegionKind {
        match self.backing {
            Backing::Rom(_) => RegionKind::Rom,
            Backing::Mmio(_) => RegionKind::Mmio,
        }
    }
}

/// The physical address space: RAM from address zero, with ROM and MMIO windows layered on
/// top. Windows take priority over RAM; addresses backed by neither read as open bus.
pub struct Memory {
    ram: Vec<u8>,
    // Sorted by start address and pairwise disjoint.
    regions: Vec<Region>,
    addr_bits: u8,
    addr_mask: u32,
    a20_enabled: bool,
    ram_wait_states: u32,
}

impl fmt::Debug for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let regions: Vec<_> = self
            .regions
            .iter()
            .map(|r| (r.start, r.len, r.kind()))
            .collect();
        f.debug_struct("Memory")
            .field("ram_size", &self.ram.len())
            .field("regions", &regions)
            .field("addr_bits", &self.addr_bits)
            .field("a20_enabled", &self.a20_enabled)
            .finish()
    }
}

impl Memory {
    /// Creates an address space with `ram_size` bytes of zeroed RAM and `addr_bits` physical
    /// address lines (24 on a 286, 32 on a 386).
    pub fn new(ram_size: usize, addr_bits: u8) -> Self {
        let addr_bits = addr_bits.clamp(20, 32);
        let addr_mask = if addr_bits == 32 {
            u32::MAX
        } else {
            (1u32 << addr_bits) - 1
        };
        Self {
            ram: vec![0; ram_size],
            regions: Vec::new(),
            addr_bits,
            addr_mask,
            a20_enabled: true,
            ram_wait_states: 0,
        }
    }

    pub fn ram_size(&self) -> usize {
        self.ram.len()
    }

    pub fn ram(&self) -> &[u8] {
        &self.ram
    }

    pub fn ram_mut(&mut self) -> &mut [u8] {
        &mut self.ram
    }

    pub fn addr_bits(&self) -> u8 {
        self.addr_bits
    }

    pub fn a20_enabled(&self) -> bool {
        self.a20_enabled
    }

    pub fn set_a20(&mut self, enabled: bool) {
        if enabled != self.a20_enabled {
            tracing::debug!(enabled, "A20 gate changed");
        }
        self.a20_enabled = enabled;
    }

    pub fn set_ram_wait_states(&mut self, wait_states: u32) {
        self.ram_wait_states = wait_states;
    }

    /// Copies `data` into RAM at `addr`, bypassing any window mapped over it.
    pub fn load(&mut self, addr: u32, data: &[u8]) -> Result<(), MemoryError> {
        let start = addr as usize;
        let end = start
            .checked_add(data.len())
            .filter(|&end| end <= self.ram.len())
            .ok_or(MemoryError::LoadOutOfRange {
                addr,
                len: data.len(),
                ram_size: self.ram.len(),
            })?;
        self.ram[start..end].copy_from_slice(data);
        Ok(())
    }

    /// Maps a read-only window. Writes to it are dropped.
    pub fn map_rom(
        &mut self,
        start: u32,
        data: Vec<u8>,
        wait_states: u32,
    ) -> Result<(), MemoryError> {
        let len = u32::try_from(data.len()).map_err(|_| MemoryError::OutOfRange {
            start: u64::from(start),
            end: u64::from(start) + data.len() as u64,
            bits: self.addr_bits,
        })?;
        self.insert_region(Region {
            start,
            len,
            wait_states,
            backing: Backing::Rom(data),
        })
    }

    pub fn map_mmio(
        &mut self,
        start: u32,
        len: u32,
        handler: Box<dyn MmioHandler>,
        wait_states: u32,
    ) -> Result<(), MemoryError> {
        self.insert_region(Region {
            start,
            len,
            wait_states,
            backing: Backing::Mmio(handler),
        })
    }

    /// Removes the window starting exactly at `start`, returning what backed it.
    pub fn unmap(&mut self, start: u32) -> Option<RegionKind> {
        let idx = self.regions.iter().position(|r| r.start == start)?;
        Some(self.regions.remove(idx).kind())
    }

    fn insert_region(&mut self, region: Region) -> Result<(), MemoryError> {
        if region.len == 0 {
            return Err(MemoryError::EmptyRegion {
                start: region.start,
            });
        }
        let limit = u64::from(self.addr_mask) + 1;
        if region.end() > limit {
            return Err(MemoryError::OutOfRange {
                start: u64::from(region.start),
                end: region.end(),
                bits: self.addr_bits,
            });
        }

        let idx = self.regions.partition_point(|r| r.start < region.start);
        let neighbours = [idx.checked_sub(1), Some(idx)];
        for other in neighbours.into_iter().flatten() {
            let Some(other) = self.regions.get(other) else {
                continue;
            };
            let disjoint =
                region.end() <= u64::from(other.start) || other.end() <= u64::from(region.start);
            if !disjoint {
                return Err(MemoryError::Overlap {
                    start: u64::from(region.start),
                    end: region.end(),
                    other_start: u64::from(other.start),
                    other_end: other.end(),
                });
            }
        }

        self.regions.insert(idx, region);
        Ok(())
    }

    fn line_mask(&self) -> u32 {
        if self.a20_enabled {
            self.addr_mask
        } else {
            self.addr_mask & !(1 << 20)
        }
    }

    fn find_region(&self, addr: u32) -> Option<usize> {
        let idx = self.regions.partition_point(|r| r.start <= addr);
        let cand = idx.checked_sub(1)?;
        self.regions[cand].contains(addr).then_some(cand)
    }

    /// Serves a wide access from a single MMIO handler when the whole access lands in one
    /// window without being split by A20 or the address mask.
    fn mmio_span(&self, paddr: u32, size: u8) -> Option<(usize, u32)> {
        let mask = self.line_mask();
        let first = paddr & mask;
        let last = paddr.wrapping_add(u32::from(size) - 1) & mask;
        if last.wrapping_sub(first) != u32::from(size) - 1 {
            return None;
        }
        let idx = self.find_region(first)?;
        let region = &self.regions[idx];
        if !region.contains(last) || !matches!(region.backing, Backing::Mmio(_)) {
            return None;
        }
        Some((idx, first - region.start))
    }

    fn read_wide(&mut self, paddr: u32, size: u8) -> u32 {
        if let Some((idx, offset)) = self.mmio_span(paddr, size) {
            if let Backing::Mmio(handler) = &mut self.regions[idx].backing {
                return handler.read(offset, size);
            }
        }
        let mut val = 0u32;
        for i in 0..u32::from(size) {
            val |= u32::from(self.read_u8(paddr.wrapping_add(i))) << (i * 8);
        }
        val
    }

    fn write_wide(&mut self, paddr: u32, size: u8, val: u32) {
        if let Some((idx, offset)) = self.mmio_span(paddr, size) {
            if let Backing::Mmio(handler) = &mut self.regions[idx].backing {
                handler.write(offset, size, val);
                return;
            }
        }
        for i in 0..u32::from(size) {
            self.write_u8(paddr.wrapping_add(i), (val >> (i * 8)) as u8);
        }
    }
}

impl MemoryBus for Memory {
    fn read_u8(&mut self, paddr: u32) -> u8 {
        let addr = paddr & self.line_mask();
        if let Some(idx) = self.find_region(addr) {
            let region = &mut self.regions[idx];
            let offset = addr - region.start;
            return match &mut region.backing {
                Backing::Rom(data) => data[offset as usize],
                Backing::Mmio(handler) => handler.read(offset, 1) as u8,
            };
        }
        self.ram.get(addr as usize).copied().unwrap_or(OPEN_BUS)
    }

    fn write_u8(&mut self, paddr: u32, val: u8) {
        let addr = paddr & self.line_mask();
        if let Some(idx) = self.find_region(addr) {
            let region = &mut self.regions[idx];
            let offset = addr - region.start;
            if let Backing::Mmio(handler) = &mut region.backing {
                handler.write(offset, 1, u32::from(val));
            }
            return;
        }
        if let Some(slot) = self.ram.get_mut(addr as usize) {
            *slot = val;
        }
    }

    fn read_u16(&mut self, paddr: u32) -> u16 {
        self.read_wide(paddr, 2) as u16
    }

    fn read_u32(&mut self, paddr: u32) -> u32 {
        self.read_wide(paddr, 4)
    }

    fn write_u16(&mut self, paddr: u32, val: u16) {
        self.write_wide(paddr, 2, u32::from(val));
    }

    fn write_u32(&mut self, paddr: u32, val: u32) {
        self.write_wide(paddr, 4, val);
    }

    fn wait_states(&self, paddr: u32) -> u32 {
        match self.find_region(paddr & self.line_mask()) {
            Some(idx) => self.regions[idx].wait_states,
            None => self.ram_wait_states,
        }
    }
}
