//! Bus interface unit: prefetch queue, write buffer and bus timing.
//!
//! The queue holds code bytes by linear address. `pq_head` is the oldest fetched byte
//! not yet consumed and moves with `cseip`, the decoder's code pointer; `pq_tail` is the
//! first byte not yet fetched. `pq_tail - pq_head <= pq_size` at all times (modulo 2^32),
//! so every byte the decoder consumes frees a slot for prefetching.
//!
//! Consumed bytes stay in the ring until overwritten. `instr_start` remembers where the
//! current instruction began so a repeated string instruction can decode itself again
//! from those bytes without another bus cycle.

use std::io::Read;

use pcat_cpu_decoder::ByteSource;
use pcat_mem::MemoryBus;
use pcat_snapshot::{BufferedWrite, ReadLeExt, SnapshotError, WriteLeExt};

use crate::config::CpuConfig;
use crate::paging::{AccessKind, Mmu, PageFault};

pub const PQ_CAPACITY: usize = 16;

/// Idle bus clocks are not banked beyond this.
const MAX_CYCLES_AHEAD: i32 = 64;

/// More writes than one instruction posts before the queue drains at its end.
const MAX_BUFFERED_WRITES: usize = 64;

#[derive(Debug, Clone)]
pub struct BusUnit {
    pq: [u8; PQ_CAPACITY],
    pq_size: u32,
    pq_head: u32,
    pq_tail: u32,
    cseip: u32,
    instr_start: u32,
    pq_valid: bool,
    /// Positive: idle bus clocks available for prefetching. Negative: clocks owed.
    cycles_ahead: i32,
    dram_tx: u32,
    threshold: u32,
    prefetch: bool,
    write_queue: Vec<BufferedWrite>,
    fetch_fault: Option<PageFault>,
    /// Clocks the current instruction spent waiting on the bus.
    stall: u32,
    /// Bus clocks taken by data reads since the last update.
    data_cycles: u32,
}

impl BusUnit {
    pub fn new(config: &CpuConfig) -> Self {
        Self {
            pq: [0; PQ_CAPACITY],
            pq_size: config.model.pq_size() as u32,
            pq_head: 0,
            pq_tail: 0,
            cseip: 0,
            instr_start: 0,
            pq_valid: false,
            cycles_ahead: 0,
            dram_tx: config.dram_tx_cycles.max(1),
            threshold: (config.pq_threshold as u32).clamp(1, config.model.pq_size() as u32),
            prefetch: config.prefetch,
            write_queue: Vec::new(),
            fetch_fault: None,
            stall: 0,
            data_cycles: 0,
        }
    }

    pub fn reset(&mut self) {
        self.pq_valid = false;
        self.pq_head = 0;
        self.pq_tail = 0;
        self.cseip = 0;
        self.instr_start = 0;
        self.cycles_ahead = 0;
        self.write_queue.clear();
        self.fetch_fault = None;
        self.stall = 0;
        self.data_cycles = 0;
    }

    pub fn pq_head(&self) -> u32 {
        self.pq_head
    }

    pub fn pq_tail(&self) -> u32 {
        self.pq_tail
    }

    pub fn cseip(&self) -> u32 {
        self.cseip
    }

    pub fn pq_size(&self) -> u32 {
        self.pq_size
    }

    /// Bytes fetched and not yet consumed.
    pub fn pq_len(&self) -> u32 {
        self.pq_tail.wrapping_sub(self.cseip)
    }

    pub fn pq_valid(&self) -> bool {
        self.pq_valid
    }

    pub fn cycles_ahead(&self) -> i32 {
        self.cycles_ahead
    }

    /// Marks the queue stale; the next instruction refetches from its own address.
    pub fn invalidate_pq(&mut self) {
        self.pq_valid = false;
    }

    /// Starts decoding at linear address `cseip`. The queued bytes are kept when `cseip`
    /// is the next queued byte, or the start of the previous instruction while its bytes
    /// still fit the queue (a repeated string instruction). Anything else restarts the
    /// queue.
    pub fn begin_instruction(&mut self, cseip: u32) {
        self.fetch_fault = None;
        let in_window = cseip.wrapping_sub(self.instr_start)
            <= self.pq_tail.wrapping_sub(self.instr_start)
            && self.pq_tail.wrapping_sub(cseip) <= self.pq_size;
        if !(self.pq_valid && in_window) {
            self.pq_tail = cseip;
            self.pq_valid = true;
        }
        self.pq_head = cseip;
        self.cseip = cseip;
        self.instr_start = cseip;
    }

    /// A page fault hit while the decoder needed a byte; raised after decode.
    pub fn take_fetch_fault(&mut self) -> Option<PageFault> {
        self.fetch_fault.take()
    }

    /// Clocks the current instruction waited on the bus, cleared on read.
    pub fn take_stall(&mut self) -> u32 {
        std::mem::take(&mut self.stall)
    }

    pub fn fetch_u8<B: MemoryBus + ?Sized>(&mut self, bus: &mut B, mmu: &mut Mmu, user: bool) -> u8 {
        if !self.prefetch {
            return self.fetch_direct(bus, mmu, user);
        }
        if self.cseip == self.pq_tail && !self.fill_blocking(bus, mmu, user) {
            self.cseip = self.cseip.wrapping_add(1);
            self.pq_tail = self.cseip;
            self.pq_head = self.cseip;
            self.instr_start = self.cseip;
            return 0;
        }
        let b = self.pq[self.cseip as usize % PQ_CAPACITY];
        self.cseip = self.cseip.wrapping_add(1);
        self.pq_head = self.cseip;
        b
    }

    pub fn fetch_u16<B: MemoryBus + ?Sized>(&mut self, bus: &mut B, mmu: &mut Mmu, user: bool) -> u16 {
        let lo = self.fetch_u8(bus, mmu, user);
        let hi = self.fetch_u8(bus, mmu, user);
        u16::from_le_bytes([lo, hi])
    }

    fn fetch_direct<B: MemoryBus + ?Sized>(&mut self, bus: &mut B, mmu: &mut Mmu, user: bool) -> u8 {
        let linear = self.cseip;
        self.cseip = linear.wrapping_add(1);
        self.pq_head = self.cseip;
        self.pq_tail = self.cseip;
        match mmu.translate(bus, linear, AccessKind::Execute, user) {
            Ok(paddr) => {
                let wait = self.settle_owed() + self.transfer_cost(bus, paddr, 1);
                self.stall += wait;
                let mut b = [0u8];
                self.read_forwarded(bus, paddr, &mut b);
                b[0]
            }
            Err(pf) => {
                self.fetch_fault.get_or_insert(pf);
                0
            }
        }
    }

    /// Stalls the decoder until at least one byte at `pq_tail` is queued.
    fn fill_blocking<B: MemoryBus + ?Sized>(&mut self, bus: &mut B, mmu: &mut Mmu, user: bool) -> bool {
        let paddr = match mmu.translate(bus, self.pq_tail, AccessKind::Execute, user) {
            Ok(p) => p,
            Err(pf) => {
                self.fetch_fault.get_or_insert(pf);
                return false;
            }
        };
        // Only called with the queue drained, so a word always fits.
        let n = if self.pq_tail & 1 == 1 { 1 } else { 2 };
        let wait = self.settle_owed() + self.transfer_cost(bus, paddr, n);
        self.stall += wait;
        self.load_queue(bus, paddr, n);
        true
    }

    fn settle_owed(&mut self) -> u32 {
        if self.cycles_ahead < 0 {
            let owed = self.cycles_ahead.unsigned_abs();
            self.cycles_ahead = 0;
            owed
        } else {
            self.cycles_ahead = 0;
            0
        }
    }

    fn load_queue<B: MemoryBus + ?Sized>(&mut self, bus: &mut B, paddr: u32, n: u32) {
        let mut buf = [0u8; 2];
        let buf = &mut buf[..n as usize];
        self.read_forwarded(bus, paddr, buf);
        for b in buf.iter() {
            self.pq[self.pq_tail as usize % PQ_CAPACITY] = *b;
            self.pq_tail = self.pq_tail.wrapping_add(1);
        }
    }

    /// Bus clocks of moving `len` bytes at `paddr` over the 16-bit bus.
    fn transfer_cost<B: MemoryBus + ?Sized>(&self, bus: &B, paddr: u32, len: u32) -> u32 {
        let last = paddr.wrapping_add(len.max(1) - 1);
        let transfers = (last >> 1).wrapping_sub(paddr >> 1).wrapping_add(1).min(4);
        transfers * (self.dram_tx + bus.wait_states(paddr))
    }

    /// End of an instruction: `cycles` execution clocks have elapsed. Pending writes are
    /// retired, a stale queue restarts at `cseip` (the current code pointer), then
    /// whatever bus time is left over is spent prefetching.
    pub fn update<B: MemoryBus + ?Sized>(
        &mut self,
        bus: &mut B,
        mmu: &mut Mmu,
        user: bool,
        cseip: u32,
        cycles: u32,
    ) {
        let idle = cycles.saturating_sub(std::mem::take(&mut self.data_cycles));
        self.cycles_ahead = self
            .cycles_ahead
            .saturating_add(idle.min(MAX_CYCLES_AHEAD as u32) as i32)
            .min(MAX_CYCLES_AHEAD);
        self.flush_writes(bus);

        if !self.prefetch {
            return;
        }
        if !self.pq_valid {
            self.pq_head = cseip;
            self.pq_tail = cseip;
            self.cseip = cseip;
            self.instr_start = cseip;
            self.pq_valid = true;
        }
        loop {
            let free = self.pq_size - self.pq_tail.wrapping_sub(self.pq_head);
            if free < self.threshold {
                if free == 0 && self.cycles_ahead > 0 {
                    self.cycles_ahead = 0;
                }
                break;
            }
            let n = if self.pq_tail & 1 == 1 { 1 } else { 2.min(free) };
            let Ok(paddr) = mmu.translate(bus, self.pq_tail, AccessKind::Execute, user) else {
                // Prefetching never faults; the decoder reports it if it gets there.
                break;
            };
            let cost = self.transfer_cost(bus, paddr, n) as i32;
            if self.cycles_ahead < cost {
                break;
            }
            self.cycles_ahead -= cost;
            self.load_queue(bus, paddr, n);
        }
    }

    /// Reads physical memory as the executor sees it: pending buffered writes win.
    pub fn read<B: MemoryBus + ?Sized>(&mut self, bus: &mut B, paddr: u32, buf: &mut [u8]) {
        let cost = self.transfer_cost(bus, paddr, buf.len() as u32);
        let wait_states = bus.wait_states(paddr);
        self.data_cycles += cost;
        // Table timings assume zero-wait-state memory.
        self.stall += cost / (self.dram_tx + wait_states) * wait_states;
        self.read_forwarded(bus, paddr, buf);
    }

    fn read_forwarded<B: MemoryBus + ?Sized>(&self, bus: &mut B, paddr: u32, buf: &mut [u8]) {
        bus.read_bytes(paddr, buf);
        for w in &self.write_queue {
            let bytes = w.data.to_le_bytes();
            for (i, slot) in buf.iter_mut().enumerate() {
                let addr = paddr.wrapping_add(i as u32);
                let off = addr.wrapping_sub(w.paddr);
                if off < u32::from(w.len) {
                    *slot = bytes[off as usize];
                }
            }
        }
    }

    /// Buffers a write of up to four bytes; it reaches memory at the next update.
    pub fn write(&mut self, paddr: u32, bytes: &[u8]) {
        let mut data = [0u8; 4];
        data[..bytes.len()].copy_from_slice(bytes);
        self.write_queue.push(BufferedWrite {
            paddr,
            len: bytes.len() as u8,
            data: u32::from_le_bytes(data),
        });
    }

    pub fn pending_writes(&self) -> usize {
        self.write_queue.len()
    }

    /// Retires all buffered writes in order.
    pub fn flush_writes<B: MemoryBus + ?Sized>(&mut self, bus: &mut B) {
        for w in std::mem::take(&mut self.write_queue) {
            let cost = self.transfer_cost(bus, w.paddr, u32::from(w.len)) as i32;
            self.cycles_ahead -= cost;
            bus.write_bytes(w.paddr, &w.data.to_le_bytes()[..usize::from(w.len)]);
        }
    }

    pub(crate) fn save(&self, out: &mut Vec<u8>) -> Result<(), SnapshotError> {
        out.write_bytes(&self.pq)?;
        out.write_u32_le(self.pq_head)?;
        out.write_u32_le(self.pq_tail)?;
        out.write_u32_le(self.cseip)?;
        out.write_u32_le(self.instr_start)?;
        out.write_bool(self.pq_valid)?;
        out.write_u32_le(self.cycles_ahead as u32)?;
        out.write_buffered_writes(&self.write_queue)
    }

    pub(crate) fn restore(&mut self, mut data: &[u8]) -> Result<(), SnapshotError> {
        let r = &mut data;
        r.read_exact(&mut self.pq)?;
        self.pq_head = r.read_u32_le()?;
        self.pq_tail = r.read_u32_le()?;
        self.cseip = r.read_u32_le()?;
        self.instr_start = r.read_u32_le()?;
        self.pq_valid = r.read_bool()?;
        self.cycles_ahead = r.read_u32_le()? as i32;
        if self.pq_tail.wrapping_sub(self.pq_head) > self.pq_size || self.cseip != self.pq_head {
            return Err(SnapshotError::Corrupt("prefetch queue pointers out of order"));
        }
        self.write_queue = r.read_buffered_writes(MAX_BUFFERED_WRITES)?;
        if !r.is_empty() {
            return Err(SnapshotError::Corrupt("trailing bytes in bus unit state"));
        }
        self.fetch_fault = None;
        self.stall = 0;
        self.data_cycles = 0;
        Ok(())
    }
}

/// Feeds the decoder from the prefetch queue.
pub(crate) struct Fetcher<'a, B: ?Sized> {
    pub unit: &'a mut BusUnit,
    pub bus: &'a mut B,
    pub mmu: &'a mut Mmu,
    pub user: bool,
}

impl<B: MemoryBus + ?Sized> ByteSource for Fetcher<'_, B> {
    fn fetch_u8(&mut self) -> u8 {
        self.unit.fetch_u8(self.bus, self.mmu, self.user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pcat_cpu_decoder::CpuModel;

    struct Ram(Vec<u8>);

    impl MemoryBus for Ram {
        fn read_u8(&mut self, paddr: u32) -> u8 {
            self.0.get(paddr as usize).copied().unwrap_or(0xFF)
        }

        fn write_u8(&mut self, paddr: u32, val: u8) {
            if let Some(b) = self.0.get_mut(paddr as usize) {
                *b = val;
            }
        }
    }

    fn ram() -> Ram {
        Ram((0..=255u8).cycle().take(0x1000).collect())
    }

    #[test]
    fn empty_queue_fetch_stalls_then_prefetch_fills_idle_time() {
        let mut unit = BusUnit::new(&CpuConfig::new(CpuModel::I80286));
        let (mut bus, mut mmu) = (ram(), Mmu::new());
        unit.begin_instruction(0x100);
        assert_eq!(unit.fetch_u8(&mut bus, &mut mmu, false), 0x00);
        assert_eq!(unit.take_stall(), 2);
        // The word fetch brought in 0x101 as well.
        assert_eq!(unit.pq_len(), 1);

        let next = unit.cseip();
        unit.update(&mut bus, &mut mmu, false, next, 20);
        // Two words fit; the last free slot is below the prefetch threshold.
        assert_eq!(unit.pq_tail(), 0x106);
        assert_eq!(unit.pq_len(), 5);
        unit.begin_instruction(unit.cseip());
        for expect in 1..=5u8 {
            assert_eq!(unit.fetch_u8(&mut bus, &mut mmu, false), expect);
        }
        assert_eq!(unit.take_stall(), 0);
    }

    #[test]
    fn consumed_bytes_free_slots_for_the_next_prefetch() {
        let mut unit = BusUnit::new(&CpuConfig::new(CpuModel::I80286));
        let (mut bus, mut mmu) = (ram(), Mmu::new());
        unit.begin_instruction(0x100);
        unit.update(&mut bus, &mut mmu, false, 0x100, 100);
        assert_eq!(unit.pq_len(), 6);

        for expect in 0..4u8 {
            assert_eq!(unit.fetch_u8(&mut bus, &mut mmu, false), expect);
        }
        assert_eq!(unit.pq_head(), 0x104);
        assert_eq!(unit.pq_len(), 2);

        unit.update(&mut bus, &mut mmu, false, 0x104, 100);
        assert_eq!(unit.pq_head(), 0x104);
        assert_eq!(unit.pq_tail(), 0x10A);
        unit.begin_instruction(0x104);
        for expect in 4..10u8 {
            assert_eq!(unit.fetch_u8(&mut bus, &mut mmu, false), expect);
        }
        assert_eq!(unit.take_stall(), 0);
    }

    #[test]
    fn owed_cycles_are_settled_by_the_next_stall() {
        let mut unit = BusUnit::new(&CpuConfig::new(CpuModel::I80286));
        let (mut bus, mut mmu) = (ram(), Mmu::new());
        unit.begin_instruction(0x200);
        unit.write(0x800, &[1, 2]);
        unit.write(0x803, &[3, 4]);
        unit.update(&mut bus, &mut mmu, false, 0x200, 0);
        assert_eq!(unit.cycles_ahead(), -6);
        assert_eq!(&bus.0[0x800..0x805], &[1, 2, 0x02, 3, 4]);

        unit.begin_instruction(unit.cseip());
        unit.fetch_u8(&mut bus, &mut mmu, false);
        assert_eq!(unit.take_stall(), 6 + 2);
        assert_eq!(unit.cycles_ahead(), 0);
    }

    #[test]
    fn reads_see_buffered_writes() {
        let mut unit = BusUnit::new(&CpuConfig::new(CpuModel::I80386));
        let mut bus = ram();
        unit.write(0x10, &[0xAA, 0xBB]);
        unit.write(0x11, &[0xCC]);
        let mut buf = [0u8; 4];
        unit.read(&mut bus, 0x0F, &mut buf);
        assert_eq!(buf, [0x0F, 0xAA, 0xCC, 0x12]);
        assert_eq!(bus.0[0x10], 0x10);
    }

    #[test]
    fn repeated_instruction_reuses_queued_bytes() {
        let mut unit = BusUnit::new(&CpuConfig::new(CpuModel::I80286));
        let (mut bus, mut mmu) = (ram(), Mmu::new());
        unit.begin_instruction(0x40);
        unit.fetch_u16(&mut bus, &mut mmu, false);
        unit.take_stall();
        unit.begin_instruction(0x40);
        assert_eq!(unit.fetch_u8(&mut bus, &mut mmu, false), 0x40);
        assert_eq!(unit.take_stall(), 0);
    }

    #[test]
    fn stale_queue_restarts_at_code_pointer() {
        let mut unit = BusUnit::new(&CpuConfig::new(CpuModel::I80286));
        let (mut bus, mut mmu) = (ram(), Mmu::new());
        unit.begin_instruction(0x40);
        unit.fetch_u8(&mut bus, &mut mmu, false);
        unit.invalidate_pq();
        unit.invalidate_pq();
        unit.update(&mut bus, &mut mmu, false, 0x300, 0);
        assert_eq!(unit.pq_head(), 0x300);
        assert_eq!(unit.pq_tail(), 0x300);
        assert_eq!(unit.cseip(), 0x300);
        assert!(unit.pq_valid());
    }

    #[test]
    fn state_round_trips() {
        let mut unit = BusUnit::new(&CpuConfig::new(CpuModel::I80286));
        let (mut bus, mut mmu) = (ram(), Mmu::new());
        unit.begin_instruction(0x40);
        unit.fetch_u8(&mut bus, &mut mmu, false);
        unit.update(&mut bus, &mut mmu, false, 0x41, 9);
        unit.write(0x800, &[0xAA, 0xBB]);
        let mut blob = Vec::new();
        unit.save(&mut blob).unwrap();

        let mut other = BusUnit::new(&CpuConfig::new(CpuModel::I80286));
        other.restore(&blob).unwrap();
        assert_eq!(other.pq_head(), unit.pq_head());
        assert_eq!(other.pq_tail(), unit.pq_tail());
        assert_eq!(other.cseip(), unit.cseip());
        assert_eq!(other.cycles_ahead(), unit.cycles_ahead());
        assert_eq!(other.pending_writes(), 1);
        other.flush_writes(&mut bus);
        assert_eq!(bus.0[0x800..0x802], [0xAA, 0xBB]);
        assert!(other.restore(&blob[..blob.len() - 1]).is_err());
    }
}
