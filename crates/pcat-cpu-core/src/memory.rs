//! Segmented and linear memory access: limit and type checks, paging translation, and
//! the stack.

use pcat_cpu_decoder::Seg;

use crate::cpu::{Cpu, SegReg, Width};
use crate::fault::{CpuFault, Fallible};
use crate::paging::{AccessKind, PageFault};
use crate::SystemBus;

/// Physical placement of one access: a single span, or two when it straddles a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Spans {
    first: (u32, u32),
    second: Option<(u32, u32)>,
}

impl Cpu {
    fn segment_fault(sreg: &SegReg, stack: bool) -> CpuFault {
        let code = sreg.selector.error_code();
        if stack {
            CpuFault::ss(code)
        } else {
            CpuFault::gp(code)
        }
    }

    /// Limit and type check of `len` bytes at `off` through `sreg`.
    pub(crate) fn seg_check(
        &self,
        sreg: &SegReg,
        stack: bool,
        off: u32,
        len: u32,
        kind: AccessKind,
    ) -> Fallible {
        let desc = &sreg.desc;
        if !desc.valid {
            return Err(Self::segment_fault(sreg, stack));
        }
        let last = u64::from(off) + u64::from(len) - 1;
        let in_limit = if desc.expand_down() {
            off > desc.limit && last <= u64::from(desc.upper_bound())
        } else {
            last <= u64::from(desc.limit)
        };
        if !in_limit {
            return Err(Self::segment_fault(sreg, stack));
        }
        if self.protected_mode() && !self.v86_mode() {
            let allowed = match kind {
                AccessKind::Read => desc.readable(),
                AccessKind::Write => desc.writable(),
                AccessKind::Execute => desc.is_code(),
            };
            if !allowed {
                return Err(Self::segment_fault(sreg, stack));
            }
        }
        Ok(())
    }

    pub(crate) fn seg_check_read(&self, seg: Seg, off: u32, len: u32) -> Fallible {
        self.seg_check(self.sreg(seg), seg == Seg::Ss, off, len, AccessKind::Read)
    }

    pub(crate) fn seg_check_write(&self, seg: Seg, off: u32, len: u32) -> Fallible {
        self.seg_check(self.sreg(seg), seg == Seg::Ss, off, len, AccessKind::Write)
    }

    pub(crate) fn page_fault(&mut self, pf: PageFault) -> CpuFault {
        self.cr2 = pf.addr;
        CpuFault::pf(pf.error_code)
    }

    /// Linear to physical. Pending writes land first so the walk sees current tables.
    pub(crate) fn translate<B: SystemBus>(
        &mut self,
        bus: &mut B,
        linear: u32,
        kind: AccessKind,
        user: bool,
    ) -> Fallible<u32> {
        if !self.mmu.enabled() {
            return Ok(linear);
        }
        self.bus_unit.flush_writes(bus);
        match self.mmu.translate(bus, linear, kind, user) {
            Ok(paddr) => Ok(paddr),
            Err(pf) => Err(self.page_fault(pf)),
        }
    }

    fn linear_spans<B: SystemBus>(
        &mut self,
        bus: &mut B,
        linear: u32,
        len: u32,
        kind: AccessKind,
        user: bool,
    ) -> Fallible<Spans> {
        let in_page = 0x1000 - (linear & 0xFFF);
        if !self.mmu.enabled() || len <= in_page {
            let paddr = self.translate(bus, linear, kind, user)?;
            return Ok(Spans {
                first: (paddr, len),
                second: None,
            });
        }
        let first = self.translate(bus, linear, kind, user)?;
        let second = self.translate(bus, linear.wrapping_add(in_page), kind, user)?;
        Ok(Spans {
            first: (first, in_page),
            second: Some((second, len - in_page)),
        })
    }

    /// Segment check composed with translation.
    pub(crate) fn mem_access_check<B: SystemBus>(
        &mut self,
        bus: &mut B,
        sreg: &SegReg,
        stack: bool,
        off: u32,
        len: u32,
        kind: AccessKind,
    ) -> Fallible<Spans> {
        self.seg_check(sreg, stack, off, len, kind)?;
        let linear = sreg.base().wrapping_add(off);
        let user = self.user_mode();
        self.linear_spans(bus, linear, len, kind, user)
    }

    fn read_spans<B: SystemBus>(&mut self, bus: &mut B, spans: Spans) -> u32 {
        let mut buf = [0u8; 4];
        let (p0, n0) = spans.first;
        self.bus_unit.read(bus, p0, &mut buf[..n0 as usize]);
        if let Some((p1, n1)) = spans.second {
            for i in 0..n1 {
                let idx = (n0 + i) as usize;
                self.bus_unit.read(bus, p1.wrapping_add(i), &mut buf[idx..idx + 1]);
            }
        }
        u32::from_le_bytes(buf)
    }

    fn write_spans(&mut self, spans: Spans, val: u32) {
        let bytes = val.to_le_bytes();
        let (p0, n0) = spans.first;
        self.bus_unit.write(p0, &bytes[..n0 as usize]);
        if let Some((p1, n1)) = spans.second {
            for i in 0..n1 {
                let idx = (n0 + i) as usize;
                self.bus_unit.write(p1.wrapping_add(i), &bytes[idx..idx + 1]);
            }
        }
    }

    pub(crate) fn read_sreg<B: SystemBus>(
        &mut self,
        bus: &mut B,
        sreg: &SegReg,
        stack: bool,
        off: u32,
        w: Width,
    ) -> Fallible<u32> {
        let spans = self.mem_access_check(bus, sreg, stack, off, w.bytes(), AccessKind::Read)?;
        let val = self.read_spans(bus, spans) & w.mask();
        self.traps.memory_access(spans.first.0, w.bytes(), val, false);
        Ok(val)
    }

    pub(crate) fn write_sreg<B: SystemBus>(
        &mut self,
        bus: &mut B,
        sreg: &SegReg,
        stack: bool,
        off: u32,
        w: Width,
        val: u32,
    ) -> Fallible {
        let spans = self.mem_access_check(bus, sreg, stack, off, w.bytes(), AccessKind::Write)?;
        self.write_spans(spans, val & w.mask());
        self.traps.memory_access(spans.first.0, w.bytes(), val & w.mask(), true);
        Ok(())
    }

    pub(crate) fn read<B: SystemBus>(&mut self, bus: &mut B, seg: Seg, off: u32, w: Width) -> Fallible<u32> {
        let sreg = self.sregs[seg.index()];
        self.read_sreg(bus, &sreg, seg == Seg::Ss, off, w)
    }

    pub(crate) fn write<B: SystemBus>(
        &mut self,
        bus: &mut B,
        seg: Seg,
        off: u32,
        w: Width,
        val: u32,
    ) -> Fallible {
        let sreg = self.sregs[seg.index()];
        self.write_sreg(bus, &sreg, seg == Seg::Ss, off, w, val)
    }

    pub(crate) fn read_u8<B: SystemBus>(&mut self, bus: &mut B, seg: Seg, off: u32) -> Fallible<u8> {
        Ok(self.read(bus, seg, off, Width::Byte)? as u8)
    }

    pub(crate) fn read_u16<B: SystemBus>(&mut self, bus: &mut B, seg: Seg, off: u32) -> Fallible<u16> {
        Ok(self.read(bus, seg, off, Width::Word)? as u16)
    }

    pub(crate) fn read_u32<B: SystemBus>(&mut self, bus: &mut B, seg: Seg, off: u32) -> Fallible<u32> {
        self.read(bus, seg, off, Width::Dword)
    }

    pub(crate) fn write_u16<B: SystemBus>(&mut self, bus: &mut B, seg: Seg, off: u32, val: u16) -> Fallible {
        self.write(bus, seg, off, Width::Word, u32::from(val))
    }

    /// Supervisor read of system structures (descriptor tables, TSS) by linear address.
    pub(crate) fn read_linear<B: SystemBus>(&mut self, bus: &mut B, linear: u32, len: u32) -> Fallible<u32> {
        let spans = self.linear_spans(bus, linear, len, AccessKind::Read, false)?;
        Ok(self.read_spans(bus, spans))
    }

    pub(crate) fn read_linear_u64<B: SystemBus>(&mut self, bus: &mut B, linear: u32) -> Fallible<u64> {
        let lo = self.read_linear(bus, linear, 4)?;
        let hi = self.read_linear(bus, linear.wrapping_add(4), 4)?;
        Ok(u64::from(lo) | (u64::from(hi) << 32))
    }

    pub(crate) fn write_linear<B: SystemBus>(&mut self, bus: &mut B, linear: u32, len: u32, val: u32) -> Fallible {
        let spans = self.linear_spans(bus, linear, len, AccessKind::Write, false)?;
        self.write_spans(spans, val);
        Ok(())
    }

    /// Stores `values` below `sp` in a stack segment that need not be SS yet (a stack
    /// switch writes the new frame before committing). `user` is the privilege of the
    /// writes as paging sees it. Returns the new stack pointer.
    pub(crate) fn write_frame<B: SystemBus>(
        &mut self,
        bus: &mut B,
        ss: &SegReg,
        sp: u32,
        values: &[u32],
        w: Width,
        user: bool,
    ) -> Fallible<u32> {
        let sp_mask = if self.is_386() && ss.desc.big() { 0xFFFF_FFFF } else { 0xFFFF };
        let mut sp = sp;
        for &val in values {
            sp = sp.wrapping_sub(w.bytes()) & sp_mask;
            self.seg_check(ss, true, sp, w.bytes(), AccessKind::Write)?;
            let linear = ss.base().wrapping_add(sp);
            let spans = self.linear_spans(bus, linear, w.bytes(), AccessKind::Write, user)?;
            self.write_spans(spans, val & w.mask());
        }
        Ok(sp)
    }

    /// Pushes `values` in order. Nothing is committed unless every write succeeds.
    pub(crate) fn push_values<B: SystemBus>(&mut self, bus: &mut B, values: &[u32], w: Width) -> Fallible {
        let sp = self.sp();
        if !self.protected_mode() && sp < w.bytes() && sp != 0 {
            // The 286 has no way to report a stack that wraps mid-push in real mode.
            tracing::warn!(sp, "real-mode stack wrap during push");
            return Err(CpuFault::Shutdown);
        }
        let ss = self.sregs[Seg::Ss.index()];
        let user = self.user_mode();
        let sp = self.write_frame(bus, &ss, sp, values, w, user)?;
        self.set_sp(sp);
        Ok(())
    }

    pub(crate) fn push<B: SystemBus>(&mut self, bus: &mut B, val: u32, w: Width) -> Fallible {
        self.push_values(bus, &[val], w)
    }

    /// Reads the stack `depth` bytes above the top without popping.
    pub(crate) fn stack_peek<B: SystemBus>(&mut self, bus: &mut B, depth: u32, w: Width) -> Fallible<u32> {
        let off = self.stack_offset(depth);
        self.read(bus, Seg::Ss, off, w)
    }

    pub(crate) fn stack_offset(&self, depth: u32) -> u32 {
        let off = self.sp().wrapping_add(depth);
        if self.stack_big() {
            off
        } else {
            off & 0xFFFF
        }
    }

    pub(crate) fn pop<B: SystemBus>(&mut self, bus: &mut B, w: Width) -> Fallible<u32> {
        let val = self.stack_peek(bus, 0, w)?;
        self.set_sp(self.stack_offset(w.bytes()));
        Ok(val)
    }

    pub(crate) fn release_stack(&mut self, bytes: u32) {
        self.set_sp(self.stack_offset(bytes));
    }
}
