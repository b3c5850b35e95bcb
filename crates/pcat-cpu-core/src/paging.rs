//! 386 two-level paging with a direct-mapped software TLB.

use pcat_mem::MemoryBus;

const TLB_SIZE: usize = 64;

const PTE_P: u32 = 1 << 0;
const PTE_RW: u32 = 1 << 1;
const PTE_US: u32 = 1 << 2;
const PTE_A: u32 = 1 << 5;
const PTE_D: u32 = 1 << 6;

const PF_PRESENT: u16 = 1 << 0;
const PF_WRITE: u16 = 1 << 1;
const PF_USER: u16 = 1 << 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}

impl AccessKind {
    fn is_write(self) -> bool {
        matches!(self, AccessKind::Write)
    }
}

/// #PF details: the faulting linear address (CR2) and the error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    pub addr: u32,
    pub error_code: u16,
}

impl PageFault {
    fn new(addr: u32, present: bool, access: AccessKind, user: bool) -> Self {
        let mut error_code = 0;
        if present {
            error_code |= PF_PRESENT;
        }
        if access.is_write() {
            error_code |= PF_WRITE;
        }
        if user {
            error_code |= PF_USER;
        }
        PageFault { addr, error_code }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TlbEntry {
    vpn: u32,
    frame: u32,
    user: bool,
    writable: bool,
    dirty: bool,
}

#[derive(Debug, Clone)]
pub struct Mmu {
    enabled: bool,
    cr3: u32,
    tlb: [Option<TlbEntry>; TLB_SIZE],
}

impl Default for Mmu {
    fn default() -> Self {
        Self::new()
    }
}

impl Mmu {
    pub fn new() -> Self {
        Self {
            enabled: false,
            cr3: 0,
            tlb: [None; TLB_SIZE],
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn cr3(&self) -> u32 {
        self.cr3
    }

    /// Follows CR0.PG. Any change flushes the TLB.
    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled != enabled {
            self.enabled = enabled;
            self.flush();
        }
    }

    pub fn set_cr3(&mut self, cr3: u32) {
        self.cr3 = cr3;
        self.flush();
    }

    pub fn flush(&mut self) {
        self.tlb = [None; TLB_SIZE];
    }

    /// Linear to physical translation. `user` is true for CPL 3 accesses other than
    /// implicit system-structure reads.
    pub fn translate<B: MemoryBus + ?Sized>(
        &mut self,
        bus: &mut B,
        linear: u32,
        access: AccessKind,
        user: bool,
    ) -> Result<u32, PageFault> {
        if !self.enabled {
            return Ok(linear);
        }
        let vpn = linear >> 12;
        let slot = (vpn as usize) % TLB_SIZE;
        if let Some(entry) = self.tlb[slot].filter(|e| e.vpn == vpn) {
            check_perms(linear, entry.user, entry.writable, access, user)?;
            if !access.is_write() || entry.dirty {
                return Ok(entry.frame | (linear & 0xFFF));
            }
        }
        let entry = self.walk(bus, linear, access, user)?;
        self.tlb[slot] = Some(entry);
        Ok(entry.frame | (linear & 0xFFF))
    }

    fn walk<B: MemoryBus + ?Sized>(
        &mut self,
        bus: &mut B,
        linear: u32,
        access: AccessKind,
        user: bool,
    ) -> Result<TlbEntry, PageFault> {
        let pde_addr = (self.cr3 & !0xFFF) + ((linear >> 22) << 2);
        let pde = bus.read_u32(pde_addr);
        if pde & PTE_P == 0 {
            return Err(PageFault::new(linear, false, access, user));
        }
        let pte_addr = (pde & !0xFFF) + (((linear >> 12) & 0x3FF) << 2);
        let pte = bus.read_u32(pte_addr);
        if pte & PTE_P == 0 {
            return Err(PageFault::new(linear, false, access, user));
        }

        let user_ok = pde & pte & PTE_US != 0;
        let writable = pde & pte & PTE_RW != 0;
        check_perms(linear, user_ok, writable, access, user)?;

        if pde & PTE_A == 0 {
            bus.write_u32(pde_addr, pde | PTE_A);
        }
        let mut new_pte = pte | PTE_A;
        if access.is_write() {
            new_pte |= PTE_D;
        }
        if new_pte != pte {
            bus.write_u32(pte_addr, new_pte);
        }

        Ok(TlbEntry {
            vpn: linear >> 12,
            frame: pte & !0xFFF,
            user: user_ok,
            writable,
            dirty: new_pte & PTE_D != 0,
        })
    }
}

fn check_perms(
    linear: u32,
    user_ok: bool,
    writable: bool,
    access: AccessKind,
    user: bool,
) -> Result<(), PageFault> {
    // The 386 has no CR0.WP: supervisor writes ignore the R/W bit.
    if user && (!user_ok || (access.is_write() && !writable)) {
        return Err(PageFault::new(linear, true, access, user));
    }
    Ok(())
}
