use pcat_cpu_decoder::{CpuModel, Decoder, Seg};

use crate::bus_unit::BusUnit;
use crate::config::CpuConfig;
use crate::descriptor::{Descriptor, Selector};
use crate::flags::{Cr0, Eflags};
use crate::interrupts::PendingEvents;
use crate::paging::Mmu;
use crate::traps::Traps;

/// General purpose registers in encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Gpr {
    Eax = 0,
    Ecx = 1,
    Edx = 2,
    Ebx = 3,
    Esp = 4,
    Ebp = 5,
    Esi = 6,
    Edi = 7,
}

impl Gpr {
    pub const ALL: [Gpr; 8] = [
        Gpr::Eax,
        Gpr::Ecx,
        Gpr::Edx,
        Gpr::Ebx,
        Gpr::Esp,
        Gpr::Ebp,
        Gpr::Esi,
        Gpr::Edi,
    ];

    pub const fn name16(self) -> &'static str {
        match self {
            Gpr::Eax => "AX",
            Gpr::Ecx => "CX",
            Gpr::Edx => "DX",
            Gpr::Ebx => "BX",
            Gpr::Esp => "SP",
            Gpr::Ebp => "BP",
            Gpr::Esi => "SI",
            Gpr::Edi => "DI",
        }
    }
}

/// A segment register: the visible selector plus its descriptor cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegReg {
    pub selector: Selector,
    pub desc: Descriptor,
}

impl SegReg {
    pub const fn real_mode(selector: u16) -> Self {
        SegReg {
            selector: Selector(selector),
            desc: Descriptor::real_mode(selector),
        }
    }

    /// A selected but unusable register (null load, or awaiting validation in a task
    /// switch).
    pub const fn invalid(selector: u16) -> Self {
        SegReg {
            selector: Selector(selector),
            desc: Descriptor {
                base: 0,
                limit: 0,
                access: 0,
                flags: 0,
                valid: false,
            },
        }
    }

    pub const fn base(&self) -> u32 {
        self.desc.base
    }
}

/// GDTR / IDTR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TableReg {
    pub base: u32,
    pub limit: u16,
}

/// Operand width of one access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Width {
    Byte,
    Word,
    Dword,
}

impl Width {
    pub(crate) const fn bytes(self) -> u32 {
        match self {
            Width::Byte => 1,
            Width::Word => 2,
            Width::Dword => 4,
        }
    }

    pub(crate) const fn bits(self) -> u32 {
        self.bytes() * 8
    }

    pub(crate) const fn mask(self) -> u32 {
        match self {
            Width::Byte => 0xFF,
            Width::Word => 0xFFFF,
            Width::Dword => 0xFFFF_FFFF,
        }
    }

    pub(crate) const fn sign_bit(self) -> u32 {
        1 << (self.bits() - 1)
    }

    /// Width of a full-size operand under the given operand size attribute.
    pub(crate) const fn of(op32: bool) -> Self {
        if op32 {
            Width::Dword
        } else {
            Width::Word
        }
    }

    pub(crate) const fn sign_extend(self, val: u32) -> u32 {
        match self {
            Width::Byte => val as u8 as i8 as i32 as u32,
            Width::Word => val as u16 as i16 as i32 as u32,
            Width::Dword => val,
        }
    }
}

/// The processor: register file, descriptor caches, control registers, bus unit and
/// paging unit. Everything outside the chip is reached through the bus argument of
/// [`Cpu::step`].
pub struct Cpu {
    pub(crate) config: CpuConfig,
    pub(crate) decoder: Decoder,
    pub(crate) regs: [u32; 8],
    pub(crate) eip: u32,
    pub(crate) flags: Eflags,
    pub(crate) sregs: [SegReg; 6],
    pub(crate) ldtr: SegReg,
    pub(crate) tr: SegReg,
    pub(crate) gdtr: TableReg,
    pub(crate) idtr: TableReg,
    pub(crate) cr0: Cr0,
    pub(crate) cr2: u32,
    pub(crate) dr: [u32; 8],
    pub(crate) mmu: Mmu,
    pub(crate) bus_unit: BusUnit,
    pub(crate) pending: PendingEvents,
    pub(crate) halted: bool,
    pub(crate) shutdown: bool,
    /// EIP the current instruction restarts from when it faults. A committed task
    /// switch moves it into the new task.
    pub(crate) fault_eip: u32,
    /// A repeated string instruction has been started and not yet finished.
    pub(crate) rep_active: bool,
    /// A conditional branch or loop fell through.
    pub(crate) branch_not_taken: bool,
    /// Clocks charged by the current instruction on top of its table entry.
    pub(crate) extra_cycles: u32,
    pub(crate) traps: Traps,
    pub(crate) cycles: u64,
    pub(crate) instructions: u64,
}

impl std::fmt::Debug for Cpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cpu")
            .field("model", &self.config.model)
            .field("regs", &self.regs)
            .field("eip", &self.eip)
            .field("flags", &self.flags)
            .field("sregs", &self.sregs)
            .field("cr0", &self.cr0)
            .field("halted", &self.halted)
            .field("shutdown", &self.shutdown)
            .finish_non_exhaustive()
    }
}

impl Cpu {
    pub fn new(config: CpuConfig) -> Self {
        let decoder = Decoder::with_overrides(config.model, config.cycle_overrides.clone());
        let bus_unit = BusUnit::new(&config);
        let mut cpu = Cpu {
            config,
            decoder,
            regs: [0; 8],
            eip: 0,
            flags: Eflags::default(),
            sregs: [SegReg::default(); 6],
            ldtr: SegReg::default(),
            tr: SegReg::default(),
            gdtr: TableReg::default(),
            idtr: TableReg::default(),
            cr0: Cr0::empty(),
            cr2: 0,
            dr: [0; 8],
            mmu: Mmu::new(),
            bus_unit,
            pending: PendingEvents::default(),
            halted: false,
            shutdown: false,
            fault_eip: 0,
            rep_active: false,
            branch_not_taken: false,
            extra_cycles: 0,
            traps: Traps::default(),
            cycles: 0,
            instructions: 0,
        };
        cpu.reset();
        cpu
    }

    /// Processor RESET: real mode, CS:IP = F000:FFF0.
    pub fn reset(&mut self) {
        self.regs = [0; 8];
        if self.is_386() {
            // Component and stepping identification.
            self.regs[Gpr::Edx as usize] = 0x0303;
        }
        self.flags = Eflags::default();
        for seg in Seg::ALL {
            self.sregs[seg.index()] = SegReg::real_mode(0);
        }
        self.sregs[Seg::Cs.index()] = SegReg::real_mode(0xF000);
        self.eip = 0xFFF0;
        self.ldtr = SegReg::default();
        self.tr = SegReg::default();
        self.gdtr = TableReg::default();
        self.idtr = TableReg {
            base: 0,
            limit: 0x3FF,
        };
        self.cr0 = if self.is_386() { Cr0::ET } else { Cr0::empty() };
        self.cr2 = 0;
        self.dr = [0; 8];
        self.mmu = Mmu::new();
        self.bus_unit.reset();
        self.pending = PendingEvents::default();
        self.halted = false;
        self.shutdown = false;
        self.fault_eip = self.eip;
        self.rep_active = false;
        self.branch_not_taken = false;
        self.extra_cycles = 0;
        self.traps.clear_in_flight();
    }

    pub fn config(&self) -> &CpuConfig {
        &self.config
    }

    pub fn model(&self) -> CpuModel {
        self.config.model
    }

    pub(crate) fn is_386(&self) -> bool {
        self.config.model == CpuModel::I80386
    }

    pub fn gpr(&self, reg: Gpr) -> u32 {
        self.regs[reg as usize]
    }

    pub fn set_gpr(&mut self, reg: Gpr, val: u32) {
        self.regs[reg as usize] = if self.is_386() { val } else { val & 0xFFFF };
    }

    pub fn eip(&self) -> u32 {
        self.eip
    }

    pub fn set_eip(&mut self, eip: u32) {
        self.eip = eip;
        self.bus_unit.invalidate_pq();
    }

    pub fn flags(&self) -> Eflags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: Eflags) {
        self.flags = flags | Eflags::RESERVED1;
    }

    pub fn sreg(&self, seg: Seg) -> &SegReg {
        &self.sregs[seg.index()]
    }

    pub fn ldtr(&self) -> &SegReg {
        &self.ldtr
    }

    pub fn tr(&self) -> &SegReg {
        &self.tr
    }

    pub fn gdtr(&self) -> TableReg {
        self.gdtr
    }

    pub fn set_gdtr(&mut self, gdtr: TableReg) {
        self.gdtr = gdtr;
    }

    pub fn idtr(&self) -> TableReg {
        self.idtr
    }

    pub fn set_idtr(&mut self, idtr: TableReg) {
        self.idtr = idtr;
    }

    pub fn cr0(&self) -> Cr0 {
        self.cr0
    }

    /// Writes CR0 without the checks MOV CR0 performs; enabling or disabling paging
    /// flushes the TLB.
    pub fn set_cr0(&mut self, cr0: Cr0) {
        let cr0 = if self.is_386() {
            cr0 | Cr0::ET
        } else {
            cr0 & Cr0::MSW
        };
        if cr0.contains(Cr0::PE) != self.cr0.contains(Cr0::PE) {
            tracing::debug!(protected = cr0.contains(Cr0::PE), "processor mode change");
        }
        self.cr0 = cr0;
        self.mmu.set_enabled(cr0.contains(Cr0::PG | Cr0::PE));
    }

    pub fn cr2(&self) -> u32 {
        self.cr2
    }

    pub fn cr3(&self) -> u32 {
        self.mmu.cr3()
    }

    pub fn set_cr3(&mut self, cr3: u32) {
        self.mmu.set_cr3(cr3);
    }

    pub fn bus_unit(&self) -> &BusUnit {
        &self.bus_unit
    }

    pub fn traps_mut(&mut self) -> &mut Traps {
        &mut self.traps
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    /// Total clocks executed since construction.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn instructions(&self) -> u64 {
        self.instructions
    }

    pub fn protected_mode(&self) -> bool {
        self.cr0.contains(Cr0::PE)
    }

    pub fn v86_mode(&self) -> bool {
        self.protected_mode() && self.flags.contains(Eflags::VM)
    }

    /// Current privilege level.
    pub fn cpl(&self) -> u8 {
        if !self.protected_mode() {
            0
        } else if self.flags.contains(Eflags::VM) {
            3
        } else {
            self.sregs[Seg::Cs.index()].selector.rpl()
        }
    }

    pub(crate) fn user_mode(&self) -> bool {
        self.cpl() == 3
    }

    /// D bit of the code segment: default operand and address size.
    pub(crate) fn code_big(&self) -> bool {
        self.is_386() && self.protected_mode() && !self.v86_mode() && self.sreg(Seg::Cs).desc.big()
    }

    /// B bit of the stack segment: ESP rather than SP.
    pub(crate) fn stack_big(&self) -> bool {
        self.is_386() && self.sreg(Seg::Ss).desc.big()
    }

    pub(crate) fn ip_mask(&self) -> u32 {
        if self.code_big() {
            0xFFFF_FFFF
        } else {
            0xFFFF
        }
    }

    /// Linear address of the next instruction byte.
    pub(crate) fn cseip(&self) -> u32 {
        self.sreg(Seg::Cs).base().wrapping_add(self.eip)
    }

    pub(crate) fn sp(&self) -> u32 {
        let esp = self.regs[Gpr::Esp as usize];
        if self.stack_big() {
            esp
        } else {
            esp & 0xFFFF
        }
    }

    pub(crate) fn set_sp(&mut self, sp: u32) {
        let big = self.stack_big();
        let esp = &mut self.regs[Gpr::Esp as usize];
        if big {
            *esp = sp;
        } else {
            *esp = (*esp & 0xFFFF_0000) | (sp & 0xFFFF);
        }
    }

    pub(crate) fn reg(&self, r: u8, w: Width) -> u32 {
        let r = usize::from(r & 7);
        match w {
            Width::Byte if r < 4 => self.regs[r] & 0xFF,
            Width::Byte => (self.regs[r - 4] >> 8) & 0xFF,
            Width::Word => self.regs[r] & 0xFFFF,
            Width::Dword => self.regs[r],
        }
    }

    pub(crate) fn set_reg(&mut self, r: u8, w: Width, val: u32) {
        let r = usize::from(r & 7);
        match w {
            Width::Byte if r < 4 => self.regs[r] = (self.regs[r] & !0xFF) | (val & 0xFF),
            Width::Byte => {
                self.regs[r - 4] = (self.regs[r - 4] & !0xFF00) | ((val & 0xFF) << 8);
            }
            Width::Word => self.regs[r] = (self.regs[r] & !0xFFFF) | (val & 0xFFFF),
            Width::Dword => self.regs[r] = val,
        }
    }

    /// Loads a register with a real-mode or virtual-8086 segment value.
    pub(crate) fn load_segment_real(&mut self, seg: Seg, sel: u16) {
        let desc = if self.v86_mode() {
            Descriptor::v86(sel)
        } else {
            let mut desc = Descriptor::real_mode(sel);
            // Outside protected mode only the base follows the selector; the cached
            // limit and attributes of a big segment survive.
            let old = self.sregs[seg.index()].desc;
            if old.valid && old.present() && seg != Seg::Cs {
                desc.limit = old.limit;
                desc.flags = old.flags;
            }
            desc
        };
        self.sregs[seg.index()] = SegReg {
            selector: Selector(sel),
            desc,
        };
        if seg == Seg::Cs {
            self.bus_unit.invalidate_pq();
        }
    }

    /// Writes the flags register as POPF/IRET do: bits the privilege level cannot
    /// change are kept.
    pub(crate) fn write_flags(&mut self, val: u32, op32: bool) {
        let mut writable = Eflags::STATUS | Eflags::TF | Eflags::DF | Eflags::NT;
        if self.is_386() && op32 {
            writable |= Eflags::RF;
        }
        if self.protected_mode() {
            let cpl = self.cpl();
            if cpl == 0 {
                writable |= Eflags::IOPL;
            }
            if cpl <= self.flags.iopl() {
                writable |= Eflags::IF;
            }
        } else {
            writable |= Eflags::IF;
            if self.is_386() {
                writable |= Eflags::IOPL;
            } else {
                // The 286 keeps bits 12-15 clear outside protected mode.
                writable.remove(Eflags::NT);
            }
        }
        let mask = if op32 { writable.bits() } else { writable.bits() & 0xFFFF };
        let bits = (self.flags.bits() & !mask) | (val & mask);
        self.flags = Eflags::from_bits_truncate(bits) | Eflags::RESERVED1;
    }

    /// The flags word pushed by PUSHF and interrupt delivery.
    pub(crate) fn flags_image(&self) -> u32 {
        let bits = self.flags.bits();
        if self.is_386() {
            bits
        } else if self.protected_mode() {
            bits & 0x7FFF
        } else {
            bits & 0x0FFF
        }
    }

    /// Entry point for devices: latch a maskable interrupt vector. A vector that is
    /// already waiting stays latched once, in its original position.
    pub fn raise_interrupt(&mut self, vector: u8) {
        if self.pending.external.contains(&vector) {
            tracing::trace!(vector, "interrupt already pending");
            return;
        }
        self.pending.external.push_back(vector);
    }

    pub fn raise_nmi(&mut self) {
        self.pending.nmi = true;
    }

    pub fn has_pending_interrupt(&self) -> bool {
        self.pending.nmi || !self.pending.external.is_empty()
    }
}
