//! The stepping loop: one instruction boundary per call.

use pcat_cpu_decoder::Seg;
use thiserror::Error;

use crate::bus_unit::Fetcher;
use crate::cpu::{Cpu, Gpr};
use crate::fault::{should_double_fault, CpuException, CpuFault, Exception};
use crate::flags::Eflags;
use crate::interrupts::IntSource;
use crate::SystemBus;

/// Interrupt entry is charged like `INT imm8`.
const OPCODE_INT: u16 = 0xCD;
const DR6_BS: u32 = 1 << 14;
/// Benign faults raised while delivering another are delivered in turn; a chain this
/// long only happens with a corrupt IDT.
const MAX_NESTED_DELIVERIES: usize = 4;

/// Why [`Cpu::step`] stopped making progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CpuExit {
    /// Triple fault or an unrecoverable stack wrap. Only RESET leaves this state.
    #[error("processor shutdown")]
    Shutdown,
}

impl Cpu {
    /// Runs one instruction boundary: a pending NMI or external interrupt is taken, or
    /// one instruction executes (one iteration for a repeated string instruction).
    /// Returns the clocks consumed.
    pub fn step<B: SystemBus>(&mut self, bus: &mut B) -> Result<u32, CpuExit> {
        if self.shutdown {
            return Err(CpuExit::Shutdown);
        }
        if self.service_events(bus)? {
            let cycles = self.delivery_cycles();
            return Ok(self.finish(bus, cycles, 0, false));
        }
        if self.halted {
            return Ok(self.finish(bus, 1, 0, false));
        }

        let cseip = self.cseip();
        self.bus_unit.begin_instruction(cseip);
        let user = self.user_mode();
        let default32 = self.code_big();
        let ins = {
            let mut src = Fetcher {
                unit: &mut self.bus_unit,
                bus: &mut *bus,
                mmu: &mut self.mmu,
                user,
            };
            self.decoder.decode(&mut src, default32)
        };
        if let Some(pf) = self.bus_unit.take_fetch_fault() {
            self.fault_eip = self.eip;
            let fault = self.page_fault(pf);
            self.raise(bus, fault)?;
            let cycles = self.delivery_cycles();
            return Ok(self.finish(bus, cycles, 0, false));
        }

        let single_step = self.flags.contains(Eflags::TF);
        let cycles = match self.execute(bus, &ins) {
            Ok(cycles) if single_step => {
                if self.is_386() {
                    self.dr[6] |= DR6_BS;
                }
                self.raise(bus, CpuFault::new(Exception::Debug, None))?;
                cycles + self.delivery_cycles()
            }
            Ok(cycles) => cycles,
            Err(fault) => {
                self.raise(bus, fault)?;
                self.delivery_cycles()
            }
        };
        Ok(self.finish(bus, cycles, ins.cycles.bu, true))
    }

    /// Takes a pending NMI, or a queued external vector when IF is set. Nothing is taken
    /// in the shadow of MOV SS / POP SS / STI.
    fn service_events<B: SystemBus>(&mut self, bus: &mut B) -> Result<bool, CpuExit> {
        if self.pending.inhibit > 0 {
            self.pending.inhibit -= 1;
            return Ok(false);
        }
        let vector = if self.pending.nmi && !self.pending.nmi_blocked {
            self.pending.nmi = false;
            self.pending.nmi_blocked = true;
            Some(Exception::Nmi.vector())
        } else if self.flags.contains(Eflags::IF) {
            self.pending.external.pop_front()
        } else {
            None
        };
        let Some(vector) = vector else {
            return Ok(false);
        };
        // A repeated string instruction resumes from its setup after the handler returns.
        self.rep_active = false;
        self.fault_eip = self.eip;
        if let Err(fault) = self.interrupt(bus, vector, IntSource::External) {
            self.raise(bus, fault)?;
        }
        Ok(true)
    }

    /// Delivers `fault` through the IDT. A contributory fault or page fault raised while
    /// delivering a contributory fault or page fault becomes #DF; any fault while
    /// delivering #DF shuts the processor down.
    fn raise<B: SystemBus>(&mut self, bus: &mut B, fault: CpuFault) -> Result<(), CpuExit> {
        let CpuFault::Exception(mut current) = fault else {
            return Err(self.enter_shutdown("stack exhausted"));
        };
        for _ in 0..MAX_NESTED_DELIVERIES {
            tracing::trace!(%current, eip = self.eip, "delivering exception");
            let next = match self.deliver_exception(bus, current.vector, current.error_code) {
                Ok(()) => return Ok(()),
                Err(CpuFault::Shutdown) => return Err(self.enter_shutdown("stack exhausted")),
                Err(CpuFault::Exception(next)) => next,
            };
            if current.vector == Exception::DoubleFault.vector() {
                return Err(self.enter_shutdown("fault while delivering #DF"));
            }
            current = if should_double_fault(current.vector, next.vector) {
                tracing::warn!(first = current.vector, second = next.vector, "double fault");
                CpuException::new(Exception::DoubleFault, Some(0))
            } else {
                next
            };
        }
        Err(self.enter_shutdown("exception delivery does not converge"))
    }

    fn enter_shutdown(&mut self, reason: &'static str) -> CpuExit {
        tracing::warn!(
            reason,
            cs = self.sreg(Seg::Cs).selector.0,
            eip = self.eip,
            sp = self.regs[Gpr::Esp as usize],
            "processor shutdown"
        );
        self.shutdown = true;
        self.halted = false;
        self.rep_active = false;
        CpuExit::Shutdown
    }

    fn delivery_cycles(&mut self) -> u32 {
        let entry = self.decoder.cycles(OPCODE_INT, 0);
        let mut cycles = u32::from(entry.base);
        if self.protected_mode() {
            cycles += u32::from(entry.pmode);
        }
        cycles + std::mem::take(&mut self.extra_cycles)
    }

    /// Charges bus stalls, lets the bus unit retire writes and prefetch in the idle
    /// time, and advances the counters.
    fn finish<B: SystemBus>(&mut self, bus: &mut B, cycles: u32, bu: i8, retired: bool) -> u32 {
        let total = cycles + self.bus_unit.take_stall();
        let idle = if bu < 0 {
            total.saturating_sub(u32::from(bu.unsigned_abs()))
        } else {
            total
        };
        let user = self.user_mode();
        let cseip = self.cseip();
        self.bus_unit.update(bus, &mut self.mmu, user, cseip, idle);
        self.cycles += u64::from(total);
        if retired {
            self.instructions += 1;
        }
        total
    }
}
