//! Debug hooks: callbacks on `INT n` (with optional return traps) and on memory
//! accesses. None of this affects emulation results.

use std::collections::BTreeMap;

use pcat_snapshot::{ReadLeExt, SnapshotError, WriteLeExt};

/// What a trap callback sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapEvent {
    pub vector: u8,
    /// Return address of the `INT` instruction.
    pub cs: u16,
    pub eip: u32,
    pub ax: u16,
    /// Fired on reaching the return address rather than on the `INT` itself.
    pub returning: bool,
}

/// Returns true to request a return trap.
pub type TrapFn = Box<dyn FnMut(&TrapEvent) -> bool + Send>;

/// One data access seen by the memory trap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryAccess {
    pub paddr: u32,
    pub len: u32,
    pub value: u32,
    pub write: bool,
}

pub type MemoryTrapFn = Box<dyn FnMut(&MemoryAccess) + Send>;

/// A return trap waiting for execution to reach `cs:eip`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InFlight {
    pub vector: u8,
    pub cs: u16,
    pub eip: u32,
}

#[derive(Default)]
pub struct Traps {
    handlers: BTreeMap<u8, TrapFn>,
    in_flight: Vec<InFlight>,
    memory: Option<MemoryTrapFn>,
}

impl std::fmt::Debug for Traps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Traps")
            .field("vectors", &self.handlers.keys().collect::<Vec<_>>())
            .field("in_flight", &self.in_flight)
            .field("memory", &self.memory.is_some())
            .finish()
    }
}

impl Traps {
    pub fn register(&mut self, vector: u8, handler: TrapFn) {
        self.handlers.insert(vector, handler);
    }

    pub fn unregister(&mut self, vector: u8) {
        self.handlers.remove(&vector);
        self.in_flight.retain(|t| t.vector != vector);
    }

    /// Memory traps only fire in debug builds.
    pub fn set_memory_trap(&mut self, handler: Option<MemoryTrapFn>) {
        self.memory = handler;
    }

    pub fn in_flight(&self) -> &[InFlight] {
        &self.in_flight
    }

    pub fn clear_in_flight(&mut self) {
        self.in_flight.clear();
    }

    pub(crate) fn has_interrupt_traps(&self) -> bool {
        !self.handlers.is_empty()
    }

    /// `INT n` is about to be delivered; `cs:eip` is its return address.
    pub(crate) fn on_interrupt(&mut self, vector: u8, cs: u16, eip: u32, ax: u16) {
        let Some(handler) = self.handlers.get_mut(&vector) else {
            return;
        };
        let event = TrapEvent {
            vector,
            cs,
            eip,
            ax,
            returning: false,
        };
        if handler(&event) {
            self.in_flight.push(InFlight { vector, cs, eip });
        }
    }

    /// Fires and retires return traps waiting at `cs:eip`.
    pub(crate) fn on_instruction(&mut self, cs: u16, eip: u32, ax: u16) {
        if self.in_flight.is_empty() {
            return;
        }
        let mut i = 0;
        while i < self.in_flight.len() {
            let t = self.in_flight[i];
            if t.cs == cs && t.eip == eip {
                self.in_flight.remove(i);
                if let Some(handler) = self.handlers.get_mut(&t.vector) {
                    handler(&TrapEvent {
                        vector: t.vector,
                        cs,
                        eip,
                        ax,
                        returning: true,
                    });
                }
            } else {
                i += 1;
            }
        }
    }

    #[inline]
    pub(crate) fn memory_access(&mut self, paddr: u32, len: u32, value: u32, write: bool) {
        #[cfg(debug_assertions)]
        if let Some(handler) = self.memory.as_mut() {
            handler(&MemoryAccess {
                paddr,
                len,
                value,
                write,
            });
        }
        #[cfg(not(debug_assertions))]
        let _ = (paddr, len, value, write);
    }

    pub(crate) fn save(&self, out: &mut Vec<u8>) -> Result<(), SnapshotError> {
        out.write_u32_le(self.in_flight.len() as u32)?;
        for t in &self.in_flight {
            out.write_u8(t.vector)?;
            out.write_u16_le(t.cs)?;
            out.write_u32_le(t.eip)?;
        }
        Ok(())
    }

    /// Restores the in-flight list. Entries are matched to the callbacks registered now by
    /// vector; those without one are dropped.
    pub(crate) fn restore(&mut self, data: &mut &[u8]) -> Result<(), SnapshotError> {
        let count = data.read_u32_le()?;
        let mut in_flight = Vec::new();
        for _ in 0..count {
            let vector = data.read_u8()?;
            let cs = data.read_u16_le()?;
            let eip = data.read_u32_le()?;
            if self.handlers.contains_key(&vector) {
                in_flight.push(InFlight { vector, cs, eip });
            } else {
                tracing::debug!(vector, "dropping return trap without a handler");
            }
        }
        self.in_flight = in_flight;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn return_trap_fires_once_at_the_return_address() {
        let hits = Arc::new(AtomicU32::new(0));
        let returns = Arc::new(AtomicU32::new(0));
        let mut traps = Traps::default();
        let (h, r) = (hits.clone(), returns.clone());
        traps.register(
            0x21,
            Box::new(move |ev| {
                if ev.returning {
                    r.fetch_add(1, Ordering::Relaxed);
                } else {
                    h.fetch_add(1, Ordering::Relaxed);
                }
                true
            }),
        );
        traps.on_interrupt(0x21, 0x1000, 0x0102, 0x4C00);
        traps.on_interrupt(0x10, 0x1000, 0x0104, 0);
        assert_eq!(traps.in_flight().len(), 1);
        traps.on_instruction(0x1000, 0x0100, 0);
        traps.on_instruction(0x1000, 0x0102, 0);
        traps.on_instruction(0x1000, 0x0102, 0);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert_eq!(returns.load(Ordering::Relaxed), 1);
        assert!(traps.in_flight().is_empty());
    }

    #[test]
    fn restore_rematches_by_vector() {
        let mut traps = Traps::default();
        traps.register(0x21, Box::new(|_| true));
        traps.register(0x13, Box::new(|_| true));
        traps.on_interrupt(0x21, 0x10, 0x20, 0);
        traps.on_interrupt(0x13, 0x10, 0x30, 0);
        let mut blob = Vec::new();
        traps.save(&mut blob).unwrap();

        let mut fresh = Traps::default();
        fresh.register(0x13, Box::new(|_| false));
        fresh.restore(&mut blob.as_slice()).unwrap();
        assert_eq!(
            fresh.in_flight(),
            &[InFlight {
                vector: 0x13,
                cs: 0x10,
                eip: 0x30
            }]
        );
    }
}
