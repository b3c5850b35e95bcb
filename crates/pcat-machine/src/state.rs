//! Whole-machine save/restore: the processor sections plus one section for RAM and the
//! A20 line.

use std::path::Path;

use pcat_snapshot::{ReadLeExt, StateBuf, WriteLeExt};

use crate::{Machine, MachineError};

pub const MEMORY_SECTION: &str = "Memory";

impl Machine {
    pub fn save_state(&self) -> Result<StateBuf, MachineError> {
        let mut buf = StateBuf::new();
        self.cpu.save_state(&mut buf)?;

        let ram = self.board.mem.ram();
        let mut mem = Vec::with_capacity(ram.len() + 9);
        mem.write_u64_le(ram.len() as u64)?;
        mem.write_bool(self.board.mem.a20_enabled())?;
        mem.write_bytes(ram)?;
        buf.insert(MEMORY_SECTION, mem)?;
        Ok(buf)
    }

    /// Restores a state saved by a machine with the same model and RAM size. Mapped ROM
    /// and port handlers are not part of the state; the host re-creates them.
    pub fn restore_state(&mut self, buf: &StateBuf) -> Result<(), MachineError> {
        let mut r: &[u8] = buf.get(MEMORY_SECTION)?;
        let saved = r.read_u64_le()?;
        let current = self.board.mem.ram_size() as u64;
        if saved != current {
            return Err(MachineError::RamSizeMismatch { saved, current });
        }
        let a20 = r.read_bool()?;
        if r.len() as u64 != saved {
            return Err(MachineError::Corrupt("RAM image is truncated"));
        }

        self.cpu.restore_state(buf)?;
        self.board.mem.ram_mut().copy_from_slice(r);
        self.board.mem.set_a20(a20);
        self.board.take_reset_request();
        tracing::debug!(sections = buf.len(), "machine state restored");
        Ok(())
    }

    pub fn save_state_file(&self, path: impl AsRef<Path>) -> Result<(), MachineError> {
        self.save_state()?.save_file(path)?;
        Ok(())
    }

    pub fn restore_state_file(&mut self, path: impl AsRef<Path>) -> Result<(), MachineError> {
        let buf = StateBuf::load_file(path)?;
        self.restore_state(&buf)
    }
}
