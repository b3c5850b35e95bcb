use std::collections::HashMap;

use pcat_cpu_decoder::{CpuModel, CycleEntry, CycleKey};

/// Extra clocks charged by multi-step control transfers on top of the opcode's table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlTimings {
    /// CALL/JMP through a call gate at the same privilege level.
    pub call_gate: u32,
    /// CALL through a call gate to a more privileged level (stack switch).
    pub call_gate_inner: u32,
    /// Per parameter word copied by an inner-privilege call gate.
    pub call_gate_param: u32,
    /// RET/IRET to an outer privilege level.
    pub return_outer: u32,
    /// Any transfer that ends in a task switch.
    pub task_switch: u32,
    /// Interrupt or exception delivered to a more privileged level.
    pub interrupt_inner: u32,
    /// Interrupt delivered from virtual-8086 mode.
    pub interrupt_v86: u32,
}

impl ControlTimings {
    pub const fn for_model(model: CpuModel) -> Self {
        match model {
            CpuModel::I80286 => ControlTimings {
                call_gate: 15,
                call_gate_inner: 56,
                call_gate_param: 4,
                return_outer: 8,
                task_switch: 151,
                interrupt_inner: 38,
                interrupt_v86: 0,
            },
            CpuModel::I80386 => ControlTimings {
                call_gate: 24,
                call_gate_inner: 52,
                call_gate_param: 4,
                return_outer: 14,
                task_switch: 280,
                interrupt_inner: 40,
                interrupt_v86: 60,
            },
        }
    }
}

/// Processor configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuConfig {
    pub model: CpuModel,
    /// Run instruction fetches through the prefetch queue. When disabled every opcode
    /// byte is read straight from memory.
    pub prefetch: bool,
    /// Bus clocks of one zero-wait-state word transfer.
    pub dram_tx_cycles: u32,
    /// Free queue bytes required before the bus unit starts an opportunistic prefetch.
    pub pq_threshold: usize,
    /// Replacement timings for individual opcodes.
    pub cycle_overrides: HashMap<CycleKey, CycleEntry>,
    pub timings: ControlTimings,
}

impl CpuConfig {
    pub fn new(model: CpuModel) -> Self {
        Self {
            model,
            prefetch: true,
            dram_tx_cycles: 2,
            pq_threshold: 2,
            cycle_overrides: HashMap::new(),
            timings: ControlTimings::for_model(model),
        }
    }
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self::new(CpuModel::default())
    }
}
