//! Data movement and the stack: MOV forms, segment loads, exchanges, PUSH/POP families,
//! ENTER/LEAVE.

use pcat_cpu_decoder::{Instruction, Seg, Sz};

use crate::cpu::{Cpu, Gpr, Width};
use crate::fault::{CpuFault, Fallible};
use crate::flags::Eflags;
use crate::SystemBus;

use super::operand::{width, Operand};

const SP: u8 = Gpr::Esp as u8;
const BP: u8 = Gpr::Ebp as u8;

impl Cpu {
    fn modrm_segment(ins: &Instruction) -> Fallible<Seg> {
        Seg::from_index(ins.reg()).ok_or_else(CpuFault::ud)
    }

    /// MOV r/m, Sreg. A 32-bit register destination is zero-extended; memory is always
    /// written as a word.
    pub(super) fn exec_mov_rm_seg<B: SystemBus>(&mut self, bus: &mut B, ins: &Instruction) -> Fallible {
        let seg = Self::modrm_segment(ins)?;
        let sel = u32::from(self.sreg(seg).selector.0);
        match self.rm_operand(ins) {
            op @ Operand::Reg(_) => self.write_operand(bus, op, Width::of(ins.op32), sel),
            op => self.write_operand(bus, op, Width::Word, sel),
        }
    }

    pub(super) fn exec_mov_seg_rm<B: SystemBus>(&mut self, bus: &mut B, ins: &Instruction) -> Fallible {
        let seg = Self::modrm_segment(ins)?;
        if seg == Seg::Cs {
            return Err(CpuFault::ud());
        }
        let sel = self.read_rm(bus, ins, Width::Word)? as u16;
        self.load_segment(bus, seg, sel)?;
        if seg == Seg::Ss {
            self.pending.inhibit = 1;
        }
        Ok(())
    }

    pub(super) fn exec_pop_seg<B: SystemBus>(&mut self, bus: &mut B, ins: &Instruction, seg: Seg) -> Fallible {
        let w = Width::of(ins.op32);
        let sel = self.stack_peek(bus, 0, w)? as u16;
        // The increment uses the stack size in effect before a new SS.
        let big = self.stack_big();
        let new_sp = self.stack_offset(w.bytes());
        self.load_segment(bus, seg, sel)?;
        let esp = &mut self.regs[Gpr::Esp as usize];
        *esp = if big { new_sp } else { (*esp & 0xFFFF_0000) | new_sp };
        if seg == Seg::Ss {
            self.pending.inhibit = 1;
        }
        Ok(())
    }

    pub(super) fn exec_xchg<B: SystemBus>(&mut self, bus: &mut B, ins: &Instruction) -> Fallible {
        let w = width(ins);
        let target = self.rm_operand(ins);
        let mem = self.read_operand(bus, target, w)?;
        let reg = self.reg(ins.reg(), w);
        self.write_operand(bus, target, w, reg)?;
        self.set_reg(ins.reg(), w, mem);
        Ok(())
    }

    pub(super) fn exec_xlat<B: SystemBus>(&mut self, bus: &mut B, ins: &Instruction) -> Fallible {
        let bx = self.regs[Gpr::Ebx as usize];
        let al = self.reg(0, Width::Byte);
        let off = bx.wrapping_add(al);
        let off = if ins.addr32 { off } else { off & 0xFFFF };
        let val = self.read(bus, self.data_seg(ins), off, Width::Byte)?;
        self.set_reg(0, Width::Byte, val);
        Ok(())
    }

    pub(super) fn exec_sahf(&mut self) {
        const MASK: u32 = 0xD5;
        let ah = self.reg(4, Width::Byte) & MASK;
        let bits = (self.flags.bits() & !MASK) | ah;
        self.flags = Eflags::from_bits_truncate(bits) | Eflags::RESERVED1;
    }

    /// MOVZX/MOVSX. The decoded width names the source: byte or word.
    pub(super) fn exec_movx<B: SystemBus>(&mut self, bus: &mut B, ins: &Instruction, signed: bool) -> Fallible {
        let src_w = match ins.width {
            Sz::B => Width::Byte,
            Sz::V => Width::Word,
        };
        let val = self.read_rm(bus, ins, src_w)?;
        let val = if signed { src_w.sign_extend(val) } else { val };
        self.set_reg(ins.reg(), Width::of(ins.op32), val);
        Ok(())
    }

    /// LDS/LES/LSS/LFS/LGS. The segment register is loaded first so a faulting selector
    /// leaves the general register alone.
    pub(super) fn exec_load_far<B: SystemBus>(&mut self, bus: &mut B, ins: &Instruction, seg: Seg) -> Fallible {
        let (off, sel) = self.read_far_pointer(bus, ins)?;
        self.load_segment(bus, seg, sel)?;
        self.set_reg(ins.reg(), Width::of(ins.op32), off);
        if seg == Seg::Ss {
            self.pending.inhibit = 1;
        }
        Ok(())
    }

    /// POP r/m. The stack pointer is already incremented when the destination address
    /// is computed; it is put back if the store faults.
    pub(super) fn exec_pop_rm<B: SystemBus>(&mut self, bus: &mut B, ins: &Instruction) -> Fallible {
        let w = Width::of(ins.op32);
        let esp = self.regs[Gpr::Esp as usize];
        let val = self.pop(bus, w)?;
        let target = self.rm_operand(ins);
        if let Err(e) = self.write_operand(bus, target, w, val) {
            self.regs[Gpr::Esp as usize] = esp;
            return Err(e);
        }
        Ok(())
    }

    pub(super) fn exec_pusha<B: SystemBus>(&mut self, bus: &mut B, ins: &Instruction) -> Fallible {
        let w = Width::of(ins.op32);
        let values: Vec<u32> = (0..8).map(|r| self.reg(r, w)).collect();
        self.push_values(bus, &values, w)
    }

    /// POPA discards the saved stack pointer.
    pub(super) fn exec_popa<B: SystemBus>(&mut self, bus: &mut B, ins: &Instruction) -> Fallible {
        let w = Width::of(ins.op32);
        let mut values = [0u32; 8];
        for (i, slot) in values.iter_mut().enumerate() {
            *slot = self.stack_peek(bus, i as u32 * w.bytes(), w)?;
        }
        for (i, &val) in values.iter().enumerate() {
            let r = 7 - i as u8;
            if r != SP {
                self.set_reg(r, w, val);
            }
        }
        self.release_stack(8 * w.bytes());
        Ok(())
    }

    pub(super) fn exec_pushf<B: SystemBus>(&mut self, bus: &mut B, ins: &Instruction) -> Fallible {
        if self.v86_mode() && self.flags.iopl() < 3 {
            return Err(CpuFault::gp(0));
        }
        let w = Width::of(ins.op32);
        let mut image = self.flags_image();
        if ins.op32 {
            image &= !(Eflags::VM | Eflags::RF).bits();
        }
        self.push(bus, image, w)
    }

    pub(super) fn exec_popf<B: SystemBus>(&mut self, bus: &mut B, ins: &Instruction) -> Fallible {
        if self.v86_mode() && self.flags.iopl() < 3 {
            return Err(CpuFault::gp(0));
        }
        let w = Width::of(ins.op32);
        let val = self.stack_peek(bus, 0, w)?;
        self.release_stack(w.bytes());
        self.write_flags(val, ins.op32);
        Ok(())
    }

    /// ENTER size, level.
    pub(super) fn exec_enter<B: SystemBus>(&mut self, bus: &mut B, ins: &Instruction) -> Fallible {
        let esp = self.regs[Gpr::Esp as usize];
        let ebp = self.regs[Gpr::Ebp as usize];
        let result = self.enter_frame(bus, ins);
        if result.is_err() {
            self.regs[Gpr::Esp as usize] = esp;
            self.regs[Gpr::Ebp as usize] = ebp;
        }
        result
    }

    fn enter_frame<B: SystemBus>(&mut self, bus: &mut B, ins: &Instruction) -> Fallible {
        let w = Width::of(ins.op32);
        let size = ins.imm & 0xFFFF;
        let level = u32::from(ins.imm2 & 0x1F);
        let stack_w = if self.stack_big() { Width::Dword } else { Width::Word };

        let bp = self.reg(BP, w);
        self.push(bus, bp, w)?;
        let frame = self.sp();
        if level > 0 {
            let mut bp = self.reg(BP, stack_w);
            for _ in 1..level {
                bp = bp.wrapping_sub(w.bytes()) & stack_w.mask();
                let val = self.read(bus, Seg::Ss, bp, w)?;
                self.push(bus, val, w)?;
            }
            self.push(bus, frame, w)?;
            if level > 1 {
                self.extra_cycles += 4 * (level - 1);
            }
        }
        let new_sp = self.sp().wrapping_sub(size) & stack_w.mask();
        if size > 0 {
            // The lowest byte of the new frame must be addressable.
            self.seg_check_write(Seg::Ss, new_sp, 1)?;
        }
        self.set_reg(BP, stack_w, frame);
        self.set_sp(new_sp);
        Ok(())
    }

    pub(super) fn exec_leave<B: SystemBus>(&mut self, bus: &mut B, ins: &Instruction) -> Fallible {
        let w = Width::of(ins.op32);
        let esp = self.regs[Gpr::Esp as usize];
        let bp = self.regs[Gpr::Ebp as usize];
        self.set_sp(bp);
        match self.pop(bus, w) {
            Ok(val) => {
                self.set_reg(BP, w, val);
                Ok(())
            }
            Err(e) => {
                self.regs[Gpr::Esp as usize] = esp;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::CpuConfig;
    use crate::cpu::{Cpu, Gpr};
    use crate::flags::Eflags;
    use pcat_cpu_decoder::{CpuModel, Decoder, SliceSource};
    use pcat_mem::{IoBus, MemoryBus};

    struct Ram(Vec<u8>);

    impl MemoryBus for Ram {
        fn read_u8(&mut self, paddr: u32) -> u8 {
            self.0[paddr as usize]
        }

        fn write_u8(&mut self, paddr: u32, val: u8) {
            self.0[paddr as usize] = val;
        }
    }

    impl IoBus for Ram {
        fn io_read(&mut self, _port: u16, _size: u8) -> u32 {
            0
        }

        fn io_write(&mut self, _port: u16, _size: u8, _val: u32) {}
    }

    fn setup(model: CpuModel) -> (Cpu, Ram) {
        let mut cpu = Cpu::new(CpuConfig::new(model));
        cpu.set_eip(0x0000);
        cpu.set_gpr(Gpr::Esp, 0x1000);
        (cpu, Ram(vec![0; 0x10_0000]))
    }

    fn run(cpu: &mut Cpu, ram: &mut Ram, bytes: &[u8]) -> Result<u32, crate::CpuFault> {
        let ins = Decoder::new(cpu.model()).decode(&mut SliceSource::new(bytes), false);
        let r = cpu.execute(ram, &ins);
        cpu.bus_unit.flush_writes(ram);
        r
    }

    #[test]
    fn pusha_popa_round_trip_skips_sp() {
        let (mut cpu, mut ram) = setup(CpuModel::I80286);
        for (i, r) in Gpr::ALL.iter().enumerate() {
            if *r != Gpr::Esp {
                cpu.set_gpr(*r, 0x1100 + i as u32);
            }
        }
        run(&mut cpu, &mut ram, &[0x60]).unwrap();
        assert_eq!(cpu.gpr(Gpr::Esp), 0x1000 - 16);
        // The saved SP is the value before the instruction.
        assert_eq!(ram.0[0x1000 - 10], 0x00);
        assert_eq!(ram.0[0x1000 - 9], 0x10);
        cpu.set_gpr(Gpr::Eax, 0);
        cpu.set_gpr(Gpr::Edi, 0);
        run(&mut cpu, &mut ram, &[0x61]).unwrap();
        assert_eq!(cpu.gpr(Gpr::Eax), 0x1100);
        assert_eq!(cpu.gpr(Gpr::Edi), 0x1107);
        assert_eq!(cpu.gpr(Gpr::Esp), 0x1000);
    }

    #[test]
    fn enter_and_leave_build_and_drop_a_frame() {
        let (mut cpu, mut ram) = setup(CpuModel::I80286);
        cpu.set_gpr(Gpr::Ebp, 0x0ABC);
        // enter 8, 0
        run(&mut cpu, &mut ram, &[0xC8, 0x08, 0x00, 0x00]).unwrap();
        assert_eq!(cpu.gpr(Gpr::Ebp), 0x0FFE);
        assert_eq!(cpu.gpr(Gpr::Esp), 0x0FF6);
        // leave
        run(&mut cpu, &mut ram, &[0xC9]).unwrap();
        assert_eq!(cpu.gpr(Gpr::Ebp), 0x0ABC);
        assert_eq!(cpu.gpr(Gpr::Esp), 0x1000);
    }

    #[test]
    fn sahf_and_lahf() {
        let (mut cpu, mut ram) = setup(CpuModel::I80286);
        cpu.set_gpr(Gpr::Eax, 0xFF00);
        run(&mut cpu, &mut ram, &[0x9E]).unwrap();
        assert!(cpu.flags().contains(Eflags::CF | Eflags::ZF | Eflags::SF | Eflags::AF | Eflags::PF));
        cpu.set_gpr(Gpr::Eax, 0);
        run(&mut cpu, &mut ram, &[0x9F]).unwrap();
        assert_eq!(cpu.gpr(Gpr::Eax), 0xD700);
    }

    #[test]
    fn pop_ss_inhibits_interrupts_for_one_instruction() {
        let (mut cpu, mut ram) = setup(CpuModel::I80286);
        ram.0[0x1000] = 0x34;
        ram.0[0x1001] = 0x12;
        run(&mut cpu, &mut ram, &[0x17]).unwrap();
        assert_eq!(cpu.sreg(pcat_cpu_decoder::Seg::Ss).selector.0, 0x1234);
        assert_eq!(cpu.gpr(Gpr::Esp), 0x1002);
        assert_eq!(cpu.pending.inhibit, 1);
    }
}
