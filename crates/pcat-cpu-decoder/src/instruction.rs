use crate::cycles::CycleEntry;

/// Segment register number as encoded in the ModRM `reg` field and in override prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Seg {
    Es = 0,
    Cs = 1,
    Ss = 2,
    Ds = 3,
    Fs = 4,
    Gs = 5,
}

impl Seg {
    pub const ALL: [Seg; 6] = [Seg::Es, Seg::Cs, Seg::Ss, Seg::Ds, Seg::Fs, Seg::Gs];

    pub const fn from_index(idx: u8) -> Option<Seg> {
        match idx {
            0 => Some(Seg::Es),
            1 => Some(Seg::Cs),
            2 => Some(Seg::Ss),
            3 => Some(Seg::Ds),
            4 => Some(Seg::Fs),
            5 => Some(Seg::Gs),
            _ => None,
        }
    }

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn name(self) -> &'static str {
        match self {
            Seg::Es => "ES",
            Seg::Cs => "CS",
            Seg::Ss => "SS",
            Seg::Ds => "DS",
            Seg::Fs => "FS",
            Seg::Gs => "GS",
        }
    }
}

/// Byte operation or full operand-size (16/32-bit) operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Sz {
    B,
    #[default]
    V,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
    Cmp,
}

impl AluOp {
    pub const fn from_index(idx: u8) -> AluOp {
        match idx & 7 {
            0 => AluOp::Add,
            1 => AluOp::Or,
            2 => AluOp::Adc,
            3 => AluOp::Sbb,
            4 => AluOp::And,
            5 => AluOp::Sub,
            6 => AluOp::Xor,
            _ => AluOp::Cmp,
        }
    }
}

/// Operand encoding of a two-operand ALU instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluForm {
    /// `op r/m, reg`
    RmReg,
    /// `op reg, r/m`
    RegRm,
    /// `op AL/eAX, imm`
    AccImm,
    /// `op r/m, imm`
    RmImm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftOp {
    Rol,
    Ror,
    Rcl,
    Rcr,
    Shl,
    Shr,
    /// `/6` is an undocumented alias of SHL on the 286 and 386.
    Sal,
    Sar,
}

impl ShiftOp {
    pub const fn from_index(idx: u8) -> ShiftOp {
        match idx & 7 {
            0 => ShiftOp::Rol,
            1 => ShiftOp::Ror,
            2 => ShiftOp::Rcl,
            3 => ShiftOp::Rcr,
            4 => ShiftOp::Shl,
            5 => ShiftOp::Shr,
            6 => ShiftOp::Sal,
            _ => ShiftOp::Sar,
        }
    }
}

/// Where a shift/rotate count comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Count {
    One,
    Cl,
    Imm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitOp {
    Bt,
    Bts,
    Btr,
    Btc,
}

/// Condition code of Jcc/SETcc, in encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    O,
    No,
    B,
    Ae,
    E,
    Ne,
    Be,
    A,
    S,
    Ns,
    P,
    Np,
    L,
    Ge,
    Le,
    G,
}

impl Cond {
    pub const fn from_index(idx: u8) -> Cond {
        match idx & 0xF {
            0x0 => Cond::O,
            0x1 => Cond::No,
            0x2 => Cond::B,
            0x3 => Cond::Ae,
            0x4 => Cond::E,
            0x5 => Cond::Ne,
            0x6 => Cond::Be,
            0x7 => Cond::A,
            0x8 => Cond::S,
            0x9 => Cond::Ns,
            0xA => Cond::P,
            0xB => Cond::Np,
            0xC => Cond::L,
            0xD => Cond::Ge,
            0xE => Cond::Le,
            _ => Cond::G,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    Loopne,
    Loope,
    Loop,
    Jcxz,
}

/// Which string primitive a string instruction performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringOp {
    Movs,
    Cmps,
    Stos,
    Lods,
    Scas,
    Ins,
    Outs,
}

impl StringOp {
    /// CMPS and SCAS terminate a repeat on the ZF condition.
    pub const fn checks_zf(self) -> bool {
        matches!(self, StringOp::Cmps | StringOp::Scas)
    }
}

/// Which repeat prefix preceded the instruction.
///
/// For CMPS/SCAS `Rep` (F3) means REPE and `Repne` (F2) means REPNE; every other string
/// instruction repeats unconditionally under either prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepPrefix {
    Rep,
    Repne,
}

/// Closed set of operations the executor dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Invalid,
    /// Placeholder for group opcodes before ModRM.reg selects the member.
    Group(u8),

    Alu(AluOp, AluForm),
    IncReg,
    DecReg,
    IncRm,
    DecRm,
    TestRmReg,
    TestAccImm,
    TestRmImm,
    Not,
    Neg,
    Mul,
    Imul,
    Div,
    Idiv,
    /// `IMUL reg, r/m, imm` (69/6B).
    ImulImm,
    /// `IMUL reg, r/m` (0F AF).
    ImulRegRm,
    Shift(ShiftOp, Count),
    Shld(Count),
    Shrd(Count),
    Daa,
    Das,
    Aaa,
    Aas,
    Aam,
    Aad,
    Salc,
    Cbw,
    Cwd,

    MovRmReg,
    MovRegRm,
    MovRmImm,
    MovRegImm,
    MovAccMoffs,
    MovMoffsAcc,
    MovRmSeg,
    MovSegRm,
    Lea,
    XchgRmReg,
    XchgAccReg,
    Xlat,
    Lahf,
    Sahf,
    Movzx,
    Movsx,
    /// LES/LDS/LSS/LFS/LGS: load a far pointer into `Seg` and a general register.
    LoadFar(Seg),
    Setcc(Cond),

    PushReg,
    PopReg,
    PushSeg(Seg),
    PopSeg(Seg),
    PushImm,
    PushRm,
    PopRm,
    Pusha,
    Popa,
    Pushf,
    Popf,
    Enter,
    Leave,

    Jcc(Cond),
    JmpRel,
    JmpFar,
    JmpRm,
    JmpFarRm,
    CallRel,
    CallFar,
    CallRm,
    CallFarRm,
    /// Near return; pops `imm` extra bytes.
    Ret,
    Retf,
    Iret,
    Loop(LoopKind),
    Int3,
    Int,
    Into,
    /// 386 `F1`, single-step trap through vector 1.
    Int1,
    Bound,
    Hlt,

    Cmc,
    Clc,
    Stc,
    Cli,
    Sti,
    Cld,
    Std,

    String(StringOp),
    InImm,
    InDx,
    OutImm,
    OutDx,

    Sldt,
    Str,
    Lldt,
    Ltr,
    Verr,
    Verw,
    Sgdt,
    Sidt,
    Lgdt,
    Lidt,
    Smsw,
    Lmsw,
    Lar,
    Lsl,
    Clts,
    Arpl,
    MovRegCr,
    MovCrReg,
    MovRegDr,
    MovDrReg,

    BitReg(BitOp),
    BitImm(BitOp),
    Bsf,
    Bsr,

    Nop,
    Wait,
    /// Coprocessor escape (D8-DF).
    Esc,
}

impl Op {
    /// Instructions that need a memory operand and raise #UD when encoded with `mod == 3`.
    pub const fn requires_memory(self) -> bool {
        matches!(
            self,
            Op::Lea
                | Op::LoadFar(_)
                | Op::Bound
                | Op::JmpFarRm
                | Op::CallFarRm
                | Op::Sgdt
                | Op::Sidt
                | Op::Lgdt
                | Op::Lidt
        )
    }

    /// Relative branches whose "not taken" cycle count applies.
    pub const fn is_conditional_branch(self) -> bool {
        matches!(self, Op::Jcc(_) | Op::Loop(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModRm {
    pub mode: u8,
    pub reg: u8,
    pub rm: u8,
}

impl ModRm {
    pub const fn from_byte(b: u8) -> ModRm {
        ModRm {
            mode: b >> 6,
            reg: (b >> 3) & 7,
            rm: b & 7,
        }
    }

    pub const fn is_reg(self) -> bool {
        self.mode == 3
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Sib {
    pub scale: u8,
    pub index: u8,
    pub base: u8,
}

impl Sib {
    pub const fn from_byte(b: u8) -> Sib {
        Sib {
            scale: b >> 6,
            index: (b >> 3) & 7,
            base: b & 7,
        }
    }
}

/// One decoded instruction. Produced per fetch and consumed by the executor immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub op: Op,
    /// Primary opcode byte, or `0x0F00 | byte` for two-byte opcodes.
    pub opcode: u16,
    pub width: Sz,
    pub modrm: Option<ModRm>,
    pub sib: Option<Sib>,
    /// Displacement, sign-extended to 32 bits.
    pub disp: u32,
    /// First immediate. Sign-extended where the encoding says so, zero-extended otherwise.
    /// Relative branch displacements and memory offsets (`moffs`) also land here.
    pub imm: u32,
    /// Second immediate: the selector of a direct far pointer or the ENTER nesting level.
    pub imm2: u16,
    pub seg: Option<Seg>,
    pub op32: bool,
    pub addr32: bool,
    pub rep: Option<RepPrefix>,
    pub lock: bool,
    /// Total length in bytes, prefixes included.
    pub size: u8,
    pub valid: bool,
    pub cycles: CycleEntry,
}

impl Default for Instruction {
    fn default() -> Self {
        Self {
            op: Op::Invalid,
            opcode: 0,
            width: Sz::V,
            modrm: None,
            sib: None,
            disp: 0,
            imm: 0,
            imm2: 0,
            seg: None,
            op32: false,
            addr32: false,
            rep: None,
            lock: false,
            size: 0,
            valid: false,
            cycles: CycleEntry::NULL,
        }
    }
}

impl Instruction {
    pub fn has_memory_operand(&self) -> bool {
        self.modrm.is_some_and(|m| !m.is_reg())
    }

    /// ModRM.reg, or zero for instructions without a ModRM byte.
    pub fn reg(&self) -> u8 {
        self.modrm.map_or(0, |m| m.reg)
    }

    /// Register number encoded in the low three opcode bits (`50+r`, `B8+r`, ...).
    pub fn opcode_reg(&self) -> u8 {
        (self.opcode & 7) as u8
    }

    pub fn is_string(&self) -> bool {
        matches!(self.op, Op::String(_))
    }
}
