use std::collections::HashMap;

use crate::cycles::{CycleEntry, CycleTable, GROUP_COUNT};
use crate::instruction::{
    AluForm, AluOp, BitOp, Cond, Count, Instruction, LoopKind, ModRm, Op, RepPrefix, Seg,
    ShiftOp, Sib, StringOp, Sz,
};
use crate::CpuModel;

/// Supplies instruction bytes in order. Fetches cannot fail; whatever sits behind the source
/// (prefetch queue, memory, a test buffer) decides what an unavailable byte reads as.
pub trait ByteSource {
    fn fetch_u8(&mut self) -> u8;

    fn fetch_u16(&mut self) -> u16 {
        let lo = self.fetch_u8();
        let hi = self.fetch_u8();
        u16::from_le_bytes([lo, hi])
    }

    fn fetch_u32(&mut self) -> u32 {
        let lo = self.fetch_u16();
        let hi = self.fetch_u16();
        u32::from(lo) | (u32::from(hi) << 16)
    }
}

impl<T: ByteSource + ?Sized> ByteSource for &mut T {
    fn fetch_u8(&mut self) -> u8 {
        (**self).fetch_u8()
    }
}

/// Decodes from a byte slice. Reads past the end return zero.
#[derive(Debug, Clone)]
pub struct SliceSource<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> SliceSource<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }
}

impl ByteSource for SliceSource<'_> {
    fn fetch_u8(&mut self) -> u8 {
        let b = self.bytes.get(self.pos).copied().unwrap_or(0);
        self.pos += 1;
        b
    }
}

/// Key of a cycle timing override: an opcode, plus ModRM.reg for group opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CycleKey {
    pub opcode: u16,
    pub reg: Option<u8>,
}

impl CycleKey {
    pub const fn opcode(opcode: u16) -> Self {
        Self { opcode, reg: None }
    }

    pub const fn group(opcode: u16, reg: u8) -> Self {
        Self {
            opcode,
            reg: Some(reg & 7),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Imm {
    None,
    /// Zero-extended byte.
    Ib,
    /// Sign-extended byte.
    Ibs,
    Iw,
    /// Word or dword by operand size.
    Iv,
    /// Direct far pointer: offset by operand size, then selector.
    Ap,
    /// Memory offset by address size.
    Moffs,
    /// 8-bit relative displacement.
    Jb,
    /// 16/32-bit relative displacement by operand size.
    Jv,
    /// ENTER: frame size word, nesting level byte.
    Enter,
}

#[derive(Debug, Clone, Copy)]
struct Template {
    op: Op,
    width: Sz,
    modrm: bool,
    imm: Imm,
    i386: bool,
}

const fn t(op: Op) -> Template {
    Template {
        op,
        width: Sz::V,
        modrm: false,
        imm: Imm::None,
        i386: false,
    }
}

impl Template {
    const fn b(self) -> Self {
        Template {
            width: Sz::B,
            ..self
        }
    }

    const fn m(self) -> Self {
        Template {
            modrm: true,
            ..self
        }
    }

    const fn i(self, imm: Imm) -> Self {
        Template { imm, ..self }
    }

    const fn n386(self) -> Self {
        Template { i386: true, ..self }
    }
}

const INVALID: Template = t(Op::Invalid);

const fn primary() -> [Template; 256] {
    let mut t_ = [INVALID; 256];

    let mut i = 0;
    while i < 8 {
        let base = i * 8;
        let op = AluOp::from_index(i as u8);
        t_[base] = t(Op::Alu(op, AluForm::RmReg)).b().m();
        t_[base + 1] = t(Op::Alu(op, AluForm::RmReg)).m();
        t_[base + 2] = t(Op::Alu(op, AluForm::RegRm)).b().m();
        t_[base + 3] = t(Op::Alu(op, AluForm::RegRm)).m();
        t_[base + 4] = t(Op::Alu(op, AluForm::AccImm)).b().i(Imm::Ib);
        t_[base + 5] = t(Op::Alu(op, AluForm::AccImm)).i(Imm::Iv);
        i += 1;
    }

    t_[0x06] = t(Op::PushSeg(Seg::Es));
    t_[0x07] = t(Op::PopSeg(Seg::Es));
    t_[0x0E] = t(Op::PushSeg(Seg::Cs));
    t_[0x16] = t(Op::PushSeg(Seg::Ss));
    t_[0x17] = t(Op::PopSeg(Seg::Ss));
    t_[0x1E] = t(Op::PushSeg(Seg::Ds));
    t_[0x1F] = t(Op::PopSeg(Seg::Ds));
    t_[0x27] = t(Op::Daa);
    t_[0x2F] = t(Op::Das);
    t_[0x37] = t(Op::Aaa);
    t_[0x3F] = t(Op::Aas);

    let mut r = 0;
    while r < 8 {
        t_[0x40 + r] = t(Op::IncReg);
        t_[0x48 + r] = t(Op::DecReg);
        t_[0x50 + r] = t(Op::PushReg);
        t_[0x58 + r] = t(Op::PopReg);
        t_[0x90 + r] = t(Op::XchgAccReg);
        t_[0xB0 + r] = t(Op::MovRegImm).b().i(Imm::Ib);
        t_[0xB8 + r] = t(Op::MovRegImm).i(Imm::Iv);
        t_[0xD8 + r] = t(Op::Esc).m();
        r += 1;
    }
    t_[0x90] = t(Op::Nop);

    t_[0x60] = t(Op::Pusha);
    t_[0x61] = t(Op::Popa);
    t_[0x62] = t(Op::Bound).m();
    t_[0x63] = t(Op::Arpl).m();
    t_[0x68] = t(Op::PushImm).i(Imm::Iv);
    t_[0x69] = t(Op::ImulImm).m().i(Imm::Iv);
    t_[0x6A] = t(Op::PushImm).i(Imm::Ibs);
    t_[0x6B] = t(Op::ImulImm).m().i(Imm::Ibs);
    t_[0x6C] = t(Op::String(StringOp::Ins)).b();
    t_[0x6D] = t(Op::String(StringOp::Ins));
    t_[0x6E] = t(Op::String(StringOp::Outs)).b();
    t_[0x6F] = t(Op::String(StringOp::Outs));

    let mut cc = 0;
    while cc < 16 {
        t_[0x70 + cc] = t(Op::Jcc(Cond::from_index(cc as u8))).i(Imm::Jb);
        cc += 1;
    }

    t_[0x80] = t(Op::Group(0)).b().m().i(Imm::Ib);
    t_[0x81] = t(Op::Group(1)).m().i(Imm::Iv);
    t_[0x82] = t(Op::Group(0)).b().m().i(Imm::Ib);
    t_[0x83] = t(Op::Group(2)).m().i(Imm::Ibs);
    t_[0x84] = t(Op::TestRmReg).b().m();
    t_[0x85] = t(Op::TestRmReg).m();
    t_[0x86] = t(Op::XchgRmReg).b().m();
    t_[0x87] = t(Op::XchgRmReg).m();
    t_[0x88] = t(Op::MovRmReg).b().m();
    t_[0x89] = t(Op::MovRmReg).m();
    t_[0x8A] = t(Op::MovRegRm).b().m();
    t_[0x8B] = t(Op::MovRegRm).m();
    t_[0x8C] = t(Op::MovRmSeg).m();
    t_[0x8D] = t(Op::Lea).m();
    t_[0x8E] = t(Op::MovSegRm).m();
    t_[0x8F] = t(Op::PopRm).m();

    t_[0x98] = t(Op::Cbw);
    t_[0x99] = t(Op::Cwd);
    t_[0x9A] = t(Op::CallFar).i(Imm::Ap);
    t_[0x9B] = t(Op::Wait);
    t_[0x9C] = t(Op::Pushf);
    t_[0x9D] = t(Op::Popf);
    t_[0x9E] = t(Op::Sahf);
    t_[0x9F] = t(Op::Lahf);

    t_[0xA0] = t(Op::MovAccMoffs).b().i(Imm::Moffs);
    t_[0xA1] = t(Op::MovAccMoffs).i(Imm::Moffs);
    t_[0xA2] = t(Op::MovMoffsAcc).b().i(Imm::Moffs);
    t_[0xA3] = t(Op::MovMoffsAcc).i(Imm::Moffs);
    t_[0xA4] = t(Op::String(StringOp::Movs)).b();
    t_[0xA5] = t(Op::String(StringOp::Movs));
    t_[0xA6] = t(Op::String(StringOp::Cmps)).b();
    t_[0xA7] = t(Op::String(StringOp::Cmps));
    t_[0xA8] = t(Op::TestAccImm).b().i(Imm::Ib);
    t_[0xA9] = t(Op::TestAccImm).i(Imm::Iv);
    t_[0xAA] = t(Op::String(StringOp::Stos)).b();
    t_[0xAB] = t(Op::String(StringOp::Stos));
    t_[0xAC] = t(Op::String(StringOp::Lods)).b();
    t_[0xAD] = t(Op::String(StringOp::Lods));
    t_[0xAE] = t(Op::String(StringOp::Scas)).b();
    t_[0xAF] = t(Op::String(StringOp::Scas));

    t_[0xC0] = t(Op::Group(3)).b().m().i(Imm::Ib);
    t_[0xC1] = t(Op::Group(4)).m().i(Imm::Ib);
    t_[0xC2] = t(Op::Ret).i(Imm::Iw);
    t_[0xC3] = t(Op::Ret);
    t_[0xC4] = t(Op::LoadFar(Seg::Es)).m();
    t_[0xC5] = t(Op::LoadFar(Seg::Ds)).m();
    t_[0xC6] = t(Op::MovRmImm).b().m().i(Imm::Ib);
    t_[0xC7] = t(Op::MovRmImm).m().i(Imm::Iv);
    t_[0xC8] = t(Op::Enter).i(Imm::Enter);
    t_[0xC9] = t(Op::Leave);
    t_[0xCA] = t(Op::Retf).i(Imm::Iw);
    t_[0xCB] = t(Op::Retf);
    t_[0xCC] = t(Op::Int3);
    t_[0xCD] = t(Op::Int).i(Imm::Ib);
    t_[0xCE] = t(Op::Into);
    t_[0xCF] = t(Op::Iret);

    t_[0xD0] = t(Op::Group(5)).b().m();
    t_[0xD1] = t(Op::Group(6)).m();
    t_[0xD2] = t(Op::Group(7)).b().m();
    t_[0xD3] = t(Op::Group(8)).m();
    t_[0xD4] = t(Op::Aam).i(Imm::Ib);
    t_[0xD5] = t(Op::Aad).i(Imm::Ib);
    t_[0xD6] = t(Op::Salc);
    t_[0xD7] = t(Op::Xlat);

    t_[0xE0] = t(Op::Loop(LoopKind::Loopne)).i(Imm::Jb);
    t_[0xE1] = t(Op::Loop(LoopKind::Loope)).i(Imm::Jb);
    t_[0xE2] = t(Op::Loop(LoopKind::Loop)).i(Imm::Jb);
    t_[0xE3] = t(Op::Loop(LoopKind::Jcxz)).i(Imm::Jb);
    t_[0xE4] = t(Op::InImm).b().i(Imm::Ib);
    t_[0xE5] = t(Op::InImm).i(Imm::Ib);
    t_[0xE6] = t(Op::OutImm).b().i(Imm::Ib);
    t_[0xE7] = t(Op::OutImm).i(Imm::Ib);
    t_[0xE8] = t(Op::CallRel).i(Imm::Jv);
    t_[0xE9] = t(Op::JmpRel).i(Imm::Jv);
    t_[0xEA] = t(Op::JmpFar).i(Imm::Ap);
    t_[0xEB] = t(Op::JmpRel).i(Imm::Jb);
    t_[0xEC] = t(Op::InDx).b();
    t_[0xED] = t(Op::InDx);
    t_[0xEE] = t(Op::OutDx).b();
    t_[0xEF] = t(Op::OutDx);

    t_[0xF1] = t(Op::Int1).n386();
    t_[0xF4] = t(Op::Hlt);
    t_[0xF5] = t(Op::Cmc);
    t_[0xF6] = t(Op::Group(9)).b().m();
    t_[0xF7] = t(Op::Group(10)).m();
    t_[0xF8] = t(Op::Clc);
    t_[0xF9] = t(Op::Stc);
    t_[0xFA] = t(Op::Cli);
    t_[0xFB] = t(Op::Sti);
    t_[0xFC] = t(Op::Cld);
    t_[0xFD] = t(Op::Std);
    t_[0xFE] = t(Op::Group(11)).b().m();
    t_[0xFF] = t(Op::Group(12)).m();
    t_
}

const fn extended() -> [Template; 256] {
    let mut t_ = [INVALID; 256];
    t_[0x00] = t(Op::Group(13)).m();
    t_[0x01] = t(Op::Group(14)).m();
    t_[0x02] = t(Op::Lar).m();
    t_[0x03] = t(Op::Lsl).m();
    t_[0x06] = t(Op::Clts);

    t_[0x20] = t(Op::MovRegCr).m().n386();
    t_[0x21] = t(Op::MovRegDr).m().n386();
    t_[0x22] = t(Op::MovCrReg).m().n386();
    t_[0x23] = t(Op::MovDrReg).m().n386();

    let mut cc = 0;
    while cc < 16 {
        let cond = Cond::from_index(cc as u8);
        t_[0x80 + cc] = t(Op::Jcc(cond)).i(Imm::Jv).n386();
        t_[0x90 + cc] = t(Op::Setcc(cond)).b().m().n386();
        cc += 1;
    }

    t_[0xA0] = t(Op::PushSeg(Seg::Fs)).n386();
    t_[0xA1] = t(Op::PopSeg(Seg::Fs)).n386();
    t_[0xA3] = t(Op::BitReg(BitOp::Bt)).m().n386();
    t_[0xA4] = t(Op::Shld(Count::Imm)).m().i(Imm::Ib).n386();
    t_[0xA5] = t(Op::Shld(Count::Cl)).m().n386();
    t_[0xA8] = t(Op::PushSeg(Seg::Gs)).n386();
    t_[0xA9] = t(Op::PopSeg(Seg::Gs)).n386();
    t_[0xAB] = t(Op::BitReg(BitOp::Bts)).m().n386();
    t_[0xAC] = t(Op::Shrd(Count::Imm)).m().i(Imm::Ib).n386();
    t_[0xAD] = t(Op::Shrd(Count::Cl)).m().n386();
    t_[0xAF] = t(Op::ImulRegRm).m().n386();
    t_[0xB2] = t(Op::LoadFar(Seg::Ss)).m().n386();
    t_[0xB3] = t(Op::BitReg(BitOp::Btr)).m().n386();
    t_[0xB4] = t(Op::LoadFar(Seg::Fs)).m().n386();
    t_[0xB5] = t(Op::LoadFar(Seg::Gs)).m().n386();
    t_[0xB6] = t(Op::Movzx).b().m().n386();
    t_[0xB7] = t(Op::Movzx).m().n386();
    t_[0xBA] = t(Op::Group(15)).m().i(Imm::Ib).n386();
    t_[0xBB] = t(Op::BitReg(BitOp::Btc)).m().n386();
    t_[0xBC] = t(Op::Bsf).m().n386();
    t_[0xBD] = t(Op::Bsr).m().n386();
    t_[0xBE] = t(Op::Movsx).b().m().n386();
    t_[0xBF] = t(Op::Movsx).m().n386();
    t_
}

const fn groups() -> [[Template; 8]; GROUP_COUNT] {
    let mut g = [[INVALID; 8]; GROUP_COUNT];
    let mut r = 0;
    while r < 8 {
        let alu = t(Op::Alu(AluOp::from_index(r as u8), AluForm::RmImm));
        g[0][r] = alu;
        g[1][r] = alu;
        g[2][r] = alu;
        let shift = ShiftOp::from_index(r as u8);
        g[3][r] = t(Op::Shift(shift, Count::Imm));
        g[4][r] = t(Op::Shift(shift, Count::Imm));
        g[5][r] = t(Op::Shift(shift, Count::One));
        g[6][r] = t(Op::Shift(shift, Count::One));
        g[7][r] = t(Op::Shift(shift, Count::Cl));
        g[8][r] = t(Op::Shift(shift, Count::Cl));
        r += 1;
    }

    g[9] = [
        t(Op::TestRmImm).i(Imm::Ib),
        t(Op::TestRmImm).i(Imm::Ib),
        t(Op::Not),
        t(Op::Neg),
        t(Op::Mul),
        t(Op::Imul),
        t(Op::Div),
        t(Op::Idiv),
    ];
    g[10] = [
        t(Op::TestRmImm).i(Imm::Iv),
        t(Op::TestRmImm).i(Imm::Iv),
        t(Op::Not),
        t(Op::Neg),
        t(Op::Mul),
        t(Op::Imul),
        t(Op::Div),
        t(Op::Idiv),
    ];
    g[11][0] = t(Op::IncRm);
    g[11][1] = t(Op::DecRm);
    g[12] = [
        t(Op::IncRm),
        t(Op::DecRm),
        t(Op::CallRm),
        t(Op::CallFarRm),
        t(Op::JmpRm),
        t(Op::JmpFarRm),
        t(Op::PushRm),
        INVALID,
    ];
    g[13] = [
        t(Op::Sldt),
        t(Op::Str),
        t(Op::Lldt),
        t(Op::Ltr),
        t(Op::Verr),
        t(Op::Verw),
        INVALID,
        INVALID,
    ];
    g[14] = [
        t(Op::Sgdt),
        t(Op::Sidt),
        t(Op::Lgdt),
        t(Op::Lidt),
        t(Op::Smsw),
        INVALID,
        t(Op::Lmsw),
        INVALID,
    ];
    g[15][4] = t(Op::BitImm(BitOp::Bt));
    g[15][5] = t(Op::BitImm(BitOp::Bts));
    g[15][6] = t(Op::BitImm(BitOp::Btr));
    g[15][7] = t(Op::BitImm(BitOp::Btc));
    g
}

static PRIMARY: [Template; 256] = primary();
static EXTENDED: [Template; 256] = extended();
static GROUPS: [[Template; 8]; GROUP_COUNT] = groups();

/// Instruction decoder for one processor generation.
#[derive(Debug, Clone)]
pub struct Decoder {
    model: CpuModel,
    overrides: HashMap<CycleKey, CycleEntry>,
}

impl Decoder {
    pub fn new(model: CpuModel) -> Self {
        Self {
            model,
            overrides: HashMap::new(),
        }
    }

    /// Replaces table timings for selected opcodes.
    pub fn with_overrides(model: CpuModel, overrides: HashMap<CycleKey, CycleEntry>) -> Self {
        Self { model, overrides }
    }

    pub fn model(&self) -> CpuModel {
        self.model
    }

    /// Decodes one instruction. `default32` is the code segment's default operand and
    /// address size (the D bit); it is ignored on the 286.
    ///
    /// Decoding never fails: undefined encodings come back with `valid == false`, and an
    /// instruction longer than the model allows comes back with its oversized `size`.
    pub fn decode<S: ByteSource>(&self, src: &mut S, default32: bool) -> Instruction {
        let is386 = self.model == CpuModel::I80386;
        let max = u32::from(self.model.max_instr_size());
        let default32 = default32 && is386;

        let mut ins = Instruction::default();
        let mut size: u32 = 0;
        let mut opsize = false;
        let mut addrsize = false;

        let mut byte = loop {
            let b = src.fetch_u8();
            size += 1;
            match b {
                0x26 => ins.seg = Some(Seg::Es),
                0x2E => ins.seg = Some(Seg::Cs),
                0x36 => ins.seg = Some(Seg::Ss),
                0x3E => ins.seg = Some(Seg::Ds),
                0x64 if is386 => ins.seg = Some(Seg::Fs),
                0x65 if is386 => ins.seg = Some(Seg::Gs),
                0x66 if is386 => opsize = true,
                0x67 if is386 => addrsize = true,
                0xF0 => ins.lock = true,
                0xF1 if !is386 => ins.lock = true,
                0xF2 => ins.rep = Some(RepPrefix::Repne),
                0xF3 => ins.rep = Some(RepPrefix::Rep),
                _ => break b,
            }
            if size >= max {
                // Prefixes alone fill the length limit; the executor rejects this before
                // anything else is looked at.
                ins.op = Op::Nop;
                ins.valid = true;
                ins.size = (size + 1) as u8;
                ins.op32 = default32 ^ opsize;
                ins.addr32 = default32 ^ addrsize;
                return ins;
            }
        };

        ins.op32 = default32 ^ opsize;
        ins.addr32 = default32 ^ addrsize;

        let mut tpl = if byte == 0x0F {
            byte = src.fetch_u8();
            size += 1;
            ins.opcode = 0x0F00 | u16::from(byte);
            EXTENDED[usize::from(byte)]
        } else {
            ins.opcode = u16::from(byte);
            PRIMARY[usize::from(byte)]
        };
        if tpl.i386 && !is386 {
            tpl = INVALID;
        }
        ins.width = tpl.width;

        let mut imm_kind = tpl.imm;
        let mut op = tpl.op;
        if tpl.modrm {
            let mut modrm = ModRm::from_byte(src.fetch_u8());
            size += 1;
            if matches!(
                op,
                Op::MovRegCr | Op::MovCrReg | Op::MovRegDr | Op::MovDrReg
            ) {
                // Control/debug register moves always address registers.
                modrm.mode = 3;
            } else {
                size += self.decode_address(src, &mut ins, modrm);
            }
            ins.modrm = Some(modrm);

            if let Op::Group(g) = op {
                let member = GROUPS[usize::from(g)][usize::from(modrm.reg)];
                op = member.op;
                if member.imm != Imm::None {
                    imm_kind = member.imm;
                }
            }
        }
        ins.op = op;
        ins.valid = self.is_valid(&ins);

        size += self.decode_immediate(src, &mut ins, imm_kind);
        ins.size = size.min(u32::from(u8::MAX)) as u8;

        let reg = ins.reg();
        ins.cycles = if ins.rep.is_some() && !ins.is_string() {
            CycleEntry::NULL
        } else {
            self.cycles(ins.opcode, reg)
        };
        ins
    }

    /// Timing for `opcode`, honouring configured overrides.
    pub fn cycles(&self, opcode: u16, reg: u8) -> CycleEntry {
        if !self.overrides.is_empty() {
            let key = if crate::cycles::group_of(opcode).is_some() {
                CycleKey::group(opcode, reg)
            } else {
                CycleKey::opcode(opcode)
            };
            if let Some(entry) = self.overrides.get(&key) {
                return *entry;
            }
        }
        CycleTable::for_model(self.model).lookup(opcode, reg)
    }

    fn is_valid(&self, ins: &Instruction) -> bool {
        let is_reg = ins.modrm.is_some_and(|m| m.is_reg());
        match ins.op {
            Op::Invalid | Op::Group(_) => false,
            op if op.requires_memory() && is_reg => false,
            Op::MovSegRm => {
                let reg = ins.reg();
                reg != Seg::Cs as u8 && reg < self.segment_count()
            }
            Op::MovRmSeg => ins.reg() < self.segment_count(),
            Op::MovRegCr | Op::MovCrReg => matches!(ins.reg(), 0 | 2 | 3),
            _ => true,
        }
    }

    fn segment_count(&self) -> u8 {
        match self.model {
            CpuModel::I80286 => 4,
            CpuModel::I80386 => 6,
        }
    }

    /// Consumes SIB and displacement bytes for a memory ModRM. Returns the bytes consumed.
    fn decode_address<S: ByteSource>(&self, src: &mut S, ins: &mut Instruction, modrm: ModRm) -> u32 {
        if modrm.is_reg() {
            return 0;
        }
        let mut size = 0;
        if ins.addr32 {
            let mut disp32 = modrm.mode == 0 && modrm.rm == 5;
            if modrm.rm == 4 {
                let sib = Sib::from_byte(src.fetch_u8());
                size += 1;
                if sib.base == 5 && modrm.mode == 0 {
                    disp32 = true;
                }
                ins.sib = Some(sib);
            }
            match modrm.mode {
                1 => {
                    ins.disp = src.fetch_u8() as i8 as i32 as u32;
                    size += 1;
                }
                2 => {
                    ins.disp = src.fetch_u32();
                    size += 4;
                }
                _ if disp32 => {
                    ins.disp = src.fetch_u32();
                    size += 4;
                }
                _ => {}
            }
        } else {
            match modrm.mode {
                0 if modrm.rm == 6 => {
                    ins.disp = src.fetch_u16() as i16 as i32 as u32;
                    size += 2;
                }
                1 => {
                    ins.disp = src.fetch_u8() as i8 as i32 as u32;
                    size += 1;
                }
                2 => {
                    ins.disp = src.fetch_u16() as i16 as i32 as u32;
                    size += 2;
                }
                _ => {}
            }
        }
        size
    }

    fn decode_immediate<S: ByteSource>(&self, src: &mut S, ins: &mut Instruction, kind: Imm) -> u32 {
        match kind {
            Imm::None => 0,
            Imm::Ib => {
                ins.imm = u32::from(src.fetch_u8());
                1
            }
            Imm::Ibs | Imm::Jb => {
                ins.imm = src.fetch_u8() as i8 as i32 as u32;
                1
            }
            Imm::Iw => {
                ins.imm = u32::from(src.fetch_u16());
                2
            }
            Imm::Iv if ins.op32 => {
                ins.imm = src.fetch_u32();
                4
            }
            Imm::Iv => {
                ins.imm = u32::from(src.fetch_u16());
                2
            }
            Imm::Jv if ins.op32 => {
                ins.imm = src.fetch_u32();
                4
            }
            Imm::Jv => {
                ins.imm = src.fetch_u16() as i16 as i32 as u32;
                2
            }
            Imm::Moffs if ins.addr32 => {
                ins.imm = src.fetch_u32();
                4
            }
            Imm::Moffs => {
                ins.imm = u32::from(src.fetch_u16());
                2
            }
            Imm::Ap => {
                let len = if ins.op32 {
                    ins.imm = src.fetch_u32();
                    4
                } else {
                    ins.imm = u32::from(src.fetch_u16());
                    2
                };
                ins.imm2 = src.fetch_u16();
                len + 2
            }
            Imm::Enter => {
                ins.imm = u32::from(src.fetch_u16());
                ins.imm2 = u16::from(src.fetch_u8());
                3
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(model: CpuModel, bytes: &[u8]) -> Instruction {
        Decoder::new(model).decode(&mut SliceSource::new(bytes), false)
    }

    #[test]
    fn group_83_immediate_is_sign_extended() {
        // add word [bx+si], -2
        let ins = decode(CpuModel::I80286, &[0x83, 0x00, 0xFE]);
        assert_eq!(ins.op, Op::Alu(AluOp::Add, AluForm::RmImm));
        assert_eq!(ins.imm, 0xFFFF_FFFE);
        assert_eq!(ins.size, 3);

        // cmp byte [bx], 0xFE keeps the byte as is
        let ins = decode(CpuModel::I80286, &[0x80, 0x3F, 0xFE]);
        assert_eq!(ins.op, Op::Alu(AluOp::Cmp, AluForm::RmImm));
        assert_eq!(ins.imm, 0xFE);
    }

    #[test]
    fn rep_on_non_string_opcode_has_null_timing() {
        let ins = decode(CpuModel::I80286, &[0xF3, 0x01, 0xC0]);
        assert!(ins.valid);
        assert_eq!(ins.rep, Some(RepPrefix::Rep));
        assert!(ins.cycles.is_null());

        let ins = decode(CpuModel::I80286, &[0xF3, 0xA4]);
        assert_eq!(ins.op, Op::String(StringOp::Movs));
        assert_eq!(ins.cycles.rep_iter, 4);
    }

    #[test]
    fn group_members_resolve_by_modrm_reg() {
        let ins = decode(CpuModel::I80286, &[0xF7, 0xC3, 0x34, 0x12]);
        assert_eq!(ins.op, Op::TestRmImm);
        assert_eq!(ins.imm, 0x1234);
        assert_eq!(ins.size, 4);

        let ins = decode(CpuModel::I80286, &[0xF7, 0xF3]);
        assert_eq!(ins.op, Op::Div);
        assert_eq!(ins.size, 2);

        let ins = decode(CpuModel::I80286, &[0xFF, 0xFF]);
        assert!(!ins.valid);
    }

    #[test]
    fn memory_only_forms_with_register_operand_are_invalid() {
        assert!(!decode(CpuModel::I80286, &[0x8D, 0xC0]).valid);
        assert!(!decode(CpuModel::I80286, &[0xC4, 0xC0]).valid);
        assert!(!decode(CpuModel::I80286, &[0x0F, 0x01, 0xD0]).valid);
        assert!(decode(CpuModel::I80286, &[0x0F, 0x01, 0xF0]).valid); // lmsw ax
    }

    #[test]
    fn the_286_rejects_386_encodings() {
        assert!(!decode(CpuModel::I80286, &[0x0F, 0xB6, 0xC0]).valid);
        assert!(!decode(CpuModel::I80286, &[0x66]).valid);
        assert!(decode(CpuModel::I80386, &[0x0F, 0xB6, 0xC0]).valid);
    }

    #[test]
    fn operand_size_prefix_widens_immediates() {
        let ins = decode(CpuModel::I80386, &[0x66, 0xB8, 1, 2, 3, 4]);
        assert!(ins.op32);
        assert_eq!(ins.imm, 0x0403_0201);
        assert_eq!(ins.size, 6);

        let ins = Decoder::new(CpuModel::I80386)
            .decode(&mut SliceSource::new(&[0x66, 0xB8, 1, 2]), true);
        assert!(!ins.op32);
        assert_eq!(ins.imm, 0x0201);
    }

    #[test]
    fn sib_and_disp32_addressing() {
        // mov eax, [ebx+ecx*4+0x10]
        let ins = Decoder::new(CpuModel::I80386)
            .decode(&mut SliceSource::new(&[0x8B, 0x44, 0x8B, 0x10]), true);
        assert_eq!(ins.sib, Some(Sib { scale: 2, index: 1, base: 3 }));
        assert_eq!(ins.disp, 0x10);
        assert_eq!(ins.size, 4);

        // mov eax, [0x12345678] via SIB with no base
        let ins = Decoder::new(CpuModel::I80386).decode(
            &mut SliceSource::new(&[0x8B, 0x04, 0x25, 0x78, 0x56, 0x34, 0x12]),
            true,
        );
        assert_eq!(ins.disp, 0x1234_5678);
        assert_eq!(ins.size, 7);
    }

    #[test]
    fn prefix_flood_produces_oversized_instruction() {
        let bytes = [0x26u8; 16];
        let ins = decode(CpuModel::I80286, &bytes);
        assert!(ins.valid);
        assert!(ins.size > CpuModel::I80286.max_instr_size());
    }

    #[test]
    fn overrides_replace_table_entries() {
        let mut overrides = HashMap::new();
        overrides.insert(CycleKey::opcode(0x62), CycleEntry::new(99, 99));
        overrides.insert(CycleKey::group(0xF7, 6), CycleEntry::new(50, 60));
        let dec = Decoder::with_overrides(CpuModel::I80286, overrides);
        assert_eq!(dec.cycles(0x62, 0).base, 99);
        assert_eq!(dec.cycles(0xF7, 6).mem, 60);
        assert_eq!(dec.cycles(0xF7, 7).base, 25);
    }
}
