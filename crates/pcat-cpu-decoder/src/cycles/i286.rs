use super::{c, expand, CycleEntry, CycleTable, GROUP_COUNT};

const N: CycleEntry = CycleEntry::NULL;

#[rustfmt::skip]
const PRIMARY: [CycleEntry; 256] = expand(&[
    (0x00, 0x03, c(2, 7)),                  (0x04, 0x05, c(3, 3)),          // ADD
    (0x06, 0x06, c(3, 3)),                  (0x07, 0x07, c(5, 5).pm(15)),   // PUSH/POP ES
    (0x08, 0x0B, c(2, 7)),                  (0x0C, 0x0D, c(3, 3)),          // OR
    (0x0E, 0x0E, c(3, 3)),
    (0x10, 0x13, c(2, 7)),                  (0x14, 0x15, c(3, 3)),          // ADC
    (0x16, 0x16, c(3, 3)),                  (0x17, 0x17, c(5, 5).pm(15)),
    (0x18, 0x1B, c(2, 7)),                  (0x1C, 0x1D, c(3, 3)),          // SBB
    (0x1E, 0x1E, c(3, 3)),                  (0x1F, 0x1F, c(5, 5).pm(15)),
    (0x20, 0x23, c(2, 7)),                  (0x24, 0x25, c(3, 3)),          // AND
    (0x27, 0x27, c(3, 3)),                                                  // DAA
    (0x28, 0x2B, c(2, 7)),                  (0x2C, 0x2D, c(3, 3)),          // SUB
    (0x2F, 0x2F, c(3, 3)),                                                  // DAS
    (0x30, 0x33, c(2, 7)),                  (0x34, 0x35, c(3, 3)),          // XOR
    (0x37, 0x37, c(3, 3)),                                                  // AAA
    (0x38, 0x3B, c(2, 6)),                  (0x3C, 0x3D, c(3, 3)),          // CMP
    (0x3F, 0x3F, c(3, 3)),                                                  // AAS
    (0x40, 0x4F, c(2, 2)),                                                  // INC/DEC r16
    (0x50, 0x57, c(3, 3)),                  (0x58, 0x5F, c(5, 5)),          // PUSH/POP r16
    (0x60, 0x60, c(17, 17).bu(-2)),         (0x61, 0x61, c(19, 19).bu(-2)), // PUSHA/POPA
    (0x62, 0x62, c(13, 13)),                                                // BOUND
    (0x63, 0x63, c(10, 11)),                                                // ARPL
    (0x68, 0x68, c(3, 3)),                  (0x69, 0x69, c(21, 24).bu(4)),  // PUSH iw, IMUL
    (0x6A, 0x6A, c(3, 3)),                  (0x6B, 0x6B, c(21, 24).bu(4)),
    (0x6C, 0x6D, c(5, 5).rp(5, 4)),                                         // INS
    (0x6E, 0x6F, c(5, 5).rp(5, 4)),                                         // OUTS
    (0x70, 0x7F, c(7, 7).nj(3)),                                            // Jcc
    (0x84, 0x85, c(2, 6)),                                                  // TEST
    (0x86, 0x87, c(3, 5)),                                                  // XCHG
    (0x88, 0x89, c(2, 3)),                  (0x8A, 0x8B, c(2, 5)),          // MOV
    (0x8C, 0x8C, c(2, 3)),                  (0x8D, 0x8D, c(3, 3)),          // MOV r/m,sreg; LEA
    (0x8E, 0x8E, c(2, 5).pm(15)),           (0x8F, 0x8F, c(5, 5)),          // MOV sreg; POP r/m
    (0x90, 0x90, c(3, 3)),                  (0x91, 0x97, c(3, 3)),          // NOP, XCHG AX
    (0x98, 0x99, c(2, 2)),                                                  // CBW, CWD
    (0x9A, 0x9A, c(13, 13).pm(13)),                                         // CALL far
    (0x9B, 0x9B, c(3, 3)),                                                  // WAIT
    (0x9C, 0x9C, c(3, 3)),                  (0x9D, 0x9D, c(5, 5)),          // PUSHF/POPF
    (0x9E, 0x9F, c(2, 2)),                                                  // SAHF/LAHF
    (0xA0, 0xA1, c(5, 5)),                  (0xA2, 0xA3, c(3, 3)),          // MOV moffs
    (0xA4, 0xA5, c(5, 5).rp(5, 4)),                                         // MOVS
    (0xA6, 0xA7, c(8, 8).rp(5, 9)),                                         // CMPS
    (0xA8, 0xA9, c(3, 3)),                                                  // TEST acc
    (0xAA, 0xAB, c(3, 3).rp(4, 3)),                                         // STOS
    (0xAC, 0xAD, c(5, 5).rp(5, 4)),                                         // LODS
    (0xAE, 0xAF, c(7, 7).rp(5, 8)),                                         // SCAS
    (0xB0, 0xBF, c(2, 2)),                                                  // MOV r,imm
    (0xC2, 0xC3, c(11, 11)),                                                // RET
    (0xC4, 0xC5, c(7, 7).pm(14)),                                           // LES/LDS
    (0xC6, 0xC7, c(2, 3)),                                                  // MOV r/m,imm
    (0xC8, 0xC8, c(11, 11)),                (0xC9, 0xC9, c(5, 5)),          // ENTER/LEAVE
    (0xCA, 0xCB, c(15, 15).pm(10)),                                         // RETF
    (0xCC, 0xCC, c(23, 23).pm(17)),         (0xCD, 0xCD, c(23, 23).pm(17)), // INT3, INT
    (0xCE, 0xCE, c(24, 24).pm(17).nj(3)),                                   // INTO
    (0xCF, 0xCF, c(17, 17).pm(14)),                                         // IRET
    (0xD4, 0xD4, c(16, 16).bu(4)),          (0xD5, 0xD5, c(14, 14).bu(4)),  // AAM/AAD
    (0xD6, 0xD6, c(3, 3)),                  (0xD7, 0xD7, c(5, 5)),          // SALC, XLAT
    (0xD8, 0xDF, c(9, 9)),                                                  // ESC
    (0xE0, 0xE2, c(8, 8).nj(4)),            (0xE3, 0xE3, c(8, 8).nj(4)),    // LOOPcc, JCXZ
    (0xE4, 0xE5, c(5, 5)),                  (0xE6, 0xE7, c(3, 3)),          // IN/OUT imm
    (0xE8, 0xE8, c(7, 7)),                  (0xE9, 0xE9, c(7, 7)),          // CALL/JMP near
    (0xEA, 0xEA, c(11, 11).pm(12)),         (0xEB, 0xEB, c(7, 7)),          // JMP far, short
    (0xEC, 0xED, c(5, 5)),                  (0xEE, 0xEF, c(3, 3)),          // IN/OUT DX
    (0xF4, 0xF4, c(2, 2)),                  (0xF5, 0xF5, c(2, 2)),          // HLT, CMC
    (0xF8, 0xF9, c(2, 2)),                                                  // CLC/STC
    (0xFA, 0xFA, c(3, 3)),                  (0xFB, 0xFB, c(2, 2)),          // CLI/STI
    (0xFC, 0xFD, c(2, 2)),                                                  // CLD/STD
]);

#[rustfmt::skip]
const EXTENDED: [CycleEntry; 256] = expand(&[
    (0x02, 0x02, c(14, 16)),                                                // LAR
    (0x03, 0x03, c(14, 16)),                                                // LSL
    (0x06, 0x06, c(2, 2)),                                                  // CLTS
]);

const ALU_IMM: [CycleEntry; 8] = [
    c(3, 7), c(3, 7), c(3, 7), c(3, 7), c(3, 7), c(3, 7), c(3, 7), c(3, 6),
];
const SHIFT_1: [CycleEntry; 8] = [c(2, 7); 8];
const SHIFT_N: [CycleEntry; 8] = [c(5, 8); 8];

#[rustfmt::skip]
const GROUPS: [[CycleEntry; 8]; GROUP_COUNT] = [
    ALU_IMM,                                                                        // 80/82
    ALU_IMM,                                                                        // 81
    ALU_IMM,                                                                        // 83
    SHIFT_N,                                                                        // C0
    SHIFT_N,                                                                        // C1
    SHIFT_1,                                                                        // D0
    SHIFT_1,                                                                        // D1
    SHIFT_N,                                                                        // D2
    SHIFT_N,                                                                        // D3
    // F6: TEST, TEST, NOT, NEG, MUL, IMUL, DIV, IDIV
    [c(3, 6), c(3, 6), c(2, 7), c(2, 7),
     c(13, 16).bu(4), c(13, 16).bu(4), c(14, 17).bu(4), c(17, 20).bu(4)],
    // F7
    [c(3, 6), c(3, 6), c(2, 7), c(2, 7),
     c(21, 24).bu(4), c(21, 24).bu(4), c(22, 25).bu(4), c(25, 28).bu(4)],
    // FE: INC, DEC
    [c(2, 7), c(2, 7), N, N, N, N, N, N],
    // FF: INC, DEC, CALL, CALLF, JMP, JMPF, PUSH
    [c(2, 7), c(2, 7), c(7, 11), c(16, 16).pm(13),
     c(7, 11), c(15, 15).pm(11), c(3, 5), N],
    // 0F 00: SLDT, STR, LLDT, LTR, VERR, VERW
    [c(2, 3), c(2, 3), c(17, 19), c(17, 19), c(14, 16), c(14, 16), N, N],
    // 0F 01: SGDT, SIDT, LGDT, LIDT, SMSW, -, LMSW
    [c(11, 11), c(12, 12), c(11, 11), c(12, 12), c(2, 3), N, c(3, 6), N],
    [N; 8],                                                                         // 0F BA
];

pub(super) static TABLE: CycleTable = CycleTable {
    primary: PRIMARY,
    extended: EXTENDED,
    groups: GROUPS,
};
