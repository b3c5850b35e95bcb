use super::{c, expand, CycleEntry, CycleTable, GROUP_COUNT};

const N: CycleEntry = CycleEntry::NULL;

#[rustfmt::skip]
const PRIMARY: [CycleEntry; 256] = expand(&[
    (0x00, 0x01, c(2, 7)),  (0x02, 0x03, c(2, 6)),  (0x04, 0x05, c(2, 2)),  // ADD
    (0x06, 0x06, c(2, 2)),  (0x07, 0x07, c(7, 7).pm(14)),                   // PUSH/POP ES
    (0x08, 0x09, c(2, 7)),  (0x0A, 0x0B, c(2, 6)),  (0x0C, 0x0D, c(2, 2)),  // OR
    (0x0E, 0x0E, c(2, 2)),
    (0x10, 0x11, c(2, 7)),  (0x12, 0x13, c(2, 6)),  (0x14, 0x15, c(2, 2)),  // ADC
    (0x16, 0x16, c(2, 2)),  (0x17, 0x17, c(7, 7).pm(14)),
    (0x18, 0x19, c(2, 7)),  (0x1A, 0x1B, c(2, 6)),  (0x1C, 0x1D, c(2, 2)),  // SBB
    (0x1E, 0x1E, c(2, 2)),  (0x1F, 0x1F, c(7, 7).pm(14)),
    (0x20, 0x21, c(2, 7)),  (0x22, 0x23, c(2, 6)),  (0x24, 0x25, c(2, 2)),  // AND
    (0x27, 0x27, c(4, 4)),                                                  // DAA
    (0x28, 0x29, c(2, 7)),  (0x2A, 0x2B, c(2, 6)),  (0x2C, 0x2D, c(2, 2)),  // SUB
    (0x2F, 0x2F, c(4, 4)),                                                  // DAS
    (0x30, 0x31, c(2, 7)),  (0x32, 0x33, c(2, 6)),  (0x34, 0x35, c(2, 2)),  // XOR
    (0x37, 0x37, c(4, 4)),                                                  // AAA
    (0x38, 0x39, c(2, 5)),  (0x3A, 0x3B, c(2, 6)),  (0x3C, 0x3D, c(2, 2)),  // CMP
    (0x3F, 0x3F, c(4, 4)),                                                  // AAS
    (0x40, 0x4F, c(2, 2)),                                                  // INC/DEC r
    (0x50, 0x57, c(2, 2)),  (0x58, 0x5F, c(4, 4)),                          // PUSH/POP r
    (0x60, 0x60, c(18, 18).bu(-2)),         (0x61, 0x61, c(24, 24).bu(-2)), // PUSHA/POPA
    (0x62, 0x62, c(10, 10)),                                                // BOUND
    (0x63, 0x63, c(20, 21)),                                                // ARPL
    (0x68, 0x68, c(2, 2)),  (0x69, 0x69, c(20, 23).bu(6)),                  // PUSH imm, IMUL
    (0x6A, 0x6A, c(2, 2)),  (0x6B, 0x6B, c(20, 23).bu(6)),
    (0x6C, 0x6D, c(15, 15).rp(13, 6)),                                      // INS
    (0x6E, 0x6F, c(14, 14).rp(12, 5)),                                      // OUTS
    (0x70, 0x7F, c(7, 7).nj(3)),                                            // Jcc
    (0x84, 0x85, c(2, 5)),                                                  // TEST
    (0x86, 0x87, c(3, 5)),                                                  // XCHG
    (0x88, 0x89, c(2, 2)),  (0x8A, 0x8B, c(2, 4)),                          // MOV
    (0x8C, 0x8C, c(2, 2)),  (0x8D, 0x8D, c(2, 2)),                          // MOV r/m,sreg; LEA
    (0x8E, 0x8E, c(2, 5).pm(16)),           (0x8F, 0x8F, c(5, 5)),          // MOV sreg; POP r/m
    (0x90, 0x90, c(3, 3)),  (0x91, 0x97, c(3, 3)),                          // NOP, XCHG eAX
    (0x98, 0x98, c(3, 3)),  (0x99, 0x99, c(2, 2)),                          // CBW, CWD
    (0x9A, 0x9A, c(17, 17).pm(17)),                                         // CALL far
    (0x9B, 0x9B, c(6, 6)),                                                  // WAIT
    (0x9C, 0x9C, c(4, 4)),  (0x9D, 0x9D, c(5, 5)),                          // PUSHF/POPF
    (0x9E, 0x9E, c(3, 3)),  (0x9F, 0x9F, c(2, 2)),                          // SAHF/LAHF
    (0xA0, 0xA1, c(4, 4)),  (0xA2, 0xA3, c(2, 2)),                          // MOV moffs
    (0xA4, 0xA5, c(7, 7).rp(5, 4)),                                         // MOVS
    (0xA6, 0xA7, c(10, 10).rp(5, 9)),                                       // CMPS
    (0xA8, 0xA9, c(2, 2)),                                                  // TEST acc
    (0xAA, 0xAB, c(4, 4).rp(5, 5)),                                         // STOS
    (0xAC, 0xAD, c(5, 5).rp(5, 6)),                                         // LODS
    (0xAE, 0xAF, c(7, 7).rp(5, 8)),                                         // SCAS
    (0xB0, 0xBF, c(2, 2)),                                                  // MOV r,imm
    (0xC2, 0xC3, c(10, 10)),                                                // RET
    (0xC4, 0xC5, c(7, 7).pm(15)),                                           // LES/LDS
    (0xC6, 0xC7, c(2, 2)),                                                  // MOV r/m,imm
    (0xC8, 0xC8, c(10, 10)),                (0xC9, 0xC9, c(4, 4)),          // ENTER/LEAVE
    (0xCA, 0xCB, c(18, 18).pm(14)),                                         // RETF
    (0xCC, 0xCC, c(33, 33).pm(26)),         (0xCD, 0xCD, c(37, 37).pm(22)), // INT3, INT
    (0xCE, 0xCE, c(35, 35).pm(24).nj(3)),                                   // INTO
    (0xCF, 0xCF, c(22, 22).pm(16)),                                         // IRET
    (0xD4, 0xD4, c(17, 17).bu(6)),          (0xD5, 0xD5, c(19, 19).bu(6)),  // AAM/AAD
    (0xD6, 0xD6, c(3, 3)),                  (0xD7, 0xD7, c(5, 5)),          // SALC, XLAT
    (0xD8, 0xDF, c(6, 6)),                                                  // ESC
    (0xE0, 0xE2, c(11, 11).nj(4)),          (0xE3, 0xE3, c(9, 9).nj(5)),    // LOOPcc, JCXZ
    (0xE4, 0xE5, c(12, 12)),                (0xE6, 0xE7, c(10, 10)),        // IN/OUT imm
    (0xE8, 0xE8, c(7, 7)),                  (0xE9, 0xE9, c(7, 7)),          // CALL/JMP near
    (0xEA, 0xEA, c(12, 12).pm(15)),         (0xEB, 0xEB, c(7, 7)),          // JMP far, short
    (0xEC, 0xED, c(13, 13)),                (0xEE, 0xEF, c(11, 11)),        // IN/OUT DX
    (0xF1, 0xF1, c(33, 33).pm(26)),                                         // INT1
    (0xF4, 0xF4, c(5, 5)),                  (0xF5, 0xF5, c(2, 2)),          // HLT, CMC
    (0xF8, 0xF9, c(2, 2)),                                                  // CLC/STC
    (0xFA, 0xFB, c(3, 3)),                                                  // CLI/STI
    (0xFC, 0xFD, c(2, 2)),                                                  // CLD/STD
]);

#[rustfmt::skip]
const EXTENDED: [CycleEntry; 256] = expand(&[
    (0x02, 0x02, c(15, 16)),                                                // LAR
    (0x03, 0x03, c(20, 21)),                                                // LSL
    (0x06, 0x06, c(5, 5)),                                                  // CLTS
    (0x20, 0x20, c(6, 6)),  (0x21, 0x21, c(22, 22)),                        // MOV r32,CR/DR
    (0x22, 0x22, c(10, 10)),(0x23, 0x23, c(22, 22)),                        // MOV CR/DR,r32
    (0x80, 0x8F, c(7, 7).nj(3)),                                            // Jcc near
    (0x90, 0x9F, c(4, 5)),                                                  // SETcc
    (0xA0, 0xA0, c(2, 2)),  (0xA1, 0xA1, c(7, 7).pm(14)),                   // PUSH/POP FS
    (0xA3, 0xA3, c(3, 12)),                                                 // BT
    (0xA4, 0xA5, c(3, 7)),                                                  // SHLD
    (0xA8, 0xA8, c(2, 2)),  (0xA9, 0xA9, c(7, 7).pm(14)),                   // PUSH/POP GS
    (0xAB, 0xAB, c(6, 13)),                                                 // BTS
    (0xAC, 0xAD, c(3, 7)),                                                  // SHRD
    (0xAF, 0xAF, c(12, 15).bu(6)),                                          // IMUL r,r/m
    (0xB2, 0xB2, c(7, 7).pm(15)),                                           // LSS
    (0xB3, 0xB3, c(6, 13)),                                                 // BTR
    (0xB4, 0xB5, c(7, 7).pm(15)),                                           // LFS/LGS
    (0xB6, 0xB7, c(3, 6)),                                                  // MOVZX
    (0xBB, 0xBB, c(6, 13)),                                                 // BTC
    (0xBC, 0xBD, c(10, 10)),                                                // BSF/BSR
    (0xBE, 0xBF, c(3, 6)),                                                  // MOVSX
]);

const ALU_IMM: [CycleEntry; 8] = [
    c(2, 7), c(2, 7), c(2, 7), c(2, 7), c(2, 7), c(2, 7), c(2, 7), c(2, 5),
];
const SHIFT: [CycleEntry; 8] = [c(3, 7); 8];

#[rustfmt::skip]
const GROUPS: [[CycleEntry; 8]; GROUP_COUNT] = [
    ALU_IMM,                                                                        // 80/82
    ALU_IMM,                                                                        // 81
    ALU_IMM,                                                                        // 83
    SHIFT,                                                                          // C0
    SHIFT,                                                                          // C1
    SHIFT,                                                                          // D0
    SHIFT,                                                                          // D1
    SHIFT,                                                                          // D2
    SHIFT,                                                                          // D3
    // F6: TEST, TEST, NOT, NEG, MUL, IMUL, DIV, IDIV
    [c(2, 5), c(2, 5), c(2, 6), c(2, 6),
     c(12, 15).bu(6), c(12, 15).bu(6), c(14, 17).bu(6), c(19, 22).bu(6)],
    // F7
    [c(2, 5), c(2, 5), c(2, 6), c(2, 6),
     c(17, 20).bu(6), c(17, 20).bu(6), c(30, 33).bu(6), c(35, 38).bu(6)],
    // FE: INC, DEC
    [c(2, 6), c(2, 6), N, N, N, N, N, N],
    // FF: INC, DEC, CALL, CALLF, JMP, JMPF, PUSH
    [c(2, 6), c(2, 6), c(7, 10), c(22, 22).pm(16),
     c(7, 10), c(17, 17).pm(14), c(2, 5), N],
    // 0F 00: SLDT, STR, LLDT, LTR, VERR, VERW
    [c(2, 2), c(2, 2), c(20, 20), c(23, 27), c(10, 11), c(15, 16), N, N],
    // 0F 01: SGDT, SIDT, LGDT, LIDT, SMSW, -, LMSW
    [c(9, 9), c(9, 9), c(11, 11), c(11, 11), c(2, 2), N, c(10, 13), N],
    // 0F BA: -, -, -, -, BT, BTS, BTR, BTC
    [N, N, N, N, c(3, 6), c(6, 8), c(6, 8), c(6, 8)],
];

pub(super) static TABLE: CycleTable = CycleTable {
    primary: PRIMARY,
    extended: EXTENDED,
    groups: GROUPS,
};
