use iced_x86::{Decoder as IcedDecoder, DecoderOptions};
use pcat_cpu_decoder::{CpuModel, Decoder, SliceSource};

/// Real/16-bit protected mode encodings whose lengths must agree with an independent decoder.
const CASES: &[&[u8]] = &[
    &[0x01, 0xD8],                                     // add ax, bx
    &[0x83, 0x46, 0xFE, 0x01],                         // add word [bp-2], 1
    &[0x81, 0x87, 0x34, 0x12, 0x78, 0x56],             // add word [bx+0x1234], 0x5678
    &[0xC7, 0x06, 0x00, 0x10, 0x34, 0x12],             // mov word [0x1000], 0x1234
    &[0x66, 0x67, 0x8B, 0x44, 0x8B, 0x10],             // mov eax, [ebx+ecx*4+0x10]
    &[0x9A, 0x00, 0x00, 0x00, 0xF0],                   // call 0xf000:0
    &[0x66, 0xEA, 0x01, 0x02, 0x03, 0x04, 0x08, 0x00], // jmp dword 0x8:0x04030201
    &[0xC8, 0x10, 0x00, 0x01],                         // enter 0x10, 1
    &[0xF3, 0xA5],                                     // rep movsw
    &[0x26, 0x8A, 0x07],                               // mov al, es:[bx]
    &[0x0F, 0x00, 0xD8],                               // ltr ax
    &[0x0F, 0x01, 0x16, 0x00, 0x20],                   // lgdt [0x2000]
    &[0x0F, 0x84, 0x00, 0x01],                         // je near +0x100
    &[0x0F, 0xBA, 0xE0, 0x05],                         // bt ax, 5
    &[0x0F, 0xA4, 0xC2, 0x04],                         // shld dx, ax, 4
    &[0xA1, 0x34, 0x12],                               // mov ax, [0x1234]
    &[0x67, 0xA1, 0x01, 0x02, 0x03, 0x04],             // mov ax, [0x04030201]
    &[0x6B, 0xC0, 0x05],                               // imul ax, ax, 5
    &[0xF6, 0x06, 0x00, 0x10, 0x80],                   // test byte [0x1000], 0x80
    &[0xF7, 0x16, 0x00, 0x10],                         // not word [0x1000]
    &[0xE8, 0x00, 0x00],                               // call near
    &[0xEB, 0xFE],                                     // jmp $
    &[0xCD, 0x21],                                     // int 0x21
    &[0x0F, 0x20, 0xC0],                               // mov eax, cr0
    &[0x0F, 0xB7, 0x06, 0x00, 0x10],                   // movzx ax, word [0x1000]
    &[0xC2, 0x04, 0x00],                               // ret 4
    &[0x8E, 0xD8],                                     // mov ds, ax
    &[0x67, 0x8B, 0x05, 0x01, 0x02, 0x03, 0x04],       // mov ax, [disp32]
    &[0x67, 0x8B, 0x04, 0x25, 0x01, 0x02, 0x03, 0x04], // mov ax, [disp32] via SIB
    &[0x67, 0x8B, 0x45, 0x08],                         // mov ax, [ebp+8]
    &[0xD0, 0xE0],                                     // shl al, 1
    &[0xC1, 0xE8, 0x03],                               // shr ax, 3
    &[0x62, 0x06, 0x00, 0x20],                         // bound ax, [0x2000]
    &[0x63, 0xC8],                                     // arpl ax, cx
    &[0x6A, 0xFF],                                     // push -1
    &[0x68, 0x00, 0x80],                               // push 0x8000
    &[0xD4, 0x0A],                                     // aam
    &[0xE4, 0x60],                                     // in al, 0x60
    &[0x0F, 0x02, 0xC1],                               // lar ax, cx
    &[0xFF, 0x1E, 0x00, 0x30],                         // call far [0x3000]
    &[0x0F, 0xB2, 0x26, 0x00, 0x40],                   // lss sp, [0x4000]
];

#[test]
fn lengths_match_iced_in_16bit_mode() {
    let decoder = Decoder::new(CpuModel::I80386);
    for bytes in CASES {
        let ours = decoder.decode(&mut SliceSource::new(bytes), false);
        let mut iced = IcedDecoder::new(16, bytes, DecoderOptions::NONE);
        let theirs = iced.decode();

        assert!(!theirs.is_invalid(), "reference rejected {bytes:02x?}");
        assert!(ours.valid, "decoder rejected {bytes:02x?}");
        assert_eq!(
            usize::from(ours.size),
            theirs.len(),
            "length mismatch for {bytes:02x?}"
        );
        assert_eq!(usize::from(ours.size), bytes.len(), "{bytes:02x?}");
    }
}

#[test]
fn lengths_match_iced_in_32bit_mode() {
    let cases: &[&[u8]] = &[
        &[0x8B, 0x44, 0x8B, 0x10],             // mov eax, [ebx+ecx*4+0x10]
        &[0xB8, 0x01, 0x02, 0x03, 0x04],       // mov eax, imm32
        &[0x66, 0xB8, 0x01, 0x02],             // mov ax, imm16
        &[0xE9, 0x00, 0x00, 0x00, 0x00],       // jmp rel32
        &[0x0F, 0x8F, 0x00, 0x00, 0x00, 0x00], // jg rel32
        &[0x81, 0x3D, 1, 2, 3, 4, 5, 6, 7, 8], // cmp dword [disp32], imm32
        &[0x67, 0x8B, 0x06, 0x00, 0x10],       // mov eax, [0x1000] with 16-bit addressing
        &[0xEA, 1, 2, 3, 4, 0x08, 0x00],       // jmp 0x8:imm32
        &[0x0F, 0xAF, 0x04, 0x24],             // imul eax, [esp]
    ];
    let decoder = Decoder::new(CpuModel::I80386);
    for bytes in cases {
        let ours = decoder.decode(&mut SliceSource::new(bytes), true);
        let mut iced = IcedDecoder::new(32, bytes, DecoderOptions::NONE);
        let theirs = iced.decode();
        assert!(!theirs.is_invalid(), "reference rejected {bytes:02x?}");
        assert!(ours.valid, "{bytes:02x?}");
        assert_eq!(usize::from(ours.size), theirs.len(), "{bytes:02x?}");
    }
}
