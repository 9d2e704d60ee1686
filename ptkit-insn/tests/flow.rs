//! End-to-end instruction reconstruction over crafted traces.

use ptkit_insn::{Asid, Image, Insn, InsnClass, InsnDecoder, ReadMemory, SharedImage};
use ptkit_packet::{Config, Error, ExecMode};

const PSB: [u8; 16] = [
    0x02, 0x82, 0x02, 0x82, 0x02, 0x82, 0x02, 0x82, 0x02, 0x82, 0x02, 0x82, 0x02, 0x82, 0x02, 0x82,
];
const PSBEND: [u8; 2] = [0x02, 0x23];
/// MODE.Exec selecting 64-bit mode.
const MODE_64: [u8; 2] = [0x99, 0x01];
/// TIP.PGD with a suppressed IP.
const PGD: [u8; 1] = [0x01];

fn trace(parts: &[&[u8]]) -> Vec<u8> {
    let mut buf = Vec::new();
    for part in parts {
        buf.extend_from_slice(part);
    }
    buf
}

fn fup_sext48(ip: u64) -> Vec<u8> {
    let mut bytes = vec![0x7d];
    bytes.extend_from_slice(&ip.to_le_bytes()[..6]);
    bytes
}

fn tip_sext48(ip: u64) -> Vec<u8> {
    let mut bytes = vec![0x6d];
    bytes.extend_from_slice(&ip.to_le_bytes()[..6]);
    bytes
}

fn tip_pge_sext48(ip: u64) -> Vec<u8> {
    let mut bytes = vec![0x11 | 0x60];
    bytes.extend_from_slice(&ip.to_le_bytes()[..6]);
    bytes
}

/// A block of code bytes exposed through the image's memory callback.
struct CodeAt {
    base: u64,
    bytes: Vec<u8>,
}

impl ReadMemory for CodeAt {
    fn read_memory(&mut self, buffer: &mut [u8], _asid: &Asid, ip: u64) -> Result<usize, Error> {
        let Some(skip) = ip.checked_sub(self.base) else {
            return Err(Error::Nomap);
        };
        let skip = skip as usize;
        if skip >= self.bytes.len() {
            return Err(Error::Nomap);
        }
        let count = buffer.len().min(self.bytes.len() - skip);
        buffer[..count].copy_from_slice(&self.bytes[skip..skip + count]);
        Ok(count)
    }
}

fn image_with_code(base: u64, bytes: &[u8]) -> SharedImage {
    let mut image = Image::new(None);
    image.set_memory_callback(Some(Box::new(CodeAt {
        base,
        bytes: bytes.to_vec(),
    })));
    SharedImage::new(image)
}

fn decode_all(buf: &[u8], image: &SharedImage) -> Vec<Insn> {
    let mut decoder = InsnDecoder::new(Config::new(buf), image.clone());
    decoder.sync_forward().unwrap();
    let mut insns = Vec::new();
    loop {
        match decoder.next() {
            Ok((insn, _)) => insns.push(insn),
            Err(Error::Eos) => break,
            Err(error) => panic!("decode error after {} instructions: {error}", insns.len()),
        }
    }
    insns
}

#[test]
fn straight_line_with_a_conditional_branch() {
    // 0x1000: nop
    // 0x1001: jne 0x1005      (taken)
    // 0x1003: nop
    // 0x1004: nop
    // 0x1005: jmp rax         (to 0x2000, then tracing is disabled)
    let code = [0x90, 0x75, 0x02, 0x90, 0x90, 0xff, 0xe0];
    let image = image_with_code(0x1000, &code);

    // TNT carrying a single taken bit.
    let buf = trace(&[
        &PSB,
        &fup_sext48(0x1000),
        &MODE_64,
        &PSBEND,
        &[0x06],
        &tip_sext48(0x2000),
        &PGD,
    ]);

    let insns = decode_all(&buf, &image);
    assert_eq!(insns.len(), 3);

    assert_eq!(insns[0].ip, 0x1000);
    assert_eq!(insns[0].class, InsnClass::Other);
    assert_eq!(insns[0].mode, ExecMode::Mode64);
    assert_eq!(insns[0].size, 1);
    assert_eq!(insns[0].raw[0], 0x90);

    assert_eq!(insns[1].ip, 0x1001);
    assert_eq!(insns[1].class, InsnClass::CondJump);

    // The taken branch lands on the indirect jump; tracing stops there.
    assert_eq!(insns[2].ip, 0x1005);
    assert_eq!(insns[2].class, InsnClass::Jump);
    assert!(insns[2].disabled);
}

#[test]
fn compressed_returns_use_the_shadow_stack() {
    // 0x1000: call 0x100a
    // 0x1005: jmp rax         (to 0x3000, then tracing is disabled)
    // 0x100a: ret             (compressed: a taken bit)
    let code = [
        0xe8, 0x05, 0x00, 0x00, 0x00, 0xff, 0xe0, 0x90, 0x90, 0x90, 0xc3,
    ];
    let image = image_with_code(0x1000, &code);

    let buf = trace(&[
        &PSB,
        &fup_sext48(0x1000),
        &MODE_64,
        &PSBEND,
        &[0x06],
        &tip_sext48(0x3000),
        &PGD,
    ]);

    let insns = decode_all(&buf, &image);
    let ips: Vec<u64> = insns.iter().map(|insn| insn.ip).collect();
    assert_eq!(ips, [0x1000, 0x100a, 0x1005]);
    assert_eq!(insns[0].class, InsnClass::Call);
    assert_eq!(insns[1].class, InsnClass::Return);
    assert!(insns[2].disabled);
}

#[test]
fn enable_event_starts_the_flow() {
    // 0x1000: nop             (tracing enabled here, then ends)
    let code = [0x90];
    let image = image_with_code(0x1000, &code);

    let buf = trace(&[&PSB, &PSBEND, &MODE_64, &tip_pge_sext48(0x1000)]);

    let insns = decode_all(&buf, &image);
    assert_eq!(insns.len(), 1);
    assert_eq!(insns[0].ip, 0x1000);
    assert_eq!(insns[0].mode, ExecMode::Mode64);
    assert!(insns[0].enabled);
    assert!(!insns[0].resumed);
}

#[test]
fn interrupts_redirect_the_flow() {
    // 0x1000: nop
    // 0x1001: nop             (interrupted before 0x1002, handler at 0x5000)
    // 0x5000: jmp rax         (to 0x6000, then tracing is disabled)
    let mut code = vec![0x90, 0x90, 0x90, 0x90];
    code.resize(0x5000 - 0x1000, 0x90);
    code.extend_from_slice(&[0xff, 0xe0]);
    let image = image_with_code(0x1000, &code);

    // The interrupt shows as FUP (source 0x1002) + TIP (handler).
    let buf = trace(&[
        &PSB,
        &fup_sext48(0x1000),
        &MODE_64,
        &PSBEND,
        &fup_sext48(0x1002),
        &tip_sext48(0x5000),
        &tip_sext48(0x6000),
        &PGD,
    ]);

    let mut decoder = InsnDecoder::new(Config::new(&buf), image.clone());
    decoder.sync_forward().unwrap();

    let (first, _) = decoder.next().unwrap();
    assert_eq!(first.ip, 0x1000);
    assert!(!first.interrupted);

    // The async branch binds to the boundary behind this instruction.
    let (second, _) = decoder.next().unwrap();
    assert_eq!(second.ip, 0x1001);
    assert!(second.interrupted);

    let (third, _) = decoder.next().unwrap();
    assert_eq!(third.ip, 0x5000);
    assert_eq!(third.class, InsnClass::Jump);
    assert!(third.disabled);

    assert_eq!(decoder.next().map(|_| ()), Err(Error::Eos));
}

#[test]
fn decoding_is_deterministic() {
    let code = [
        0xe8, 0x05, 0x00, 0x00, 0x00, 0xff, 0xe0, 0x90, 0x90, 0x90, 0xc3,
    ];
    let image = image_with_code(0x1000, &code);
    let buf = trace(&[
        &PSB,
        &fup_sext48(0x1000),
        &MODE_64,
        &PSBEND,
        &[0x06],
        &tip_sext48(0x3000),
        &PGD,
    ]);

    let first = decode_all(&buf, &image);
    let second = decode_all(&buf, &image);
    assert_eq!(first, second);
}

#[test]
fn unmapped_code_reports_nomap() {
    let image = image_with_code(0x1000, &[0x90]);
    let buf = trace(&[&PSB, &fup_sext48(0x8000), &MODE_64, &PSBEND, &[0x06]]);

    let mut decoder = InsnDecoder::new(Config::new(&buf), image);
    decoder.sync_forward().unwrap();
    assert_eq!(decoder.next().map(|_| ()), Err(Error::Nomap));
}
