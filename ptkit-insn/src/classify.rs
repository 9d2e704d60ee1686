//! Coarse x86 instruction classification.
//!
//! Flow reconstruction only needs to know how an instruction leaves: not at
//! all, sequentially, through a static target, or through trace data. The
//! actual decoding is delegated to iced-x86.

use iced_x86::{Code, Decoder as IcedDecoder, DecoderOptions, FlowControl, Instruction};
use ptkit_packet::{Error, ExecMode};

/// A coarse instruction classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsnClass {
    /// The instruction could not be classified
    Error,
    /// Anything that does not change control flow
    Other,
    /// A near call
    Call,
    /// A near return
    Return,
    /// A near unconditional jump
    Jump,
    /// A near conditional jump
    CondJump,
    /// A call-like far transfer, e.g. SYSCALL or FAR CALL
    FarCall,
    /// A return-like far transfer, e.g. SYSRET or IRET
    FarReturn,
    /// A jump-like far transfer, e.g. FAR JMP
    FarJump,
}

/// One decoded instruction, reduced to what flow reconstruction needs.
#[derive(Debug, Clone, Copy)]
pub struct DecodedInsn {
    /// The instruction length in bytes
    pub len: u8,
    /// The coarse class
    pub class: InsnClass,
    /// The static branch target; [`None`] for indirect transfers
    pub target: Option<u64>,
}

fn is_near_ret(code: Code) -> bool {
    matches!(
        code,
        Code::Retnw | Code::Retnw_imm16 | Code::Retnd | Code::Retnd_imm16 | Code::Retnq | Code::Retnq_imm16
    )
}

/// Decode and classify the instruction at `ip`.
///
/// `bytes` holds up to 15 raw bytes read at `ip`; fewer are fine as long as
/// they cover the instruction.
#[expect(clippy::cast_possible_truncation)]
pub fn classify(bytes: &[u8], ip: u64, mode: ExecMode) -> Result<DecodedInsn, Error> {
    let mut decoder = IcedDecoder::with_ip(mode.bitness(), bytes, ip, DecoderOptions::NONE);
    if !decoder.can_decode() {
        return Err(Error::BadInsn);
    }
    let mut instruction = Instruction::default();
    decoder.decode_out(&mut instruction);
    if instruction.is_invalid() {
        return Err(Error::BadInsn);
    }

    let (class, target) = match instruction.flow_control() {
        FlowControl::Next | FlowControl::XbeginXabortXend | FlowControl::Exception => {
            (InsnClass::Other, None)
        }
        FlowControl::ConditionalBranch => {
            (InsnClass::CondJump, Some(instruction.near_branch_target()))
        }
        FlowControl::UnconditionalBranch => {
            if instruction.is_jmp_short_or_near() {
                (InsnClass::Jump, Some(instruction.near_branch_target()))
            } else {
                (InsnClass::FarJump, None)
            }
        }
        FlowControl::IndirectBranch => {
            if instruction.is_jmp_near_indirect() {
                (InsnClass::Jump, None)
            } else {
                (InsnClass::FarJump, None)
            }
        }
        FlowControl::Call => {
            if instruction.is_call_near() {
                (InsnClass::Call, Some(instruction.near_branch_target()))
            } else {
                (InsnClass::FarCall, None)
            }
        }
        FlowControl::IndirectCall => {
            if instruction.is_call_near_indirect() {
                (InsnClass::Call, None)
            } else {
                (InsnClass::FarCall, None)
            }
        }
        FlowControl::Return => {
            if is_near_ret(instruction.code()) {
                (InsnClass::Return, None)
            } else {
                (InsnClass::FarReturn, None)
            }
        }
        FlowControl::Interrupt => (InsnClass::FarCall, None),
    };

    Ok(DecodedInsn {
        len: instruction.len() as u8,
        class,
        target,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify64(bytes: &[u8], ip: u64) -> DecodedInsn {
        classify(bytes, ip, ExecMode::Mode64).unwrap()
    }

    #[test]
    fn sequential_instructions() {
        let nop = classify64(&[0x90], 0x1000);
        assert_eq!(nop.class, InsnClass::Other);
        assert_eq!(nop.len, 1);
        assert_eq!(nop.target, None);
    }

    #[test]
    fn conditional_jumps_have_static_targets() {
        // jne +2
        let jne = classify64(&[0x75, 0x02], 0x1000);
        assert_eq!(jne.class, InsnClass::CondJump);
        assert_eq!(jne.len, 2);
        assert_eq!(jne.target, Some(0x1004));
    }

    #[test]
    fn direct_transfers() {
        // jmp +5
        let jmp = classify64(&[0xeb, 0x05], 0x1000);
        assert_eq!(jmp.class, InsnClass::Jump);
        assert_eq!(jmp.target, Some(0x1007));

        // call +0x10
        let call = classify64(&[0xe8, 0x10, 0x00, 0x00, 0x00], 0x1000);
        assert_eq!(call.class, InsnClass::Call);
        assert_eq!(call.target, Some(0x1015));
    }

    #[test]
    fn indirect_transfers_have_no_target() {
        // jmp rax
        let jmp = classify64(&[0xff, 0xe0], 0x1000);
        assert_eq!(jmp.class, InsnClass::Jump);
        assert_eq!(jmp.target, None);

        // call rax
        let call = classify64(&[0xff, 0xd0], 0x1000);
        assert_eq!(call.class, InsnClass::Call);
        assert_eq!(call.target, None);
    }

    #[test]
    fn returns_and_far_transfers() {
        let ret = classify64(&[0xc3], 0x1000);
        assert_eq!(ret.class, InsnClass::Return);

        let syscall = classify64(&[0x0f, 0x05], 0x1000);
        assert_eq!(syscall.class, InsnClass::FarCall);

        let sysret = classify64(&[0x0f, 0x07], 0x1000);
        assert_eq!(sysret.class, InsnClass::FarReturn);

        let int3 = classify64(&[0xcc], 0x1000);
        assert_eq!(int3.class, InsnClass::FarCall);
    }

    #[test]
    fn truncated_bytes_fail() {
        assert_eq!(
            classify(&[], 0x1000, ExecMode::Mode64).map(|_| ()),
            Err(Error::BadInsn)
        );
        // A lone operand-size prefix is not an instruction.
        assert_eq!(
            classify(&[0x66], 0x1000, ExecMode::Mode64).map(|_| ()),
            Err(Error::BadInsn)
        );
    }
}
