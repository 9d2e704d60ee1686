//! Packet types of the Intel PT wire format.

use core::fmt;

use derive_more::Display;

use crate::{
    error::{Error, Result},
    opcode, DecodeUnknown,
};

/// The IP compression of a TIP-family packet.
///
/// The upper three bits of a TIP, TIP.PGE, TIP.PGD or FUP header select how
/// the payload updates the last-IP register.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum IpCompression {
    /// No payload, the IP has been suppressed
    #[display("suppressed")]
    Suppressed,
    /// 16-bit payload, replaces the low 16 bits of the last IP
    #[display("update-16")]
    Update16,
    /// 32-bit payload, replaces the low 32 bits of the last IP
    #[display("update-32")]
    Update32,
    /// 48-bit payload, sign-extended to the full address
    #[display("sext-48")]
    Sext48,
}

impl IpCompression {
    /// The compression selected by the shifted header bits.
    pub(crate) fn from_bits(bits: u8) -> Result<Self> {
        match bits {
            0b000 => Ok(IpCompression::Suppressed),
            0b001 => Ok(IpCompression::Update16),
            0b010 => Ok(IpCompression::Update32),
            0b011 => Ok(IpCompression::Sext48),
            _ => Err(Error::BadPacket),
        }
    }

    pub(crate) fn bits(self) -> u8 {
        match self {
            IpCompression::Suppressed => 0b000,
            IpCompression::Update16 => 0b001,
            IpCompression::Update32 => 0b010,
            IpCompression::Sext48 => 0b011,
        }
    }

    /// The payload size in bytes dictated by this compression.
    #[must_use]
    pub const fn payload_size(self) -> usize {
        match self {
            IpCompression::Suppressed => 0,
            IpCompression::Update16 => opcode::PL_IP_UPD16_SIZE,
            IpCompression::Update32 => opcode::PL_IP_UPD32_SIZE,
            IpCompression::Sext48 => opcode::PL_IP_SEXT48_SIZE,
        }
    }
}

/// The payload of a TIP, TIP.PGE, TIP.PGD or FUP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpPayload {
    /// The IP compression
    pub ipc: IpCompression,
    /// The raw payload, right-zero-extended to 64 bit
    pub ip: u64,
}

impl IpPayload {
    /// A suppressed IP.
    #[must_use]
    pub const fn suppressed() -> Self {
        IpPayload {
            ipc: IpCompression::Suppressed,
            ip: 0,
        }
    }

    /// Compress `ip` against the last IP `last`.
    ///
    /// Chooses the narrowest compression that reproduces `ip` under the
    /// last-IP update algebra. Fails with [`Error::BadPacket`] if `ip` is not
    /// representable, i.e. not the sign extension of its low 48 bits.
    pub fn compress(last: u64, ip: u64) -> Result<Self> {
        if (last & 0xffff_ffff_ffff_0000) | (ip & 0xffff) == ip {
            return Ok(IpPayload {
                ipc: IpCompression::Update16,
                ip: ip & 0xffff,
            });
        }
        if (last & 0xffff_ffff_0000_0000) | (ip & 0xffff_ffff) == ip {
            return Ok(IpPayload {
                ipc: IpCompression::Update32,
                ip: ip & 0xffff_ffff,
            });
        }
        let payload = ip & 0xffff_ffff_ffff;
        if sign_extend_48(payload) != ip {
            return Err(Error::BadPacket);
        }
        Ok(IpPayload {
            ipc: IpCompression::Sext48,
            ip: payload,
        })
    }

    /// Apply this payload to the last IP `last`, yielding the updated IP.
    ///
    /// Returns [`None`] for a suppressed payload.
    #[must_use]
    pub fn apply(&self, last: u64) -> Option<u64> {
        match self.ipc {
            IpCompression::Suppressed => None,
            IpCompression::Update16 => Some((last & 0xffff_ffff_ffff_0000) | (self.ip & 0xffff)),
            IpCompression::Update32 => Some((last & 0xffff_ffff_0000_0000) | (self.ip & 0xffff_ffff)),
            IpCompression::Sext48 => Some(sign_extend_48(self.ip)),
        }
    }
}

/// Sign-extend a 48-bit value to 64 bit.
#[expect(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
pub(crate) fn sign_extend_48(value: u64) -> u64 {
    (((value << 16) as i64) >> 16) as u64
}

/// The payload of a TNT-8 or TNT-64 packet, stop bit stripped.
///
/// Bit `bit_size - 1` of `payload` is the oldest conditional branch, bit 0
/// the most recent one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TntPayload {
    /// The number of taken/not-taken bits
    pub bit_size: u8,
    /// The bits, oldest in the most significant position
    pub payload: u64,
}

/// An execution mode.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// The mode could not be determined
    #[display("unknown")]
    Unknown,
    /// 16-bit mode
    #[display("16-bit")]
    Mode16,
    /// 32-bit mode
    #[display("32-bit")]
    Mode32,
    /// 64-bit mode
    #[display("64-bit")]
    Mode64,
}

impl ExecMode {
    /// The iced-style bitness of this mode, 64 if unknown.
    #[must_use]
    pub const fn bitness(self) -> u32 {
        match self {
            ExecMode::Mode16 => 16,
            ExecMode::Mode32 => 32,
            ExecMode::Mode64 | ExecMode::Unknown => 64,
        }
    }
}

/// The payload of a MODE.Exec packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeExec {
    /// The CS.L bit
    pub csl: bool,
    /// The CS.D bit
    pub csd: bool,
}

impl ModeExec {
    /// The execution mode selected by the CS.L/CS.D bits.
    #[must_use]
    pub const fn exec_mode(&self) -> ExecMode {
        if self.csl {
            if self.csd {
                ExecMode::Unknown
            } else {
                ExecMode::Mode64
            }
        } else if self.csd {
            ExecMode::Mode32
        } else {
            ExecMode::Mode16
        }
    }

    /// The CS.L/CS.D bits describing `mode`.
    #[must_use]
    pub const fn from_exec_mode(mode: ExecMode) -> Self {
        match mode {
            ExecMode::Mode64 => ModeExec {
                csl: true,
                csd: false,
            },
            ExecMode::Mode32 => ModeExec {
                csl: false,
                csd: true,
            },
            ExecMode::Mode16 => ModeExec {
                csl: false,
                csd: false,
            },
            ExecMode::Unknown => ModeExec {
                csl: true,
                csd: true,
            },
        }
    }
}

/// The payload of a MODE.TSX packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeTsx {
    /// Execution is transactional
    pub intx: bool,
    /// The transaction aborted
    pub abrt: bool,
}

/// The payload of a MODE packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModePayload {
    /// MODE.Exec leaf
    Exec(ModeExec),
    /// MODE.TSX leaf
    Tsx(ModeTsx),
}

/// The payload of a PIP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipPayload {
    /// The CR3 value, low 5 bits zero
    pub cr3: u64,
    /// The reserved low wire bit
    pub nr: bool,
}

/// The payload of a TSC packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TscPayload {
    /// The 7-byte timestamp counter value
    pub tsc: u64,
}

/// The payload of a CBR packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CbrPayload {
    /// The core:bus ratio
    pub ratio: u8,
}

/// A packet only decodable by the configured unknown-packet handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownPayload<'a> {
    /// The raw packet bytes as delimited by the handler
    pub bytes: &'a [u8],
}

/// An Intel PT packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packet<'a> {
    /// PAD
    Pad,
    /// PSB synchronization marker
    Psb,
    /// PSBEND
    Psbend,
    /// OVF
    Ovf,
    /// TNT-8
    Tnt8(TntPayload),
    /// TNT-64
    Tnt64(TntPayload),
    /// TIP
    Tip(IpPayload),
    /// TIP.PGE
    TipPge(IpPayload),
    /// TIP.PGD
    TipPgd(IpPayload),
    /// FUP
    Fup(IpPayload),
    /// MODE
    Mode(ModePayload),
    /// PIP
    Pip(PipPayload),
    /// TSC
    Tsc(TscPayload),
    /// CBR
    Cbr(CbrPayload),
    /// A packet decoded by the unknown-packet handler
    Unknown(UnknownPayload<'a>),
}

impl Packet<'_> {
    /// The encoded size of this packet in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        match self {
            Packet::Pad => opcode::PTPS_PAD,
            Packet::Psb => opcode::PTPS_PSB,
            Packet::Psbend => opcode::PTPS_PSBEND,
            Packet::Ovf => opcode::PTPS_OVF,
            Packet::Tnt8(_) => opcode::PTPS_TNT_8,
            Packet::Tnt64(_) => opcode::PTPS_TNT_64,
            Packet::Tip(ip) | Packet::TipPge(ip) | Packet::TipPgd(ip) | Packet::Fup(ip) => {
                1 + ip.ipc.payload_size()
            }
            Packet::Mode(_) => opcode::PTPS_MODE,
            Packet::Pip(_) => opcode::PTPS_PIP,
            Packet::Tsc(_) => opcode::PTPS_TSC,
            Packet::Cbr(_) => opcode::PTPS_CBR,
            Packet::Unknown(unknown) => unknown.bytes.len(),
        }
    }
}

impl<'a> Packet<'a> {
    /// Decode the packet at `buf[pos..]`.
    ///
    /// Unknown opcodes are handed to `unknown`; the handler delimits the
    /// packet or fails. Returns the packet; its encoded size is reported by
    /// [`size`][Packet::size].
    pub fn read<U: DecodeUnknown>(
        buf: &'a [u8],
        pos: usize,
        unknown: &mut U,
    ) -> Result<Packet<'a>> {
        let Some(opc) = buf.get(pos).copied() else {
            return Err(Error::Eos);
        };

        if opc == opcode::OPC_PAD {
            return Ok(Packet::Pad);
        }
        if opc == opcode::OPC_EXT {
            return read_ext(buf, pos, unknown);
        }
        if opc & opcode::OPM_TNT_8 == 0 {
            // xxxxxxx0, but neither PAD nor the extension escape
            return read_tnt_8(opc);
        }
        match opc & opcode::OPM_TIP {
            // xxx01101
            opcode::OPC_TIP => return Ok(Packet::Tip(read_ip(buf, pos, opc)?)),
            // xxx10001
            opcode::OPC_TIP_PGE => return Ok(Packet::TipPge(read_ip(buf, pos, opc)?)),
            // xxx00001
            opcode::OPC_TIP_PGD => return Ok(Packet::TipPgd(read_ip(buf, pos, opc)?)),
            // xxx11101
            opcode::OPC_FUP => return Ok(Packet::Fup(read_ip(buf, pos, opc)?)),
            _ => {}
        }
        match opc {
            opcode::OPC_MODE => read_mode(buf, pos),
            opcode::OPC_TSC => read_tsc(buf, pos),
            _ => read_unknown(buf, pos, unknown),
        }
    }
}

fn read_ext<'a, U: DecodeUnknown>(
    buf: &'a [u8],
    pos: usize,
    unknown: &mut U,
) -> Result<Packet<'a>> {
    let Some(ext) = buf.get(pos + 1).copied() else {
        return Err(Error::Eos);
    };

    match ext {
        opcode::EXT_PSB => {
            let Some(magic) = buf.get(pos..).and_then(|buf| buf.first_chunk::<16>()) else {
                return Err(Error::Eos);
            };
            if *magic != opcode::PSB_MAGIC {
                return Err(Error::BadPacket);
            }
            Ok(Packet::Psb)
        }
        opcode::EXT_PSBEND => Ok(Packet::Psbend),
        opcode::EXT_OVF => Ok(Packet::Ovf),
        opcode::EXT_TNT_64 => read_tnt_64(buf, pos),
        opcode::EXT_PIP => read_pip(buf, pos),
        opcode::EXT_CBR => read_cbr(buf, pos),
        _ => read_unknown(buf, pos, unknown),
    }
}

#[expect(clippy::cast_possible_truncation)]
fn read_tnt_8(opc: u8) -> Result<Packet<'static>> {
    let field = u32::from(opc >> opcode::OPM_TNT_8_SHR);
    debug_assert!(field != 0, "PAD and ext escapes are handled before TNT-8");
    let stop = 31 - field.leading_zeros();
    let bit_size = stop;
    if bit_size == 0 || bit_size > opcode::PL_TNT_8_BITS - 1 {
        return Err(Error::BadPacket);
    }
    Ok(Packet::Tnt8(TntPayload {
        bit_size: bit_size as u8,
        payload: u64::from(field & !(1 << stop)),
    }))
}

#[expect(clippy::cast_possible_truncation)]
fn read_tnt_64<'a>(buf: &'a [u8], pos: usize) -> Result<Packet<'a>> {
    let Some([b0, b1, b2, b3, b4, b5]) = buf.get((pos + 2)..).and_then(|buf| buf.first_chunk::<6>())
    else {
        return Err(Error::Eos);
    };
    let field = u64::from_le_bytes([*b0, *b1, *b2, *b3, *b4, *b5, 0, 0]);
    if field == 0 {
        // There is no stop bit
        return Err(Error::BadPacket);
    }
    let stop = 63 - field.leading_zeros();
    let bit_size = stop;
    if bit_size == 0 || bit_size > opcode::PL_TNT_64_BITS - 1 {
        return Err(Error::BadPacket);
    }
    Ok(Packet::Tnt64(TntPayload {
        bit_size: bit_size as u8,
        payload: field & !(1u64 << stop),
    }))
}

fn read_ip(buf: &[u8], pos: usize, opc: u8) -> Result<IpPayload> {
    let ipc = IpCompression::from_bits((opc & opcode::OPM_IPC) >> opcode::OPM_IPC_SHR)?;
    let payload = buf.get((pos + 1)..).unwrap_or(&[]);
    let ip = match ipc {
        IpCompression::Suppressed => 0,
        IpCompression::Update16 => {
            let Some(bytes) = payload.first_chunk::<2>() else {
                return Err(Error::Eos);
            };
            u64::from(u16::from_le_bytes(*bytes))
        }
        IpCompression::Update32 => {
            let Some(bytes) = payload.first_chunk::<4>() else {
                return Err(Error::Eos);
            };
            u64::from(u32::from_le_bytes(*bytes))
        }
        IpCompression::Sext48 => {
            let Some([b0, b1, b2, b3, b4, b5]) = payload.first_chunk::<6>() else {
                return Err(Error::Eos);
            };
            u64::from_le_bytes([*b0, *b1, *b2, *b3, *b4, *b5, 0, 0])
        }
    };
    Ok(IpPayload { ipc, ip })
}

fn read_mode<'a>(buf: &'a [u8], pos: usize) -> Result<Packet<'a>> {
    let Some(bits) = buf.get(pos + 1).copied() else {
        return Err(Error::Eos);
    };
    match bits & opcode::MOM_LEAF {
        opcode::MOL_EXEC => Ok(Packet::Mode(ModePayload::Exec(ModeExec {
            csl: bits & opcode::MOB_EXEC_CSL != 0,
            csd: bits & opcode::MOB_EXEC_CSD != 0,
        }))),
        opcode::MOL_TSX => Ok(Packet::Mode(ModePayload::Tsx(ModeTsx {
            intx: bits & opcode::MOB_TSX_INTX != 0,
            abrt: bits & opcode::MOB_TSX_ABRT != 0,
        }))),
        _ => Err(Error::BadPacket),
    }
}

fn read_tsc<'a>(buf: &'a [u8], pos: usize) -> Result<Packet<'a>> {
    let Some([b0, b1, b2, b3, b4, b5, b6]) =
        buf.get((pos + 1)..).and_then(|buf| buf.first_chunk::<7>())
    else {
        return Err(Error::Eos);
    };
    Ok(Packet::Tsc(TscPayload {
        tsc: u64::from_le_bytes([*b0, *b1, *b2, *b3, *b4, *b5, *b6, 0]),
    }))
}

fn read_pip<'a>(buf: &'a [u8], pos: usize) -> Result<Packet<'a>> {
    let Some([b0, b1, b2, b3, b4, b5]) = buf.get((pos + 2)..).and_then(|buf| buf.first_chunk::<6>())
    else {
        return Err(Error::Eos);
    };
    let field = u64::from_le_bytes([*b0, *b1, *b2, *b3, *b4, *b5, 0, 0]);
    Ok(Packet::Pip(PipPayload {
        cr3: (field >> opcode::PL_PIP_SHR) << opcode::PL_PIP_SHL,
        nr: field & 1 != 0,
    }))
}

fn read_cbr<'a>(buf: &'a [u8], pos: usize) -> Result<Packet<'a>> {
    let Some([ratio, _reserved]) = buf.get((pos + 2)..).and_then(|buf| buf.first_chunk::<2>())
    else {
        return Err(Error::Eos);
    };
    Ok(Packet::Cbr(CbrPayload { ratio: *ratio }))
}

fn read_unknown<'a, U: DecodeUnknown>(
    buf: &'a [u8],
    pos: usize,
    unknown: &mut U,
) -> Result<Packet<'a>> {
    let tail = buf.get(pos..).unwrap_or(&[]);
    let Ok(size) = unknown.decode_unknown(tail) else {
        return Err(Error::BadOpc);
    };
    if size == 0 || size > tail.len() {
        return Err(Error::BadPacket);
    }
    Ok(Packet::Unknown(UnknownPayload {
        bytes: &tail[..size],
    }))
}

impl fmt::Display for Packet<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Packet::Pad => write!(f, "pad"),
            Packet::Psb => write!(f, "psb"),
            Packet::Psbend => write!(f, "psbend"),
            Packet::Ovf => write!(f, "ovf"),
            Packet::Tnt8(tnt) => write!(f, "tnt.8 {:0width$b}", tnt.payload, width = tnt.bit_size as usize),
            Packet::Tnt64(tnt) => write!(f, "tnt.64 {:0width$b}", tnt.payload, width = tnt.bit_size as usize),
            Packet::Tip(ip) => write!(f, "tip {} {:#x}", ip.ipc, ip.ip),
            Packet::TipPge(ip) => write!(f, "tip.pge {} {:#x}", ip.ipc, ip.ip),
            Packet::TipPgd(ip) => write!(f, "tip.pgd {} {:#x}", ip.ipc, ip.ip),
            Packet::Fup(ip) => write!(f, "fup {} {:#x}", ip.ipc, ip.ip),
            Packet::Mode(ModePayload::Exec(exec)) => {
                write!(f, "mode.exec {}", exec.exec_mode())
            }
            Packet::Mode(ModePayload::Tsx(tsx)) => {
                write!(f, "mode.tsx intx: {} abrt: {}", tsx.intx, tsx.abrt)
            }
            Packet::Pip(pip) => write!(f, "pip cr3: {:#x}", pip.cr3),
            Packet::Tsc(tsc) => write!(f, "tsc {:#x}", tsc.tsc),
            Packet::Cbr(cbr) => write!(f, "cbr {}", cbr.ratio),
            Packet::Unknown(unknown) => write!(f, "unknown, {} bytes", unknown.bytes.len()),
        }
    }
}
