//! The packet encoder.

use crate::{
    error::{Error, Result},
    opcode,
    packet::Packet,
};

/// An Intel PT packet encoder.
///
/// Writes packets at a cursor into a caller-provided trace buffer. On any
/// error nothing is written and the cursor does not move.
#[derive(Debug)]
pub struct Encoder<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Encoder<'a> {
    /// An encoder writing into `buf`, starting at its beginning.
    #[must_use]
    pub fn new(buf: &'a mut [u8]) -> Self {
        Encoder { buf, pos: 0 }
    }

    /// Hard-set the encoder position.
    pub fn sync_set(&mut self, offset: usize) -> Result<()> {
        if offset > self.buf.len() {
            return Err(Error::Eos);
        }
        self.pos = offset;
        Ok(())
    }

    /// The current encoder position.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.pos
    }

    /// Encode `packet` at the current position and advance beyond it.
    ///
    /// Returns the number of bytes written.
    pub fn next(&mut self, packet: &Packet<'_>) -> Result<usize> {
        let size = packet.size();
        let Some(out) = self.buf.get_mut(self.pos..self.pos + size) else {
            return Err(Error::Eos);
        };

        match packet {
            Packet::Pad => out[0] = opcode::OPC_PAD,
            Packet::Psb => out.copy_from_slice(&opcode::PSB_MAGIC),
            Packet::Psbend => {
                out[0] = opcode::OPC_EXT;
                out[1] = opcode::EXT_PSBEND;
            }
            Packet::Ovf => {
                out[0] = opcode::OPC_EXT;
                out[1] = opcode::EXT_OVF;
            }
            Packet::Tnt8(tnt) => {
                if tnt.bit_size == 0 || u32::from(tnt.bit_size) > opcode::PL_TNT_8_BITS - 1 {
                    return Err(Error::BadPacket);
                }
                if tnt.payload >> tnt.bit_size != 0 {
                    return Err(Error::BadPacket);
                }
                let field = tnt.payload | 1 << tnt.bit_size;
                #[expect(clippy::cast_possible_truncation)]
                {
                    out[0] = (field as u8) << opcode::OPM_TNT_8_SHR;
                }
            }
            Packet::Tnt64(tnt) => {
                if tnt.bit_size == 0 || u32::from(tnt.bit_size) > opcode::PL_TNT_64_BITS - 1 {
                    return Err(Error::BadPacket);
                }
                if tnt.payload >> tnt.bit_size != 0 {
                    return Err(Error::BadPacket);
                }
                let field = tnt.payload | 1 << tnt.bit_size;
                out[0] = opcode::OPC_EXT;
                out[1] = opcode::EXT_TNT_64;
                out[2..8].copy_from_slice(&field.to_le_bytes()[..6]);
            }
            Packet::Tip(ip) | Packet::TipPge(ip) | Packet::TipPgd(ip) | Packet::Fup(ip) => {
                let width = 8 * ip.ipc.payload_size() as u32;
                if ip.ip.checked_shr(width).unwrap_or(0) != 0 {
                    // The payload does not fit the chosen compression.
                    return Err(Error::BadPacket);
                }
                let base = match packet {
                    Packet::Tip(_) => opcode::OPC_TIP,
                    Packet::TipPge(_) => opcode::OPC_TIP_PGE,
                    Packet::TipPgd(_) => opcode::OPC_TIP_PGD,
                    _ => opcode::OPC_FUP,
                };
                out[0] = base | ip.ipc.bits() << opcode::OPM_IPC_SHR;
                let payload = ip.ipc.payload_size();
                out[1..1 + payload].copy_from_slice(&ip.ip.to_le_bytes()[..payload]);
            }
            Packet::Mode(mode) => {
                out[0] = opcode::OPC_MODE;
                out[1] = match mode {
                    crate::ModePayload::Exec(exec) => {
                        let mut bits = opcode::MOL_EXEC;
                        if exec.csl {
                            bits |= opcode::MOB_EXEC_CSL;
                        }
                        if exec.csd {
                            bits |= opcode::MOB_EXEC_CSD;
                        }
                        bits
                    }
                    crate::ModePayload::Tsx(tsx) => {
                        let mut bits = opcode::MOL_TSX;
                        if tsx.intx {
                            bits |= opcode::MOB_TSX_INTX;
                        }
                        if tsx.abrt {
                            bits |= opcode::MOB_TSX_ABRT;
                        }
                        bits
                    }
                };
            }
            Packet::Pip(pip) => {
                if pip.cr3 & 0x1f != 0 || pip.cr3 >> 52 != 0 {
                    return Err(Error::BadPacket);
                }
                let mut field = (pip.cr3 >> opcode::PL_PIP_SHL) << opcode::PL_PIP_SHR;
                if pip.nr {
                    field |= 1;
                }
                out[0] = opcode::OPC_EXT;
                out[1] = opcode::EXT_PIP;
                out[2..8].copy_from_slice(&field.to_le_bytes()[..6]);
            }
            Packet::Tsc(tsc) => {
                if tsc.tsc >> 56 != 0 {
                    return Err(Error::BadPacket);
                }
                out[0] = opcode::OPC_TSC;
                out[1..8].copy_from_slice(&tsc.tsc.to_le_bytes()[..7]);
            }
            Packet::Cbr(cbr) => {
                out[0] = opcode::OPC_EXT;
                out[1] = opcode::EXT_CBR;
                out[2] = cbr.ratio;
                out[3] = 0;
            }
            Packet::Unknown(_) => return Err(Error::BadOpc),
        }

        self.pos += size;
        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{IpCompression, IpPayload, TntPayload, TscPayload};

    #[test]
    fn rejects_oversized_payloads() {
        let mut buf = [0u8; 16];
        let mut encoder = Encoder::new(&mut buf);

        let packet = Packet::Tnt8(TntPayload {
            bit_size: 3,
            payload: 0b1000,
        });
        assert_eq!(encoder.next(&packet), Err(Error::BadPacket));

        let packet = Packet::Tip(IpPayload {
            ipc: IpCompression::Update16,
            ip: 0x1_0000,
        });
        assert_eq!(encoder.next(&packet), Err(Error::BadPacket));

        let packet = Packet::Tsc(TscPayload {
            tsc: 0x0100_0000_0000_0000,
        });
        assert_eq!(encoder.next(&packet), Err(Error::BadPacket));

        assert_eq!(encoder.offset(), 0);
    }

    #[test]
    fn rejects_writes_past_the_buffer() {
        let mut buf = [0u8; 4];
        let mut encoder = Encoder::new(&mut buf);
        let packet = Packet::Tsc(TscPayload { tsc: 0 });
        assert_eq!(encoder.next(&packet), Err(Error::Eos));
        assert_eq!(encoder.offset(), 0);
    }
}
