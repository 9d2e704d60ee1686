//! The packet decoder.

use crate::{
    error::{Error, Result},
    opcode,
    packet::Packet,
    sync, Config, DecodeUnknown, RejectUnknown,
};

/// An Intel PT packet decoder.
///
/// Walks the configured trace buffer one packet at a time. The decoder needs
/// to be synchronized onto the stream before it can be used; on any error
/// the cursor does not move.
#[derive(Debug)]
pub struct PacketDecoder<'a, U = RejectUnknown> {
    config: Config<'a, U>,
    pos: Option<usize>,
    sync: Option<usize>,
}

impl<'a, U: DecodeUnknown> PacketDecoder<'a, U> {
    /// A packet decoder over the configured trace buffer.
    #[must_use]
    pub fn new(config: Config<'a, U>) -> Self {
        PacketDecoder {
            config,
            pos: None,
            sync: None,
        }
    }

    /// The decoder's configuration.
    #[must_use]
    pub fn config(&self) -> &Config<'a, U> {
        &self.config
    }

    /// Search for the next synchronization point in forward direction.
    ///
    /// Starts at the current position, or at the beginning of the trace
    /// buffer if the decoder has not been synchronized yet. Returns the
    /// offset of the synchronization point.
    pub fn sync_forward(&mut self) -> Result<usize> {
        let mut from = self.pos.unwrap_or(0);
        if self.pos.is_some() && self.pos == self.sync {
            // Do not rediscover the current sync point.
            from += opcode::PTPS_PSB;
        }

        let found = sync::find_forward(self.config.buffer(), from).ok_or(Error::Eos)?;
        log::trace!("[pkt] synchronized at {found:#x}");
        self.pos = Some(found);
        self.sync = Some(found);
        Ok(found)
    }

    /// Search for the next synchronization point in backward direction.
    ///
    /// Starts at the last synchronization point, or at the end of the trace
    /// buffer if the decoder has not been synchronized yet. Returns the
    /// offset of the synchronization point.
    pub fn sync_backward(&mut self) -> Result<usize> {
        let from = self.sync.unwrap_or(self.config.buffer().len());

        let found = sync::find_backward(self.config.buffer(), from).ok_or(Error::Eos)?;
        log::trace!("[pkt] synchronized at {found:#x}");
        self.pos = Some(found);
        self.sync = Some(found);
        Ok(found)
    }

    /// Hard-set the synchronization point to `offset`.
    pub fn sync_set(&mut self, offset: usize) -> Result<()> {
        if offset > self.config.buffer().len() {
            return Err(Error::Eos);
        }
        self.pos = Some(offset);
        self.sync = Some(offset);
        Ok(())
    }

    /// The current decoder position.
    pub fn offset(&self) -> Result<usize> {
        self.pos.ok_or(Error::Nosync)
    }

    /// The position of the last synchronization point.
    pub fn sync_offset(&self) -> Result<usize> {
        self.sync.ok_or(Error::Nosync)
    }

    /// Decode the packet at the current position and advance beyond it.
    pub fn next(&mut self) -> Result<Packet<'a>> {
        let pos = self.pos.ok_or(Error::Nosync)?;
        let buf = self.config.buffer();

        let packet = Packet::read(buf, pos, self.config.unknown_mut())?;
        self.pos = Some(pos + packet.size());

        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{IpCompression, IpPayload};

    #[test]
    fn empty_trace_reports_eos() {
        let mut decoder = PacketDecoder::new(Config::new(&[]));
        assert_eq!(decoder.sync_forward(), Err(Error::Eos));
        assert_eq!(decoder.sync_backward(), Err(Error::Eos));
    }

    #[test]
    fn unsynchronized_decoder_reports_nosync() {
        let buf = [0x00];
        let mut decoder = PacketDecoder::new(Config::new(&buf));
        assert_eq!(decoder.next(), Err(Error::Nosync));
        assert_eq!(decoder.offset(), Err(Error::Nosync));
        assert_eq!(decoder.sync_offset(), Err(Error::Nosync));
    }

    #[test]
    fn walks_a_psb_plus_sequence() {
        let mut buf = opcode::PSB_MAGIC.to_vec();
        buf.extend_from_slice(&[0x02, 0x23]);

        let mut decoder = PacketDecoder::new(Config::new(&buf));
        assert_eq!(decoder.sync_forward(), Ok(0));
        assert_eq!(decoder.next(), Ok(Packet::Psb));
        assert_eq!(decoder.next(), Ok(Packet::Psbend));
        assert_eq!(decoder.next(), Err(Error::Eos));
        // The cursor did not move past the failure.
        assert_eq!(decoder.offset(), Ok(buf.len()));
    }

    #[test]
    fn failed_decode_leaves_the_cursor() {
        // A TIP with a truncated payload.
        let buf = [0x6d, 0x00, 0x80];
        let mut decoder = PacketDecoder::new(Config::new(&buf));
        decoder.sync_set(0).unwrap();
        assert_eq!(decoder.next(), Err(Error::Eos));
        assert_eq!(decoder.offset(), Ok(0));
    }

    #[test]
    fn decodes_ip_packets_at_the_cursor() {
        let buf = [0x2d, 0x34, 0x12];
        let mut decoder = PacketDecoder::new(Config::new(&buf));
        decoder.sync_set(0).unwrap();
        assert_eq!(
            decoder.next(),
            Ok(Packet::Tip(IpPayload {
                ipc: IpCompression::Update16,
                ip: 0x1234,
            }))
        );
        assert_eq!(decoder.offset(), Ok(3));
    }

    #[test]
    fn hard_sync_does_not_verify_a_psb() {
        let buf = [0x00, 0x00];
        let mut decoder = PacketDecoder::new(Config::new(&buf));
        assert_eq!(decoder.sync_set(1), Ok(()));
        assert_eq!(decoder.offset(), Ok(1));
        assert_eq!(decoder.sync_set(3), Err(Error::Eos));
    }
}
