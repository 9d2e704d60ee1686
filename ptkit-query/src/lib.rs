//! The Intel PT query decoder.
//!
//! The query decoder consumes the packet stream and answers three questions:
//! was the next conditional branch taken ([`cond_branch`]), where did the
//! next indirect branch go ([`indirect_branch`]), and what happened
//! asynchronously ([`event`]). It maintains the compressed last-IP register,
//! a cache of taken/not-taken bits and one pending-event queue per event
//! binding.
//!
//! The decoder always looks one packet ahead: the [`Status`] flags returned
//! by every operation describe what the *next* packet implies, so callers
//! know to drain pending events before issuing further branch queries.
//!
//! Intel PT reports asynchronous facts out of line. A MODE packet announces
//! a mode change whose IP arrives with a later TIP; a PIP rides with an
//! in-flight asynchronous branch; an OVF is resolved by the FUP that
//! restores the IP. The decoder enqueues a skeleton event when it sees the
//! announcing packet and completes it when the binding packet arrives.
//!
//! [`cond_branch`]: QueryDecoder::cond_branch
//! [`indirect_branch`]: QueryDecoder::indirect_branch
//! [`event`]: QueryDecoder::event

mod event;
mod evq;
mod last_ip;
mod tnt_cache;

use ptkit_packet::{
    opcode, Config, DecodeUnknown, Error, IpCompression, IpPayload, ModePayload, Packet,
    RejectUnknown,
};

pub use crate::{
    event::{Event, EventKind},
    evq::{EventBinding, EventQueue, EventQueues},
    last_ip::LastIp,
    tnt_cache::TntCache,
};
pub use ptkit_packet::ExecMode;

/// Decoder status flags.
///
/// Returned by every successful query operation, describing what the next
/// packet implies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Status {
    /// There is an event pending
    pub event_pending: bool,
    /// The queried IP has been suppressed
    pub ip_suppressed: bool,
    /// There is no more trace data available
    pub eos: bool,
}

impl Status {
    /// The status as a bit-vector.
    #[must_use]
    pub const fn bits(self) -> u32 {
        (self.event_pending as u32) | (self.ip_suppressed as u32) << 1 | (self.eos as u32) << 2
    }
}

/// The kind of packet the decoder is about to dispatch.
///
/// This is the one-packet lookahead: it is enough to compute status flags
/// and route the packet without decoding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fetch {
    Pad,
    Psb,
    Psbend,
    Tip,
    TipPge,
    TipPgd,
    Fup,
    Tnt8,
    Tnt64,
    Mode,
    Pip,
    Tsc,
    Cbr,
    Ovf,
    Unknown,
}

impl Fetch {
    fn classify(buf: &[u8], pos: usize) -> Result<Fetch, Error> {
        let Some(opc) = buf.get(pos).copied() else {
            return Err(Error::Eos);
        };
        if opc == opcode::OPC_PAD {
            return Ok(Fetch::Pad);
        }
        if opc == opcode::OPC_EXT {
            let Some(ext) = buf.get(pos + 1).copied() else {
                return Err(Error::Eos);
            };
            return Ok(match ext {
                opcode::EXT_PSB => Fetch::Psb,
                opcode::EXT_PSBEND => Fetch::Psbend,
                opcode::EXT_OVF => Fetch::Ovf,
                opcode::EXT_TNT_64 => Fetch::Tnt64,
                opcode::EXT_PIP => Fetch::Pip,
                opcode::EXT_CBR => Fetch::Cbr,
                _ => Fetch::Unknown,
            });
        }
        if opc & opcode::OPM_TNT_8 == 0 {
            return Ok(Fetch::Tnt8);
        }
        match opc & opcode::OPM_TIP {
            opcode::OPC_TIP => return Ok(Fetch::Tip),
            opcode::OPC_TIP_PGE => return Ok(Fetch::TipPge),
            opcode::OPC_TIP_PGD => return Ok(Fetch::TipPgd),
            opcode::OPC_FUP => return Ok(Fetch::Fup),
            _ => {}
        }
        match opc {
            opcode::OPC_MODE => Ok(Fetch::Mode),
            opcode::OPC_TSC => Ok(Fetch::Tsc),
            _ => Ok(Fetch::Unknown),
        }
    }

    /// A plain TIP, answering an indirect-branch query.
    fn is_tip(self) -> bool {
        self == Fetch::Tip
    }

    fn is_tnt(self) -> bool {
        matches!(self, Fetch::Tnt8 | Fetch::Tnt64)
    }

    fn is_fup(self) -> bool {
        self == Fetch::Fup
    }

    fn is_psbend(self) -> bool {
        matches!(self, Fetch::Psbend | Fetch::Ovf)
    }

    /// A packet that produces an event on its own.
    fn is_event(self) -> bool {
        matches!(
            self,
            Fetch::TipPge | Fetch::TipPgd | Fetch::Pip | Fetch::Mode | Fetch::Ovf
        )
    }

    fn is_timing(self) -> bool {
        matches!(self, Fetch::Tsc | Fetch::Cbr)
    }
}

/// A streaming query decoder over an Intel PT trace buffer.
///
/// The decoder needs to be synchronized onto a PSB before it can be used.
/// On any error its cursor and internal state are unchanged.
#[derive(Debug)]
pub struct QueryDecoder<'a, U = RejectUnknown> {
    config: Config<'a, U>,
    pos: Option<usize>,
    sync: Option<usize>,
    /// The prefetched dispatch for the packet under the cursor
    next: Option<Fetch>,
    ip: LastIp,
    tnt: TntCache,
    evq: EventQueues,
    /// The event published by the most recent decode step
    event: Option<Event>,
    enabled: bool,
    /// The packet under the cursor resolved an event and stays there until
    /// all its events have been delivered
    consume_packet: bool,
    /// BDM64: the next plain TIP carries a bogus IP and must be dropped
    skip_tip: bool,
    tsc: Option<u64>,
    cbr: Option<u8>,
}

impl<'a, U: DecodeUnknown> QueryDecoder<'a, U> {
    /// A query decoder over the configured trace buffer.
    #[must_use]
    pub fn new(config: Config<'a, U>) -> Self {
        QueryDecoder {
            config,
            pos: None,
            sync: None,
            next: None,
            ip: LastIp::new(),
            tnt: TntCache::new(),
            evq: EventQueues::default(),
            event: None,
            enabled: false,
            consume_packet: false,
            skip_tip: false,
            tsc: None,
            cbr: None,
        }
    }

    /// The decoder's configuration.
    #[must_use]
    pub fn config(&self) -> &Config<'a, U> {
        &self.config
    }

    /// The current decoder position.
    pub fn offset(&self) -> Result<usize, Error> {
        self.pos.ok_or(Error::Nosync)
    }

    /// The position of the last synchronization point.
    pub fn sync_offset(&self) -> Result<usize, Error> {
        self.sync.ok_or(Error::Nosync)
    }

    /// The current timestamp count.
    ///
    /// Since the decoder reads ahead, the value matches the time at the next
    /// branch or event.
    pub fn time(&self) -> Result<u64, Error> {
        self.tsc.ok_or(Error::NoTime)
    }

    /// The current core:bus ratio.
    pub fn core_bus_ratio(&self) -> Result<u8, Error> {
        self.cbr.ok_or(Error::NoCbr)
    }

    /// The status flags at the current position.
    #[must_use]
    pub fn status(&self) -> Status {
        self.status_flags()
    }

    /// Search for the next synchronization point in forward direction and
    /// start decoding there.
    ///
    /// Returns the status flags and the IP at the synchronization point, if
    /// the PSB+ carried one.
    pub fn sync_forward(&mut self) -> Result<(Status, Option<u64>), Error> {
        let mut from = self.pos.unwrap_or(0);
        if self.pos.is_some() && self.pos == self.sync {
            from += opcode::PTPS_PSB;
        }

        let found = ptkit_packet::sync::find_forward(self.config.buffer(), from)
            .ok_or(Error::Eos)?;
        self.start(found)
    }

    /// Search for the next synchronization point in backward direction and
    /// start decoding there.
    pub fn sync_backward(&mut self) -> Result<(Status, Option<u64>), Error> {
        let from = self.sync.unwrap_or(self.config.buffer().len());
        let found = ptkit_packet::sync::find_backward(self.config.buffer(), from)
            .ok_or(Error::Eos)?;
        self.start(found)
    }

    /// Synchronize onto the PSB at `offset`.
    ///
    /// Fails with [`Error::Nosync`] if there is no PSB at `offset`.
    pub fn sync_set(&mut self, offset: usize) -> Result<(Status, Option<u64>), Error> {
        if offset > self.config.buffer().len() {
            return Err(Error::Invalid);
        }
        self.start(offset)
    }

    /// Query whether the next conditional branch was taken.
    pub fn cond_branch(&mut self) -> Result<(bool, Status), Error> {
        self.cond_branch_inner().map_err(query_error)
    }

    /// Query the destination of the next indirect branch.
    ///
    /// The destination is [`None`] and the `ip_suppressed` status flag is
    /// set if the trace suppressed the address.
    pub fn indirect_branch(&mut self) -> Result<(Option<u64>, Status), Error> {
        self.indirect_branch_inner().map_err(query_error)
    }

    /// Query the next pending event.
    pub fn event(&mut self) -> Result<(Event, Status), Error> {
        self.event_inner().map_err(query_error)
    }

    fn cond_branch_inner(&mut self) -> Result<(bool, Status), Error> {
        if self.tnt.is_empty() {
            self.cache_tnt()?;
        }
        let taken = self.tnt.pop_front()?;
        Ok((taken, self.status_flags()))
    }

    fn cache_tnt(&mut self) -> Result<(), Error> {
        loop {
            let Some(fetch) = self.next else {
                return Err(self.provoke_fetch_error());
            };
            // There's an event ahead of us; it has to be drained first.
            if self.will_event() {
                return Err(Error::BadQuery);
            }
            // A TIP that is not part of an event cannot answer this query.
            if fetch.is_tip() {
                return Err(Error::BadQuery);
            }

            self.event = None;
            self.decode(fetch)?;
            // If decoding produced an event, the caller skipped it.
            if self.event.is_some() {
                return Err(Error::Nosync);
            }

            if fetch.is_tnt() {
                break;
            }
            self.read_ahead()?;
        }

        // Read ahead until the next query-relevant packet.
        let _ = self.read_ahead();
        Ok(())
    }

    fn indirect_branch_inner(&mut self) -> Result<(Option<u64>, Status), Error> {
        let mut addr = None;
        let mut suppressed = false;
        loop {
            let Some(fetch) = self.next else {
                return Err(self.provoke_fetch_error());
            };
            if self.will_event() {
                return Err(Error::BadQuery);
            }
            // A fresh TNT while bits are cached means the caller is out of
            // sync with the trace.
            if fetch.is_tnt() && !self.tnt.is_empty() {
                return Err(Error::BadQuery);
            }

            self.event = None;
            self.decode(fetch)?;
            if self.event.is_some() {
                return Err(Error::Nosync);
            }

            if fetch.is_tip() {
                // The branch destination is in the last-IP register.
                match self.ip.query() {
                    Ok(ip) => addr = Some(ip),
                    Err(_) => suppressed = true,
                }
                break;
            }
            self.read_ahead()?;
        }

        let _ = self.read_ahead();
        let mut status = self.status_flags();
        status.ip_suppressed |= suppressed;
        Ok((addr, status))
    }

    fn event_inner(&mut self) -> Result<(Event, Status), Error> {
        // Cached TNT bits have to be consumed first.
        if !self.tnt.is_empty() {
            return Err(Error::BadQuery);
        }

        let event = loop {
            let Some(fetch) = self.next else {
                return Err(self.provoke_fetch_error());
            };
            // A TIP or TNT that does not belong to an event means the
            // caller is out of sync with the trace.
            if (fetch.is_tip() || fetch.is_tnt()) && !self.will_event() {
                return Err(Error::BadQuery);
            }

            self.event = None;
            self.decode(fetch)?;
            if let Some(event) = self.event.take() {
                break event;
            }
            self.read_ahead()?;
        };

        let _ = self.read_ahead();
        Ok((event, self.status_flags()))
    }

    /// Start decoding at the PSB at `at`.
    fn start(&mut self, at: usize) -> Result<(Status, Option<u64>), Error> {
        // We do need to start at a PSB in order to initialize the state.
        let fetch = Fetch::classify(self.config.buffer(), at)?;
        if fetch != Fetch::Psb {
            return Err(Error::Nosync);
        }

        self.reset();
        self.pos = Some(at);
        self.sync = Some(at);
        self.next = Some(fetch);

        // Decode the PSB+ header to initialize the state.
        self.decode_psb()?;
        log::trace!("[qry] synchronized at {at:#x}");

        // The start address, before reading ahead: an adjacent PSB+ would
        // already change the IP again.
        let header_ip = self.ip.query();

        // Errors here will be diagnosed by the first query.
        let _ = self.read_ahead();

        let mut status = self.status_flags();
        match header_ip {
            Ok(ip) => Ok((status, Some(ip))),
            Err(_) => {
                status.ip_suppressed = true;
                Ok((status, None))
            }
        }
    }

    fn reset(&mut self) {
        self.next = None;
        self.ip.clear();
        self.tnt.clear();
        self.evq.discard_all();
        self.event = None;
        self.enabled = false;
        self.consume_packet = false;
        self.skip_tip = false;
        self.tsc = None;
        self.cbr = None;
    }

    /// Whether dispatching the next packet will emit an event.
    fn will_event(&self) -> bool {
        let Some(fetch) = self.next else {
            return false;
        };
        if fetch.is_event() {
            return true;
        }
        if fetch.is_psbend() && self.evq.get(EventBinding::Psbend).any_pending() {
            return true;
        }
        if fetch.is_tip() && self.evq.get(EventBinding::Tip).any_pending() {
            return true;
        }
        if fetch.is_fup() && self.evq.get(EventBinding::Fup).any_pending() {
            return true;
        }
        false
    }

    /// Whether the next dispatch runs off the end of the trace.
    fn will_eos(&self) -> bool {
        if self.next.is_some() {
            return false;
        }
        let Some(pos) = self.pos else {
            return false;
        };
        matches!(
            Fetch::classify(self.config.buffer(), pos),
            Err(Error::Eos)
        )
    }

    fn status_flags(&self) -> Status {
        let mut status = Status::default();
        // Cached TNT bits are consumed before any event is indicated, so
        // the caller navigates to the right code region first.
        if self.tnt.is_empty() {
            status.event_pending = self.will_event();
            status.eos = self.will_eos();
        }
        status
    }

    /// Repeat the failed prefetch to reproduce its error.
    fn provoke_fetch_error(&mut self) -> Error {
        let Some(pos) = self.pos else {
            return Error::Nosync;
        };
        match Fetch::classify(self.config.buffer(), pos) {
            Ok(_) => Error::Internal,
            Err(error) => error,
        }
    }

    /// Advance through status packets until the next query-relevant one.
    fn read_ahead(&mut self) -> Result<(), Error> {
        loop {
            self.next = None;
            let pos = self.pos.ok_or(Error::Nosync)?;
            let fetch = Fetch::classify(self.config.buffer(), pos)?;
            self.next = Some(fetch);

            // We're done once we reach a branching packet
            if fetch.is_tip() || fetch.is_tnt() {
                return Ok(());
            }
            // or an event.
            if self.will_event() {
                return Ok(());
            }

            self.decode(fetch)?;
        }
    }

    /// Advance while the next packet is timing or padding.
    fn read_ahead_while_timing(&mut self) -> Result<(), Error> {
        loop {
            self.next = None;
            let pos = self.pos.ok_or(Error::Internal)?;
            let fetch = Fetch::classify(self.config.buffer(), pos)?;
            self.next = Some(fetch);
            if !fetch.is_timing() && fetch != Fetch::Pad {
                return Ok(());
            }
            self.decode(fetch)?;
        }
    }

    fn decode(&mut self, fetch: Fetch) -> Result<(), Error> {
        match fetch {
            Fetch::Pad => self.decode_pad(),
            Fetch::Psb => self.decode_psb(),
            Fetch::Psbend => self.decode_psbend(),
            Fetch::Tip => self.decode_tip(),
            Fetch::TipPge => self.decode_tip_pge(),
            Fetch::TipPgd => self.decode_tip_pgd(),
            Fetch::Fup => self.decode_fup(),
            Fetch::Tnt8 | Fetch::Tnt64 => self.decode_tnt(),
            Fetch::Mode => self.decode_mode(),
            Fetch::Pip => self.decode_pip(),
            Fetch::Tsc => self.decode_tsc(),
            Fetch::Cbr => self.decode_cbr(),
            Fetch::Ovf => self.decode_ovf(),
            Fetch::Unknown => self.decode_unknown(),
        }
    }

    fn read_packet(&mut self, pos: usize) -> Result<Packet<'a>, Error> {
        let buf = self.config.buffer();
        Packet::read(buf, pos, self.config.unknown_mut())
    }

    fn read_ip(&mut self, pos: usize) -> Result<(IpPayload, usize), Error> {
        let packet = self.read_packet(pos)?;
        let (Packet::Tip(ip) | Packet::TipPge(ip) | Packet::TipPgd(ip) | Packet::Fup(ip)) = packet
        else {
            return Err(Error::Internal);
        };
        Ok((ip, packet.size()))
    }

    /// The last IP for completing an event, with its suppression flag.
    fn query_event_ip(&self) -> (u64, bool) {
        match self.ip.query() {
            Ok(ip) => (ip, false),
            Err(_) => (0, true),
        }
    }

    fn decode_pad(&mut self) -> Result<(), Error> {
        let pos = self.pos.ok_or(Error::Internal)?;
        self.pos = Some(pos + opcode::PTPS_PAD);
        Ok(())
    }

    fn decode_unknown(&mut self) -> Result<(), Error> {
        let pos = self.pos.ok_or(Error::Internal)?;
        let packet = self.read_packet(pos)?;
        self.pos = Some(pos + packet.size());
        Ok(())
    }

    fn decode_tsc(&mut self) -> Result<(), Error> {
        let pos = self.pos.ok_or(Error::Internal)?;
        let packet = self.read_packet(pos)?;
        let Packet::Tsc(tsc) = packet else {
            return Err(Error::Internal);
        };
        self.tsc = Some(tsc.tsc);
        self.pos = Some(pos + packet.size());
        Ok(())
    }

    fn decode_cbr(&mut self) -> Result<(), Error> {
        let pos = self.pos.ok_or(Error::Internal)?;
        let packet = self.read_packet(pos)?;
        let Packet::Cbr(cbr) = packet else {
            return Err(Error::Internal);
        };
        self.cbr = Some(cbr.ratio);
        self.pos = Some(pos + packet.size());
        Ok(())
    }

    fn decode_tnt(&mut self) -> Result<(), Error> {
        let pos = self.pos.ok_or(Error::Internal)?;
        let packet = self.read_packet(pos)?;
        let (Packet::Tnt8(tnt) | Packet::Tnt64(tnt)) = packet else {
            return Err(Error::Internal);
        };
        self.tnt.append(tnt.payload, tnt.bit_size.into())?;
        self.pos = Some(pos + packet.size());
        Ok(())
    }

    fn decode_tip(&mut self) -> Result<(), Error> {
        let pos = self.pos.ok_or(Error::Internal)?;
        let (payload, size) = self.read_ip(pos)?;

        if self.skip_tip {
            log::trace!("[qry] bdm64: dropping a bogus tip");
            self.skip_tip = false;
            self.pos = Some(pos + size);
            return Ok(());
        }

        self.ip.update(&payload);

        // Process any pending events binding to TIP, one per dispatch.
        if let Some(mut event) = self.evq.get_mut(EventBinding::Tip).dequeue() {
            let (ip, suppressed) = self.query_event_ip();
            match &mut event.kind {
                EventKind::AsyncBranch { to, .. } => {
                    *to = ip;
                    self.consume_packet = true;
                }
                EventKind::AsyncPaging { ip: slot, .. } | EventKind::ExecMode { ip: slot, .. } => {
                    *slot = ip;
                }
                _ => return Err(Error::Internal),
            }
            event.ip_suppressed |= suppressed;
            self.event = Some(event);

            // Stay on this packet while further events are pending.
            if self.evq.get(EventBinding::Tip).any_pending() {
                return Ok(());
            }
            if !self.consume_packet {
                return Ok(());
            }
            self.consume_packet = false;
        }

        self.pos = Some(pos + size);
        Ok(())
    }

    fn decode_tip_pge(&mut self) -> Result<(), Error> {
        let pos = self.pos.ok_or(Error::Internal)?;
        let (payload, size) = self.read_ip(pos)?;

        self.ip.update(&payload);

        // The enable event goes out first; pending events follow on
        // subsequent dispatches of this same packet.
        let event = if self.consume_packet {
            let Some(mut event) = self.evq.get_mut(EventBinding::Tip).dequeue() else {
                return Err(Error::Internal);
            };
            let (ip, suppressed) = self.query_event_ip();
            match &mut event.kind {
                EventKind::ExecMode { ip: slot, .. } => *slot = ip,
                _ => return Err(Error::Internal),
            }
            event.ip_suppressed |= suppressed;
            event
        } else {
            // Enabling without an IP would leave us nowhere to resume.
            let Ok(ip) = self.ip.query() else {
                return Err(Error::BadPacket);
            };
            let mut event = Event::new(EventKind::Enabled { ip });
            event.tsc = self.tsc;

            // Any cached TNT bits should have been consumed at the
            // corresponding disable; discard them so the caller does not
            // get out of sync.
            self.tnt.clear();
            self.consume_packet = true;
            self.enabled = true;
            event
        };

        self.event = Some(event);

        if self.evq.get(EventBinding::Tip).any_pending() {
            return Ok(());
        }
        if !self.consume_packet {
            return Err(Error::Internal);
        }
        self.consume_packet = false;

        self.pos = Some(pos + size);
        Ok(())
    }

    fn decode_tip_pgd(&mut self) -> Result<(), Error> {
        let pos = self.pos.ok_or(Error::Internal)?;
        let (payload, size) = self.read_ip(pos)?;

        self.ip.update(&payload);

        let event = if let Some(mut event) = self.evq.get_mut(EventBinding::Tip).dequeue() {
            // The only event that can be in flight is an async branch; it
            // turns into an async disable.
            let EventKind::AsyncBranch { from, .. } = event.kind else {
                return Err(Error::Internal);
            };
            if self.evq.get(EventBinding::Tip).any_pending() {
                return Err(Error::Internal);
            }
            let (ip, suppressed) = self.query_event_ip();
            event.kind = EventKind::AsyncDisabled { at: from, ip };
            event.ip_suppressed |= suppressed;
            event
        } else {
            let (ip, suppressed) = self.query_event_ip();
            let mut event = Event::new(EventKind::Disabled { ip });
            event.ip_suppressed = suppressed;
            event.tsc = self.tsc;
            event
        };

        self.event = Some(event);
        self.enabled = false;
        self.pos = Some(pos + size);
        Ok(())
    }

    fn decode_fup(&mut self) -> Result<(), Error> {
        let pos = self.pos.ok_or(Error::Internal)?;
        let (payload, size) = self.read_ip(pos)?;

        self.ip.update(&payload);

        if let Some(mut event) = self.evq.get_mut(EventBinding::Fup).dequeue() {
            match &mut event.kind {
                EventKind::Overflow { ip: slot } => {
                    // The resume address cannot be suppressed.
                    let Ok(ip) = self.ip.query() else {
                        return Err(Error::BadPacket);
                    };
                    *slot = ip;
                    self.consume_packet = true;
                }
                EventKind::Tsx {
                    ip: slot, aborted, ..
                } => {
                    let (ip, suppressed) = self.query_event_ip();
                    *slot = ip;
                    event.ip_suppressed |= suppressed;
                    if !*aborted {
                        self.consume_packet = true;
                    } else if self.config.errata.bdm64 && self.scan_bdm64(pos + size)? {
                        self.skip_tip = true;
                    }
                }
                _ => return Err(Error::Internal),
            }

            self.event = Some(event);

            if self.evq.get(EventBinding::Fup).any_pending() {
                return Ok(());
            }
            // An aborting TSX event leaves the FUP in place: it doubles as
            // the source of the async branch to the abort handler.
            if !self.consume_packet {
                return Ok(());
            }
            self.consume_packet = false;
        } else {
            // A standalone FUP announces an async branch; the destination
            // arrives with the next TIP.
            let Ok(from) = self.ip.query() else {
                return Err(Error::BadPacket);
            };
            let mut event = Event::new(EventKind::AsyncBranch { from, to: 0 });
            event.tsc = self.tsc;
            self.evq.get_mut(EventBinding::Tip).enqueue(event)?;
        }

        self.pos = Some(pos + size);
        Ok(())
    }

    /// BDM64: an aborting transaction may log an extra branch packet with a
    /// corrupt target before the real one. Two back-to-back TIPs behind the
    /// abort FUP identify the condition.
    fn scan_bdm64(&mut self, mut pos: usize) -> Result<bool, Error> {
        let buf = self.config.buffer();
        let mut tips = 0;
        loop {
            let packet = match Packet::read(buf, pos, self.config.unknown_mut()) {
                Ok(packet) => packet,
                // Running out of packets is not an error.
                Err(Error::Eos) => return Ok(false),
                Err(error) => return Err(error),
            };
            match packet {
                Packet::Tip(_) => {
                    tips += 1;
                    if tips == 2 {
                        return Ok(true);
                    }
                }
                Packet::Pad | Packet::Tsc(_) | Packet::Cbr(_) => {}
                _ => return Ok(false),
            }
            pos += packet.size();
        }
    }

    fn decode_mode(&mut self) -> Result<(), Error> {
        let pos = self.pos.ok_or(Error::Internal)?;
        let packet = self.read_packet(pos)?;
        let Packet::Mode(mode) = packet else {
            return Err(Error::Internal);
        };

        match mode {
            ModePayload::Exec(exec) => {
                // MODE.Exec binds to TIP.
                let mut event = Event::new(EventKind::ExecMode {
                    mode: exec.exec_mode(),
                    ip: 0,
                });
                event.tsc = self.tsc;
                self.evq.get_mut(EventBinding::Tip).enqueue(event)?;
            }
            ModePayload::Tsx(tsx) => {
                let mut event = Event::new(EventKind::Tsx {
                    ip: 0,
                    speculative: tsx.intx,
                    aborted: tsx.abrt,
                });
                event.tsc = self.tsc;
                if self.enabled {
                    // MODE.TSX binds to FUP.
                    self.evq.get_mut(EventBinding::Fup).enqueue(event)?;
                } else {
                    // Standalone while tracing is disabled; there is no IP.
                    event.ip_suppressed = true;
                    self.event = Some(event);
                }
            }
        }

        self.pos = Some(pos + packet.size());
        Ok(())
    }

    fn decode_pip(&mut self) -> Result<(), Error> {
        let pos = self.pos.ok_or(Error::Internal)?;
        let packet = self.read_packet(pos)?;
        let Packet::Pip(pip) = packet else {
            return Err(Error::Internal);
        };

        // Paging events are either standalone or bind to the same TIP as an
        // in-flight async branch.
        let in_flight = self
            .evq
            .get(EventBinding::Tip)
            .find_by_kind(|kind| matches!(kind, EventKind::AsyncBranch { .. }))
            .is_some();
        if in_flight {
            let mut event = Event::new(EventKind::AsyncPaging { cr3: pip.cr3, ip: 0 });
            event.tsc = self.tsc;
            self.evq.get_mut(EventBinding::Tip).enqueue(event)?;
        } else {
            let mut event = Event::new(EventKind::Paging { cr3: pip.cr3 });
            event.tsc = self.tsc;
            self.event = Some(event);
        }

        self.pos = Some(pos + packet.size());
        Ok(())
    }

    fn decode_psb(&mut self) -> Result<(), Error> {
        let pos = self.pos.ok_or(Error::Internal)?;
        let packet = self.read_packet(pos)?;
        if packet != Packet::Psb {
            return Err(Error::Internal);
        }
        self.pos = Some(pos + packet.size());

        // The packet after the header will be a PSBEND; dispatching it
        // publishes the events accumulated while reading the header.
        self.read_psb_header()
    }

    fn read_psb_header(&mut self) -> Result<(), Error> {
        self.ip.clear();

        loop {
            self.next = None;
            let pos = self.pos.ok_or(Error::Internal)?;
            let fetch = Fetch::classify(self.config.buffer(), pos)?;
            self.next = Some(fetch);

            match fetch {
                // We're done once we reach a PSBEND; an OVF ends the header
                // early.
                Fetch::Psbend | Fetch::Ovf => return Ok(()),
                Fetch::Pad => self.decode_pad()?,
                Fetch::Tsc => self.decode_tsc()?,
                Fetch::Cbr => self.decode_cbr()?,
                Fetch::Pip => self.header_pip()?,
                Fetch::Mode => self.header_mode()?,
                Fetch::Fup => self.header_fup()?,
                Fetch::Unknown => self.decode_unknown()?,
                _ => return Err(Error::BadContext),
            }
        }
    }

    fn header_fup(&mut self) -> Result<(), Error> {
        let pos = self.pos.ok_or(Error::Internal)?;
        let (payload, size) = self.read_ip(pos)?;

        if self.config.errata.bdm70 && !self.enabled && self.scan_bdm70(pos + size)? {
            // The FUP leaked into the PSB+ ahead of a TIP.PGE; ignore it.
            log::trace!("[qry] bdm70: skipping a psb+ fup");
            self.pos = Some(pos + size);
            return Ok(());
        }

        self.ip.update(&payload);
        // Tracing is enabled if we have an IP in the header.
        if payload.ipc != IpCompression::Suppressed {
            self.enabled = true;
        }
        self.pos = Some(pos + size);
        Ok(())
    }

    /// BDM70: a TIP.PGE behind this PSB+ means the header's FUP and
    /// MODE.Exec leaked in even though tracing is disabled.
    fn scan_bdm70(&mut self, mut pos: usize) -> Result<bool, Error> {
        let buf = self.config.buffer();
        loop {
            let packet = match Packet::read(buf, pos, self.config.unknown_mut()) {
                Ok(packet) => packet,
                // Running out of packets is not an error.
                Err(Error::Eos) => return Ok(false),
                Err(error) => return Err(error),
            };
            match packet {
                Packet::TipPge(_) => return Ok(true),
                Packet::Pad
                | Packet::Tsc(_)
                | Packet::Cbr(_)
                | Packet::Psbend
                | Packet::Pip(_)
                | Packet::Mode(_) => {}
                _ => return Ok(false),
            }
            pos += packet.size();
        }
    }

    fn header_mode(&mut self) -> Result<(), Error> {
        let pos = self.pos.ok_or(Error::Internal)?;
        let packet = self.read_packet(pos)?;
        let Packet::Mode(mode) = packet else {
            return Err(Error::Internal);
        };

        // Inside the header, events are reported at the PSBEND.
        let event = Event::new(match mode {
            ModePayload::Exec(exec) => EventKind::ExecMode {
                mode: exec.exec_mode(),
                ip: 0,
            },
            ModePayload::Tsx(tsx) => EventKind::Tsx {
                ip: 0,
                speculative: tsx.intx,
                aborted: tsx.abrt,
            },
        });
        self.evq.get_mut(EventBinding::Psbend).enqueue(event)?;

        self.pos = Some(pos + packet.size());
        Ok(())
    }

    fn header_pip(&mut self) -> Result<(), Error> {
        let pos = self.pos.ok_or(Error::Internal)?;
        let packet = self.read_packet(pos)?;
        let Packet::Pip(pip) = packet else {
            return Err(Error::Internal);
        };

        // Paging state is reported at the PSBEND.
        let event = Event::new(EventKind::AsyncPaging { cr3: pip.cr3, ip: 0 });
        self.evq.get_mut(EventBinding::Psbend).enqueue(event)?;

        self.pos = Some(pos + packet.size());
        Ok(())
    }

    /// Publish one pending PSB+ event, if any.
    fn process_pending_psb_events(&mut self) -> Result<bool, Error> {
        let Some(mut event) = self.evq.get_mut(EventBinding::Psbend).dequeue() else {
            return Ok(false);
        };

        let (ip, suppressed) = self.query_event_ip();
        match &mut event.kind {
            EventKind::AsyncPaging { ip: slot, .. }
            | EventKind::ExecMode { ip: slot, .. }
            | EventKind::Tsx { ip: slot, .. } => *slot = ip,
            _ => return Err(Error::Internal),
        }
        event.ip_suppressed |= suppressed;
        event.tsc = self.tsc;
        // PSB+ events describe state at the sync point, not transitions.
        event.status_update = true;

        self.event = Some(event);
        Ok(true)
    }

    fn decode_psbend(&mut self) -> Result<(), Error> {
        if self.process_pending_psb_events()? {
            // Stay on the PSBEND until all header events are delivered.
            return Ok(());
        }

        let pos = self.pos.ok_or(Error::Internal)?;
        self.pos = Some(pos + opcode::PTPS_PSBEND);
        Ok(())
    }

    fn decode_ovf(&mut self) -> Result<(), Error> {
        // An OVF also ends a PSB+; drain its events first.
        if self.process_pending_psb_events()? {
            return Ok(());
        }

        log::trace!("[qry] overflow");

        // Reset the decoder state but preserve position and timing.
        let pos = self.pos;
        let sync = self.sync;
        let tsc = self.tsc;
        let cbr = self.cbr;
        self.reset();
        self.pos = pos;
        self.sync = sync;
        self.tsc = tsc;
        self.cbr = cbr;

        // Consume the OVF before searching for the binding packet.
        let pos = self.pos.ok_or(Error::Internal)?;
        self.pos = Some(pos + opcode::PTPS_OVF);

        // The overflow binds to a FUP if it resolved while tracing was
        // enabled; only timing and padding may sit in between. Anything
        // else means tracing was disabled before the overflow resolved.
        match self.read_ahead_while_timing() {
            Ok(()) => {}
            Err(Error::Eos) => {}
            Err(error) => return Err(error),
        }

        let mut event = Event::new(EventKind::Overflow { ip: 0 });
        event.tsc = self.tsc;
        if self.next == Some(Fetch::Fup) {
            self.evq
                .get_mut(EventBinding::Fup)
                .enqueue(event)
                .map_err(|_| Error::Internal)?;
            self.enabled = true;
        } else {
            // Tracing resumes at some later enable; there is no IP.
            event.ip_suppressed = true;
            self.event = Some(event);
        }

        Ok(())
    }
}

/// Map stream exhaustion during a query to "no packet matching the query";
/// the end of the trace itself is reported through the status flags.
fn query_error(error: Error) -> Error {
    if error == Error::Eos {
        Error::BadQuery
    } else {
        error
    }
}
