//! The Intel PT instruction-flow decoder.
//!
//! The highest decoder layer: drives a query decoder and a traced memory
//! image to reconstruct every executed instruction in order. Each call to
//! [`next`][InsnDecoder::next] reads the instruction bytes at the current
//! IP, classifies them, advances the IP according to the classification and
//! the trace (conditional outcomes, indirect targets, the shadow return
//! stack), and attaches pending events to the instruction they belong to.

pub mod classify;
pub mod image;

mod retstack;

use std::collections::VecDeque;

use hashbrown::HashMap;
use ptkit_packet::{Config, DecodeUnknown, Error, ExecMode, RejectUnknown};
use ptkit_query::{Event, EventKind, QueryDecoder, Status};

pub use crate::{
    classify::{DecodedInsn, InsnClass},
    image::{Asid, Image, ReadMemory, ResolveCr3, SharedImage, NO_CR3},
    retstack::RetStack,
};

/// The maximal size of an x86 instruction.
pub const MAX_INSN_SIZE: usize = 15;

/// A single reconstructed instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Insn {
    /// The virtual address in its process
    pub ip: u64,
    /// The execution mode
    pub mode: ExecMode,
    /// A coarse classification
    pub class: InsnClass,
    /// The raw bytes
    pub raw: [u8; MAX_INSN_SIZE],
    /// The size in bytes
    pub size: u8,
    /// The instruction was executed speculatively
    pub speculative: bool,
    /// Speculative execution was aborted after this instruction
    pub aborted: bool,
    /// Speculative execution was committed after this instruction
    pub committed: bool,
    /// Tracing was disabled after this instruction
    pub disabled: bool,
    /// Tracing was enabled at this instruction
    pub enabled: bool,
    /// Tracing resumed at this instruction from the IP at which it had been
    /// disabled
    pub resumed: bool,
    /// Normal execution flow was interrupted after this instruction
    pub interrupted: bool,
    /// Tracing resumed at this instruction after an overflow
    pub resynced: bool,
}

impl Insn {
    fn empty() -> Self {
        Insn {
            ip: 0,
            mode: ExecMode::Unknown,
            class: InsnClass::Other,
            raw: [0; MAX_INSN_SIZE],
            size: 0,
            speculative: false,
            aborted: false,
            committed: false,
            disabled: false,
            enabled: false,
            resumed: false,
            interrupted: false,
            resynced: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CachedInsn {
    raw: [u8; MAX_INSN_SIZE],
    size: u8,
    class: InsnClass,
    target: Option<u64>,
}

/// The decode cache grows with the traced working set; start it large.
const CACHE_INITIAL_CAPACITY: usize = 0x1000;

/// An Intel PT instruction-flow decoder.
///
/// The decoder needs to be synchronized onto the trace before it can be
/// used. The image may be swapped with [`set_image`][InsnDecoder::set_image]
/// while the decoder is idle.
pub struct InsnDecoder<'a, U = RejectUnknown> {
    query: QueryDecoder<'a, U>,
    image: SharedImage,
    asid: Asid,
    ip: u64,
    mode: ExecMode,
    /// The status of the most recent query operation
    status: Status,
    /// Events materialized by the query decoder, waiting for the boundary
    /// they apply to
    pending: VecDeque<Event>,
    enabled: bool,
    speculative: bool,
    last_disable_ip: Option<u64>,
    retstack: RetStack,
    cache: HashMap<u64, CachedInsn>,
}

impl<'a, U: DecodeUnknown> InsnDecoder<'a, U> {
    /// An instruction-flow decoder over the configured trace buffer,
    /// reading code from `image`.
    #[must_use]
    pub fn new(config: Config<'a, U>, image: SharedImage) -> Self {
        InsnDecoder {
            query: QueryDecoder::new(config),
            image,
            asid: Asid::unknown(),
            ip: 0,
            mode: ExecMode::Unknown,
            status: Status::default(),
            pending: VecDeque::new(),
            enabled: false,
            speculative: false,
            last_disable_ip: None,
            retstack: RetStack::new(),
            cache: HashMap::with_capacity(CACHE_INITIAL_CAPACITY),
        }
    }

    /// The traced image the decoder reads code from.
    #[must_use]
    pub fn image(&self) -> &SharedImage {
        &self.image
    }

    /// Replace the traced image.
    ///
    /// Only call this while the decoder is idle.
    pub fn set_image(&mut self, image: SharedImage) {
        self.image = image;
        self.cache.clear();
    }

    /// The current decoder position in the trace buffer.
    pub fn offset(&self) -> Result<usize, Error> {
        self.query.offset()
    }

    /// The position of the last synchronization point.
    pub fn sync_offset(&self) -> Result<usize, Error> {
        self.query.sync_offset()
    }

    /// The current CR3.
    #[must_use]
    pub fn cr3(&self) -> u64 {
        self.asid.cr3
    }

    /// The current timestamp count.
    pub fn time(&self) -> Result<u64, Error> {
        self.query.time()
    }

    /// The current core:bus ratio.
    pub fn core_bus_ratio(&self) -> Result<u8, Error> {
        self.query.core_bus_ratio()
    }

    /// Search for the next synchronization point in forward direction.
    pub fn sync_forward(&mut self) -> Result<(), Error> {
        let (status, ip) = self.query.sync_forward()?;
        self.after_sync(status, ip);
        Ok(())
    }

    /// Search for the next synchronization point in backward direction.
    pub fn sync_backward(&mut self) -> Result<(), Error> {
        let (status, ip) = self.query.sync_backward()?;
        self.after_sync(status, ip);
        Ok(())
    }

    /// Synchronize onto the PSB at `offset`.
    pub fn sync_set(&mut self, offset: usize) -> Result<(), Error> {
        let (status, ip) = self.query.sync_set(offset)?;
        self.after_sync(status, ip);
        Ok(())
    }

    fn after_sync(&mut self, status: Status, ip: Option<u64>) {
        match ip {
            Some(ip) => log::trace!("[insn] synchronized, ip {ip:#x}"),
            None => log::trace!("[insn] synchronized, tracing disabled"),
        }
        self.status = status;
        self.pending.clear();
        self.asid = Asid::unknown();
        self.mode = ExecMode::Unknown;
        self.speculative = false;
        self.last_disable_ip = None;
        self.retstack.clear();
        self.cache.clear();
        match ip {
            Some(ip) => {
                self.ip = ip;
                self.enabled = true;
            }
            None => {
                self.ip = 0;
                self.enabled = false;
            }
        }
    }

    /// Reconstruct the next instruction in execution order.
    pub fn next(&mut self) -> Result<(Insn, Status), Error> {
        if self.status.eos && self.pending.is_empty() && !self.status.event_pending {
            return Err(Error::Eos);
        }

        let mut insn = Insn::empty();

        // Apply every event due at the current boundary; while tracing is
        // disabled this waits for the event that turns it back on.
        loop {
            if let Some(front) = self.pending.front() {
                if self.event_applies(front) {
                    let event = self.pending.pop_front().expect("front exists");
                    self.apply_event(event, &mut insn)?;
                    continue;
                }
            }
            if self.status.event_pending {
                self.fetch_event()?;
                continue;
            }
            if self.enabled {
                break;
            }
            if !self.pending.is_empty() {
                // Disabled with an event that cannot apply: the trace is
                // inconsistent.
                return Err(Error::BadContext);
            }
            if self.status.eos {
                return Err(Error::Eos);
            }
            // Disabled with nothing buffered: advance the event stream.
            self.fetch_event()?;
        }

        // Fetch and classify the instruction at the current IP.
        let decoded = self.fetch_insn()?;
        insn.ip = self.ip;
        insn.mode = self.mode;
        insn.class = decoded.class;
        insn.raw = decoded.raw;
        insn.size = decoded.size;
        insn.speculative = self.speculative;

        // Advance the IP according to the classification and the trace.
        let fallthrough = self.ip + u64::from(decoded.size);
        self.ip = match (decoded.class, decoded.target) {
            (InsnClass::Other, _) => fallthrough,
            (InsnClass::Jump, Some(target)) => target,
            (InsnClass::Jump, None) => self.indirect_target()?,
            (InsnClass::Call, Some(target)) => {
                self.retstack.push(fallthrough);
                target
            }
            (InsnClass::Call, None) => {
                self.retstack.push(fallthrough);
                self.indirect_target()?
            }
            (InsnClass::CondJump, Some(target)) => {
                if self.cond_taken()? {
                    target
                } else {
                    fallthrough
                }
            }
            (InsnClass::Return, _) => self.return_target()?,
            (InsnClass::FarCall | InsnClass::FarReturn | InsnClass::FarJump, _) => {
                self.indirect_target()?
            }
            (InsnClass::CondJump, None) | (InsnClass::Error, _) => return Err(Error::BadInsn),
        };

        // Attach the events bound to the boundary we just reached.
        loop {
            if !self.enabled {
                break;
            }
            if self.pending.is_empty() {
                if !self.status.event_pending {
                    break;
                }
                self.fetch_event()?;
            }
            let Some(front) = self.pending.front() else {
                break;
            };
            if !self.event_applies(front) {
                break;
            }
            let event = self.pending.pop_front().expect("front exists");
            self.apply_event(event, &mut insn)?;
        }

        Ok((insn, self.status))
    }

    /// Pull the next materialized event from the query decoder.
    fn fetch_event(&mut self) -> Result<(), Error> {
        let (event, status) = self.query.event()?;
        self.status = status;
        self.pending.push_back(event);
        Ok(())
    }

    /// Buffer every event the query decoder has materialized, so branch
    /// queries are not blocked by them.
    fn collect_pending_events(&mut self) -> Result<(), Error> {
        while self.status.event_pending {
            self.fetch_event()?;
        }
        Ok(())
    }

    /// Whether `event` applies at the current boundary.
    fn event_applies(&self, event: &Event) -> bool {
        match event.kind {
            EventKind::Enabled { .. } => !self.enabled,
            EventKind::Disabled { .. }
            | EventKind::AsyncDisabled { .. }
            | EventKind::Paging { .. }
            | EventKind::Overflow { .. } => true,
            EventKind::AsyncBranch { from, .. } => !self.enabled || self.ip == from,
            EventKind::AsyncPaging { ip, .. }
            | EventKind::ExecMode { ip, .. }
            | EventKind::Tsx { ip, .. } => {
                !self.enabled || event.status_update || event.ip_suppressed || self.ip == ip
            }
        }
    }

    fn apply_event(&mut self, event: Event, insn: &mut Insn) -> Result<(), Error> {
        match event.kind {
            EventKind::Enabled { ip } => {
                if self.enabled {
                    return Err(Error::BadContext);
                }
                log::trace!("[insn] tracing enabled at {ip:#x}");
                self.enabled = true;
                self.ip = ip;
                insn.enabled = true;
                if self.last_disable_ip == Some(ip) {
                    insn.resumed = true;
                }
            }
            EventKind::Disabled { .. } => {
                self.enabled = false;
                self.last_disable_ip = Some(self.ip);
                insn.disabled = true;
            }
            EventKind::AsyncDisabled { at, .. } => {
                self.enabled = false;
                self.last_disable_ip = Some(at);
                insn.disabled = true;
            }
            EventKind::AsyncBranch { from: _, to } => {
                if !self.enabled {
                    return Err(Error::BadContext);
                }
                if event.ip_suppressed {
                    return Err(Error::BadPacket);
                }
                insn.interrupted = true;
                self.ip = to;
            }
            EventKind::Paging { cr3 } | EventKind::AsyncPaging { cr3, .. } => {
                if self.asid.cr3 != cr3 {
                    self.asid = Asid::new(cr3);
                    self.cache.clear();
                }
            }
            EventKind::Overflow { ip } => {
                self.retstack.clear();
                self.speculative = false;
                if event.ip_suppressed {
                    // Tracing was off when the overflow resolved; it comes
                    // back with a later enable.
                    self.enabled = false;
                } else {
                    self.enabled = true;
                    self.ip = ip;
                    insn.resynced = true;
                }
            }
            EventKind::ExecMode { mode, .. } => {
                if self.mode != mode {
                    self.mode = mode;
                    self.cache.clear();
                }
            }
            EventKind::Tsx {
                speculative,
                aborted,
                ..
            } => {
                if aborted {
                    insn.aborted = true;
                } else if self.speculative && !speculative {
                    insn.committed = true;
                }
                self.speculative = speculative;
            }
        }
        Ok(())
    }

    /// Read and classify the instruction at the current IP.
    fn fetch_insn(&mut self) -> Result<CachedInsn, Error> {
        if let Some(cached) = self.cache.get(&self.ip) {
            return Ok(*cached);
        }

        let mut bytes = [0u8; MAX_INSN_SIZE];
        let mut have = self.read_raw(&mut bytes, self.ip)?;
        if have == 0 {
            return Err(Error::Nomap);
        }
        if have < MAX_INSN_SIZE {
            // The read stopped at a section boundary; the instruction may
            // continue in the adjacent one.
            if let Ok(more) = self.read_raw(&mut bytes[have..], self.ip + have as u64) {
                have += more;
            }
        }

        let decoded = classify::classify(&bytes[..have], self.ip, self.mode)?;
        let mut raw = [0u8; MAX_INSN_SIZE];
        let size = usize::from(decoded.len);
        raw[..size].copy_from_slice(&bytes[..size]);

        let cached = CachedInsn {
            raw,
            size: decoded.len,
            class: decoded.class,
            target: decoded.target,
        };
        self.cache.insert(self.ip, cached);
        Ok(cached)
    }

    /// Read from the image, loading binaries lazily for a fresh CR3.
    fn read_raw(&mut self, buffer: &mut [u8], ip: u64) -> Result<usize, Error> {
        let mut image = self.image.lock()?;
        match image.read(buffer, &self.asid, ip) {
            Err(Error::Nomap) => {
                if image.resolve_cr3(self.asid.cr3, ip)? {
                    image.read(buffer, &self.asid, ip)
                } else {
                    Err(Error::Nomap)
                }
            }
            other => other,
        }
    }

    fn cond_taken(&mut self) -> Result<bool, Error> {
        self.collect_pending_events()?;
        let (taken, status) = self.query.cond_branch()?;
        self.status = status;
        Ok(taken)
    }

    fn indirect_target(&mut self) -> Result<u64, Error> {
        self.collect_pending_events()?;
        let (ip, status) = self.query.indirect_branch()?;
        self.status = status;
        ip.ok_or(Error::IpSuppressed)
    }

    /// The target of a near return.
    ///
    /// A compressed return shows up as a taken conditional bit confirming
    /// the shadow stack; an uncompressed one reports its target like any
    /// other indirect branch.
    fn return_target(&mut self) -> Result<u64, Error> {
        self.collect_pending_events()?;
        match self.query.cond_branch() {
            Ok((taken, status)) => {
                self.status = status;
                if !taken {
                    return Err(Error::BadPacket);
                }
                self.retstack.pop()
            }
            Err(Error::BadQuery) => self.indirect_target(),
            Err(error) => Err(error),
        }
    }
}
