//! Decoded trace events.

use ptkit_packet::ExecMode;

/// The payload of an [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Tracing has been enabled
    Enabled {
        /// The address at which tracing resumes
        ip: u64,
    },
    /// Tracing has been disabled
    Disabled {
        /// The destination of the first branch inside the filtered area.
        ///
        /// Not valid if the event's IP has been suppressed. The exact source
        /// IP needs to be determined using disassembly.
        ip: u64,
    },
    /// Tracing has been disabled asynchronously
    AsyncDisabled {
        /// The source address of the asynchronous branch that disabled
        /// tracing
        at: u64,
        /// The destination of the first branch inside the filtered area
        ip: u64,
    },
    /// An asynchronous branch, e.g. an interrupt
    AsyncBranch {
        /// The branch source address
        from: u64,
        /// The branch destination address
        to: u64,
    },
    /// A synchronous paging event
    Paging {
        /// The updated CR3 value, low 5 bits zero
        cr3: u64,
    },
    /// An asynchronous paging event
    AsyncPaging {
        /// The updated CR3 value, low 5 bits zero
        cr3: u64,
        /// The address at which the event is effective
        ip: u64,
    },
    /// Trace overflow
    Overflow {
        /// The address at which tracing resumes after the overflow
        ip: u64,
    },
    /// An execution mode change
    ExecMode {
        /// The execution mode
        mode: ExecMode,
        /// The address at which the event is effective
        ip: u64,
    },
    /// A transactional execution state change
    Tsx {
        /// The address at which the event is effective
        ip: u64,
        /// Execution is speculative
        speculative: bool,
        /// Speculative execution aborted
        aborted: bool,
    },
}

/// A decoded trace event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    /// What happened
    pub kind: EventKind,
    /// The event IP had been suppressed
    pub ip_suppressed: bool,
    /// The event describes decoder state at a synchronization point rather
    /// than a transition
    pub status_update: bool,
    /// The timestamp count at the event, if timing is known
    pub tsc: Option<u64>,
}

impl Event {
    /// An event without flags or timing.
    #[must_use]
    pub(crate) fn new(kind: EventKind) -> Self {
        Event {
            kind,
            ip_suppressed: false,
            status_update: false,
            tsc: None,
        }
    }
}
