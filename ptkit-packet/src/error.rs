//! Errors shared by every decoder layer.

use thiserror::Error;

/// Decode and encode errors.
///
/// The discriminants are wire-stable: [`code`][Error::code] returns the small
/// integer historically reported as a negated return value, and
/// [`from_code`][Error::from_code] is its inverse.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Internal decoder error
    #[error("internal decoder error")]
    Internal,
    /// Invalid argument
    #[error("invalid argument")]
    Invalid,
    /// Decoder out of sync
    #[error("decoder out of sync")]
    Nosync,
    /// Unknown opcode
    #[error("unknown opcode")]
    BadOpc,
    /// Unknown packet payload
    #[error("unknown packet payload")]
    BadPacket,
    /// Unexpected packet context
    #[error("unexpected packet context")]
    BadContext,
    /// Reached the end of the trace stream
    #[error("end of trace stream")]
    Eos,
    /// No packet matching the query to be found
    #[error("no packet matching the query")]
    BadQuery,
    /// Decoder out of memory
    #[error("decoder out of memory")]
    Nomem,
    /// Bad configuration
    #[error("bad configuration")]
    BadConfig,
    /// There is no IP
    #[error("no ip")]
    Noip,
    /// The IP has been suppressed
    #[error("ip has been suppressed")]
    IpSuppressed,
    /// There is no memory mapped at the requested address
    #[error("no memory mapped at this address")]
    Nomap,
    /// An instruction could not be decoded
    #[error("unknown instruction")]
    BadInsn,
    /// No timing information is available
    #[error("no timing information")]
    NoTime,
    /// No core:bus ratio is available
    #[error("no core:bus ratio")]
    NoCbr,
    /// Bad traced image
    #[error("bad traced image")]
    BadImage,
    /// A locking error
    #[error("locking error")]
    BadLock,
    /// The requested feature is not supported
    #[error("not supported")]
    NotSupported,
}

impl Error {
    /// The wire-stable error code.
    ///
    /// Zero is reserved for success and never returned.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Error::Internal => 1,
            Error::Invalid => 2,
            Error::Nosync => 3,
            Error::BadOpc => 4,
            Error::BadPacket => 5,
            Error::BadContext => 6,
            Error::Eos => 7,
            Error::BadQuery => 8,
            Error::Nomem => 9,
            Error::BadConfig => 10,
            Error::Noip => 11,
            Error::IpSuppressed => 12,
            Error::Nomap => 13,
            Error::BadInsn => 14,
            Error::NoTime => 15,
            Error::NoCbr => 16,
            Error::BadImage => 17,
            Error::BadLock => 18,
            Error::NotSupported => 19,
        }
    }

    /// Decode a wire-stable error code back into an [`Error`].
    #[must_use]
    pub const fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            1 => Error::Internal,
            2 => Error::Invalid,
            3 => Error::Nosync,
            4 => Error::BadOpc,
            5 => Error::BadPacket,
            6 => Error::BadContext,
            7 => Error::Eos,
            8 => Error::BadQuery,
            9 => Error::Nomem,
            10 => Error::BadConfig,
            11 => Error::Noip,
            12 => Error::IpSuppressed,
            13 => Error::Nomap,
            14 => Error::BadInsn,
            15 => Error::NoTime,
            16 => Error::NoCbr,
            17 => Error::BadImage,
            18 => Error::BadLock,
            19 => Error::NotSupported,
            _ => return None,
        })
    }
}

pub(crate) type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for code in 1..=19 {
            let error = Error::from_code(code).unwrap();
            assert_eq!(error.code(), code);
        }
        assert_eq!(Error::from_code(0), None);
        assert_eq!(Error::from_code(20), None);
    }
}
