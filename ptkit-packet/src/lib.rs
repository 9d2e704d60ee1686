//! Bit-exact encoder and decoder for the Intel Processor Trace wire format.
//!
//! This crate is the lowest layer of the `ptkit` decoder stack. It knows the
//! packet grammar and nothing else: [`Encoder`] serializes [`Packet`]s into a
//! trace buffer, [`PacketDecoder`] walks a buffer packet by packet and finds
//! synchronization points, and [`Config`] carries everything the decoders
//! need to know about the trace (the buffer, the CPU the trace was recorded
//! on, and the errata workarounds to apply).
//!
//! Reconstructing control flow from the packet stream is the business of the
//! `ptkit-query` and `ptkit-insn` crates.
//!
//! ```rust
//! use ptkit_packet::{Config, Encoder, Packet, PacketDecoder, TscPayload};
//!
//! let mut buf = [0u8; 8];
//! let mut encoder = Encoder::new(&mut buf);
//! encoder.next(&Packet::Tsc(TscPayload { tsc: 0x1000 })).unwrap();
//!
//! let mut decoder = PacketDecoder::new(Config::new(&buf));
//! decoder.sync_set(0).unwrap();
//! assert_eq!(decoder.next().unwrap(), Packet::Tsc(TscPayload { tsc: 0x1000 }));
//! ```

pub mod error;
pub mod opcode;
pub mod sync;

mod decoder;
mod encoder;
mod packet;

use perfect_derive::perfect_derive;

pub use crate::{
    decoder::PacketDecoder,
    encoder::Encoder,
    error::Error,
    packet::{
        CbrPayload, ExecMode, IpCompression, IpPayload, ModeExec, ModePayload, ModeTsx, Packet,
        PipPayload, TntPayload, TscPayload, UnknownPayload,
    },
};

/// A cpu vendor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CpuVendor {
    /// An unknown vendor
    #[default]
    Unknown,
    /// Intel
    Intel,
}

/// A cpu identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cpu {
    /// The cpu vendor
    pub vendor: CpuVendor,
    /// The cpu family
    pub family: u16,
    /// The cpu model
    pub model: u8,
    /// The stepping
    pub stepping: u8,
}

/// The errata workarounds to apply when decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Errata {
    /// BDM70: PSB+ packets may contain unexpected packets.
    ///
    /// Some packets should be issued only between TIP.PGE and TIP.PGD
    /// packets. Due to this erratum, a TIP.PGE may be preceded by a PSB+
    /// that incorrectly includes FUP and MODE.Exec packets.
    pub bdm70: bool,
    /// BDM64: an incorrect packet may be recorded following a transactional
    /// abort.
    ///
    /// If an abort occurs immediately following a branch instruction, an
    /// incorrect branch target may be logged before the packet produced by
    /// the abort.
    pub bdm64: bool,
}

/// Determine the errata workarounds for a given cpu.
#[must_use]
pub fn cpu_errata(cpu: &Cpu) -> Errata {
    let mut errata = Errata::default();

    // We don't know about others.
    if cpu.vendor != CpuVendor::Intel {
        return errata;
    }

    if cpu.family == 0x6 {
        match cpu.model {
            0x3d => {
                errata.bdm70 = true;
                errata.bdm64 = true;
            }
            0x5e => {
                errata.bdm70 = true;
            }
            _ => {}
        }
    }

    errata
}

/// A handler for opcodes the packet grammar does not know.
///
/// Handlers delimit the packet starting at the first byte of `pos` and
/// return its size. The decoders report [`Error::BadOpc`] when the handler
/// fails and [`Error::BadPacket`] when the reported size is zero or runs
/// past the end of the trace buffer.
pub trait DecodeUnknown {
    /// Delimit the unknown packet at the start of `pos`.
    fn decode_unknown(&mut self, pos: &[u8]) -> Result<usize, Error>;
}

/// The default unknown-packet handler: every unknown opcode is an error.
#[derive(Debug, Clone, Copy, Default)]
pub struct RejectUnknown;

impl DecodeUnknown for RejectUnknown {
    fn decode_unknown(&mut self, _pos: &[u8]) -> Result<usize, Error> {
        Err(Error::BadOpc)
    }
}

/// An Intel PT decoder configuration.
///
/// Immutable once handed to a decoder. The trace buffer is borrowed for the
/// lifetime of the configuration and every decoder created from it.
#[perfect_derive(Debug, Clone)]
pub struct Config<'a, U = RejectUnknown> {
    buf: &'a [u8],
    /// The cpu on which the trace has been recorded
    pub cpu: Cpu,
    /// The errata workarounds to apply
    pub errata: Errata,
    unknown: U,
}

impl<'a> Config<'a> {
    /// A configuration over `buf` rejecting unknown opcodes.
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Config {
            buf,
            cpu: Cpu::default(),
            errata: Errata::default(),
            unknown: RejectUnknown,
        }
    }
}

impl<'a, U: DecodeUnknown> Config<'a, U> {
    /// A configuration over `buf` with an unknown-packet handler.
    pub fn with_unknown(buf: &'a [u8], unknown: U) -> Self {
        Config {
            buf,
            cpu: Cpu::default(),
            errata: Errata::default(),
            unknown,
        }
    }

    /// Set the recording cpu and apply its errata workarounds.
    #[must_use]
    pub fn for_cpu(mut self, cpu: Cpu) -> Self {
        self.cpu = cpu;
        self.errata = cpu_errata(&cpu);
        self
    }

    /// The trace buffer.
    #[must_use]
    pub fn buffer(&self) -> &'a [u8] {
        self.buf
    }

    /// The unknown-packet handler.
    pub fn unknown_mut(&mut self) -> &mut U {
        &mut self.unknown
    }
}

/// The library version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    /// Major version number
    pub major: u8,
    /// Minor version number
    pub minor: u8,
    /// Reserved bits
    pub reserved: u16,
    /// Build number
    pub build: u32,
    /// Version extension
    pub ext: &'static str,
}

/// Return the library version.
#[must_use]
pub const fn library_version() -> Version {
    Version {
        major: 0,
        minor: 1,
        reserved: 0,
        build: 0,
        ext: "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errata_follow_the_model_table() {
        let broadwell = Cpu {
            vendor: CpuVendor::Intel,
            family: 0x6,
            model: 0x3d,
            stepping: 0,
        };
        let errata = cpu_errata(&broadwell);
        assert!(errata.bdm70);
        assert!(errata.bdm64);

        let skylake = Cpu {
            model: 0x5e,
            ..broadwell
        };
        let errata = cpu_errata(&skylake);
        assert!(errata.bdm70);
        assert!(!errata.bdm64);

        let unknown = Cpu::default();
        assert_eq!(cpu_errata(&unknown), Errata::default());
    }
}
