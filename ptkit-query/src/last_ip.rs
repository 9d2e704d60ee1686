//! The last-IP register.

use ptkit_packet::{Error, IpCompression, IpPayload};

/// The compressed last-IP register.
///
/// IP packets only carry the low bits of an address; the register folds each
/// payload into the previously reconstructed IP.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastIp {
    ip: u64,
    have_ip: bool,
    suppressed: bool,
}

impl LastIp {
    /// An invalid last-IP register.
    #[must_use]
    pub fn new() -> Self {
        LastIp::default()
    }

    /// Invalidate the register.
    pub fn clear(&mut self) {
        *self = LastIp::default();
    }

    /// Fold an IP payload into the register.
    ///
    /// A suppressed payload leaves the reconstructed IP unchanged but marks
    /// the register as suppressed until the next update.
    pub fn update(&mut self, payload: &IpPayload) {
        match payload.apply(self.ip) {
            None => self.suppressed = true,
            Some(ip) => {
                self.ip = ip;
                self.have_ip = true;
                self.suppressed = false;
            }
        }
        debug_assert!(
            payload.ipc != IpCompression::Suppressed || self.suppressed,
            "suppressed payloads must suppress the register"
        );
    }

    /// The reconstructed IP.
    pub fn query(&self) -> Result<u64, Error> {
        if !self.have_ip {
            return Err(Error::Noip);
        }
        if self.suppressed {
            return Err(Error::IpSuppressed);
        }
        Ok(self.ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_without_an_ip() {
        let ip = LastIp::new();
        assert_eq!(ip.query(), Err(Error::Noip));
    }

    #[test]
    fn updates_carry_over() {
        let mut last = LastIp::new();
        last.update(&IpPayload {
            ipc: IpCompression::Sext48,
            ip: 0xffff_ffff_8000,
        });
        assert_eq!(last.query(), Ok(0xffff_ffff_ffff_8000));

        last.update(&IpPayload {
            ipc: IpCompression::Update16,
            ip: 0x1234,
        });
        assert_eq!(last.query(), Ok(0xffff_ffff_ffff_1234));

        last.update(&IpPayload {
            ipc: IpCompression::Update32,
            ip: 0xaabb_ccdd,
        });
        assert_eq!(last.query(), Ok(0xffff_ffff_aabb_ccdd));
    }

    #[test]
    fn suppression_is_transient() {
        let mut last = LastIp::new();
        last.update(&IpPayload {
            ipc: IpCompression::Sext48,
            ip: 0x40_0000,
        });
        last.update(&IpPayload::suppressed());
        assert_eq!(last.query(), Err(Error::IpSuppressed));

        last.update(&IpPayload {
            ipc: IpCompression::Update16,
            ip: 0x5678,
        });
        assert_eq!(last.query(), Ok(0x40_5678));
    }
}
