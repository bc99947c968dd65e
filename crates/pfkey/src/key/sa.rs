//! Security association model.

use std::fmt;
use std::net::IpAddr;

use super::ext::{IdentityExt, KeyMaterial, LifetimeExt, SaExt};
use super::message::IpsecProtocol;
use super::policy::Mode;
use super::sadb::SaIdxKey;

/// SA lifecycle state.
///
/// ```text
/// Larval --validate--> Mature --soft expiry, used--> Dying
///    |                   |                            |
///    +-------------------+-----------> Dead <---------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SaState {
    Larval,
    Mature,
    Dying,
    Dead,
}

impl SaState {
    /// All states, in collection order.
    pub const ALL: [SaState; 4] = [Self::Larval, Self::Mature, Self::Dying, Self::Dead];

    /// States a packet may use.
    pub const USABLE: [SaState; 2] = [Self::Mature, Self::Dying];

    /// States a Delete or Get may address.
    pub const ALIVE: [SaState; 3] = [Self::Larval, Self::Mature, Self::Dying];

    pub(crate) fn slot(self) -> usize {
        self as usize
    }

    /// Wire state number.
    pub fn number(self) -> u8 {
        self as u8
    }

    /// Parse a wire state number.
    pub fn from_u8(v: u8) -> Option<Self> {
        Self::ALL.get(usize::from(v)).copied()
    }
}

impl fmt::Display for SaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Larval => "larval",
            Self::Mature => "mature",
            Self::Dying => "dying",
            Self::Dead => "dead",
        })
    }
}

/// Anti-replay window. `size` is the window in bytes of bitmap, as
/// carried in the SA extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayWindow {
    size: u8,
    bitmap: Vec<u8>,
    last_seq: u32,
}

impl ReplayWindow {
    /// Create an empty window.
    pub fn new(size: u8) -> Self {
        Self {
            size,
            bitmap: vec![0; usize::from(size)],
            last_seq: 0,
        }
    }

    /// Window size in bytes.
    pub fn size(&self) -> u8 {
        self.size
    }

    /// Highest sequence number accepted so far.
    pub fn last_seq(&self) -> u32 {
        self.last_seq
    }

    fn bits(&self) -> u32 {
        u32::from(self.size) * 8
    }

    fn bit(&self, diff: u32) -> bool {
        self.bitmap[(diff / 8) as usize] & (1 << (diff % 8)) != 0
    }

    fn set_bit(&mut self, diff: u32) {
        self.bitmap[(diff / 8) as usize] |= 1 << (diff % 8);
    }

    fn shift(&mut self, by: u32) {
        if by >= self.bits() {
            self.bitmap.fill(0);
            return;
        }
        // Bit `d` tracks `last_seq - d`; moving the window forward moves
        // every bit up by `by` positions.
        let mut shifted = vec![0u8; self.bitmap.len()];
        for d in 0..self.bits() - by {
            if self.bit(d) {
                let n = d + by;
                shifted[(n / 8) as usize] |= 1 << (n % 8);
            }
        }
        self.bitmap = shifted;
    }

    /// Check a received sequence number and record it.
    ///
    /// Returns `false` for zero, duplicates, and numbers that fell out of
    /// the window.
    pub fn check_and_update(&mut self, seq: u32) -> bool {
        if seq == 0 {
            return false;
        }
        if self.size == 0 {
            return true;
        }
        if seq > self.last_seq {
            self.shift(seq - self.last_seq);
            self.last_seq = seq;
            self.set_bit(0);
            return true;
        }
        let diff = self.last_seq - seq;
        if diff >= self.bits() || self.bit(diff) {
            return false;
        }
        self.set_bit(diff);
        true
    }
}

/// A security association.
#[derive(Debug, Clone)]
pub struct SecurityAssociation {
    /// SPI in host byte order.
    pub spi: u32,
    pub protocol: IpsecProtocol,
    pub(crate) state: SaState,
    pub seq: u32,
    pub pid: u32,
    pub auth_alg: u8,
    pub enc_alg: u8,
    pub flags: u32,
    /// Replay window size requested by the peer.
    pub replay_size: u8,
    pub replay: Option<ReplayWindow>,
    /// Tunnel endpoint; `None` for transport mode.
    pub proxy: Option<IpAddr>,
    pub key_auth: Option<KeyMaterial>,
    pub key_enc: Option<KeyMaterial>,
    pub ident_src: Option<IdentityExt>,
    pub ident_dst: Option<IdentityExt>,
    pub sensitivity: Option<Vec<u8>>,
    pub current: LifetimeExt,
    pub hard: Option<LifetimeExt>,
    pub soft: Option<LifetimeExt>,
    pub created: u64,
    pub(crate) saidx: SaIdxKey,
    pub(crate) refcnt: u32,
}

impl SecurityAssociation {
    /// A fresh Larval SA created at `now`.
    pub fn larval(spi: u32, protocol: IpsecProtocol, saidx: SaIdxKey, now: u64) -> Self {
        Self {
            spi,
            protocol,
            state: SaState::Larval,
            seq: 0,
            pid: 0,
            auth_alg: 0,
            enc_alg: 0,
            flags: 0,
            replay_size: 0,
            replay: None,
            proxy: None,
            key_auth: None,
            key_enc: None,
            ident_src: None,
            ident_dst: None,
            sensitivity: None,
            current: LifetimeExt {
                add_time: now,
                ..Default::default()
            },
            hard: None,
            soft: None,
            created: now,
            saidx,
            refcnt: 0,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SaState {
        self.state
    }

    /// Outstanding references, the database's own included.
    pub fn refcnt(&self) -> u32 {
        self.refcnt
    }

    /// Group the SA is linked under.
    pub fn saidx(&self) -> SaIdxKey {
        self.saidx
    }

    /// Tunnel mode when a proxy is set, transport otherwise.
    pub fn mode(&self) -> Mode {
        if self.proxy.is_some() {
            Mode::Tunnel
        } else {
            Mode::Transport
        }
    }

    /// Whether a request for `mode` can use this SA.
    pub fn supports_mode(&self, mode: Mode) -> bool {
        mode == Mode::Any || mode == self.mode()
    }

    /// Whether the SA carried any traffic yet.
    pub fn is_used(&self) -> bool {
        self.current.use_time != 0
    }

    /// Copy the mutable fields of an SA extension in.
    pub fn apply_sa_ext(&mut self, sa: &SaExt) {
        self.replay_size = sa.replay;
        self.auth_alg = sa.auth;
        self.enc_alg = sa.encrypt;
        self.flags = sa.flags;
    }

    /// The SA extension describing this SA.
    pub fn sa_ext(&self) -> SaExt {
        SaExt {
            spi: self.spi,
            replay: self.replay_size,
            state: self.state.number(),
            auth: self.auth_alg,
            encrypt: self.enc_alg,
            flags: self.flags,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_numbers() {
        for s in SaState::ALL {
            assert_eq!(SaState::from_u8(s.number()), Some(s));
        }
        assert_eq!(SaState::from_u8(4), None);
        assert!(SaState::Larval < SaState::Dead);
    }

    #[test]
    fn test_replay_window() {
        let mut w = ReplayWindow::new(4);
        assert!(!w.check_and_update(0));
        assert!(w.check_and_update(1));
        assert!(!w.check_and_update(1));
        assert!(w.check_and_update(5));
        assert!(w.check_and_update(3));
        assert!(!w.check_and_update(3));
        assert!(w.check_and_update(40));
        // A 32-bit window ending at 40 starts at 9.
        assert!(!w.check_and_update(8));
        assert!(w.check_and_update(9));
        assert!(!w.check_and_update(5));
        assert_eq!(w.last_seq(), 40);
    }

    #[test]
    fn test_replay_window_disabled() {
        let mut w = ReplayWindow::new(0);
        assert!(w.check_and_update(7));
        assert!(w.check_and_update(7));
    }
}
