//! Algorithm tables.
//!
//! The engine never runs a transform; it only needs to know which
//! algorithm ids exist, their key-length bounds, and whether a given key
//! is acceptable. That knowledge is supplied through [`AlgorithmTable`].

use super::error::{Error, Result};

/// Which algorithm namespace an id belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlgorithmKind {
    Auth,
    Encrypt,
    Compress,
}

/// Descriptor of one supported algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlgorithmInfo {
    pub id: u8,
    pub name: &'static str,
    /// IV length in bytes.
    pub ivlen: u8,
    pub min_bits: u16,
    pub max_bits: u16,
}

impl AlgorithmInfo {
    const fn new(id: u8, name: &'static str, ivlen: u8, min_bits: u16, max_bits: u16) -> Self {
        Self {
            id,
            name,
            ivlen,
            min_bits,
            max_bits,
        }
    }
}

/// Algorithm capability consumed by the engine.
pub trait AlgorithmTable: Send + Sync {
    /// Look up an algorithm descriptor.
    fn lookup(&self, kind: AlgorithmKind, id: u8) -> Option<AlgorithmInfo>;

    /// All algorithms of a kind, in catalogue order.
    fn catalogue(&self, kind: AlgorithmKind) -> Vec<AlgorithmInfo>;

    /// Algorithm-specific key checks beyond the length bounds.
    fn validate(&self, _kind: AlgorithmKind, _id: u8, _key: &[u8]) -> Result<()> {
        Ok(())
    }

    /// Key-length bounds in bits.
    fn bounds(&self, kind: AlgorithmKind, id: u8) -> Option<(u16, u16)> {
        self.lookup(kind, id).map(|a| (a.min_bits, a.max_bits))
    }
}

/// Authentication algorithm ids.
pub mod aalg {
    pub const NONE: u8 = 0;
    pub const MD5HMAC: u8 = 2;
    pub const SHA1HMAC: u8 = 3;
    pub const SHA2_256: u8 = 5;
    pub const SHA2_384: u8 = 6;
    pub const SHA2_512: u8 = 7;
    pub const RIPEMD160HMAC: u8 = 8;
    pub const AES_XCBC_MAC: u8 = 9;
    pub const NULL: u8 = 251;
}

/// Encryption algorithm ids.
pub mod ealg {
    pub const NONE: u8 = 0;
    pub const DESCBC: u8 = 2;
    pub const DES3CBC: u8 = 3;
    pub const CAST128CBC: u8 = 6;
    pub const BLOWFISHCBC: u8 = 7;
    pub const NULL: u8 = 11;
    pub const AESCBC: u8 = 12;
    pub const AESCTR: u8 = 13;
}

/// Compression algorithm ids.
pub mod calg {
    pub const NONE: u8 = 0;
    pub const OUI: u8 = 1;
    pub const DEFLATE: u8 = 2;
    pub const LZS: u8 = 3;
}

const AUTH: &[AlgorithmInfo] = &[
    AlgorithmInfo::new(aalg::MD5HMAC, "hmac-md5", 0, 128, 128),
    AlgorithmInfo::new(aalg::SHA1HMAC, "hmac-sha1", 0, 160, 160),
    AlgorithmInfo::new(aalg::SHA2_256, "hmac-sha256", 0, 256, 256),
    AlgorithmInfo::new(aalg::SHA2_384, "hmac-sha384", 0, 384, 384),
    AlgorithmInfo::new(aalg::SHA2_512, "hmac-sha512", 0, 512, 512),
    AlgorithmInfo::new(aalg::RIPEMD160HMAC, "hmac-ripemd160", 0, 160, 160),
    AlgorithmInfo::new(aalg::AES_XCBC_MAC, "aes-xcbc-mac", 0, 128, 128),
    AlgorithmInfo::new(aalg::NULL, "null", 0, 0, 2048),
];

const ENCRYPT: &[AlgorithmInfo] = &[
    AlgorithmInfo::new(ealg::DESCBC, "des-cbc", 8, 64, 64),
    AlgorithmInfo::new(ealg::DES3CBC, "3des-cbc", 8, 192, 192),
    AlgorithmInfo::new(ealg::CAST128CBC, "cast128-cbc", 8, 40, 128),
    AlgorithmInfo::new(ealg::BLOWFISHCBC, "blowfish-cbc", 8, 40, 448),
    AlgorithmInfo::new(ealg::NULL, "null", 0, 0, 2048),
    AlgorithmInfo::new(ealg::AESCBC, "aes-cbc", 16, 128, 256),
    AlgorithmInfo::new(ealg::AESCTR, "aes-ctr", 8, 160, 288),
];

const COMPRESS: &[AlgorithmInfo] = &[
    AlgorithmInfo::new(calg::OUI, "oui", 0, 0, 0),
    AlgorithmInfo::new(calg::DEFLATE, "deflate", 0, 0, 0),
    AlgorithmInfo::new(calg::LZS, "lzs", 0, 0, 0),
];

/// DES weak and semi-weak keys with parity bits cleared.
const DES_WEAK_KEYS: [[u8; 8]; 4] = [
    [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
    [0xfe, 0xfe, 0xfe, 0xfe, 0xfe, 0xfe, 0xfe, 0xfe],
    [0xe0, 0xe0, 0xe0, 0xe0, 0xf0, 0xf0, 0xf0, 0xf0],
    [0x1e, 0x1e, 0x1e, 0x1e, 0x0e, 0x0e, 0x0e, 0x0e],
];

fn is_des_weak_key(key: &[u8]) -> bool {
    let Some(block) = key.get(..8) else {
        return false;
    };
    DES_WEAK_KEYS
        .iter()
        .any(|weak| block.iter().zip(weak).all(|(k, w)| k & 0xfe == *w))
}

/// The built-in algorithm table.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultAlgorithms;

impl DefaultAlgorithms {
    fn table(kind: AlgorithmKind) -> &'static [AlgorithmInfo] {
        match kind {
            AlgorithmKind::Auth => AUTH,
            AlgorithmKind::Encrypt => ENCRYPT,
            AlgorithmKind::Compress => COMPRESS,
        }
    }
}

impl AlgorithmTable for DefaultAlgorithms {
    fn lookup(&self, kind: AlgorithmKind, id: u8) -> Option<AlgorithmInfo> {
        Self::table(kind).iter().find(|a| a.id == id).copied()
    }

    fn catalogue(&self, kind: AlgorithmKind) -> Vec<AlgorithmInfo> {
        Self::table(kind).to_vec()
    }

    fn validate(&self, kind: AlgorithmKind, id: u8, key: &[u8]) -> Result<()> {
        if kind == AlgorithmKind::Encrypt && id == ealg::DESCBC && is_des_weak_key(key) {
            return Err(Error::AlgorithmRejected("weak DES key".into()));
        }
        if kind == AlgorithmKind::Encrypt && id == ealg::DES3CBC {
            for part in key.chunks(8) {
                if is_des_weak_key(part) {
                    return Err(Error::AlgorithmRejected("weak 3DES key component".into()));
                }
            }
        }
        Ok(())
    }
}
