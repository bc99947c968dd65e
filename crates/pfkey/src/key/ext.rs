//! Extension records.
//!
//! Every message header is followed by extension records, each starting
//! with a `{len, type}` pair where `len` counts 64-bit units including the
//! record header. This module holds the on-wire layouts, the decoded
//! [`Extension`] values, and the [`ExtensionMap`] handlers consume.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::algorithm::AlgorithmInfo;
use super::error::{Error, Result};
use super::index::AddressFamily;
use super::message::{IpsecProtocol, SADB_ALIGNTO, from_units, sadb_align, to_units};
use super::policy::{Level, Mode, PolicyKind, RequestSpec};

/// Size of an extension record header.
pub const SADB_EXT_HDRLEN: usize = 4;

// ============================================================================
// Extension types
// ============================================================================

/// Extension record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u16)]
pub enum ExtType {
    Sa = 1,
    LifetimeCurrent = 2,
    LifetimeHard = 3,
    LifetimeSoft = 4,
    AddressSrc = 5,
    AddressDst = 6,
    AddressProxy = 7,
    KeyAuth = 8,
    KeyEncrypt = 9,
    IdentitySrc = 10,
    IdentityDst = 11,
    Sensitivity = 12,
    Proposal = 13,
    SupportedAuth = 14,
    SupportedEncrypt = 15,
    SpiRange = 16,
    Policy = 18,
}

impl ExtType {
    /// Number of slots in an [`ExtensionMap`].
    const SLOTS: usize = 19;

    /// Parse a wire extension type.
    pub fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            1 => Self::Sa,
            2 => Self::LifetimeCurrent,
            3 => Self::LifetimeHard,
            4 => Self::LifetimeSoft,
            5 => Self::AddressSrc,
            6 => Self::AddressDst,
            7 => Self::AddressProxy,
            8 => Self::KeyAuth,
            9 => Self::KeyEncrypt,
            10 => Self::IdentitySrc,
            11 => Self::IdentityDst,
            12 => Self::Sensitivity,
            13 => Self::Proposal,
            14 => Self::SupportedAuth,
            15 => Self::SupportedEncrypt,
            16 => Self::SpiRange,
            18 => Self::Policy,
            _ => return None,
        })
    }

    /// Smallest legal record length in bytes, header included.
    pub fn min_len(self) -> usize {
        match self {
            Self::Sa => size_of::<SadbSa>(),
            Self::LifetimeCurrent | Self::LifetimeHard | Self::LifetimeSoft => {
                size_of::<SadbLifetime>()
            }
            Self::AddressSrc | Self::AddressDst | Self::AddressProxy => {
                size_of::<SadbAddress>() + size_of::<SockaddrIn>()
            }
            Self::KeyAuth | Self::KeyEncrypt => size_of::<SadbKey>(),
            Self::IdentitySrc | Self::IdentityDst => size_of::<SadbIdent>(),
            Self::Sensitivity => SADB_SENS_LEN,
            Self::Proposal => size_of::<SadbProp>(),
            Self::SupportedAuth | Self::SupportedEncrypt => size_of::<SadbSupported>(),
            Self::SpiRange => size_of::<SadbSpirange>(),
            Self::Policy => size_of::<SadbXPolicy>(),
        }
    }

    /// Largest legal record length in bytes, for fixed-size records.
    pub fn max_len(self) -> Option<usize> {
        match self {
            Self::Sa => Some(size_of::<SadbSa>()),
            Self::LifetimeCurrent | Self::LifetimeHard | Self::LifetimeSoft => {
                Some(size_of::<SadbLifetime>())
            }
            Self::SpiRange => Some(size_of::<SadbSpirange>()),
            _ => None,
        }
    }
}

// ============================================================================
// Wire layouts
// ============================================================================

/// Generic extension header (mirrors struct sadb_ext).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SadbExt {
    pub len: u16,
    pub ext_type: u16,
}

/// struct sadb_sa.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SadbSa {
    pub len: u16,
    pub ext_type: u16,
    /// SPI in network byte order.
    pub spi: u32,
    pub replay: u8,
    pub state: u8,
    pub auth: u8,
    pub encrypt: u8,
    pub flags: u32,
}

/// struct sadb_lifetime.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SadbLifetime {
    pub len: u16,
    pub ext_type: u16,
    pub allocations: u32,
    pub bytes: u64,
    pub addtime: u64,
    pub usetime: u64,
}

/// struct sadb_address, followed by a socket address.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SadbAddress {
    pub len: u16,
    pub ext_type: u16,
    pub proto: u8,
    pub prefixlen: u8,
    pub reserved: u16,
}

/// struct sadb_key, followed by the key bits.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SadbKey {
    pub len: u16,
    pub ext_type: u16,
    pub bits: u16,
    pub reserved: u16,
}

/// struct sadb_ident, followed by an optional identity string.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SadbIdent {
    pub len: u16,
    pub ext_type: u16,
    pub ident_type: u16,
    pub reserved: u16,
    pub id: u64,
}

/// Fixed part of struct sadb_sens.
pub const SADB_SENS_LEN: usize = 16;

/// struct sadb_prop, followed by combinations.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SadbProp {
    pub len: u16,
    pub ext_type: u16,
    pub replay: u8,
    pub reserved: [u8; 3],
}

/// struct sadb_comb.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SadbComb {
    pub auth: u8,
    pub encrypt: u8,
    pub flags: u16,
    pub auth_minbits: u16,
    pub auth_maxbits: u16,
    pub encrypt_minbits: u16,
    pub encrypt_maxbits: u16,
    pub reserved: u32,
    pub soft_allocations: u32,
    pub hard_allocations: u32,
    pub soft_bytes: u64,
    pub hard_bytes: u64,
    pub soft_addtime: u64,
    pub hard_addtime: u64,
    pub soft_usetime: u64,
    pub hard_usetime: u64,
}

/// struct sadb_supported, followed by algorithm descriptors.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SadbSupported {
    pub len: u16,
    pub ext_type: u16,
    pub reserved: u32,
}

/// struct sadb_alg.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SadbAlg {
    pub id: u8,
    pub ivlen: u8,
    pub minbits: u16,
    pub maxbits: u16,
    pub reserved: u16,
}

/// struct sadb_spirange.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SadbSpirange {
    pub len: u16,
    pub ext_type: u16,
    pub min: u32,
    pub max: u32,
    pub reserved: u32,
}

/// struct sadb_x_policy, followed by IPsec requests.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SadbXPolicy {
    pub len: u16,
    pub ext_type: u16,
    pub policy_type: u16,
    pub dir: u8,
    pub reserved: u8,
    pub id: u32,
    pub priority: u32,
}

/// struct sadb_x_ipsecrequest. `len` counts bytes, not 64-bit units, and
/// covers a trailing tunnel endpoint address when present.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SadbXIpsecRequest {
    pub len: u16,
    pub proto: u16,
    pub mode: u8,
    pub level: u8,
    pub reqid: u16,
}

/// struct sockaddr_in with a BSD length byte.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SockaddrIn {
    pub len: u8,
    pub family: u8,
    /// Port in network byte order.
    pub port: [u8; 2],
    pub addr: [u8; 4],
    pub zero: [u8; 8],
}

/// struct sockaddr_in6 with a BSD length byte.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SockaddrIn6 {
    pub len: u8,
    pub family: u8,
    /// Port in network byte order.
    pub port: [u8; 2],
    pub flowinfo: [u8; 4],
    pub addr: [u8; 16],
    pub scope_id: [u8; 4],
}

/// Policy direction numbers in the policy extension.
pub mod policy_dir {
    pub const ANY: u8 = 0;
    pub const INBOUND: u8 = 1;
    pub const OUTBOUND: u8 = 2;
}

// ============================================================================
// Decoded values
// ============================================================================

/// SA flag bits.
pub mod sa_flags {
    /// Old-style (RFC 1827/1829) transform; no replay window.
    pub const OLD: u32 = 0x0001;
    /// Derived IV.
    pub const DERIV: u32 = 0x0010;
    /// 4-byte IV.
    pub const IV4B: u32 = 0x0020;
    /// Compression parameter index is used verbatim.
    pub const RAWCPI: u32 = 0x0080;
}

/// SA extension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaExt {
    pub spi: u32,
    pub replay: u8,
    pub state: u8,
    pub auth: u8,
    pub encrypt: u8,
    pub flags: u32,
}

/// Lifetime extension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LifetimeExt {
    pub allocations: u32,
    pub bytes: u64,
    pub add_time: u64,
    pub use_time: u64,
}

/// Address extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressExt {
    /// Upper-layer protocol.
    pub proto: u8,
    pub prefix: u8,
    pub addr: IpAddr,
    pub port: u16,
}

impl AddressExt {
    /// Full-length host address with wildcard protocol and port.
    pub fn host(addr: IpAddr) -> Self {
        Self {
            proto: 0,
            prefix: AddressFamily::of(&addr).bits(),
            addr,
            port: 0,
        }
    }

    /// Address family.
    pub fn family(&self) -> AddressFamily {
        AddressFamily::of(&self.addr)
    }
}

/// Key material. Its `Debug` output never includes the key bytes.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct KeyMaterial {
    pub bits: u16,
    pub data: Vec<u8>,
}

impl KeyMaterial {
    /// Key material whose bit length is the full length of `data`.
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        let data = data.into();
        Self {
            bits: (data.len() * 8) as u16,
            data,
        }
    }

    /// Whether the key has no bits.
    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyMaterial {{ bits: {}, data: <redacted> }}", self.bits)
    }
}

/// Identity extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityExt {
    pub ident_type: u16,
    pub id: u64,
    pub data: Vec<u8>,
}

/// Proposal extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposalExt {
    pub replay: u8,
    pub combs: Vec<SadbComb>,
}

/// One entry of a supported-algorithms extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlgorithmDesc {
    pub id: u8,
    pub ivlen: u8,
    pub min_bits: u16,
    pub max_bits: u16,
}

impl From<AlgorithmInfo> for AlgorithmDesc {
    fn from(a: AlgorithmInfo) -> Self {
        Self {
            id: a.id,
            ivlen: a.ivlen,
            min_bits: a.min_bits,
            max_bits: a.max_bits,
        }
    }
}

/// SPI range extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiRangeExt {
    pub min: u32,
    pub max: u32,
}

/// Policy extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyExt {
    pub kind: PolicyKind,
    pub dir: u8,
    pub id: u32,
    pub priority: u32,
    pub requests: Vec<RequestSpec>,
}

impl PolicyExt {
    /// Policy extension without requests.
    pub fn new(kind: PolicyKind) -> Self {
        Self {
            kind,
            dir: policy_dir::ANY,
            id: 0,
            priority: 0,
            requests: Vec::new(),
        }
    }
}

/// A decoded extension record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extension {
    Sa(SaExt),
    Lifetime(LifetimeExt),
    Address(AddressExt),
    Key(KeyMaterial),
    Identity(IdentityExt),
    Sensitivity(Vec<u8>),
    Proposal(ProposalExt),
    Supported(Vec<AlgorithmDesc>),
    SpiRange(SpiRangeExt),
    Policy(PolicyExt),
}

// ============================================================================
// ExtensionMap
// ============================================================================

/// At most one decoded extension per type.
#[derive(Debug, Clone, Default)]
pub struct ExtensionMap {
    slots: [Option<Extension>; ExtType::SLOTS],
}

impl ExtensionMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an extension, rejecting a second record of the same type.
    pub fn insert(&mut self, ty: ExtType, ext: Extension) -> Result<()> {
        let slot = &mut self.slots[ty as usize];
        if slot.is_some() {
            return Err(Error::malformed(format!("duplicate extension {ty:?}")));
        }
        *slot = Some(ext);
        Ok(())
    }

    /// Raw access by type.
    pub fn get(&self, ty: ExtType) -> Option<&Extension> {
        self.slots[ty as usize].as_ref()
    }

    /// Whether a record of this type is present.
    pub fn contains(&self, ty: ExtType) -> bool {
        self.get(ty).is_some()
    }

    /// Whether no records are present.
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// Present records in type order.
    pub fn iter(&self) -> impl Iterator<Item = (ExtType, &Extension)> {
        self.slots.iter().enumerate().filter_map(|(i, e)| {
            let ty = ExtType::from_u16(i as u16)?;
            e.as_ref().map(|e| (ty, e))
        })
    }

    pub fn sa(&self) -> Option<&SaExt> {
        match self.get(ExtType::Sa) {
            Some(Extension::Sa(v)) => Some(v),
            _ => None,
        }
    }

    pub fn lifetime(&self, ty: ExtType) -> Option<&LifetimeExt> {
        match self.get(ty) {
            Some(Extension::Lifetime(v)) => Some(v),
            _ => None,
        }
    }

    pub fn address(&self, ty: ExtType) -> Option<&AddressExt> {
        match self.get(ty) {
            Some(Extension::Address(v)) => Some(v),
            _ => None,
        }
    }

    pub fn src(&self) -> Option<&AddressExt> {
        self.address(ExtType::AddressSrc)
    }

    pub fn dst(&self) -> Option<&AddressExt> {
        self.address(ExtType::AddressDst)
    }

    pub fn proxy(&self) -> Option<&AddressExt> {
        self.address(ExtType::AddressProxy)
    }

    pub fn key(&self, ty: ExtType) -> Option<&KeyMaterial> {
        match self.get(ty) {
            Some(Extension::Key(v)) => Some(v),
            _ => None,
        }
    }

    pub fn proposal(&self) -> Option<&ProposalExt> {
        match self.get(ExtType::Proposal) {
            Some(Extension::Proposal(v)) => Some(v),
            _ => None,
        }
    }

    pub fn spirange(&self) -> Option<&SpiRangeExt> {
        match self.get(ExtType::SpiRange) {
            Some(Extension::SpiRange(v)) => Some(v),
            _ => None,
        }
    }

    pub fn policy(&self) -> Option<&PolicyExt> {
        match self.get(ExtType::Policy) {
            Some(Extension::Policy(v)) => Some(v),
            _ => None,
        }
    }

    pub fn supported(&self, ty: ExtType) -> Option<&[AlgorithmDesc]> {
        match self.get(ty) {
            Some(Extension::Supported(v)) => Some(v),
            _ => None,
        }
    }
}

// ============================================================================
// Decoding
// ============================================================================

fn read<T: FromBytes>(data: &[u8]) -> Result<(T, &[u8])> {
    T::read_from_prefix(data).map_err(|_| Error::Truncated {
        expected: size_of::<T>(),
        actual: data.len(),
    })
}

/// Decode a socket address. Returns the address, port and bytes consumed
/// (the BSD length rounded up to 64-bit alignment, capped at the input).
pub fn decode_sockaddr(data: &[u8]) -> Result<(IpAddr, u16, usize)> {
    let (&sa_len, rest) = data
        .split_first()
        .ok_or_else(|| Error::malformed("empty socket address"))?;
    let family = rest
        .first()
        .copied()
        .and_then(AddressFamily::from_number)
        .ok_or_else(|| Error::malformed("unsupported address family"))?;

    let (addr, port, need) = match family {
        AddressFamily::Inet => {
            let (sin, _) = read::<SockaddrIn>(data)?;
            (
                IpAddr::V4(Ipv4Addr::from(sin.addr)),
                u16::from_be_bytes(sin.port),
                size_of::<SockaddrIn>(),
            )
        }
        AddressFamily::Inet6 => {
            let (sin6, _) = read::<SockaddrIn6>(data)?;
            (
                IpAddr::V6(Ipv6Addr::from(sin6.addr)),
                u16::from_be_bytes(sin6.port),
                size_of::<SockaddrIn6>(),
            )
        }
    };
    if usize::from(sa_len) < need {
        return Err(Error::malformed(format!(
            "socket address length {sa_len} shorter than {need}"
        )));
    }
    Ok((addr, port, sadb_align(usize::from(sa_len)).min(data.len())))
}

/// Append a socket address, padded to 64-bit alignment.
pub fn encode_sockaddr(out: &mut Vec<u8>, addr: &IpAddr, port: u16) {
    match addr {
        IpAddr::V4(v4) => {
            let sin = SockaddrIn {
                len: size_of::<SockaddrIn>() as u8,
                family: AddressFamily::Inet.number(),
                port: port.to_be_bytes(),
                addr: v4.octets(),
                zero: [0; 8],
            };
            out.extend_from_slice(sin.as_bytes());
        }
        IpAddr::V6(v6) => {
            let sin6 = SockaddrIn6 {
                len: size_of::<SockaddrIn6>() as u8,
                family: AddressFamily::Inet6.number(),
                port: port.to_be_bytes(),
                flowinfo: [0; 4],
                addr: v6.octets(),
                scope_id: [0; 4],
            };
            out.extend_from_slice(sin6.as_bytes());
        }
    }
    out.resize(sadb_align(out.len()), 0);
}

impl Extension {
    /// Decode one record (header included) of a known type.
    pub fn decode(ty: ExtType, record: &[u8]) -> Result<Self> {
        Ok(match ty {
            ExtType::Sa => {
                let (sa, _) = read::<SadbSa>(record)?;
                Self::Sa(SaExt {
                    spi: u32::from_be(sa.spi),
                    replay: sa.replay,
                    state: sa.state,
                    auth: sa.auth,
                    encrypt: sa.encrypt,
                    flags: sa.flags,
                })
            }
            ExtType::LifetimeCurrent | ExtType::LifetimeHard | ExtType::LifetimeSoft => {
                let (lt, _) = read::<SadbLifetime>(record)?;
                Self::Lifetime(LifetimeExt {
                    allocations: lt.allocations,
                    bytes: lt.bytes,
                    add_time: lt.addtime,
                    use_time: lt.usetime,
                })
            }
            ExtType::AddressSrc | ExtType::AddressDst | ExtType::AddressProxy => {
                let (hdr, rest) = read::<SadbAddress>(record)?;
                let (addr, port, _) = decode_sockaddr(rest)?;
                if hdr.prefixlen > AddressFamily::of(&addr).bits() {
                    return Err(Error::malformed(format!(
                        "prefix length {} too long for {addr}",
                        hdr.prefixlen
                    )));
                }
                Self::Address(AddressExt {
                    proto: hdr.proto,
                    prefix: hdr.prefixlen,
                    addr,
                    port,
                })
            }
            ExtType::KeyAuth | ExtType::KeyEncrypt => {
                let (hdr, rest) = read::<SadbKey>(record)?;
                let bytes = usize::from(hdr.bits).div_ceil(8);
                let data = rest.get(..bytes).ok_or_else(|| {
                    Error::malformed(format!("key of {} bits does not fit its record", hdr.bits))
                })?;
                Self::Key(KeyMaterial {
                    bits: hdr.bits,
                    data: data.to_vec(),
                })
            }
            ExtType::IdentitySrc | ExtType::IdentityDst => {
                let (hdr, rest) = read::<SadbIdent>(record)?;
                let end = rest.iter().rposition(|b| *b != 0).map_or(0, |p| p + 1);
                Self::Identity(IdentityExt {
                    ident_type: hdr.ident_type,
                    id: hdr.id,
                    data: rest[..end].to_vec(),
                })
            }
            ExtType::Sensitivity => Self::Sensitivity(
                record
                    .get(SADB_EXT_HDRLEN..)
                    .ok_or(Error::Truncated {
                        expected: SADB_SENS_LEN,
                        actual: record.len(),
                    })?
                    .to_vec(),
            ),
            ExtType::Proposal => {
                let (hdr, mut rest) = read::<SadbProp>(record)?;
                if rest.len() % size_of::<SadbComb>() != 0 {
                    return Err(Error::malformed("proposal with a partial combination"));
                }
                let mut combs = Vec::with_capacity(rest.len() / size_of::<SadbComb>());
                while !rest.is_empty() {
                    let (comb, tail) = read::<SadbComb>(rest)?;
                    combs.push(comb);
                    rest = tail;
                }
                Self::Proposal(ProposalExt {
                    replay: hdr.replay,
                    combs,
                })
            }
            ExtType::SupportedAuth | ExtType::SupportedEncrypt => {
                let (_, mut rest) = read::<SadbSupported>(record)?;
                if rest.len() % size_of::<SadbAlg>() != 0 {
                    return Err(Error::malformed("supported list with a partial entry"));
                }
                let mut algs = Vec::new();
                while !rest.is_empty() {
                    let (alg, tail) = read::<SadbAlg>(rest)?;
                    algs.push(AlgorithmDesc {
                        id: alg.id,
                        ivlen: alg.ivlen,
                        min_bits: alg.minbits,
                        max_bits: alg.maxbits,
                    });
                    rest = tail;
                }
                Self::Supported(algs)
            }
            ExtType::SpiRange => {
                let (r, _) = read::<SadbSpirange>(record)?;
                Self::SpiRange(SpiRangeExt {
                    min: r.min,
                    max: r.max,
                })
            }
            ExtType::Policy => Self::Policy(decode_policy(record)?),
        })
    }
}

fn decode_policy(record: &[u8]) -> Result<PolicyExt> {
    let (hdr, mut rest) = read::<SadbXPolicy>(record)?;
    let kind = PolicyKind::from_u16(hdr.policy_type)
        .ok_or_else(|| Error::malformed(format!("unknown policy type {}", hdr.policy_type)))?;

    let mut requests = Vec::new();
    while rest.len() >= size_of::<SadbXIpsecRequest>() {
        let (req, _) = read::<SadbXIpsecRequest>(rest)?;
        let len = usize::from(req.len);
        if len < size_of::<SadbXIpsecRequest>() || len > rest.len() {
            return Err(Error::malformed(format!("bad IPsec request length {len}")));
        }
        if kind != PolicyKind::Ipsec {
            return Err(Error::malformed("IPsec request on a non-IPsec policy"));
        }

        let protocol = IpsecProtocol::from_number(req.proto)
            .ok_or_else(|| Error::malformed(format!("unknown request protocol {}", req.proto)))?;
        let mode = match Mode::from_u8(req.mode) {
            Some(m @ (Mode::Transport | Mode::Tunnel)) => m,
            _ => return Err(Error::malformed(format!("bad request mode {}", req.mode))),
        };
        let level = Level::from_u8(req.level)
            .ok_or_else(|| Error::malformed(format!("bad request level {}", req.level)))?;

        let body = &rest[size_of::<SadbXIpsecRequest>()..len];
        let proxy = if body.is_empty() {
            None
        } else {
            Some(decode_sockaddr(body)?.0)
        };
        if mode == Mode::Tunnel && proxy.is_none() {
            return Err(Error::malformed("tunnel request without an endpoint"));
        }

        requests.push(RequestSpec {
            protocol,
            mode,
            level,
            reqid: req.reqid,
            proxy,
        });
        rest = &rest[len..];
    }
    if rest.iter().any(|b| *b != 0) {
        return Err(Error::malformed("trailing bytes after IPsec requests"));
    }

    Ok(PolicyExt {
        kind,
        dir: hdr.dir,
        id: hdr.id,
        priority: hdr.priority,
        requests,
    })
}

// ============================================================================
// Encoding
// ============================================================================

fn patch_len(out: &mut [u8], start: usize) {
    let units = to_units(out.len() - start);
    out[start..start + 2].copy_from_slice(&units.to_ne_bytes());
}

impl Extension {
    /// Append this record, header included, padded to 64-bit alignment.
    pub fn encode(&self, ty: ExtType, out: &mut Vec<u8>) {
        let start = out.len();
        let ext_type = ty as u16;
        match self {
            Self::Sa(sa) => {
                let wire = SadbSa {
                    len: 0,
                    ext_type,
                    spi: sa.spi.to_be(),
                    replay: sa.replay,
                    state: sa.state,
                    auth: sa.auth,
                    encrypt: sa.encrypt,
                    flags: sa.flags,
                };
                out.extend_from_slice(wire.as_bytes());
            }
            Self::Lifetime(lt) => {
                let wire = SadbLifetime {
                    len: 0,
                    ext_type,
                    allocations: lt.allocations,
                    bytes: lt.bytes,
                    addtime: lt.add_time,
                    usetime: lt.use_time,
                };
                out.extend_from_slice(wire.as_bytes());
            }
            Self::Address(a) => {
                let wire = SadbAddress {
                    len: 0,
                    ext_type,
                    proto: a.proto,
                    prefixlen: a.prefix,
                    reserved: 0,
                };
                out.extend_from_slice(wire.as_bytes());
                encode_sockaddr(out, &a.addr, a.port);
            }
            Self::Key(k) => {
                let wire = SadbKey {
                    len: 0,
                    ext_type,
                    bits: k.bits,
                    reserved: 0,
                };
                out.extend_from_slice(wire.as_bytes());
                out.extend_from_slice(&k.data);
            }
            Self::Identity(id) => {
                let wire = SadbIdent {
                    len: 0,
                    ext_type,
                    ident_type: id.ident_type,
                    reserved: 0,
                    id: id.id,
                };
                out.extend_from_slice(wire.as_bytes());
                out.extend_from_slice(&id.data);
            }
            Self::Sensitivity(raw) => {
                let wire = SadbExt { len: 0, ext_type };
                out.extend_from_slice(wire.as_bytes());
                out.extend_from_slice(raw);
                let fixed = start + SADB_SENS_LEN;
                if out.len() < fixed {
                    out.resize(fixed, 0);
                }
            }
            Self::Proposal(p) => {
                let wire = SadbProp {
                    len: 0,
                    ext_type,
                    replay: p.replay,
                    reserved: [0; 3],
                };
                out.extend_from_slice(wire.as_bytes());
                for comb in &p.combs {
                    out.extend_from_slice(comb.as_bytes());
                }
            }
            Self::Supported(algs) => {
                let wire = SadbSupported {
                    len: 0,
                    ext_type,
                    reserved: 0,
                };
                out.extend_from_slice(wire.as_bytes());
                for a in algs {
                    let alg = SadbAlg {
                        id: a.id,
                        ivlen: a.ivlen,
                        minbits: a.min_bits,
                        maxbits: a.max_bits,
                        reserved: 0,
                    };
                    out.extend_from_slice(alg.as_bytes());
                }
            }
            Self::SpiRange(r) => {
                let wire = SadbSpirange {
                    len: 0,
                    ext_type,
                    min: r.min,
                    max: r.max,
                    reserved: 0,
                };
                out.extend_from_slice(wire.as_bytes());
            }
            Self::Policy(p) => {
                let wire = SadbXPolicy {
                    len: 0,
                    ext_type,
                    policy_type: p.kind.number(),
                    dir: p.dir,
                    reserved: 0,
                    id: p.id,
                    priority: p.priority,
                };
                out.extend_from_slice(wire.as_bytes());
                for req in &p.requests {
                    let req_start = out.len();
                    let wire = SadbXIpsecRequest {
                        len: 0,
                        proto: req.protocol.number(),
                        mode: req.mode.number(),
                        level: req.level.number(),
                        reqid: req.reqid,
                    };
                    out.extend_from_slice(wire.as_bytes());
                    if let Some(proxy) = &req.proxy {
                        encode_sockaddr(out, proxy, 0);
                    }
                    let req_len = (out.len() - req_start) as u16;
                    out[req_start..req_start + 2].copy_from_slice(&req_len.to_ne_bytes());
                }
            }
        }
        out.resize(start + sadb_align(out.len() - start), 0);
        patch_len(out, start);
    }
}

/// Length in bytes of the record starting at `data`, from its header.
pub fn record_len(hdr: &SadbExt) -> usize {
    from_units(hdr.len)
}

const _: () = assert!(size_of::<SadbExt>() == SADB_EXT_HDRLEN);
const _: () = assert!(size_of::<SadbSa>() % SADB_ALIGNTO == 0);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_sizes() {
        assert_eq!(size_of::<SadbSa>(), 16);
        assert_eq!(size_of::<SadbLifetime>(), 32);
        assert_eq!(size_of::<SadbAddress>(), 8);
        assert_eq!(size_of::<SadbKey>(), 8);
        assert_eq!(size_of::<SadbIdent>(), 16);
        assert_eq!(size_of::<SadbProp>(), 8);
        assert_eq!(size_of::<SadbComb>(), 72);
        assert_eq!(size_of::<SadbSupported>(), 8);
        assert_eq!(size_of::<SadbAlg>(), 8);
        assert_eq!(size_of::<SadbSpirange>(), 16);
        assert_eq!(size_of::<SadbXPolicy>(), 16);
        assert_eq!(size_of::<SadbXIpsecRequest>(), 8);
        assert_eq!(size_of::<SockaddrIn>(), 16);
        assert_eq!(size_of::<SockaddrIn6>(), 28);
    }

    fn encode(ty: ExtType, ext: &Extension) -> Vec<u8> {
        let mut out = Vec::new();
        ext.encode(ty, &mut out);
        assert_eq!(out.len() % SADB_ALIGNTO, 0);
        out
    }

    #[test]
    fn test_sa_spi_is_network_order() {
        let ext = Extension::Sa(SaExt {
            spi: 0x1234_5678,
            ..Default::default()
        });
        let bytes = encode(ExtType::Sa, &ext);
        assert_eq!(&bytes[4..8], &[0x12, 0x34, 0x56, 0x78]);
        assert_eq!(Extension::decode(ExtType::Sa, &bytes).unwrap(), ext);
    }

    #[test]
    fn test_address_v6_padding() {
        let ext = Extension::Address(AddressExt {
            proto: 17,
            prefix: 64,
            addr: "2001:db8::1".parse().unwrap(),
            port: 500,
        });
        let bytes = encode(ExtType::AddressDst, &ext);
        // 8 header + 28 sockaddr_in6 rounded up to 32.
        assert_eq!(bytes.len(), 40);
        assert_eq!(u16::from_ne_bytes([bytes[0], bytes[1]]), 5);
        assert_eq!(Extension::decode(ExtType::AddressDst, &bytes).unwrap(), ext);
    }

    #[test]
    fn test_address_prefix_too_long() {
        let ext = Extension::Address(AddressExt {
            proto: 0,
            prefix: 33,
            addr: "10.0.0.1".parse().unwrap(),
            port: 0,
        });
        let bytes = encode(ExtType::AddressSrc, &ext);
        assert!(Extension::decode(ExtType::AddressSrc, &bytes).is_err());
    }

    #[test]
    fn test_key_does_not_fit() {
        let mut bytes = encode(ExtType::KeyAuth, &Extension::Key(KeyMaterial::new(vec![1; 16])));
        // Claim more bits than the record holds.
        bytes[4..6].copy_from_slice(&1024u16.to_ne_bytes());
        assert!(Extension::decode(ExtType::KeyAuth, &bytes).is_err());
    }

    #[test]
    fn test_key_debug_is_redacted() {
        let key = KeyMaterial::new(vec![0xde, 0xad, 0xbe, 0xef]);
        let shown = format!("{key:?}");
        assert!(shown.contains("bits: 32"));
        assert!(!shown.contains("222"));
        assert!(!shown.contains("173"));
    }

    #[test]
    fn test_policy_with_tunnel_request() {
        let ext = Extension::Policy(PolicyExt {
            kind: PolicyKind::Ipsec,
            dir: policy_dir::OUTBOUND,
            id: 7,
            priority: 0,
            requests: vec![
                RequestSpec::transport(IpsecProtocol::Ah),
                RequestSpec::tunnel(IpsecProtocol::Esp, "192.0.2.1".parse().unwrap()),
            ],
        });
        let bytes = encode(ExtType::Policy, &ext);
        assert_eq!(Extension::decode(ExtType::Policy, &bytes).unwrap(), ext);
    }

    #[test]
    fn test_policy_rejects_requests_on_discard() {
        let mut p = PolicyExt::new(PolicyKind::Ipsec);
        p.requests.push(RequestSpec::transport(IpsecProtocol::Esp));
        let mut bytes = encode(ExtType::Policy, &Extension::Policy(p));
        bytes[4..6].copy_from_slice(&PolicyKind::Discard.number().to_ne_bytes());
        assert!(Extension::decode(ExtType::Policy, &bytes).is_err());
    }

    #[test]
    fn test_map_rejects_duplicates() {
        let mut map = ExtensionMap::new();
        let spi = Extension::SpiRange(SpiRangeExt { min: 1, max: 2 });
        map.insert(ExtType::SpiRange, spi.clone()).unwrap();
        assert!(map.insert(ExtType::SpiRange, spi).is_err());
        assert_eq!(map.spirange(), Some(&SpiRangeExt { min: 1, max: 2 }));
        assert_eq!(map.iter().count(), 1);
    }
}
