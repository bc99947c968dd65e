//! Direction classification.
//!
//! Whether an SA group or policy is inbound, outbound or both depends on
//! which of its addresses belong to this host. Address ownership is a
//! collaborator capability ([`AddressOracle`]); the mapping from address
//! classes to a direction is the fixed [`DIRECTION_TABLE`].

use std::net::IpAddr;

use super::index::{AddressFamily, SecurityIndex};

/// Answers "is this address mine" questions for the engine.
pub trait AddressOracle: Send + Sync {
    /// Whether `addr` is configured on a local interface.
    fn is_my_address(&self, addr: &IpAddr) -> bool;

    /// Whether `addr/prefix` lies inside a subnet attached to this host.
    fn is_my_subnet(&self, addr: &IpAddr, prefix: u8) -> bool;

    /// Whether `addr` is a loopback address.
    fn is_loopback(&self, addr: &IpAddr) -> bool {
        addr.is_loopback()
    }
}

/// An oracle that owns nothing. Every address classifies as `Other`
/// except loopback.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLocalAddresses;

impl AddressOracle for NoLocalAddresses {
    fn is_my_address(&self, _addr: &IpAddr) -> bool {
        false
    }

    fn is_my_subnet(&self, _addr: &IpAddr, _prefix: u8) -> bool {
        false
    }
}

/// A fixed set of local prefixes. Each `(addr, prefix)` entry is a local
/// interface address together with the length of its attached subnet.
#[derive(Debug, Clone, Default)]
pub struct StaticAddresses {
    entries: Vec<(IpAddr, u8)>,
}

impl StaticAddresses {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a local address with its subnet prefix length.
    pub fn with(mut self, addr: IpAddr, prefix: u8) -> Self {
        self.entries.push((addr, prefix));
        self
    }
}

impl AddressOracle for StaticAddresses {
    fn is_my_address(&self, addr: &IpAddr) -> bool {
        self.entries.iter().any(|(a, _)| a == addr)
    }

    fn is_my_subnet(&self, addr: &IpAddr, prefix: u8) -> bool {
        self.entries.iter().any(|(a, len)| {
            *len <= prefix && super::index::prefix_match(a, addr, *len)
        })
    }
}

/// Ownership class of a single address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressClass {
    /// Address not supplied.
    None = 0,
    MyAddress = 1,
    MySubnet = 2,
    Other = 3,
}

/// Direction of an SA group or policy relative to this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
    Bidirectional,
}

impl Direction {
    /// All directions, in the order collections are scanned.
    pub const ALL: [Direction; 3] = [Self::Inbound, Self::Outbound, Self::Bidirectional];

    pub(crate) fn slot(self) -> usize {
        match self {
            Self::Inbound => 0,
            Self::Outbound => 1,
            Self::Bidirectional => 2,
        }
    }

    /// Whether this direction receives traffic.
    pub fn is_inbound(self) -> bool {
        matches!(self, Self::Inbound | Self::Bidirectional)
    }
}

/// Result of a table lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolved {
    Direction(Direction),
    Invalid,
}

impl Resolved {
    /// The direction, if the lookup resolved to one.
    pub fn direction(self) -> Option<Direction> {
        match self {
            Self::Direction(d) => Some(d),
            Self::Invalid => None,
        }
    }
}

const X: Resolved = Resolved::Invalid;
const IN: Resolved = Resolved::Direction(Direction::Inbound);
const OUT: Resolved = Resolved::Direction(Direction::Outbound);
const BI: Resolved = Resolved::Direction(Direction::Bidirectional);

/// `DIRECTION_TABLE[src][dst][proxy]`, indexed by [`AddressClass`] in
/// the order None, MyAddress, MySubnet, Other.
pub const DIRECTION_TABLE: [[[Resolved; 4]; 4]; 4] = [
    // src None
    [[X, X, X, X], [X, X, X, X], [X, X, X, X], [X, X, X, X]],
    // src MyAddress
    [
        [X, X, X, X],
        [BI, BI, BI, BI],
        [BI, BI, BI, BI],
        [OUT, OUT, OUT, OUT],
    ],
    // src MySubnet
    [
        [X, X, X, X],
        [BI, BI, BI, BI],
        [BI, BI, BI, BI],
        [OUT, OUT, OUT, OUT],
    ],
    // src Other
    [
        [X, X, X, X],
        [IN, IN, IN, IN],
        [IN, IN, IN, IN],
        // Traffic between two foreign hosts is only ours when it is
        // tunnelled to one of our addresses.
        [X, IN, IN, X],
    ],
];

/// Classify one address. `prefix` is the selector's prefix length for it.
pub fn classify_address(
    oracle: &dyn AddressOracle,
    addr: Option<&IpAddr>,
    prefix: u8,
) -> AddressClass {
    let Some(addr) = addr else {
        return AddressClass::None;
    };
    let full = AddressFamily::of(addr).bits();
    if prefix >= full && (oracle.is_loopback(addr) || oracle.is_my_address(addr)) {
        return AddressClass::MyAddress;
    }
    if oracle.is_my_subnet(addr, prefix.min(full)) {
        return AddressClass::MySubnet;
    }
    AddressClass::Other
}

/// Resolve the direction of a selector and optional tunnel proxy.
pub fn classify_direction(
    oracle: &dyn AddressOracle,
    index: &SecurityIndex,
    proxy: Option<&IpAddr>,
) -> Resolved {
    let src = classify_address(oracle, Some(&index.src), index.src_prefix);
    let dst = classify_address(oracle, Some(&index.dst), index.dst_prefix);
    let proxy = proxy.map_or(AddressClass::None, |p| {
        classify_address(oracle, Some(p), AddressFamily::of(p).bits())
    });
    DIRECTION_TABLE[src as usize][dst as usize][proxy as usize]
}

/// Direction lookup used by GetSpi: a foreign-to-foreign selector with no
/// proxy is accepted as inbound, on the expectation that a later Update
/// supplies the proxy.
pub fn classify_direction_for_getspi(
    oracle: &dyn AddressOracle,
    index: &SecurityIndex,
    proxy: Option<&IpAddr>,
) -> Resolved {
    let resolved = classify_direction(oracle, index, proxy);
    if resolved == Resolved::Invalid && proxy.is_none() {
        let src = classify_address(oracle, Some(&index.src), index.src_prefix);
        let dst = classify_address(oracle, Some(&index.dst), index.dst_prefix);
        if src == AddressClass::Other && dst == AddressClass::Other {
            return IN;
        }
    }
    resolved
}
