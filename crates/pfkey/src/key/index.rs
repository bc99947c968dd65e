//! Traffic selectors.
//!
//! A [`SecurityIndex`] names the traffic a policy or SA group applies to:
//! address family, source and destination prefixes, upper-layer protocol
//! and ports. Zero in the protocol or port fields is a wildcard when the
//! index is used as a pattern.

use std::fmt;
use std::net::IpAddr;

/// Upper-layer protocol value meaning "any".
pub const PROTO_ANY: u8 = 0;

/// Port value meaning "any".
pub const PORT_ANY: u16 = 0;

/// Address family of a selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    Inet,
    Inet6,
}

impl AddressFamily {
    /// Family of an address.
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::Inet,
            IpAddr::V6(_) => Self::Inet6,
        }
    }

    /// Address width in bits.
    pub fn bits(self) -> u8 {
        match self {
            Self::Inet => 32,
            Self::Inet6 => 128,
        }
    }

    /// Socket-layer family number.
    pub fn number(self) -> u8 {
        match self {
            Self::Inet => libc::AF_INET as u8,
            Self::Inet6 => libc::AF_INET6 as u8,
        }
    }

    /// Parse a socket-layer family number.
    pub fn from_number(n: u8) -> Option<Self> {
        match i32::from(n) {
            libc::AF_INET => Some(Self::Inet),
            libc::AF_INET6 => Some(Self::Inet6),
            _ => None,
        }
    }
}

/// A traffic selector.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SecurityIndex {
    pub family: AddressFamily,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_prefix: u8,
    pub dst_prefix: u8,
    pub proto: u8,
    pub src_port: u16,
    pub dst_port: u16,
}

impl SecurityIndex {
    /// Host-to-host selector with full-length prefixes and wildcard
    /// protocol and ports.
    pub fn host(src: IpAddr, dst: IpAddr) -> Self {
        let family = AddressFamily::of(&src);
        Self {
            family,
            src,
            dst,
            src_prefix: family.bits(),
            dst_prefix: family.bits(),
            proto: PROTO_ANY,
            src_port: PORT_ANY,
            dst_port: PORT_ANY,
        }
    }

    /// Network-to-network selector.
    pub fn prefixes(src: IpAddr, src_prefix: u8, dst: IpAddr, dst_prefix: u8) -> Self {
        Self {
            src_prefix,
            dst_prefix,
            ..Self::host(src, dst)
        }
    }

    /// Restrict the selector to an upper-layer protocol.
    pub fn with_proto(mut self, proto: u8) -> Self {
        self.proto = proto;
        self
    }

    /// Restrict the selector to source and destination ports.
    pub fn with_ports(mut self, src_port: u16, dst_port: u16) -> Self {
        self.src_port = src_port;
        self.dst_port = dst_port;
        self
    }

    /// Whether both addresses belong to the declared family and both
    /// prefix lengths fit the address width.
    pub fn is_well_formed(&self) -> bool {
        AddressFamily::of(&self.src) == self.family
            && AddressFamily::of(&self.dst) == self.family
            && self.src_prefix <= self.family.bits()
            && self.dst_prefix <= self.family.bits()
    }

    /// Whether `candidate` falls inside this selector used as a pattern.
    ///
    /// Protocol and ports match when this selector holds the wildcard or
    /// the same value. Addresses are compared bit-wise up to this
    /// selector's prefix lengths.
    pub fn matches(&self, candidate: &SecurityIndex) -> bool {
        if self.family != candidate.family {
            return false;
        }
        if self.proto != PROTO_ANY && self.proto != candidate.proto {
            return false;
        }
        if self.src_port != PORT_ANY && self.src_port != candidate.src_port {
            return false;
        }
        if self.dst_port != PORT_ANY && self.dst_port != candidate.dst_port {
            return false;
        }
        self.matches_addresses(&candidate.src, &candidate.dst)
    }

    /// Whether a concrete address pair falls inside this selector's
    /// prefixes, ignoring protocol and ports.
    pub fn matches_addresses(&self, src: &IpAddr, dst: &IpAddr) -> bool {
        prefix_match(&self.src, src, self.src_prefix) && prefix_match(&self.dst, dst, self.dst_prefix)
    }
}

impl fmt::Display for SecurityIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.src, self.src_prefix)?;
        if self.src_port != PORT_ANY {
            write!(f, "[{}]", self.src_port)?;
        }
        write!(f, " -> {}/{}", self.dst, self.dst_prefix)?;
        if self.dst_port != PORT_ANY {
            write!(f, "[{}]", self.dst_port)?;
        }
        if self.proto != PROTO_ANY {
            write!(f, " proto {}", self.proto)?;
        }
        Ok(())
    }
}

/// Compare two addresses over their first `bits` bits.
///
/// Addresses of different families never match.
pub fn prefix_match(pattern: &IpAddr, candidate: &IpAddr, bits: u8) -> bool {
    match (pattern, candidate) {
        (IpAddr::V4(p), IpAddr::V4(c)) => bits_equal(&p.octets(), &c.octets(), bits),
        (IpAddr::V6(p), IpAddr::V6(c)) => bits_equal(&p.octets(), &c.octets(), bits),
        _ => false,
    }
}

/// Bit-wise prefix comparison of two byte strings.
///
/// Whole bytes are compared first; a trailing partial byte is compared on
/// its high `bits % 8` bits only. A prefix longer than the inputs compares
/// the full inputs.
pub fn bits_equal(a: &[u8], b: &[u8], bits: u8) -> bool {
    let bits = usize::from(bits).min(a.len() * 8).min(b.len() * 8);
    let whole = bits / 8;
    if a[..whole] != b[..whole] {
        return false;
    }
    let rest = bits % 8;
    if rest == 0 {
        return true;
    }
    let mask = !(0xffu8 >> rest);
    (a[whole] & mask) == (b[whole] & mask)
}
