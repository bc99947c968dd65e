//! PF_KEY message header and message kinds.

use std::fmt;

use super::error::{Error, Result};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Protocol version carried in every header.
pub const PF_KEY_V2: u8 = 2;

/// Message and extension alignment.
pub const SADB_ALIGNTO: usize = 8;

/// Align a length to SADB_ALIGNTO boundary.
#[inline]
pub const fn sadb_align(len: usize) -> usize {
    (len + SADB_ALIGNTO - 1) & !(SADB_ALIGNTO - 1)
}

/// Convert a byte length into the 64-bit units used by length fields.
#[inline]
pub const fn to_units(len: usize) -> u16 {
    (sadb_align(len) / SADB_ALIGNTO) as u16
}

/// Convert a 64-bit unit count back into bytes.
#[inline]
pub const fn from_units(units: u16) -> usize {
    units as usize * SADB_ALIGNTO
}

/// Size of the message header.
pub const SADB_MSG_LEN: usize = std::mem::size_of::<SadbMsg>();

/// Message header (mirrors struct sadb_msg).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SadbMsg {
    pub version: u8,
    pub msg_type: u8,
    /// Non-zero in replies that report a failure.
    pub errno: u8,
    pub satype: u8,
    /// Total length in 64-bit units, header included.
    pub len: u16,
    pub reserved: u16,
    pub seq: u32,
    pub pid: u32,
}

impl SadbMsg {
    /// Create a header for a message of the given type.
    pub fn new(msg_type: MessageType, satype: u8) -> Self {
        Self {
            version: PF_KEY_V2,
            msg_type: msg_type as u8,
            errno: 0,
            satype,
            len: to_units(SADB_MSG_LEN),
            reserved: 0,
            seq: 0,
            pid: 0,
        }
    }

    /// Total message length in bytes.
    pub fn byte_len(&self) -> usize {
        from_units(self.len)
    }

    /// Whether the message carries nothing beyond its header.
    pub fn is_header_only(&self) -> bool {
        self.byte_len() == SADB_MSG_LEN
    }

    /// Message kind, if known.
    pub fn kind(&self) -> Option<MessageType> {
        MessageType::from_u8(self.msg_type)
    }

    /// Convert header to bytes.
    pub fn as_bytes(&self) -> &[u8] {
        <Self as IntoBytes>::as_bytes(self)
    }

    /// Parse header from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Self::read_from_prefix(data)
            .map(|(r, _)| r)
            .map_err(|_| Error::Truncated {
                expected: SADB_MSG_LEN,
                actual: data.len(),
            })
    }
}

/// Message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Reserved = 0,
    GetSpi = 1,
    Update = 2,
    Add = 3,
    Delete = 4,
    Get = 5,
    Acquire = 6,
    Register = 7,
    Expire = 8,
    Flush = 9,
    Dump = 10,
    Promisc = 11,
    PolicyChange = 12,
    PolicyUpdate = 13,
    PolicyAdd = 14,
    PolicyDelete = 15,
    PolicyGet = 16,
    PolicyAcquire = 17,
    PolicyDump = 18,
    PolicyFlush = 19,
    PolicySetIndex = 20,
    PolicyExpire = 21,
    PolicyDeleteById = 22,
}

impl MessageType {
    /// Highest known message type.
    pub const MAX: u8 = MessageType::PolicyDeleteById as u8;

    /// Parse a wire message type.
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Reserved,
            1 => Self::GetSpi,
            2 => Self::Update,
            3 => Self::Add,
            4 => Self::Delete,
            5 => Self::Get,
            6 => Self::Acquire,
            7 => Self::Register,
            8 => Self::Expire,
            9 => Self::Flush,
            10 => Self::Dump,
            11 => Self::Promisc,
            12 => Self::PolicyChange,
            13 => Self::PolicyUpdate,
            14 => Self::PolicyAdd,
            15 => Self::PolicyDelete,
            16 => Self::PolicyGet,
            17 => Self::PolicyAcquire,
            18 => Self::PolicyDump,
            19 => Self::PolicyFlush,
            20 => Self::PolicySetIndex,
            21 => Self::PolicyExpire,
            22 => Self::PolicyDeleteById,
            _ => return None,
        })
    }

    /// Whether the message operates on the policy database.
    pub fn is_policy(self) -> bool {
        (self as u8) >= Self::PolicyUpdate as u8 && self != Self::Promisc
    }

    /// Whether the message names a specific SA type and cannot use UNSPEC.
    pub fn requires_satype(self) -> bool {
        matches!(
            self,
            Self::GetSpi
                | Self::Update
                | Self::Add
                | Self::Delete
                | Self::Get
                | Self::Acquire
                | Self::Expire
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Reserved => "RESERVED",
            Self::GetSpi => "GETSPI",
            Self::Update => "UPDATE",
            Self::Add => "ADD",
            Self::Delete => "DELETE",
            Self::Get => "GET",
            Self::Acquire => "ACQUIRE",
            Self::Register => "REGISTER",
            Self::Expire => "EXPIRE",
            Self::Flush => "FLUSH",
            Self::Dump => "DUMP",
            Self::Promisc => "X_PROMISC",
            Self::PolicyChange => "X_PCHANGE",
            Self::PolicyUpdate => "X_SPDUPDATE",
            Self::PolicyAdd => "X_SPDADD",
            Self::PolicyDelete => "X_SPDDELETE",
            Self::PolicyGet => "X_SPDGET",
            Self::PolicyAcquire => "X_SPDACQUIRE",
            Self::PolicyDump => "X_SPDDUMP",
            Self::PolicyFlush => "X_SPDFLUSH",
            Self::PolicySetIndex => "X_SPDSETIDX",
            Self::PolicyExpire => "X_SPDEXPIRE",
            Self::PolicyDeleteById => "X_SPDDELETE2",
        };
        f.write_str(name)
    }
}

/// SA type numbers as they appear in the header.
pub mod satype {
    pub const UNSPEC: u8 = 0;
    pub const AH: u8 = 2;
    pub const ESP: u8 = 3;
    pub const RSVP: u8 = 5;
    pub const OSPFV2: u8 = 6;
    pub const RIPV2: u8 = 7;
    pub const MIP: u8 = 8;
    pub const IPCOMP: u8 = 9;
    pub const MAX: u8 = 9;
}

/// IPsec protocol of an SA.
///
/// ```
/// use pfkey::key::message::IpsecProtocol;
///
/// let esp = IpsecProtocol::from_satype(3).unwrap();
/// assert_eq!(esp, IpsecProtocol::Esp);
/// assert_eq!(esp.number(), 50);
/// assert_eq!(IpsecProtocol::from_number(51), Some(IpsecProtocol::Ah));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpsecProtocol {
    /// Authentication Header.
    Ah,
    /// Encapsulating Security Payload.
    Esp,
    /// IP Payload Compression.
    IpComp,
}

impl IpsecProtocol {
    /// All protocols, in registration-table order.
    pub const ALL: [IpsecProtocol; 3] = [Self::Ah, Self::Esp, Self::IpComp];

    /// Map a header satype to a protocol.
    pub fn from_satype(v: u8) -> Option<Self> {
        match v {
            satype::AH => Some(Self::Ah),
            satype::ESP => Some(Self::Esp),
            satype::IPCOMP => Some(Self::IpComp),
            _ => None,
        }
    }

    /// Header satype for this protocol.
    pub fn satype(self) -> u8 {
        match self {
            Self::Ah => satype::AH,
            Self::Esp => satype::ESP,
            Self::IpComp => satype::IPCOMP,
        }
    }

    /// Map an IP protocol number to a protocol.
    pub fn from_number(v: u16) -> Option<Self> {
        match v {
            51 => Some(Self::Ah),
            50 => Some(Self::Esp),
            108 => Some(Self::IpComp),
            _ => None,
        }
    }

    /// IP protocol number.
    pub fn number(self) -> u16 {
        match self {
            Self::Ah => 51,
            Self::Esp => 50,
            Self::IpComp => 108,
        }
    }
}

impl fmt::Display for IpsecProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ah => "ah",
            Self::Esp => "esp",
            Self::IpComp => "ipcomp",
        })
    }
}
