//! Envelope parsing.
//!
//! [`check_envelope`] turns a datagram into an [`Envelope`]: a validated
//! header plus a map of decoded extensions. Nothing here panics on
//! malformed input.

use winnow::binary::{self, Endianness};
use winnow::error::{ContextError, ErrMode};
use winnow::prelude::*;
use winnow::token::take;

use super::error::{Error, Result};
use super::ext::{ExtType, Extension, ExtensionMap, SADB_EXT_HDRLEN};
use super::message::{
    IpsecProtocol, MessageType, PF_KEY_V2, SADB_MSG_LEN, SadbMsg, from_units, satype,
};

type PResult<T> = std::result::Result<T, ErrMode<ContextError>>;

/// A parsed and validated message.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub header: SadbMsg,
    pub kind: MessageType,
    pub exts: ExtensionMap,
}

impl Envelope {
    /// SA type from the header.
    pub fn satype(&self) -> u8 {
        self.header.satype
    }

    /// IPsec protocol named by the header, if any.
    pub fn protocol(&self) -> Option<IpsecProtocol> {
        IpsecProtocol::from_satype(self.header.satype)
    }

    pub fn seq(&self) -> u32 {
        self.header.seq
    }

    pub fn pid(&self) -> u32 {
        self.header.pid
    }
}

/// Split one extension record off the front of `input`.
///
/// Returns the declared type and the whole record, header included.
fn record<'a>(input: &mut &'a [u8]) -> PResult<(u16, &'a [u8])> {
    let mut peek = *input;
    let units = binary::u16(Endianness::Native).parse_next(&mut peek)?;
    let ext_type = binary::u16(Endianness::Native).parse_next(&mut peek)?;
    let record: &[u8] = take(from_units(units)).parse_next(input)?;
    Ok((ext_type, record))
}

fn check_satype(kind: MessageType, satype: u8) -> Result<()> {
    // The promiscuous message carries its on/off flag in the satype slot.
    if kind == MessageType::Promisc {
        return Ok(());
    }
    match satype {
        satype::UNSPEC => {
            if kind.requires_satype() {
                return Err(Error::malformed(format!("{kind} requires an SA type")));
            }
        }
        satype::AH | satype::ESP | satype::IPCOMP => {
            if kind.is_policy() {
                return Err(Error::malformed(format!(
                    "{kind} does not take SA type {satype}"
                )));
            }
        }
        satype::RSVP | satype::OSPFV2 | satype::RIPV2 | satype::MIP => {
            return Err(Error::Unsupported(format!("SA type {satype}")));
        }
        _ => return Err(Error::malformed(format!("invalid SA type {satype}"))),
    }
    Ok(())
}

fn split_extensions(mut input: &[u8]) -> Result<ExtensionMap> {
    let mut exts = ExtensionMap::new();
    while !input.is_empty() {
        if input.len() < SADB_EXT_HDRLEN {
            return Err(Error::malformed("trailing bytes shorter than an extension header"));
        }
        let declared = from_units(u16::from_ne_bytes([input[0], input[1]]));
        if declared == 0 {
            return Err(Error::malformed("zero-length extension"));
        }
        if declared > input.len() {
            return Err(Error::malformed(format!(
                "extension of {declared} bytes runs past the message ({} left)",
                input.len()
            )));
        }

        let (raw_type, data) = record(&mut input).map_err(|_| Error::Truncated {
            expected: declared,
            actual: input.len(),
        })?;
        let ty = ExtType::from_u16(raw_type)
            .ok_or_else(|| Error::malformed(format!("unknown extension type {raw_type}")))?;

        if data.len() < ty.min_len() {
            return Err(Error::malformed(format!(
                "{ty:?} extension of {} bytes is shorter than {}",
                data.len(),
                ty.min_len()
            )));
        }
        if ty.max_len().is_some_and(|max| data.len() > max) {
            return Err(Error::malformed(format!(
                "{ty:?} extension of {} bytes is too long",
                data.len()
            )));
        }

        exts.insert(ty, Extension::decode(ty, data)?)?;
    }
    Ok(exts)
}

/// Validate a message and decode its extensions.
///
/// Checks the version, message type, SA type, declared length, and every
/// extension record. When both source and destination addresses are
/// present they must agree on family and upper-layer protocol.
pub fn check_envelope(data: &[u8]) -> Result<Envelope> {
    let header = SadbMsg::from_bytes(data)?;
    if header.version != PF_KEY_V2 {
        return Err(Error::malformed(format!("version {} != {PF_KEY_V2}", header.version)));
    }
    let kind = header
        .kind()
        .ok_or_else(|| Error::malformed(format!("unknown message type {}", header.msg_type)))?;
    if header.byte_len() != data.len() {
        return Err(Error::malformed(format!(
            "declared length {} != received {}",
            header.byte_len(),
            data.len()
        )));
    }
    check_satype(kind, header.satype)?;

    // A promiscuous message with a body carries a whole message to relay
    // verbatim, not extension records.
    if kind == MessageType::Promisc {
        return Ok(Envelope {
            header,
            kind,
            exts: ExtensionMap::new(),
        });
    }

    let exts = split_extensions(&data[SADB_MSG_LEN..])?;

    if let (Some(src), Some(dst)) = (exts.src(), exts.dst()) {
        if src.proto != dst.proto {
            return Err(Error::malformed("source and destination protocols differ"));
        }
        if src.family() != dst.family() {
            return Err(Error::malformed("source and destination families differ"));
        }
    }

    Ok(Envelope { header, kind, exts })
}
