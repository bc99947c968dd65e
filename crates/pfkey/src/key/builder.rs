//! Message builder for constructing PF_KEY messages.

use std::net::IpAddr;

use bytes::Bytes;

use super::error::Error;
use super::ext::{
    AddressExt, ExtType, Extension, KeyMaterial, LifetimeExt, PolicyExt, SaExt,
};
use super::message::{MessageType, SADB_MSG_LEN, SadbMsg, to_units};

/// Builder for constructing PF_KEY messages.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    buf: Vec<u8>,
}

impl MessageBuilder {
    /// Create a new message builder with the given type and SA type.
    pub fn new(msg_type: MessageType, satype: u8) -> Self {
        Self::with_header(SadbMsg::new(msg_type, satype))
    }

    /// Create a builder from an existing header.
    pub fn with_header(header: SadbMsg) -> Self {
        let mut buf = Vec::with_capacity(128);
        buf.extend_from_slice(header.as_bytes());
        Self { buf }
    }

    /// Create a reply to `request`: same type, SA type, seq and pid, no
    /// error and no extensions.
    pub fn reply(request: &SadbMsg) -> Self {
        Self::with_header(SadbMsg {
            errno: 0,
            ..*request
        })
    }

    /// Header-only failure reply to `request` carrying the error's errno.
    pub fn error_reply(request: &SadbMsg, err: &Error) -> Bytes {
        let mut builder = Self::reply(request);
        builder.buf[2] = u8::try_from(err.errno()).unwrap_or(u8::MAX);
        builder.finish()
    }

    /// Get the current message length.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Check if the message is empty (header only).
    pub fn is_empty(&self) -> bool {
        self.buf.len() == SADB_MSG_LEN
    }

    /// Append an extension record.
    pub fn append_ext(&mut self, ty: ExtType, ext: &Extension) -> &mut Self {
        ext.encode(ty, &mut self.buf);
        self
    }

    /// Append an SA extension.
    pub fn sa(&mut self, sa: SaExt) -> &mut Self {
        self.append_ext(ExtType::Sa, &Extension::Sa(sa))
    }

    /// Append a lifetime extension of the given kind.
    pub fn lifetime(&mut self, ty: ExtType, lifetime: LifetimeExt) -> &mut Self {
        self.append_ext(ty, &Extension::Lifetime(lifetime))
    }

    /// Append an address extension.
    pub fn address(&mut self, ty: ExtType, addr: AddressExt) -> &mut Self {
        self.append_ext(ty, &Extension::Address(addr))
    }

    /// Append a full-length host address extension.
    pub fn host(&mut self, ty: ExtType, addr: IpAddr) -> &mut Self {
        self.address(ty, AddressExt::host(addr))
    }

    /// Append a key extension.
    pub fn key(&mut self, ty: ExtType, key: &KeyMaterial) -> &mut Self {
        self.append_ext(ty, &Extension::Key(key.clone()))
    }

    /// Append a policy extension.
    pub fn policy(&mut self, policy: PolicyExt) -> &mut Self {
        self.append_ext(ExtType::Policy, &Extension::Policy(policy))
    }

    /// Append raw, already aligned bytes after the header.
    pub fn append_bytes(&mut self, data: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(data);
        self
    }

    /// Set the sequence number.
    pub fn set_seq(&mut self, seq: u32) -> &mut Self {
        self.buf[8..12].copy_from_slice(&seq.to_ne_bytes());
        self
    }

    /// Set the process id.
    pub fn set_pid(&mut self, pid: u32) -> &mut Self {
        self.buf[12..16].copy_from_slice(&pid.to_ne_bytes());
        self
    }

    /// Finalize and return the message bytes.
    pub fn finish(mut self) -> Bytes {
        let units = to_units(self.buf.len());
        self.buf.resize(usize::from(units) * 8, 0);
        self.buf[4..6].copy_from_slice(&units.to_ne_bytes());
        Bytes::from(self.buf)
    }

    /// Get the current buffer for inspection.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}
