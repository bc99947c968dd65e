//! Common test utilities for integration tests.
//!
//! Provides a [`Harness`] around an engine with a fixed local address and
//! deterministic SPIs, plus message builders for the requests the tests
//! send most.

#![allow(dead_code)]

use std::net::IpAddr;
use std::sync::Arc;

use bytes::Bytes;
use pfkey::key::{
    AddressExt, DefaultAlgorithms, Envelope, ExtType, Extension, KeyConfig, KeyMaterial,
    LifetimeExt, MessageBuilder, MessageType, Outgoing, PolicyExt, PolicyKind, RequestSpec,
    SadbMsg, SadbState, SaExt, SocketId, SpiRangeExt, StaticAddresses, aalg, check_envelope,
    ealg,
};

/// Assert that the first delivery is an error reply with this errno.
macro_rules! assert_errno {
    ($out:expr, $errno:expr) => {
        assert_eq!(
            i32::from($crate::common::errno(&$out)),
            $errno,
            "unexpected errno in reply"
        )
    };
}

/// Socket the harness sends from.
pub const SOCK: SocketId = SocketId(1);

/// The local address.
pub fn my() -> IpAddr {
    "192.0.2.1".parse().unwrap()
}

/// A remote peer.
pub fn peer() -> IpAddr {
    "198.51.100.7".parse().unwrap()
}

/// An engine with [`my`] as its only local address.
pub fn engine() -> SadbState {
    let oracle = StaticAddresses::new().with(my(), 32);
    SadbState::new(KeyConfig::default(), Arc::new(oracle), Arc::new(DefaultAlgorithms))
        .with_spi_seed(42)
}

/// Engine wrapper that feeds messages from [`SOCK`] at a settable time.
pub struct Harness {
    pub engine: SadbState,
    pub now: u64,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            engine: engine(),
            now: 1,
        }
    }

    /// Feed a message from [`SOCK`].
    pub fn send(&mut self, msg: Bytes) -> Vec<Outgoing> {
        self.engine.handle_message(SOCK, &msg, self.now)
    }

    /// Feed a message from another socket.
    pub fn send_from(&mut self, socket: SocketId, msg: Bytes) -> Vec<Outgoing> {
        self.engine.handle_message(socket, &msg, self.now)
    }

    /// Feed a message and parse the first delivery, which must succeed.
    pub fn request(&mut self, msg: Bytes) -> Envelope {
        let out = self.send(msg);
        let env = check_envelope(&out[0].bytes).unwrap();
        assert_eq!(env.header.errno, 0, "request failed: {:?}", env.kind);
        env
    }
}

/// Errno of the first delivery.
pub fn errno(out: &[Outgoing]) -> u8 {
    SadbMsg::from_bytes(&out[0].bytes).unwrap().errno
}

/// Message with host source and destination addresses.
pub fn addressed(kind: MessageType, satype: u8, src: IpAddr, dst: IpAddr) -> MessageBuilder {
    let mut b = MessageBuilder::new(kind, satype);
    b.host(ExtType::AddressSrc, src).host(ExtType::AddressDst, dst);
    b
}

/// GetSpi for an inbound SA from [`peer`] to [`my`].
pub fn getspi(satype: u8, seq: u32) -> Bytes {
    let mut b = addressed(MessageType::GetSpi, satype, peer(), my());
    b.set_seq(seq);
    b.finish()
}

/// GetSpi asking for exactly `spi`.
pub fn getspi_forced(satype: u8, spi: u32) -> Bytes {
    let mut b = addressed(MessageType::GetSpi, satype, peer(), my());
    b.append_ext(
        ExtType::SpiRange,
        &Extension::SpiRange(SpiRangeExt { min: spi, max: spi }),
    );
    b.finish()
}

/// SA extension of an AH SA with HMAC-SHA1.
pub fn ah_sa(spi: u32) -> SaExt {
    SaExt {
        spi,
        replay: 4,
        auth: aalg::SHA1HMAC,
        ..Default::default()
    }
}

/// A valid HMAC-SHA1 key.
pub fn sha1_key() -> KeyMaterial {
    KeyMaterial::new(vec![0x5a; 20])
}

/// Add of an inbound AH SA with the given soft and hard lifetimes.
pub fn add_ah(spi: u32, soft: LifetimeExt, hard: LifetimeExt) -> Bytes {
    let mut b = addressed(MessageType::Add, pfkey::key::satype::AH, peer(), my());
    b.sa(ah_sa(spi))
        .key(ExtType::KeyAuth, &sha1_key())
        .lifetime(ExtType::LifetimeSoft, soft)
        .lifetime(ExtType::LifetimeHard, hard);
    b.finish()
}

/// Add of an outbound ESP SA from [`my`] to [`peer`].
pub fn add_esp_out(spi: u32) -> Bytes {
    let mut b = addressed(MessageType::Add, pfkey::key::satype::ESP, my(), peer());
    b.sa(SaExt {
        spi,
        replay: 4,
        encrypt: ealg::AESCBC,
        ..Default::default()
    })
    .key(ExtType::KeyEncrypt, &KeyMaterial::new(vec![0x11; 16]));
    b.finish()
}

/// Lifetime with only an add-time limit.
pub fn secs(add_time: u64) -> LifetimeExt {
    LifetimeExt {
        add_time,
        ..Default::default()
    }
}

/// SPD add of a policy between two selectors.
pub fn spd_add(src: AddressExt, dst: AddressExt, policy: PolicyExt) -> Bytes {
    let mut b = MessageBuilder::new(MessageType::PolicyAdd, pfkey::key::satype::UNSPEC);
    b.address(ExtType::AddressSrc, src)
        .address(ExtType::AddressDst, dst)
        .policy(policy);
    b.finish()
}

/// Outbound policy from [`my`] to [`peer`] requiring transport-mode ESP.
pub fn esp_policy() -> Bytes {
    let mut ext = PolicyExt::new(PolicyKind::Ipsec);
    ext.requests.push(RequestSpec::transport(pfkey::key::IpsecProtocol::Esp));
    spd_add(AddressExt::host(my()), AddressExt::host(peer()), ext)
}
