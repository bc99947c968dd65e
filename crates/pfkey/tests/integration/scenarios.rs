//! End-to-end message exchanges with the engine.

use pfkey::key::{
    ExtType, IpsecProtocol, MessageBuilder, MessageType, SaState, SocketId, Target,
    check_envelope, satype,
};

use crate::common::{
    Harness, SOCK, add_ah, addressed, ah_sa, esp_policy, getspi, getspi_forced, my, peer, secs,
    sha1_key,
};

const DAEMON: SocketId = SocketId(2);

#[test]
fn test_policy_added_twice() {
    let mut h = Harness::new();
    let reply = h.request(esp_policy());
    assert_eq!(reply.kind, MessageType::PolicyAdd);
    assert_errno!(h.send(esp_policy()), libc::EEXIST);
}

#[test]
fn test_forced_spi_reserved_once() {
    let mut h = Harness::new();
    let reply = h.request(getspi_forced(satype::AH, 100));
    assert_eq!(reply.exts.sa().unwrap().spi, 100);
    assert_errno!(h.send(getspi_forced(satype::AH, 100)), libc::EEXIST);
    assert_eq!(h.engine.sadb().sa_count(), 1);
}

#[test]
fn test_getspi_then_update_matures() {
    let mut h = Harness::new();
    let out = h.send(getspi(satype::AH, 31));
    assert_eq!(out[0].target, Target::One(SOCK));
    let spi = check_envelope(&out[0].bytes).unwrap().exts.sa().unwrap().spi;
    assert!(h.engine.allocsa_by_spi(&peer(), &my(), IpsecProtocol::Ah, spi).is_none());

    let mut b = addressed(MessageType::Update, satype::AH, peer(), my());
    b.set_seq(31);
    b.sa(ah_sa(spi)).key(ExtType::KeyAuth, &sha1_key());
    let out = h.send(b.finish());
    assert_eq!(out[0].target, Target::All);
    let reply = check_envelope(&out[0].bytes).unwrap();
    assert_eq!(reply.header.errno, 0);
    assert!(reply.exts.key(ExtType::KeyAuth).is_none());

    let key = h
        .engine
        .allocsa_by_spi(&peer(), &my(), IpsecProtocol::Ah, spi)
        .unwrap();
    let sa = h.engine.sadb().sa(key).unwrap();
    assert_eq!(sa.state(), SaState::Mature);
    assert_eq!(sa.seq, 31);
    h.engine.release_sa(key).unwrap();
}

#[test]
fn test_unused_sa_deleted_at_soft_expiry() {
    let mut h = Harness::new();
    h.now = 10;
    h.request(add_ah(0x600, secs(10), secs(20)));

    assert!(h.engine.sweep(20).is_empty());
    assert_eq!(h.engine.sadb().sa_count(), 1);

    let out = h.engine.sweep(21);
    assert!(out.is_empty());
    assert_eq!(h.engine.sadb().sa_count(), 0);
    assert!(h.engine.allocsa_by_spi(&peer(), &my(), IpsecProtocol::Ah, 0x600).is_none());
}

#[test]
fn test_used_sa_dies_and_notifies_daemons() {
    let mut h = Harness::new();
    h.now = 10;
    h.engine.open_socket(DAEMON);
    let reply = check_envelope(
        &h.send_from(DAEMON, MessageBuilder::new(MessageType::Register, satype::AH).finish())[0]
            .bytes,
    )
    .unwrap();
    assert!(reply.exts.supported(ExtType::SupportedAuth).is_some());

    h.request(add_ah(0x601, secs(10), secs(20)));
    let key = h
        .engine
        .allocsa_by_spi(&peer(), &my(), IpsecProtocol::Ah, 0x601)
        .unwrap();
    h.engine.record_use(key, 1500, 12).unwrap();
    h.engine.release_sa(key).unwrap();

    let out = h.engine.sweep(21);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].target, Target::Registered(satype::AH));
    assert_eq!(h.engine.listeners().registered_for(satype::AH), vec![DAEMON]);

    let expire = check_envelope(&out[0].bytes).unwrap();
    assert_eq!(expire.kind, MessageType::Expire);
    assert_eq!(expire.exts.sa().unwrap().spi, 0x601);
    assert_eq!(expire.exts.lifetime(ExtType::LifetimeCurrent).unwrap().bytes, 1500);
    assert_eq!(h.engine.sadb().sa(key).unwrap().state(), SaState::Dying);

    // Still usable while dying; gone at the hard limit.
    let held = h
        .engine
        .allocsa_by_spi(&peer(), &my(), IpsecProtocol::Ah, 0x601)
        .unwrap();
    h.engine.release_sa(held).unwrap();
    h.engine.sweep(31);
    assert!(h.engine.sadb().sa(key).is_none());
}
