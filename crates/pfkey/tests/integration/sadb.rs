//! SA lifecycle and reference counting through the message interface.

use pfkey::key::{
    Error, ExtType, IpsecProtocol, KeyMaterial, MessageType, SaState, check_envelope, satype,
};

use crate::common::{self, Harness, add_ah, addressed, ah_sa, getspi, my, peer, secs};

#[test]
fn test_rejected_update_leaves_no_trace() {
    let mut h = Harness::new();
    let spi = h.request(getspi(satype::AH, 12)).exts.sa().unwrap().spi;
    assert_eq!(h.engine.sadb().sa_count(), 1);

    // Eight bytes is too short for HMAC-SHA1.
    let mut b = addressed(MessageType::Update, satype::AH, peer(), my());
    b.set_seq(12);
    b.sa(ah_sa(spi))
        .key(ExtType::KeyAuth, &KeyMaterial::new(vec![1; 8]));
    let out = h.send(b.finish());
    assert_errno!(out, libc::EINVAL);

    assert_eq!(h.engine.sadb().sa_count(), 0);
    assert!(
        h.engine
            .allocsa_by_spi(&peer(), &my(), IpsecProtocol::Ah, spi)
            .is_none()
    );
    h.engine.sadb().verify().unwrap();
}

#[test]
fn test_lookup_release_restores_refcount() {
    let mut h = Harness::new();
    h.request(add_ah(0x4000, secs(100), secs(200)));

    let key = h
        .engine
        .allocsa_by_spi(&peer(), &my(), IpsecProtocol::Ah, 0x4000)
        .unwrap();
    let before = h.engine.sadb().sa(key).unwrap().refcnt();
    assert_eq!(before, 2);
    h.engine.release_sa(key).unwrap();
    assert_eq!(h.engine.sadb().sa(key).unwrap().refcnt(), 1);

    // An extra release may not take the database's reference of a Mature
    // SA; it stays findable.
    assert!(matches!(h.engine.release_sa(key), Err(Error::Corrupted(_))));
    assert_eq!(h.engine.sadb().sa(key).unwrap().refcnt(), 1);
    assert_eq!(
        h.engine
            .allocsa_by_spi(&peer(), &my(), IpsecProtocol::Ah, 0x4000),
        Some(key)
    );
}

#[test]
fn test_delete_while_held() {
    let mut h = Harness::new();
    h.request(add_ah(0x4001, secs(100), secs(200)));
    let key = h
        .engine
        .allocsa_by_spi(&peer(), &my(), IpsecProtocol::Ah, 0x4001)
        .unwrap();

    let mut b = addressed(MessageType::Delete, satype::AH, peer(), my());
    b.sa(ah_sa(0x4001));
    h.request(b.finish());

    // The holder still sees the SA, now Dead and out of every lookup.
    assert_eq!(h.engine.sadb().sa(key).unwrap().state(), SaState::Dead);
    assert!(
        h.engine
            .allocsa_by_spi(&peer(), &my(), IpsecProtocol::Ah, 0x4001)
            .is_none()
    );
    h.engine.release_sa(key).unwrap();
    assert!(h.engine.sadb().sa(key).is_none());
    h.engine.sadb().verify().unwrap();
}

#[test]
fn test_get_returns_keys() {
    let mut h = Harness::new();
    h.request(add_ah(0x4002, secs(100), secs(200)));

    let mut b = addressed(MessageType::Get, satype::AH, peer(), my());
    b.sa(ah_sa(0x4002));
    let reply = h.request(b.finish());
    assert_eq!(reply.exts.sa().unwrap().spi, 0x4002);
    assert_eq!(
        reply.exts.key(ExtType::KeyAuth).unwrap(),
        &common::sha1_key()
    );
}

#[test]
fn test_flush_by_type() {
    let mut h = Harness::new();
    h.request(add_ah(0x4003, secs(100), secs(200)));
    h.request(common::add_esp_out(0x5000));
    assert_eq!(h.engine.sadb().sa_count(), 2);

    let out = h.send(pfkey::key::MessageBuilder::new(MessageType::Flush, satype::AH).finish());
    let reply = check_envelope(&out[0].bytes).unwrap();
    assert_eq!(reply.header.errno, 0);
    assert_eq!(h.engine.sadb().sa_count(), 1);
    assert!(
        h.engine
            .allocsa_by_spi(&peer(), &my(), IpsecProtocol::Ah, 0x4003)
            .is_none()
    );
    h.engine.sadb().verify().unwrap();
}
