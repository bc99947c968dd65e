//! Policy database behavior through the message interface.

use pfkey::key::{
    AddressExt, Direction, Error, MessageBuilder, MessageType, PolicyExt, PolicyKind,
    SecurityIndex, satype,
};

use crate::common::{Harness, esp_policy, my, peer, spd_add};

fn alive(h: &Harness) -> usize {
    h.engine.spd().iter().filter(|(_, p)| p.is_alive()).count()
}

fn flush() -> bytes::Bytes {
    MessageBuilder::new(MessageType::PolicyFlush, satype::UNSPEC).finish()
}

#[test]
fn test_duplicate_policy_rejected() {
    let mut h = Harness::new();
    h.request(esp_policy());
    let out = h.send(esp_policy());
    assert_errno!(out, libc::EEXIST);
    assert_eq!(h.engine.spd().len(), 1);
}

#[test]
fn test_flush_is_idempotent() {
    let mut h = Harness::new();
    h.request(esp_policy());
    h.request(spd_add(
        AddressExt::host(peer()),
        AddressExt::host(my()),
        PolicyExt::new(PolicyKind::Discard),
    ));
    assert_eq!(alive(&h), 2);

    h.request(flush());
    let once = (h.engine.spd().len(), alive(&h));
    h.request(flush());
    let twice = (h.engine.spd().len(), alive(&h));
    assert_eq!(once, twice);
    assert_eq!(twice.1, 0);

    h.engine.sweep(h.now + 1);
    assert!(h.engine.spd().is_empty());
}

#[test]
fn test_lookup_release_restores_refcount() {
    let mut h = Harness::new();
    h.request(esp_policy());
    let traffic = SecurityIndex::host(my(), peer()).with_proto(6).with_ports(40000, 443);

    let key = h
        .engine
        .lookup_policy(&traffic, Direction::Outbound, h.now)
        .unwrap();
    assert_eq!(h.engine.spd().get(key).unwrap().refcnt(), 2);
    h.engine.release_policy(key).unwrap();
    assert_eq!(h.engine.spd().get(key).unwrap().refcnt(), 1);

    // Inbound traffic does not see an outbound policy.
    assert!(
        h.engine
            .lookup_policy(&SecurityIndex::host(peer(), my()), Direction::Inbound, h.now)
            .is_none()
    );

    // An extra release may not take the database's reference.
    assert!(matches!(h.engine.release_policy(key), Err(Error::Corrupted(_))));
    assert_eq!(h.engine.spd().get(key).unwrap().refcnt(), 1);
    assert_eq!(
        h.engine.lookup_policy(&traffic, Direction::Outbound, h.now),
        Some(key)
    );
}

#[test]
fn test_dump_lists_each_policy() {
    let mut h = Harness::new();
    h.request(esp_policy());
    h.request(spd_add(
        AddressExt::host(peer()),
        AddressExt::host(my()),
        PolicyExt::new(PolicyKind::None),
    ));

    let out = h.send(MessageBuilder::new(MessageType::PolicyDump, satype::UNSPEC).finish());
    assert_eq!(out.len(), 2);
    let seqs: Vec<u32> = out
        .iter()
        .map(|o| pfkey::key::check_envelope(&o.bytes).unwrap().seq())
        .collect();
    assert_eq!(seqs.last(), Some(&0));
    assert!(seqs[0] > 0);
}

#[test]
fn test_delete_by_id() {
    let mut h = Harness::new();
    let id = h.request(esp_policy()).exts.policy().unwrap().id;

    let mut ext = PolicyExt::new(PolicyKind::Discard);
    ext.id = id;
    let mut b = MessageBuilder::new(MessageType::PolicyDeleteById, satype::UNSPEC);
    b.policy(ext);
    h.request(b.finish());
    assert_eq!(alive(&h), 0);

    let mut ext = PolicyExt::new(PolicyKind::Discard);
    ext.id = id;
    let mut b = MessageBuilder::new(MessageType::PolicyDeleteById, satype::UNSPEC);
    b.policy(ext);
    let out = h.send(b.finish());
    assert_errno!(out, libc::ENOENT);
}
