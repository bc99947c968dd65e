//! The manager task driving the engine for several sockets.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use pfkey::key::{
    ChannelSink, Direction, Envelope, ExtType, IpsecProtocol, KeyHandle, KeyManager,
    MessageBuilder, MessageType, MonotonicClock, SecurityIndex, SocketId, check_envelope, satype,
};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use crate::common::{add_ah, add_esp_out, addressed, ah_sa, engine, esp_policy, my, peer, secs};

const ADMIN: SocketId = SocketId(1);
const DAEMON: SocketId = SocketId(2);

fn spawn() -> (KeyHandle, Arc<ChannelSink>) {
    let sink = Arc::new(ChannelSink::new(16));
    let (handle, _task) = KeyManager::new(engine(), sink.clone(), MonotonicClock::new()).spawn();
    (handle, sink)
}

/// Next message of `kind` on a socket, skipping others.
async fn next_of(stream: &mut ReceiverStream<Bytes>, kind: MessageType) -> Envelope {
    let wait = async {
        loop {
            let msg = stream.next().await.expect("queue closed");
            let env = check_envelope(&msg).unwrap();
            if env.kind == kind {
                return env;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("no message of the expected kind")
}

#[tokio::test]
async fn test_missing_sa_triggers_acquire() {
    let (handle, sink) = spawn();
    let mut admin = sink.attach(ADMIN);
    let mut daemon = sink.attach(DAEMON);
    handle.open_socket(ADMIN).await.unwrap();
    handle.open_socket(DAEMON).await.unwrap();

    handle
        .send(DAEMON, MessageBuilder::new(MessageType::Register, satype::ESP).finish())
        .await
        .unwrap();
    next_of(&mut daemon, MessageType::Register).await;

    handle.send(ADMIN, esp_policy()).await.unwrap();
    let added = next_of(&mut admin, MessageType::PolicyAdd).await;
    assert_eq!(added.header.errno, 0);
    next_of(&mut daemon, MessageType::PolicyAdd).await;

    let traffic = SecurityIndex::host(my(), peer());
    let policy = handle
        .lookup_policy(traffic.clone(), Direction::Outbound)
        .await
        .unwrap()
        .unwrap();
    let err = handle
        .check_request(policy, 0, traffic.clone())
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    handle.release_policy(policy).await.unwrap();

    let acquire = next_of(&mut daemon, MessageType::Acquire).await;
    assert_eq!(acquire.satype(), satype::ESP);
    assert_ne!(acquire.seq(), 0);
    assert_eq!(acquire.exts.src().unwrap().addr, my());
    assert_eq!(acquire.exts.dst().unwrap().addr, peer());
    assert!(!acquire.exts.proposal().unwrap().combs.is_empty());
    assert_eq!(handle.stats().await.unwrap().acquires, 1);
}

#[tokio::test]
async fn test_installed_sa_satisfies_policy() {
    let (handle, sink) = spawn();
    let mut admin = sink.attach(ADMIN);
    handle.open_socket(ADMIN).await.unwrap();

    handle.send(ADMIN, esp_policy()).await.unwrap();
    next_of(&mut admin, MessageType::PolicyAdd).await;
    handle.send(ADMIN, add_esp_out(0x7000)).await.unwrap();
    let added = next_of(&mut admin, MessageType::Add).await;
    assert_eq!(added.header.errno, 0);

    let traffic = SecurityIndex::host(my(), peer());
    let policy = handle
        .lookup_policy(traffic.clone(), Direction::Outbound)
        .await
        .unwrap()
        .unwrap();
    let sa = handle.check_request(policy, 0, traffic).await.unwrap();
    assert!(sa.is_some());
    handle.release_policy(policy).await.unwrap();

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.policies, 1);
    assert_eq!(stats.sas, 1);
    assert_eq!(stats.acquires, 0);
}

#[tokio::test]
async fn test_inbound_packet_accounting() {
    let (handle, sink) = spawn();
    let mut admin = sink.attach(ADMIN);
    handle.open_socket(ADMIN).await.unwrap();

    handle
        .send(ADMIN, add_ah(0x7100, secs(60), secs(120)))
        .await
        .unwrap();
    next_of(&mut admin, MessageType::Add).await;

    let key = handle
        .allocsa_by_spi(peer(), my(), IpsecProtocol::Ah, 0x7100)
        .await
        .unwrap()
        .unwrap();
    handle.record_use(key, 4096).await.unwrap();
    handle.release_sa(key).await.unwrap();

    let mut b = addressed(MessageType::Get, satype::AH, peer(), my());
    b.sa(ah_sa(0x7100));
    handle.send(ADMIN, b.finish()).await.unwrap();
    let got = next_of(&mut admin, MessageType::Get).await;
    let current = got.exts.lifetime(ExtType::LifetimeCurrent).unwrap();
    assert_eq!(current.bytes, 4096);
}
