//! Manager task.
//!
//! A single tokio task owns the [`SadbState`]. Socket readers, the packet
//! path, and the sweeper timer reach it over an mpsc channel through a
//! cloneable [`KeyHandle`]; calls that need an answer carry a oneshot.
//! Outgoing messages are handed to a [`Sink`] without blocking.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use pfkey::key::{ChannelSink, KeyConfig, KeyManager, MonotonicClock, SadbState, SocketId};
//! use pfkey::key::{DefaultAlgorithms, StaticAddresses};
//! use tokio_stream::StreamExt;
//!
//! let state = SadbState::new(
//!     KeyConfig::default(),
//!     Arc::new(StaticAddresses::new().with("192.0.2.1".parse()?, 32)),
//!     Arc::new(DefaultAlgorithms),
//! );
//! let sink = Arc::new(ChannelSink::new(64));
//! let (handle, task) = KeyManager::new(state, sink.clone(), MonotonicClock::new()).spawn();
//!
//! let mut replies = sink.attach(SocketId(1));
//! handle.send(SocketId(1), register_msg).await?;
//! let reply = replies.next().await;
//! ```

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use super::direction::Direction;
use super::engine::{Outgoing, SadbState, Target};
use super::error::{Error, Result};
use super::index::SecurityIndex;
use super::message::IpsecProtocol;
use super::register::SocketId;
use super::sadb::SaKey;
use super::spd::PolicyKey;

/// Source of the seconds clock used for lifetimes.
pub trait Clock: Send + Sync + 'static {
    /// Seconds on a monotonic clock. Never zero.
    fn now(&self) -> u64;
}

/// Seconds elapsed since creation, starting at 1.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    start: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> u64 {
        // Zero marks "never" in use times.
        self.start.elapsed().as_secs() + 1
    }
}

/// Where outgoing messages go.
pub trait Sink: Send + Sync + 'static {
    /// Queue `bytes` for `socket` without blocking.
    fn deliver(&self, socket: SocketId, bytes: Bytes) -> Result<()>;
}

/// A [`Sink`] with one bounded queue per socket.
#[derive(Debug)]
pub struct ChannelSink {
    capacity: usize,
    queues: Mutex<HashMap<SocketId, mpsc::Sender<Bytes>>>,
}

impl ChannelSink {
    /// Create a sink whose per-socket queues hold `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Start queueing messages for `socket`. A previous stream for the same
    /// socket ends.
    pub fn attach(&self, socket: SocketId) -> ReceiverStream<Bytes> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.lock().insert(socket, tx);
        ReceiverStream::new(rx)
    }

    /// Stop queueing messages for `socket`.
    pub fn detach(&self, socket: SocketId) {
        self.lock().remove(&socket);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SocketId, mpsc::Sender<Bytes>>> {
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Sink for ChannelSink {
    fn deliver(&self, socket: SocketId, bytes: Bytes) -> Result<()> {
        let queues = self.lock();
        let tx = queues
            .get(&socket)
            .ok_or_else(|| Error::not_found(format!("queue for {socket}")))?;
        tx.try_send(bytes).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::OutOfMemory,
            mpsc::error::TrySendError::Closed(_) => {
                Error::not_found(format!("queue for {socket}"))
            }
        })
    }
}

/// Sizes of the databases, as seen by the manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagerStats {
    pub policies: usize,
    pub sas: usize,
    pub groups: usize,
    pub acquires: usize,
    pub sockets: usize,
}

enum Command {
    Open(SocketId),
    Close(SocketId),
    Message {
        socket: SocketId,
        data: Bytes,
    },
    LookupPolicy {
        index: SecurityIndex,
        traffic: Direction,
        reply: oneshot::Sender<Option<PolicyKey>>,
    },
    ReleasePolicy {
        key: PolicyKey,
        reply: oneshot::Sender<Result<()>>,
    },
    CheckRequest {
        policy: PolicyKey,
        request_idx: usize,
        index: SecurityIndex,
        reply: oneshot::Sender<Result<Option<SaKey>>>,
    },
    AllocSaBySpi {
        src: IpAddr,
        dst: IpAddr,
        protocol: IpsecProtocol,
        spi: u32,
        reply: oneshot::Sender<Option<SaKey>>,
    },
    ReleaseSa {
        key: SaKey,
        reply: oneshot::Sender<Result<()>>,
    },
    RecordUse {
        key: SaKey,
        bytes: u64,
        reply: oneshot::Sender<Result<()>>,
    },
    Sweep {
        reply: oneshot::Sender<()>,
    },
    Stats {
        reply: oneshot::Sender<ManagerStats>,
    },
    Shutdown,
}

/// Cloneable handle to a running manager.
#[derive(Clone)]
pub struct KeyHandle {
    tx: mpsc::Sender<Command>,
}

impl KeyHandle {
    async fn submit(&self, cmd: Command) -> Result<()> {
        self.tx.send(cmd).await.map_err(|_| Error::ManagerClosed)
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.submit(make(tx)).await?;
        rx.await.map_err(|_| Error::ManagerClosed)
    }

    /// Announce a new key socket.
    pub async fn open_socket(&self, socket: SocketId) -> Result<()> {
        self.submit(Command::Open(socket)).await
    }

    /// Forget a key socket and its registrations.
    pub async fn close_socket(&self, socket: SocketId) -> Result<()> {
        self.submit(Command::Close(socket)).await
    }

    /// Feed one message received on `socket`. Replies go to the sink.
    pub async fn send(&self, socket: SocketId, data: impl Into<Bytes>) -> Result<()> {
        self.submit(Command::Message {
            socket,
            data: data.into(),
        })
        .await
    }

    /// See [`SadbState::lookup_policy`].
    pub async fn lookup_policy(
        &self,
        index: SecurityIndex,
        traffic: Direction,
    ) -> Result<Option<PolicyKey>> {
        self.call(|reply| Command::LookupPolicy {
            index,
            traffic,
            reply,
        })
        .await
    }

    /// See [`SadbState::release_policy`].
    pub async fn release_policy(&self, key: PolicyKey) -> Result<()> {
        self.call(|reply| Command::ReleasePolicy { key, reply }).await?
    }

    /// See [`SadbState::check_request`].
    pub async fn check_request(
        &self,
        policy: PolicyKey,
        request_idx: usize,
        index: SecurityIndex,
    ) -> Result<Option<SaKey>> {
        self.call(|reply| Command::CheckRequest {
            policy,
            request_idx,
            index,
            reply,
        })
        .await?
    }

    /// See [`SadbState::allocsa_by_spi`].
    pub async fn allocsa_by_spi(
        &self,
        src: IpAddr,
        dst: IpAddr,
        protocol: IpsecProtocol,
        spi: u32,
    ) -> Result<Option<SaKey>> {
        self.call(|reply| Command::AllocSaBySpi {
            src,
            dst,
            protocol,
            spi,
            reply,
        })
        .await
    }

    /// See [`SadbState::release_sa`].
    pub async fn release_sa(&self, key: SaKey) -> Result<()> {
        self.call(|reply| Command::ReleaseSa { key, reply }).await?
    }

    /// See [`SadbState::record_use`].
    pub async fn record_use(&self, key: SaKey, bytes: u64) -> Result<()> {
        self.call(|reply| Command::RecordUse { key, bytes, reply })
            .await?
    }

    /// Run a sweeper pass now and wait for it.
    pub async fn sweep(&self) -> Result<()> {
        self.call(|reply| Command::Sweep { reply }).await
    }

    pub async fn stats(&self) -> Result<ManagerStats> {
        self.call(|reply| Command::Stats { reply }).await
    }

    /// Stop the manager. Calls made afterwards fail with `ManagerClosed`.
    pub async fn shutdown(&self) -> Result<()> {
        self.submit(Command::Shutdown).await
    }
}

/// Owner of the engine state, run as a task with [`KeyManager::spawn`].
pub struct KeyManager {
    state: SadbState,
    sink: Arc<dyn Sink>,
    clock: Arc<dyn Clock>,
}

impl KeyManager {
    pub fn new(state: SadbState, sink: Arc<dyn Sink>, clock: impl Clock) -> Self {
        Self {
            state,
            sink,
            clock: Arc::new(clock),
        }
    }

    /// Start the task. It runs until [`KeyHandle::shutdown`] or until every
    /// handle is dropped.
    pub fn spawn(self) -> (KeyHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(self.state.config().channel_capacity.max(1));
        let task = tokio::spawn(self.run(rx));
        (KeyHandle { tx }, task)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        let mut ticker = tokio::time::interval(self.state.config().sweep_period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => self.apply(cmd),
                },
                _ = ticker.tick() => {
                    let out = self.state.sweep(self.clock.now());
                    self.deliver(out);
                }
            }
            let queued = self.state.take_outgoing();
            self.deliver(queued);
        }
        debug!("key manager stopped");
    }

    fn apply(&mut self, cmd: Command) {
        let now = self.clock.now();
        // A dropped oneshot receiver means the caller went away.
        match cmd {
            Command::Open(socket) => self.state.open_socket(socket),
            Command::Close(socket) => self.state.close_socket(socket),
            Command::Message { socket, data } => {
                let out = self.state.handle_message(socket, &data, now);
                self.deliver(out);
            }
            Command::LookupPolicy {
                index,
                traffic,
                reply,
            } => {
                let key = self.state.lookup_policy(&index, traffic, now);
                if let Err(Some(key)) = reply.send(key) {
                    self.release_orphan_policy(key);
                }
            }
            Command::ReleasePolicy { key, reply } => {
                let _ = reply.send(self.state.release_policy(key));
            }
            Command::CheckRequest {
                policy,
                request_idx,
                index,
                reply,
            } => {
                let _ = reply.send(self.state.check_request(policy, request_idx, &index, now));
            }
            Command::AllocSaBySpi {
                src,
                dst,
                protocol,
                spi,
                reply,
            } => {
                let key = self.state.allocsa_by_spi(&src, &dst, protocol, spi);
                if let Err(Some(key)) = reply.send(key)
                    && let Err(err) = self.state.release_sa(key)
                {
                    warn!(error = %err, "releasing unclaimed SA failed");
                }
            }
            Command::ReleaseSa { key, reply } => {
                let _ = reply.send(self.state.release_sa(key));
            }
            Command::RecordUse { key, bytes, reply } => {
                let _ = reply.send(self.state.record_use(key, bytes, now));
            }
            Command::Sweep { reply } => {
                let out = self.state.sweep(now);
                self.deliver(out);
                let _ = reply.send(());
            }
            Command::Stats { reply } => {
                let _ = reply.send(ManagerStats {
                    policies: self.state.spd().len(),
                    sas: self.state.sadb().sa_count(),
                    groups: self.state.sadb().saidx_count(),
                    acquires: self.state.acquires().len(),
                    sockets: self.state.listeners().all().len(),
                });
            }
            Command::Shutdown => {}
        }
    }

    fn release_orphan_policy(&mut self, key: PolicyKey) {
        if let Err(err) = self.state.release_policy(key) {
            warn!(error = %err, "releasing unclaimed policy failed");
        }
    }

    fn resolve(&self, target: Target) -> Vec<SocketId> {
        let listeners = self.state.listeners();
        match target {
            Target::One(socket) => vec![socket],
            Target::All => listeners.all(),
            Target::Registered(satype) => listeners.registered_for(satype),
            Target::Promisc => listeners.promiscuous(),
        }
    }

    fn deliver(&self, out: Vec<Outgoing>) {
        for msg in out {
            for socket in self.resolve(msg.target) {
                if let Err(err) = self.sink.deliver(socket, msg.bytes.clone()) {
                    warn!(%socket, error = %err, "delivery dropped");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_stream::StreamExt;

    use super::*;
    use crate::key::algorithm::DefaultAlgorithms;
    use crate::key::builder::MessageBuilder;
    use crate::key::config::KeyConfig;
    use crate::key::direction::StaticAddresses;
    use crate::key::ext::ExtType;
    use crate::key::message::{MessageType, SadbMsg, satype};
    use crate::key::parse::check_envelope;

    fn my() -> IpAddr {
        "192.0.2.1".parse().unwrap()
    }

    fn peer() -> IpAddr {
        "198.51.100.7".parse().unwrap()
    }

    fn spawn(sink: Arc<ChannelSink>) -> (KeyHandle, JoinHandle<()>) {
        let oracle = StaticAddresses::new().with(my(), 32);
        let state =
            SadbState::new(KeyConfig::default(), Arc::new(oracle), Arc::new(DefaultAlgorithms));
        KeyManager::new(state, sink, MonotonicClock::new()).spawn()
    }

    fn getspi() -> Bytes {
        let mut b = MessageBuilder::new(MessageType::GetSpi, satype::ESP);
        b.host(ExtType::AddressSrc, peer())
            .host(ExtType::AddressDst, my())
            .set_seq(3);
        b.finish()
    }

    #[tokio::test]
    async fn test_reply_reaches_sender() {
        let sink = Arc::new(ChannelSink::new(8));
        let (handle, _task) = spawn(sink.clone());
        let mut replies = sink.attach(SocketId(1));

        handle.send(SocketId(1), getspi()).await.unwrap();
        let reply = replies.next().await.unwrap();
        let env = check_envelope(&reply).unwrap();
        assert_eq!(env.kind, MessageType::GetSpi);
        assert_eq!(env.seq(), 3);
        assert_eq!(handle.stats().await.unwrap().sas, 1);
    }

    #[tokio::test]
    async fn test_broadcast_and_registered_delivery() {
        let sink = Arc::new(ChannelSink::new(8));
        let (handle, _task) = spawn(sink.clone());
        let mut a = sink.attach(SocketId(1));
        let mut b = sink.attach(SocketId(2));
        handle.open_socket(SocketId(2)).await.unwrap();

        let register = MessageBuilder::new(MessageType::Register, satype::AH).finish();
        handle.send(SocketId(1), register).await.unwrap();
        assert_eq!(
            SadbMsg::from_bytes(&a.next().await.unwrap()).unwrap().msg_type,
            MessageType::Register as u8
        );

        // Flush replies go to every open socket.
        let flush = MessageBuilder::new(MessageType::Flush, satype::UNSPEC).finish();
        handle.send(SocketId(2), flush).await.unwrap();
        for stream in [&mut a, &mut b] {
            let msg = stream.next().await.unwrap();
            assert_eq!(SadbMsg::from_bytes(&msg).unwrap().msg_type, MessageType::Flush as u8);
        }
    }

    #[tokio::test]
    async fn test_full_queue_drops() {
        let sink = Arc::new(ChannelSink::new(1));
        let (handle, _task) = spawn(sink.clone());
        let mut replies = sink.attach(SocketId(1));
        handle.send(SocketId(1), getspi()).await.unwrap();
        handle.send(SocketId(1), getspi()).await.unwrap();
        // The second reply did not fit.
        assert_eq!(handle.stats().await.unwrap().sas, 2);
        assert!(replies.next().await.is_some());
        sink.detach(SocketId(1));
        assert!(replies.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_larval_swept_after_timeout() {
        let sink = Arc::new(ChannelSink::new(8));
        let (handle, _task) = spawn(sink.clone());
        handle.send(SocketId(1), getspi()).await.unwrap();
        assert_eq!(handle.stats().await.unwrap().sas, 1);

        tokio::time::advance(Duration::from_secs(32)).await;
        handle.sweep().await.unwrap();
        assert_eq!(handle.stats().await.unwrap().sas, 0);
    }

    #[tokio::test]
    async fn test_packet_path_round_trip() {
        let sink = Arc::new(ChannelSink::new(8));
        let (handle, _task) = spawn(sink.clone());
        let index = SecurityIndex::host(my(), peer());
        assert!(
            handle
                .lookup_policy(index, Direction::Outbound)
                .await
                .unwrap()
                .is_none()
        );
        assert!(
            handle
                .allocsa_by_spi(peer(), my(), IpsecProtocol::Esp, 0x1234)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_shutdown() {
        let sink = Arc::new(ChannelSink::new(8));
        let (handle, task) = spawn(sink);
        handle.shutdown().await.unwrap();
        task.await.unwrap();
        assert!(matches!(handle.stats().await, Err(Error::ManagerClosed)));
    }
}
