//! The key engine.
//!
//! [`SadbState`] owns the policy and SA databases together with everything
//! that mutates them, and turns each incoming message into a list of
//! [`Outgoing`] deliveries. It performs no I/O: the manager task resolves
//! delivery targets through the listener directory and hands the bytes to
//! a sink.

use std::net::IpAddr;
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use super::acquire::{AcquireDecision, AcquireTracker};
use super::algorithm::{AlgorithmKind, AlgorithmTable, aalg};
use super::builder::MessageBuilder;
use super::config::KeyConfig;
use super::direction::{AddressOracle, Direction};
use super::error::{Error, Result};
use super::ext::{
    AddressExt, ExtType, Extension, ExtensionMap, PolicyExt, ProposalExt, SadbComb, policy_dir,
};
use super::index::SecurityIndex;
use super::message::{IpsecProtocol, MessageType, SadbMsg};
use super::parse::{Envelope, check_envelope};
use super::policy::PolicyKind;
use super::register::{ListenerDirectory, SocketId};
use super::sa::SecurityAssociation;
use super::sadb::{SaKey, Sadb};
use super::spd::{PolicyKey, Spd};
use super::spi::{SpiAllocator, SpiStats};
use super::sweep::SweepStats;

/// Who a message is delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// One socket, usually the requester.
    One(SocketId),
    /// Every open socket.
    All,
    /// Sockets registered for an SA type.
    Registered(u8),
    /// Sockets in promiscuous mode.
    Promisc,
}

/// A message waiting for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub target: Target,
    pub bytes: Bytes,
}

impl Outgoing {
    pub fn unicast(socket: SocketId, bytes: Bytes) -> Self {
        Self {
            target: Target::One(socket),
            bytes,
        }
    }

    pub fn broadcast(bytes: Bytes) -> Self {
        Self {
            target: Target::All,
            bytes,
        }
    }

    pub fn registered(satype: u8, bytes: Bytes) -> Self {
        Self {
            target: Target::Registered(satype),
            bytes,
        }
    }
}

/// Extensions echoed by Update and Add replies.
pub(crate) const SA_REPLY_EXTS: &[ExtType] = &[
    ExtType::Sa,
    ExtType::LifetimeHard,
    ExtType::LifetimeSoft,
    ExtType::AddressSrc,
    ExtType::AddressDst,
    ExtType::AddressProxy,
    ExtType::IdentitySrc,
    ExtType::IdentityDst,
    ExtType::Sensitivity,
];

/// Extensions of Get replies and Dump messages.
pub(crate) const SA_FULL_EXTS: &[ExtType] = &[
    ExtType::Sa,
    ExtType::LifetimeCurrent,
    ExtType::LifetimeHard,
    ExtType::LifetimeSoft,
    ExtType::AddressSrc,
    ExtType::AddressDst,
    ExtType::AddressProxy,
    ExtType::KeyAuth,
    ExtType::KeyEncrypt,
    ExtType::IdentitySrc,
    ExtType::IdentityDst,
    ExtType::Sensitivity,
];

/// Extensions of an Expire notification.
pub(crate) const SA_EXPIRE_EXTS: &[ExtType] = &[
    ExtType::Sa,
    ExtType::LifetimeCurrent,
    ExtType::LifetimeSoft,
    ExtType::AddressSrc,
    ExtType::AddressDst,
];

// Lifetimes suggested in acquire proposals, in seconds.
const PROPOSAL_HARD_ADDTIME: u64 = 86_400;
const PROPOSAL_HARD_USETIME: u64 = 28_800;
const PROPOSAL_REPLAY: u8 = 32;

/// Build the selector named by a message's source and destination
/// addresses.
pub(crate) fn selector(exts: &ExtensionMap) -> Result<SecurityIndex> {
    let (Some(src), Some(dst)) = (exts.src(), exts.dst()) else {
        return Err(Error::malformed("source and destination addresses required"));
    };
    Ok(SecurityIndex::prefixes(src.addr, src.prefix, dst.addr, dst.prefix)
        .with_proto(src.proto)
        .with_ports(src.port, dst.port))
}

/// Source and destination address extensions describing a selector.
pub(crate) fn address_exts(index: &SecurityIndex) -> (AddressExt, AddressExt) {
    (
        AddressExt {
            proto: index.proto,
            prefix: index.src_prefix,
            addr: index.src,
            port: index.src_port,
        },
        AddressExt {
            proto: index.proto,
            prefix: index.dst_prefix,
            addr: index.dst,
            port: index.dst_port,
        },
    )
}

/// Wire value of a policy direction.
pub(crate) fn wire_direction(dir: Direction) -> u8 {
    match dir {
        Direction::Inbound => policy_dir::INBOUND,
        Direction::Outbound => policy_dir::OUTBOUND,
        Direction::Bidirectional => policy_dir::ANY,
    }
}

/// State of the key engine.
pub struct SadbState {
    pub(crate) config: KeyConfig,
    pub(crate) spd: Spd,
    pub(crate) sadb: Sadb,
    pub(crate) spi: SpiAllocator,
    pub(crate) acquires: AcquireTracker,
    pub(crate) listeners: ListenerDirectory,
    pub(crate) oracle: Arc<dyn AddressOracle>,
    pub(crate) algorithms: Arc<dyn AlgorithmTable>,
    /// Deliveries produced outside message handling.
    pub(crate) outbox: Vec<Outgoing>,
    pub(crate) last_reseed: u64,
    pub(crate) last_sweep: SweepStats,
}

impl SadbState {
    /// Create an engine with empty databases.
    pub fn new(
        config: KeyConfig,
        oracle: Arc<dyn AddressOracle>,
        algorithms: Arc<dyn AlgorithmTable>,
    ) -> Self {
        let spi = SpiAllocator::new(config.spi_min, config.spi_max, config.spi_trycnt);
        Self {
            config,
            spd: Spd::new(),
            sadb: Sadb::new(),
            spi,
            acquires: AcquireTracker::new(),
            listeners: ListenerDirectory::new(),
            oracle,
            algorithms,
            outbox: Vec::new(),
            last_reseed: 0,
            last_sweep: SweepStats::default(),
        }
    }

    /// Use a deterministic SPI generator.
    pub fn with_spi_seed(mut self, seed: u64) -> Self {
        self.spi = SpiAllocator::with_seed(
            seed,
            self.config.spi_min,
            self.config.spi_max,
            self.config.spi_trycnt,
        );
        self
    }

    pub fn config(&self) -> &KeyConfig {
        &self.config
    }

    pub fn spd(&self) -> &Spd {
        &self.spd
    }

    pub fn sadb(&self) -> &Sadb {
        &self.sadb
    }

    pub fn listeners(&self) -> &ListenerDirectory {
        &self.listeners
    }

    pub fn acquires(&self) -> &AcquireTracker {
        &self.acquires
    }

    /// Counters of the most recent sweeper pass.
    pub fn last_sweep(&self) -> SweepStats {
        self.last_sweep
    }

    pub fn spi_stats(&self) -> SpiStats {
        self.spi.stats()
    }

    pub fn open_socket(&mut self, socket: SocketId) {
        self.listeners.open_socket(socket);
    }

    /// Forget a socket and its registrations.
    pub fn close_socket(&mut self, socket: SocketId) {
        self.listeners.close_socket(socket);
    }

    /// Deliveries produced by the packet path since the last call.
    pub fn take_outgoing(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.outbox)
    }

    /// Handle one message received on `socket`.
    ///
    /// Never fails: a request that cannot be served is answered with a
    /// header-only reply carrying the errno. Input too short to hold a
    /// header is dropped.
    pub fn handle_message(&mut self, socket: SocketId, data: &[u8], now: u64) -> Vec<Outgoing> {
        self.listeners.open_socket(socket);
        let mut out = Vec::new();
        let header = match SadbMsg::from_bytes(data) {
            Ok(header) => header,
            Err(err) => {
                debug!(%socket, error = %err, "dropping runt message");
                return out;
            }
        };

        if !self.listeners.promiscuous().is_empty() {
            out.push(Outgoing {
                target: Target::Promisc,
                bytes: Bytes::copy_from_slice(data),
            });
        }

        match check_envelope(data).and_then(|env| self.dispatch(socket, &env, data, now)) {
            Ok(mut replies) => out.append(&mut replies),
            Err(err) => {
                debug!(
                    %socket,
                    msg_type = header.msg_type,
                    satype = header.satype,
                    seq = header.seq,
                    error = %err,
                    "request rejected"
                );
                out.push(Outgoing::unicast(socket, MessageBuilder::error_reply(&header, &err)));
            }
        }
        out
    }

    /// Route a parsed message to its handler.
    pub fn dispatch(
        &mut self,
        socket: SocketId,
        env: &Envelope,
        raw: &[u8],
        now: u64,
    ) -> Result<Vec<Outgoing>> {
        match env.kind {
            MessageType::GetSpi => self.getspi(socket, env, now),
            MessageType::Update => self.update(env),
            MessageType::Add => self.add(env, now),
            MessageType::Delete => self.delete(env),
            MessageType::Get => self.get(socket, env),
            MessageType::Acquire => self.acquire(env, raw, now),
            MessageType::Register => self.register(socket, env),
            MessageType::Flush => self.flush(env),
            MessageType::Dump => self.dump(socket, env),
            MessageType::Promisc => self.promisc(socket, env, raw),
            MessageType::PolicyAdd => self.spd_add(env, now, false),
            MessageType::PolicyUpdate => self.spd_add(env, now, true),
            MessageType::PolicyDelete => self.spd_delete(env),
            MessageType::PolicyDeleteById => self.spd_delete_by_id(env),
            MessageType::PolicyGet => self.spd_get(socket, env),
            MessageType::PolicyDump => self.spd_dump(socket, env),
            MessageType::PolicyFlush => self.spd_flush(env),
            MessageType::Reserved
            | MessageType::Expire
            | MessageType::PolicyChange
            | MessageType::PolicyAcquire
            | MessageType::PolicySetIndex
            | MessageType::PolicyExpire => Err(Error::Unsupported(format!(
                "{} is not accepted from sockets",
                env.kind
            ))),
        }
    }

    /// Encode an SA into a message with `header`, appending the listed
    /// extensions the SA has values for.
    pub(crate) fn sa_message(
        &self,
        header: SadbMsg,
        sa: &SecurityAssociation,
        parts: &[ExtType],
    ) -> Bytes {
        let mut b = MessageBuilder::with_header(header);
        let addrs = self.sadb.saidx(sa.saidx).map(|head| address_exts(&head.index));
        for ty in parts.iter().copied() {
            match ty {
                ExtType::Sa => {
                    b.sa(sa.sa_ext());
                }
                ExtType::LifetimeCurrent => {
                    b.lifetime(ty, sa.current);
                }
                ExtType::LifetimeHard => {
                    if let Some(l) = sa.hard {
                        b.lifetime(ty, l);
                    }
                }
                ExtType::LifetimeSoft => {
                    if let Some(l) = sa.soft {
                        b.lifetime(ty, l);
                    }
                }
                ExtType::AddressSrc => {
                    if let Some((src, _)) = addrs {
                        b.address(ty, src);
                    }
                }
                ExtType::AddressDst => {
                    if let Some((_, dst)) = addrs {
                        b.address(ty, dst);
                    }
                }
                ExtType::AddressProxy => {
                    if let Some(proxy) = sa.proxy {
                        b.host(ty, proxy);
                    }
                }
                ExtType::KeyAuth => {
                    if let Some(key) = &sa.key_auth {
                        b.key(ty, key);
                    }
                }
                ExtType::KeyEncrypt => {
                    if let Some(key) = &sa.key_enc {
                        b.key(ty, key);
                    }
                }
                ExtType::IdentitySrc | ExtType::IdentityDst => {
                    let ident = if ty == ExtType::IdentitySrc {
                        &sa.ident_src
                    } else {
                        &sa.ident_dst
                    };
                    if let Some(id) = ident {
                        b.append_ext(ty, &Extension::Identity(id.clone()));
                    }
                }
                ExtType::Sensitivity => {
                    if let Some(raw) = &sa.sensitivity {
                        b.append_ext(ty, &Extension::Sensitivity(raw.clone()));
                    }
                }
                _ => {}
            }
        }
        b.finish()
    }

    /// Proposal offered to key daemons for `protocol`.
    pub(crate) fn proposal(&self, protocol: IpsecProtocol) -> ProposalExt {
        let comb = |auth: u8, encrypt: u8| SadbComb {
            auth,
            encrypt,
            soft_allocations: 1,
            hard_allocations: 1,
            soft_addtime: PROPOSAL_HARD_ADDTIME * 80 / 100,
            hard_addtime: PROPOSAL_HARD_ADDTIME,
            soft_usetime: PROPOSAL_HARD_USETIME * 80 / 100,
            hard_usetime: PROPOSAL_HARD_USETIME,
            ..Default::default()
        };
        let auth = self.algorithms.catalogue(AlgorithmKind::Auth);
        let mut combs = Vec::new();
        match protocol {
            IpsecProtocol::Esp => {
                for enc in self.algorithms.catalogue(AlgorithmKind::Encrypt) {
                    for a in std::iter::once(None).chain(auth.iter().map(Some)) {
                        let mut c = comb(a.map_or(aalg::NONE, |a| a.id), enc.id);
                        c.encrypt_minbits = enc.min_bits;
                        c.encrypt_maxbits = enc.max_bits;
                        if let Some(a) = a {
                            c.auth_minbits = a.min_bits;
                            c.auth_maxbits = a.max_bits;
                        }
                        combs.push(c);
                    }
                }
            }
            IpsecProtocol::Ah => {
                for a in auth.iter().filter(|a| a.id != aalg::NULL) {
                    let mut c = comb(a.id, 0);
                    c.auth_minbits = a.min_bits;
                    c.auth_maxbits = a.max_bits;
                    combs.push(c);
                }
            }
            IpsecProtocol::IpComp => {
                for alg in self.algorithms.catalogue(AlgorithmKind::Compress) {
                    combs.push(comb(0, alg.id));
                }
            }
        }
        ProposalExt {
            replay: if protocol == IpsecProtocol::IpComp {
                0
            } else {
                PROPOSAL_REPLAY
            },
            combs,
        }
    }

    /// Ask registered key daemons for an SA covering `index`, unless a
    /// recent request already did.
    pub(crate) fn send_acquire(
        &mut self,
        index: &SecurityIndex,
        protocol: IpsecProtocol,
        proxy: Option<IpAddr>,
        policy: Option<(u32, Direction)>,
        now: u64,
    ) -> Option<Outgoing> {
        let seq = match self
            .acquires
            .request(index, protocol, proxy, now, self.config.blockacq_count)
        {
            AcquireDecision::Send(seq) => seq,
            AcquireDecision::Suppressed => {
                debug!(%index, %protocol, "acquire suppressed");
                return None;
            }
        };

        let satype = protocol.satype();
        let full = index.family.bits();
        let (src, dst) = address_exts(index);
        let mut b = MessageBuilder::new(MessageType::Acquire, satype);
        b.set_seq(seq)
            .address(ExtType::AddressSrc, AddressExt { prefix: full, ..src })
            .address(ExtType::AddressDst, AddressExt { prefix: full, ..dst });
        if let Some(proxy) = proxy {
            b.host(ExtType::AddressProxy, proxy);
        }
        if let Some((id, dir)) = policy {
            let mut ext = PolicyExt::new(PolicyKind::Ipsec);
            ext.id = id;
            ext.dir = wire_direction(dir);
            b.policy(ext);
        }
        b.append_ext(ExtType::Proposal, &Extension::Proposal(self.proposal(protocol)));
        debug!(%index, %protocol, seq, "acquire sent");
        Some(Outgoing::registered(satype, b.finish()))
    }

    // ========================================================================
    // Packet path
    // ========================================================================

    /// Find the policy covering traffic. The caller owns one reference
    /// and gives it back with [`SadbState::release_policy`].
    pub fn lookup_policy(
        &mut self,
        index: &SecurityIndex,
        traffic: Direction,
        now: u64,
    ) -> Option<PolicyKey> {
        self.spd.lookup_for_traffic(index, traffic, now)
    }

    /// Drop a policy reference.
    pub fn release_policy(&mut self, key: PolicyKey) -> Result<()> {
        self.spd.release(key, &mut self.sadb)
    }

    /// Resolve the SA for one request of a policy.
    ///
    /// The SA previously cached on the request is released and the new
    /// match cached in its place; the cache keeps that reference, so the
    /// caller must not release the returned key. When nothing matches an
    /// acquire is queued (see [`SadbState::take_outgoing`]) and
    /// `NotFound` is returned for requests at a required level.
    pub fn check_request(
        &mut self,
        policy: PolicyKey,
        request_idx: usize,
        index: &SecurityIndex,
        now: u64,
    ) -> Result<Option<SaKey>> {
        let p = self
            .spd
            .get(policy)
            .ok_or_else(|| Error::not_found("policy"))?;
        let (policy_id, policy_dir) = (p.id, p.direction);
        let req = p.action.requests().get(request_idx).ok_or_else(|| {
            Error::not_found(format!("request {request_idx} of policy {policy_id}"))
        })?;
        let spec = req.spec.clone();

        if let Some(old) = self.set_request_sa(policy, request_idx, None) {
            self.sadb.release_sa(old)?;
        }

        if let Some(sa) = self.sadb.allocsa_policy(index, spec.protocol, spec.mode) {
            self.set_request_sa(policy, request_idx, Some(sa));
            return Ok(Some(sa));
        }

        if self.config.acquire_enabled
            && let Some(out) = self.send_acquire(
                index,
                spec.protocol,
                spec.proxy,
                Some((policy_id, policy_dir)),
                now,
            )
        {
            self.outbox.push(out);
        }
        if spec.level.is_required() {
            return Err(Error::not_found(format!("{} SA for {index}", spec.protocol)));
        }
        Ok(None)
    }

    fn set_request_sa(
        &mut self,
        policy: PolicyKey,
        request_idx: usize,
        sa: Option<SaKey>,
    ) -> Option<SaKey> {
        let req = self
            .spd
            .get_mut(policy)?
            .action
            .requests_mut()
            .get_mut(request_idx)?;
        std::mem::replace(&mut req.sa, sa)
    }

    /// Find the SA an inbound packet belongs to. The caller owns one
    /// reference and gives it back with [`SadbState::release_sa`].
    pub fn allocsa_by_spi(
        &mut self,
        src: &IpAddr,
        dst: &IpAddr,
        protocol: IpsecProtocol,
        spi: u32,
    ) -> Option<SaKey> {
        self.sadb.allocsa_by_spi(src, dst, protocol, spi)
    }

    /// Drop an SA reference.
    pub fn release_sa(&mut self, key: SaKey) -> Result<()> {
        self.sadb.release_sa(key)
    }

    /// Account traffic carried by an SA.
    pub fn record_use(&mut self, key: SaKey, bytes: u64, now: u64) -> Result<()> {
        self.sadb.record_use(key, bytes, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::algorithm::DefaultAlgorithms;
    use crate::key::direction::StaticAddresses;
    use crate::key::message::{SADB_MSG_LEN, satype};
    use crate::key::policy::{Level, PolicyAction, PolicyLifetime, RequestSpec};
    use crate::key::sa::SaState;

    fn my() -> IpAddr {
        "192.0.2.1".parse().unwrap()
    }

    fn peer() -> IpAddr {
        "198.51.100.7".parse().unwrap()
    }

    fn engine() -> SadbState {
        let oracle = StaticAddresses::new().with(my(), 32);
        SadbState::new(KeyConfig::default(), Arc::new(oracle), Arc::new(DefaultAlgorithms))
            .with_spi_seed(11)
    }

    #[test]
    fn test_runt_message_dropped() {
        let mut e = engine();
        assert!(e.handle_message(SocketId(1), &[2, 9, 0], 1).is_empty());
        assert!(e.listeners().is_open(SocketId(1)));
    }

    #[test]
    fn test_error_reply_carries_errno() {
        let mut e = engine();
        let mut b = MessageBuilder::new(MessageType::Expire, satype::ESP);
        b.set_seq(42).set_pid(7);
        let out = e.handle_message(SocketId(3), &b.finish(), 1);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].target, Target::One(SocketId(3)));
        let hdr = SadbMsg::from_bytes(&out[0].bytes).unwrap();
        assert_eq!(i32::from(hdr.errno), libc::EOPNOTSUPP);
        assert_eq!((hdr.seq, hdr.pid), (42, 7));
        assert_eq!(out[0].bytes.len(), SADB_MSG_LEN);
    }

    #[test]
    fn test_promisc_mirror() {
        let mut e = engine();
        e.listeners.set_promisc(SocketId(9), true);
        let msg = MessageBuilder::new(MessageType::Flush, satype::UNSPEC).finish();
        let out = e.handle_message(SocketId(1), &msg, 1);
        assert_eq!(out[0].target, Target::Promisc);
        assert_eq!(out[0].bytes, msg);
        assert_eq!(out[1].target, Target::All);
    }

    #[test]
    fn test_proposal_shapes() {
        let e = engine();
        let ah = e.proposal(IpsecProtocol::Ah);
        assert!(ah.combs.iter().all(|c| c.encrypt == 0 && c.auth != 0));
        let esp = e.proposal(IpsecProtocol::Esp);
        assert!(esp.combs.iter().any(|c| c.auth == aalg::NONE));
        assert!(esp.combs.iter().all(|c| c.soft_addtime < c.hard_addtime));
        assert_eq!(e.proposal(IpsecProtocol::IpComp).replay, 0);
    }

    #[test]
    fn test_check_request_acquires() {
        let mut e = engine();
        let sel = SecurityIndex::host(my(), peer());
        let action = PolicyAction::ipsec([
            RequestSpec::transport(IpsecProtocol::Esp),
            RequestSpec::transport(IpsecProtocol::Ah).level(Level::Use),
        ]);
        let oracle = e.oracle.clone();
        e.spd
            .add(oracle.as_ref(), sel.clone(), action, PolicyLifetime::default(), 1)
            .unwrap();

        let policy = e.lookup_policy(&sel, Direction::Outbound, 2).unwrap();
        assert!(e.check_request(policy, 0, &sel, 2).unwrap_err().is_not_found());
        assert_eq!(e.check_request(policy, 1, &sel, 2).unwrap(), None);
        let sent = e.take_outgoing();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].target, Target::Registered(satype::ESP));
        assert_eq!(sent[1].target, Target::Registered(satype::AH));
        assert!(e.check_request(policy, 5, &sel, 2).unwrap_err().is_not_found());

        // A repeat inside the block window is suppressed.
        assert!(e.check_request(policy, 0, &sel, 3).is_err());
        assert!(e.take_outgoing().is_empty());

        e.release_policy(policy).unwrap();
    }

    #[test]
    fn test_check_request_caches_sa() {
        let mut e = engine();
        let sel = SecurityIndex::host(my(), peer());
        let g = e.sadb.create_saidx(sel.clone(), Direction::Outbound).unwrap();
        let sa = e
            .sadb
            .insert_sa(SecurityAssociation::larval(0x1234, IpsecProtocol::Esp, g, 1))
            .unwrap();
        e.sadb.move_state(sa, SaState::Mature).unwrap();

        let oracle = e.oracle.clone();
        let policy = e
            .spd
            .add(
                oracle.as_ref(),
                sel.clone(),
                PolicyAction::ipsec([RequestSpec::transport(IpsecProtocol::Esp)]),
                PolicyLifetime::default(),
                1,
            )
            .unwrap();

        assert_eq!(e.check_request(policy, 0, &sel, 2).unwrap(), Some(sa));
        assert_eq!(e.sadb.sa(sa).unwrap().refcnt(), 2);
        // Re-resolving swaps the cached reference rather than stacking it.
        assert_eq!(e.check_request(policy, 0, &sel, 3).unwrap(), Some(sa));
        assert_eq!(e.sadb.sa(sa).unwrap().refcnt(), 2);

        e.spd.mark_dead(policy);
        e.spd.reap(policy, &mut e.sadb).unwrap();
        assert_eq!(e.sadb.sa(sa).unwrap().refcnt(), 1);
        assert!(e.spd.is_empty());
    }
}
