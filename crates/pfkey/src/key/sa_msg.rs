//! SA message handlers.

use bytes::Bytes;
use tracing::{debug, info};

use super::algorithm::AlgorithmKind;
use super::builder::MessageBuilder;
use super::direction::{Direction, classify_direction, classify_direction_for_getspi};
use super::engine::{Outgoing, SA_FULL_EXTS, SA_REPLY_EXTS, SadbState, selector};
use super::error::{Error, Result};
use super::ext::{AlgorithmDesc, ExtType, Extension, ExtensionMap, IdentityExt, SaExt, sa_flags};
use super::message::{IpsecProtocol, SADB_MSG_LEN, SadbMsg, satype};
use super::parse::Envelope;
use super::register::SocketId;
use super::sa::{ReplayWindow, SaState, SecurityAssociation};
use super::sadb::SaKey;
use super::validation::{check_key_placement, check_maturity};

fn protocol(env: &Envelope) -> Result<IpsecProtocol> {
    env.protocol()
        .ok_or_else(|| Error::malformed(format!("{} needs an IPsec SA type", env.kind)))
}

fn reply_header(env: &Envelope) -> SadbMsg {
    SadbMsg {
        errno: 0,
        ..env.header
    }
}

/// Checks shared by Update and Add.
fn check_sa_request(env: &Envelope) -> Result<(IpsecProtocol, SaExt)> {
    let protocol = protocol(env)?;
    let ext = env
        .exts
        .sa()
        .copied()
        .ok_or_else(|| Error::malformed("SA extension required"))?;
    let key_auth = env.exts.key(ExtType::KeyAuth);
    let key_enc = env.exts.key(ExtType::KeyEncrypt);
    match protocol {
        IpsecProtocol::Esp if key_enc.is_none() => {
            return Err(Error::malformed("ESP SA without an encryption key"));
        }
        IpsecProtocol::Ah if key_auth.is_none() => {
            return Err(Error::malformed("AH SA without an auth key"));
        }
        _ => {}
    }
    check_key_placement(protocol, key_auth, key_enc)?;
    if env.exts.contains(ExtType::LifetimeHard) != env.exts.contains(ExtType::LifetimeSoft) {
        return Err(Error::malformed("hard and soft lifetimes must come together"));
    }
    Ok((protocol, ext))
}

fn identity(exts: &ExtensionMap, ty: ExtType) -> Option<IdentityExt> {
    match exts.get(ty) {
        Some(Extension::Identity(id)) => Some(id.clone()),
        _ => None,
    }
}

/// Overwrite an SA's negotiated fields from a message.
fn fill_sa(sa: &mut SecurityAssociation, exts: &ExtensionMap, ext: &SaExt) {
    sa.apply_sa_ext(ext);
    if let Some(proxy) = exts.proxy() {
        sa.proxy = Some(proxy.addr);
    }
    sa.key_auth = exts.key(ExtType::KeyAuth).cloned();
    sa.key_enc = exts.key(ExtType::KeyEncrypt).cloned();
    sa.ident_src = identity(exts, ExtType::IdentitySrc);
    sa.ident_dst = identity(exts, ExtType::IdentityDst);
    sa.sensitivity = match exts.get(ExtType::Sensitivity) {
        Some(Extension::Sensitivity(raw)) => Some(raw.clone()),
        _ => None,
    };
    sa.hard = exts.lifetime(ExtType::LifetimeHard).copied();
    sa.soft = exts.lifetime(ExtType::LifetimeSoft).copied();
    sa.replay = (ext.flags & sa_flags::OLD == 0).then(|| ReplayWindow::new(ext.replay));
}

impl SadbState {
    /// Validate a freshly filled Larval SA and make it Mature. A rejected
    /// SA is deleted.
    fn mature(&mut self, key: SaKey) -> Result<()> {
        let sa = self
            .sadb
            .sa(key)
            .ok_or(Error::Corrupted("SA vanished during update"))?;
        if let Err(err) = check_maturity(sa, self.algorithms.as_ref()) {
            debug!(spi = format_args!("{:#x}", sa.spi), error = %err, "SA rejected");
            self.sadb.mark_dead(key)?;
            return Err(err);
        }
        self.sadb.move_state(key, SaState::Mature)?;
        if let Some(sa) = self.sadb.sa(key) {
            info!(
                spi = format_args!("{:#x}", sa.spi),
                satype = ?sa.protocol,
                "SA mature"
            );
        }
        Ok(())
    }

    fn sa_reply(&self, env: &Envelope, key: SaKey) -> Result<Vec<Outgoing>> {
        let sa = self
            .sadb
            .sa(key)
            .ok_or(Error::Corrupted("SA vanished before reply"))?;
        let bytes = self.sa_message(reply_header(env), sa, SA_REPLY_EXTS);
        Ok(vec![Outgoing::broadcast(bytes)])
    }

    /// Reserve an SPI with a Larval SA.
    pub(crate) fn getspi(
        &mut self,
        socket: SocketId,
        env: &Envelope,
        now: u64,
    ) -> Result<Vec<Outgoing>> {
        let protocol = protocol(env)?;
        let index = selector(&env.exts)?;
        let proxy = env.exts.proxy().map(|p| p.addr);
        let dir = classify_direction_for_getspi(self.oracle.as_ref(), &index, proxy.as_ref())
            .direction()
            .ok_or(Error::InvalidDirection)?;
        if dir == Direction::Outbound {
            return Err(Error::InvalidDirection);
        }

        let spi = self.spi.allocate(env.exts.spirange(), protocol, &self.sadb)?;
        let (group, created) = self.sadb.get_or_create_saidx(&index, dir)?;
        let mut sa = SecurityAssociation::larval(spi, protocol, group, now);
        sa.seq = if env.seq() != 0 {
            env.seq()
        } else {
            self.acquires.next_seq()
        };
        sa.pid = env.pid();
        sa.proxy = proxy;
        let seq = sa.seq;
        if let Err(err) = self.sadb.insert_sa(sa) {
            if created {
                self.sadb.remove_saidx(group)?;
            }
            return Err(err);
        }
        if env.seq() != 0 && self.acquires.remove_by_seq(env.seq()).is_some() {
            debug!(seq, "acquire answered");
        }
        debug!(spi = format_args!("{:#x}", spi), satype = ?protocol, seq, "SPI reserved");

        let mut b = MessageBuilder::reply(&env.header);
        b.set_seq(seq).sa(SaExt {
            spi,
            ..Default::default()
        });
        if let (Some(src), Some(dst)) = (env.exts.src(), env.exts.dst()) {
            b.address(ExtType::AddressSrc, *src)
                .address(ExtType::AddressDst, *dst);
        }
        Ok(vec![Outgoing::unicast(socket, b.finish())])
    }

    /// Complete a Larval SA created by GetSpi.
    pub(crate) fn update(&mut self, env: &Envelope) -> Result<Vec<Outgoing>> {
        let (protocol, ext) = check_sa_request(env)?;
        let index = selector(&env.exts)?;
        let proxy = env.exts.proxy().map(|p| p.addr);
        let dir = classify_direction(self.oracle.as_ref(), &index, proxy.as_ref())
            .direction()
            .filter(|d| d.is_inbound())
            .ok_or(Error::InvalidDirection)?;
        let group = self
            .sadb
            .find_saidx(&index, dir)
            .ok_or_else(|| Error::not_found(format!("SAIdx {index}")))?;
        let key = self
            .sadb
            .find_larval(group, env.seq(), ext.spi)
            .ok_or_else(|| Error::not_found(format!("larval {protocol} SA seq {}", env.seq())))?;

        let sa = self
            .sadb
            .sa_mut(key)
            .ok_or(Error::Corrupted("larval SA missing"))?;
        if sa.protocol != protocol {
            return Err(Error::not_found(format!("larval {protocol} SA")));
        }
        if sa.spi != ext.spi {
            return Err(Error::malformed(format!(
                "SPI {:#x} does not match reserved {:#x}",
                ext.spi, sa.spi
            )));
        }
        if sa.pid != env.pid() {
            return Err(Error::malformed(format!(
                "pid {} does not match reserving pid {}",
                env.pid(),
                sa.pid
            )));
        }
        fill_sa(sa, &env.exts, &ext);

        self.mature(key)?;
        self.sa_reply(env, key)
    }

    /// Install a complete SA.
    pub(crate) fn add(&mut self, env: &Envelope, now: u64) -> Result<Vec<Outgoing>> {
        let (protocol, ext) = check_sa_request(env)?;
        let index = selector(&env.exts)?;
        let proxy = env.exts.proxy().map(|p| p.addr);
        let dir = classify_direction(self.oracle.as_ref(), &index, proxy.as_ref())
            .direction()
            .ok_or(Error::InvalidDirection)?;

        if dir.is_inbound() && self.sadb.spi_in_use(protocol, ext.spi) {
            return Err(Error::exists(format!("{protocol} SPI {:#x}", ext.spi)));
        }
        if dir == Direction::Outbound
            && let Some(group) = self.sadb.find_saidx(&index, dir)
            && self
                .sadb
                .find_sa_by_spi(group, protocol, ext.spi, &SaState::ALIVE)
                .is_some()
        {
            return Err(Error::exists(format!("{protocol} SPI {:#x}", ext.spi)));
        }

        let (group, created) = self.sadb.get_or_create_saidx(&index, dir)?;
        let mut sa = SecurityAssociation::larval(ext.spi, protocol, group, now);
        sa.seq = env.seq();
        sa.pid = env.pid();
        fill_sa(&mut sa, &env.exts, &ext);

        let result = match self.sadb.insert_sa(sa) {
            Ok(key) => self.mature(key).map(|()| key),
            Err(err) => Err(err),
        };
        match result {
            Ok(key) => self.sa_reply(env, key),
            Err(err) => {
                if created && self.sadb.saidx(group).is_some_and(|h| h.is_empty()) {
                    self.sadb.remove_saidx(group)?;
                }
                Err(err)
            }
        }
    }

    /// Delete one SA, or every SA of the type on a selector.
    pub(crate) fn delete(&mut self, env: &Envelope) -> Result<Vec<Outgoing>> {
        let protocol = protocol(env)?;
        let index = selector(&env.exts)?;
        let group = self
            .sadb
            .find_saidx_any(&index)
            .ok_or_else(|| Error::not_found(format!("SAIdx {index}")))?;

        let mut b = MessageBuilder::reply(&env.header);
        match env.exts.sa() {
            Some(ext) => {
                let key = self
                    .sadb
                    .find_sa_by_spi(group, protocol, ext.spi, &SaState::ALIVE)
                    .ok_or_else(|| Error::not_found(format!("{protocol} SPI {:#x}", ext.spi)))?;
                self.sadb.mark_dead(key)?;
                info!(spi = format_args!("{:#x}", ext.spi), satype = ?protocol, "SA deleted");
                b.sa(*ext);
            }
            None => {
                let mut count = 0usize;
                for state in SaState::ALIVE {
                    for key in self.sadb.sa_keys(group, state) {
                        if self.sadb.sa(key).is_some_and(|sa| sa.protocol == protocol) {
                            self.sadb.mark_dead(key)?;
                            count += 1;
                        }
                    }
                }
                info!(count, satype = ?protocol, %index, "SAs deleted");
            }
        }
        if let (Some(src), Some(dst)) = (env.exts.src(), env.exts.dst()) {
            b.address(ExtType::AddressSrc, *src)
                .address(ExtType::AddressDst, *dst);
        }
        Ok(vec![Outgoing::broadcast(b.finish())])
    }

    /// Report one SA, keys included.
    pub(crate) fn get(
        &mut self,
        socket: SocketId,
        env: &Envelope,
    ) -> Result<Vec<Outgoing>> {
        let protocol = protocol(env)?;
        let index = selector(&env.exts)?;
        let ext = env
            .exts
            .sa()
            .ok_or_else(|| Error::malformed("SA extension required"))?;
        let key = self
            .sadb
            .find_saidx_any(&index)
            .and_then(|g| self.sadb.find_sa_by_spi(g, protocol, ext.spi, &SaState::ALIVE))
            .ok_or_else(|| Error::not_found(format!("{protocol} SPI {:#x}", ext.spi)))?;
        let sa = self
            .sadb
            .sa(key)
            .ok_or(Error::Corrupted("SA listed but not stored"))?;
        Ok(vec![Outgoing::unicast(
            socket,
            self.sa_message(reply_header(env), sa, SA_FULL_EXTS),
        )])
    }

    /// An acquire sent by a key daemon.
    ///
    /// Header-only: the daemon failed to negotiate the acquire with that
    /// sequence number. With a body: the daemon asks for an acquire to be
    /// sent to every registered daemon, and the request itself is echoed
    /// to them as the acknowledgement even when the notification is
    /// suppressed.
    pub(crate) fn acquire(
        &mut self,
        env: &Envelope,
        raw: &[u8],
        now: u64,
    ) -> Result<Vec<Outgoing>> {
        if env.header.is_header_only() {
            if env.seq() != 0 && self.acquires.refresh(env.seq(), now) {
                debug!(seq = env.seq(), errno = env.header.errno, "acquire failed in daemon");
            }
            return Ok(Vec::new());
        }

        let protocol = protocol(env)?;
        let index = selector(&env.exts)?;
        if env.exts.proposal().is_none() {
            return Err(Error::malformed("proposal required"));
        }
        let proxy = env.exts.proxy().map(|p| p.addr);
        let dir = classify_direction(self.oracle.as_ref(), &index, proxy.as_ref())
            .direction()
            .ok_or(Error::InvalidDirection)?;
        if self.sadb.find_saidx(&index, dir).is_some() {
            return Err(Error::exists(format!("SAIdx {index}")));
        }
        let mut out: Vec<Outgoing> = self
            .send_acquire(&index, protocol, proxy, None, now)
            .into_iter()
            .collect();
        out.push(Outgoing::registered(
            env.satype(),
            Bytes::copy_from_slice(raw),
        ));
        Ok(out)
    }

    /// Register a socket for an SA type and return the algorithm catalogue.
    pub(crate) fn register(
        &mut self,
        socket: SocketId,
        env: &Envelope,
    ) -> Result<Vec<Outgoing>> {
        if env.satype() != satype::UNSPEC {
            self.listeners.register(socket, env.satype())?;
            debug!(%socket, satype = env.satype(), "registered");
        }
        let supported = |kind| -> Vec<AlgorithmDesc> {
            self.algorithms
                .catalogue(kind)
                .into_iter()
                .map(AlgorithmDesc::from)
                .collect()
        };
        let mut b = MessageBuilder::reply(&env.header);
        b.append_ext(
            ExtType::SupportedAuth,
            &Extension::Supported(supported(AlgorithmKind::Auth)),
        )
        .append_ext(
            ExtType::SupportedEncrypt,
            &Extension::Supported(supported(AlgorithmKind::Encrypt)),
        );
        Ok(vec![Outgoing::unicast(socket, b.finish())])
    }

    /// Delete every SA of a type, or all SAs for UNSPEC.
    pub(crate) fn flush(&mut self, env: &Envelope) -> Result<Vec<Outgoing>> {
        let count = self.sadb.flush(env.protocol())?;
        info!(count, satype = env.satype(), "SADB flushed");
        Ok(vec![Outgoing::broadcast(
            MessageBuilder::reply(&env.header).finish(),
        )])
    }

    /// One message per SA, the last one with sequence number 0.
    pub(crate) fn dump(
        &mut self,
        socket: SocketId,
        env: &Envelope,
    ) -> Result<Vec<Outgoing>> {
        let filter = env.protocol();
        let keys: Vec<SaKey> = self
            .sadb
            .iter_sas()
            .filter(|(_, sa)| filter.is_none_or(|p| sa.protocol == p))
            .map(|(k, _)| k)
            .collect();
        if keys.is_empty() {
            return Err(Error::NoEntries);
        }

        let mut remaining = keys.len();
        let mut out = Vec::with_capacity(remaining);
        for key in keys {
            remaining -= 1;
            let Some(sa) = self.sadb.sa(key) else {
                continue;
            };
            let header = SadbMsg {
                errno: 0,
                satype: sa.protocol.satype(),
                seq: u32::try_from(remaining).unwrap_or(u32::MAX),
                ..env.header
            };
            out.push(Outgoing::unicast(
                socket,
                self.sa_message(header, sa, SA_FULL_EXTS),
            ));
        }
        Ok(out)
    }

    /// Toggle promiscuous mode, or relay an embedded message to everyone.
    pub(crate) fn promisc(
        &mut self,
        socket: SocketId,
        env: &Envelope,
        raw: &[u8],
    ) -> Result<Vec<Outgoing>> {
        if env.header.is_header_only() {
            let on = match env.satype() {
                0 => false,
                1 => true,
                other => {
                    return Err(Error::malformed(format!("promiscuous flag {other}")));
                }
            };
            self.listeners.set_promisc(socket, on);
            debug!(%socket, on, "promiscuous mode");
            return Ok(vec![Outgoing::unicast(
                socket,
                MessageBuilder::reply(&env.header).finish(),
            )]);
        }
        let inner = raw.get(SADB_MSG_LEN..).unwrap_or_default();
        Ok(vec![Outgoing::broadcast(Bytes::copy_from_slice(inner))])
    }
}
