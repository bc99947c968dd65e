//! Policy message handlers.

use bytes::Bytes;
use tracing::info;

use super::builder::MessageBuilder;
use super::engine::{Outgoing, SadbState, address_exts, selector, wire_direction};
use super::error::{Error, Result};
use super::ext::{ExtType, LifetimeExt, PolicyExt};
use super::message::{MessageType, SadbMsg, satype};
use super::parse::Envelope;
use super::policy::{PolicyAction, PolicyKind, PolicyLifetime, SecurityPolicy};
use super::register::SocketId;
use super::spd::PolicyKey;

fn policy_ext(env: &Envelope) -> Result<&PolicyExt> {
    env.exts
        .policy()
        .ok_or_else(|| Error::malformed("policy extension required"))
}

fn reply_header(env: &Envelope) -> SadbMsg {
    SadbMsg {
        errno: 0,
        ..env.header
    }
}

impl SadbState {
    /// Encode a policy: optional current lifetime, hard lifetime when
    /// limits are set, addresses, and the policy itself.
    pub(crate) fn policy_message(
        &self,
        header: SadbMsg,
        policy: &SecurityPolicy,
        with_current: bool,
    ) -> Bytes {
        let mut b = MessageBuilder::with_header(header);
        if with_current {
            b.lifetime(
                ExtType::LifetimeCurrent,
                LifetimeExt {
                    add_time: policy.created,
                    use_time: policy.last_used,
                    ..Default::default()
                },
            );
        }
        if policy.limits != PolicyLifetime::default() {
            b.lifetime(
                ExtType::LifetimeHard,
                LifetimeExt {
                    add_time: policy.limits.lifetime,
                    use_time: policy.limits.valid_time,
                    ..Default::default()
                },
            );
        }
        let (src, dst) = address_exts(&policy.index);
        let mut ext = PolicyExt::new(policy.action.kind());
        ext.id = policy.id;
        ext.dir = wire_direction(policy.direction);
        ext.requests = policy.action.specs();
        b.address(ExtType::AddressSrc, src)
            .address(ExtType::AddressDst, dst)
            .policy(ext);
        b.finish()
    }

    /// Notification broadcast when a policy outlives its limits.
    pub(crate) fn spd_expire_message(&self, policy: &SecurityPolicy) -> Bytes {
        let header = SadbMsg::new(MessageType::PolicyExpire, satype::UNSPEC);
        self.policy_message(header, policy, true)
    }

    fn policy_reply(&self, env: &Envelope, key: PolicyKey) -> Result<Bytes> {
        let policy = self
            .spd
            .get(key)
            .ok_or(Error::Corrupted("policy vanished before reply"))?;
        Ok(self.policy_message(reply_header(env), policy, false))
    }

    /// Install a policy; with `replace`, an equal policy is retired first.
    pub(crate) fn spd_add(
        &mut self,
        env: &Envelope,
        now: u64,
        replace: bool,
    ) -> Result<Vec<Outgoing>> {
        let index = selector(&env.exts)?;
        let ext = policy_ext(env)?;
        match ext.kind {
            PolicyKind::Entrust | PolicyKind::Bypass => {
                return Err(Error::malformed(format!(
                    "{:?} policies cannot be installed",
                    ext.kind
                )));
            }
            PolicyKind::Ipsec if ext.requests.is_empty() => {
                return Err(Error::malformed("IPsec policy without requests"));
            }
            _ => {}
        }
        let limits = env
            .exts
            .lifetime(ExtType::LifetimeHard)
            .map(|l| PolicyLifetime {
                lifetime: l.add_time,
                valid_time: l.use_time,
            })
            .unwrap_or_default();
        let action = PolicyAction::from_kind(ext.kind, ext.requests.clone());

        let key = if replace {
            self.spd
                .update(self.oracle.as_ref(), index.clone(), action, limits, now)?
        } else {
            self.spd
                .add(self.oracle.as_ref(), index.clone(), action, limits, now)?
        };
        if let Some(p) = self.spd.get(key) {
            info!(id = p.id, %index, direction = ?p.direction, "policy installed");
        }
        Ok(vec![Outgoing::broadcast(self.policy_reply(env, key)?)])
    }

    /// Delete the policy with an equal selector.
    pub(crate) fn spd_delete(&mut self, env: &Envelope) -> Result<Vec<Outgoing>> {
        let index = selector(&env.exts)?;
        let ext = policy_ext(env)?;
        let action = PolicyAction::from_kind(ext.kind, ext.requests.clone());
        let key = self.spd.delete(self.oracle.as_ref(), &index, &action)?;
        info!(%index, "policy deleted");
        Ok(vec![Outgoing::broadcast(self.policy_reply(env, key)?)])
    }

    /// Delete a policy by id.
    pub(crate) fn spd_delete_by_id(&mut self, env: &Envelope) -> Result<Vec<Outgoing>> {
        let id = policy_ext(env)?.id;
        let key = self.spd.delete_by_id(id)?;
        info!(id, "policy deleted");
        Ok(vec![Outgoing::broadcast(self.policy_reply(env, key)?)])
    }

    /// Report a policy by id.
    pub(crate) fn spd_get(&mut self, socket: SocketId, env: &Envelope) -> Result<Vec<Outgoing>> {
        let id = policy_ext(env)?.id;
        let key = self
            .spd
            .get_by_id(id)
            .ok_or_else(|| Error::not_found(format!("policy id {id}")))?;
        Ok(vec![Outgoing::unicast(socket, self.policy_reply(env, key)?)])
    }

    /// One message per alive policy, the last one with sequence number 0.
    pub(crate) fn spd_dump(&mut self, socket: SocketId, env: &Envelope) -> Result<Vec<Outgoing>> {
        let policies: Vec<&SecurityPolicy> = self
            .spd
            .iter()
            .map(|(_, p)| p)
            .filter(|p| p.is_alive())
            .collect();
        if policies.is_empty() {
            return Err(Error::NoEntries);
        }
        let total = policies.len();
        Ok(policies
            .into_iter()
            .enumerate()
            .map(|(i, p)| {
                let header = SadbMsg {
                    seq: u32::try_from(total - 1 - i).unwrap_or(u32::MAX),
                    ..reply_header(env)
                };
                Outgoing::unicast(socket, self.policy_message(header, p, true))
            })
            .collect())
    }

    /// Delete every policy.
    pub(crate) fn spd_flush(&mut self, env: &Envelope) -> Result<Vec<Outgoing>> {
        let count = self.spd.flush();
        info!(count, "SPD flushed");
        Ok(vec![Outgoing::broadcast(
            MessageBuilder::reply(&env.header).finish(),
        )])
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;
    use std::sync::Arc;

    use super::*;
    use crate::key::algorithm::DefaultAlgorithms;
    use crate::key::config::KeyConfig;
    use crate::key::direction::StaticAddresses;
    use crate::key::engine::Target;
    use crate::key::ext::policy_dir;
    use crate::key::message::IpsecProtocol;
    use crate::key::parse::check_envelope;
    use crate::key::policy::RequestSpec;

    const SOCK: SocketId = SocketId(2);

    fn my() -> IpAddr {
        "192.0.2.1".parse().unwrap()
    }

    fn peer() -> IpAddr {
        "198.51.100.7".parse().unwrap()
    }

    fn engine() -> SadbState {
        let oracle = StaticAddresses::new().with(my(), 32);
        SadbState::new(KeyConfig::default(), Arc::new(oracle), Arc::new(DefaultAlgorithms))
    }

    fn policy_msg(ty: MessageType, ext: PolicyExt) -> MessageBuilder {
        let mut b = MessageBuilder::new(ty, satype::UNSPEC);
        b.host(ExtType::AddressSrc, my())
            .host(ExtType::AddressDst, peer())
            .policy(ext);
        b
    }

    fn esp_policy() -> PolicyExt {
        let mut ext = PolicyExt::new(PolicyKind::Ipsec);
        ext.requests = vec![RequestSpec::transport(IpsecProtocol::Esp)];
        ext
    }

    fn errno(out: &[Outgoing]) -> i32 {
        i32::from(SadbMsg::from_bytes(&out[0].bytes).unwrap().errno)
    }

    fn send(e: &mut SadbState, msg: Bytes) -> Vec<Outgoing> {
        e.handle_message(SOCK, &msg, 5)
    }

    #[test]
    fn test_add_duplicate_policy() {
        let mut e = engine();
        let out = send(&mut e, policy_msg(MessageType::PolicyAdd, esp_policy()).finish());
        assert_eq!(out[0].target, Target::All);
        let reply = check_envelope(&out[0].bytes).unwrap();
        let ext = reply.exts.policy().unwrap();
        assert_ne!(ext.id, 0);
        assert_eq!(ext.dir, policy_dir::OUTBOUND);
        assert_eq!(ext.requests.len(), 1);

        let out = send(&mut e, policy_msg(MessageType::PolicyAdd, esp_policy()).finish());
        assert_eq!(errno(&out), libc::EEXIST);
        assert_eq!(e.spd().len(), 1);
    }

    #[test]
    fn test_rejected_actions() {
        let mut e = engine();
        for kind in [PolicyKind::Entrust, PolicyKind::Bypass, PolicyKind::Ipsec] {
            let out = send(
                &mut e,
                policy_msg(MessageType::PolicyAdd, PolicyExt::new(kind)).finish(),
            );
            assert_eq!(errno(&out), libc::EINVAL, "{kind:?}");
        }
        let out = send(
            &mut e,
            policy_msg(MessageType::PolicyAdd, PolicyExt::new(PolicyKind::Discard)).finish(),
        );
        assert_eq!(errno(&out), 0);
    }

    #[test]
    fn test_lifetime_and_update() {
        let mut e = engine();
        let mut b = policy_msg(MessageType::PolicyAdd, esp_policy());
        b.lifetime(
            ExtType::LifetimeHard,
            LifetimeExt {
                add_time: 60,
                use_time: 10,
                ..Default::default()
            },
        );
        let out = send(&mut e, b.finish());
        let reply = check_envelope(&out[0].bytes).unwrap();
        assert_eq!(reply.exts.lifetime(ExtType::LifetimeHard).unwrap().add_time, 60);
        let first = reply.exts.policy().unwrap().id;

        let out = send(&mut e, policy_msg(MessageType::PolicyUpdate, esp_policy()).finish());
        let second = check_envelope(&out[0].bytes).unwrap().exts.policy().unwrap().id;
        assert_ne!(first, second);
        assert_eq!(e.spd().iter().filter(|(_, p)| p.is_alive()).count(), 1);
    }

    #[test]
    fn test_delete_get_by_id() {
        let mut e = engine();
        let out = send(&mut e, policy_msg(MessageType::PolicyAdd, esp_policy()).finish());
        let id = check_envelope(&out[0].bytes).unwrap().exts.policy().unwrap().id;

        let mut query = PolicyExt::new(PolicyKind::Ipsec);
        query.id = id;
        let mut b = MessageBuilder::new(MessageType::PolicyGet, satype::UNSPEC);
        b.policy(query.clone());
        let out = send(&mut e, b.finish());
        assert_eq!(out[0].target, Target::One(SOCK));
        assert_eq!(check_envelope(&out[0].bytes).unwrap().exts.dst().unwrap().addr, peer());

        let mut b = MessageBuilder::new(MessageType::PolicyDeleteById, satype::UNSPEC);
        b.policy(query.clone());
        let out = send(&mut e, b.finish());
        assert_eq!(out[0].target, Target::All);
        assert_eq!(errno(&out), 0);

        let mut b = MessageBuilder::new(MessageType::PolicyGet, satype::UNSPEC);
        b.policy(query);
        assert_eq!(errno(&send(&mut e, b.finish())), libc::ENOENT);
    }

    #[test]
    fn test_delete_by_selector() {
        let mut e = engine();
        send(&mut e, policy_msg(MessageType::PolicyAdd, esp_policy()).finish());
        let out = send(&mut e, policy_msg(MessageType::PolicyDelete, esp_policy()).finish());
        assert_eq!(errno(&out), 0);
        let out = send(&mut e, policy_msg(MessageType::PolicyDelete, esp_policy()).finish());
        assert_eq!(errno(&out), libc::ENOENT);
    }

    #[test]
    fn test_dump_and_flush() {
        let mut e = engine();
        let out = send(&mut e, MessageBuilder::new(MessageType::PolicyDump, satype::UNSPEC).finish());
        assert_eq!(errno(&out), libc::ENOENT);

        send(&mut e, policy_msg(MessageType::PolicyAdd, esp_policy()).finish());
        let mut b = MessageBuilder::new(MessageType::PolicyAdd, satype::UNSPEC);
        b.host(ExtType::AddressSrc, peer())
            .host(ExtType::AddressDst, my())
            .policy(esp_policy());
        send(&mut e, b.finish());

        let out = send(&mut e, MessageBuilder::new(MessageType::PolicyDump, satype::UNSPEC).finish());
        assert_eq!(out.len(), 2);
        let first = check_envelope(&out[0].bytes).unwrap();
        assert_eq!(first.seq(), 1);
        assert_eq!(first.exts.policy().unwrap().dir, policy_dir::INBOUND);
        assert!(first.exts.lifetime(ExtType::LifetimeCurrent).is_some());
        assert_eq!(check_envelope(&out[1].bytes).unwrap().seq(), 0);

        let flush = MessageBuilder::new(MessageType::PolicyFlush, satype::UNSPEC).finish();
        assert_eq!(send(&mut e, flush.clone())[0].target, Target::All);
        assert_eq!(errno(&send(&mut e, flush)), 0);
        let out = send(&mut e, MessageBuilder::new(MessageType::PolicyDump, satype::UNSPEC).finish());
        assert_eq!(errno(&out), libc::ENOENT);
        // Flushed policies linger until the sweeper reaps them.
        assert_eq!(e.spd().len(), 2);
    }
}
