//! Security policy database.

use tracing::{debug, warn};

use super::direction::{AddressOracle, Direction, classify_direction};
use super::error::{Error, Result};
use super::index::SecurityIndex;
use super::policy::{
    Mode, PolicyAction, PolicyLifetime, PolicyState, SecurityPolicy,
};
use super::sadb::Sadb;
use super::store::{Arena, Key, List};

/// Handle to a stored policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PolicyKey(pub(crate) Key);

/// The policy database: one ordered list per direction.
#[derive(Debug)]
pub struct Spd {
    arena: Arena<SecurityPolicy>,
    by_dir: [List; 3],
    next_id: u32,
}

impl Default for Spd {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve the direction of a policy selector. A tunnel request's
/// endpoint stands in as the proxy address.
fn policy_direction(
    oracle: &dyn AddressOracle,
    index: &SecurityIndex,
    action: &PolicyAction,
) -> Result<Direction> {
    let proxy = action
        .requests()
        .iter()
        .find(|r| r.spec.mode == Mode::Tunnel)
        .and_then(|r| r.spec.proxy.as_ref());
    classify_direction(oracle, index, proxy)
        .direction()
        .ok_or(Error::InvalidDirection)
}

impl Spd {
    /// Create an empty database.
    pub fn new() -> Self {
        let mut arena = Arena::new();
        let by_dir = [arena.new_list(), arena.new_list(), arena.new_list()];
        Self {
            arena,
            by_dir,
            next_id: 1,
        }
    }

    /// Number of stored policies, dead ones included.
    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    pub fn get(&self, key: PolicyKey) -> Option<&SecurityPolicy> {
        self.arena.get(key.0)
    }

    pub fn get_mut(&mut self, key: PolicyKey) -> Option<&mut SecurityPolicy> {
        self.arena.get_mut(key.0)
    }

    fn list(&self, dir: Direction) -> impl Iterator<Item = (PolicyKey, &SecurityPolicy)> {
        self.arena
            .iter(&self.by_dir[dir.slot()])
            .map(|(k, p)| (PolicyKey(k), p))
    }

    /// Every linked policy, Inbound first, then Outbound, then
    /// Bidirectional, each in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (PolicyKey, &SecurityPolicy)> {
        Direction::ALL.into_iter().flat_map(|d| self.list(d))
    }

    /// Snapshot of every linked policy key.
    pub fn keys(&self) -> Vec<PolicyKey> {
        self.iter().map(|(k, _)| k).collect()
    }

    fn find_alive(&self, index: &SecurityIndex, dir: Direction) -> Option<PolicyKey> {
        self.list(dir)
            .find(|(_, p)| p.is_alive() && p.index == *index)
            .map(|(k, _)| k)
    }

    fn allocate_id(&mut self) -> u32 {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1).max(1);
            if !self.iter().any(|(_, p)| p.id == id) {
                return id;
            }
        }
    }

    /// Add a policy. Fails with `Exists` when an alive policy with an equal
    /// selector is already stored in the same direction.
    pub fn add(
        &mut self,
        oracle: &dyn AddressOracle,
        index: SecurityIndex,
        action: PolicyAction,
        limits: PolicyLifetime,
        now: u64,
    ) -> Result<PolicyKey> {
        let direction = policy_direction(oracle, &index, &action)?;
        if self.find_alive(&index, direction).is_some() {
            return Err(Error::exists(format!("policy {index}")));
        }
        let id = self.allocate_id();
        debug!(id, %index, ?direction, "policy added");
        let key = self.arena.insert(SecurityPolicy {
            id,
            index,
            direction,
            action,
            state: PolicyState::Alive,
            limits,
            created: now,
            last_used: now,
            refcnt: 1,
        });
        self.arena.push_back(&mut self.by_dir[direction.slot()], key)?;
        Ok(PolicyKey(key))
    }

    /// Add a policy, first retiring any alive policy with an equal
    /// selector in the same direction.
    pub fn update(
        &mut self,
        oracle: &dyn AddressOracle,
        index: SecurityIndex,
        action: PolicyAction,
        limits: PolicyLifetime,
        now: u64,
    ) -> Result<PolicyKey> {
        let direction = policy_direction(oracle, &index, &action)?;
        if let Some(old) = self.find_alive(&index, direction) {
            self.mark_dead(old);
        }
        self.add(oracle, index, action, limits, now)
    }

    /// Mark the alive policy with an equal selector dead.
    pub fn delete(
        &mut self,
        oracle: &dyn AddressOracle,
        index: &SecurityIndex,
        action: &PolicyAction,
    ) -> Result<PolicyKey> {
        let direction = policy_direction(oracle, index, action)?;
        let key = self
            .find_alive(index, direction)
            .ok_or_else(|| Error::not_found(format!("policy {index}")))?;
        self.mark_dead(key);
        Ok(key)
    }

    /// Alive policy by id.
    pub fn get_by_id(&self, id: u32) -> Option<PolicyKey> {
        self.iter()
            .find(|(_, p)| p.is_alive() && p.id == id)
            .map(|(k, _)| k)
    }

    /// Mark the alive policy with this id dead.
    pub fn delete_by_id(&mut self, id: u32) -> Result<PolicyKey> {
        let key = self
            .get_by_id(id)
            .ok_or_else(|| Error::not_found(format!("policy id {id}")))?;
        self.mark_dead(key);
        Ok(key)
    }

    /// Mark a policy dead. Unlinking is left to the sweeper.
    pub fn mark_dead(&mut self, key: PolicyKey) {
        if let Some(p) = self.arena.get_mut(key.0)
            && p.state == PolicyState::Alive
        {
            debug!(id = p.id, "policy dead");
            p.state = PolicyState::Dead;
        }
    }

    /// Mark every policy dead. Returns how many were alive.
    pub fn flush(&mut self) -> usize {
        let keys = self.keys();
        let mut count = 0;
        for key in keys {
            if self.get(key).is_some_and(SecurityPolicy::is_alive) {
                self.mark_dead(key);
                count += 1;
            }
        }
        count
    }

    /// First alive policy covering `query` for traffic in `traffic`.
    ///
    /// Inbound traffic consults Inbound then Bidirectional policies;
    /// outbound traffic consults Outbound then Bidirectional. The caller
    /// owns one reference to the result.
    pub fn lookup_for_traffic(
        &mut self,
        query: &SecurityIndex,
        traffic: Direction,
        now: u64,
    ) -> Option<PolicyKey> {
        let key = [traffic, Direction::Bidirectional]
            .into_iter()
            .find_map(|d| {
                self.list(d)
                    .find(|(_, p)| p.is_alive() && p.index.matches(query))
                    .map(|(k, _)| k)
            })?;
        let p = self.arena.get_mut(key.0)?;
        p.refcnt += 1;
        p.last_used = now;
        Some(key)
    }

    /// Drop one reference. At zero the policy's SA references are released
    /// and the policy is freed.
    ///
    /// The database's own reference outlives every caller's while the
    /// policy is alive, so a release that would take an alive policy to
    /// zero is refused with `Corrupted` and changes nothing.
    pub fn release(&mut self, key: PolicyKey, sadb: &mut Sadb) -> Result<()> {
        let p = self
            .arena
            .get_mut(key.0)
            .ok_or(Error::Corrupted("release of a stale policy"))?;
        if p.refcnt == 0 || (p.refcnt == 1 && p.is_alive()) {
            warn!(id = p.id, refcnt = p.refcnt, "policy refcount underflow");
            return Err(Error::Corrupted("policy refcount underflow"));
        }
        p.refcnt -= 1;
        if p.refcnt > 0 {
            return Ok(());
        }

        let dir = p.direction;
        if self.arena.owner(key.0).is_some() {
            self.arena.unlink(&mut self.by_dir[dir.slot()], key.0)?;
        }
        let policy = self.arena.remove(key.0)?;
        for req in policy.action.requests() {
            if let Some(sa) = req.sa {
                sadb.release_sa(sa)?;
            }
        }
        debug!(id = policy.id, "policy freed");
        Ok(())
    }

    /// Unlink one dead policy and drop the database's reference.
    pub fn reap(&mut self, key: PolicyKey, sadb: &mut Sadb) -> Result<()> {
        let p = self
            .arena
            .get(key.0)
            .ok_or(Error::Corrupted("reap of a stale policy"))?;
        if p.is_alive() || self.arena.owner(key.0).is_none() {
            return Ok(());
        }
        let dir = p.direction;
        self.arena.unlink(&mut self.by_dir[dir.slot()], key.0)?;
        self.release(key, sadb)
    }

    /// Alive policies whose lifetime or idle limit has passed at `now`.
    pub fn expired(&self, now: u64) -> Vec<PolicyKey> {
        self.iter()
            .filter(|(_, p)| p.is_alive() && p.is_expired(now))
            .map(|(k, _)| k)
            .collect()
    }
}
