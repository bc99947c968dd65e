//! Security association database.
//!
//! SAs are grouped under an [`SaIndex`] (selector plus direction). Each
//! group keeps one list per [`SaState`]; an SA's `state` field always
//! names the list it is linked into, and [`Sadb::move_state`] is the only
//! way to change it.

use std::net::IpAddr;

use tracing::{debug, warn};

use super::direction::Direction;
use super::error::{Error, Result};
use super::index::SecurityIndex;
use super::message::IpsecProtocol;
use super::policy::Mode;
use super::sa::{SaState, SecurityAssociation};
use super::store::{Arena, Key, List};

/// Handle to a stored SA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SaKey(pub(crate) Key);

/// Handle to a stored SA group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SaIdxKey(pub(crate) Key);

/// A group of SAs sharing a selector and direction.
#[derive(Debug)]
pub struct SaIndex {
    pub index: SecurityIndex,
    pub direction: Direction,
    states: [List; 4],
    dead: bool,
}

impl SaIndex {
    /// Number of SAs in `state`.
    pub fn len(&self, state: SaState) -> usize {
        self.states[state.slot()].len()
    }

    /// Whether no SA is left in any state.
    pub fn is_empty(&self) -> bool {
        self.states.iter().all(List::is_empty)
    }

    /// Whether the group is waiting to be removed.
    pub fn is_dead(&self) -> bool {
        self.dead
    }
}

/// The SA database.
#[derive(Debug)]
pub struct Sadb {
    heads: Arena<SaIndex>,
    by_dir: [List; 3],
    sas: Arena<SecurityAssociation>,
}

impl Default for Sadb {
    fn default() -> Self {
        Self::new()
    }
}

impl Sadb {
    /// Create an empty database.
    pub fn new() -> Self {
        let mut heads = Arena::new();
        let by_dir = [heads.new_list(), heads.new_list(), heads.new_list()];
        Self {
            heads,
            by_dir,
            sas: Arena::new(),
        }
    }

    /// Number of stored SAs, dead ones included.
    pub fn sa_count(&self) -> usize {
        self.sas.len()
    }

    /// Number of stored SA groups.
    pub fn saidx_count(&self) -> usize {
        self.heads.len()
    }

    pub fn saidx(&self, key: SaIdxKey) -> Option<&SaIndex> {
        self.heads.get(key.0)
    }

    pub fn sa(&self, key: SaKey) -> Option<&SecurityAssociation> {
        self.sas.get(key.0)
    }

    pub(crate) fn sa_mut(&mut self, key: SaKey) -> Option<&mut SecurityAssociation> {
        self.sas.get_mut(key.0)
    }

    fn groups(&self, dir: Direction) -> impl Iterator<Item = (SaIdxKey, &SaIndex)> {
        self.heads
            .iter(&self.by_dir[dir.slot()])
            .map(|(k, h)| (SaIdxKey(k), h))
    }

    fn members(&self, head: &SaIndex, state: SaState) -> impl Iterator<Item = (SaKey, &SecurityAssociation)> {
        self.sas
            .iter(&head.states[state.slot()])
            .map(|(k, sa)| (SaKey(k), sa))
    }

    /// Snapshot of every group key, Inbound first, then Outbound, then
    /// Bidirectional.
    pub fn saidx_keys(&self) -> Vec<SaIdxKey> {
        Direction::ALL
            .iter()
            .flat_map(|d| self.groups(*d).map(|(k, _)| k))
            .collect()
    }

    /// Snapshot of the SAs of a group in one state.
    pub fn sa_keys(&self, saidx: SaIdxKey, state: SaState) -> Vec<SaKey> {
        self.heads
            .get(saidx.0)
            .map(|h| self.members(h, state).map(|(k, _)| k).collect())
            .unwrap_or_default()
    }

    /// Every SA in group order, then state order.
    pub fn iter_sas(&self) -> impl Iterator<Item = (SaKey, &SecurityAssociation)> {
        Direction::ALL.into_iter().flat_map(move |d| {
            self.groups(d).flat_map(move |(_, head)| {
                SaState::ALL
                    .into_iter()
                    .flat_map(move |s| self.members(head, s))
            })
        })
    }

    /// Live group with an exactly equal selector in `dir`.
    pub fn find_saidx(&self, index: &SecurityIndex, dir: Direction) -> Option<SaIdxKey> {
        self.groups(dir)
            .find(|(_, h)| !h.dead && h.index == *index)
            .map(|(k, _)| k)
    }

    /// Live group with an exactly equal selector in any direction.
    pub fn find_saidx_any(&self, index: &SecurityIndex) -> Option<SaIdxKey> {
        Direction::ALL
            .iter()
            .find_map(|d| self.find_saidx(index, *d))
    }

    /// Create a new, empty group.
    pub fn create_saidx(&mut self, index: SecurityIndex, direction: Direction) -> Result<SaIdxKey> {
        let states = [
            self.sas.new_list(),
            self.sas.new_list(),
            self.sas.new_list(),
            self.sas.new_list(),
        ];
        let key = self.heads.insert(SaIndex {
            index,
            direction,
            states,
            dead: false,
        });
        self.heads.push_back(&mut self.by_dir[direction.slot()], key)?;
        Ok(SaIdxKey(key))
    }

    /// Find the group for a selector, creating it if needed. The flag is
    /// `true` when the group was created.
    pub fn get_or_create_saidx(
        &mut self,
        index: &SecurityIndex,
        direction: Direction,
    ) -> Result<(SaIdxKey, bool)> {
        match self.find_saidx(index, direction) {
            Some(key) => Ok((key, false)),
            None => Ok((self.create_saidx(index.clone(), direction)?, true)),
        }
    }

    /// Flag a group for removal by the sweeper.
    pub fn mark_saidx_dead(&mut self, key: SaIdxKey) {
        if let Some(head) = self.heads.get_mut(key.0) {
            head.dead = true;
        }
    }

    /// Unlink and drop an empty group.
    pub fn remove_saidx(&mut self, key: SaIdxKey) -> Result<()> {
        let head = self
            .heads
            .get(key.0)
            .ok_or(Error::Corrupted("remove of a stale SAIdx"))?;
        if !head.is_empty() {
            return Err(Error::Corrupted("removing an SAIdx that still holds SAs"));
        }
        let dir = head.direction;
        self.heads.unlink(&mut self.by_dir[dir.slot()], key.0)?;
        self.heads.remove(key.0)?;
        Ok(())
    }

    /// Store an SA under its group. The database takes the first
    /// reference.
    pub fn insert_sa(&mut self, mut sa: SecurityAssociation) -> Result<SaKey> {
        let group = sa.saidx;
        if !self.heads.contains(group.0) {
            return Err(Error::Corrupted("SA refers to a missing SAIdx"));
        }
        let state = sa.state;
        sa.refcnt = 1;
        let key = self.sas.insert(sa);
        let head = self
            .heads
            .get_mut(group.0)
            .ok_or(Error::Corrupted("SA refers to a missing SAIdx"))?;
        self.sas.push_back(&mut head.states[state.slot()], key)?;
        Ok(SaKey(key))
    }

    /// Move an SA to another state list.
    pub fn move_state(&mut self, key: SaKey, new: SaState) -> Result<()> {
        let sa = self
            .sas
            .get(key.0)
            .ok_or(Error::Corrupted("state change of a stale SA"))?;
        let (old, group) = (sa.state, sa.saidx);
        if old == new {
            return Ok(());
        }
        let head = self
            .heads
            .get_mut(group.0)
            .ok_or(Error::Corrupted("SA refers to a missing SAIdx"))?;
        self.sas.unlink(&mut head.states[old.slot()], key.0)?;
        self.sas.push_back(&mut head.states[new.slot()], key.0)?;
        if let Some(sa) = self.sas.get_mut(key.0) {
            debug!(spi = format_args!("{:#x}", sa.spi), from = %old, to = %new, "SA state change");
            sa.state = new;
        }
        Ok(())
    }

    /// Move an SA to Dead and drop the database's reference.
    pub fn mark_dead(&mut self, key: SaKey) -> Result<()> {
        let state = self
            .sas
            .get(key.0)
            .ok_or(Error::Corrupted("delete of a stale SA"))?
            .state;
        if state == SaState::Dead {
            return Ok(());
        }
        self.move_state(key, SaState::Dead)?;
        self.release_sa(key)
    }

    fn hold(&mut self, key: SaKey) -> SaKey {
        if let Some(sa) = self.sas.get_mut(key.0) {
            sa.refcnt += 1;
        }
        key
    }

    /// Drop one reference. At zero the SA is unlinked and freed.
    ///
    /// Only a Dead SA may reach zero: a release that would take the last
    /// reference of an SA in any other state is refused with `Corrupted`
    /// and changes nothing.
    pub fn release_sa(&mut self, key: SaKey) -> Result<()> {
        let sa = self
            .sas
            .get_mut(key.0)
            .ok_or(Error::Corrupted("release of a stale SA"))?;
        if sa.refcnt == 0 || (sa.refcnt == 1 && sa.state != SaState::Dead) {
            warn!(
                spi = format_args!("{:#x}", sa.spi),
                refcnt = sa.refcnt,
                state = %sa.state,
                "SA refcount underflow"
            );
            return Err(Error::Corrupted("SA refcount underflow"));
        }
        sa.refcnt -= 1;
        if sa.refcnt > 0 {
            return Ok(());
        }

        let (state, group) = (sa.state, sa.saidx);
        let head = self
            .heads
            .get_mut(group.0)
            .ok_or(Error::Corrupted("SA refers to a missing SAIdx"))?;
        self.sas.unlink(&mut head.states[state.slot()], key.0)?;
        let sa = self.sas.remove(key.0)?;
        debug!(spi = format_args!("{:#x}", sa.spi), "SA freed");
        Ok(())
    }

    /// Find a usable SA for outbound traffic matching `query`.
    ///
    /// Mature and Dying SAs compete alike: the most recently added wins,
    /// and the first one found wins a tie. The caller owns one reference
    /// to the result.
    pub fn allocsa_policy(
        &mut self,
        query: &SecurityIndex,
        protocol: IpsecProtocol,
        mode: Mode,
    ) -> Option<SaKey> {
        let mut found: Option<(SaKey, u64)> = None;
        for dir in Direction::ALL {
            for (_, head) in self.groups(dir) {
                if head.dead || !head.index.matches(query) {
                    continue;
                }
                for state in SaState::USABLE {
                    for (key, sa) in self.members(head, state) {
                        if sa.protocol != protocol || !sa.supports_mode(mode) {
                            continue;
                        }
                        if found.is_none_or(|(_, t)| sa.current.add_time > t) {
                            found = Some((key, sa.current.add_time));
                        }
                    }
                }
            }
        }
        found.map(|(key, _)| self.hold(key))
    }

    /// Find the inbound SA a received packet belongs to. The caller owns
    /// one reference to the result.
    pub fn allocsa_by_spi(
        &mut self,
        src: &IpAddr,
        dst: &IpAddr,
        protocol: IpsecProtocol,
        spi: u32,
    ) -> Option<SaKey> {
        let mut found = None;
        'search: for dir in [Direction::Inbound, Direction::Bidirectional] {
            for (_, head) in self.groups(dir) {
                if head.dead {
                    continue;
                }
                for state in SaState::USABLE {
                    for (key, sa) in self.members(head, state) {
                        if sa.spi != spi || sa.protocol != protocol {
                            continue;
                        }
                        let hit = match &sa.proxy {
                            Some(proxy) => proxy == dst,
                            None => head.index.matches_addresses(src, dst),
                        };
                        if hit {
                            found = Some(key);
                            break 'search;
                        }
                    }
                }
            }
        }
        found.map(|key| self.hold(key))
    }

    /// SA of a group with the given SPI and protocol in one of `states`.
    pub fn find_sa_by_spi(
        &self,
        saidx: SaIdxKey,
        protocol: IpsecProtocol,
        spi: u32,
        states: &[SaState],
    ) -> Option<SaKey> {
        let head = self.heads.get(saidx.0)?;
        states.iter().find_map(|s| {
            self.members(head, *s)
                .find(|(_, sa)| sa.spi == spi && sa.protocol == protocol)
                .map(|(k, _)| k)
        })
    }

    /// Larval SA of a group by sequence number, or by SPI when `seq` is 0.
    pub fn find_larval(&self, saidx: SaIdxKey, seq: u32, spi: u32) -> Option<SaKey> {
        let head = self.heads.get(saidx.0)?;
        self.members(head, SaState::Larval)
            .find(|(_, sa)| if seq != 0 { sa.seq == seq } else { sa.spi == spi })
            .map(|(k, _)| k)
    }

    /// Whether an alive SA of `protocol` in an inbound group uses `spi`.
    pub fn spi_in_use(&self, protocol: IpsecProtocol, spi: u32) -> bool {
        [Direction::Inbound, Direction::Bidirectional]
            .into_iter()
            .flat_map(|d| self.groups(d))
            .any(|(_, head)| {
                SaState::ALIVE.iter().any(|s| {
                    self.members(head, *s)
                        .any(|(_, sa)| sa.spi == spi && sa.protocol == protocol)
                })
            })
    }

    /// Account traffic carried by an SA.
    pub fn record_use(&mut self, key: SaKey, bytes: u64, now: u64) -> Result<()> {
        let sa = self.sas.get_mut(key.0).ok_or_else(|| Error::not_found("SA"))?;
        sa.current.bytes = sa.current.bytes.saturating_add(bytes);
        sa.current.allocations = sa.current.allocations.saturating_add(1);
        if sa.current.use_time == 0 {
            sa.current.use_time = now;
        }
        Ok(())
    }

    /// Mark every alive SA of `protocol` (all protocols for `None`) dead.
    /// Groups left empty are flagged for removal. Returns the number of
    /// SAs deleted.
    pub fn flush(&mut self, protocol: Option<IpsecProtocol>) -> Result<usize> {
        let mut count = 0;
        for group in self.saidx_keys() {
            for state in SaState::ALIVE {
                for key in self.sa_keys(group, state) {
                    let matches = self
                        .sa(key)
                        .is_some_and(|sa| protocol.is_none_or(|p| sa.protocol == p));
                    if matches {
                        self.mark_dead(key)?;
                        count += 1;
                    }
                }
            }
            if self.saidx(group).is_some_and(SaIndex::is_empty) {
                self.mark_saidx_dead(group);
            }
        }
        Ok(count)
    }

    /// Check that every SA sits in the list its state names, under the
    /// group it points at, and that no SA is unlinked.
    pub fn verify(&self) -> Result<()> {
        let mut linked = 0;
        for dir in Direction::ALL {
            for (group, head) in self.groups(dir) {
                if head.direction != dir {
                    return Err(Error::Corrupted("SAIdx linked under the wrong direction"));
                }
                for state in SaState::ALL {
                    for (_, sa) in self.members(head, state) {
                        if sa.state != state {
                            return Err(Error::Corrupted("SA state does not match its list"));
                        }
                        if sa.saidx != group {
                            return Err(Error::Corrupted("SA linked under a foreign SAIdx"));
                        }
                        linked += 1;
                    }
                }
            }
        }
        if linked != self.sas.len() {
            return Err(Error::Corrupted("SA stored but not linked"));
        }
        Ok(())
    }
}
