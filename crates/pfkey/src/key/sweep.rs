//! Periodic sweeper.
//!
//! One pass ages every database: dead policies are reaped, policies past
//! their limits expire, SAs move through their lifetimes, stale acquire
//! records are forgotten, and the SPI generator is reseeded now and then.
//! A failure on one entry is logged and the pass moves on.

use tracing::{info, trace, warn};

use super::engine::{Outgoing, SA_EXPIRE_EXTS, SadbState};
use super::error::Result;
use super::message::{MessageType, SadbMsg};
use super::sa::SaState;
use super::sadb::{SaIdxKey, SaKey};

/// What a pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub policies_reaped: usize,
    pub policies_expired: usize,
    pub groups_removed: usize,
    pub larval_dropped: usize,
    pub soft_expired: usize,
    pub hard_expired: usize,
    pub acquires_expired: usize,
}

impl SadbState {
    /// Run one sweeper pass at `now`. Returns the notifications to send.
    pub fn sweep(&mut self, now: u64) -> Vec<Outgoing> {
        let mut out = Vec::new();
        let mut stats = SweepStats::default();

        self.sweep_spd(now, &mut out, &mut stats);
        for group in self.sadb.saidx_keys() {
            if let Err(err) = self.sweep_group(group, now, &mut out, &mut stats) {
                warn!(error = %err, "sweeping SA group failed");
            }
        }
        stats.acquires_expired = self.acquires.expire(now, self.config.blockacq_lifetime);

        if now.saturating_sub(self.last_reseed) >= self.config.random_interval {
            self.spi.reseed();
            self.last_reseed = now;
            trace!("SPI generator reseeded");
        }

        trace!(?stats, "sweep pass");
        self.last_sweep = stats;
        out
    }

    fn sweep_spd(&mut self, now: u64, out: &mut Vec<Outgoing>, stats: &mut SweepStats) {
        for key in self.spd.keys() {
            let Some(policy) = self.spd.get(key) else {
                continue;
            };
            if policy.is_alive() {
                if !policy.is_expired(now) {
                    continue;
                }
                info!(id = policy.id, "policy expired");
                out.push(Outgoing::broadcast(self.spd_expire_message(policy)));
                self.spd.mark_dead(key);
                stats.policies_expired += 1;
                continue;
            }
            match self.spd.reap(key, &mut self.sadb) {
                Ok(()) if self.spd.get(key).is_none() => stats.policies_reaped += 1,
                Ok(()) => {}
                Err(err) => warn!(error = %err, "reaping policy failed"),
            }
        }
    }

    fn sweep_group(
        &mut self,
        group: SaIdxKey,
        now: u64,
        out: &mut Vec<Outgoing>,
        stats: &mut SweepStats,
    ) -> Result<()> {
        let Some(head) = self.sadb.saidx(group) else {
            return Ok(());
        };
        if head.is_dead() {
            if head.is_empty() {
                self.sadb.remove_saidx(group)?;
                stats.groups_removed += 1;
            }
            return Ok(());
        }

        for key in self.sadb.sa_keys(group, SaState::Larval) {
            let old = self
                .sadb
                .sa(key)
                .is_some_and(|sa| now.saturating_sub(sa.created) > self.config.larval_lifetime);
            if old {
                self.sadb.mark_dead(key)?;
                stats.larval_dropped += 1;
            }
        }

        for key in self.sadb.sa_keys(group, SaState::Mature) {
            if let Err(err) = self.sweep_mature(key, now, out, stats) {
                warn!(error = %err, "sweeping mature SA failed");
            }
        }

        for key in self.sadb.sa_keys(group, SaState::Dying) {
            let Some(sa) = self.sadb.sa(key) else {
                continue;
            };
            let Some(hard) = sa.hard else {
                continue;
            };
            let aged = hard.add_time != 0 && now.saturating_sub(sa.created) > hard.add_time;
            let worn = hard.bytes != 0 && sa.current.bytes >= hard.bytes;
            if aged || worn {
                info!(spi = format_args!("{:#x}", sa.spi), satype = ?sa.protocol, "SA hard expired");
                if let Err(err) = self.sadb.mark_dead(key) {
                    warn!(error = %err, "expiring dying SA failed");
                    continue;
                }
                stats.hard_expired += 1;
            }
        }

        if self.sadb.saidx(group).is_some_and(|h| h.is_empty()) {
            self.sadb.mark_saidx_dead(group);
        }
        Ok(())
    }

    fn sweep_mature(
        &mut self,
        key: SaKey,
        now: u64,
        out: &mut Vec<Outgoing>,
        stats: &mut SweepStats,
    ) -> Result<()> {
        let Some(sa) = self.sadb.sa(key) else {
            return Ok(());
        };
        let Some(soft) = sa.soft else {
            return Ok(());
        };

        if soft.add_time != 0 && now.saturating_sub(sa.created) > soft.add_time {
            if !sa.is_used() {
                info!(spi = format_args!("{:#x}", sa.spi), "unused SA soft expired");
                self.sadb.mark_dead(key)?;
                stats.soft_expired += 1;
                return Ok(());
            }
        } else if soft.bytes == 0 || sa.current.bytes < soft.bytes {
            return Ok(());
        }

        self.sadb.move_state(key, SaState::Dying)?;
        stats.soft_expired += 1;
        if let Some(sa) = self.sadb.sa(key) {
            info!(spi = format_args!("{:#x}", sa.spi), satype = ?sa.protocol, "SA dying");
            let mut header = SadbMsg::new(MessageType::Expire, sa.protocol.satype());
            header.seq = sa.seq;
            out.push(Outgoing::registered(
                sa.protocol.satype(),
                self.sa_message(header, sa, SA_EXPIRE_EXTS),
            ));
        }
        Ok(())
    }
}
