//! Acquire tracking.
//!
//! When traffic needs an SA that does not exist, key daemons are asked to
//! negotiate one. A record per selector and protocol keeps repeated
//! requests for the same traffic from flooding them.

use std::net::IpAddr;

use super::index::SecurityIndex;
use super::message::IpsecProtocol;

/// An outstanding acquire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquireRecord {
    pub index: SecurityIndex,
    pub protocol: IpsecProtocol,
    pub proxy: Option<IpAddr>,
    pub seq: u32,
    pub created: u64,
    /// Suppressed repeats since the last notification.
    pub count: u32,
}

/// What [`AcquireTracker::request`] decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireDecision {
    /// Notify daemons, using this sequence number.
    Send(u32),
    /// A recent notification covers this request.
    Suppressed,
}

/// The set of outstanding acquires.
#[derive(Debug, Default)]
pub struct AcquireTracker {
    records: Vec<AcquireRecord>,
    last_seq: u32,
}

impl AcquireTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Next kernel-originated sequence number, never zero.
    pub fn next_seq(&mut self) -> u32 {
        self.last_seq = self.last_seq.checked_add(1).unwrap_or(1);
        self.last_seq
    }

    /// Record for a selector and protocol.
    pub fn find(&self, index: &SecurityIndex, protocol: IpsecProtocol) -> Option<&AcquireRecord> {
        self.records
            .iter()
            .find(|r| r.protocol == protocol && r.index == *index)
    }

    pub fn find_by_seq(&self, seq: u32) -> Option<&AcquireRecord> {
        self.records.iter().find(|r| r.seq == seq)
    }

    /// Decide whether a new acquire for this traffic should be sent.
    ///
    /// A fresh record is always sent. An existing one is re-sent once more
    /// than `block_count` repeats were suppressed.
    pub fn request(
        &mut self,
        index: &SecurityIndex,
        protocol: IpsecProtocol,
        proxy: Option<IpAddr>,
        now: u64,
        block_count: u32,
    ) -> AcquireDecision {
        if let Some(rec) = self
            .records
            .iter_mut()
            .find(|r| r.protocol == protocol && r.index == *index)
        {
            if rec.count > block_count {
                rec.count = 0;
                return AcquireDecision::Send(rec.seq);
            }
            rec.count += 1;
            return AcquireDecision::Suppressed;
        }

        let seq = self.next_seq();
        self.records.push(AcquireRecord {
            index: index.clone(),
            protocol,
            proxy,
            seq,
            created: now,
            count: 0,
        });
        AcquireDecision::Send(seq)
    }

    /// A daemon reported a failed negotiation: restart the record's clock
    /// so repeats stay blocked for another lifetime.
    pub fn refresh(&mut self, seq: u32, now: u64) -> bool {
        match self.records.iter_mut().find(|r| r.seq == seq) {
            Some(rec) => {
                rec.created = now;
                rec.count = 0;
                true
            }
            None => false,
        }
    }

    /// Drop the record with this sequence number.
    pub fn remove_by_seq(&mut self, seq: u32) -> Option<AcquireRecord> {
        let pos = self.records.iter().position(|r| r.seq == seq)?;
        Some(self.records.remove(pos))
    }

    /// Drop records older than `lifetime` seconds. Returns how many went.
    pub fn expire(&mut self, now: u64, lifetime: u64) -> usize {
        let before = self.records.len();
        self.records
            .retain(|r| now.saturating_sub(r.created) <= lifetime);
        before - self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sel() -> SecurityIndex {
        SecurityIndex::host("10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap())
    }

    #[test]
    fn test_suppression() {
        let mut t = AcquireTracker::new();
        let first = t.request(&sel(), IpsecProtocol::Esp, None, 0, 2);
        let AcquireDecision::Send(seq) = first else {
            panic!("first acquire must be sent");
        };
        for _ in 0..3 {
            assert_eq!(
                t.request(&sel(), IpsecProtocol::Esp, None, 0, 2),
                AcquireDecision::Suppressed
            );
        }
        assert_eq!(t.request(&sel(), IpsecProtocol::Esp, None, 0, 2), AcquireDecision::Send(seq));
        assert_eq!(t.find(&sel(), IpsecProtocol::Esp).unwrap().count, 0);

        // Different protocol, different record.
        assert_ne!(t.request(&sel(), IpsecProtocol::Ah, None, 0, 2), AcquireDecision::Send(seq));
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn test_expire_and_refresh() {
        let mut t = AcquireTracker::new();
        t.request(&sel(), IpsecProtocol::Esp, None, 100, 10);
        let seq = t.find(&sel(), IpsecProtocol::Esp).unwrap().seq;
        assert_eq!(t.expire(120, 20), 0);
        assert!(t.refresh(seq, 115));
        assert_eq!(t.expire(135, 20), 0);
        assert_eq!(t.expire(136, 20), 1);
        assert!(t.is_empty());
        assert!(!t.refresh(seq, 140));
    }

    #[test]
    fn test_seq_never_zero() {
        let mut t = AcquireTracker::new();
        t.last_seq = u32::MAX;
        assert_eq!(t.next_seq(), 1);
        assert!(t.remove_by_seq(1).is_none());
    }
}
