//! Connection Set Identifier Registry
//!
//! Links peer-issued CSIDs to the sessions depending on them so that a
//! restarting peer's sessions can be enumerated without scanning the
//! partition. Each partition owns one registry; local CSIDs are taken
//! from a range reserved for that partition.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::IpAddr;

use crate::identity::PartitionId;
use crate::types::Csid;

/// Local CSIDs available to one partition
const LOCAL_CSIDS_PER_PARTITION: u16 = 1024;

/// Sessions grouped under one peer CSID
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsidRecord {
    /// CSID this node issued for the group, none while the partition's
    /// range is exhausted
    pub local: Option<Csid>,
    pub sessions: BTreeSet<u64>,
}

#[derive(Debug)]
pub struct CsidRegistry {
    base: Csid,
    next: u16,
    live: HashSet<Csid>,
    records: HashMap<(IpAddr, Csid), CsidRecord>,
    by_peer: HashMap<IpAddr, BTreeSet<Csid>>,
    by_session: HashMap<u64, BTreeSet<(IpAddr, Csid)>>,
}

impl CsidRegistry {
    pub fn new(partition: PartitionId) -> Self {
        // 64 partitions of 1024 fill the 16-bit CSID space exactly
        let base = u16::try_from(partition)
            .ok()
            .and_then(|p| p.checked_mul(LOCAL_CSIDS_PER_PARTITION))
            .unwrap_or_else(|| {
                log::error!("partition[{partition}] outside the local CSID space");
                0
            });
        Self {
            base,
            next: 0,
            live: HashSet::new(),
            records: HashMap::new(),
            by_peer: HashMap::new(),
            by_session: HashMap::new(),
        }
    }

    /// Next free CSID of the partition's range; CSID 0 is never issued
    fn allocate_local(&mut self) -> Option<Csid> {
        for _ in 0..LOCAL_CSIDS_PER_PARTITION {
            let local = self.base + self.next;
            self.next = (self.next + 1) % LOCAL_CSIDS_PER_PARTITION;
            if local != 0 && self.live.insert(local) {
                return Some(local);
            }
        }
        log::warn!("Local CSIDs exhausted from base[{}]", self.base);
        None
    }

    /// Bind a session under a peer CSID, returning the local CSID of the group
    pub fn bind(&mut self, peer: IpAddr, csid: Csid, seid: u64) -> Option<Csid> {
        let local = match self.records.get(&(peer, csid)) {
            Some(record) => record.local,
            None => {
                let local = self.allocate_local();
                self.records.insert(
                    (peer, csid),
                    CsidRecord {
                        local,
                        sessions: BTreeSet::new(),
                    },
                );
                self.by_peer.entry(peer).or_default().insert(csid);
                log::debug!("[Added] CSID peer[{peer}] csid[{csid}] local[{local:?}]");
                local
            }
        };
        if let Some(record) = self.records.get_mut(&(peer, csid)) {
            record.sessions.insert(seid);
        }
        self.by_session.entry(seid).or_default().insert((peer, csid));
        local
    }

    /// Remove a session from every CSID; returns the CSID records that became empty
    pub fn unbind(&mut self, seid: u64) -> Vec<(IpAddr, Csid)> {
        let mut removed = Vec::new();
        let Some(keys) = self.by_session.remove(&seid) else {
            return removed;
        };
        for key in keys {
            let empty = match self.records.get_mut(&key) {
                Some(record) => {
                    record.sessions.remove(&seid);
                    record.sessions.is_empty()
                }
                None => false,
            };
            if empty {
                if let Some(local) = self.records.remove(&key).and_then(|record| record.local) {
                    self.live.remove(&local);
                }
                let (peer, csid) = key;
                if let Some(csids) = self.by_peer.get_mut(&peer) {
                    csids.remove(&csid);
                    if csids.is_empty() {
                        self.by_peer.remove(&peer);
                    }
                }
                log::debug!("[Removed] CSID peer[{peer}] csid[{csid}]");
                removed.push(key);
            }
        }
        removed
    }

    /// Sessions bound under any CSID of a peer, each yielded once
    pub fn sessions_for(&self, peer: IpAddr) -> SessionsFor<'_> {
        let csids = self
            .by_peer
            .get(&peer)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        SessionsFor::new(self, peer, csids)
    }

    /// Sessions bound under the listed CSIDs of a peer, each yielded once
    pub fn sessions_for_csids(&self, peer: IpAddr, csids: &[Csid]) -> SessionsFor<'_> {
        SessionsFor::new(self, peer, csids.to_vec())
    }

    pub fn record(&self, peer: IpAddr, csid: Csid) -> Option<&CsidRecord> {
        self.records.get(&(peer, csid))
    }

    /// Whether the session is bound under the peer CSID
    pub fn is_bound(&self, peer: IpAddr, csid: Csid, seid: u64) -> bool {
        self.by_session
            .get(&seid)
            .is_some_and(|keys| keys.contains(&(peer, csid)))
    }

    /// Peer CSIDs a session is bound under
    pub fn bindings_of(&self, seid: u64) -> impl Iterator<Item = (IpAddr, Csid)> + '_ {
        self.by_session.get(&seid).into_iter().flatten().copied()
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn peer_count(&self) -> usize {
        self.by_peer.len()
    }
}

/// Lazy, deduplicating session iterator over a set of CSID records
pub struct SessionsFor<'a> {
    registry: &'a CsidRegistry,
    peer: IpAddr,
    csids: Vec<Csid>,
    current: Option<std::collections::btree_set::Iter<'a, u64>>,
    seen: HashSet<u64>,
}

impl<'a> SessionsFor<'a> {
    fn new(registry: &'a CsidRegistry, peer: IpAddr, mut csids: Vec<Csid>) -> Self {
        // consumed from the back
        csids.reverse();
        Self {
            registry,
            peer,
            csids,
            current: None,
            seen: HashSet::new(),
        }
    }
}

impl Iterator for SessionsFor<'_> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        loop {
            if let Some(iter) = self.current.as_mut() {
                for seid in iter.by_ref() {
                    if self.seen.insert(*seid) {
                        return Some(*seid);
                    }
                }
            }
            let csid = self.csids.pop()?;
            self.current = self
                .registry
                .records
                .get(&(self.peer, csid))
                .map(|record| record.sessions.iter());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> IpAddr {
        "10.0.0.7".parse().unwrap()
    }

    #[test]
    fn test_bind_reuses_local() {
        let mut reg = CsidRegistry::new(0);
        let a = reg.bind(peer(), 10, 1);
        let b = reg.bind(peer(), 10, 2);
        let c = reg.bind(peer(), 11, 3);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(reg.record_count(), 2);
        assert!(reg.is_bound(peer(), 10, 2));
    }

    #[test]
    fn test_partition_local_ranges() {
        let mut p0 = CsidRegistry::new(0);
        let mut p1 = CsidRegistry::new(1);
        assert_eq!(p0.bind(peer(), 1, 1), Some(1));
        assert_eq!(p1.bind(peer(), 1, 1), Some(LOCAL_CSIDS_PER_PARTITION));
        assert_eq!(p1.bind(peer(), 2, 2), Some(LOCAL_CSIDS_PER_PARTITION + 1));
    }

    #[test]
    fn test_last_partition_stays_in_range() {
        let mut reg = CsidRegistry::new(63);
        let ids: Vec<Csid> = (0..LOCAL_CSIDS_PER_PARTITION)
            .filter_map(|csid| reg.bind(peer(), csid, u64::from(csid)))
            .collect();
        assert_eq!(ids.len(), usize::from(LOCAL_CSIDS_PER_PARTITION));
        assert_eq!(ids.first(), Some(&64512));
        assert_eq!(ids.last(), Some(&u16::MAX));
        assert_eq!(reg.bind(peer(), 5000, 5000), None);
        // the peer binding survives without a local id
        assert!(reg.is_bound(peer(), 5000, 5000));
    }

    #[test]
    fn test_live_local_not_reissued_after_wrap() {
        let mut reg = CsidRegistry::new(0);
        let kept = reg.bind(peer(), 0, 0);
        assert_eq!(kept, Some(1));
        // churn through the rest of the range so the cursor wraps
        for round in 0..3u64 {
            for csid in 1..LOCAL_CSIDS_PER_PARTITION {
                let seid = round * 10_000 + u64::from(csid);
                let local = reg.bind(peer(), csid, seid);
                assert!(local.is_some());
                assert_ne!(local, kept);
                reg.unbind(seid);
            }
        }
        assert_eq!(reg.record(peer(), 0).and_then(|r| r.local), kept);
    }

    #[test]
    fn test_unbind_removes_empty_records() {
        let mut reg = CsidRegistry::new(0);
        reg.bind(peer(), 10, 1);
        reg.bind(peer(), 10, 2);
        assert!(reg.unbind(1).is_empty());
        assert_eq!(reg.unbind(2), vec![(peer(), 10)]);
        assert_eq!(reg.record_count(), 0);
        assert_eq!(reg.peer_count(), 0);
        assert!(reg.unbind(2).is_empty());
    }

    #[test]
    fn test_sessions_for_dedup() {
        let mut reg = CsidRegistry::new(0);
        reg.bind(peer(), 10, 1);
        reg.bind(peer(), 10, 2);
        reg.bind(peer(), 11, 2);
        reg.bind(peer(), 11, 3);
        reg.bind("10.0.0.8".parse().unwrap(), 10, 4);
        let mut sessions: Vec<u64> = reg.sessions_for(peer()).collect();
        sessions.sort_unstable();
        assert_eq!(sessions, vec![1, 2, 3]);
        // restartable
        assert_eq!(reg.sessions_for(peer()).count(), 3);
        let only: Vec<u64> = reg.sessions_for_csids(peer(), &[11]).collect();
        assert_eq!(only, vec![2, 3]);
        assert_eq!(reg.sessions_for("10.9.9.9".parse().unwrap()).count(), 0);
    }
}
