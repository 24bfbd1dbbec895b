//! Peer Node Liveness
//!
//! One record per (address, role) pair. GTP peers are probed with Echo
//! Request, user plane nodes with PFCP Heartbeat Request, or Association
//! Setup Request while no association exists.
//!
//! ```text
//! Unknown -> ProbeSent -> Reachable
//!                      -> Unreachable -> (remove_after_cycles failed cycles) removed
//! ```

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Instant;

use crate::context::NodeShared;
use crate::gtp_build;
use crate::message::Outbound;
use crate::sx_build;
use crate::timer::{DelayQueue, TimerId};
use crate::types::{GatewayRole, GtpInterface, Interface, PeerKind};
use crate::xact::Seq24;

/// Liveness state of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Unknown,
    ProbeSent,
    Reachable,
    Unreachable,
}

impl PeerState {
    pub fn name(&self) -> &'static str {
        match self {
            PeerState::Unknown => "UNKNOWN",
            PeerState::ProbeSent => "PROBE_SENT",
            PeerState::Reachable => "REACHABLE",
            PeerState::Unreachable => "UNREACHABLE",
        }
    }
}

/// Liveness record of one peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub addr: IpAddr,
    pub kind: PeerKind,
    pub state: PeerState,
    /// Last restart counter (GTP) or recovery time stamp (PFCP) seen
    pub restart_counter: Option<u32>,
    probe_seq: Option<Seq24>,
    probe: Option<Outbound>,
    retries: u32,
    failed_cycles: u32,
    timer: Option<u64>,
}

impl PeerRecord {
    fn new(addr: IpAddr, kind: PeerKind) -> Self {
        Self {
            addr,
            kind,
            state: PeerState::Unknown,
            restart_counter: None,
            probe_seq: None,
            probe: None,
            retries: 0,
            failed_cycles: 0,
            timer: None,
        }
    }

    pub fn is_reachable(&self) -> bool {
        self.state != PeerState::Unreachable
    }
}

/// Outcome of liveness processing, acted on by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessEvent {
    /// Probe budget exhausted, sessions bound to the peer must be cleaned up
    Down { peer: IpAddr, kind: PeerKind },
    /// Restart counter changed, same cleanup but the peer stays reachable
    Restarted { peer: IpAddr, kind: PeerKind },
    /// Peer answered again after being unreachable
    Up { peer: IpAddr, kind: PeerKind },
    /// Record forgotten after repeated failed cycles
    Removed { peer: IpAddr, kind: PeerKind },
}

/// Kind of the GTP peer reached over an interface
pub fn gtp_peer_kind(role: GatewayRole, iface: GtpInterface) -> PeerKind {
    match iface {
        GtpInterface::S11 => PeerKind::Mme,
        GtpInterface::S5s8 if role.relays_to_pgw() => PeerKind::Pgw,
        GtpInterface::S5s8 => PeerKind::Sgw,
    }
}

/// Interface a GTP peer is probed on
fn probe_interface(kind: PeerKind) -> GtpInterface {
    match kind {
        PeerKind::Mme => GtpInterface::S11,
        _ => GtpInterface::S5s8,
    }
}

type PeerKey = (IpAddr, PeerKind);

/// Liveness records of every known peer
#[derive(Debug)]
pub struct PeerTable {
    records: HashMap<PeerKey, PeerRecord>,
    timers: DelayQueue<(PeerKey, TimerId)>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
            timers: DelayQueue::new(),
        }
    }

    /// Register a peer on first contact; the first probe goes out at `first_probe`
    pub fn contact(&mut self, peer: IpAddr, kind: PeerKind, first_probe: Instant) -> bool {
        if self.records.contains_key(&(peer, kind)) {
            return false;
        }
        let mut record = PeerRecord::new(peer, kind);
        record.timer = Some(self.timers.schedule(first_probe, ((peer, kind), TimerId::PeerProbe)));
        self.records.insert((peer, kind), record);
        log::info!("[Added] Peer {}[{}]", kind.name(), peer);
        true
    }

    pub fn get(&self, peer: IpAddr, kind: PeerKind) -> Option<&PeerRecord> {
        self.records.get(&(peer, kind))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Drive expired probe timers
    pub fn tick(&mut self, now: Instant, shared: &NodeShared) -> (Vec<Outbound>, Vec<LivenessEvent>) {
        let mut outbound = Vec::new();
        let mut events = Vec::new();
        for (_, (key, timer_id)) in self.timers.pop_expired(now) {
            match timer_id {
                TimerId::PeerProbe => {
                    if let Some(probe) = self.send_probe(key, now, shared) {
                        outbound.push(probe);
                    }
                }
                TimerId::PeerProbeRetry => self.probe_expired(key, now, shared, &mut outbound, &mut events),
                TimerId::ResponseRetry => {}
            }
        }
        (outbound, events)
    }

    fn send_probe(&mut self, key: PeerKey, now: Instant, shared: &NodeShared) -> Option<Outbound> {
        let record = self.records.get_mut(&key)?;
        let probe = build_probe(record, shared);
        record.probe_seq = probe_seq(&probe);
        record.probe = Some(probe.clone());
        record.retries = 0;
        if record.state != PeerState::Unreachable {
            record.state = PeerState::ProbeSent;
        }
        let at = now + shared.timers.response.duration;
        record.timer = Some(self.timers.schedule(at, (key, TimerId::PeerProbeRetry)));
        log::trace!("Probe {}[{}] seq[{:?}]", key.1.name(), key.0, record.probe_seq);
        Some(probe)
    }

    fn probe_expired(
        &mut self,
        key: PeerKey,
        now: Instant,
        shared: &NodeShared,
        outbound: &mut Vec<Outbound>,
        events: &mut Vec<LivenessEvent>,
    ) {
        let Some(record) = self.records.get_mut(&key) else {
            return;
        };
        let (peer, kind) = key;
        if record.retries < shared.timers.response.max_count {
            record.retries += 1;
            if let Some(probe) = record.probe.clone() {
                outbound.push(probe);
            }
            let at = now + shared.timers.response.duration;
            record.timer = Some(self.timers.schedule(at, (key, TimerId::PeerProbeRetry)));
            return;
        }

        record.probe_seq = None;
        record.probe = None;
        if record.state != PeerState::Unreachable {
            log::warn!("Peer {}[{}] unreachable", kind.name(), peer);
            record.state = PeerState::Unreachable;
            record.failed_cycles = 1;
            events.push(LivenessEvent::Down { peer, kind });
        } else {
            record.failed_cycles += 1;
        }
        if record.failed_cycles >= shared.timers.remove_after_cycles.max(1) {
            log::info!("[Removed] Peer {}[{}]", kind.name(), peer);
            self.records.remove(&key);
            events.push(LivenessEvent::Removed { peer, kind });
            return;
        }
        let at = now + shared.timers.probe.duration;
        record.timer = Some(self.timers.schedule(at, (key, TimerId::PeerProbe)));
    }

    /// Answer to one of our probes
    pub fn on_probe_response(
        &mut self,
        peer: IpAddr,
        kind: PeerKind,
        seq: Seq24,
        recovery: u32,
        now: Instant,
        shared: &NodeShared,
    ) -> Vec<LivenessEvent> {
        let key = (peer, kind);
        let mut events = Vec::new();
        let Some(record) = self.records.get_mut(&key) else {
            log::debug!("Probe answer from unknown peer {}[{}]", kind.name(), peer);
            return events;
        };
        if record.probe_seq != Some(seq) {
            log::warn!("Unexpected probe answer from {}[{}] seq[{}]", kind.name(), peer, seq);
            return events;
        }
        if let Some(timer) = record.timer.take() {
            self.timers.cancel(timer);
        }
        record.probe_seq = None;
        record.probe = None;
        record.retries = 0;
        record.failed_cycles = 0;
        if record.state == PeerState::Unreachable {
            log::info!("Peer {}[{}] reachable again", kind.name(), peer);
            events.push(LivenessEvent::Up { peer, kind });
        }
        record.state = PeerState::Reachable;
        if let Some(event) = Self::check_restart(record, recovery) {
            events.push(event);
        }
        let at = now + shared.timers.probe.duration;
        record.timer = Some(self.timers.schedule(at, (key, TimerId::PeerProbe)));
        events
    }

    /// Probe received from a peer
    pub fn on_probe_request(&mut self, peer: IpAddr, kind: PeerKind, recovery: u32, now: Instant) -> Vec<LivenessEvent> {
        self.contact(peer, kind, now);
        let mut events = Vec::new();
        let Some(record) = self.records.get_mut(&(peer, kind)) else {
            return events;
        };
        if record.state == PeerState::Unreachable {
            log::info!("Peer {}[{}] reachable again", kind.name(), peer);
            record.state = PeerState::Reachable;
            record.failed_cycles = 0;
            events.push(LivenessEvent::Up { peer, kind });
        }
        if let Some(event) = Self::check_restart(record, recovery) {
            events.push(event);
        }
        events
    }

    fn check_restart(record: &mut PeerRecord, recovery: u32) -> Option<LivenessEvent> {
        let previous = record.restart_counter.replace(recovery);
        match previous {
            Some(old) if old != recovery => {
                log::warn!(
                    "Peer {}[{}] restarted ({} -> {})",
                    record.kind.name(),
                    record.addr,
                    old,
                    recovery
                );
                Some(LivenessEvent::Restarted {
                    peer: record.addr,
                    kind: record.kind,
                })
            }
            _ => None,
        }
    }
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new()
    }
}

fn build_probe(record: &PeerRecord, shared: &NodeShared) -> Outbound {
    if record.kind.is_pfcp() {
        let seq = shared.seq.next(Interface::Sx);
        if shared.is_associated(record.addr) {
            sx_build::build_heartbeat_request(record.addr, seq, shared.recovery_ts)
        } else {
            shared.begin_association(record.addr);
            sx_build::build_association_setup_request(record.addr, shared.node_addr(), seq, shared.recovery_ts)
        }
    } else {
        let iface = probe_interface(record.kind);
        let seq = shared.seq.next(Interface::from(iface));
        gtp_build::build_echo_request(record.addr, iface, seq, shared.restart_counter)
    }
}

fn probe_seq(probe: &Outbound) -> Option<Seq24> {
    probe.seq()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SaegwcConfig;
    use crate::message::{Envelope, PfcpBody};
    use std::time::Duration;

    fn shared() -> NodeShared {
        let mut config = SaegwcConfig::default();
        config.timers.echo_interval = 1_000;
        config.timers.t3_response = 100;
        config.timers.n3_requests = 2;
        config.timers.remove_after_cycles = 2;
        NodeShared::new(config, 7, 100)
    }

    fn mme() -> IpAddr {
        "10.0.0.1".parse().unwrap()
    }

    #[test]
    fn test_probe_then_reachable() {
        let shared = shared();
        let start = Instant::now();
        let mut table = PeerTable::new();
        assert!(table.contact(mme(), PeerKind::Mme, start));
        assert!(!table.contact(mme(), PeerKind::Mme, start));

        let (out, events) = table.tick(start, &shared);
        assert_eq!(out.len(), 1);
        assert!(events.is_empty());
        assert_eq!(table.get(mme(), PeerKind::Mme).unwrap().state, PeerState::ProbeSent);

        let seq = out[0].seq().unwrap();
        let events = table.on_probe_response(mme(), PeerKind::Mme, seq, 3, start, &shared);
        assert!(events.is_empty());
        assert_eq!(table.get(mme(), PeerKind::Mme).unwrap().state, PeerState::Reachable);

        // a changed restart counter is a restart
        let (out, _) = table.tick(start + Duration::from_millis(1_000), &shared);
        let seq = out[0].seq().unwrap();
        let events = table.on_probe_response(mme(), PeerKind::Mme, seq, 4, start, &shared);
        assert_eq!(events, vec![LivenessEvent::Restarted { peer: mme(), kind: PeerKind::Mme }]);
    }

    #[test]
    fn test_retry_budget_then_down_then_removed() {
        let shared = shared();
        let start = Instant::now();
        let mut table = PeerTable::new();
        table.contact(mme(), PeerKind::Mme, start);

        let mut now = start;
        let (out, _) = table.tick(now, &shared);
        assert_eq!(out.len(), 1);
        let first_seq = out[0].seq();
        // two resends with the same sequence number
        for _ in 0..2 {
            now += Duration::from_millis(100);
            let (out, events) = table.tick(now, &shared);
            assert_eq!(out.len(), 1);
            assert_eq!(out[0].seq(), first_seq);
            assert!(events.is_empty());
        }
        now += Duration::from_millis(100);
        let (_, events) = table.tick(now, &shared);
        assert_eq!(events, vec![LivenessEvent::Down { peer: mme(), kind: PeerKind::Mme }]);
        assert!(!table.get(mme(), PeerKind::Mme).unwrap().is_reachable());

        // second failed cycle removes the record
        now += Duration::from_millis(1_000);
        table.tick(now, &shared);
        for _ in 0..3 {
            now += Duration::from_millis(100);
            let (_, events) = table.tick(now, &shared);
            if events.contains(&LivenessEvent::Removed { peer: mme(), kind: PeerKind::Mme }) {
                assert!(table.is_empty());
                return;
            }
        }
        panic!("peer was not removed");
    }

    #[test]
    fn test_upf_probe_is_association_until_associated() {
        let shared = shared();
        let upf: IpAddr = "127.0.0.7".parse().unwrap();
        let start = Instant::now();
        let mut table = PeerTable::new();
        table.contact(upf, PeerKind::Upf, start);
        let (out, _) = table.tick(start, &shared);
        assert!(matches!(
            &out[0],
            Envelope::Pfcp { msg, .. } if matches!(msg.body, PfcpBody::AssociationSetupRequest { .. })
        ));
        shared.set_associated(upf);
        let seq = out[0].seq().unwrap();
        table.on_probe_response(upf, PeerKind::Upf, seq, 1, start, &shared);
        let (out, _) = table.tick(start + Duration::from_millis(1_000), &shared);
        assert!(matches!(
            &out[0],
            Envelope::Pfcp { msg, .. } if matches!(msg.body, PfcpBody::HeartbeatRequest { .. })
        ));
    }

    #[test]
    fn test_probe_request_revives_peer() {
        let mut table = PeerTable::new();
        let now = Instant::now();
        assert!(table.on_probe_request(mme(), PeerKind::Mme, 1, now).is_empty());
        let events = table.on_probe_request(mme(), PeerKind::Mme, 2, now);
        assert_eq!(events, vec![LivenessEvent::Restarted { peer: mme(), kind: PeerKind::Mme }]);
    }

    #[test]
    fn test_gtp_peer_kind() {
        assert_eq!(gtp_peer_kind(GatewayRole::Sgwc, GtpInterface::S5s8), PeerKind::Pgw);
        assert_eq!(gtp_peer_kind(GatewayRole::Pgwc, GtpInterface::S5s8), PeerKind::Sgw);
        assert_eq!(gtp_peer_kind(GatewayRole::Saegwc, GtpInterface::S11), PeerKind::Mme);
    }
}
