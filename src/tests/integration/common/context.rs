//! Test context management
//!
//! A gateway plus its simulated peers on a virtual clock.

use std::time::{Duration, Instant};

use nextgcore_saegwcd::event::SessState;
use nextgcore_saegwcd::types::Imsi;
use nextgcore_saegwcd::{Gateway, Inbound, Outbound, SaegwcConfig};

use super::message::{create_session_request_with_csid, s11_teid_of, upf_addr};
use super::nf_mock::MockPeers;

/// What a test needs to know about one PDN connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdnSummary {
    pub partition: usize,
    pub seid: u64,
    pub up_seid: Option<u64>,
    pub state: SessState,
    pub bearers: usize,
}

pub struct TestContext {
    pub gw: Gateway,
    pub peers: MockPeers,
    pub now: Instant,
    seq: u32,
}

impl TestContext {
    /// Gateway with the configured UPF already associated
    pub fn new(partitions: usize, gx: bool) -> Self {
        let mut config = SaegwcConfig::default();
        config.partitions = partitions;
        config.gx.enabled = gx;
        let gw = Gateway::new(config, 1, 100).expect("gateway");
        gw.shared().set_associated(upf_addr());
        Self {
            gw,
            peers: MockPeers::new(),
            now: Instant::now(),
            seq: 0,
        }
    }

    /// Gateway that still has to set up its PFCP association
    pub fn unassociated(partitions: usize) -> Self {
        let mut config = SaegwcConfig::default();
        config.partitions = partitions;
        Self {
            gw: Gateway::new(config, 1, 100).expect("gateway"),
            peers: MockPeers::new(),
            now: Instant::now(),
            seq: 0,
        }
    }

    /// Fresh sequence number for a request from the MME
    pub fn next_seq(&mut self) -> u32 {
        self.seq += 1;
        self.seq
    }

    /// Deliver one message and let the peers answer everything that follows
    pub fn send(&mut self, envelope: Inbound) -> Vec<Outbound> {
        let out = self.gw.handle(envelope, self.now);
        self.peers.settle(&mut self.gw, out, self.now)
    }

    /// Attach a UE and return its local S11 TEID
    pub fn attach(&mut self, imsi: Imsi, mme_teid: u32) -> u32 {
        self.attach_with_csid(imsi, mme_teid, None)
    }

    pub fn attach_with_csid(&mut self, imsi: Imsi, mme_teid: u32, mme_csid: Option<u16>) -> u32 {
        let seq = self.next_seq();
        let out = self.send(create_session_request_with_csid(imsi, mme_teid, seq, mme_csid));
        s11_teid_of(&out)
    }

    /// Start the node and complete the PFCP association
    pub fn start(&mut self) -> Vec<Outbound> {
        self.gw.start(self.now);
        let out = self.gw.tick(self.now);
        self.peers.settle(&mut self.gw, out, self.now)
    }

    /// Move the clock forward in one-second steps, ticking every timer
    pub fn advance(&mut self, seconds: u64) -> Vec<Outbound> {
        let mut collected = Vec::new();
        for _ in 0..seconds {
            self.now += Duration::from_secs(1);
            let out = self.gw.tick(self.now);
            collected.extend(self.peers.settle(&mut self.gw, out, self.now));
        }
        collected
    }

    pub fn pdns(&self) -> Vec<PdnSummary> {
        self.gw
            .partitions()
            .iter()
            .enumerate()
            .flat_map(|(partition, p)| {
                p.tables().graph.pdns().map(move |(_, pdn)| PdnSummary {
                    partition,
                    seid: pdn.seid,
                    up_seid: pdn.up_seid,
                    state: pdn.state,
                    bearers: pdn.bearer_count(),
                })
            })
            .collect()
    }

    pub fn pdn_count(&self) -> usize {
        self.gw.partitions().iter().map(|p| p.tables().graph.pdn_count()).sum()
    }

    pub fn ue_count(&self) -> usize {
        self.gw.partitions().iter().map(|p| p.tables().graph.ue_count()).sum()
    }

    /// Open correlation records over all partitions
    pub fn pending_records(&self) -> usize {
        self.gw.partitions().iter().map(|p| p.tables().store.len()).sum()
    }

    pub fn csid_records(&self) -> usize {
        self.gw.partitions().iter().map(|p| p.tables().csids.record_count()).sum()
    }
}
