//! SAEGW-C Session Entity Graph
//!
//! UE context, PDN connections, EPS bearers and user plane rules of one
//! partition. Entities live in generational arenas; every cross reference
//! is a handle, so a reference to a released entity resolves to `None`.
//! The graph performs no protocol I/O.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::Bytes;
use dashmap::DashMap;

use crate::arena::{Arena, Handle};
use crate::config::{SaegwcConfig, UpfConfig};
use crate::correlation::{Origin, UeAggregate};
use crate::error::{SaegwcError, SaegwcResult};
use crate::event::{Procedure, SessState};
use crate::identity::{IdentityTables, PartitionId};
use crate::message::{CreateFar, CreatePdr, CreateQer};
use crate::timer::SaegwcTimerConfigs;
use crate::types::{Ambr, BearerQos, Csid, Ebi, FTeid, FqCsid, GatewayRole, Imsi, PeerKind};
use crate::xact::{RetransmitState, Seq24, SequenceAllocator};

pub type UeHandle = Handle<UeContext>;
pub type PdnHandle = Handle<PdnConnection>;
pub type BearerHandle = Handle<EpsBearer>;
pub type RuleHandle = Handle<Rule>;

// ============================================================================
// Node Context
// ============================================================================

/// PFCP association state of a user plane node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Association {
    /// Association Setup Request sent
    Associating,
    Associated,
}

/// State shared by every partition and the liveness task
#[derive(Debug)]
pub struct NodeShared {
    pub config: SaegwcConfig,
    pub timers: SaegwcTimerConfigs,
    pub identities: IdentityTables,
    pub seq: SequenceAllocator,
    associations: DashMap<IpAddr, Association>,
    /// Own GTPv2-C restart counter
    pub restart_counter: u8,
    /// Own PFCP recovery time stamp
    pub recovery_ts: u32,
    hop_by_hop: AtomicU32,
}

impl NodeShared {
    pub fn new(config: SaegwcConfig, restart_counter: u8, recovery_ts: u32) -> Self {
        let timers = SaegwcTimerConfigs::from(&config.timers);
        Self {
            config,
            timers,
            identities: IdentityTables::new(),
            seq: SequenceAllocator::new(),
            associations: DashMap::new(),
            restart_counter,
            recovery_ts,
            hop_by_hop: AtomicU32::new(1),
        }
    }

    pub fn role(&self) -> GatewayRole {
        self.config.role
    }

    pub fn partitions(&self) -> usize {
        self.config.partitions.max(1)
    }

    pub fn node_addr(&self) -> IpAddr {
        self.config.node_addr
    }

    pub fn association(&self, upf: IpAddr) -> Option<Association> {
        self.associations.get(&upf).map(|a| *a.value())
    }

    pub fn is_associated(&self, upf: IpAddr) -> bool {
        self.association(upf) == Some(Association::Associated)
    }

    /// Mark an association attempt; false if one is running or done
    pub fn begin_association(&self, upf: IpAddr) -> bool {
        match self.associations.entry(upf) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Association::Associating);
                true
            }
        }
    }

    pub fn set_associated(&self, upf: IpAddr) {
        self.associations.insert(upf, Association::Associated);
    }

    pub fn clear_association(&self, upf: IpAddr) {
        self.associations.remove(&upf);
    }

    pub fn next_hop_by_hop(&self) -> u32 {
        self.hop_by_hop.fetch_add(1, Ordering::Relaxed)
    }

    /// User plane node serving a subscriber
    pub fn select_upf(&self, imsi: &Imsi) -> Option<&UpfConfig> {
        let upfs = &self.config.upf;
        if upfs.is_empty() {
            return None;
        }
        upfs.get((imsi.as_u64() % upfs.len() as u64) as usize)
    }
}

// ============================================================================
// Identifier Allocation
// ============================================================================

/// Low 24 bits of a TEID; the high byte carries the partition
const TEID_LOW_MASK: u32 = 0x00FF_FFFF;

/// Partition encoded in a locally allocated TEID
pub fn partition_of_teid(teid: u32) -> PartitionId {
    (teid >> 24) as PartitionId
}

/// PFCP SEID of a PDN connection: owning TEID in the high word, default
/// bearer id in the low word
pub fn derive_seid(teid: u32, default_ebi: Ebi) -> u64 {
    (u64::from(teid) << 32) | u64::from(default_ebi.value())
}

/// Partition encoded in a locally derived SEID
pub fn partition_of_seid(seid: u64) -> PartitionId {
    partition_of_teid((seid >> 32) as u32)
}

/// TEID pool of one partition
#[derive(Debug)]
pub struct TeidPool {
    prefix: u32,
    next: u32,
    in_use: HashSet<u32>,
}

impl TeidPool {
    /// Create the pool for a partition
    pub fn new(partition: PartitionId) -> Self {
        Self {
            prefix: ((partition as u32) & 0xFF) << 24,
            next: 1,
            in_use: HashSet::new(),
        }
    }

    /// Allocate a TEID not currently in use
    pub fn allocate(&mut self) -> SaegwcResult<u32> {
        for _ in 0..TEID_LOW_MASK {
            let low = self.next;
            self.next = if low >= TEID_LOW_MASK { 1 } else { low + 1 };
            let teid = self.prefix | low;
            if self.in_use.insert(teid) {
                return Ok(teid);
            }
        }
        Err(SaegwcError::PoolExhausted("TEID"))
    }

    /// Return a TEID to the pool
    pub fn release(&mut self, teid: u32) {
        self.in_use.remove(&teid);
    }

    /// Number of TEIDs currently allocated
    pub fn in_use(&self) -> usize {
        self.in_use.len()
    }
}

/// UE address pool of one partition
///
/// Partition `p` of `n` hands out host offsets `1 + p`, `1 + p + n`, ...
/// so pools of different partitions never overlap.
#[derive(Debug)]
pub struct Ipv4Pool {
    network: u32,
    host_count: u32,
    offset: u32,
    stride: u32,
    cursor: u32,
    free: Vec<Ipv4Addr>,
    in_use: HashSet<Ipv4Addr>,
}

impl Ipv4Pool {
    pub fn new(network: Ipv4Addr, prefix_len: u8, partition: PartitionId, partitions: usize) -> Self {
        let prefix_len = u32::from(prefix_len.min(30));
        let host_count = 1u32 << (32 - prefix_len);
        let mask = if prefix_len == 0 { 0 } else { u32::MAX << (32 - prefix_len) };
        Self {
            network: u32::from(network) & mask,
            host_count,
            offset: 1 + partition as u32,
            stride: partitions.max(1) as u32,
            cursor: 0,
            free: Vec::new(),
            in_use: HashSet::new(),
        }
    }

    /// Allocate a free address
    pub fn allocate(&mut self) -> SaegwcResult<Ipv4Addr> {
        if let Some(addr) = self.free.pop() {
            self.in_use.insert(addr);
            return Ok(addr);
        }
        loop {
            let host = self
                .cursor
                .checked_mul(self.stride)
                .and_then(|v| v.checked_add(self.offset))
                .filter(|host| *host < self.host_count - 1)
                .ok_or(SaegwcError::PoolExhausted("UE IPv4"))?;
            self.cursor += 1;
            let addr = Ipv4Addr::from(self.network | host);
            if self.in_use.insert(addr) {
                return Ok(addr);
            }
        }
    }

    /// Reserve an address requested by the peer; false if already taken
    pub fn reserve(&mut self, addr: Ipv4Addr) -> bool {
        self.free.retain(|a| *a != addr);
        self.in_use.insert(addr)
    }

    pub fn release(&mut self, addr: Ipv4Addr) {
        if self.in_use.remove(&addr) {
            self.free.push(addr);
        }
    }
}

// ============================================================================
// Session-Scoped Attributes
// ============================================================================

/// Connection set identifiers bound to a PDN connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionCsids {
    /// CSID this node issued for the session
    pub local: Option<Csid>,
    pub mme: Option<FqCsid>,
    pub sgw: Option<FqCsid>,
    pub pgw: Option<FqCsid>,
    pub upf: Option<FqCsid>,
}

impl SessionCsids {
    pub fn peer(&self, kind: PeerKind) -> Option<&FqCsid> {
        match kind {
            PeerKind::Mme => self.mme.as_ref(),
            PeerKind::Sgw => self.sgw.as_ref(),
            PeerKind::Pgw => self.pgw.as_ref(),
            PeerKind::Upf => self.upf.as_ref(),
        }
    }

    pub fn set_peer(&mut self, kind: PeerKind, fqcsid: Option<FqCsid>) {
        match kind {
            PeerKind::Mme => self.mme = fqcsid,
            PeerKind::Sgw => self.sgw = fqcsid,
            PeerKind::Pgw => self.pgw = fqcsid,
            PeerKind::Upf => self.upf = fqcsid,
        }
    }

    /// Peer FQ-CSIDs currently bound
    pub fn peers(&self) -> impl Iterator<Item = (PeerKind, &FqCsid)> {
        [
            (PeerKind::Mme, &self.mme),
            (PeerKind::Sgw, &self.sgw),
            (PeerKind::Pgw, &self.pgw),
            (PeerKind::Upf, &self.upf),
        ]
        .into_iter()
        .filter_map(|(kind, fq)| fq.as_ref().map(|fq| (kind, fq)))
    }

    /// Whether a CSID issued by `node` is bound
    pub fn bound_to(&self, node: IpAddr) -> bool {
        self.peers().any(|(_, fq)| fq.node == node && !fq.csids.is_empty())
    }
}

/// Gx session of a PDN connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GxSession {
    pub session_id: String,
    next_request_number: u32,
}

impl GxSession {
    pub fn new(session_id: String) -> Self {
        Self {
            session_id,
            next_request_number: 0,
        }
    }

    /// CC-Request-Number for the next request
    pub fn next_request_number(&mut self) -> u32 {
        let n = self.next_request_number;
        self.next_request_number = n.wrapping_add(1);
        n
    }
}

/// Commands relayed to the PGW whose failure indication goes back to the MME
const MAX_RELAYED_COMMANDS: usize = 4;

/// Command forwarded on S5/S8, keyed by the sequence number used there
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayedCommand {
    pub seq: Seq24,
    pub origin: Origin,
}

// ============================================================================
// UE Context
// ============================================================================

/// One subscriber attachment
#[derive(Debug)]
pub struct UeContext {
    pub imsi: Imsi,
    pub msisdn: Option<String>,
    /// Local S11 control TEID (SGW-C, SAEGW-C)
    pub local_s11_teid: Option<u32>,
    /// MME S11 control endpoint
    pub mme_s11: Option<FTeid>,
    /// PDN connections in creation order
    pdns: Vec<PdnHandle>,
    /// Retransmission detection for requests received on S11
    pub s11_retransmit: RetransmitState,
    /// Answer aggregated over several PDN connections
    pub aggregate: Option<UeAggregate>,
}

impl UeContext {
    pub fn new(imsi: Imsi) -> Self {
        Self {
            imsi,
            msisdn: None,
            local_s11_teid: None,
            mme_s11: None,
            pdns: Vec::new(),
            s11_retransmit: RetransmitState::new(),
            aggregate: None,
        }
    }

    pub fn pdns(&self) -> &[PdnHandle] {
        &self.pdns
    }
}

// ============================================================================
// PDN Connection
// ============================================================================

/// One APN attachment of a UE
#[derive(Debug)]
pub struct PdnConnection {
    pub ue: UeHandle,
    pub apn: String,
    /// Local SEID toward the user plane
    pub seid: u64,
    /// SEID allocated by the user plane
    pub up_seid: Option<u64>,
    /// Selected user plane node
    pub upf: Option<IpAddr>,
    pub procedure: Option<Procedure>,
    pub state: SessState,
    pub default_ebi: Ebi,
    bearers: [Option<BearerHandle>; Ebi::COUNT],
    pub ue_ip: Option<Ipv4Addr>,
    pub ambr: Option<Ambr>,
    /// Local S5/S8 control TEID
    pub local_s5s8_teid: Option<u32>,
    /// Peer S5/S8 control endpoint: SGW at a PGW-C, PGW at an SGW-C
    pub peer_s5s8: Option<FTeid>,
    pub csids: SessionCsids,
    pub gx: Option<GxSession>,
    /// Retransmission detection for requests received on S5/S8
    pub s5s8_retransmit: RetransmitState,
    /// Downlink Data Notification sent and not yet acknowledged
    pub ddn_pending: bool,
    pub uli: Option<Bytes>,
    /// Session AMBR QER shared by every bearer (PGW-C, SAEGW-C)
    pub session_qer: Option<RuleHandle>,
    relayed: Vec<RelayedCommand>,
    next_pdr_id: u16,
    next_far_id: u32,
    next_qer_id: u32,
}

impl PdnConnection {
    fn new(ue: UeHandle, apn: &str, default_ebi: Ebi, seid: u64) -> Self {
        Self {
            ue,
            apn: apn.to_string(),
            seid,
            up_seid: None,
            upf: None,
            procedure: None,
            state: SessState::Idle,
            default_ebi,
            bearers: [None; Ebi::COUNT],
            ue_ip: None,
            ambr: None,
            local_s5s8_teid: None,
            peer_s5s8: None,
            csids: SessionCsids::default(),
            gx: None,
            s5s8_retransmit: RetransmitState::new(),
            ddn_pending: false,
            uli: None,
            session_qer: None,
            relayed: Vec::new(),
            next_pdr_id: 1,
            next_far_id: 1,
            next_qer_id: 1,
        }
    }

    /// Detached PDN used by unit tests that only need a handle
    #[cfg(test)]
    pub fn placeholder(ue: UeHandle) -> Self {
        Self::new(ue, "internet", Ebi::new(5).unwrap(), 0)
    }

    /// Bearer slot for an id
    pub fn bearer(&self, ebi: Ebi) -> Option<BearerHandle> {
        self.bearers[ebi.index()]
    }

    /// Bearers in ascending bearer id order
    pub fn bearers(&self) -> impl Iterator<Item = BearerHandle> + '_ {
        self.bearers.iter().filter_map(|slot| *slot)
    }

    pub fn bearer_count(&self) -> usize {
        self.bearers.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn default_bearer(&self) -> Option<BearerHandle> {
        self.bearer(self.default_ebi)
    }

    pub fn alloc_pdr_id(&mut self) -> u16 {
        let id = self.next_pdr_id;
        self.next_pdr_id = self.next_pdr_id.checked_add(1).unwrap_or(1);
        id
    }

    pub fn alloc_far_id(&mut self) -> u32 {
        let id = self.next_far_id;
        self.next_far_id = self.next_far_id.checked_add(1).unwrap_or(1);
        id
    }

    pub fn alloc_qer_id(&mut self) -> u32 {
        let id = self.next_qer_id;
        self.next_qer_id = self.next_qer_id.checked_add(1).unwrap_or(1);
        id
    }

    /// Remember a command forwarded to the PGW
    pub fn remember_relay(&mut self, seq: Seq24, origin: Origin) {
        if self.relayed.len() >= MAX_RELAYED_COMMANDS {
            self.relayed.remove(0);
        }
        self.relayed.push(RelayedCommand { seq, origin });
    }

    /// Origin of the relayed command a failure indication answers
    pub fn take_relay(&mut self, seq: Seq24) -> Option<Origin> {
        let index = self.relayed.iter().position(|r| r.seq == seq)?;
        Some(self.relayed.remove(index).origin)
    }

    /// Whether the session is bound to `node` through a CSID or a peer endpoint
    pub fn depends_on(&self, node: IpAddr) -> bool {
        self.csids.bound_to(node)
            || self.upf == Some(node)
            || self.peer_s5s8.map(|f| f.addr) == Some(node)
    }
}

// ============================================================================
// EPS Bearer
// ============================================================================

/// One EPS bearer of a PDN connection
#[derive(Debug)]
pub struct EpsBearer {
    pub pdn: PdnHandle,
    pub ebi: Ebi,
    pub qos: BearerQos,
    pub tft: Option<Bytes>,
    pub s1u_enb: Option<FTeid>,
    pub s1u_sgw: Option<FTeid>,
    pub s5s8u_sgw: Option<FTeid>,
    pub s5s8u_pgw: Option<FTeid>,
    /// PCC rules bound to this bearer
    pub charging_rules: Vec<String>,
    rules: Vec<RuleHandle>,
}

impl EpsBearer {
    fn new(pdn: PdnHandle, ebi: Ebi) -> Self {
        Self {
            pdn,
            ebi,
            qos: BearerQos::default(),
            tft: None,
            s1u_enb: None,
            s1u_sgw: None,
            s5s8u_sgw: None,
            s5s8u_pgw: None,
            charging_rules: Vec::new(),
            rules: Vec::new(),
        }
    }

    /// Rules used by this bearer, in attach order
    pub fn rules(&self) -> &[RuleHandle] {
        &self.rules
    }

    /// Local user plane endpoint facing the access side
    pub fn access_local(&self, role: GatewayRole) -> Option<FTeid> {
        if role.has_s11() {
            self.s1u_sgw
        } else {
            self.s5s8u_pgw
        }
    }

    pub fn set_access_local(&mut self, role: GatewayRole, fteid: Option<FTeid>) {
        if role.has_s11() {
            self.s1u_sgw = fteid;
        } else {
            self.s5s8u_pgw = fteid;
        }
    }

    /// Remote user plane endpoint on the access side (eNB, or SGW at a PGW-C)
    pub fn access_remote(&self, role: GatewayRole) -> Option<FTeid> {
        if role.has_s11() {
            self.s1u_enb
        } else {
            self.s5s8u_sgw
        }
    }

    pub fn set_access_remote(&mut self, role: GatewayRole, fteid: Option<FTeid>) {
        if role.has_s11() {
            self.s1u_enb = fteid;
        } else {
            self.s5s8u_sgw = fteid;
        }
    }
}

// ============================================================================
// User Plane Rules
// ============================================================================

/// Rule content as sent to the user plane
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleSpec {
    Pdr(CreatePdr),
    Far(CreateFar),
    Qer(CreateQer),
}

/// Rule kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleKind {
    Pdr,
    Far,
    Qer,
}

/// A PDR, FAR or QER and the bearers using it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub spec: RuleSpec,
    owners: Vec<BearerHandle>,
}

impl Rule {
    pub fn kind(&self) -> RuleKind {
        match self.spec {
            RuleSpec::Pdr(_) => RuleKind::Pdr,
            RuleSpec::Far(_) => RuleKind::Far,
            RuleSpec::Qer(_) => RuleKind::Qer,
        }
    }

    /// PFCP rule id
    pub fn id(&self) -> u32 {
        match &self.spec {
            RuleSpec::Pdr(pdr) => u32::from(pdr.pdr_id),
            RuleSpec::Far(far) => far.far_id,
            RuleSpec::Qer(qer) => qer.qer_id,
        }
    }

    pub fn owners(&self) -> &[BearerHandle] {
        &self.owners
    }
}

/// Result of detaching one bearer
#[derive(Debug)]
pub struct DetachedBearer {
    pub bearer: EpsBearer,
    /// Rules no other bearer used
    pub freed_rules: Vec<Rule>,
}

/// Result of detaching a PDN connection
#[derive(Debug)]
pub struct DetachedPdn {
    pub pdn: PdnConnection,
    pub bearers: Vec<EpsBearer>,
    pub freed_rules: Vec<Rule>,
    /// UE context, when this was its last PDN connection
    pub ue_released: Option<UeContext>,
}

// ============================================================================
// Session Graph
// ============================================================================

/// Ownership structure of one partition
#[derive(Debug)]
pub struct SessionGraph {
    ues: Arena<UeContext>,
    pdns: Arena<PdnConnection>,
    bearers: Arena<EpsBearer>,
    rules: Arena<Rule>,
    max_pdn_per_ue: usize,
}

impl SessionGraph {
    pub fn new(max_pdn_per_ue: usize) -> Self {
        Self {
            ues: Arena::new(),
            pdns: Arena::new(),
            bearers: Arena::new(),
            rules: Arena::new(),
            max_pdn_per_ue: max_pdn_per_ue.max(1),
        }
    }

    // ------------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------------

    pub fn create_ue(&mut self, imsi: Imsi) -> UeHandle {
        log::debug!("[Added] UE IMSI[{imsi}]");
        self.ues.insert(UeContext::new(imsi))
    }

    /// Admit a new PDN connection for the UE
    pub fn create_pdn(
        &mut self,
        ue: UeHandle,
        apn: &str,
        default_ebi: Ebi,
        seid: u64,
    ) -> SaegwcResult<PdnHandle> {
        let ue_ctx = self
            .ues
            .get(ue)
            .ok_or_else(|| SaegwcError::ContextNotFound(format!("UE {ue:?}")))?;
        if ue_ctx.pdns.len() >= self.max_pdn_per_ue {
            return Err(SaegwcError::PdnLimitReached {
                max: self.max_pdn_per_ue,
            });
        }
        if self.ebi_in_use(ue, default_ebi) {
            return Err(SaegwcError::BearerIdInUse(default_ebi.value()));
        }
        let pdn = self.pdns.insert(PdnConnection::new(ue, apn, default_ebi, seid));
        if let Some(ue_ctx) = self.ues.get_mut(ue) {
            ue_ctx.pdns.push(pdn);
            log::debug!(
                "[Added] PDN IMSI[{}] APN[{}] SEID[0x{:016x}] PDN[{}]",
                ue_ctx.imsi,
                apn,
                seid,
                ue_ctx.pdns.len()
            );
        }
        Ok(pdn)
    }

    /// Create a bearer with the requested id, or the first free dedicated
    /// id after the PDN's default bearer
    ///
    /// Ids are kept unique across all PDN connections of the UE. Allocated
    /// ids stay within 2..=15.
    pub fn create_bearer(&mut self, pdn: PdnHandle, requested: Option<u8>) -> SaegwcResult<BearerHandle> {
        let (ue, default_ebi, has_default) = self
            .pdns
            .get(pdn)
            .map(|p| (p.ue, p.default_ebi, p.default_bearer().is_some()))
            .ok_or_else(|| SaegwcError::ContextNotFound(format!("PDN {pdn:?}")))?;
        let ebi = match requested {
            Some(raw) => {
                let ebi = Ebi::new(raw)?;
                // the default bearer id is reserved by create_pdn
                let own_default = ebi == default_ebi && !has_default;
                if !own_default && self.ebi_in_use(ue, ebi) {
                    return Err(SaegwcError::BearerIdInUse(raw));
                }
                ebi
            }
            None => Ebi::dedicated_after(default_ebi)
                .find(|ebi| !self.ebi_in_use(ue, *ebi))
                .ok_or(SaegwcError::BearerIdExhausted)?,
        };
        let bearer = self.bearers.insert(EpsBearer::new(pdn, ebi));
        if let Some(pdn_ctx) = self.pdns.get_mut(pdn) {
            pdn_ctx.bearers[ebi.index()] = Some(bearer);
        }
        log::debug!("[Added] Bearer EBI[{ebi}]");
        Ok(bearer)
    }

    /// Attach a new rule owned by the bearer
    pub fn attach_rule(&mut self, bearer: BearerHandle, spec: RuleSpec) -> SaegwcResult<RuleHandle> {
        if !self.bearers.contains(bearer) {
            return Err(SaegwcError::ContextNotFound(format!("bearer {bearer:?}")));
        }
        let rule = self.rules.insert(Rule {
            spec,
            owners: vec![bearer],
        });
        if let Some(b) = self.bearers.get_mut(bearer) {
            b.rules.push(rule);
        }
        Ok(rule)
    }

    /// Let another bearer use an existing rule
    pub fn share_rule(&mut self, rule: RuleHandle, bearer: BearerHandle) -> SaegwcResult<()> {
        let r = self
            .rules
            .get_mut(rule)
            .ok_or_else(|| SaegwcError::ContextNotFound(format!("rule {rule:?}")))?;
        let b = self
            .bearers
            .get_mut(bearer)
            .ok_or_else(|| SaegwcError::ContextNotFound(format!("bearer {bearer:?}")))?;
        if !r.owners.contains(&bearer) {
            r.owners.push(bearer);
            b.rules.push(rule);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Removal
    // ------------------------------------------------------------------

    /// Detach a dedicated bearer and free the rules only it used
    pub fn detach_bearer(&mut self, pdn: PdnHandle, ebi: Ebi) -> SaegwcResult<DetachedBearer> {
        let pdn_ctx = self
            .pdns
            .get_mut(pdn)
            .ok_or_else(|| SaegwcError::ContextNotFound(format!("PDN {pdn:?}")))?;
        if pdn_ctx.default_ebi == ebi {
            return Err(SaegwcError::InvalidBearerId(ebi.value()));
        }
        let bearer = pdn_ctx.bearers[ebi.index()]
            .take()
            .ok_or_else(|| SaegwcError::ContextNotFound(format!("EBI[{ebi}]")))?;
        self.release_bearer(bearer)
            .ok_or_else(|| SaegwcError::ContextNotFound(format!("EBI[{ebi}]")))
    }

    fn release_bearer(&mut self, bearer: BearerHandle) -> Option<DetachedBearer> {
        let removed = self.bearers.remove(bearer)?;
        let mut freed_rules = Vec::new();
        for rule in &removed.rules {
            let Some(r) = self.rules.get_mut(*rule) else {
                continue;
            };
            r.owners.retain(|owner| *owner != bearer);
            if r.owners.is_empty() {
                if let Some(freed) = self.rules.remove(*rule) {
                    freed_rules.push(freed);
                }
            }
        }
        log::debug!("[Removed] Bearer EBI[{}] rules freed[{}]", removed.ebi, freed_rules.len());
        Some(DetachedBearer {
            bearer: removed,
            freed_rules,
        })
    }

    /// Detach a PDN connection with all its bearers; the UE goes with its
    /// last PDN connection
    pub fn detach_pdn(&mut self, ue: UeHandle, pdn: PdnHandle) -> SaegwcResult<DetachedPdn> {
        match self.pdns.get(pdn) {
            Some(p) if p.ue == ue => {}
            _ => return Err(SaegwcError::ContextNotFound(format!("PDN {pdn:?}"))),
        }
        let slots: Vec<BearerHandle> = self
            .pdns
            .get(pdn)
            .map(|p| p.bearers().collect())
            .unwrap_or_default();
        let mut bearers = Vec::new();
        let mut freed_rules = Vec::new();
        for bearer in slots {
            if let Some(detached) = self.release_bearer(bearer) {
                bearers.push(detached.bearer);
                freed_rules.extend(detached.freed_rules);
            }
        }
        let removed = self
            .pdns
            .remove(pdn)
            .ok_or_else(|| SaegwcError::ContextNotFound(format!("PDN {pdn:?}")))?;

        let mut ue_released = None;
        if let Some(ue_ctx) = self.ues.get_mut(ue) {
            ue_ctx.pdns.retain(|p| *p != pdn);
            if ue_ctx.pdns.is_empty() {
                ue_released = self.ues.remove(ue);
            }
        }
        log::debug!(
            "[Removed] PDN APN[{}] SEID[0x{:016x}] UE released[{}]",
            removed.apn,
            removed.seid,
            ue_released.is_some()
        );
        Ok(DetachedPdn {
            pdn: removed,
            bearers,
            freed_rules,
            ue_released,
        })
    }

    /// Remove a UE left without PDN connections
    pub fn remove_empty_ue(&mut self, ue: UeHandle) -> Option<UeContext> {
        if !self.ues.get(ue)?.pdns.is_empty() {
            return None;
        }
        let removed = self.ues.remove(ue)?;
        log::debug!("[Removed] UE IMSI[{}]", removed.imsi);
        Some(removed)
    }

    // ------------------------------------------------------------------
    // Access
    // ------------------------------------------------------------------

    pub fn ue(&self, ue: UeHandle) -> Option<&UeContext> {
        self.ues.get(ue)
    }

    pub fn ue_mut(&mut self, ue: UeHandle) -> Option<&mut UeContext> {
        self.ues.get_mut(ue)
    }

    pub fn pdn(&self, pdn: PdnHandle) -> Option<&PdnConnection> {
        self.pdns.get(pdn)
    }

    pub fn pdn_mut(&mut self, pdn: PdnHandle) -> Option<&mut PdnConnection> {
        self.pdns.get_mut(pdn)
    }

    pub fn bearer(&self, bearer: BearerHandle) -> Option<&EpsBearer> {
        self.bearers.get(bearer)
    }

    pub fn bearer_mut(&mut self, bearer: BearerHandle) -> Option<&mut EpsBearer> {
        self.bearers.get_mut(bearer)
    }

    pub fn rule(&self, rule: RuleHandle) -> Option<&Rule> {
        self.rules.get(rule)
    }

    pub fn rule_mut(&mut self, rule: RuleHandle) -> Option<&mut Rule> {
        self.rules.get_mut(rule)
    }

    /// Bearer of a PDN connection by id
    pub fn bearer_by_ebi(&self, pdn: PdnHandle, ebi: Ebi) -> Option<BearerHandle> {
        self.pdns.get(pdn).and_then(|p| p.bearer(ebi))
    }

    /// PDN connection of a UE holding the bearer id
    pub fn pdn_of_ebi(&self, ue: UeHandle, ebi: Ebi) -> Option<PdnHandle> {
        self.ues
            .get(ue)?
            .pdns
            .iter()
            .copied()
            .find(|pdn| self.bearer_by_ebi(*pdn, ebi).is_some())
    }

    /// PDN connection of a UE for an APN
    pub fn pdn_by_apn(&self, ue: UeHandle, apn: &str) -> Option<PdnHandle> {
        self.ues
            .get(ue)?
            .pdns
            .iter()
            .copied()
            .find(|pdn| self.pdns.get(*pdn).is_some_and(|p| p.apn == apn))
    }

    fn ebi_in_use(&self, ue: UeHandle, ebi: Ebi) -> bool {
        self.ues.get(ue).is_some_and(|u| {
            u.pdns.iter().any(|pdn| {
                self.pdns
                    .get(*pdn)
                    .is_some_and(|p| p.bearer(ebi).is_some() || p.default_ebi == ebi)
            })
        })
    }

    /// Every PDN connection of the partition
    pub fn pdns(&self) -> impl Iterator<Item = (PdnHandle, &PdnConnection)> {
        self.pdns.iter()
    }

    pub fn ue_count(&self) -> usize {
        self.ues.len()
    }

    pub fn pdn_count(&self) -> usize {
        self.pdns.len()
    }

    pub fn bearer_count(&self) -> usize {
        self.bearers.len()
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Verify the ownership invariants, describing the first violation
    pub fn check_invariants(&self) -> Result<(), String> {
        for (pdn_h, pdn) in self.pdns.iter() {
            let ue = self
                .ues
                .get(pdn.ue)
                .ok_or_else(|| format!("PDN {pdn_h:?} has no UE"))?;
            if !ue.pdns.contains(&pdn_h) {
                return Err(format!("PDN {pdn_h:?} missing from its UE"));
            }
            for (index, slot) in pdn.bearers.iter().enumerate() {
                let Some(bearer_h) = slot else { continue };
                let bearer = self
                    .bearers
                    .get(*bearer_h)
                    .ok_or_else(|| format!("PDN {pdn_h:?} holds a stale bearer"))?;
                if bearer.pdn != pdn_h || bearer.ebi.index() != index {
                    return Err(format!("bearer EBI[{}] misplaced", bearer.ebi));
                }
            }
            if pdn.state.is_stable() && pdn.default_bearer().is_none() {
                return Err(format!("PDN {pdn_h:?} lost its default bearer"));
            }
        }
        for (bearer_h, bearer) in self.bearers.iter() {
            if self.pdns.get(bearer.pdn).and_then(|p| p.bearer(bearer.ebi)) != Some(bearer_h) {
                return Err(format!("bearer EBI[{}] not owned by its PDN", bearer.ebi));
            }
        }
        for (rule_h, rule) in self.rules.iter() {
            if rule.owners.is_empty() {
                return Err(format!("rule {rule_h:?} has no owner"));
            }
        }
        Ok(())
    }
}
