//! Session Handler Context
//!
//! What a dispatched handler sees: the node-wide shared state, the tables
//! owned by the partition and the session the event addresses. Steps that
//! several procedures share (answering the triggering request, sending on a
//! leg, tearing a PDN connection down, failing a procedure) live here.

use std::net::IpAddr;

use crate::config::FailureHandling;
use crate::context::{
    BearerHandle, DetachedPdn, EpsBearer, Ipv4Pool, NodeShared, PdnConnection, PdnHandle, Rule,
    SessionGraph, TeidPool, UeContext, UeHandle,
};
use crate::correlation::{
    AccessSnapshot, BearerTrigger, CorrelationRecord, CorrelationStore, Leg, LegRequest, LegStatus,
    Origin, RequestDescriptor,
};
use crate::csid::CsidRegistry;
use crate::error::{Rejection, SaegwcError, SaegwcResult};
use crate::event::{Procedure, SessEvent, SessState};
use crate::gtp_build;
use crate::gx_build;
use crate::identity::{IdentityKey, Owner, PartitionId};
use crate::message::{
    BearerContext, BearerResourceFailureIndication, CcRequestType, ChangeNotificationResponse,
    CreateSessionResponse, DeleteBearerFailureIndication, DeleteSessionResponse, Envelope, GtpBody,
    GtpMessageType, GxBody, Outbound, PfcpBody, RuleReport, SessionModificationRequest,
};
use crate::sm::{Disposition, Outcome};
use crate::sx_build;
use crate::types::{gtp_cause, gx_result, Ebi, FTeid, FqCsid, GatewayRole, GtpInterface, Interface, PeerKind};
use crate::xact::RetransmitState;

// ============================================================================
// Partition Tables
// ============================================================================

/// Everything a partition owns
#[derive(Debug)]
pub struct SessionTables {
    pub id: PartitionId,
    pub graph: SessionGraph,
    pub store: CorrelationStore,
    pub csids: CsidRegistry,
    pub teids: TeidPool,
    /// UE address pool, anchoring roles only
    pub ue_ips: Option<Ipv4Pool>,
}

impl SessionTables {
    pub fn new(shared: &NodeShared, id: PartitionId) -> Self {
        let config = &shared.config;
        let ue_ips = config.role.anchors_pdn().then(|| {
            Ipv4Pool::new(
                config.ue_pool.network,
                config.ue_pool.prefix_len,
                id,
                shared.partitions(),
            )
        });
        Self {
            id,
            graph: SessionGraph::new(config.max_pdn_per_ue),
            store: CorrelationStore::new(),
            csids: CsidRegistry::new(id),
            teids: TeidPool::new(id),
            ue_ips,
        }
    }

    /// Record a peer FQ-CSID on the session and rebuild its registry bindings
    pub fn bind_csid(&mut self, pdn: PdnHandle, kind: PeerKind, fqcsid: Option<FqCsid>) {
        let Some(fqcsid) = fqcsid.filter(|fq| !fq.csids.is_empty()) else {
            return;
        };
        let Some(pdn_ctx) = self.graph.pdn_mut(pdn) else {
            return;
        };
        pdn_ctx.csids.set_peer(kind, Some(fqcsid));
        let seid = pdn_ctx.seid;
        let peers: Vec<FqCsid> = pdn_ctx.csids.peers().map(|(_, fq)| fq.clone()).collect();

        self.csids.unbind(seid);
        let mut local = None;
        for fq in &peers {
            for csid in &fq.csids {
                if let Some(bound) = self.csids.bind(fq.node, *csid, seid) {
                    local.get_or_insert(bound);
                }
            }
        }
        if let Some(pdn_ctx) = self.graph.pdn_mut(pdn) {
            if pdn_ctx.csids.local.is_none() {
                pdn_ctx.csids.local = local;
            }
        }
    }

    /// Detach dedicated bearers; returns the PCC rule names they carried and
    /// the user plane rules no remaining bearer uses
    pub fn detach_bearers(&mut self, role: GatewayRole, pdn: PdnHandle, ebis: &[Ebi]) -> (Vec<String>, Vec<Rule>) {
        let mut names = Vec::new();
        let mut freed = Vec::new();
        for ebi in ebis {
            match self.graph.detach_bearer(pdn, *ebi) {
                Ok(detached) => {
                    release_user_plane_teids(&mut self.teids, role, &detached.bearer);
                    names.extend(detached.bearer.charging_rules);
                    freed.extend(detached.freed_rules);
                }
                Err(e) => log::warn!("Bearer EBI[{ebi}] not detached: {e}"),
            }
        }
        (names, freed)
    }

    /// Remove a PDN connection with every identifier and resource it holds
    ///
    /// The UE context goes with its last PDN connection.
    pub fn release_pdn(&mut self, shared: &NodeShared, pdn: PdnHandle) -> Option<DetachedPdn> {
        let (ue, seid) = self.graph.pdn(pdn).map(|p| (p.ue, p.seid))?;
        self.store.complete(seid);
        self.csids.unbind(seid);
        let detached = match self.graph.detach_pdn(ue, pdn) {
            Ok(detached) => detached,
            Err(e) => {
                log::error!("PDN SEID[0x{seid:016x}] not released: {e}");
                return None;
            }
        };

        let identities = &shared.identities;
        let owner = Owner::pdn(self.id, ue, pdn);
        identities.remove_if_owned(&IdentityKey::Seid(seid), &owner);
        if let Some(teid) = detached.pdn.local_s5s8_teid {
            identities.remove_if_owned(&IdentityKey::Teid(teid), &owner);
            self.teids.release(teid);
        }
        if let Some(gx) = &detached.pdn.gx {
            identities.remove_if_owned(&IdentityKey::GxSession(gx.session_id.clone()), &owner);
        }
        for bearer in &detached.bearers {
            release_user_plane_teids(&mut self.teids, shared.role(), bearer);
        }
        if let (Some(pool), Some(addr)) = (self.ue_ips.as_mut(), detached.pdn.ue_ip) {
            pool.release(addr);
        }
        if let Some(ue_ctx) = &detached.ue_released {
            let ue_owner = Owner::ue(self.id, ue);
            if let Some(teid) = ue_ctx.local_s11_teid {
                identities.remove_if_owned(&IdentityKey::Teid(teid), &ue_owner);
                self.teids.release(teid);
            }
            identities.remove_if_owned(&IdentityKey::Imsi(ue_ctx.imsi.clone()), &ue_owner);
        }
        log::info!(
            "[Released] APN[{}] SEID[0x{:016x}] bearers[{}]",
            detached.pdn.apn,
            seid,
            detached.bearers.len()
        );
        Some(detached)
    }

    /// Drop a UE context whose PDN setup never completed
    pub fn release_empty_ue(&mut self, shared: &NodeShared, ue: UeHandle) -> bool {
        let Some(ue_ctx) = self.graph.remove_empty_ue(ue) else {
            return false;
        };
        let owner = Owner::ue(self.id, ue);
        if let Some(teid) = ue_ctx.local_s11_teid {
            shared.identities.remove_if_owned(&IdentityKey::Teid(teid), &owner);
            self.teids.release(teid);
        }
        shared
            .identities
            .remove_if_owned(&IdentityKey::Imsi(ue_ctx.imsi.clone()), &owner);
        log::info!("[Released] UE IMSI[{}]", ue_ctx.imsi);
        true
    }
}

/// Return the locally allocated user plane TEIDs of a bearer
fn release_user_plane_teids(teids: &mut TeidPool, role: GatewayRole, bearer: &EpsBearer) {
    let local = match role {
        GatewayRole::Sgwc => [bearer.s1u_sgw, bearer.s5s8u_sgw],
        GatewayRole::Saegwc => [bearer.s1u_sgw, None],
        GatewayRole::Pgwc => [bearer.s5s8u_pgw, None],
    };
    for fteid in local.into_iter().flatten() {
        teids.release(fteid.teid);
    }
}

/// Retransmission state holding requests received on an interface
pub fn retransmit_holder(
    graph: &mut SessionGraph,
    ue: Option<UeHandle>,
    pdn: Option<PdnHandle>,
    iface: GtpInterface,
) -> Option<&mut RetransmitState> {
    match iface {
        GtpInterface::S11 => graph.ue_mut(ue?).map(|u| &mut u.s11_retransmit),
        GtpInterface::S5s8 => graph.pdn_mut(pdn?).map(|p| &mut p.s5s8_retransmit),
    }
}

// ============================================================================
// Handler Context
// ============================================================================

fn missing(what: &str) -> Rejection {
    SaegwcError::ContextNotFound(what.to_string()).into()
}

/// Session view handed to a handler
pub struct SessionCtx<'a> {
    pub shared: &'a NodeShared,
    pub tables: &'a mut SessionTables,
    pub procedure: Procedure,
    pub state: SessState,
    pub ue: Option<UeHandle>,
    pub pdn: Option<PdnHandle>,
    outbound: Vec<Outbound>,
}

impl<'a> SessionCtx<'a> {
    pub fn new(
        shared: &'a NodeShared,
        tables: &'a mut SessionTables,
        procedure: Procedure,
        state: SessState,
        ue: Option<UeHandle>,
        pdn: Option<PdnHandle>,
    ) -> Self {
        Self {
            shared,
            tables,
            procedure,
            state,
            ue,
            pdn,
            outbound: Vec::new(),
        }
    }

    pub fn role(&self) -> GatewayRole {
        self.shared.role()
    }

    pub fn node(&self) -> IpAddr {
        self.shared.node_addr()
    }

    pub fn gx_enabled(&self) -> bool {
        self.shared.config.gx_enabled()
    }

    pub fn graph(&self) -> &SessionGraph {
        &self.tables.graph
    }

    pub fn graph_mut(&mut self) -> &mut SessionGraph {
        &mut self.tables.graph
    }

    pub fn ue_handle(&self) -> Result<UeHandle, Rejection> {
        self.ue.ok_or_else(|| missing("UE"))
    }

    pub fn pdn_handle(&self) -> Result<PdnHandle, Rejection> {
        self.pdn.ok_or_else(|| missing("PDN"))
    }

    pub fn ue_ctx(&self) -> Result<&UeContext, Rejection> {
        self.ue
            .and_then(|ue| self.tables.graph.ue(ue))
            .ok_or_else(|| missing("UE"))
    }

    pub fn ue_ctx_mut(&mut self) -> Result<&mut UeContext, Rejection> {
        let ue = self.ue_handle()?;
        self.tables.graph.ue_mut(ue).ok_or_else(|| missing("UE"))
    }

    pub fn pdn_ctx(&self) -> Result<&PdnConnection, Rejection> {
        self.pdn
            .and_then(|pdn| self.tables.graph.pdn(pdn))
            .ok_or_else(|| missing("PDN"))
    }

    pub fn pdn_ctx_mut(&mut self) -> Result<&mut PdnConnection, Rejection> {
        let pdn = self.pdn_handle()?;
        self.tables.graph.pdn_mut(pdn).ok_or_else(|| missing("PDN"))
    }

    pub fn seid(&self) -> Result<u64, Rejection> {
        self.pdn_ctx().map(|p| p.seid)
    }

    /// Bearer handles of the PDN connection for a set of ids
    pub fn bearers_of(&self, ebis: &[Ebi]) -> Vec<BearerHandle> {
        let Some(pdn) = self.pdn else {
            return Vec::new();
        };
        ebis.iter()
            .filter_map(|ebi| self.tables.graph.bearer_by_ebi(pdn, *ebi))
            .collect()
    }

    /// Every bearer of the PDN connection
    pub fn all_bearers(&self) -> Vec<BearerHandle> {
        self.pdn_ctx().map(|p| p.bearers().collect()).unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Correlation record
    // ------------------------------------------------------------------

    pub fn record(&self) -> Option<&CorrelationRecord> {
        let seid = self.seid().ok()?;
        self.tables.store.get(seid)
    }

    pub fn record_mut(&mut self) -> Option<&mut CorrelationRecord> {
        let seid = self.seid().ok()?;
        self.tables.store.get_mut(seid)
    }

    /// Open the record of the procedure being started
    pub fn begin(&mut self, descriptor: RequestDescriptor, origin: Option<Origin>) -> Result<(), Rejection> {
        let seid = self.seid()?;
        let resume = if self.state.is_stable() {
            self.state
        } else {
            SessState::Connected
        };
        let record = CorrelationRecord::new(self.procedure, descriptor, origin, resume);
        self.tables.store.begin(seid, record)?;
        Ok(())
    }

    /// Hand a running record over to another procedure, or open one
    pub fn ensure_record(&mut self, procedure: Procedure, descriptor: RequestDescriptor) -> Result<(), Rejection> {
        match self.record_mut() {
            Some(record) => {
                record.procedure = procedure;
                record.descriptor = descriptor;
                Ok(())
            }
            None => {
                self.procedure = procedure;
                self.begin(descriptor, None)
            }
        }
    }

    pub fn descriptor(&self) -> Option<&RequestDescriptor> {
        self.record().map(|r| &r.descriptor)
    }

    /// Remove the triggering request from the record so it is answered once
    pub fn take_origin(&mut self) -> Option<Origin> {
        self.record_mut().and_then(|r| r.origin.take())
    }

    pub fn leg_status(&self, leg: Leg) -> Option<LegStatus> {
        self.record().and_then(|r| r.legs.status(leg))
    }

    pub fn complete_leg(&mut self, leg: Leg) {
        if let Some(record) = self.record_mut() {
            record.legs.complete(leg);
        }
    }

    pub fn fail_leg(&mut self, leg: Leg, cause: u8) {
        if let Some(record) = self.record_mut() {
            record.legs.fail(leg, cause);
        }
    }

    pub fn excuse_leg(&mut self, leg: Leg) {
        if let Some(record) = self.record_mut() {
            record.drop_leg(leg);
            record.legs.excuse(leg);
        }
    }

    pub fn legs_finished(&self) -> bool {
        self.record().map_or(true, |r| r.legs.is_finished())
    }

    // ------------------------------------------------------------------
    // Output
    // ------------------------------------------------------------------

    pub fn emit(&mut self, out: Outbound) {
        self.outbound.push(out);
    }

    /// Send an answer to an inbound GTP request, caching it for retransmissions
    pub fn respond(&mut self, origin: &Origin, body: GtpBody) {
        let Some(out) = gtp_build::build_response(origin, body) else {
            return;
        };
        if let Origin::Gtp { iface, seq, .. } = origin {
            let (ue, pdn) = (self.ue, self.pdn);
            if let Some(holder) = retransmit_holder(&mut self.tables.graph, ue, pdn, *iface) {
                if holder.last_seq() == Some(*seq) {
                    holder.store_response(out.clone());
                }
            }
        }
        log::debug!("Answer {} to {:?}", out.name(), out.peer());
        self.outbound.push(out);
    }

    /// Answer a Re-Auth-Request
    pub fn respond_raa(&mut self, origin: &Origin, result_code: u32, reports: Vec<RuleReport>) {
        if let Some(raa) = gx_build::build_raa(origin, result_code, reports) {
            self.outbound.push(raa);
        }
    }

    pub fn take_outbound(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbound)
    }

    // ------------------------------------------------------------------
    // Leg requests
    // ------------------------------------------------------------------

    /// GTP request with a fresh sequence number of the interface
    pub fn gtp_request(&self, iface: GtpInterface, peer: FTeid, body: GtpBody) -> Outbound {
        let seq = self.shared.seq.next(Interface::from(iface));
        gtp_build::build_message(peer.addr, iface, peer.teid, seq, body)
    }

    /// Request toward the access peer (MME, or SGW at a PGW-C)
    pub fn access_request(&self, body: GtpBody) -> Result<LegRequest, Rejection> {
        let peer = access_peer(self).ok_or_else(|| Rejection::from(SaegwcError::MissingIe("Sender F-TEID")))?;
        let iface = self.role().access_interface();
        Ok(LegRequest::new(Leg::Access, self.gtp_request(iface, peer, body)))
    }

    /// Request toward the PGW (SGW-C)
    pub fn pgw_request(&self, body: GtpBody) -> Result<LegRequest, Rejection> {
        let peer = self
            .pdn_ctx()?
            .peer_s5s8
            .ok_or_else(|| Rejection::from(SaegwcError::MissingIe("PGW S5/S8 F-TEID")))?;
        Ok(LegRequest::new(Leg::S5s8, self.gtp_request(GtpInterface::S5s8, peer, body)))
    }

    /// PFCP session request toward the selected user plane
    pub fn pfcp_request(&self, body: PfcpBody) -> Result<LegRequest, Rejection> {
        let pdn = self.pdn_ctx()?;
        let upf = pdn
            .upf
            .ok_or_else(|| Rejection::from(SaegwcError::PeerUnreachable(self.node())))?;
        let seq = self.shared.seq.next(Interface::Sx);
        let out = sx_build::build_message(upf, Some(pdn.up_seid.unwrap_or(0)), seq, body);
        Ok(LegRequest::new(Leg::Sx, out))
    }

    pub fn modification(&self, req: SessionModificationRequest) -> Result<LegRequest, Rejection> {
        log::debug!(
            "Session Modification SEID[0x{:016x}] +PDR[{}] ~FAR[{}] ~QER[{}] -PDR[{}]",
            self.seid()?,
            req.create_pdrs.len(),
            req.update_fars.len(),
            req.update_qers.len(),
            req.remove_pdrs.len()
        );
        self.pfcp_request(PfcpBody::SessionModificationRequest(req))
    }

    /// Session-Id and next CC-Request-Number of the Gx session
    pub fn gx_session(&mut self) -> Result<(String, u32), Rejection> {
        let gx = self
            .pdn_ctx_mut()?
            .gx
            .as_mut()
            .ok_or_else(|| missing("Gx session"))?;
        let number = gx.next_request_number();
        Ok((gx.session_id.clone(), number))
    }

    /// CCR-Update on the PDN connection's Gx session
    pub fn gx_update(
        &mut self,
        reports: Vec<RuleReport>,
        tad: Option<bytes::Bytes>,
        uli: Option<bytes::Bytes>,
    ) -> Result<LegRequest, Rejection> {
        let (session_id, number) = self.gx_session()?;
        let hbh = self.shared.next_hop_by_hop();
        let out = gx_build::build_ccr_update(&session_id, hbh, number, reports, tad, uli);
        Ok(LegRequest::new(Leg::Gx, out))
    }

    /// CCR-Termination on the PDN connection's Gx session
    pub fn gx_termination(&mut self) -> Result<LegRequest, Rejection> {
        let (session_id, number) = self.gx_session()?;
        let hbh = self.shared.next_hop_by_hop();
        let out = gx_build::build_ccr_termination(&session_id, hbh, number);
        Ok(LegRequest::new(Leg::Gx, out))
    }
}

// ============================================================================
// Shared Steps
// ============================================================================

/// Rejection for an event a handler was not written for
pub fn unexpected(event: &SessEvent) -> Rejection {
    let name = event
        .envelope()
        .map(|e| e.name().to_string())
        .unwrap_or_else(|| format!("{event:?}"));
    SaegwcError::UnexpectedMessage(name).into()
}

/// Body of the GTP message carried by the event
pub fn gtp_body(event: &SessEvent) -> Result<&GtpBody, Rejection> {
    match event.envelope() {
        Some(Envelope::Gtp { msg, .. }) => Ok(&msg.body),
        _ => Err(unexpected(event)),
    }
}

/// Origin of an inbound GTP request, addressed back to its sender
pub fn gtp_origin(ctx: &SessionCtx<'_>, event: &SessEvent) -> Result<Origin, Rejection> {
    let Some(Envelope::Gtp { peer, iface, msg }) = event.envelope() else {
        return Err(unexpected(event));
    };
    let teid = match &msg.body {
        GtpBody::CreateSessionRequest(req) => req.sender_fteid.map(|f| f.teid),
        _ if *iface == ctx.role().access_interface() => access_peer(ctx).map(|f| f.teid),
        _ => ctx.pdn_ctx().ok().and_then(|p| p.peer_s5s8).map(|f| f.teid),
    };
    Ok(Origin::Gtp {
        peer: *peer,
        iface: *iface,
        teid: teid.unwrap_or(0),
        seq: msg.seq,
        message: msg.message_type(),
    })
}

/// Control endpoint of the access peer
pub fn access_peer(ctx: &SessionCtx<'_>) -> Option<FTeid> {
    if ctx.role().has_s11() {
        ctx.ue_ctx().ok().and_then(|u| u.mme_s11)
    } else {
        ctx.pdn_ctx().ok().and_then(|p| p.peer_s5s8)
    }
}

/// Allocate the local user plane endpoints of a new bearer
pub fn allocate_bearer_endpoints(ctx: &mut SessionCtx<'_>, bearer: BearerHandle) -> SaegwcResult<()> {
    let role = ctx.role();
    let upf = ctx
        .pdn_ctx()
        .ok()
        .and_then(|p| p.upf)
        .and_then(|node| ctx.shared.config.upf_by_node(node))
        .cloned()
        .ok_or(SaegwcError::PoolExhausted("UPF"))?;
    let teids = &mut ctx.tables.teids;
    let first = FTeid::new(teids.allocate()?, upf.access_addr);
    let second = if role == GatewayRole::Sgwc {
        match teids.allocate() {
            Ok(teid) => Some(FTeid::new(teid, upf.core_addr)),
            Err(e) => {
                teids.release(first.teid);
                return Err(e);
            }
        }
    } else {
        None
    };
    let b = ctx
        .tables
        .graph
        .bearer_mut(bearer)
        .ok_or_else(|| SaegwcError::ContextNotFound(format!("bearer {bearer:?}")))?;
    match role {
        GatewayRole::Sgwc => {
            b.s1u_sgw = Some(first);
            b.s5s8u_sgw = second;
        }
        GatewayRole::Saegwc => b.s1u_sgw = Some(first),
        GatewayRole::Pgwc => b.s5s8u_pgw = Some(first),
    }
    Ok(())
}

/// Remote access endpoints of the listed bearers
pub fn snapshot_access(ctx: &SessionCtx<'_>, ebis: &[Ebi]) -> Vec<AccessSnapshot> {
    let role = ctx.role();
    let Some(pdn) = ctx.pdn else {
        return Vec::new();
    };
    ebis.iter()
        .filter_map(|ebi| {
            let bearer = ctx.graph().bearer_by_ebi(pdn, *ebi)?;
            let b = ctx.graph().bearer(bearer)?;
            Some(AccessSnapshot {
                ebi: *ebi,
                remote: b.access_remote(role),
            })
        })
        .collect()
}

/// Put remote access endpoints back and resync the stored FARs
pub fn restore_access(ctx: &mut SessionCtx<'_>, previous: &[AccessSnapshot]) {
    let role = ctx.role();
    let Some(pdn) = ctx.pdn else {
        return;
    };
    let mut bearers = Vec::new();
    for snap in previous {
        if let Some(bearer) = ctx.graph().bearer_by_ebi(pdn, snap.ebi) {
            if let Some(b) = ctx.graph_mut().bearer_mut(bearer) {
                b.set_access_remote(role, snap.remote);
            }
            bearers.push(bearer);
        }
    }
    sx_build::sync_far_updates(ctx.graph_mut(), role, &bearers);
}

/// Fold one PDN connection's result into the UE-level answer
pub fn fold_aggregate(ctx: &mut SessionCtx<'_>, cause: u8, contexts: Vec<BearerContext>) {
    let Ok(seid) = ctx.seid() else {
        return;
    };
    let Ok(ue) = ctx.ue_ctx_mut() else {
        return;
    };
    let done = match ue.aggregate.as_mut() {
        Some(aggregate) => aggregate.complete(seid, cause, contexts),
        None => return,
    };
    if !done {
        return;
    }
    if let Some(aggregate) = ue.aggregate.take() {
        if let Some(body) = aggregate.answer() {
            ctx.respond(&aggregate.origin, body);
        }
    }
}

/// Cause of the first failed leg, if any
pub fn first_failure(ctx: &SessionCtx<'_>) -> Option<u8> {
    ctx.record().and_then(|r| r.legs.first_failure()).map(|(_, cause)| cause)
}

/// What a failed Gx leg means for the running procedure
pub fn gx_failure_is_fatal(ctx: &SessionCtx<'_>) -> bool {
    ctx.shared.config.gx.failure_handling == FailureHandling::Terminate
}

fn pending_is_ccr_initial(record: &CorrelationRecord) -> bool {
    record.pending().iter().any(|p| {
        p.leg == Leg::Gx
            && matches!(
                &p.request,
                Envelope::Gx { msg }
                    if matches!(&msg.body, GxBody::CreditControlRequest(ccr) if ccr.request_type == CcRequestType::Initial)
            )
    })
}

fn has_pending(record: &CorrelationRecord, leg: Leg) -> bool {
    record.pending().iter().any(|p| p.leg == leg)
}

/// Drive every leg of the PDN connection toward release
///
/// Legs in `excluded` lead to a dead peer and are excused. A creation
/// request still in flight is kept so that a late success can be undone.
/// After a peer failure the access peer gets a Delete Bearer Request for
/// the default bearer unless it is the peer that failed.
/// A record is opened when none is running.
pub fn start_teardown(ctx: &mut SessionCtx<'_>, excluded: &[Leg]) -> Result<Vec<LegRequest>, Rejection> {
    if ctx.record().is_none() {
        ctx.begin(RequestDescriptor::PeerCleanup { peer: None }, None)?;
    }
    let (up_seid, has_gx, pgw_known) = {
        let pdn = ctx.pdn_ctx()?;
        (
            pdn.up_seid,
            pdn.gx.is_some(),
            pdn.peer_s5s8.is_some_and(|f| f.teid != 0),
        )
    };
    let relays = ctx.role().relays_to_pgw();
    let mut requests = Vec::new();

    // user plane
    let (sx_pending, gx_status, gx_initial, s5_pending) = {
        let record = ctx.record().ok_or_else(|| missing("record"))?;
        (
            has_pending(record, Leg::Sx),
            record.legs.status(Leg::Gx),
            pending_is_ccr_initial(record),
            has_pending(record, Leg::S5s8),
        )
    };
    if excluded.contains(&Leg::Sx) {
        ctx.excuse_leg(Leg::Sx);
    } else if up_seid.is_some() {
        if let Some(record) = ctx.record_mut() {
            record.drop_leg(Leg::Sx);
        }
        requests.push(ctx.pfcp_request(PfcpBody::SessionDeletionRequest)?);
    } else if !sx_pending {
        ctx.excuse_leg(Leg::Sx);
    }

    // policy
    if excluded.contains(&Leg::Gx) || !has_gx || matches!(gx_status, Some(LegStatus::Failed(_))) {
        ctx.excuse_leg(Leg::Gx);
    } else if !gx_initial {
        if let Some(record) = ctx.record_mut() {
            record.drop_leg(Leg::Gx);
        }
        requests.push(ctx.gx_termination()?);
    }

    // PGW
    if !relays || excluded.contains(&Leg::S5s8) {
        ctx.excuse_leg(Leg::S5s8);
    } else if pgw_known {
        if let Some(record) = ctx.record_mut() {
            record.drop_leg(Leg::S5s8);
        }
        let body = {
            let pdn = ctx.pdn_ctx()?;
            gtp_build::build_delete_session_request(pdn)
        };
        requests.push(ctx.pgw_request(body)?);
    } else if !s5_pending {
        ctx.excuse_leg(Leg::S5s8);
    }

    // access peer, told when a peer failure ends the connection
    let peer_failure = matches!(ctx.descriptor(), Some(RequestDescriptor::PeerCleanup { peer: Some(_) }));
    if peer_failure && !excluded.contains(&Leg::Access) && access_peer(ctx).is_some() {
        if let Some(record) = ctx.record_mut() {
            record.drop_leg(Leg::Access);
        }
        let default_ebi = ctx.pdn_ctx()?.default_ebi;
        let body = gtp_build::build_delete_bearer_request(Some(default_ebi), &[], None, None);
        requests.push(ctx.access_request(body)?);
    } else {
        ctx.excuse_leg(Leg::Access);
    }
    log::info!(
        "Teardown SEID[0x{:016x}] legs out[{}]",
        ctx.seid()?,
        requests.len()
    );
    Ok(requests)
}

/// Answer the release trigger once every leg has finished
pub fn finish_teardown(ctx: &mut SessionCtx<'_>) -> Outcome {
    let rolled_back = ctx.state == SessState::ErrorOccurred;
    let descriptor = ctx.descriptor().cloned();
    if let Some(origin) = ctx.take_origin() {
        let accepted = gtp_cause::REQUEST_ACCEPTED;
        match (&descriptor, &origin) {
            (_, Origin::Gx { .. }) => ctx.respond_raa(&origin, gx_result::SUCCESS, Vec::new()),
            (Some(RequestDescriptor::DeleteSession), _) => {
                ctx.respond(&origin, GtpBody::DeleteSessionResponse(DeleteSessionResponse { cause: accepted }));
            }
            (Some(RequestDescriptor::NetworkDetach), _) => {
                let default_ebi = ctx.pdn_ctx().ok().map(|p| p.default_ebi);
                ctx.respond(&origin, gtp_build::build_delete_bearer_response(accepted, default_ebi, &[]));
            }
            _ => {}
        }
    }
    if rolled_back {
        Outcome::Complete(Disposition::RolledBack)
    } else {
        Outcome::Complete(Disposition::Released)
    }
}

/// Start releasing the PDN connection; completes at once when no leg is left
pub fn teardown(ctx: &mut SessionCtx<'_>, excluded: &[Leg], state: SessState) -> Result<Outcome, Rejection> {
    let requests = start_teardown(ctx, excluded)?;
    if requests.is_empty() && ctx.legs_finished() {
        return Ok(finish_teardown(ctx));
    }
    Ok(Outcome::Advance { state, requests })
}

/// Reject a PDN setup toward its origin and roll the session back
pub fn fail_attach(ctx: &mut SessionCtx<'_>, cause: u8) -> Result<Outcome, Rejection> {
    log::error!(
        "{} failed SEID[0x{:016x}] cause[{}]",
        ctx.procedure.name(),
        ctx.seid()?,
        cause
    );
    if let Some(origin) = ctx.take_origin() {
        ctx.respond(
            &origin,
            GtpBody::CreateSessionResponse(CreateSessionResponse {
                cause,
                ..Default::default()
            }),
        );
    }
    ctx.state = SessState::ErrorOccurred;
    teardown(ctx, &[], SessState::ErrorOccurred)
}

/// Relayed answer body matching the request a PGW sent
pub fn relay_answer(message: GtpMessageType, cause: u8, contexts: Vec<BearerContext>) -> Option<GtpBody> {
    match message {
        GtpMessageType::CreateBearerRequest => Some(gtp_build::build_create_bearer_response(cause, contexts)),
        GtpMessageType::UpdateBearerRequest => Some(gtp_build::build_update_bearer_response(cause, contexts)),
        GtpMessageType::DeleteBearerRequest => {
            let ebis: Vec<Ebi> = contexts.iter().filter_map(|bc| Ebi::new(bc.ebi).ok()).collect();
            Some(gtp_build::build_delete_bearer_response(cause, None, &ebis))
        }
        _ => None,
    }
}

/// Answer the trigger of a bearer procedure
pub fn answer_trigger(
    ctx: &mut SessionCtx<'_>,
    trigger: BearerTrigger,
    cause: u8,
    contexts: Vec<BearerContext>,
    reports: Vec<RuleReport>,
) {
    let Some(origin) = ctx.take_origin() else {
        return;
    };
    let accepted = gtp_cause::is_accepted(cause);
    match trigger {
        BearerTrigger::Pcrf => {
            let result = if accepted { gx_result::SUCCESS } else { gx_result::from_gtp(cause) };
            ctx.respond_raa(&origin, result, reports);
        }
        BearerTrigger::BearerResource { pti } if !accepted => {
            let linked_ebi = ctx.pdn_ctx().map(|p| p.default_ebi.value()).unwrap_or(0);
            ctx.respond(
                &origin,
                GtpBody::BearerResourceFailureIndication(BearerResourceFailureIndication {
                    cause,
                    linked_ebi,
                    pti,
                }),
            );
        }
        BearerTrigger::Command if !accepted => {
            ctx.respond(
                &origin,
                GtpBody::DeleteBearerFailureIndication(DeleteBearerFailureIndication {
                    cause,
                    bearer_contexts: contexts,
                }),
            );
        }
        BearerTrigger::Relay { .. } => {
            if let Origin::Gtp { message, .. } = &origin {
                if let Some(body) = relay_answer(*message, cause, contexts) {
                    ctx.respond(&origin, body);
                }
            }
        }
        BearerTrigger::BearerResource { .. } | BearerTrigger::Command => {}
    }
}

fn with_cause(ebis: &[Ebi], cause: u8) -> Vec<BearerContext> {
    ebis.iter()
        .map(|ebi| BearerContext {
            cause: Some(cause),
            ..BearerContext::new(ebi.value())
        })
        .collect()
}

/// Fail the running procedure, undoing what it changed in the graph
///
/// Setups roll back, deletions degrade to a local release, everything
/// else restores its snapshot, answers the failure and resumes.
pub fn fail_procedure(ctx: &mut SessionCtx<'_>, cause: u8) -> Result<Outcome, Rejection> {
    let descriptor = ctx
        .descriptor()
        .cloned()
        .ok_or_else(|| missing("record"))?;
    log::warn!(
        "{} {} failed cause[{}]",
        ctx.procedure.name(),
        descriptor.name(),
        cause
    );
    let role = ctx.role();
    let outcome = match descriptor {
        RequestDescriptor::CreateSession { .. } => return fail_attach(ctx, cause),
        RequestDescriptor::DeleteSession
        | RequestDescriptor::NetworkDetach
        | RequestDescriptor::PeerCleanup { .. } => {
            let pending: Vec<Leg> = ctx
                .record()
                .map(|r| r.legs.pending().collect())
                .unwrap_or_default();
            for leg in pending {
                if ctx.record().is_some_and(|r| !has_pending(r, leg)) {
                    ctx.excuse_leg(leg);
                }
            }
            if ctx.legs_finished() {
                finish_teardown(ctx)
            } else {
                Outcome::Stay { requests: Vec::new() }
            }
        }
        RequestDescriptor::Relocation {
            previous,
            previous_sender,
            ..
        } => {
            restore_access(ctx, &previous);
            set_access_sender(ctx, previous_sender);
            if let Some(origin) = ctx.take_origin() {
                ctx.respond(
                    &origin,
                    GtpBody::CreateSessionResponse(CreateSessionResponse {
                        cause,
                        ..Default::default()
                    }),
                );
            }
            Outcome::Complete(Disposition::Resume)
        }
        RequestDescriptor::ModifyBearer {
            previous,
            previous_sender,
            ..
        } => {
            restore_access(ctx, &previous);
            set_access_sender(ctx, previous_sender);
            fold_aggregate(ctx, cause, Vec::new());
            Outcome::Complete(Disposition::Resume)
        }
        RequestDescriptor::ReleaseAccessBearers { previous } => {
            restore_access(ctx, &previous);
            fold_aggregate(ctx, cause, Vec::new());
            Outcome::Complete(Disposition::Resume)
        }
        RequestDescriptor::BearerActivation { ebis, trigger, .. } => {
            let pdn = ctx.pdn_handle()?;
            let (names, freed) = ctx.tables.detach_bearers(role, pdn, &ebis);
            let reports = gx_build::build_rule_reports(&names, false, Some(gx_result::PCC_RULE_EVENT));
            answer_trigger(ctx, trigger, cause, with_cause(&ebis, cause), reports);
            let installed = ctx.pdn_ctx()?.up_seid.is_some() && !freed.is_empty();
            if installed && ctx.leg_status(Leg::Sx) == Some(LegStatus::Done) {
                // rules reached the user plane, take them back
                let removal = sx_build::build_rule_removal(&freed);
                ctx.ensure_record(
                    Procedure::DedicatedBearerDeactivation,
                    RequestDescriptor::BearerDeactivation {
                        ebis,
                        rule_names: Vec::new(),
                        trigger,
                    },
                )?;
                let request = ctx.modification(removal)?;
                Outcome::Switch {
                    procedure: Procedure::DedicatedBearerDeactivation,
                    state: SessState::ModifyRequested,
                    requests: vec![request],
                }
            } else {
                Outcome::Complete(Disposition::Resume)
            }
        }
        RequestDescriptor::BearerModification { previous, trigger, .. } => {
            let pdn = ctx.pdn_handle()?;
            let mut ebis = Vec::new();
            for (ebi, qos) in &previous {
                if let Some(bearer) = ctx.graph().bearer_by_ebi(pdn, *ebi) {
                    if let Some(b) = ctx.graph_mut().bearer_mut(bearer) {
                        b.qos = *qos;
                    }
                }
                ebis.push(*ebi);
            }
            let bearers = ctx.bearers_of(&ebis);
            sx_build::sync_qer_updates(ctx.graph_mut(), pdn, &bearers);
            answer_trigger(ctx, trigger, cause, with_cause(&ebis, cause), Vec::new());
            Outcome::Complete(Disposition::Resume)
        }
        RequestDescriptor::BearerDeactivation { ebis, trigger, .. } => {
            // a deletion is not refused, finish it locally
            let pdn = ctx.pdn_handle()?;
            let remaining: Vec<Ebi> = ebis
                .iter()
                .copied()
                .filter(|ebi| ctx.graph().bearer_by_ebi(pdn, *ebi).is_some())
                .collect();
            ctx.tables.detach_bearers(role, pdn, &remaining);
            answer_trigger(
                ctx,
                trigger,
                gtp_cause::REQUEST_ACCEPTED,
                with_cause(&ebis, gtp_cause::REQUEST_ACCEPTED),
                Vec::new(),
            );
            Outcome::Complete(Disposition::Resume)
        }
        RequestDescriptor::BearerResource { command } => {
            if let Some(origin) = ctx.take_origin() {
                ctx.respond(
                    &origin,
                    GtpBody::BearerResourceFailureIndication(BearerResourceFailureIndication {
                        cause,
                        linked_ebi: command.linked_ebi,
                        pti: command.pti,
                    }),
                );
            }
            Outcome::Complete(Disposition::Resume)
        }
        RequestDescriptor::ChangeNotification { imsi } => {
            if let Some(origin) = ctx.take_origin() {
                ctx.respond(
                    &origin,
                    GtpBody::ChangeNotificationResponse(ChangeNotificationResponse { cause, imsi }),
                );
            }
            Outcome::Complete(Disposition::Resume)
        }
    };
    Ok(outcome)
}

/// Set the control endpoint of the access peer
pub fn set_access_sender(ctx: &mut SessionCtx<'_>, sender: Option<FTeid>) {
    if ctx.role().has_s11() {
        if let Ok(ue) = ctx.ue_ctx_mut() {
            ue.mme_s11 = sender;
        }
    } else if let Ok(pdn) = ctx.pdn_ctx_mut() {
        pdn.peer_s5s8 = sender;
    }
}
