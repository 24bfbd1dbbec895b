//! Access Side Handler
//!
//! Requests from the access peer (the MME on S11, the SGW on S5/S8 at a
//! PGW-C) and the answers it returns to bearer requests.

use crate::context::{derive_seid, GxSession, PdnHandle};
use crate::correlation::{ActivationPhase, BearerTrigger, Leg, LegStatus, Origin, RequestDescriptor};
use crate::error::{Rejection, SaegwcError};
use crate::event::{Procedure, SessEvent, SessState};
use crate::gtp_build;
use crate::gx_build;
use crate::gx_handler;
use crate::handler::{
    access_peer, allocate_bearer_endpoints, answer_trigger, fail_attach, fail_procedure,
    fold_aggregate, gtp_body, gtp_origin, gx_failure_is_fatal, set_access_sender, snapshot_access,
    teardown, unexpected, SessionCtx,
};
use crate::identity::{IdentityKey, Owner};
use crate::message::{
    BearerContext, BearerResourceFailureIndication, ChangeNotificationResponse, CreateSessionRequest,
    GtpBody, SessionModificationRequest,
};
use crate::sm::{Disposition, Outcome};
use crate::sx_build;
use crate::types::{gtp_cause, gx_result, Ebi, GatewayRole, PeerKind};

// ============================================================================
// Create Session
// ============================================================================

/// Handle Create Session Request
pub fn handle_create_session_request(ctx: &mut SessionCtx<'_>, event: &SessEvent) -> Result<Outcome, Rejection> {
    let GtpBody::CreateSessionRequest(req) = gtp_body(event)? else {
        return Err(unexpected(event));
    };
    let req = req.clone();
    let origin = gtp_origin(ctx, event)?;
    log::info!("Create Session Request");

    let imsi = req.imsi.clone().ok_or(SaegwcError::MissingIe("IMSI"))?;
    let sender = req.sender_fteid.ok_or(SaegwcError::MissingIe("Sender F-TEID"))?;
    let default_raw = req
        .linked_ebi
        .or_else(|| req.bearer_contexts.first().map(|bc| bc.ebi))
        .ok_or(SaegwcError::MissingIe("Bearer Context"))?;
    let default_ebi = Ebi::new(default_raw)?;
    let role = ctx.role();
    if role.relays_to_pgw() && req.pgw_s5s8_fteid.is_none() {
        return Err(SaegwcError::MissingIe("PGW S5/S8 F-TEID").into());
    }
    log::info!(
        "    IMSI[{}] APN[{}] sender TEID[0x{:08x}] {}",
        imsi,
        req.apn,
        sender.teid,
        ctx.procedure.name()
    );

    if let Some(pdn) = ctx.pdn {
        if ctx.procedure == Procedure::Handover && ctx.state.is_stable() {
            return handle_relocation(ctx, origin, req);
        }
        log::warn!("Stale PDN IMSI[{}] APN[{}] released", imsi, req.apn);
        let shared = ctx.shared;
        ctx.tables.release_pdn(shared, pdn);
        ctx.pdn = None;
        if ctx.ue.is_some_and(|ue| ctx.graph().ue(ue).is_none()) {
            ctx.ue = None;
        }
        ctx.state = SessState::Idle;
    }

    // UE context
    let shared = ctx.shared;
    let partition = ctx.tables.id;
    let ue = match ctx.ue {
        Some(ue) => ue,
        None => {
            let s11_teid = if role.has_s11() {
                Some(ctx.tables.teids.allocate()?)
            } else {
                None
            };
            let ue = ctx.graph_mut().create_ue(imsi.clone());
            if let Some(ue_ctx) = ctx.graph_mut().ue_mut(ue) {
                ue_ctx.local_s11_teid = s11_teid;
            }
            if let Some(teid) = s11_teid {
                if let Err(e) = shared.identities.insert(IdentityKey::Teid(teid), Owner::ue(partition, ue)) {
                    log::error!("S11 TEID[0x{teid:08x}] not registered: {e}");
                }
            }
            if let Err(e) = shared.identities.insert(IdentityKey::Imsi(imsi.clone()), Owner::ue(partition, ue)) {
                log::error!("IMSI[{imsi}] not registered: {e}");
            }
            ctx.ue = Some(ue);
            ue
        }
    };
    {
        let ue_ctx = ctx.ue_ctx_mut()?;
        if req.msisdn.is_some() {
            ue_ctx.msisdn = req.msisdn.clone();
        }
        if role.has_s11() {
            ue_ctx.mme_s11 = Some(sender);
        }
    }

    // PDN connection
    let s5s8_teid = if role == GatewayRole::Saegwc {
        None
    } else {
        Some(ctx.tables.teids.allocate()?)
    };
    let Some(base_teid) = s5s8_teid.or(ctx.ue_ctx()?.local_s11_teid) else {
        return Err(SaegwcError::ContextNotFound("local control TEID".to_string()).into());
    };
    let seid = derive_seid(base_teid, default_ebi);
    let pdn = match ctx.graph_mut().create_pdn(ue, &req.apn, default_ebi, seid) {
        Ok(pdn) => pdn,
        Err(e) => {
            if let Some(teid) = s5s8_teid {
                ctx.tables.teids.release(teid);
            }
            return Err(e.into());
        }
    };
    ctx.pdn = Some(pdn);
    {
        let upf = shared.select_upf(&imsi).map(|u| u.node);
        let procedure = ctx.procedure;
        let p = ctx.pdn_ctx_mut()?;
        p.procedure = Some(procedure);
        p.upf = upf;
        p.ambr = req.ambr;
        p.uli = req.uli.clone();
        p.local_s5s8_teid = s5s8_teid;
        p.peer_s5s8 = match role {
            GatewayRole::Pgwc => Some(sender),
            GatewayRole::Sgwc => req.pgw_s5s8_fteid,
            GatewayRole::Saegwc => None,
        };
    }
    if let Err(rejection) = populate_pdn(ctx, pdn, &req, base_teid) {
        log::error!("PDN APN[{}] not created: {}", req.apn, rejection);
        ctx.tables.release_pdn(shared, pdn);
        ctx.pdn = None;
        return Err(rejection);
    }

    ctx.begin(RequestDescriptor::CreateSession { request: req }, Some(origin))?;

    let mut requests = Vec::new();
    let upf = ctx.pdn_ctx()?.upf;
    let state = match upf {
        Some(upf) if shared.is_associated(upf) => {
            let body = sx_build::build_session_establishment_request(ctx.graph(), ctx.node(), pdn)
                .ok_or_else(|| SaegwcError::ContextNotFound("PDN".to_string()))?;
            requests.push(ctx.pfcp_request(body)?);
            SessState::SessionEstablishRequested
        }
        _ => {
            log::info!("    waiting for PFCP association");
            if let Some(record) = ctx.record_mut() {
                record.legs.require(Leg::Sx);
            }
            SessState::AssociationRequested
        }
    };
    if ctx.gx_enabled() {
        requests.push(gx_handler::ccr_initial(ctx)?);
    }
    Ok(Outcome::Advance { state, requests })
}

/// Identities, addresses, policy session, CSIDs and bearers of a new PDN
fn populate_pdn(
    ctx: &mut SessionCtx<'_>,
    pdn: PdnHandle,
    req: &CreateSessionRequest,
    base_teid: u32,
) -> Result<(), Rejection> {
    let shared = ctx.shared;
    let role = ctx.role();
    let partition = ctx.tables.id;
    let ue = ctx.ue_handle()?;
    let owner = Owner::pdn(partition, ue, pdn);
    let (seid, default_ebi, local_s5s8) = {
        let p = ctx.pdn_ctx()?;
        if p.upf.is_none() {
            return Err(SaegwcError::PoolExhausted("UPF").into());
        }
        (p.seid, p.default_ebi, p.local_s5s8_teid)
    };
    shared.identities.insert(IdentityKey::Seid(seid), owner)?;
    if let Some(teid) = local_s5s8 {
        shared.identities.insert(IdentityKey::Teid(teid), owner)?;
    }

    if let Some(pool) = ctx.tables.ue_ips.as_mut() {
        let addr = match req.paa {
            Some(addr) if pool.reserve(addr) => addr,
            _ => pool.allocate()?,
        };
        ctx.pdn_ctx_mut()?.ue_ip = Some(addr);
    }

    if ctx.gx_enabled() {
        let session_id = gx_build::session_id(&shared.config.gx.origin_host, base_teid, default_ebi);
        shared
            .identities
            .insert(IdentityKey::GxSession(session_id.clone()), owner)?;
        ctx.pdn_ctx_mut()?.gx = Some(GxSession::new(session_id));
    }

    if role.has_s11() {
        ctx.tables.bind_csid(pdn, PeerKind::Mme, req.mme_fqcsid.clone());
    } else {
        ctx.tables.bind_csid(pdn, PeerKind::Sgw, req.sgw_fqcsid.clone());
    }

    let contexts = if req.bearer_contexts.is_empty() {
        vec![BearerContext::new(default_ebi.value())]
    } else {
        req.bearer_contexts.clone()
    };
    for bc in &contexts {
        let bearer = ctx.graph_mut().create_bearer(pdn, Some(bc.ebi))?;
        if let Some(b) = ctx.graph_mut().bearer_mut(bearer) {
            b.qos = bc.qos.unwrap_or_default();
            b.tft = bc.tft.clone();
            let remote = if role.has_s11() { bc.s1u_enb } else { bc.s5s8u_sgw };
            b.set_access_remote(role, remote);
        }
        allocate_bearer_endpoints(ctx, bearer)?;
        sx_build::install_bearer_rules(ctx.graph_mut(), role, bearer, &[], sx_build::DEFAULT_PRECEDENCE)?;
    }
    Ok(())
}

/// Handover Create Session on a connected PDN: move the access endpoints
fn handle_relocation(
    ctx: &mut SessionCtx<'_>,
    origin: Origin,
    req: CreateSessionRequest,
) -> Result<Outcome, Rejection> {
    let role = ctx.role();
    let pdn = ctx.pdn_handle()?;
    log::info!("    relocation APN[{}]", req.apn);
    let ebis = known_ebis(ctx, pdn, &req.bearer_contexts);
    let previous = snapshot_access(ctx, &ebis);
    let previous_sender = access_peer(ctx);
    if let Some(sender) = req.sender_fteid {
        set_access_sender(ctx, Some(sender));
    }
    apply_access_remotes(ctx, pdn, role, &req.bearer_contexts);
    let bearers = ctx.bearers_of(&ebis);
    ctx.begin(
        RequestDescriptor::Relocation {
            request: req,
            previous,
            previous_sender,
        },
        Some(origin),
    )?;
    let update_fars = sx_build::sync_far_updates(ctx.graph_mut(), role, &bearers);
    if update_fars.is_empty() {
        return answer_create_session(ctx);
    }
    let request = ctx.modification(SessionModificationRequest {
        update_fars,
        ..Default::default()
    })?;
    Ok(Outcome::Advance {
        state: SessState::ModifyRequested,
        requests: vec![request],
    })
}

/// Next step of a PDN setup once a leg has finished
pub fn continue_attach(ctx: &mut SessionCtx<'_>) -> Result<Outcome, Rejection> {
    let (sx, gx, s5s8) = match ctx.record() {
        Some(record) => (
            record.legs.status(Leg::Sx),
            record.legs.status(Leg::Gx),
            record.legs.status(Leg::S5s8),
        ),
        None => return Err(SaegwcError::ContextNotFound("record".to_string()).into()),
    };
    if sx == Some(LegStatus::Pending) {
        return Ok(Outcome::stay());
    }
    if let Some(LegStatus::Failed(cause)) = gx {
        if gx_failure_is_fatal(ctx) {
            return fail_attach(ctx, cause);
        }
        log::warn!("Gx failed cause[{cause}], continuing without policy control");
        ctx.excuse_leg(Leg::Gx);
    } else if gx == Some(LegStatus::Pending) {
        return Ok(Outcome::Advance {
            state: SessState::SessionEstablished,
            requests: Vec::new(),
        });
    }
    if ctx.role().relays_to_pgw() && s5s8.is_none() {
        let Some(RequestDescriptor::CreateSession { request }) = ctx.descriptor().cloned() else {
            return Err(SaegwcError::ContextNotFound("record".to_string()).into());
        };
        let pdn = ctx.pdn_handle()?;
        let body = gtp_build::build_forward_create_session_request(ctx.graph(), ctx.node(), pdn, &request)
            .ok_or_else(|| SaegwcError::ContextNotFound("PDN".to_string()))?;
        let forward = ctx.pgw_request(body)?;
        return Ok(Outcome::Advance {
            state: SessState::CreateSessionRequested,
            requests: vec![forward],
        });
    }
    answer_create_session(ctx)
}

/// Accept the Create Session Request the record holds
pub fn answer_create_session(ctx: &mut SessionCtx<'_>) -> Result<Outcome, Rejection> {
    let pdn = ctx.pdn_handle()?;
    let recovery = Some(ctx.shared.restart_counter);
    let body = gtp_build::build_create_session_response(ctx.graph(), ctx.role(), ctx.node(), pdn, recovery)
        .ok_or_else(|| SaegwcError::ContextNotFound("PDN".to_string()))?;
    if let Some(origin) = ctx.take_origin() {
        ctx.respond(&origin, body);
    }
    let p = ctx.pdn_ctx()?;
    log::info!(
        "[Connected] APN[{}] SEID[0x{:016x}] UE IP[{}]",
        p.apn,
        p.seid,
        p.ue_ip.map(|ip| ip.to_string()).unwrap_or_else(|| "-".to_string())
    );
    Ok(Outcome::Complete(Disposition::Connected))
}

// ============================================================================
// Access Bearer Updates
// ============================================================================

/// Bearer ids of the contexts that exist on the PDN connection
fn known_ebis(ctx: &SessionCtx<'_>, pdn: PdnHandle, contexts: &[BearerContext]) -> Vec<Ebi> {
    contexts
        .iter()
        .filter_map(|bc| Ebi::new(bc.ebi).ok())
        .filter(|ebi| ctx.graph().bearer_by_ebi(pdn, *ebi).is_some())
        .collect()
}

/// Store the remote access endpoints carried by bearer contexts
fn apply_access_remotes(ctx: &mut SessionCtx<'_>, pdn: PdnHandle, role: GatewayRole, contexts: &[BearerContext]) {
    for bc in contexts {
        let remote = if role.has_s11() { bc.s1u_enb } else { bc.s5s8u_sgw };
        let Some(remote) = remote else {
            continue;
        };
        let Ok(ebi) = Ebi::new(bc.ebi) else {
            continue;
        };
        if let Some(bearer) = ctx.graph().bearer_by_ebi(pdn, ebi) {
            if let Some(b) = ctx.graph_mut().bearer_mut(bearer) {
                b.set_access_remote(role, Some(remote));
            }
        }
    }
}

/// Handle Modify Bearer Request for one of the PDN connections it targets
pub fn handle_modify_bearer_request(ctx: &mut SessionCtx<'_>, event: &SessEvent) -> Result<Outcome, Rejection> {
    let GtpBody::ModifyBearerRequest(req) = gtp_body(event)? else {
        return Err(unexpected(event));
    };
    let req = req.clone();
    let role = ctx.role();
    let pdn = ctx.pdn_handle()?;
    log::info!("Modify Bearer Request");

    let ebis = known_ebis(ctx, pdn, &req.bearer_contexts);
    let previous = snapshot_access(ctx, &ebis);
    let previous_sender = access_peer(ctx);
    if let Some(sender) = req.sender_fteid {
        set_access_sender(ctx, Some(sender));
    }
    apply_access_remotes(ctx, pdn, role, &req.bearer_contexts);
    {
        let p = ctx.pdn_ctx_mut()?;
        if req.uli.is_some() {
            p.uli = req.uli.clone();
        }
        if req.bearer_contexts.iter().any(BearerContext::has_enb_fteid) {
            p.ddn_pending = false;
        }
    }
    log::info!(
        "    SEID[0x{:016x}] bearers[{}] {}",
        ctx.seid()?,
        ebis.len(),
        ctx.procedure.name()
    );

    let bearers = ctx.bearers_of(&ebis);
    ctx.begin(
        RequestDescriptor::ModifyBearer {
            ebis,
            previous,
            previous_sender,
        },
        None,
    )?;
    let update_fars = sx_build::sync_far_updates(ctx.graph_mut(), role, &bearers);
    if update_fars.is_empty() {
        return finish_modify_bearer(ctx);
    }
    let request = ctx.modification(SessionModificationRequest {
        update_fars,
        ..Default::default()
    })?;
    Ok(Outcome::Advance {
        state: SessState::ModifyRequested,
        requests: vec![request],
    })
}

/// Report the modified bearers into the UE-level answer
pub fn finish_modify_bearer(ctx: &mut SessionCtx<'_>) -> Result<Outcome, Rejection> {
    let role = ctx.role();
    let pdn = ctx.pdn_handle()?;
    let ebis = match ctx.descriptor() {
        Some(RequestDescriptor::ModifyBearer { ebis, .. }) => ebis.clone(),
        _ => Vec::new(),
    };
    let contexts = gtp_build::build_bearer_contexts(ctx.graph(), pdn, &ebis, Some(gtp_cause::REQUEST_ACCEPTED));
    fold_aggregate(ctx, gtp_cause::REQUEST_ACCEPTED, contexts);
    let connected = ctx
        .all_bearers()
        .iter()
        .filter_map(|b| ctx.graph().bearer(*b))
        .all(|b| b.access_remote(role).is_some());
    Ok(Outcome::Complete(if connected {
        Disposition::Connected
    } else {
        Disposition::Resume
    }))
}

/// Handle Release Access Bearers Request for one PDN connection of the UE
pub fn handle_release_access_bearers_request(
    ctx: &mut SessionCtx<'_>,
    _event: &SessEvent,
) -> Result<Outcome, Rejection> {
    log::info!("Release Access Bearers Request");
    let role = ctx.role();
    if ctx.state == SessState::IdleMode {
        fold_aggregate(ctx, gtp_cause::REQUEST_ACCEPTED, Vec::new());
        return Ok(Outcome::Complete(Disposition::IdleMode));
    }
    let bearers = ctx.all_bearers();
    let ebis: Vec<Ebi> = bearers
        .iter()
        .filter_map(|b| ctx.graph().bearer(*b).map(|b| b.ebi))
        .collect();
    let previous = snapshot_access(ctx, &ebis);
    for bearer in &bearers {
        if let Some(b) = ctx.graph_mut().bearer_mut(*bearer) {
            b.set_access_remote(role, None);
        }
    }
    ctx.begin(RequestDescriptor::ReleaseAccessBearers { previous }, None)?;
    let update_fars = sx_build::sync_far_updates(ctx.graph_mut(), role, &bearers);
    if update_fars.is_empty() {
        fold_aggregate(ctx, gtp_cause::REQUEST_ACCEPTED, Vec::new());
        return Ok(Outcome::Complete(Disposition::IdleMode));
    }
    let request = ctx.modification(SessionModificationRequest {
        update_fars,
        ..Default::default()
    })?;
    Ok(Outcome::Advance {
        state: SessState::ModifyRequested,
        requests: vec![request],
    })
}

// ============================================================================
// Delete Session
// ============================================================================

/// Handle Delete Session Request
pub fn handle_delete_session_request(ctx: &mut SessionCtx<'_>, event: &SessEvent) -> Result<Outcome, Rejection> {
    let GtpBody::DeleteSessionRequest(req) = gtp_body(event)? else {
        return Err(unexpected(event));
    };
    let req = req.clone();
    let origin = gtp_origin(ctx, event)?;
    log::info!("Delete Session Request");
    {
        let p = ctx.pdn_ctx_mut()?;
        if req.uli.is_some() {
            p.uli = req.uli.clone();
        }
        log::info!("    APN[{}] SEID[0x{:016x}]", p.apn, p.seid);
    }
    ctx.begin(RequestDescriptor::DeleteSession, Some(origin))?;
    let excluded: &[Leg] = if req.indication.scope { &[Leg::S5s8] } else { &[] };
    teardown(ctx, excluded, SessState::DeleteRequested)
}

// ============================================================================
// Commands
// ============================================================================

/// Forward a command to the PGW, remembering whom to answer on failure
fn relay_command(ctx: &mut SessionCtx<'_>, event: &SessEvent) -> Result<Outcome, Rejection> {
    let body = gtp_body(event)?.clone();
    let origin = gtp_origin(ctx, event)?;
    let forward = ctx.pgw_request(body)?.request;
    if let Some(seq) = forward.seq() {
        ctx.pdn_ctx_mut()?.remember_relay(seq, origin);
    }
    log::info!("    relayed to PGW");
    ctx.emit(forward);
    Ok(Outcome::stay())
}

/// Handle Bearer Resource Command
pub fn handle_bearer_resource_command(ctx: &mut SessionCtx<'_>, event: &SessEvent) -> Result<Outcome, Rejection> {
    let GtpBody::BearerResourceCommand(cmd) = gtp_body(event)? else {
        return Err(unexpected(event));
    };
    let cmd = cmd.clone();
    log::info!("Bearer Resource Command LBI[{}] PTI[{}]", cmd.linked_ebi, cmd.pti);
    if ctx.role().relays_to_pgw() {
        return relay_command(ctx, event);
    }
    let origin = gtp_origin(ctx, event)?;
    if !ctx.gx_enabled() {
        ctx.respond(
            &origin,
            GtpBody::BearerResourceFailureIndication(BearerResourceFailureIndication {
                cause: gtp_cause::SERVICE_NOT_SUPPORTED,
                linked_ebi: cmd.linked_ebi,
                pti: cmd.pti,
            }),
        );
        return Ok(Outcome::stay());
    }
    let tad = cmd.tad.clone();
    ctx.begin(RequestDescriptor::BearerResource { command: cmd }, Some(origin))?;
    let request = ctx.gx_update(Vec::new(), tad, None)?;
    Ok(Outcome::Advance {
        state: SessState::PolicyRequested,
        requests: vec![request],
    })
}

/// Handle Delete Bearer Command
pub fn handle_delete_bearer_command(ctx: &mut SessionCtx<'_>, event: &SessEvent) -> Result<Outcome, Rejection> {
    let GtpBody::DeleteBearerCommand(cmd) = gtp_body(event)? else {
        return Err(unexpected(event));
    };
    let cmd = cmd.clone();
    log::info!("Delete Bearer Command bearers[{}]", cmd.ebis.len());
    if ctx.role().relays_to_pgw() {
        return relay_command(ctx, event);
    }
    let pdn = ctx.pdn_handle()?;
    let default_ebi = ctx.pdn_ctx()?.default_ebi;
    let ebis: Vec<Ebi> = cmd
        .ebis
        .iter()
        .filter_map(|raw| Ebi::new(*raw).ok())
        .filter(|ebi| *ebi != default_ebi && ctx.graph().bearer_by_ebi(pdn, *ebi).is_some())
        .collect();
    if ebis.is_empty() {
        return Err(SaegwcError::ContextNotFound("dedicated bearer".to_string()).into());
    }
    let origin = gtp_origin(ctx, event)?;
    ctx.begin(
        RequestDescriptor::BearerDeactivation {
            ebis: ebis.clone(),
            rule_names: Vec::new(),
            trigger: BearerTrigger::Command,
        },
        Some(origin),
    )?;
    gx_handler::start_deactivation(ctx, ebis, Vec::new(), BearerTrigger::Command)
}

/// Handle Change Notification Request
pub fn handle_change_notification_request(
    ctx: &mut SessionCtx<'_>,
    event: &SessEvent,
) -> Result<Outcome, Rejection> {
    let GtpBody::ChangeNotificationRequest(req) = gtp_body(event)? else {
        return Err(unexpected(event));
    };
    let req = req.clone();
    let origin = gtp_origin(ctx, event)?;
    log::info!("Change Notification Request");
    if req.uli.is_some() {
        ctx.pdn_ctx_mut()?.uli = req.uli.clone();
    }
    let imsi = req.imsi.clone();

    if ctx.role().relays_to_pgw() {
        ctx.begin(RequestDescriptor::ChangeNotification { imsi }, Some(origin))?;
        let forward = ctx.pgw_request(GtpBody::ChangeNotificationRequest(req))?;
        return Ok(Outcome::Advance {
            state: SessState::ForwardRequested,
            requests: vec![forward],
        });
    }
    if ctx.gx_enabled() {
        ctx.begin(RequestDescriptor::ChangeNotification { imsi }, Some(origin))?;
        let request = ctx.gx_update(Vec::new(), None, req.uli)?;
        return Ok(Outcome::Advance {
            state: SessState::PolicyRequested,
            requests: vec![request],
        });
    }
    ctx.respond(
        &origin,
        GtpBody::ChangeNotificationResponse(ChangeNotificationResponse {
            cause: gtp_cause::REQUEST_ACCEPTED,
            imsi,
        }),
    );
    Ok(Outcome::stay())
}

// ============================================================================
// Bearer Answers
// ============================================================================

/// Handle Create Bearer Response
pub fn handle_create_bearer_response(ctx: &mut SessionCtx<'_>, event: &SessEvent) -> Result<Outcome, Rejection> {
    let GtpBody::CreateBearerResponse(rsp) = gtp_body(event)? else {
        return Err(unexpected(event));
    };
    let rsp = rsp.clone();
    let Some(RequestDescriptor::BearerActivation { ebis, trigger, .. }) = ctx.descriptor().cloned() else {
        return Err(unexpected(event));
    };
    log::info!("Create Bearer Response cause[{}]", rsp.cause);
    let role = ctx.role();
    let pdn = ctx.pdn_handle()?;
    ctx.complete_leg(Leg::Access);

    let overall = gtp_cause::is_accepted(rsp.cause);
    let mut accepted = Vec::new();
    let mut refused = Vec::new();
    for ebi in &ebis {
        let bc = rsp.bearer_contexts.iter().find(|bc| bc.ebi == ebi.value());
        let ok = overall && bc.is_some_and(|bc| bc.cause.map_or(true, gtp_cause::is_accepted));
        if ok {
            log::info!("    bearer[EBI={ebi}] accepted");
            apply_access_remotes(ctx, pdn, role, bc.map(std::slice::from_ref).unwrap_or_default());
            accepted.push(*ebi);
        } else {
            log::warn!("    bearer[EBI={ebi}] refused");
            refused.push(*ebi);
        }
    }

    let (names, freed) = ctx.tables.detach_bearers(role, pdn, &refused);
    let no_bearer_left = accepted.is_empty();
    if no_bearer_left {
        let cause = if overall { gtp_cause::REQUEST_REJECTED } else { rsp.cause };
        let contexts = refused
            .iter()
            .map(|ebi| BearerContext {
                cause: Some(cause),
                ..BearerContext::new(ebi.value())
            })
            .collect();
        let reports = gx_build::build_rule_reports(&names, false, Some(gx_result::PCC_RULE_EVENT));
        answer_trigger(ctx, trigger, cause, contexts, reports);
    }

    let bearers = ctx.bearers_of(&accepted);
    let mut modification = sx_build::build_rule_removal(&freed);
    modification.update_fars = sx_build::sync_far_updates(ctx.graph_mut(), role, &bearers);
    if let Some(record) = ctx.record_mut() {
        record.descriptor = RequestDescriptor::BearerActivation {
            ebis: accepted,
            phase: ActivationPhase::Commit,
            trigger,
            rejected: names,
        };
    }
    if modification.is_empty() {
        if no_bearer_left {
            return Ok(Outcome::Complete(Disposition::Resume));
        }
        return Ok(finish_activation(ctx));
    }
    let request = ctx.modification(modification)?;
    Ok(Outcome::Advance {
        state: SessState::ModifyRequested,
        requests: vec![request],
    })
}

/// Answer the trigger of an activation whose endpoints are committed
pub fn finish_activation(ctx: &mut SessionCtx<'_>) -> Outcome {
    let Some(RequestDescriptor::BearerActivation {
        ebis,
        trigger,
        rejected,
        ..
    }) = ctx.descriptor().cloned()
    else {
        return Outcome::Complete(Disposition::Resume);
    };
    let contexts = match ctx.pdn {
        Some(pdn) => gtp_build::build_bearer_contexts(ctx.graph(), pdn, &ebis, Some(gtp_cause::REQUEST_ACCEPTED)),
        None => Vec::new(),
    };
    let cause = if rejected.is_empty() {
        gtp_cause::REQUEST_ACCEPTED
    } else {
        gtp_cause::REQUEST_ACCEPTED_PARTIALLY
    };
    let reports = gx_build::build_rule_reports(&rejected, false, Some(gx_result::PCC_RULE_EVENT));
    answer_trigger(ctx, trigger, cause, contexts, reports);
    log::info!("[Added] dedicated bearers[{}]", ebis.len());
    Outcome::Complete(Disposition::Resume)
}

/// Handle Update Bearer Response
pub fn handle_update_bearer_response(ctx: &mut SessionCtx<'_>, event: &SessEvent) -> Result<Outcome, Rejection> {
    let GtpBody::UpdateBearerResponse(rsp) = gtp_body(event)? else {
        return Err(unexpected(event));
    };
    let cause = rsp.cause;
    let Some(RequestDescriptor::BearerModification { previous, trigger, .. }) = ctx.descriptor().cloned() else {
        return Err(unexpected(event));
    };
    log::info!("Update Bearer Response cause[{cause}]");
    ctx.complete_leg(Leg::Access);
    if !gtp_cause::is_accepted(cause) {
        return fail_procedure(ctx, cause);
    }
    let pdn = ctx.pdn_handle()?;
    let ebis: Vec<Ebi> = previous.iter().map(|(ebi, _)| *ebi).collect();
    let bearers = ctx.bearers_of(&ebis);
    let update_qers = sx_build::sync_qer_updates(ctx.graph_mut(), pdn, &bearers);
    if let Some(record) = ctx.record_mut() {
        record.descriptor = RequestDescriptor::BearerModification {
            previous,
            phase: ActivationPhase::Commit,
            trigger,
        };
    }
    if update_qers.is_empty() {
        return Ok(finish_modification(ctx));
    }
    let request = ctx.modification(SessionModificationRequest {
        update_qers,
        ..Default::default()
    })?;
    Ok(Outcome::Advance {
        state: SessState::ModifyRequested,
        requests: vec![request],
    })
}

/// Answer the trigger of a finished bearer modification
pub fn finish_modification(ctx: &mut SessionCtx<'_>) -> Outcome {
    let Some(RequestDescriptor::BearerModification { previous, trigger, .. }) = ctx.descriptor().cloned() else {
        return Outcome::Complete(Disposition::Resume);
    };
    let ebis: Vec<Ebi> = previous.iter().map(|(ebi, _)| *ebi).collect();
    let contexts = match ctx.pdn {
        Some(pdn) => gtp_build::build_bearer_contexts(ctx.graph(), pdn, &ebis, Some(gtp_cause::REQUEST_ACCEPTED)),
        None => Vec::new(),
    };
    answer_trigger(ctx, trigger, gtp_cause::REQUEST_ACCEPTED, contexts, Vec::new());
    log::info!("[Modified] bearers[{}]", ebis.len());
    Outcome::Complete(Disposition::Resume)
}

/// Handle Delete Bearer Response
///
/// A deletion is never refused: whatever the cause, the bearers go.
pub fn handle_delete_bearer_response(ctx: &mut SessionCtx<'_>, event: &SessEvent) -> Result<Outcome, Rejection> {
    let GtpBody::DeleteBearerResponse(rsp) = gtp_body(event)? else {
        return Err(unexpected(event));
    };
    log::info!("Delete Bearer Response cause[{}]", rsp.cause);
    ctx.complete_leg(Leg::Access);
    let role = ctx.role();
    match ctx.descriptor().cloned() {
        Some(RequestDescriptor::NetworkDetach) => {
            let excluded: &[Leg] = if role.relays_to_pgw() {
                &[Leg::Access, Leg::S5s8]
            } else {
                &[Leg::Access]
            };
            teardown(ctx, excluded, SessState::DeleteRequested)
        }
        Some(RequestDescriptor::BearerDeactivation {
            ebis,
            rule_names,
            trigger,
        }) => {
            let pdn = ctx.pdn_handle()?;
            let (detached_names, freed) = ctx.tables.detach_bearers(role, pdn, &ebis);
            let mut names = rule_names;
            for name in detached_names {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
            for ebi in &ebis {
                log::info!("    bearer[EBI={ebi}] removed");
            }

            let mut requests = Vec::new();
            if !freed.is_empty() && ctx.pdn_ctx()?.up_seid.is_some() {
                requests.push(ctx.modification(sx_build::build_rule_removal(&freed))?);
            }
            let report_to_pcrf = matches!(
                trigger,
                BearerTrigger::Command | BearerTrigger::BearerResource { .. }
            );
            if report_to_pcrf && ctx.pdn_ctx()?.gx.is_some() && !names.is_empty() {
                let reports = gx_build::build_rule_reports(&names, false, None);
                requests.push(ctx.gx_update(reports, None, None)?);
            }
            if let Some(record) = ctx.record_mut() {
                record.descriptor = RequestDescriptor::BearerDeactivation {
                    ebis,
                    rule_names: names,
                    trigger,
                };
            }
            if requests.is_empty() {
                return Ok(finish_deactivation(ctx));
            }
            Ok(Outcome::Advance {
                state: SessState::ModifyRequested,
                requests,
            })
        }
        _ => Err(unexpected(event)),
    }
}

/// Answer the trigger of a finished deactivation
pub fn finish_deactivation(ctx: &mut SessionCtx<'_>) -> Outcome {
    let Some(RequestDescriptor::BearerDeactivation { ebis, trigger, .. }) = ctx.descriptor().cloned() else {
        return Outcome::Complete(Disposition::Resume);
    };
    let contexts = ebis
        .iter()
        .map(|ebi| BearerContext {
            cause: Some(gtp_cause::REQUEST_ACCEPTED),
            ..BearerContext::new(ebi.value())
        })
        .collect();
    answer_trigger(ctx, trigger, gtp_cause::REQUEST_ACCEPTED, contexts, Vec::new());
    log::info!("[Removed] dedicated bearers[{}]", ebis.len());
    Outcome::Complete(Disposition::Resume)
}

// ============================================================================
// Downlink Data
// ============================================================================

/// Handle Downlink Data Notification Acknowledge
pub fn handle_downlink_data_notification_ack(
    ctx: &mut SessionCtx<'_>,
    event: &SessEvent,
) -> Result<Outcome, Rejection> {
    let GtpBody::DownlinkDataNotificationAck { cause } = gtp_body(event)? else {
        return Err(unexpected(event));
    };
    log::info!("Downlink Data Notification Ack cause[{cause}]");
    let pdns: Vec<PdnHandle> = ctx.ue_ctx()?.pdns().to_vec();
    for pdn in pdns {
        if let Some(p) = ctx.graph_mut().pdn_mut(pdn) {
            p.ddn_pending = false;
        }
    }
    Ok(Outcome::stay())
}

/// Notify the MME that downlink data waits for an idle UE
pub fn notify_downlink_data(ctx: &mut SessionCtx<'_>, ebi: Ebi) -> Result<(), Rejection> {
    let Some(mme) = access_peer(ctx) else {
        return Ok(());
    };
    {
        let p = ctx.pdn_ctx_mut()?;
        if p.ddn_pending {
            return Ok(());
        }
        p.ddn_pending = true;
    }
    log::info!("Downlink Data Notification EBI[{ebi}]");
    let body = gtp_build::build_downlink_data_notification(ebi);
    let out = ctx.gtp_request(ctx.role().access_interface(), mme, body);
    ctx.emit(out);
    Ok(())
}
