//! S5/S8-C Handler
//!
//! Messages an SGW-C receives from the PGW: the answer to a forwarded
//! Create Session Request, bearer requests relayed on to the MME, and
//! failure indications for relayed commands.

use crate::correlation::{ActivationPhase, BearerTrigger, Leg, RequestDescriptor};
use crate::error::{Rejection, SaegwcError};
use crate::event::{SessEvent, SessState};
use crate::gtp_build;
use crate::gx_handler::{self, BearerSpec};
use crate::handler::{fail_attach, gtp_body, gtp_origin, teardown, unexpected, SessionCtx};
use crate::message::{ChangeNotificationResponse, Envelope, GtpBody, SessionModificationRequest};
use crate::s11_handler;
use crate::sm::{Disposition, Outcome};
use crate::sx_build;
use crate::types::{gtp_cause, BearerQos, Ebi, PeerKind};

fn relay_only(ctx: &SessionCtx<'_>, event: &SessEvent) -> Result<(), Rejection> {
    if ctx.role().relays_to_pgw() {
        Ok(())
    } else {
        Err(unexpected(event))
    }
}

/// Handle Create Session Response from the PGW
pub fn handle_create_session_response(ctx: &mut SessionCtx<'_>, event: &SessEvent) -> Result<Outcome, Rejection> {
    relay_only(ctx, event)?;
    let GtpBody::CreateSessionResponse(rsp) = gtp_body(event)? else {
        return Err(unexpected(event));
    };
    let rsp = rsp.clone();
    log::info!("Create Session Response cause[{}]", rsp.cause);
    if !gtp_cause::is_accepted(rsp.cause) {
        ctx.fail_leg(Leg::S5s8, rsp.cause);
        return fail_attach(ctx, rsp.cause);
    }
    ctx.complete_leg(Leg::S5s8);

    let pdn = ctx.pdn_handle()?;
    {
        let p = ctx.pdn_ctx_mut()?;
        if rsp.sender_fteid.is_some() {
            p.peer_s5s8 = rsp.sender_fteid;
        }
        if rsp.paa.is_some() {
            p.ue_ip = rsp.paa;
        }
        if rsp.ambr.is_some() {
            p.ambr = rsp.ambr;
        }
        log::info!(
            "    PGW_S5C_TEID[0x{:08x}] UE IP[{}]",
            p.peer_s5s8.map(|f| f.teid).unwrap_or(0),
            p.ue_ip.map(|ip| ip.to_string()).unwrap_or_else(|| "-".to_string())
        );
    }
    ctx.tables.bind_csid(pdn, PeerKind::Pgw, rsp.pgw_fqcsid.clone());

    for bc in &rsp.bearer_contexts {
        let Ok(ebi) = Ebi::new(bc.ebi) else {
            continue;
        };
        if let Some(bearer) = ctx.graph().bearer_by_ebi(pdn, ebi) {
            if let Some(b) = ctx.graph_mut().bearer_mut(bearer) {
                if bc.s5s8u_pgw.is_some() {
                    b.s5s8u_pgw = bc.s5s8u_pgw;
                }
                if let Some(qos) = bc.qos {
                    b.qos = qos;
                }
            }
        }
    }

    let bearers = ctx.all_bearers();
    let role = ctx.role();
    let update_fars = sx_build::sync_far_updates(ctx.graph_mut(), role, &bearers);
    if update_fars.is_empty() {
        return s11_handler::continue_attach(ctx);
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

/// Handle Create Bearer Request from the PGW
pub fn handle_create_bearer_request(ctx: &mut SessionCtx<'_>, event: &SessEvent) -> Result<Outcome, Rejection> {
    relay_only(ctx, event)?;
    let GtpBody::CreateBearerRequest(req) = gtp_body(event)? else {
        return Err(unexpected(event));
    };
    let req = req.clone();
    let origin = gtp_origin(ctx, event)?;
    log::info!("Create Bearer Request LBI[{}] bearers[{}]", req.linked_ebi, req.bearer_contexts.len());
    if req.bearer_contexts.is_empty() {
        return Err(SaegwcError::MissingIe("Bearer Context").into());
    }
    let specs: Vec<BearerSpec> = req
        .bearer_contexts
        .iter()
        .map(|bc| BearerSpec {
            ebi: Some(bc.ebi),
            qos: bc.qos.unwrap_or_default(),
            tft: bc.tft.clone(),
            rules: Vec::new(),
            flows: Vec::new(),
            precedence: sx_build::DEFAULT_PRECEDENCE,
            core_remote: bc.s5s8u_pgw,
        })
        .collect();
    let trigger = BearerTrigger::Relay { pti: req.pti };
    ctx.begin(
        RequestDescriptor::BearerActivation {
            ebis: Vec::new(),
            phase: ActivationPhase::Install,
            trigger,
            rejected: Vec::new(),
        },
        Some(origin),
    )?;
    gx_handler::start_activation(ctx, specs, trigger)
}

/// Handle Update Bearer Request from the PGW
pub fn handle_update_bearer_request(ctx: &mut SessionCtx<'_>, event: &SessEvent) -> Result<Outcome, Rejection> {
    relay_only(ctx, event)?;
    let GtpBody::UpdateBearerRequest(req) = gtp_body(event)? else {
        return Err(unexpected(event));
    };
    let req = req.clone();
    log::info!("Update Bearer Request bearers[{}]", req.bearer_contexts.len());
    let pdn = ctx.pdn_handle()?;
    let mut changes: Vec<(Ebi, BearerQos)> = Vec::new();
    for bc in &req.bearer_contexts {
        let ebi = Ebi::new(bc.ebi)?;
        let bearer = ctx
            .graph()
            .bearer_by_ebi(pdn, ebi)
            .ok_or_else(|| SaegwcError::ContextNotFound(format!("bearer EBI[{ebi}]")))?;
        let current = ctx.graph().bearer(bearer).map(|b| b.qos).unwrap_or_default();
        changes.push((ebi, bc.qos.unwrap_or(current)));
    }
    if changes.is_empty() {
        return Err(SaegwcError::MissingIe("Bearer Context").into());
    }
    let origin = gtp_origin(ctx, event)?;
    let trigger = BearerTrigger::Relay { pti: req.pti };
    ctx.begin(
        RequestDescriptor::BearerModification {
            previous: Vec::new(),
            phase: ActivationPhase::Install,
            trigger,
        },
        Some(origin),
    )?;
    gx_handler::start_modification(ctx, changes, req.ambr, trigger)
}

/// Handle Delete Bearer Request from the PGW
///
/// A linked bearer id releases the whole PDN connection.
pub fn handle_delete_bearer_request(ctx: &mut SessionCtx<'_>, event: &SessEvent) -> Result<Outcome, Rejection> {
    relay_only(ctx, event)?;
    let GtpBody::DeleteBearerRequest(req) = gtp_body(event)? else {
        return Err(unexpected(event));
    };
    let req = req.clone();
    let origin = gtp_origin(ctx, event)?;
    let pdn = ctx.pdn_handle()?;
    log::info!("Delete Bearer Request LBI[{:?}] bearers[{}]", req.linked_ebi, req.ebis.len());

    if let Some(lbi) = req.linked_ebi {
        let lbi = Ebi::new(lbi)?;
        ctx.begin(RequestDescriptor::NetworkDetach, Some(origin))?;
        let body = gtp_build::build_delete_bearer_request(Some(lbi), &[], req.pti, req.cause);
        return match ctx.access_request(body) {
            Ok(request) => Ok(Outcome::Advance {
                state: SessState::BearerRequested,
                requests: vec![request],
            }),
            Err(_) => teardown(ctx, &[Leg::Access, Leg::S5s8], SessState::DeleteRequested),
        };
    }

    let ebis: Vec<Ebi> = req
        .ebis
        .iter()
        .filter_map(|raw| Ebi::new(*raw).ok())
        .filter(|ebi| ctx.graph().bearer_by_ebi(pdn, *ebi).is_some())
        .collect();
    if ebis.is_empty() {
        return Err(SaegwcError::ContextNotFound("bearer".to_string()).into());
    }
    let trigger = BearerTrigger::Relay { pti: req.pti };
    ctx.begin(
        RequestDescriptor::BearerDeactivation {
            ebis: ebis.clone(),
            rule_names: Vec::new(),
            trigger,
        },
        Some(origin),
    )?;
    gx_handler::start_deactivation(ctx, ebis, Vec::new(), trigger)
}

/// Handle Bearer Resource / Delete Bearer Failure Indication from the PGW
///
/// Relayed to the MME that sent the command; no record is kept for it.
pub fn handle_failure_indication(ctx: &mut SessionCtx<'_>, event: &SessEvent) -> Result<Outcome, Rejection> {
    relay_only(ctx, event)?;
    let Some(Envelope::Gtp { msg, .. }) = event.envelope() else {
        return Err(unexpected(event));
    };
    log::info!("{} cause[{}]", msg.message_type().name(), msg.body.cause().unwrap_or(0));
    match ctx.pdn_ctx_mut()?.take_relay(msg.seq) {
        Some(origin) => ctx.respond(&origin, msg.body.clone()),
        None => log::warn!("No relayed command for SEQ[{}]", msg.seq),
    }
    Ok(Outcome::stay())
}

/// Handle Change Notification Response from the PGW
pub fn handle_change_notification_response(
    ctx: &mut SessionCtx<'_>,
    event: &SessEvent,
) -> Result<Outcome, Rejection> {
    let GtpBody::ChangeNotificationResponse(rsp) = gtp_body(event)? else {
        return Err(unexpected(event));
    };
    let cause = rsp.cause;
    log::info!("Change Notification Response cause[{cause}]");
    if gtp_cause::is_accepted(cause) {
        ctx.complete_leg(Leg::S5s8);
    } else {
        ctx.fail_leg(Leg::S5s8, cause);
    }
    let Some(RequestDescriptor::ChangeNotification { imsi }) = ctx.descriptor().cloned() else {
        return Err(unexpected(event));
    };
    if let Some(origin) = ctx.take_origin() {
        ctx.respond(
            &origin,
            GtpBody::ChangeNotificationResponse(ChangeNotificationResponse { cause, imsi }),
        );
    }
    Ok(Outcome::Complete(Disposition::Resume))
}
