//! Sxa/Sxb Handler
//!
//! PFCP session answers and reports from the user plane.

use crate::context::{RuleKind, RuleSpec};
use crate::correlation::{ActivationPhase, Leg, RequestDescriptor};
use crate::error::{Rejection, SaegwcError};
use crate::event::{Procedure, SessEvent, SessState};
use crate::gx_handler;
use crate::handler::{fail_attach, fail_procedure, fold_aggregate, teardown, unexpected, SessionCtx};
use crate::message::{Envelope, PfcpBody, PfcpMessage, SessionReport};
use crate::s11_handler;
use crate::sm::{Disposition, Outcome};
use crate::sx_build;
use crate::types::{gtp_cause, pfcp_cause, Ebi, PeerKind};

fn pfcp_message(event: &SessEvent) -> Result<(std::net::IpAddr, &PfcpMessage), Rejection> {
    match event.envelope() {
        Some(Envelope::Pfcp { peer, msg }) => Ok((*peer, msg)),
        _ => Err(unexpected(event)),
    }
}

/// PFCP association came up for a session parked before its establishment
pub fn handle_upf_associated(ctx: &mut SessionCtx<'_>, event: &SessEvent) -> Result<Outcome, Rejection> {
    let SessEvent::UpfAssociated { upf } = event else {
        return Err(unexpected(event));
    };
    if ctx.pdn_ctx()?.upf != Some(*upf) {
        return Ok(Outcome::stay());
    }
    log::info!("UPF[{upf}] associated, establishing SEID[0x{:016x}]", ctx.seid()?);
    let pdn = ctx.pdn_handle()?;
    let body = sx_build::build_session_establishment_request(ctx.graph(), ctx.node(), pdn)
        .ok_or_else(|| SaegwcError::ContextNotFound("PDN".to_string()))?;
    let request = ctx.pfcp_request(body)?;
    Ok(Outcome::Advance {
        state: SessState::SessionEstablishRequested,
        requests: vec![request],
    })
}

/// Handle Session Establishment Response
pub fn handle_session_establishment_response(
    ctx: &mut SessionCtx<'_>,
    event: &SessEvent,
) -> Result<Outcome, Rejection> {
    let (_, msg) = pfcp_message(event)?;
    let PfcpBody::SessionEstablishmentResponse(rsp) = &msg.body else {
        return Err(unexpected(event));
    };
    let rsp = rsp.clone();
    log::info!("Session Establishment Response cause[{}]", rsp.cause);
    if rsp.cause != pfcp_cause::REQUEST_ACCEPTED {
        let cause = pfcp_cause::to_gtp(rsp.cause);
        ctx.fail_leg(Leg::Sx, cause);
        return fail_attach(ctx, cause);
    }
    let Some(up_seid) = rsp.up_seid else {
        ctx.fail_leg(Leg::Sx, gtp_cause::MANDATORY_IE_MISSING);
        return fail_attach(ctx, gtp_cause::MANDATORY_IE_MISSING);
    };
    let pdn = ctx.pdn_handle()?;
    ctx.pdn_ctx_mut()?.up_seid = Some(up_seid);
    log::info!("    UP_SEID[0x{up_seid:016x}]");
    ctx.tables.bind_csid(pdn, PeerKind::Upf, rsp.up_fqcsid);
    ctx.complete_leg(Leg::Sx);
    s11_handler::continue_attach(ctx)
}

/// Handle Session Modification Response
pub fn handle_session_modification_response(
    ctx: &mut SessionCtx<'_>,
    event: &SessEvent,
) -> Result<Outcome, Rejection> {
    let (_, msg) = pfcp_message(event)?;
    let PfcpBody::SessionModificationResponse { cause } = msg.body else {
        return Err(unexpected(event));
    };
    log::debug!("Session Modification Response cause[{cause}]");
    if cause != pfcp_cause::REQUEST_ACCEPTED {
        let cause = pfcp_cause::to_gtp(cause);
        ctx.fail_leg(Leg::Sx, cause);
        return fail_procedure(ctx, cause);
    }
    ctx.complete_leg(Leg::Sx);

    let descriptor = ctx
        .descriptor()
        .cloned()
        .ok_or_else(|| SaegwcError::ContextNotFound("record".to_string()))?;
    match descriptor {
        RequestDescriptor::CreateSession { .. } => s11_handler::continue_attach(ctx),
        RequestDescriptor::Relocation { .. } => s11_handler::answer_create_session(ctx),
        RequestDescriptor::ModifyBearer { .. } => s11_handler::finish_modify_bearer(ctx),
        RequestDescriptor::ReleaseAccessBearers { .. } => {
            fold_aggregate(ctx, gtp_cause::REQUEST_ACCEPTED, Vec::new());
            log::info!("[Idle] SEID[0x{:016x}]", ctx.seid()?);
            Ok(Outcome::Complete(Disposition::IdleMode))
        }
        RequestDescriptor::BearerActivation {
            phase: ActivationPhase::Install,
            ..
        } => gx_handler::request_bearer_creation(ctx),
        RequestDescriptor::BearerActivation {
            phase: ActivationPhase::Commit,
            ..
        } => Ok(s11_handler::finish_activation(ctx)),
        RequestDescriptor::BearerModification { .. } => Ok(s11_handler::finish_modification(ctx)),
        RequestDescriptor::BearerDeactivation { .. } => {
            if ctx.legs_finished() {
                Ok(s11_handler::finish_deactivation(ctx))
            } else {
                Ok(Outcome::stay())
            }
        }
        _ => Err(unexpected(event)),
    }
}

/// Bearer whose rules include the reported PDR
fn bearer_of_pdr(ctx: &SessionCtx<'_>, pdr_id: u16) -> Option<Ebi> {
    ctx.all_bearers().into_iter().find_map(|bearer| {
        let b = ctx.graph().bearer(bearer)?;
        b.rules()
            .iter()
            .filter_map(|h| ctx.graph().rule(*h))
            .any(|rule| rule.kind() == RuleKind::Pdr && matches!(&rule.spec, RuleSpec::Pdr(pdr) if pdr.pdr_id == pdr_id))
            .then_some(b.ebi)
    })
}

/// Handle Session Report Request
///
/// Always answered. Downlink data for an idle UE pages it through the MME,
/// an error indication tears the session down.
pub fn handle_session_report_request(ctx: &mut SessionCtx<'_>, event: &SessEvent) -> Result<Outcome, Rejection> {
    let (upf, msg) = pfcp_message(event)?;
    let PfcpBody::SessionReportRequest(report) = &msg.body else {
        return Err(unexpected(event));
    };
    let report = report.clone();
    let up_seid = ctx.pdn_ctx()?.up_seid;
    ctx.emit(sx_build::build_session_report_response(
        upf,
        up_seid,
        msg.seq,
        pfcp_cause::REQUEST_ACCEPTED,
    ));

    match report {
        SessionReport::DownlinkData { pdr_id } => {
            log::info!("Downlink Data Report PDR[{pdr_id}] {}", ctx.state.name());
            if ctx.state == SessState::IdleMode && ctx.role().has_s11() {
                let default_ebi = ctx.pdn_ctx()?.default_ebi;
                let ebi = bearer_of_pdr(ctx, pdr_id).unwrap_or(default_ebi);
                s11_handler::notify_downlink_data(ctx, ebi)?;
            }
            Ok(Outcome::stay())
        }
        SessionReport::Usage => {
            log::debug!("Usage Report SEID[0x{:016x}]", ctx.seid()?);
            Ok(Outcome::stay())
        }
        SessionReport::ErrorIndication { remote } => {
            log::warn!("Error Indication from {remote}");
            if !ctx.state.is_stable() {
                return Ok(Outcome::stay());
            }
            ctx.procedure = Procedure::PeerRecovery;
            ctx.begin(
                RequestDescriptor::PeerCleanup {
                    peer: Some(remote.addr),
                },
                None,
            )?;
            let outcome = teardown(ctx, &[], SessState::DeleteRequested)?;
            Ok(match outcome {
                Outcome::Advance { state, requests } => Outcome::Switch {
                    procedure: Procedure::PeerRecovery,
                    state,
                    requests,
                },
                other => other,
            })
        }
    }
}
