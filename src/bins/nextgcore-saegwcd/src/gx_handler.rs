//! Gx Handler
//!
//! Credit-Control answers and Re-Auth requests from the PCRF, and the
//! dedicated bearer procedures policy decisions start. The bearer starters
//! are shared with the SGW-C relay of PGW bearer requests.

use bytes::Bytes;

use crate::context::PdnHandle;
use crate::correlation::{ActivationPhase, BearerTrigger, Leg, LegRequest, Origin, RequestDescriptor};
use crate::error::{Rejection, SaegwcError, SaegwcResult};
use crate::event::{Procedure, SessEvent, SessState};
use crate::gtp_build;
use crate::gx_build;
use crate::handler::{allocate_bearer_endpoints, answer_trigger, unexpected, SessionCtx};
use crate::message::{
    BearerContext, BearerResourceFailureIndication, ChangeNotificationResponse, ChargingRule,
    CreditControlAnswer, Envelope, GtpBody, GxBody, ReAuthRequest,
};
use crate::s11_handler;
use crate::sm::{Disposition, Outcome};
use crate::sx_build;
use crate::types::{gtp_cause, gx_result, Ambr, BearerQos, Ebi, FTeid};

/// Dedicated bearer to create
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerSpec {
    /// Requested bearer id, first free one after the default bearer when absent
    pub ebi: Option<u8>,
    pub qos: BearerQos,
    pub tft: Option<Bytes>,
    /// PCC rules the bearer carries
    pub rules: Vec<String>,
    pub flows: Vec<String>,
    pub precedence: u32,
    /// PGW user plane endpoint (SGW-C)
    pub core_remote: Option<FTeid>,
}

impl BearerSpec {
    /// One bearer per distinct QoS; rules sharing a QoS share the bearer
    pub fn from_rules(rules: &[ChargingRule]) -> Vec<BearerSpec> {
        let mut specs: Vec<BearerSpec> = Vec::new();
        for rule in rules {
            match specs.iter_mut().find(|s| s.qos == rule.qos) {
                Some(spec) => {
                    spec.rules.push(rule.name.clone());
                    spec.flows.extend(rule.flows.iter().cloned());
                    spec.precedence = spec.precedence.min(rule.precedence);
                }
                None => specs.push(BearerSpec {
                    ebi: None,
                    qos: rule.qos,
                    tft: None,
                    rules: vec![rule.name.clone()],
                    flows: rule.flows.clone(),
                    precedence: rule.precedence,
                    core_remote: None,
                }),
            }
        }
        specs
    }
}

fn gx_message(event: &SessEvent) -> Result<(&str, u32, &GxBody), Rejection> {
    match event.envelope() {
        Some(Envelope::Gx { msg }) => Ok((msg.session_id.as_str(), msg.hop_by_hop, &msg.body)),
        _ => Err(unexpected(event)),
    }
}

fn cca(event: &SessEvent) -> Result<&CreditControlAnswer, Rejection> {
    match gx_message(event)? {
        (_, _, GxBody::CreditControlAnswer(cca)) => Ok(cca),
        _ => Err(unexpected(event)),
    }
}

// ============================================================================
// Session Setup
// ============================================================================

/// CCR-Initial for a new PDN connection
pub fn ccr_initial(ctx: &mut SessionCtx<'_>) -> Result<LegRequest, Rejection> {
    let imsi = ctx.ue_ctx()?.imsi.clone();
    let (apn, ue_ip, uli, default_bearer) = {
        let p = ctx.pdn_ctx()?;
        (p.apn.clone(), p.ue_ip, p.uli.clone(), p.default_bearer())
    };
    let default_qos = default_bearer.and_then(|b| ctx.graph().bearer(b)).map(|b| b.qos);
    let (session_id, number) = ctx.gx_session()?;
    let hbh = ctx.shared.next_hop_by_hop();
    log::info!("CCR-Initial IMSI[{imsi}] Session-Id[{session_id}]");
    let out = gx_build::build_ccr_initial(&session_id, hbh, number, &imsi, &apn, ue_ip, default_qos, uli);
    Ok(LegRequest::new(Leg::Gx, out))
}

/// Handle CCA-Initial during PDN setup
pub fn handle_cca_initial(ctx: &mut SessionCtx<'_>, event: &SessEvent) -> Result<Outcome, Rejection> {
    let cca = cca(event)?.clone();
    log::info!("CCA-Initial Result-Code[{}]", cca.result_code);
    if !gx_result::is_success(cca.result_code) {
        ctx.fail_leg(Leg::Gx, gx_result::to_gtp(cca.result_code));
        return s11_handler::continue_attach(ctx);
    }

    let pdn = ctx.pdn_handle()?;
    if let Some(ambr) = cca.ambr {
        ctx.pdn_ctx_mut()?.ambr = Some(ambr);
    }
    let default_bearer = ctx.pdn_ctx()?.default_bearer();
    if let Some(bearer) = default_bearer {
        let default_qci = {
            let b = ctx
                .graph_mut()
                .bearer_mut(bearer)
                .ok_or_else(|| SaegwcError::ContextNotFound("default bearer".to_string()))?;
            if let Some(qos) = cca.default_qos {
                b.qos = qos;
            }
            b.qos.qci
        };
        // predefined rules ride on the default bearer when their QCI matches
        for rule in &cca.installs {
            if rule.qos.qci == default_qci {
                if let Some(b) = ctx.graph_mut().bearer_mut(bearer) {
                    b.charging_rules.push(rule.name.clone());
                }
            } else {
                log::warn!("    rule[{}] QCI[{}] not bound at attach", rule.name, rule.qos.qci);
            }
        }
    }
    ctx.complete_leg(Leg::Gx);

    // policy arrived after the user plane session: push the new QoS
    let up_known = ctx.pdn_ctx()?.up_seid.is_some();
    if up_known {
        let bearers: Vec<_> = default_bearer.into_iter().collect();
        let update_qers = sx_build::sync_qer_updates(ctx.graph_mut(), pdn, &bearers);
        if !update_qers.is_empty() {
            let request = ctx.modification(crate::message::SessionModificationRequest {
                update_qers,
                ..Default::default()
            })?;
            return Ok(Outcome::Advance {
                state: SessState::ModifyRequested,
                requests: vec![request],
            });
        }
    }
    s11_handler::continue_attach(ctx)
}

// ============================================================================
// Policy Decisions
// ============================================================================

/// Start the bearer procedure a set of PCC rule changes calls for; `None`
/// when nothing changes
fn apply_policy(
    ctx: &mut SessionCtx<'_>,
    installs: &[ChargingRule],
    removes: &[String],
    trigger: BearerTrigger,
) -> Result<Option<Outcome>, Rejection> {
    let pdn = ctx.pdn_handle()?;
    let default_ebi = ctx.pdn_ctx()?.default_ebi;

    if !removes.is_empty() {
        if !installs.is_empty() {
            log::warn!("    rule installs[{}] ignored next to removals", installs.len());
        }
        let mut ebis = Vec::new();
        for bearer in ctx.all_bearers() {
            let Some(b) = ctx.graph_mut().bearer_mut(bearer) else {
                continue;
            };
            let before = b.charging_rules.len();
            b.charging_rules.retain(|name| !removes.contains(name));
            if b.charging_rules.len() != before && b.charging_rules.is_empty() && b.ebi != default_ebi {
                ebis.push(b.ebi);
            }
        }
        if ebis.is_empty() {
            log::info!("    no dedicated bearer left without rules");
            return Ok(None);
        }
        return start_deactivation(ctx, ebis, removes.to_vec(), trigger).map(Some);
    }

    let (known, new): (Vec<ChargingRule>, Vec<ChargingRule>) = installs
        .iter()
        .cloned()
        .partition(|rule| crate::classifier::installed_rule(ctx.graph(), Some(pdn), &rule.name));
    if !new.is_empty() {
        return start_activation(ctx, BearerSpec::from_rules(&new), trigger).map(Some);
    }

    let mut changes: Vec<(Ebi, BearerQos)> = Vec::new();
    for rule in &known {
        for bearer in ctx.all_bearers() {
            let Some(b) = ctx.graph().bearer(bearer) else {
                continue;
            };
            if b.charging_rules.contains(&rule.name) && b.qos != rule.qos && !changes.iter().any(|(e, _)| *e == b.ebi) {
                changes.push((b.ebi, rule.qos));
            }
        }
    }
    if changes.is_empty() {
        return Ok(None);
    }
    start_modification(ctx, changes, None, trigger).map(Some)
}

/// Create a bearer with its endpoints and rules; undone on failure
fn add_bearer(ctx: &mut SessionCtx<'_>, pdn: PdnHandle, spec: &BearerSpec) -> SaegwcResult<Ebi> {
    let role = ctx.role();
    let bearer = ctx.graph_mut().create_bearer(pdn, spec.ebi.filter(|ebi| *ebi != 0))?;
    let ebi = {
        let b = ctx
            .graph_mut()
            .bearer_mut(bearer)
            .ok_or_else(|| SaegwcError::ContextNotFound(format!("bearer {bearer:?}")))?;
        b.qos = spec.qos;
        b.tft = spec.tft.clone();
        b.charging_rules = spec.rules.clone();
        b.s5s8u_pgw = spec.core_remote;
        b.ebi
    };
    let result = allocate_bearer_endpoints(ctx, bearer)
        .and_then(|_| sx_build::install_bearer_rules(ctx.graph_mut(), role, bearer, &spec.flows, spec.precedence));
    if let Err(e) = result {
        ctx.tables.detach_bearers(role, pdn, &[ebi]);
        return Err(e);
    }
    log::info!("    bearer[EBI={ebi}] QCI[{}] rules[{}]", spec.qos.qci, spec.rules.len());
    Ok(ebi)
}

/// Dedicated bearer activation: install the rules on the user plane first
pub fn start_activation(
    ctx: &mut SessionCtx<'_>,
    specs: Vec<BearerSpec>,
    trigger: BearerTrigger,
) -> Result<Outcome, Rejection> {
    let role = ctx.role();
    let pdn = ctx.pdn_handle()?;
    ctx.ensure_record(
        Procedure::DedicatedBearerActivation,
        RequestDescriptor::BearerActivation {
            ebis: Vec::new(),
            phase: ActivationPhase::Install,
            trigger,
            rejected: Vec::new(),
        },
    )?;
    log::info!("Dedicated Bearer Activation bearers[{}]", specs.len());

    let mut ebis = Vec::new();
    for spec in &specs {
        match add_bearer(ctx, pdn, spec) {
            Ok(ebi) => ebis.push(ebi),
            Err(e) => {
                log::error!("Dedicated bearer not created: {e}");
                ctx.tables.detach_bearers(role, pdn, &ebis);
                let cause = e.gtp_cause();
                let names: Vec<String> = specs.iter().flat_map(|s| s.rules.iter().cloned()).collect();
                let contexts = specs
                    .iter()
                    .filter_map(|s| s.ebi)
                    .map(|ebi| BearerContext {
                        cause: Some(cause),
                        ..BearerContext::new(ebi)
                    })
                    .collect();
                let reports = gx_build::build_rule_reports(&names, false, Some(gx_result::RESOURCES_EXCEEDED));
                answer_trigger(ctx, trigger, cause, contexts, reports);
                return Ok(Outcome::Complete(Disposition::Resume));
            }
        }
    }

    let bearers = ctx.bearers_of(&ebis);
    let modification = sx_build::build_rule_installation(ctx.graph(), &bearers);
    if let Some(record) = ctx.record_mut() {
        record.descriptor = RequestDescriptor::BearerActivation {
            ebis,
            phase: ActivationPhase::Install,
            trigger,
            rejected: Vec::new(),
        };
    }
    let request = ctx.modification(modification)?;
    Ok(Outcome::Switch {
        procedure: Procedure::DedicatedBearerActivation,
        state: SessState::ModifyRequested,
        requests: vec![request],
    })
}

/// Ask the access side for the new dedicated bearers once the rules are in
pub fn request_bearer_creation(ctx: &mut SessionCtx<'_>) -> Result<Outcome, Rejection> {
    let Some(RequestDescriptor::BearerActivation { ebis, trigger, .. }) = ctx.descriptor().cloned() else {
        return Err(SaegwcError::ContextNotFound("record".to_string()).into());
    };
    let pdn = ctx.pdn_handle()?;
    let body = gtp_build::build_create_bearer_request(ctx.graph(), pdn, &ebis, trigger.pti())
        .ok_or_else(|| SaegwcError::ContextNotFound("PDN".to_string()))?;
    let request = ctx.access_request(body)?;
    Ok(Outcome::Advance {
        state: SessState::BearerRequested,
        requests: vec![request],
    })
}

/// Bearer QoS change: the access side is asked first, the QERs follow
pub fn start_modification(
    ctx: &mut SessionCtx<'_>,
    changes: Vec<(Ebi, BearerQos)>,
    ambr: Option<Ambr>,
    trigger: BearerTrigger,
) -> Result<Outcome, Rejection> {
    let pdn = ctx.pdn_handle()?;
    log::info!("Bearer Modification bearers[{}]", changes.len());
    let mut previous = Vec::new();
    for (ebi, qos) in &changes {
        let Some(bearer) = ctx.graph().bearer_by_ebi(pdn, *ebi) else {
            continue;
        };
        if let Some(b) = ctx.graph_mut().bearer_mut(bearer) {
            previous.push((*ebi, b.qos));
            b.qos = *qos;
            log::info!("    bearer[EBI={ebi}] QCI[{}]", qos.qci);
        }
    }
    if previous.is_empty() {
        return Err(SaegwcError::ContextNotFound("bearer".to_string()).into());
    }
    if ambr.is_some() {
        ctx.pdn_ctx_mut()?.ambr = ambr;
    }
    let ebis: Vec<Ebi> = previous.iter().map(|(ebi, _)| *ebi).collect();
    ctx.ensure_record(
        Procedure::BearerModification,
        RequestDescriptor::BearerModification {
            previous,
            phase: ActivationPhase::Install,
            trigger,
        },
    )?;
    let body = gtp_build::build_update_bearer_request(ctx.graph(), pdn, &ebis, trigger.pti(), ambr);
    let request = ctx.access_request(body)?;
    Ok(Outcome::Switch {
        procedure: Procedure::BearerModification,
        state: SessState::BearerRequested,
        requests: vec![request],
    })
}

/// Dedicated bearer deactivation: the access side is told first
pub fn start_deactivation(
    ctx: &mut SessionCtx<'_>,
    ebis: Vec<Ebi>,
    rule_names: Vec<String>,
    trigger: BearerTrigger,
) -> Result<Outcome, Rejection> {
    log::info!("Dedicated Bearer Deactivation bearers[{}]", ebis.len());
    let body = gtp_build::build_delete_bearer_request(None, &ebis, trigger.pti(), None);
    ctx.ensure_record(
        Procedure::DedicatedBearerDeactivation,
        RequestDescriptor::BearerDeactivation {
            ebis,
            rule_names,
            trigger,
        },
    )?;
    let request = ctx.access_request(body)?;
    Ok(Outcome::Switch {
        procedure: Procedure::DedicatedBearerDeactivation,
        state: SessState::BearerRequested,
        requests: vec![request],
    })
}

// ============================================================================
// Re-Auth
// ============================================================================

/// Handle Re-Auth-Request
pub fn handle_re_auth_request(ctx: &mut SessionCtx<'_>, event: &SessEvent) -> Result<Outcome, Rejection> {
    let (session_id, hop_by_hop, body) = gx_message(event)?;
    let GxBody::ReAuthRequest(rar) = body else {
        return Err(unexpected(event));
    };
    let rar: ReAuthRequest = rar.clone();
    let origin = Origin::Gx {
        session_id: session_id.to_string(),
        hop_by_hop,
    };
    log::info!(
        "Re-Auth-Request Session-Id[{}] install[{}] remove[{}]{}",
        session_id,
        rar.installs.len(),
        rar.removes.len(),
        if rar.session_release { " release" } else { "" }
    );

    if ctx.procedure == Procedure::Detach {
        ctx.begin(RequestDescriptor::NetworkDetach, Some(origin))?;
        let default_ebi = ctx.pdn_ctx()?.default_ebi;
        let body = gtp_build::build_delete_bearer_request(Some(default_ebi), &[], None, None);
        return match ctx.access_request(body) {
            Ok(request) => Ok(Outcome::Advance {
                state: SessState::BearerRequested,
                requests: vec![request],
            }),
            Err(_) => crate::handler::teardown(ctx, &[Leg::Access], SessState::DeleteRequested),
        };
    }

    ctx.begin(
        RequestDescriptor::BearerModification {
            previous: Vec::new(),
            phase: ActivationPhase::Install,
            trigger: BearerTrigger::Pcrf,
        },
        Some(origin),
    )?;
    match apply_policy(ctx, &rar.installs, &rar.removes, BearerTrigger::Pcrf)? {
        Some(outcome) => Ok(outcome),
        None => {
            if let Some(origin) = ctx.take_origin() {
                ctx.respond_raa(&origin, gx_result::SUCCESS, Vec::new());
            }
            Ok(Outcome::Complete(Disposition::Resume))
        }
    }
}

// ============================================================================
// Credit-Control Update
// ============================================================================

/// Handle CCA-Update
pub fn handle_cca_update(ctx: &mut SessionCtx<'_>, event: &SessEvent) -> Result<Outcome, Rejection> {
    let cca = cca(event)?.clone();
    log::info!("CCA-Update Result-Code[{}]", cca.result_code);
    let success = gx_result::is_success(cca.result_code);
    let cause = if success {
        gtp_cause::REQUEST_ACCEPTED
    } else {
        gx_result::to_gtp(cca.result_code)
    };
    if success {
        ctx.complete_leg(Leg::Gx);
    } else {
        ctx.fail_leg(Leg::Gx, cause);
    }

    match ctx.descriptor().cloned() {
        Some(RequestDescriptor::BearerResource { command }) => {
            if success {
                if let Some(ambr) = cca.ambr {
                    ctx.pdn_ctx_mut()?.ambr = Some(ambr);
                }
                let trigger = BearerTrigger::BearerResource { pti: command.pti };
                if let Some(outcome) = apply_policy(ctx, &cca.installs, &cca.removes, trigger)? {
                    return Ok(outcome);
                }
            }
            let cause = if success { gtp_cause::SERVICE_DENIED } else { cause };
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
            Ok(Outcome::Complete(Disposition::Resume))
        }
        Some(RequestDescriptor::ChangeNotification { imsi }) => {
            if let Some(origin) = ctx.take_origin() {
                ctx.respond(
                    &origin,
                    GtpBody::ChangeNotificationResponse(ChangeNotificationResponse { cause, imsi }),
                );
            }
            Ok(Outcome::Complete(Disposition::Resume))
        }
        // the bearers are already gone, only the report had to land
        Some(RequestDescriptor::BearerDeactivation { .. }) => {
            if !success {
                log::warn!("    rule report refused, bearers stay removed");
            }
            if ctx.legs_finished() {
                Ok(s11_handler::finish_deactivation(ctx))
            } else {
                Ok(Outcome::stay())
            }
        }
        _ => Err(unexpected(event)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(name: &str, qci: u8, precedence: u32) -> ChargingRule {
        ChargingRule {
            name: name.to_string(),
            qos: BearerQos::non_gbr(qci, 5),
            precedence,
            flows: vec![format!("permit out ip from any to {name}")],
        }
    }

    #[test]
    fn test_rules_sharing_qos_share_a_bearer() {
        let specs = BearerSpec::from_rules(&[rule("video", 2, 200), rule("voice", 1, 100), rule("video-hd", 2, 150)]);
        assert_eq!(specs.len(), 2);
        let video = &specs[0];
        assert_eq!(video.rules, vec!["video".to_string(), "video-hd".to_string()]);
        assert_eq!(video.flows.len(), 2);
        assert_eq!(video.precedence, 150);
        assert_eq!(specs[1].rules, vec!["voice".to_string()]);
        assert!(specs.iter().all(|s| s.ebi.is_none() && s.core_remote.is_none()));
    }

    #[test]
    fn test_trigger_pti() {
        assert_eq!(BearerTrigger::BearerResource { pti: 7 }.pti(), Some(7));
        assert_eq!(BearerTrigger::Relay { pti: Some(3) }.pti(), Some(3));
        assert_eq!(BearerTrigger::Pcrf.pti(), None);
    }
}
