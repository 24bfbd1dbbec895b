//! Recovery Handler
//!
//! Answers that arrive while a PDN connection is being released, peer
//! failure and outbound request timeouts.

use crate::correlation::{Leg, Origin, RequestDescriptor};
use crate::error::Rejection;
use crate::event::{Procedure, SessEvent, SessState};
use crate::gtp_build;
use crate::handler::{
    fail_procedure, finish_teardown, fold_aggregate, relay_answer, teardown, unexpected, SessionCtx,
};
use crate::message::{
    BearerResourceFailureIndication, ChangeNotificationResponse, CreateSessionResponse,
    DeleteBearerFailureIndication, Envelope, GtpBody, GtpMessageType, GxBody, PfcpBody,
};
use crate::sm::Outcome;
use crate::types::{gtp_cause, gx_result, pfcp_cause, GatewayRole, PeerKind};

/// Leg leading to a peer of that kind
pub fn leg_of_peer(role: GatewayRole, kind: PeerKind) -> Option<Leg> {
    match kind {
        PeerKind::Upf => Some(Leg::Sx),
        PeerKind::Pgw if role.relays_to_pgw() => Some(Leg::S5s8),
        PeerKind::Pgw => None,
        PeerKind::Mme | PeerKind::Sgw => Some(Leg::Access),
    }
}

fn tearing_down(state: SessState) -> bool {
    matches!(state, SessState::DeleteRequested | SessState::ErrorOccurred)
}

fn finish_or_wait(ctx: &mut SessionCtx<'_>, requests: Vec<crate::correlation::LegRequest>) -> Outcome {
    if !requests.is_empty() {
        return Outcome::Stay { requests };
    }
    if ctx.legs_finished() {
        finish_teardown(ctx)
    } else {
        Outcome::stay()
    }
}

// ============================================================================
// Teardown Answers
// ============================================================================

/// Handle an answer received while the PDN connection is released
///
/// A creation that succeeds this late is undone at once.
pub fn handle_teardown_answer(ctx: &mut SessionCtx<'_>, event: &SessEvent) -> Result<Outcome, Rejection> {
    let mut requests = Vec::new();
    match event.envelope() {
        Some(Envelope::Pfcp { msg, .. }) => match &msg.body {
            PfcpBody::SessionEstablishmentResponse(rsp) => match rsp.up_seid {
                Some(up_seid) if rsp.cause == pfcp_cause::REQUEST_ACCEPTED => {
                    log::info!("Late Session Establishment, deleting UP_SEID[0x{up_seid:016x}]");
                    ctx.pdn_ctx_mut()?.up_seid = Some(up_seid);
                    requests.push(ctx.pfcp_request(PfcpBody::SessionDeletionRequest)?);
                }
                _ => ctx.excuse_leg(Leg::Sx),
            },
            PfcpBody::SessionDeletionResponse { cause } => {
                if *cause != pfcp_cause::REQUEST_ACCEPTED {
                    log::warn!("Session Deletion Response cause[{cause}], released locally");
                }
                ctx.pdn_ctx_mut()?.up_seid = None;
                ctx.complete_leg(Leg::Sx);
            }
            _ => return Err(unexpected(event)),
        },
        Some(Envelope::Gx { msg }) => match &msg.body {
            GxBody::CreditControlAnswer(cca) => match cca.request_type {
                crate::message::CcRequestType::Initial if gx_result::is_success(cca.result_code) => {
                    log::info!("Late CCA-Initial, terminating Session-Id[{}]", msg.session_id);
                    requests.push(ctx.gx_termination()?);
                }
                crate::message::CcRequestType::Initial => ctx.excuse_leg(Leg::Gx),
                _ => ctx.complete_leg(Leg::Gx),
            },
            _ => return Err(unexpected(event)),
        },
        Some(Envelope::Gtp { msg, .. }) => match &msg.body {
            GtpBody::CreateSessionResponse(rsp) => match rsp.sender_fteid {
                Some(pgw) if gtp_cause::is_accepted(rsp.cause) && pgw.teid != 0 => {
                    log::info!("Late Create Session Response, deleting at PGW[{}]", pgw.addr);
                    let body = {
                        let p = ctx.pdn_ctx_mut()?;
                        p.peer_s5s8 = Some(pgw);
                        gtp_build::build_delete_session_request(p)
                    };
                    requests.push(ctx.pgw_request(body)?);
                }
                _ => ctx.excuse_leg(Leg::S5s8),
            },
            GtpBody::DeleteSessionResponse(rsp) => {
                log::debug!("Delete Session Response cause[{}]", rsp.cause);
                ctx.complete_leg(Leg::S5s8);
            }
            GtpBody::DeleteBearerResponse(rsp) => {
                log::debug!("Delete Bearer Response cause[{}]", rsp.cause);
                ctx.complete_leg(Leg::Access);
            }
            _ => return Err(unexpected(event)),
        },
        None => return Err(unexpected(event)),
    }
    Ok(finish_or_wait(ctx, requests))
}

// ============================================================================
// Peer Failure
// ============================================================================

/// Answer the request of an abandoned procedure
fn abandon_origin(ctx: &mut SessionCtx<'_>, cause: u8) {
    let descriptor = ctx.descriptor().cloned();
    if matches!(
        descriptor,
        Some(RequestDescriptor::ModifyBearer { .. } | RequestDescriptor::ReleaseAccessBearers { .. })
    ) {
        fold_aggregate(ctx, cause, Vec::new());
    }
    let Some(origin) = ctx.take_origin() else {
        return;
    };
    let message = match &origin {
        Origin::Gx { .. } => {
            ctx.respond_raa(&origin, gx_result::UNABLE_TO_COMPLY, Vec::new());
            return;
        }
        Origin::Gtp { message, .. } => *message,
    };
    let body = match (message, descriptor) {
        (GtpMessageType::CreateSessionRequest, _) => Some(GtpBody::CreateSessionResponse(CreateSessionResponse {
            cause,
            ..Default::default()
        })),
        (GtpMessageType::BearerResourceCommand, Some(RequestDescriptor::BearerResource { command })) => Some(
            GtpBody::BearerResourceFailureIndication(BearerResourceFailureIndication {
                cause,
                linked_ebi: command.linked_ebi,
                pti: command.pti,
            }),
        ),
        (GtpMessageType::DeleteBearerCommand, _) => Some(GtpBody::DeleteBearerFailureIndication(
            DeleteBearerFailureIndication {
                cause,
                bearer_contexts: Vec::new(),
            },
        )),
        (GtpMessageType::ChangeNotificationRequest, Some(RequestDescriptor::ChangeNotification { imsi })) => {
            Some(GtpBody::ChangeNotificationResponse(ChangeNotificationResponse { cause, imsi }))
        }
        (other, _) => relay_answer(other, cause, Vec::new()),
    };
    if let Some(body) = body {
        ctx.respond(&origin, body);
    }
}

/// Handle death, restart or connection-set deletion of a peer
///
/// The running procedure is abandoned and the PDN connection released with
/// the dead peer's leg excused. Releases already running only lose that leg.
pub fn handle_peer_down(ctx: &mut SessionCtx<'_>, event: &SessEvent) -> Result<Outcome, Rejection> {
    let SessEvent::PeerDown { peer, kind, .. } = event else {
        return Err(unexpected(event));
    };
    let dead = leg_of_peer(ctx.role(), *kind);
    log::warn!(
        "Peer {}[{}] down, SEID[0x{:016x}] {}/{}",
        kind.name(),
        peer,
        ctx.seid()?,
        ctx.procedure.name(),
        ctx.state.name()
    );

    if tearing_down(ctx.state) {
        if let Some(leg) = dead {
            ctx.excuse_leg(leg);
        }
        return Ok(finish_or_wait(ctx, Vec::new()));
    }

    let keeps_release = matches!(
        ctx.descriptor(),
        Some(RequestDescriptor::DeleteSession | RequestDescriptor::NetworkDetach)
    );
    if !keeps_release {
        abandon_origin(ctx, gtp_cause::REMOTE_PEER_NOT_RESPONDING);
        ctx.ensure_record(Procedure::PeerRecovery, RequestDescriptor::PeerCleanup { peer: Some(*peer) })?;
    }

    let excluded: Vec<Leg> = dead.into_iter().collect();
    let outcome = teardown(ctx, &excluded, SessState::DeleteRequested)?;
    Ok(match outcome {
        Outcome::Advance { state, requests } if !keeps_release => Outcome::Switch {
            procedure: Procedure::PeerRecovery,
            state,
            requests,
        },
        other => other,
    })
}

// ============================================================================
// Response Timeout
// ============================================================================

/// Handle a leg whose request was never answered
pub fn handle_response_timeout(ctx: &mut SessionCtx<'_>, event: &SessEvent) -> Result<Outcome, Rejection> {
    let SessEvent::ResponseTimeout { leg } = event else {
        return Err(unexpected(event));
    };
    let leg = *leg;
    log::error!(
        "No answer on {} SEID[0x{:016x}] {}/{}",
        leg.name(),
        ctx.seid()?,
        ctx.procedure.name(),
        ctx.state.name()
    );

    if tearing_down(ctx.state) {
        ctx.excuse_leg(leg);
        return Ok(finish_or_wait(ctx, Vec::new()));
    }

    // an unanswered network detach still releases the connection
    if leg == Leg::Access && matches!(ctx.descriptor(), Some(RequestDescriptor::NetworkDetach)) {
        ctx.excuse_leg(Leg::Access);
        let excluded: &[Leg] = if ctx.role().relays_to_pgw() {
            &[Leg::Access, Leg::S5s8]
        } else {
            &[Leg::Access]
        };
        return teardown(ctx, excluded, SessState::DeleteRequested);
    }

    ctx.fail_leg(leg, gtp_cause::REMOTE_PEER_NOT_RESPONDING);
    fail_procedure(ctx, gtp_cause::REMOTE_PEER_NOT_RESPONDING)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SaegwcConfig;
    use crate::context::{derive_seid, NodeShared, PdnHandle, UeHandle};
    use crate::correlation::LegStatus;
    use crate::handler::SessionTables;
    use crate::message::PfcpMessage;
    use crate::sm::Disposition;
    use crate::types::{Ebi, Imsi};
    use crate::xact::Seq24;
    use std::net::IpAddr;

    fn shared() -> NodeShared {
        let mut config = SaegwcConfig::default();
        config.partitions = 1;
        NodeShared::new(config, 1, 100)
    }

    fn session(tables: &mut SessionTables, up_seid: Option<u64>) -> (UeHandle, PdnHandle) {
        let ebi = Ebi::new(5).unwrap();
        let teid = tables.teids.allocate().unwrap();
        let ue = tables.graph.create_ue(Imsi::new("001010000000001").unwrap());
        let pdn = tables.graph.create_pdn(ue, "internet", ebi, derive_seid(teid, ebi)).unwrap();
        tables.graph.create_bearer(pdn, Some(5)).unwrap();
        let p = tables.graph.pdn_mut(pdn).unwrap();
        p.upf = Some("127.0.0.7".parse().unwrap());
        p.up_seid = up_seid;
        p.state = SessState::Connected;
        (ue, pdn)
    }

    fn peer_down(kind: PeerKind) -> SessEvent {
        SessEvent::PeerDown {
            peer: "10.0.0.9".parse::<IpAddr>().unwrap(),
            kind,
            csids: None,
        }
    }

    #[test]
    fn test_leg_of_peer() {
        assert_eq!(leg_of_peer(GatewayRole::Saegwc, PeerKind::Upf), Some(Leg::Sx));
        assert_eq!(leg_of_peer(GatewayRole::Saegwc, PeerKind::Mme), Some(Leg::Access));
        assert_eq!(leg_of_peer(GatewayRole::Pgwc, PeerKind::Sgw), Some(Leg::Access));
        assert_eq!(leg_of_peer(GatewayRole::Sgwc, PeerKind::Pgw), Some(Leg::S5s8));
        assert_eq!(leg_of_peer(GatewayRole::Pgwc, PeerKind::Pgw), None);
    }

    #[test]
    fn test_dead_upf_releases_locally() {
        let shared = shared();
        let mut tables = SessionTables::new(&shared, 0);
        let (ue, pdn) = session(&mut tables, Some(0x99));
        let mut ctx = SessionCtx::new(&shared, &mut tables, Procedure::InitialAttach, SessState::Connected, Some(ue), Some(pdn));
        let outcome = handle_peer_down(&mut ctx, &peer_down(PeerKind::Upf)).unwrap();
        assert_eq!(outcome, Outcome::Complete(Disposition::Released));
        assert_eq!(ctx.leg_status(Leg::Sx), Some(LegStatus::Excused));
    }

    #[test]
    fn test_dead_upf_tells_mme() {
        let shared = shared();
        let mut tables = SessionTables::new(&shared, 0);
        let (ue, pdn) = session(&mut tables, Some(0x99));
        let mme: IpAddr = "10.0.0.1".parse().unwrap();
        tables.graph.ue_mut(ue).unwrap().mme_s11 = Some(crate::types::FTeid::new(0x100, mme));
        let mut ctx = SessionCtx::new(&shared, &mut tables, Procedure::InitialAttach, SessState::Connected, Some(ue), Some(pdn));
        let outcome = handle_peer_down(&mut ctx, &peer_down(PeerKind::Upf)).unwrap();
        let Outcome::Switch { procedure, state, requests } = outcome else {
            panic!("unexpected {outcome:?}");
        };
        assert_eq!(procedure, Procedure::PeerRecovery);
        assert_eq!(state, SessState::DeleteRequested);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].leg, Leg::Access);
        let Envelope::Gtp { peer, msg, .. } = &requests[0].request else {
            panic!("not GTP");
        };
        assert_eq!(*peer, mme);
        assert_eq!(msg.teid, 0x100);
        let GtpBody::DeleteBearerRequest(req) = &msg.body else {
            panic!("unexpected {:?}", msg.body);
        };
        assert_eq!(req.linked_ebi, Some(5));
        assert_eq!(ctx.leg_status(Leg::Sx), Some(LegStatus::Excused));

        // the MME answer ends the release
        let request = requests[0].request.clone();
        ctx.record_mut().unwrap().add_pending(Leg::Access, request).unwrap();
        ctx.state = SessState::DeleteRequested;
        ctx.procedure = Procedure::PeerRecovery;
        let answer = SessEvent::Message(Envelope::Gtp {
            peer: mme,
            iface: crate::types::GtpInterface::S11,
            msg: crate::message::GtpMessage::new(
                0x1,
                msg.seq,
                GtpBody::DeleteBearerResponse(crate::message::DeleteBearerResponse {
                    cause: gtp_cause::REQUEST_ACCEPTED,
                    linked_ebi: Some(5),
                    bearer_contexts: Vec::new(),
                }),
            ),
        });
        ctx.record_mut()
            .unwrap()
            .take_matching(Leg::Access, crate::correlation::AnswerKey::Seq(msg.seq));
        let outcome = handle_teardown_answer(&mut ctx, &answer).unwrap();
        assert_eq!(outcome, Outcome::Complete(Disposition::Released));
    }

    #[test]
    fn test_dead_mme_is_not_told() {
        let shared = shared();
        let mut tables = SessionTables::new(&shared, 0);
        let (ue, pdn) = session(&mut tables, None);
        tables.graph.ue_mut(ue).unwrap().mme_s11 = Some(crate::types::FTeid::new(0x100, "10.0.0.1".parse().unwrap()));
        let mut ctx = SessionCtx::new(&shared, &mut tables, Procedure::InitialAttach, SessState::Connected, Some(ue), Some(pdn));
        let outcome = handle_peer_down(&mut ctx, &peer_down(PeerKind::Mme)).unwrap();
        assert_eq!(outcome, Outcome::Complete(Disposition::Released));
        assert_eq!(ctx.leg_status(Leg::Access), Some(LegStatus::Excused));
    }

    #[test]
    fn test_dead_mme_deletes_user_plane() {
        let shared = shared();
        let mut tables = SessionTables::new(&shared, 0);
        let (ue, pdn) = session(&mut tables, Some(0x99));
        let mut ctx = SessionCtx::new(&shared, &mut tables, Procedure::InitialAttach, SessState::Connected, Some(ue), Some(pdn));
        let outcome = handle_peer_down(&mut ctx, &peer_down(PeerKind::Mme)).unwrap();
        let Outcome::Switch { procedure, state, requests } = outcome else {
            panic!("unexpected {outcome:?}");
        };
        assert_eq!(procedure, Procedure::PeerRecovery);
        assert_eq!(state, SessState::DeleteRequested);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].leg, Leg::Sx);
        assert!(matches!(ctx.descriptor(), Some(RequestDescriptor::PeerCleanup { peer: Some(_) })));

        // the deletion answer ends the release
        let request = requests[0].request.clone();
        let seq = request.seq().unwrap();
        ctx.record_mut().unwrap().add_pending(Leg::Sx, request).unwrap();
        ctx.state = SessState::DeleteRequested;
        ctx.procedure = Procedure::PeerRecovery;
        let answer = SessEvent::Message(Envelope::Pfcp {
            peer: "127.0.0.7".parse().unwrap(),
            msg: PfcpMessage::new(Some(0x99), seq, PfcpBody::SessionDeletionResponse { cause: 1 }),
        });
        ctx.record_mut().unwrap().take_matching(Leg::Sx, crate::correlation::AnswerKey::Seq(seq));
        let outcome = handle_teardown_answer(&mut ctx, &answer).unwrap();
        assert_eq!(outcome, Outcome::Complete(Disposition::Released));
    }

    #[test]
    fn test_late_establishment_is_undone() {
        let shared = shared();
        let mut tables = SessionTables::new(&shared, 0);
        let (ue, pdn) = session(&mut tables, None);
        let mut ctx = SessionCtx::new(&shared, &mut tables, Procedure::InitialAttach, SessState::ErrorOccurred, Some(ue), Some(pdn));
        ctx.begin(RequestDescriptor::PeerCleanup { peer: None }, None).unwrap();
        let answer = SessEvent::Message(Envelope::Pfcp {
            peer: "127.0.0.7".parse().unwrap(),
            msg: PfcpMessage::new(
                Some(0x1),
                Seq24::new(4),
                PfcpBody::SessionEstablishmentResponse(crate::message::SessionEstablishmentResponse {
                    cause: pfcp_cause::REQUEST_ACCEPTED,
                    up_seid: Some(0x55),
                    up_fqcsid: None,
                }),
            ),
        });
        let outcome = handle_teardown_answer(&mut ctx, &answer).unwrap();
        let Outcome::Stay { requests } = outcome else {
            panic!("unexpected {outcome:?}");
        };
        assert!(matches!(
            &requests[0].request,
            Envelope::Pfcp { msg, .. } if msg.seid == Some(0x55) && msg.body == PfcpBody::SessionDeletionRequest
        ));
    }

    #[test]
    fn test_timeout_fails_modify_bearer() {
        let shared = shared();
        let mut tables = SessionTables::new(&shared, 0);
        let (ue, pdn) = session(&mut tables, Some(0x99));
        let mut ctx = SessionCtx::new(&shared, &mut tables, Procedure::ModifyBearer, SessState::Connected, Some(ue), Some(pdn));
        ctx.begin(
            RequestDescriptor::ModifyBearer {
                ebis: vec![Ebi::new(5).unwrap()],
                previous: Vec::new(),
                previous_sender: None,
            },
            None,
        )
        .unwrap();
        ctx.state = SessState::ModifyRequested;
        let outcome = handle_response_timeout(&mut ctx, &SessEvent::ResponseTimeout { leg: Leg::Sx }).unwrap();
        assert_eq!(outcome, Outcome::Complete(Disposition::Resume));
    }

    #[test]
    fn test_timeout_during_release_finishes_locally() {
        let shared = shared();
        let mut tables = SessionTables::new(&shared, 0);
        let (ue, pdn) = session(&mut tables, Some(0x99));
        let mut ctx = SessionCtx::new(&shared, &mut tables, Procedure::Detach, SessState::DeleteRequested, Some(ue), Some(pdn));
        ctx.begin(RequestDescriptor::DeleteSession, None).unwrap();
        ctx.record_mut().unwrap().legs.require(Leg::Sx);
        let outcome = handle_response_timeout(&mut ctx, &SessEvent::ResponseTimeout { leg: Leg::Sx }).unwrap();
        assert_eq!(outcome, Outcome::Complete(Disposition::Released));
    }
}
