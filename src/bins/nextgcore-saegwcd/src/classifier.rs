//! Message Classifier
//!
//! Turns an inbound session-level message into the dispatch key: the
//! procedure it belongs to, the event kind, and the UE / PDN connection it
//! addresses in the owning partition.

use crate::context::{PdnHandle, SessionGraph, UeHandle};
use crate::correlation::{AnswerKey, CorrelationStore, Leg};
use crate::error::{Rejection, SaegwcError};
use crate::event::{EventKind, Procedure, SessState};
use crate::identity::{IdentityKey, IdentityTables, Owner, PartitionId};
use crate::message::{BearerContext, Envelope, GtpBody, GtpMessage, GxBody, PfcpBody};
use crate::types::Ebi;

/// Dispatch key of one inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    pub procedure: Procedure,
    pub event: EventKind,
    pub ue: Option<UeHandle>,
    pub pdn: Option<PdnHandle>,
    /// PDN connections a UE-level request fans out to
    pub targets: Vec<PdnHandle>,
    pub state: SessState,
}

impl Classified {
    /// Key for an internally generated event on an existing session
    pub fn for_session(graph: &SessionGraph, pdn: PdnHandle, event: EventKind) -> Option<Self> {
        let pdn_ctx = graph.pdn(pdn)?;
        Some(Self {
            procedure: pdn_ctx.procedure.unwrap_or(Procedure::InitialAttach),
            event,
            ue: Some(pdn_ctx.ue),
            pdn: Some(pdn),
            targets: vec![pdn],
            state: pdn_ctx.state,
        })
    }
}

/// Procedure a message starts when it arrives on a stable session;
/// `None` for messages that only continue a running procedure
pub fn initiated_procedure(graph: &SessionGraph, pdn: Option<PdnHandle>, envelope: &Envelope) -> Option<Procedure> {
    match envelope {
        Envelope::Gtp { msg, .. } => match &msg.body {
            GtpBody::CreateSessionRequest(req) => Some(access_procedure(
                req.indication.handover,
                &req.bearer_contexts,
                Procedure::InitialAttach,
            )),
            GtpBody::ModifyBearerRequest(req) => Some(access_procedure(
                req.indication.handover,
                &req.bearer_contexts,
                Procedure::ModifyBearer,
            )),
            GtpBody::ReleaseAccessBearersRequest => Some(Procedure::ReleaseAccessBearers),
            GtpBody::DeleteSessionRequest(_) => Some(Procedure::Detach),
            GtpBody::CreateBearerRequest(_) => Some(Procedure::DedicatedBearerActivation),
            GtpBody::UpdateBearerRequest(_) => Some(Procedure::BearerModification),
            GtpBody::DeleteBearerRequest(req) if req.linked_ebi.is_some() => Some(Procedure::Detach),
            GtpBody::DeleteBearerRequest(_)
            | GtpBody::DeleteBearerCommand(_)
            | GtpBody::DeleteBearerFailureIndication(_) => Some(Procedure::DedicatedBearerDeactivation),
            GtpBody::BearerResourceCommand(_) | GtpBody::BearerResourceFailureIndication(_) => {
                Some(Procedure::UeRequestedBearerResource)
            }
            GtpBody::ChangeNotificationRequest(_) => Some(Procedure::ChangeNotification),
            _ => None,
        },
        Envelope::Pfcp { msg, .. } => match &msg.body {
            PfcpBody::SessionReportRequest(_) => Some(Procedure::NetworkTriggeredServiceRequest),
            _ => None,
        },
        Envelope::Gx { msg } => match &msg.body {
            GxBody::ReAuthRequest(rar) => {
                if rar.session_release {
                    Some(Procedure::Detach)
                } else if !rar.removes.is_empty() {
                    Some(Procedure::DedicatedBearerDeactivation)
                } else if rar.installs.is_empty()
                    || rar.installs.iter().all(|rule| installed_rule(graph, pdn, &rule.name))
                {
                    Some(Procedure::BearerModification)
                } else {
                    Some(Procedure::DedicatedBearerActivation)
                }
            }
            _ => None,
        },
    }
}

/// Handover indication wins over an eNB endpoint in any bearer context
fn access_procedure(handover: bool, contexts: &[BearerContext], otherwise: Procedure) -> Procedure {
    if handover {
        Procedure::Handover
    } else if contexts.iter().any(BearerContext::has_enb_fteid) {
        Procedure::ServiceRequest
    } else {
        otherwise
    }
}

/// Whether a PCC rule of that name is bound to a bearer of the PDN
pub fn installed_rule(graph: &SessionGraph, pdn: Option<PdnHandle>, name: &str) -> bool {
    let Some(pdn_ctx) = pdn.and_then(|p| graph.pdn(p)) else {
        return false;
    };
    pdn_ctx
        .bearers()
        .filter_map(|b| graph.bearer(b))
        .any(|b| b.charging_rules.iter().any(|r| r == name))
}

// ============================================================================
// Resolution
// ============================================================================

struct Resolved {
    ue: Option<UeHandle>,
    pdn: Option<PdnHandle>,
    targets: Vec<PdnHandle>,
}

fn owned(
    identities: &IdentityTables,
    graph: &SessionGraph,
    partition: PartitionId,
    key: IdentityKey,
) -> Option<Owner> {
    identities
        .lookup(&key)
        .filter(|owner| owner.partition == partition && graph.ue(owner.ue).is_some())
}

fn not_found(what: String) -> Rejection {
    SaegwcError::ContextNotFound(what).into()
}

fn ebi_pdn(graph: &SessionGraph, ue: UeHandle, raw: u8) -> Option<PdnHandle> {
    Ebi::new(raw).ok().and_then(|ebi| graph.pdn_of_ebi(ue, ebi))
}

fn first_pdn(graph: &SessionGraph, ue: UeHandle) -> Option<PdnHandle> {
    graph.ue(ue).and_then(|u| u.pdns().first().copied())
}

/// PDN connection of the UE whose record waits for this access-side answer
fn awaiting_answer(graph: &SessionGraph, store: &CorrelationStore, ue: UeHandle, envelope: &Envelope) -> Option<PdnHandle> {
    let key = AnswerKey::of_answer(envelope)?;
    graph.ue(ue)?.pdns().iter().copied().find(|pdn| {
        graph
            .pdn(*pdn)
            .and_then(|p| store.get(p.seid))
            .is_some_and(|rec| rec.pending().iter().any(|p| p.leg == Leg::Access && p.key == key))
    })
}

fn resolve_gtp(
    identities: &IdentityTables,
    graph: &SessionGraph,
    store: &CorrelationStore,
    partition: PartitionId,
    envelope: &Envelope,
    msg: &GtpMessage,
) -> Result<Resolved, Rejection> {
    let by_teid = |teid: u32| {
        owned(identities, graph, partition, IdentityKey::Teid(teid))
            .ok_or_else(|| not_found(format!("TEID[0x{teid:08x}]")))
    };

    // new sessions are found by subscriber, not by TEID
    if let GtpBody::CreateSessionRequest(req) = &msg.body {
        if msg.teid == 0 {
            let imsi = req
                .imsi
                .as_ref()
                .ok_or(Rejection::from(SaegwcError::MissingIe("IMSI")))?;
            let ue = owned(identities, graph, partition, IdentityKey::Imsi(imsi.clone())).map(|o| o.ue);
            let pdn = ue.and_then(|ue| graph.pdn_by_apn(ue, &req.apn));
            return Ok(Resolved {
                ue,
                pdn,
                targets: pdn.into_iter().collect(),
            });
        }
        let owner = by_teid(msg.teid)?;
        let pdn = owner.pdn.or_else(|| graph.pdn_by_apn(owner.ue, &req.apn));
        return Ok(Resolved {
            ue: Some(owner.ue),
            pdn,
            targets: pdn.into_iter().collect(),
        });
    }

    let owner = match &msg.body {
        GtpBody::ChangeNotificationRequest(req) if req.imsi.is_some() => {
            let imsi = req.imsi.clone().ok_or(Rejection::from(SaegwcError::MissingIe("IMSI")))?;
            owned(identities, graph, partition, IdentityKey::Imsi(imsi.clone()))
                .ok_or_else(|| Rejection::from(SaegwcError::ImsiNotKnown(imsi.to_string())))?
        }
        _ => by_teid(msg.teid)?,
    };
    let ue = owner.ue;

    if let Some(pdn) = owner.pdn {
        return Ok(Resolved {
            ue: Some(ue),
            pdn: Some(pdn),
            targets: vec![pdn],
        });
    }

    let mut targets = Vec::new();
    let pdn = match &msg.body {
        GtpBody::ModifyBearerRequest(req) => {
            for bc in &req.bearer_contexts {
                if let Some(pdn) = ebi_pdn(graph, ue, bc.ebi) {
                    if !targets.contains(&pdn) {
                        targets.push(pdn);
                    }
                }
            }
            if req.bearer_contexts.is_empty() {
                targets = graph.ue(ue).map(|u| u.pdns().to_vec()).unwrap_or_default();
            } else if targets.is_empty() {
                return Err(not_found("bearer contexts of Modify Bearer Request".into()));
            }
            targets.first().copied()
        }
        GtpBody::ReleaseAccessBearersRequest => {
            targets = graph.ue(ue).map(|u| u.pdns().to_vec()).unwrap_or_default();
            targets.first().copied()
        }
        GtpBody::DeleteSessionRequest(req) => match req.linked_ebi {
            Some(ebi) => Some(ebi_pdn(graph, ue, ebi).ok_or_else(|| not_found(format!("LBI[{ebi}]")))?),
            None => first_pdn(graph, ue),
        },
        GtpBody::DeleteBearerCommand(cmd) => {
            let ebi = cmd.ebis.first().copied().ok_or(Rejection::from(SaegwcError::MissingIe("EBI")))?;
            Some(ebi_pdn(graph, ue, ebi).ok_or_else(|| not_found(format!("EBI[{ebi}]")))?)
        }
        GtpBody::BearerResourceCommand(cmd) => Some(
            ebi_pdn(graph, ue, cmd.linked_ebi).ok_or_else(|| not_found(format!("LBI[{}]", cmd.linked_ebi)))?,
        ),
        GtpBody::ChangeNotificationRequest(req) => match req.linked_ebi {
            Some(ebi) => ebi_pdn(graph, ue, ebi).or_else(|| first_pdn(graph, ue)),
            None => first_pdn(graph, ue),
        },
        GtpBody::CreateBearerResponse(_)
        | GtpBody::UpdateBearerResponse(_)
        | GtpBody::DeleteBearerResponse(_) => {
            awaiting_answer(graph, store, ue, envelope).or_else(|| first_pdn(graph, ue))
        }
        _ => first_pdn(graph, ue),
    };
    if targets.is_empty() {
        targets.extend(pdn);
    }
    Ok(Resolved {
        ue: Some(ue),
        pdn,
        targets,
    })
}

fn resolve(
    identities: &IdentityTables,
    graph: &SessionGraph,
    store: &CorrelationStore,
    partition: PartitionId,
    envelope: &Envelope,
) -> Result<Resolved, Rejection> {
    let (key, label) = match envelope {
        Envelope::Gtp { msg, .. } => return resolve_gtp(identities, graph, store, partition, envelope, msg),
        Envelope::Pfcp { msg, .. } => {
            let seid = msg.seid.unwrap_or(0);
            (IdentityKey::Seid(seid), format!("SEID[0x{seid:016x}]"))
        }
        Envelope::Gx { msg } => (
            IdentityKey::GxSession(msg.session_id.clone()),
            format!("Session-Id[{}]", msg.session_id),
        ),
    };
    let owner = owned(identities, graph, partition, key).ok_or_else(|| not_found(label.clone()))?;
    let pdn = owner.pdn.ok_or_else(|| not_found(label))?;
    Ok(Resolved {
        ue: Some(owner.ue),
        pdn: Some(pdn),
        targets: vec![pdn],
    })
}

// ============================================================================
// Classification
// ============================================================================

/// Classify a session-level message received by a partition
pub fn classify(
    identities: &IdentityTables,
    partition: PartitionId,
    graph: &SessionGraph,
    store: &CorrelationStore,
    envelope: &Envelope,
) -> Result<Classified, Rejection> {
    let event = EventKind::of_message(envelope)
        .ok_or_else(|| Rejection::from(SaegwcError::UnexpectedMessage(envelope.name().to_string())))?;
    let resolved = resolve(identities, graph, store, partition, envelope)?;
    let pdn_ctx = resolved.pdn.and_then(|p| graph.pdn(p));
    let state = pdn_ctx.map(|p| p.state).unwrap_or(SessState::Idle);
    let stored = pdn_ctx.and_then(|p| p.procedure);

    let initiated = initiated_procedure(graph, resolved.pdn, envelope);
    let procedure = match initiated {
        Some(procedure) if state.is_stable() || state == SessState::Idle => procedure,
        _ => stored.or(initiated).unwrap_or(Procedure::InitialAttach),
    };

    log::debug!(
        "Classified {} as {}/{}/{}",
        envelope.name(),
        procedure.name(),
        state.name(),
        event.name()
    );
    Ok(Classified {
        procedure,
        event,
        ue: resolved.ue,
        pdn: resolved.pdn,
        targets: resolved.targets,
        state,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{
        ChangeNotificationRequest, CreateSessionRequest, GtpMessage, Indication, ModifyBearerRequest,
        ReAuthRequest,
    };
    use crate::types::{FTeid, GtpInterface, Imsi};
    use crate::xact::Seq24;
    use std::net::IpAddr;

    fn mme() -> IpAddr {
        "10.0.0.1".parse().unwrap()
    }

    fn gtp(teid: u32, body: GtpBody) -> Envelope {
        Envelope::Gtp {
            peer: mme(),
            iface: GtpInterface::S11,
            msg: GtpMessage::new(teid, Seq24::new(1), body),
        }
    }

    fn imsi() -> Imsi {
        Imsi::new("001010000000001").unwrap()
    }

    /// UE with two PDN connections (EBI 5 and 6), S11 TEID 0x0000_0001
    fn setup() -> (IdentityTables, SessionGraph, UeHandle, PdnHandle, PdnHandle) {
        let identities = IdentityTables::new();
        let mut graph = SessionGraph::new(4);
        let ue = graph.create_ue(imsi());
        let internet = graph.create_pdn(ue, "internet", Ebi::new(5).unwrap(), 0x1_0000_0005).unwrap();
        graph.create_bearer(internet, Some(5)).unwrap();
        let ims = graph.create_pdn(ue, "ims", Ebi::new(6).unwrap(), 0x1_0000_0006).unwrap();
        graph.create_bearer(ims, Some(6)).unwrap();
        for pdn in [internet, ims] {
            let p = graph.pdn_mut(pdn).unwrap();
            p.state = SessState::Connected;
            p.procedure = Some(Procedure::InitialAttach);
        }
        identities.insert(IdentityKey::Teid(1), Owner::ue(0, ue)).unwrap();
        identities.insert(IdentityKey::Imsi(imsi()), Owner::ue(0, ue)).unwrap();
        (identities, graph, ue, internet, ims)
    }

    fn run(identities: &IdentityTables, graph: &SessionGraph, env: &Envelope) -> Result<Classified, Rejection> {
        classify(identities, 0, graph, &CorrelationStore::new(), env)
    }

    #[test]
    fn test_create_session_disambiguation() {
        let (identities, graph, ..) = setup();
        let enb = FTeid::new(7, "192.168.0.1".parse().unwrap());
        let mut bc = BearerContext::new(7);
        bc.s1u_enb = Some(enb);
        let req = |handover: bool, contexts: Vec<BearerContext>| CreateSessionRequest {
            imsi: Some(Imsi::new("001010000000002").unwrap()),
            apn: "internet".into(),
            indication: Indication { handover, scope: false },
            bearer_contexts: contexts,
            ..Default::default()
        };
        let env = gtp(0, GtpBody::CreateSessionRequest(req(false, vec![BearerContext::new(5)])));
        let c = run(&identities, &graph, &env).unwrap();
        assert_eq!(c.procedure, Procedure::InitialAttach);
        assert_eq!(c.state, SessState::Idle);
        assert!(c.ue.is_none());

        // the eNB endpoint sits in the second context
        let env = gtp(0, GtpBody::CreateSessionRequest(req(false, vec![BearerContext::new(5), bc.clone()])));
        assert_eq!(run(&identities, &graph, &env).unwrap().procedure, Procedure::ServiceRequest);

        let env = gtp(0, GtpBody::CreateSessionRequest(req(true, vec![bc])));
        assert_eq!(run(&identities, &graph, &env).unwrap().procedure, Procedure::Handover);
    }

    #[test]
    fn test_known_imsi_finds_existing_pdn() {
        let (identities, graph, ue, internet, _) = setup();
        let env = gtp(
            0,
            GtpBody::CreateSessionRequest(CreateSessionRequest {
                imsi: Some(imsi()),
                apn: "internet".into(),
                ..Default::default()
            }),
        );
        let c = run(&identities, &graph, &env).unwrap();
        assert_eq!(c.ue, Some(ue));
        assert_eq!(c.pdn, Some(internet));
        assert_eq!(c.state, SessState::Connected);
    }

    #[test]
    fn test_modify_bearer_fans_out() {
        let (identities, graph, _, internet, ims) = setup();
        let env = gtp(
            1,
            GtpBody::ModifyBearerRequest(ModifyBearerRequest {
                bearer_contexts: vec![BearerContext::new(6), BearerContext::new(5)],
                ..Default::default()
            }),
        );
        let c = run(&identities, &graph, &env).unwrap();
        assert_eq!(c.procedure, Procedure::ModifyBearer);
        assert_eq!(c.targets, vec![ims, internet]);

        let env = gtp(1, GtpBody::ReleaseAccessBearersRequest);
        let c = run(&identities, &graph, &env).unwrap();
        assert_eq!(c.targets.len(), 2);
        assert_eq!(c.event, EventKind::RabReqRcvd);

        let env = gtp(
            1,
            GtpBody::ModifyBearerRequest(ModifyBearerRequest {
                bearer_contexts: vec![BearerContext::new(9)],
                ..Default::default()
            }),
        );
        assert_eq!(run(&identities, &graph, &env).unwrap_err().cause, 64);
    }

    #[test]
    fn test_change_notification_unknown_imsi() {
        let (identities, graph, ..) = setup();
        let env = gtp(
            0,
            GtpBody::ChangeNotificationRequest(ChangeNotificationRequest {
                imsi: Some(Imsi::new("001010000000099").unwrap()),
                ..Default::default()
            }),
        );
        let rej = run(&identities, &graph, &env).unwrap_err();
        assert_eq!(rej.cause, crate::types::gtp_cause::IMSI_IMEI_NOT_KNOWN);
    }

    #[test]
    fn test_unknown_teid_and_misrouted() {
        let (identities, graph, ..) = setup();
        let env = gtp(0x0500_0001, GtpBody::ReleaseAccessBearersRequest);
        assert_eq!(run(&identities, &graph, &env).unwrap_err().cause, 64);
        // owned by partition 0, delivered to partition 1
        let env = gtp(1, GtpBody::ReleaseAccessBearersRequest);
        let rej = classify(&identities, 1, &graph, &CorrelationStore::new(), &env).unwrap_err();
        assert_eq!(rej.cause, 64);
    }

    #[test]
    fn test_answer_uses_stored_procedure() {
        let (identities, mut graph, _, internet, _) = setup();
        identities
            .insert(IdentityKey::Seid(0x1_0000_0005), Owner::pdn(0, graph.pdn(internet).unwrap().ue, internet))
            .unwrap();
        {
            let p = graph.pdn_mut(internet).unwrap();
            p.state = SessState::ModifyRequested;
            p.procedure = Some(Procedure::Handover);
        }
        let env = Envelope::Pfcp {
            peer: "127.0.0.7".parse().unwrap(),
            msg: crate::message::PfcpMessage::new(
                Some(0x1_0000_0005),
                Seq24::new(3),
                PfcpBody::SessionModificationResponse { cause: 1 },
            ),
        };
        let c = run(&identities, &graph, &env).unwrap();
        assert_eq!(c.procedure, Procedure::Handover);
        assert_eq!(c.event, EventKind::PfcpSessModRespRcvd);
    }

    #[test]
    fn test_rar_categories() {
        let (_, graph, _, internet, _) = setup();
        let rar = |body: ReAuthRequest| Envelope::Gx {
            msg: crate::message::GxMessage {
                session_id: "h;1;5".into(),
                hop_by_hop: 1,
                body: GxBody::ReAuthRequest(body),
            },
        };
        let release = rar(ReAuthRequest {
            session_release: true,
            ..Default::default()
        });
        assert_eq!(initiated_procedure(&graph, Some(internet), &release), Some(Procedure::Detach));
        let remove = rar(ReAuthRequest {
            removes: vec!["r1".into()],
            ..Default::default()
        });
        assert_eq!(
            initiated_procedure(&graph, Some(internet), &remove),
            Some(Procedure::DedicatedBearerDeactivation)
        );
        let install = rar(ReAuthRequest {
            installs: vec![crate::message::ChargingRule {
                name: "video".into(),
                qos: crate::types::BearerQos::non_gbr(7, 9),
                precedence: 10,
                flows: vec![],
            }],
            ..Default::default()
        });
        assert_eq!(
            initiated_procedure(&graph, Some(internet), &install),
            Some(Procedure::DedicatedBearerActivation)
        );
    }
}
