//! PFCP Message Builder
//!
//! Node level messages toward user plane nodes and the session messages of
//! the Sx leg. Rule content lives in the session graph; the builders here
//! create it, keep it in sync with bearer endpoints and QoS, and turn it
//! into Create/Update/Remove lists.

use std::net::IpAddr;

use crate::context::{BearerHandle, PdnHandle, Rule, RuleHandle, RuleSpec, SessionGraph};
use crate::error::{SaegwcError, SaegwcResult};
use crate::gtp_build::local_fqcsid;
use crate::message::{
    ApplyAction, CreateFar, CreatePdr, CreateQer, Envelope, FlowDirection, Outbound, PfcpBody,
    PfcpMessage, SessionEstablishmentRequest, SessionModificationRequest, UpdateFar,
};
use crate::types::{FTeid, GatewayRole};
use crate::xact::Seq24;

/// Precedence of the catch-all PDRs of a default bearer
pub const DEFAULT_PRECEDENCE: u32 = 65535;

// ============================================================================
// Node Messages
// ============================================================================

/// Wrap a body for transmission
pub fn build_message(upf: IpAddr, seid: Option<u64>, seq: Seq24, body: PfcpBody) -> Outbound {
    Envelope::Pfcp {
        peer: upf,
        msg: PfcpMessage::new(seid, seq, body),
    }
}

/// Build Heartbeat Request
pub fn build_heartbeat_request(upf: IpAddr, seq: Seq24, recovery_ts: u32) -> Outbound {
    build_message(upf, None, seq, PfcpBody::HeartbeatRequest { recovery_ts })
}

/// Build Heartbeat Response
pub fn build_heartbeat_response(upf: IpAddr, seq: Seq24, recovery_ts: u32) -> Outbound {
    build_message(upf, None, seq, PfcpBody::HeartbeatResponse { recovery_ts })
}

/// Build Association Setup Request
pub fn build_association_setup_request(upf: IpAddr, node: IpAddr, seq: Seq24, recovery_ts: u32) -> Outbound {
    log::debug!("Built Association Setup Request to UPF[{upf}]");
    build_message(upf, None, seq, PfcpBody::AssociationSetupRequest { node, recovery_ts })
}

/// Build Association Setup Response
pub fn build_association_setup_response(upf: IpAddr, node: IpAddr, seq: Seq24, cause: u8, recovery_ts: u32) -> Outbound {
    build_message(
        upf,
        None,
        seq,
        PfcpBody::AssociationSetupResponse {
            node,
            cause,
            recovery_ts,
        },
    )
}

/// Build Session Set Deletion Response
pub fn build_session_set_deletion_response(upf: IpAddr, seq: Seq24, cause: u8) -> Outbound {
    build_message(upf, None, seq, PfcpBody::SessionSetDeletionResponse { cause })
}

/// Build Session Report Response
pub fn build_session_report_response(upf: IpAddr, up_seid: Option<u64>, seq: Seq24, cause: u8) -> Outbound {
    build_message(upf, up_seid, seq, PfcpBody::SessionReportResponse { cause })
}

// ============================================================================
// Rule Content
// ============================================================================

/// Apply action and outer header a FAR should carry for the bearer endpoints
fn desired_far(
    destination: FlowDirection,
    relay: bool,
    access_remote: Option<FTeid>,
    core_remote: Option<FTeid>,
) -> (ApplyAction, Option<FTeid>) {
    match destination {
        FlowDirection::Access => match access_remote {
            Some(remote) => (ApplyAction::Forward, Some(remote)),
            None => (ApplyAction::BufferNotify, None),
        },
        FlowDirection::Core if relay => match core_remote {
            Some(remote) => (ApplyAction::Forward, Some(remote)),
            None => (ApplyAction::Drop, None),
        },
        FlowDirection::Core => (ApplyAction::Forward, None),
    }
}

/// Create the PDR, FAR and QER set of one bearer and attach it in the graph
///
/// Each bearer gets an uplink and a downlink PDR/FAR pair plus a QER for its
/// own QoS. On an anchoring node every PDR also references the session AMBR
/// QER, created with the first bearer and shared afterwards.
pub fn install_bearer_rules(
    graph: &mut SessionGraph,
    role: GatewayRole,
    bearer: BearerHandle,
    flows: &[String],
    precedence: u32,
) -> SaegwcResult<()> {
    let not_found = || SaegwcError::ContextNotFound(format!("bearer {bearer:?}"));
    let (pdn, qos, access_local, access_remote, core_local, core_remote) = {
        let b = graph.bearer(bearer).ok_or_else(not_found)?;
        (b.pdn, b.qos, b.access_local(role), b.access_remote(role), b.s5s8u_sgw, b.s5s8u_pgw)
    };
    let existing_ambr = graph
        .pdn(pdn)
        .and_then(|p| p.session_qer)
        .and_then(|h| graph.rule(h).map(|r| (h, r.id())));

    let relay = role.relays_to_pgw();
    let (ue_ip, ul_pdr, dl_pdr, ul_far, dl_far, qer_id, new_ambr) = {
        let pdn_ctx = graph.pdn_mut(pdn).ok_or_else(not_found)?;
        let new_ambr = match (role.anchors_pdn(), existing_ambr, pdn_ctx.ambr) {
            (true, None, Some(ambr)) => Some(CreateQer {
                qer_id: pdn_ctx.alloc_qer_id(),
                qci: 0,
                mbr_ul: ambr.uplink,
                mbr_dl: ambr.downlink,
                gbr_ul: 0,
                gbr_dl: 0,
            }),
            _ => None,
        };
        (
            pdn_ctx.ue_ip,
            pdn_ctx.alloc_pdr_id(),
            pdn_ctx.alloc_pdr_id(),
            pdn_ctx.alloc_far_id(),
            pdn_ctx.alloc_far_id(),
            pdn_ctx.alloc_qer_id(),
            new_ambr,
        )
    };

    let mut qer_ids = vec![qer_id];
    graph.attach_rule(
        bearer,
        RuleSpec::Qer(CreateQer {
            qer_id,
            qci: qos.qci,
            mbr_ul: qos.mbr_ul,
            mbr_dl: qos.mbr_dl,
            gbr_ul: qos.gbr_ul,
            gbr_dl: qos.gbr_dl,
        }),
    )?;
    if role.anchors_pdn() {
        if let Some((handle, id)) = existing_ambr {
            graph.share_rule(handle, bearer)?;
            qer_ids.push(id);
        } else if let Some(spec) = new_ambr {
            qer_ids.push(spec.qer_id);
            let handle = graph.attach_rule(bearer, RuleSpec::Qer(spec))?;
            if let Some(pdn_ctx) = graph.pdn_mut(pdn) {
                pdn_ctx.session_qer = Some(handle);
            }
        }
    }

    let (action, outer_header) = desired_far(FlowDirection::Core, relay, access_remote, core_remote);
    graph.attach_rule(
        bearer,
        RuleSpec::Far(CreateFar {
            far_id: ul_far,
            action,
            destination: FlowDirection::Core,
            outer_header,
        }),
    )?;
    let (action, outer_header) = desired_far(FlowDirection::Access, relay, access_remote, core_remote);
    graph.attach_rule(
        bearer,
        RuleSpec::Far(CreateFar {
            far_id: dl_far,
            action,
            destination: FlowDirection::Access,
            outer_header,
        }),
    )?;
    graph.attach_rule(
        bearer,
        RuleSpec::Pdr(CreatePdr {
            pdr_id: ul_pdr,
            precedence,
            source: FlowDirection::Access,
            local_fteid: access_local,
            ue_ip: None,
            sdf_filters: flows.to_vec(),
            far_id: ul_far,
            qer_ids: qer_ids.clone(),
        }),
    )?;
    graph.attach_rule(
        bearer,
        RuleSpec::Pdr(CreatePdr {
            pdr_id: dl_pdr,
            precedence,
            source: FlowDirection::Core,
            local_fteid: if relay { core_local } else { None },
            ue_ip: if relay { None } else { ue_ip },
            sdf_filters: flows.to_vec(),
            far_id: dl_far,
            qer_ids,
        }),
    )?;
    log::debug!("Rules installed for bearer PDR[{ul_pdr},{dl_pdr}] FAR[{ul_far},{dl_far}] QER[{qer_id}]");
    Ok(())
}

/// Rules first attached to one of the bearers, each listed once
fn collect_created(graph: &SessionGraph, bearers: &[BearerHandle], req: &mut SessionModificationRequest) {
    for bearer in bearers {
        let Some(b) = graph.bearer(*bearer) else {
            continue;
        };
        for handle in b.rules() {
            let Some(rule) = graph.rule(*handle) else {
                continue;
            };
            if rule.owners().first() != Some(bearer) {
                continue;
            }
            match &rule.spec {
                RuleSpec::Pdr(pdr) => req.create_pdrs.push(pdr.clone()),
                RuleSpec::Far(far) => req.create_fars.push(far.clone()),
                RuleSpec::Qer(qer) => req.create_qers.push(qer.clone()),
            }
        }
    }
}

/// Bring the stored FARs of the bearers in line with their current
/// endpoints; returns the FARs that changed
pub fn sync_far_updates(graph: &mut SessionGraph, role: GatewayRole, bearers: &[BearerHandle]) -> Vec<UpdateFar> {
    let relay = role.relays_to_pgw();
    let mut updates = Vec::new();
    for bearer in bearers {
        let Some(b) = graph.bearer(*bearer) else {
            continue;
        };
        let access_remote = b.access_remote(role);
        let core_remote = b.s5s8u_pgw;
        let handles: Vec<RuleHandle> = b.rules().to_vec();
        for handle in handles {
            let Some(rule) = graph.rule_mut(handle) else {
                continue;
            };
            let RuleSpec::Far(far) = &mut rule.spec else {
                continue;
            };
            let (action, outer_header) = desired_far(far.destination, relay, access_remote, core_remote);
            if far.action != action || far.outer_header != outer_header {
                far.action = action;
                far.outer_header = outer_header;
                updates.push(UpdateFar {
                    far_id: far.far_id,
                    action,
                    outer_header,
                });
            }
        }
    }
    updates
}

/// Bring the bearer QERs (and the session AMBR QER) in line with the
/// stored QoS; returns the QERs that changed
pub fn sync_qer_updates(graph: &mut SessionGraph, pdn: PdnHandle, bearers: &[BearerHandle]) -> Vec<CreateQer> {
    let (session_qer, ambr) = match graph.pdn(pdn) {
        Some(p) => (p.session_qer, p.ambr),
        None => return Vec::new(),
    };
    let mut updates = Vec::new();
    for bearer in bearers {
        let Some(b) = graph.bearer(*bearer) else {
            continue;
        };
        let qos = b.qos;
        let own: Vec<RuleHandle> = b
            .rules()
            .iter()
            .copied()
            .filter(|h| Some(*h) != session_qer)
            .collect();
        for handle in own {
            let Some(rule) = graph.rule_mut(handle) else {
                continue;
            };
            let RuleSpec::Qer(qer) = &mut rule.spec else {
                continue;
            };
            let wanted = CreateQer {
                qer_id: qer.qer_id,
                qci: qos.qci,
                mbr_ul: qos.mbr_ul,
                mbr_dl: qos.mbr_dl,
                gbr_ul: qos.gbr_ul,
                gbr_dl: qos.gbr_dl,
            };
            if *qer != wanted {
                *qer = wanted.clone();
                updates.push(wanted);
            }
        }
    }
    if let (Some(handle), Some(ambr)) = (session_qer, ambr) {
        if let Some(RuleSpec::Qer(qer)) = graph.rule_mut(handle).map(|r| &mut r.spec) {
            if qer.mbr_ul != ambr.uplink || qer.mbr_dl != ambr.downlink {
                qer.mbr_ul = ambr.uplink;
                qer.mbr_dl = ambr.downlink;
                updates.push(qer.clone());
            }
        }
    }
    updates
}

// ============================================================================
// Session Messages
// ============================================================================

/// Build Session Establishment Request with every rule of the PDN connection
pub fn build_session_establishment_request(graph: &SessionGraph, node: IpAddr, pdn: PdnHandle) -> Option<PfcpBody> {
    let pdn_ctx = graph.pdn(pdn)?;
    let bearers: Vec<BearerHandle> = pdn_ctx.bearers().collect();
    let mut rules = SessionModificationRequest::default();
    collect_created(graph, &bearers, &mut rules);
    let req = SessionEstablishmentRequest {
        node: Some(node),
        cp_seid: pdn_ctx.seid,
        create_pdrs: rules.create_pdrs,
        create_fars: rules.create_fars,
        create_qers: rules.create_qers,
        cp_fqcsid: local_fqcsid(pdn_ctx, node),
        mme_fqcsid: pdn_ctx.csids.mme.clone(),
        sgw_fqcsid: pdn_ctx.csids.sgw.clone(),
        pgw_fqcsid: pdn_ctx.csids.pgw.clone(),
    };
    log::debug!(
        "Built Session Establishment Request SEID[0x{:016x}] PDR[{}] FAR[{}] QER[{}]",
        req.cp_seid,
        req.create_pdrs.len(),
        req.create_fars.len(),
        req.create_qers.len()
    );
    Some(PfcpBody::SessionEstablishmentRequest(req))
}

/// Modification creating the rules of newly added bearers
pub fn build_rule_installation(graph: &SessionGraph, bearers: &[BearerHandle]) -> SessionModificationRequest {
    let mut req = SessionModificationRequest::default();
    collect_created(graph, bearers, &mut req);
    req
}

/// Modification removing rules freed by detached bearers
pub fn build_rule_removal(freed: &[Rule]) -> SessionModificationRequest {
    let mut req = SessionModificationRequest::default();
    for rule in freed {
        match &rule.spec {
            RuleSpec::Pdr(pdr) => req.remove_pdrs.push(pdr.pdr_id),
            RuleSpec::Far(far) => req.remove_fars.push(far.far_id),
            RuleSpec::Qer(qer) => req.remove_qers.push(qer.qer_id),
        }
    }
    req
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Ambr, BearerQos, Ebi, Imsi};

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn graph_with_bearer(role: GatewayRole) -> (SessionGraph, PdnHandle, BearerHandle) {
        let mut graph = SessionGraph::new(4);
        let ue = graph.create_ue(Imsi::new("001010000000001").unwrap());
        let pdn = graph.create_pdn(ue, "internet", Ebi::new(5).unwrap(), 0x100).unwrap();
        {
            let p = graph.pdn_mut(pdn).unwrap();
            p.ue_ip = Some("10.45.0.2".parse().unwrap());
            p.ambr = Some(Ambr {
                uplink: 1_000,
                downlink: 2_000,
            });
        }
        let bearer = graph.create_bearer(pdn, Some(5)).unwrap();
        let b = graph.bearer_mut(bearer).unwrap();
        b.qos = BearerQos::non_gbr(9, 8);
        b.set_access_local(role, Some(FTeid::new(0x11, addr("127.0.0.7"))));
        (graph, pdn, bearer)
    }

    #[test]
    fn test_anchor_rules_share_ambr_qer() {
        let role = GatewayRole::Saegwc;
        let (mut graph, pdn, default) = graph_with_bearer(role);
        install_bearer_rules(&mut graph, role, default, &[], DEFAULT_PRECEDENCE).unwrap();
        // bearer QER, AMBR QER, two FARs, two PDRs
        assert_eq!(graph.rule_count(), 6);
        assert!(graph.pdn(pdn).unwrap().session_qer.is_some());

        let dedicated = graph.create_bearer(pdn, None).unwrap();
        install_bearer_rules(&mut graph, role, dedicated, &["permit out ip from any to any".into()], 10).unwrap();
        assert_eq!(graph.rule_count(), 11);

        let req = build_rule_installation(&graph, &[dedicated]);
        assert_eq!(req.create_pdrs.len(), 2);
        assert_eq!(req.create_fars.len(), 2);
        assert_eq!(req.create_qers.len(), 1);
        assert_eq!(req.create_pdrs[0].qer_ids.len(), 2);

        match build_session_establishment_request(&graph, addr("127.0.0.3"), pdn) {
            Some(PfcpBody::SessionEstablishmentRequest(est)) => {
                assert_eq!(est.cp_seid, 0x100);
                assert_eq!(est.create_qers.len(), 3);
                assert_eq!(est.create_pdrs.len(), 4);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_downlink_far_buffers_until_remote_known() {
        let role = GatewayRole::Saegwc;
        let (mut graph, _, bearer) = graph_with_bearer(role);
        install_bearer_rules(&mut graph, role, bearer, &[], DEFAULT_PRECEDENCE).unwrap();
        let buffering = graph
            .bearer(bearer)
            .unwrap()
            .rules()
            .iter()
            .filter_map(|h| match &graph.rule(*h).unwrap().spec {
                RuleSpec::Far(far) if far.destination == FlowDirection::Access => Some(far.action),
                _ => None,
            })
            .next();
        assert_eq!(buffering, Some(ApplyAction::BufferNotify));

        assert!(sync_far_updates(&mut graph, role, &[bearer]).is_empty());
        let enb = FTeid::new(0x99, addr("192.168.0.10"));
        graph.bearer_mut(bearer).unwrap().s1u_enb = Some(enb);
        let updates = sync_far_updates(&mut graph, role, &[bearer]);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].action, ApplyAction::Forward);
        assert_eq!(updates[0].outer_header, Some(enb));
        assert!(sync_far_updates(&mut graph, role, &[bearer]).is_empty());
    }

    #[test]
    fn test_sgw_uplink_far_follows_pgw_endpoint() {
        let role = GatewayRole::Sgwc;
        let (mut graph, pdn, bearer) = graph_with_bearer(role);
        install_bearer_rules(&mut graph, role, bearer, &[], DEFAULT_PRECEDENCE).unwrap();
        assert!(graph.pdn(pdn).unwrap().session_qer.is_none());
        assert_eq!(graph.rule_count(), 5);

        let pgw = FTeid::new(0x77, addr("10.0.0.9"));
        graph.bearer_mut(bearer).unwrap().s5s8u_pgw = Some(pgw);
        let updates = sync_far_updates(&mut graph, role, &[bearer]);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].outer_header, Some(pgw));
    }

    #[test]
    fn test_qer_sync_and_removal() {
        let role = GatewayRole::Pgwc;
        let (mut graph, pdn, bearer) = graph_with_bearer(role);
        install_bearer_rules(&mut graph, role, bearer, &[], DEFAULT_PRECEDENCE).unwrap();
        assert!(sync_qer_updates(&mut graph, pdn, &[bearer]).is_empty());

        graph.bearer_mut(bearer).unwrap().qos.mbr_dl = 5_000;
        graph.pdn_mut(pdn).unwrap().ambr = Some(Ambr {
            uplink: 1_000,
            downlink: 9_000,
        });
        let updates = sync_qer_updates(&mut graph, pdn, &[bearer]);
        assert_eq!(updates.len(), 2);

        let dedicated = graph.create_bearer(pdn, None).unwrap();
        install_bearer_rules(&mut graph, role, dedicated, &[], 10).unwrap();
        let ebi = graph.bearer(dedicated).unwrap().ebi;
        let detached = graph.detach_bearer(pdn, ebi).unwrap();
        let req = build_rule_removal(&detached.freed_rules);
        assert_eq!(req.remove_pdrs.len(), 2);
        assert_eq!(req.remove_fars.len(), 2);
        assert_eq!(req.remove_qers.len(), 1);
    }

    #[test]
    fn test_node_messages() {
        let upf = addr("127.0.0.7");
        let msg = build_association_setup_request(upf, addr("127.0.0.3"), Seq24::new(4), 100);
        assert_eq!(msg.peer(), Some(upf));
        assert_eq!(msg.seq(), Some(Seq24::new(4)));
        let Envelope::Pfcp { msg, .. } = build_session_report_response(upf, Some(9), Seq24::new(5), 1) else {
            panic!("not PFCP");
        };
        assert_eq!(msg.seid, Some(9));
    }
}
