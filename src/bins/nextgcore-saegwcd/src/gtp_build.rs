//! GTPv2-C Message Builder
//!
//! Outbound S11 and S5/S8 messages, built from the session graph of the
//! owning partition. Sequence numbers are chosen by the caller.

use std::net::IpAddr;

use crate::context::{BearerHandle, PdnConnection, PdnHandle, SessionGraph};
use crate::correlation::Origin;
use crate::message::{
    BearerContext, ChangeNotificationResponse, CreateBearerRequest, CreateBearerResponse,
    CreateSessionRequest, CreateSessionResponse, DeleteBearerFailureIndication,
    DeleteBearerRequest, DeleteBearerResponse, DeleteSessionRequest, DeleteSessionResponse,
    DownlinkDataNotification, Envelope, GtpBody, GtpMessage, Indication, ModifyBearerResponse,
    Outbound, ReleaseAccessBearersResponse, UpdateBearerRequest, UpdateBearerResponse,
};
use crate::message::BearerResourceFailureIndication;
use crate::types::{gtp_cause, Ambr, Ebi, FTeid, FqCsid, GatewayRole, GtpInterface};
use crate::xact::Seq24;

// ============================================================================
// Envelopes
// ============================================================================

/// Wrap a body for transmission
pub fn build_message(peer: IpAddr, iface: GtpInterface, teid: u32, seq: Seq24, body: GtpBody) -> Outbound {
    Envelope::Gtp {
        peer,
        iface,
        msg: GtpMessage::new(teid, seq, body),
    }
}

/// Build Echo Request
pub fn build_echo_request(peer: IpAddr, iface: GtpInterface, seq: Seq24, recovery: u8) -> Outbound {
    build_message(peer, iface, 0, seq, GtpBody::EchoRequest { recovery })
}

/// Build Echo Response
pub fn build_echo_response(peer: IpAddr, iface: GtpInterface, seq: Seq24, recovery: u8) -> Outbound {
    build_message(peer, iface, 0, seq, GtpBody::EchoResponse { recovery })
}

/// Answer addressed to the sender of an inbound request
pub fn build_response(origin: &Origin, body: GtpBody) -> Option<Outbound> {
    match origin {
        Origin::Gtp {
            peer,
            iface,
            teid,
            seq,
            ..
        } => Some(build_message(*peer, *iface, *teid, *seq, body)),
        Origin::Gx { .. } => None,
    }
}

// ============================================================================
// Error Answers
// ============================================================================

fn with_cause(ebi: u8, cause: u8) -> BearerContext {
    BearerContext {
        cause: Some(cause),
        ..BearerContext::new(ebi)
    }
}

/// Error answer body for an inbound request, `None` for messages that are
/// never answered
pub fn build_error_body(request: &GtpBody, cause: u8) -> Option<GtpBody> {
    let body = match request {
        GtpBody::CreateSessionRequest(_) => GtpBody::CreateSessionResponse(CreateSessionResponse {
            cause,
            ..Default::default()
        }),
        GtpBody::ModifyBearerRequest(_) => GtpBody::ModifyBearerResponse(ModifyBearerResponse {
            cause,
            ..Default::default()
        }),
        GtpBody::DeleteSessionRequest(_) => {
            GtpBody::DeleteSessionResponse(DeleteSessionResponse { cause })
        }
        GtpBody::CreateBearerRequest(req) => GtpBody::CreateBearerResponse(CreateBearerResponse {
            cause,
            bearer_contexts: req
                .bearer_contexts
                .iter()
                .map(|bc| with_cause(bc.ebi, cause))
                .collect(),
        }),
        GtpBody::UpdateBearerRequest(req) => GtpBody::UpdateBearerResponse(UpdateBearerResponse {
            cause,
            bearer_contexts: req
                .bearer_contexts
                .iter()
                .map(|bc| with_cause(bc.ebi, cause))
                .collect(),
        }),
        GtpBody::DeleteBearerRequest(req) => GtpBody::DeleteBearerResponse(DeleteBearerResponse {
            cause,
            linked_ebi: req.linked_ebi,
            bearer_contexts: req.ebis.iter().map(|ebi| with_cause(*ebi, cause)).collect(),
        }),
        GtpBody::DeleteBearerCommand(cmd) => {
            GtpBody::DeleteBearerFailureIndication(DeleteBearerFailureIndication {
                cause,
                bearer_contexts: cmd.ebis.iter().map(|ebi| with_cause(*ebi, cause)).collect(),
            })
        }
        GtpBody::BearerResourceCommand(cmd) => {
            GtpBody::BearerResourceFailureIndication(BearerResourceFailureIndication {
                cause,
                linked_ebi: cmd.linked_ebi,
                pti: cmd.pti,
            })
        }
        GtpBody::ChangeNotificationRequest(req) => {
            GtpBody::ChangeNotificationResponse(ChangeNotificationResponse {
                cause,
                imsi: req.imsi.clone(),
            })
        }
        GtpBody::ReleaseAccessBearersRequest => {
            GtpBody::ReleaseAccessBearersResponse(ReleaseAccessBearersResponse { cause })
        }
        GtpBody::DownlinkDataNotification(_) => GtpBody::DownlinkDataNotificationAck { cause },
        GtpBody::DeletePdnConnectionSetRequest(_) => {
            GtpBody::DeletePdnConnectionSetResponse { cause }
        }
        _ => return None,
    };
    Some(body)
}

/// Error answer to an inbound request
pub fn build_error_response(request: &Envelope, teid: u32, cause: u8) -> Option<Outbound> {
    let Envelope::Gtp { peer, iface, msg } = request else {
        return None;
    };
    let body = build_error_body(&msg.body, cause)?;
    log::debug!(
        "Built {} cause[{}] teid[0x{:08x}]",
        body.message_type().name(),
        cause,
        teid
    );
    Some(build_message(*peer, *iface, teid, msg.seq, body))
}

// ============================================================================
// Bearer Contexts
// ============================================================================

/// Bearer context carrying every known endpoint of a bearer
pub fn build_bearer_context(graph: &SessionGraph, bearer: BearerHandle, cause: Option<u8>) -> Option<BearerContext> {
    let b = graph.bearer(bearer)?;
    Some(BearerContext {
        ebi: b.ebi.value(),
        cause,
        qos: Some(b.qos),
        tft: b.tft.clone(),
        s1u_enb: b.s1u_enb,
        s1u_sgw: b.s1u_sgw,
        s5s8u_sgw: b.s5s8u_sgw,
        s5s8u_pgw: b.s5s8u_pgw,
    })
}

/// Bearer contexts for a set of bearer ids of a PDN connection
pub fn build_bearer_contexts(graph: &SessionGraph, pdn: PdnHandle, ebis: &[Ebi], cause: Option<u8>) -> Vec<BearerContext> {
    ebis.iter()
        .filter_map(|ebi| graph.bearer_by_ebi(pdn, *ebi))
        .filter_map(|bearer| build_bearer_context(graph, bearer, cause))
        .collect()
}

fn all_bearer_contexts(graph: &SessionGraph, pdn: &PdnConnection, cause: Option<u8>) -> Vec<BearerContext> {
    pdn.bearers()
        .filter_map(|bearer| build_bearer_context(graph, bearer, cause))
        .collect()
}

/// FQ-CSID this node issued for the session
pub fn local_fqcsid(pdn: &PdnConnection, node: IpAddr) -> Option<FqCsid> {
    pdn.csids.local.map(|csid| FqCsid::new(node, vec![csid]))
}

// ============================================================================
// Session Messages
// ============================================================================

/// Build Create Session Response for the access side
pub fn build_create_session_response(
    graph: &SessionGraph,
    role: GatewayRole,
    node: IpAddr,
    pdn: PdnHandle,
    recovery: Option<u8>,
) -> Option<GtpBody> {
    let pdn_ctx = graph.pdn(pdn)?;
    let ue = graph.ue(pdn_ctx.ue)?;
    let local_teid = if role.has_s11() {
        ue.local_s11_teid
    } else {
        pdn_ctx.local_s5s8_teid
    };
    let local = local_fqcsid(pdn_ctx, node);
    let rsp = CreateSessionResponse {
        cause: gtp_cause::REQUEST_ACCEPTED,
        sender_fteid: local_teid.map(|teid| FTeid::new(teid, node)),
        paa: pdn_ctx.ue_ip,
        ambr: pdn_ctx.ambr,
        bearer_contexts: all_bearer_contexts(graph, pdn_ctx, Some(gtp_cause::REQUEST_ACCEPTED)),
        sgw_fqcsid: if role.has_s11() { local.clone() } else { pdn_ctx.csids.sgw.clone() },
        pgw_fqcsid: if role.anchors_pdn() { local } else { pdn_ctx.csids.pgw.clone() },
        recovery,
    };
    log::debug!(
        "Built Create Session Response IMSI[{}] APN[{}] bearers[{}]",
        ue.imsi,
        pdn_ctx.apn,
        rsp.bearer_contexts.len()
    );
    Some(GtpBody::CreateSessionResponse(rsp))
}

/// Build the Create Session Request an SGW-C relays to the PGW
pub fn build_forward_create_session_request(
    graph: &SessionGraph,
    node: IpAddr,
    pdn: PdnHandle,
    request: &CreateSessionRequest,
) -> Option<GtpBody> {
    let pdn_ctx = graph.pdn(pdn)?;
    let mut req = request.clone();
    req.sender_fteid = pdn_ctx.local_s5s8_teid.map(|teid| FTeid::new(teid, node));
    req.pgw_s5s8_fteid = None;
    req.sgw_fqcsid = local_fqcsid(pdn_ctx, node);
    req.indication = Indication {
        scope: false,
        ..req.indication
    };
    req.bearer_contexts = pdn_ctx
        .bearers()
        .filter_map(|bearer| graph.bearer(bearer))
        .map(|b| BearerContext {
            qos: Some(b.qos),
            tft: b.tft.clone(),
            s5s8u_sgw: b.s5s8u_sgw,
            ..BearerContext::new(b.ebi.value())
        })
        .collect();
    Some(GtpBody::CreateSessionRequest(req))
}

/// Build Delete Session Request toward the PGW
pub fn build_delete_session_request(pdn: &PdnConnection) -> GtpBody {
    GtpBody::DeleteSessionRequest(DeleteSessionRequest {
        linked_ebi: Some(pdn.default_ebi.value()),
        indication: Indication::default(),
        uli: pdn.uli.clone(),
    })
}

// ============================================================================
// Bearer Messages
// ============================================================================

/// Build Create Bearer Request for new dedicated bearers
pub fn build_create_bearer_request(graph: &SessionGraph, pdn: PdnHandle, ebis: &[Ebi], pti: Option<u8>) -> Option<GtpBody> {
    let pdn_ctx = graph.pdn(pdn)?;
    let req = CreateBearerRequest {
        linked_ebi: pdn_ctx.default_ebi.value(),
        pti,
        bearer_contexts: build_bearer_contexts(graph, pdn, ebis, None),
    };
    log::debug!("Built Create Bearer Request LBI[{}] bearers[{}]", req.linked_ebi, req.bearer_contexts.len());
    Some(GtpBody::CreateBearerRequest(req))
}

/// Build Update Bearer Request carrying the current QoS of the bearers
pub fn build_update_bearer_request(
    graph: &SessionGraph,
    pdn: PdnHandle,
    ebis: &[Ebi],
    pti: Option<u8>,
    ambr: Option<Ambr>,
) -> GtpBody {
    GtpBody::UpdateBearerRequest(UpdateBearerRequest {
        pti,
        ambr,
        bearer_contexts: build_bearer_contexts(graph, pdn, ebis, None),
    })
}

/// Build Delete Bearer Request; a linked bearer id releases the whole PDN
pub fn build_delete_bearer_request(linked_ebi: Option<Ebi>, ebis: &[Ebi], pti: Option<u8>, cause: Option<u8>) -> GtpBody {
    GtpBody::DeleteBearerRequest(DeleteBearerRequest {
        linked_ebi: linked_ebi.map(Ebi::value),
        ebis: ebis.iter().map(|ebi| ebi.value()).collect(),
        pti,
        cause,
    })
}

/// Build Downlink Data Notification
pub fn build_downlink_data_notification(ebi: Ebi) -> GtpBody {
    GtpBody::DownlinkDataNotification(DownlinkDataNotification { ebi: ebi.value() })
}

/// Build Create Bearer Response relayed to the PGW
pub fn build_create_bearer_response(cause: u8, bearer_contexts: Vec<BearerContext>) -> GtpBody {
    GtpBody::CreateBearerResponse(CreateBearerResponse {
        cause,
        bearer_contexts,
    })
}

/// Build Update Bearer Response relayed to the PGW
pub fn build_update_bearer_response(cause: u8, bearer_contexts: Vec<BearerContext>) -> GtpBody {
    GtpBody::UpdateBearerResponse(UpdateBearerResponse {
        cause,
        bearer_contexts,
    })
}

/// Build Delete Bearer Response relayed to the PGW
pub fn build_delete_bearer_response(cause: u8, linked_ebi: Option<Ebi>, ebis: &[Ebi]) -> GtpBody {
    GtpBody::DeleteBearerResponse(DeleteBearerResponse {
        cause,
        linked_ebi: linked_ebi.map(Ebi::value),
        bearer_contexts: ebis.iter().map(|ebi| with_cause(ebi.value(), cause)).collect(),
    })
}
