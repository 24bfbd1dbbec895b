//! Request builders and outbound message inspection

use std::net::IpAddr;

use nextgcore_saegwcd::message::{
    BearerContext, ChangeNotificationRequest, CreateSessionRequest, CreateSessionResponse,
    DeleteBearerCommand, DeleteSessionRequest, Envelope, GtpBody, GtpMessage, GtpMessageType, GxBody,
    PfcpMessageType, ReAuthAnswer,
};
use nextgcore_saegwcd::types::{Csid, FTeid, FqCsid, GtpInterface, Imsi};
use nextgcore_saegwcd::xact::Seq24;
use nextgcore_saegwcd::{Inbound, Outbound};

/// Access point name used by every test UE
pub const APN: &str = "internet";

pub fn mme_addr() -> IpAddr {
    "10.0.0.1".parse().unwrap()
}

pub fn enb_addr() -> IpAddr {
    "10.0.0.20".parse().unwrap()
}

pub fn upf_addr() -> IpAddr {
    "127.0.0.7".parse().unwrap()
}

/// Test IMSI with the given subscriber number
pub fn imsi(n: u64) -> Imsi {
    Imsi::new(&format!("00101{n:010}")).unwrap()
}

/// S11 message from the MME
pub fn s11(teid: u32, seq: u32, body: GtpBody) -> Inbound {
    Envelope::Gtp {
        peer: mme_addr(),
        iface: GtpInterface::S11,
        msg: GtpMessage::new(teid, Seq24::new(seq), body),
    }
}

/// Initial attach Create Session Request
pub fn create_session_request(imsi: Imsi, mme_teid: u32, seq: u32) -> Inbound {
    create_session_request_with_csid(imsi, mme_teid, seq, None)
}

/// Initial attach Create Session Request carrying an MME FQ-CSID
pub fn create_session_request_with_csid(imsi: Imsi, mme_teid: u32, seq: u32, mme_csid: Option<Csid>) -> Inbound {
    s11(
        0,
        seq,
        GtpBody::CreateSessionRequest(CreateSessionRequest {
            imsi: Some(imsi),
            apn: APN.to_string(),
            rat_type: 6,
            sender_fteid: Some(FTeid::new(mme_teid, mme_addr())),
            bearer_contexts: vec![BearerContext::new(5)],
            mme_fqcsid: mme_csid.map(|csid| FqCsid::new(mme_addr(), vec![csid])),
            ..Default::default()
        }),
    )
}

pub fn delete_session_request(s11_teid: u32, seq: u32) -> Inbound {
    s11(
        s11_teid,
        seq,
        GtpBody::DeleteSessionRequest(DeleteSessionRequest {
            linked_ebi: Some(5),
            ..Default::default()
        }),
    )
}

pub fn delete_bearer_command(s11_teid: u32, seq: u32, ebis: &[u8]) -> Inbound {
    s11(
        s11_teid,
        seq,
        GtpBody::DeleteBearerCommand(DeleteBearerCommand { ebis: ebis.to_vec() }),
    )
}

pub fn change_notification_request(imsi: Imsi, seq: u32) -> Inbound {
    s11(
        0,
        seq,
        GtpBody::ChangeNotificationRequest(ChangeNotificationRequest {
            imsi: Some(imsi),
            linked_ebi: Some(5),
            ..Default::default()
        }),
    )
}

// ============================================================================
// Inspection
// ============================================================================

/// GTP messages of one type
pub fn gtp_of(out: &[Outbound], message: GtpMessageType) -> Vec<&GtpMessage> {
    out.iter()
        .filter_map(|o| match o {
            Envelope::Gtp { msg, .. } if msg.message_type() == message => Some(msg),
            _ => None,
        })
        .collect()
}

pub fn pfcp_count(out: &[Outbound], message: PfcpMessageType) -> usize {
    out.iter().filter(|o| o.pfcp_type() == Some(message)).count()
}

/// The single Create Session Response among the outputs
pub fn create_session_response(out: &[Outbound]) -> (u32, CreateSessionResponse) {
    let found = gtp_of(out, GtpMessageType::CreateSessionResponse);
    assert_eq!(found.len(), 1, "expected one Create Session Response in {out:?}");
    match &found[0].body {
        GtpBody::CreateSessionResponse(rsp) => (found[0].teid, rsp.clone()),
        other => panic!("unexpected body {other:?}"),
    }
}

/// Local S11 TEID a Create Session Response announced
pub fn s11_teid_of(out: &[Outbound]) -> u32 {
    let (_, rsp) = create_session_response(out);
    rsp.sender_fteid.expect("sender F-TEID").teid
}

pub fn re_auth_answers(out: &[Outbound]) -> Vec<ReAuthAnswer> {
    out.iter()
        .filter_map(|o| match o {
            Envelope::Gx { msg } => match &msg.body {
                GxBody::ReAuthAnswer(raa) => Some(raa.clone()),
                _ => None,
            },
            _ => None,
        })
        .collect()
}
