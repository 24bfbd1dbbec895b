//! Session lifecycle integration tests
//!
//! Attach, access bearer updates, detach, request retransmission and
//! requests for UEs the gateway does not know.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use nextgcore_saegwcd::event::SessState;
use nextgcore_saegwcd::message::{
    BearerContext, CcRequestType, Envelope, GtpBody, GtpMessageType, ModifyBearerRequest, PfcpBody, PfcpMessage,
    PfcpMessageType, SessionReport,
};
use nextgcore_saegwcd::types::{gtp_cause, FTeid};
use nextgcore_saegwcd::xact::Seq24;
use nextgcore_saegwcd::{Gateway, SaegwcConfig};

use crate::common::{
    change_notification_request, create_session_request, create_session_response, delete_session_request,
    enb_addr, gtp_of, imsi, pfcp_count, s11, upf_addr, TestContext,
};

fn cause_of(out: &[nextgcore_saegwcd::Outbound], message: GtpMessageType) -> Option<u8> {
    gtp_of(out, message).first().and_then(|msg| msg.body.cause())
}

#[test]
fn test_initial_attach_establishes_user_plane() {
    let _ = env_logger::try_init();
    let mut ctx = TestContext::new(4, false);
    let ue = imsi(1);

    let out = ctx.gw.handle(create_session_request(ue.clone(), 0x100, 1), ctx.now);
    assert_eq!(out.len(), 1);
    assert_eq!(pfcp_count(&out, PfcpMessageType::SessionEstablishmentRequest), 1);
    let pdns = ctx.pdns();
    assert_eq!(pdns.len(), 1);
    assert_eq!(pdns[0].state, SessState::SessionEstablishRequested);
    assert_eq!(pdns[0].partition as u64, ue.as_u64() % 4);

    let out = ctx.peers.settle(&mut ctx.gw, out, ctx.now);
    let (teid, rsp) = create_session_response(&out);
    assert_eq!(teid, 0x100);
    assert_eq!(rsp.cause, gtp_cause::REQUEST_ACCEPTED);
    let sender = rsp.sender_fteid.expect("sender F-TEID");
    assert_eq!(sender.addr, ctx.gw.shared().node_addr());
    assert!(rsp.paa.is_some());

    let pdns = ctx.pdns();
    assert_eq!(pdns[0].state, SessState::Connected);
    assert!(pdns[0].up_seid.is_some());
    assert_eq!(ctx.pending_records(), 0);
}

#[test]
fn test_attach_then_detach_releases_everything() {
    let _ = env_logger::try_init();
    let mut ctx = TestContext::new(2, false);
    let teid = ctx.attach(imsi(2), 0x200);
    assert_eq!(ctx.pdn_count(), 1);
    assert_eq!(ctx.peers.up_session_count(), 1);

    let seq = ctx.next_seq();
    let out = ctx.send(delete_session_request(teid, seq));
    assert_eq!(cause_of(&out, GtpMessageType::DeleteSessionResponse), Some(gtp_cause::REQUEST_ACCEPTED));
    assert_eq!(gtp_of(&out, GtpMessageType::DeleteSessionResponse)[0].teid, 0x200);

    assert_eq!(ctx.pdn_count(), 0);
    assert_eq!(ctx.ue_count(), 0);
    assert_eq!(ctx.pending_records(), 0);
    assert_eq!(ctx.peers.up_session_count(), 0);
    assert_eq!(ctx.gw.shared().identities.teid_count(), 0);
    assert_eq!(ctx.gw.shared().identities.imsi_count(), 0);
}

#[test]
fn test_attach_with_policy_control() {
    let _ = env_logger::try_init();
    let mut ctx = TestContext::new(2, true);

    let out = ctx.gw.handle(create_session_request(imsi(3), 0x300, 1), ctx.now);
    assert_eq!(pfcp_count(&out, PfcpMessageType::SessionEstablishmentRequest), 1);
    assert_eq!(out.iter().filter(|o| matches!(o, nextgcore_saegwcd::Envelope::Gx { .. })).count(), 1);

    let out = ctx.peers.settle(&mut ctx.gw, out, ctx.now);
    let (_, rsp) = create_session_response(&out);
    assert_eq!(rsp.cause, gtp_cause::REQUEST_ACCEPTED);
    assert_eq!(ctx.peers.ccrs[0].request_type, CcRequestType::Initial);
    assert_eq!(ctx.peers.gx_sessions.len(), 1);
    assert!(ctx.peers.gx_sessions[0].starts_with("saegwc.localdomain;"));
    assert_eq!(ctx.pending_records(), 0);

    let teid = rsp.sender_fteid.expect("sender F-TEID").teid;
    let out = ctx.send(delete_session_request(teid, 2));
    assert_eq!(cause_of(&out, GtpMessageType::DeleteSessionResponse), Some(gtp_cause::REQUEST_ACCEPTED));
    assert_eq!(ctx.peers.ccrs.last().map(|ccr| ccr.request_type), Some(CcRequestType::Termination));
    assert_eq!(ctx.pdn_count(), 0);
    assert_eq!(ctx.gw.shared().identities.gx_session_count(), 0);
}

#[test]
fn test_attach_waits_for_association() {
    let _ = env_logger::try_init();
    let mut ctx = TestContext::unassociated(1);

    let out = ctx.gw.handle(create_session_request(imsi(4), 0x400, 1), ctx.now);
    assert!(out.is_empty());
    assert_eq!(ctx.pdns()[0].state, SessState::AssociationRequested);

    let out = ctx.start();
    let (_, rsp) = create_session_response(&out);
    assert_eq!(rsp.cause, gtp_cause::REQUEST_ACCEPTED);
    assert_eq!(ctx.pdns()[0].state, SessState::Connected);
}

#[test]
fn test_service_request_and_release_access_bearers() {
    let _ = env_logger::try_init();
    let mut ctx = TestContext::new(1, false);
    let teid = ctx.attach(imsi(5), 0x500);

    let seq = ctx.next_seq();
    let out = ctx.send(s11(teid, seq, GtpBody::ReleaseAccessBearersRequest));
    assert_eq!(
        cause_of(&out, GtpMessageType::ReleaseAccessBearersResponse),
        Some(gtp_cause::REQUEST_ACCEPTED)
    );

    let seq = ctx.next_seq();
    let request = GtpBody::ModifyBearerRequest(ModifyBearerRequest {
        bearer_contexts: vec![BearerContext {
            s1u_enb: Some(FTeid::new(0x77, enb_addr())),
            ..BearerContext::new(5)
        }],
        ..Default::default()
    });
    let out = ctx.send(s11(teid, seq, request));
    assert_eq!(cause_of(&out, GtpMessageType::ModifyBearerResponse), Some(gtp_cause::REQUEST_ACCEPTED));
    assert_eq!(ctx.pdns()[0].state, SessState::Connected);
    assert_eq!(ctx.pending_records(), 0);
}

#[test]
fn test_downlink_data_pages_idle_ue_once() {
    let _ = env_logger::try_init();
    let mut ctx = TestContext::new(1, false);
    let teid = ctx.attach(imsi(9), 0x900);
    let seq = ctx.next_seq();
    ctx.send(s11(teid, seq, GtpBody::ReleaseAccessBearersRequest));
    assert_eq!(ctx.pdns()[0].state, SessState::IdleMode);

    let seid = ctx.pdns()[0].seid;
    let report = |seq: u32| Envelope::Pfcp {
        peer: upf_addr(),
        msg: PfcpMessage::new(
            Some(seid),
            Seq24::new(seq),
            PfcpBody::SessionReportRequest(SessionReport::DownlinkData { pdr_id: 1 }),
        ),
    };

    let out = ctx.gw.handle(report(900), ctx.now);
    assert_eq!(pfcp_count(&out, PfcpMessageType::SessionReportResponse), 1);
    let notifications = gtp_of(&out, GtpMessageType::DownlinkDataNotification);
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].teid, 0x900);

    // no second page until the MME acknowledged the first
    let again = ctx.gw.handle(report(901), ctx.now);
    assert_eq!(pfcp_count(&again, PfcpMessageType::SessionReportResponse), 1);
    assert!(gtp_of(&again, GtpMessageType::DownlinkDataNotification).is_empty());

    let notification = out
        .iter()
        .find(|o| o.gtp_type() == Some(GtpMessageType::DownlinkDataNotification))
        .cloned()
        .expect("Downlink Data Notification");
    let ack = ctx.peers.answer(&notification).expect("Downlink Data Notification Ack");
    ctx.gw.handle(ack, ctx.now);

    let out = ctx.gw.handle(report(902), ctx.now);
    assert_eq!(gtp_of(&out, GtpMessageType::DownlinkDataNotification).len(), 1);
    assert_eq!(ctx.pdns()[0].state, SessState::IdleMode);
}

#[test]
fn test_retransmitted_create_session_gets_same_answer() {
    let _ = env_logger::try_init();
    let mut ctx = TestContext::new(4, false);
    let request = create_session_request(imsi(6), 0x600, 9);

    let first = ctx.send(request.clone());
    assert_eq!(gtp_of(&first, GtpMessageType::CreateSessionResponse).len(), 1);

    let again = ctx.gw.handle(request, ctx.now);
    assert_eq!(again, first);
    assert_eq!(ctx.pdn_count(), 1);
    assert_eq!(ctx.peers.up_session_count(), 1);
}

#[test]
fn test_change_notification_for_unknown_imsi() {
    let _ = env_logger::try_init();
    let mut ctx = TestContext::new(4, false);
    ctx.attach(imsi(7), 0x700);

    let out = ctx.gw.handle(change_notification_request(imsi(8), 3), ctx.now);
    assert_eq!(out.len(), 1);
    assert_eq!(
        cause_of(&out, GtpMessageType::ChangeNotificationResponse),
        Some(gtp_cause::IMSI_IMEI_NOT_KNOWN)
    );
    assert_eq!(ctx.pdn_count(), 1);
    assert_eq!(ctx.ue_count(), 1);
    assert_eq!(ctx.pending_records(), 0);
}

#[tokio::test]
async fn test_spawned_gateway_answers_echo() {
    let _ = env_logger::try_init();
    let gw = Gateway::new(SaegwcConfig::default(), 3, 100).expect("gateway");
    let shutdown = Arc::new(AtomicBool::new(false));
    let mut handle = gw.spawn(shutdown, Duration::from_millis(10));
    let mut outbound = handle.take_outbound().expect("outbound receiver");
    assert!(handle.take_outbound().is_none());

    handle
        .sender()
        .send(s11(0, 77, GtpBody::EchoRequest { recovery: 1 }))
        .expect("gateway running");
    let answer = tokio::time::timeout(Duration::from_secs(2), async {
        while let Some(message) = outbound.recv().await {
            if message.gtp_type() == Some(GtpMessageType::EchoResponse) {
                return Some(message);
            }
        }
        None
    })
    .await
    .expect("echo answered in time")
    .expect("echo response");
    assert_eq!(answer.seq(), Some(Seq24::new(77)));

    handle.shutdown().await;
}
