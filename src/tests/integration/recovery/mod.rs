//! Peer recovery integration tests
//!
//! UPF heartbeat loss, PFCP Session Set Deletion and GTP Delete PDN
//! Connection Set each release exactly the sessions bound to the failed
//! peer and clean up their CSID records.

use nextgcore_saegwcd::message::{
    DeletePdnConnectionSetRequest, Envelope, GtpBody, GtpMessageType, PfcpBody, PfcpMessage, PfcpMessageType,
    SessionSetDeletionRequest,
};
use nextgcore_saegwcd::types::{gtp_cause, pfcp_cause, FqCsid, PeerKind};
use nextgcore_saegwcd::xact::Seq24;

use crate::common::{gtp_of, imsi, mme_addr, pfcp_count, s11, upf_addr, TestContext};

/// Three sessions on one partition: two under UPF CSID 1, one under CSID 2
fn three_sessions_two_csids(ctx: &mut TestContext) {
    ctx.peers.upf_csid = Some(1);
    ctx.attach(imsi(21), 0x2100);
    ctx.attach(imsi(22), 0x2200);
    ctx.peers.upf_csid = Some(2);
    ctx.attach(imsi(23), 0x2300);

    let tables = ctx.gw.partition(0).expect("partition").tables();
    assert_eq!(tables.csids.record_count(), 2);
    assert_eq!(tables.csids.record(upf_addr(), 1).map(|r| r.sessions.len()), Some(2));
    assert_eq!(tables.csids.record(upf_addr(), 2).map(|r| r.sessions.len()), Some(1));
    let listed: Vec<u64> = tables.csids.sessions_for(upf_addr()).collect();
    assert_eq!(listed.len(), 3);
}

#[test]
fn test_upf_heartbeat_loss_releases_bound_sessions() {
    let _ = env_logger::try_init();
    let mut ctx = TestContext::unassociated(1);
    ctx.start();
    assert!(ctx.gw.shared().is_associated(upf_addr()));
    three_sessions_two_csids(&mut ctx);
    assert_eq!(ctx.pdn_count(), 3);

    // heartbeats go unanswered from now on; the MME keeps answering echoes
    ctx.peers.upf_silent = true;
    let out = ctx.advance(80);
    assert!(pfcp_count(&out, PfcpMessageType::HeartbeatRequest) >= 1);
    assert!(!ctx.gw.shared().is_associated(upf_addr()));

    assert_eq!(ctx.pdn_count(), 0);
    assert_eq!(ctx.ue_count(), 0);
    assert_eq!(ctx.csid_records(), 0);
    assert_eq!(ctx.pending_records(), 0);
    assert_eq!(pfcp_count(&out, PfcpMessageType::SessionDeletionRequest), 0);
    let mme = ctx.gw.peers().get(mme_addr(), PeerKind::Mme).expect("MME record");
    assert!(mme.is_reachable());

    // the MME hears about every released connection exactly once
    let mut released = ctx.peers.mme_releases.clone();
    released.sort_unstable();
    assert_eq!(released, vec![0x2100, 0x2200, 0x2300]);
}

#[test]
fn test_session_set_deletion_releases_listed_csid() {
    let _ = env_logger::try_init();
    let mut ctx = TestContext::new(1, false);
    three_sessions_two_csids(&mut ctx);

    let request = Envelope::Pfcp {
        peer: upf_addr(),
        msg: PfcpMessage::new(
            None,
            Seq24::new(500),
            PfcpBody::SessionSetDeletionRequest(SessionSetDeletionRequest {
                node: upf_addr(),
                fqcsids: vec![FqCsid::new(upf_addr(), vec![1])],
            }),
        ),
    };
    let out = ctx.send(request);
    assert!(out.iter().any(|o| matches!(
        o,
        Envelope::Pfcp { msg, .. }
            if msg.body == PfcpBody::SessionSetDeletionResponse { cause: pfcp_cause::REQUEST_ACCEPTED }
    )));

    assert_eq!(ctx.pdn_count(), 1);
    let tables = ctx.gw.partition(0).expect("partition").tables();
    assert!(tables.csids.record(upf_addr(), 1).is_none());
    assert_eq!(tables.csids.record(upf_addr(), 2).map(|r| r.sessions.len()), Some(1));
    assert_eq!(ctx.pending_records(), 0);
    let mut released = ctx.peers.mme_releases.clone();
    released.sort_unstable();
    assert_eq!(released, vec![0x2100, 0x2200]);
}

#[test]
fn test_delete_pdn_connection_set_from_mme() {
    let _ = env_logger::try_init();
    let mut ctx = TestContext::new(1, false);
    ctx.attach_with_csid(imsi(31), 0x3100, Some(7));
    ctx.attach_with_csid(imsi(32), 0x3200, Some(7));
    let kept = ctx.attach_with_csid(imsi(33), 0x3300, Some(8));
    assert_eq!(ctx.peers.up_session_count(), 3);

    let request = s11(
        0,
        600,
        GtpBody::DeletePdnConnectionSetRequest(DeletePdnConnectionSetRequest {
            fqcsids: vec![FqCsid::new(mme_addr(), vec![7])],
        }),
    );
    let out = ctx.send(request);
    let answers = gtp_of(&out, GtpMessageType::DeletePdnConnectionSetResponse);
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].body.cause(), Some(gtp_cause::REQUEST_ACCEPTED));

    // user plane sessions of the released connections are deleted at the UPF
    assert_eq!(ctx.peers.up_session_count(), 1);
    assert_eq!(ctx.pdn_count(), 1);
    assert_eq!(ctx.ue_count(), 1);
    assert!(ctx.gw.shared().identities.lookup(&nextgcore_saegwcd::identity::IdentityKey::Teid(kept)).is_some());
    // the MME asked for the release itself
    assert!(ctx.peers.mme_releases.is_empty());
    assert_eq!(ctx.pending_records(), 0);
}
