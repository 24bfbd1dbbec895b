//! Dedicated bearer integration tests
//!
//! PCRF-initiated activation, modification and removal of dedicated
//! bearers, and the MME-commanded deletion of two bearers at once.

use nextgcore_saegwcd::message::{
    CcRequestType, ChargingRule, Envelope, GtpBody, GtpMessageType, GxBody, GxMessage, PfcpMessageType,
    ReAuthRequest,
};
use nextgcore_saegwcd::types::{gx_result, BearerQos, Ebi};
use nextgcore_saegwcd::{Inbound, Outbound};

use crate::common::{delete_bearer_command, gtp_of, imsi, pfcp_count, re_auth_answers, TestContext};

fn rule(name: &str, qci: u8, precedence: u32) -> ChargingRule {
    ChargingRule {
        name: name.to_string(),
        qos: BearerQos::non_gbr(qci, 9),
        precedence,
        flows: vec![format!("permit out 17 from any to assigned {}", 5000 + precedence)],
    }
}

fn re_auth(session_id: &str, hop_by_hop: u32, rar: ReAuthRequest) -> Inbound {
    Envelope::Gx {
        msg: GxMessage {
            session_id: session_id.to_string(),
            hop_by_hop,
            body: GxBody::ReAuthRequest(rar),
        },
    }
}

/// Attached UE with two dedicated bearers installed by the PCRF
fn with_dedicated_bearers() -> (TestContext, u32, String) {
    let mut ctx = TestContext::new(1, true);
    let teid = ctx.attach(imsi(10), 0x1000);
    let session_id = ctx.peers.gx_sessions[0].clone();

    let rar = ReAuthRequest {
        installs: vec![rule("video", 6, 10), rule("gaming", 8, 20)],
        ..Default::default()
    };
    let out = ctx.send(re_auth(&session_id, 0x77, rar));
    let answers = re_auth_answers(&out);
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].result_code, gx_result::SUCCESS);
    (ctx, teid, session_id)
}

fn bearer_qci(ctx: &TestContext, ebi: u8) -> Option<u8> {
    let tables = ctx.gw.partition(0)?.tables();
    let (_, pdn) = tables.graph.pdns().next()?;
    let bearer = pdn.bearer(Ebi::new(ebi).ok()?)?;
    tables.graph.bearer(bearer).map(|b| b.qos.qci)
}

fn of_type<'a>(out: &'a [Outbound], message: PfcpMessageType) -> Vec<&'a Outbound> {
    out.iter().filter(|o| o.pfcp_type() == Some(message)).collect()
}

fn ccrs(out: &[Outbound]) -> Vec<&Outbound> {
    out.iter()
        .filter(|o| matches!(o, Envelope::Gx { msg } if matches!(msg.body, GxBody::CreditControlRequest(_))))
        .collect()
}

#[test]
fn test_pcrf_installs_dedicated_bearers() {
    let _ = env_logger::try_init();
    let (ctx, _, _) = with_dedicated_bearers();

    let pdns = ctx.pdns();
    assert_eq!(pdns.len(), 1);
    assert_eq!(pdns[0].bearers, 3);
    assert_eq!(bearer_qci(&ctx, 6), Some(6));
    assert_eq!(bearer_qci(&ctx, 7), Some(8));
    assert_eq!(ctx.pending_records(), 0);
}

#[test]
fn test_pcrf_changes_bearer_qos() {
    let _ = env_logger::try_init();
    let (mut ctx, _, session_id) = with_dedicated_bearers();

    let rar = ReAuthRequest {
        installs: vec![rule("video", 7, 10)],
        ..Default::default()
    };
    let out = ctx.send(re_auth(&session_id, 0x78, rar));
    let answers = re_auth_answers(&out);
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].result_code, gx_result::SUCCESS);
    assert_eq!(bearer_qci(&ctx, 6), Some(7));
    assert_eq!(ctx.pdns()[0].bearers, 3);
}

#[test]
fn test_pcrf_removes_dedicated_bearer() {
    let _ = env_logger::try_init();
    let (mut ctx, _, session_id) = with_dedicated_bearers();

    let rar = ReAuthRequest {
        removes: vec!["video".to_string()],
        ..Default::default()
    };
    let out = ctx.send(re_auth(&session_id, 0x79, rar));
    let answers = re_auth_answers(&out);
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].result_code, gx_result::SUCCESS);
    assert_eq!(ctx.pdns()[0].bearers, 2);
    assert_eq!(bearer_qci(&ctx, 6), None);
    assert_eq!(bearer_qci(&ctx, 7), Some(8));
    assert_eq!(ctx.pending_records(), 0);
}

#[test]
fn test_delete_bearer_command_reports_both_rules_to_pcrf() {
    let _ = env_logger::try_init();
    let (mut ctx, teid, _) = with_dedicated_bearers();
    let now = ctx.now;

    let out = ctx.gw.handle(delete_bearer_command(teid, 40, &[6, 7]), now);
    let requests = gtp_of(&out, GtpMessageType::DeleteBearerRequest);
    assert_eq!(requests.len(), 1);
    match &requests[0].body {
        GtpBody::DeleteBearerRequest(req) => {
            assert_eq!(req.linked_ebi, None);
            assert_eq!(req.ebis, vec![6, 7]);
        }
        other => panic!("unexpected {other:?}"),
    }

    // both bearers leave the graph with the Delete Bearer Response
    let request = out
        .iter()
        .find(|o| o.gtp_type() == Some(GtpMessageType::DeleteBearerRequest))
        .cloned()
        .expect("Delete Bearer Request");
    let answer = ctx.peers.answer(&request).expect("Delete Bearer Response");
    let out = ctx.gw.handle(answer, now);
    assert_eq!(ctx.pdns()[0].bearers, 1);
    assert_eq!(of_type(&out, PfcpMessageType::SessionModificationRequest).len(), 1);
    let updates = ccrs(&out);
    assert_eq!(updates.len(), 1);
    let Envelope::Gx { msg } = updates[0] else {
        panic!("not Gx");
    };
    let GxBody::CreditControlRequest(ccr) = &msg.body else {
        panic!("not a CCR");
    };
    assert_eq!(ccr.request_type, CcRequestType::Update);
    let mut names: Vec<&str> = ccr.rule_reports.iter().map(|r| r.name.as_str()).collect();
    names.sort_unstable();
    assert_eq!(names, vec!["gaming", "video"]);
    assert!(ccr.rule_reports.iter().all(|r| !r.active));

    // the record stays until the Gx leg is done as well
    let modification = of_type(&out, PfcpMessageType::SessionModificationRequest)[0].clone();
    let answer = ctx.peers.answer(&modification).expect("Session Modification Response");
    assert!(ctx.gw.handle(answer, now).is_empty());
    assert_eq!(ctx.pending_records(), 1);

    let update = updates[0].clone();
    let answer = ctx.peers.answer(&update).expect("CCA-Update");
    let out = ctx.gw.handle(answer, now);
    assert_eq!(pfcp_count(&out, PfcpMessageType::SessionModificationRequest), 0);
    assert!(gtp_of(&out, GtpMessageType::DeleteBearerFailureIndication).is_empty());
    assert_eq!(ctx.pending_records(), 0);
    assert_eq!(ctx.pdns()[0].bearers, 1);
}
