//! Gx Message Builder
//!
//! Credit-Control requests toward the PCRF and Re-Auth answers.

use std::net::Ipv4Addr;

use bytes::Bytes;

use crate::correlation::Origin;
use crate::message::{
    CcRequestType, CreditControlRequest, Envelope, GxBody, GxMessage, Outbound, ReAuthAnswer,
    RuleReport,
};
use crate::types::{BearerQos, Ebi, Imsi};

/// Gx Session-Id of a PDN connection
pub fn session_id(origin_host: &str, teid: u32, default_ebi: Ebi) -> String {
    format!("{};{};{}", origin_host, teid, default_ebi.value())
}

pub fn build_message(session_id: &str, hop_by_hop: u32, body: GxBody) -> Outbound {
    Envelope::Gx {
        msg: GxMessage {
            session_id: session_id.to_string(),
            hop_by_hop,
            body,
        },
    }
}

fn ccr(request_type: CcRequestType, request_number: u32) -> CreditControlRequest {
    CreditControlRequest {
        request_type,
        request_number,
        imsi: None,
        apn: None,
        ue_ip: None,
        default_qos: None,
        rule_reports: Vec::new(),
        tad: None,
        uli: None,
    }
}

/// Build CCR-Initial
#[allow(clippy::too_many_arguments)]
pub fn build_ccr_initial(
    session_id: &str,
    hop_by_hop: u32,
    request_number: u32,
    imsi: &Imsi,
    apn: &str,
    ue_ip: Option<Ipv4Addr>,
    default_qos: Option<BearerQos>,
    uli: Option<Bytes>,
) -> Outbound {
    let req = CreditControlRequest {
        imsi: Some(imsi.clone()),
        apn: Some(apn.to_string()),
        ue_ip,
        default_qos,
        uli,
        ..ccr(CcRequestType::Initial, request_number)
    };
    log::debug!("Built CCR-I Session-Id[{session_id}] CC-Request-Number[{request_number}]");
    build_message(session_id, hop_by_hop, GxBody::CreditControlRequest(req))
}

/// Build CCR-Update reporting rule state, a bearer resource request or a
/// location change
pub fn build_ccr_update(
    session_id: &str,
    hop_by_hop: u32,
    request_number: u32,
    rule_reports: Vec<RuleReport>,
    tad: Option<Bytes>,
    uli: Option<Bytes>,
) -> Outbound {
    let req = CreditControlRequest {
        rule_reports,
        tad,
        uli,
        ..ccr(CcRequestType::Update, request_number)
    };
    log::debug!("Built CCR-U Session-Id[{session_id}] CC-Request-Number[{request_number}]");
    build_message(session_id, hop_by_hop, GxBody::CreditControlRequest(req))
}

/// Build CCR-Termination
pub fn build_ccr_termination(session_id: &str, hop_by_hop: u32, request_number: u32) -> Outbound {
    log::debug!("Built CCR-T Session-Id[{session_id}] CC-Request-Number[{request_number}]");
    build_message(
        session_id,
        hop_by_hop,
        GxBody::CreditControlRequest(ccr(CcRequestType::Termination, request_number)),
    )
}

/// Build Re-Auth-Answer for the RAR recorded in `origin`
pub fn build_raa(origin: &Origin, result_code: u32, rule_reports: Vec<RuleReport>) -> Option<Outbound> {
    let Origin::Gx {
        session_id,
        hop_by_hop,
    } = origin
    else {
        return None;
    };
    log::debug!("Built RAA Session-Id[{session_id}] Result-Code[{result_code}]");
    Some(build_message(
        session_id,
        *hop_by_hop,
        GxBody::ReAuthAnswer(ReAuthAnswer {
            result_code,
            rule_reports,
        }),
    ))
}

/// Charging-Rule-Report entries for a set of rule names
pub fn build_rule_reports(names: &[String], active: bool, failure_code: Option<u32>) -> Vec<RuleReport> {
    names
        .iter()
        .map(|name| RuleReport {
            name: name.clone(),
            active,
            failure_code,
        })
        .collect()
}
