//! Simulated MME, UPF and PCRF
//!
//! Each peer answers the requests the gateway sends it. Answers are fed
//! back into the gateway until it has nothing left to ask.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::Instant;

use nextgcore_saegwcd::message::{
    BearerContext, CreateBearerResponse, CreditControlAnswer, CreditControlRequest, DeleteBearerResponse, Envelope,
    GtpBody, GtpMessage, GxBody, GxMessage, PfcpBody, PfcpMessage, SessionEstablishmentResponse,
    UpdateBearerResponse,
};
use nextgcore_saegwcd::types::{gtp_cause, pfcp_cause, Csid, FTeid, FqCsid};
use nextgcore_saegwcd::{Gateway, Inbound, Outbound};

use super::message::{enb_addr, mme_addr, upf_addr};

/// Upper bound on messages exchanged by one settle run
const SETTLE_LIMIT: usize = 10_000;

/// Auto-answering peers of the gateway
#[derive(Debug)]
pub struct MockPeers {
    pub mme: IpAddr,
    pub upf: IpAddr,
    /// CSID the UPF reports for the next established sessions
    pub upf_csid: Option<Csid>,
    /// UPF ignores everything it receives
    pub upf_silent: bool,
    pub upf_recovery_ts: u32,
    /// Every CCR the PCRF received
    pub ccrs: Vec<CreditControlRequest>,
    /// Gx Session-Ids in the order they were opened
    pub gx_sessions: Vec<String>,
    /// MME TEIDs of PDN connections the gateway released toward the MME
    pub mme_releases: Vec<u32>,
    next_up_seid: u64,
    up_sessions: HashMap<u64, u64>,
    s11_teids: HashMap<u32, u32>,
}

impl MockPeers {
    pub fn new() -> Self {
        Self {
            mme: mme_addr(),
            upf: upf_addr(),
            upf_csid: None,
            upf_silent: false,
            upf_recovery_ts: 4242,
            ccrs: Vec::new(),
            gx_sessions: Vec::new(),
            mme_releases: Vec::new(),
            next_up_seid: 0x0100_0000_0000,
            up_sessions: HashMap::new(),
            s11_teids: HashMap::new(),
        }
    }

    /// Local S11 TEID the gateway assigned to an MME TEID
    pub fn local_s11_teid(&self, mme_teid: u32) -> Option<u32> {
        self.s11_teids.get(&mme_teid).copied()
    }

    /// User plane sessions the UPF currently holds
    pub fn up_session_count(&self) -> usize {
        self.up_sessions.len()
    }

    /// Feed outputs and answers back into the gateway until it goes quiet;
    /// returns everything that was not answered (responses, RAAs, unanswered requests)
    pub fn settle(&mut self, gw: &mut Gateway, out: Vec<Outbound>, now: Instant) -> Vec<Outbound> {
        let mut queue: VecDeque<Outbound> = out.into();
        let mut collected = Vec::new();
        let mut exchanged = 0;
        while let Some(message) = queue.pop_front() {
            exchanged += 1;
            assert!(exchanged < SETTLE_LIMIT, "gateway never settled");
            self.learn(&message);
            match self.answer(&message) {
                Some(answer) => queue.extend(gw.handle(answer, now)),
                None => collected.push(message),
            }
        }
        collected
    }

    /// Record the TEID mapping a Create Session Response announces
    pub fn learn(&mut self, out: &Outbound) {
        if let Envelope::Gtp { msg, .. } = out {
            if let GtpBody::CreateSessionResponse(rsp) = &msg.body {
                if let Some(fteid) = rsp.sender_fteid {
                    self.s11_teids.insert(msg.teid, fteid.teid);
                }
            }
        }
    }

    /// Answer a request sent by the gateway
    pub fn answer(&mut self, out: &Outbound) -> Option<Inbound> {
        match out {
            Envelope::Gtp { peer, iface, msg } if *peer == self.mme => {
                let (teid, body) = self.answer_mme(msg)?;
                Some(Envelope::Gtp {
                    peer: *peer,
                    iface: *iface,
                    msg: GtpMessage::new(teid, msg.seq, body),
                })
            }
            Envelope::Pfcp { peer, msg } if *peer == self.upf && !self.upf_silent => {
                let msg = self.answer_upf(msg)?;
                Some(Envelope::Pfcp { peer: *peer, msg })
            }
            Envelope::Gx { msg } => self.answer_pcrf(msg).map(|msg| Envelope::Gx { msg }),
            _ => None,
        }
    }

    fn answer_mme(&mut self, msg: &GtpMessage) -> Option<(u32, GtpBody)> {
        let accepted = gtp_cause::REQUEST_ACCEPTED;
        let accept = |ebi: u8| BearerContext {
            cause: Some(accepted),
            ..BearerContext::new(ebi)
        };
        if let GtpBody::EchoRequest { .. } = msg.body {
            return Some((0, GtpBody::EchoResponse { recovery: 1 }));
        }
        let teid = self.local_s11_teid(msg.teid)?;
        if let GtpBody::DeleteBearerRequest(req) = &msg.body {
            if req.linked_ebi.is_some() {
                self.mme_releases.push(msg.teid);
            }
        }
        let body = match &msg.body {
            GtpBody::CreateBearerRequest(req) => GtpBody::CreateBearerResponse(CreateBearerResponse {
                cause: accepted,
                bearer_contexts: req
                    .bearer_contexts
                    .iter()
                    .map(|bc| BearerContext {
                        s1u_enb: Some(FTeid::new(0x5000 + u32::from(bc.ebi), enb_addr())),
                        ..accept(bc.ebi)
                    })
                    .collect(),
            }),
            GtpBody::UpdateBearerRequest(req) => GtpBody::UpdateBearerResponse(UpdateBearerResponse {
                cause: accepted,
                bearer_contexts: req.bearer_contexts.iter().map(|bc| accept(bc.ebi)).collect(),
            }),
            GtpBody::DeleteBearerRequest(req) => GtpBody::DeleteBearerResponse(DeleteBearerResponse {
                cause: accepted,
                linked_ebi: req.linked_ebi,
                bearer_contexts: req.ebis.iter().map(|ebi| accept(*ebi)).collect(),
            }),
            GtpBody::DownlinkDataNotification(_) => GtpBody::DownlinkDataNotificationAck { cause: accepted },
            _ => return None,
        };
        Some((teid, body))
    }

    fn answer_upf(&mut self, msg: &PfcpMessage) -> Option<PfcpMessage> {
        let accepted = pfcp_cause::REQUEST_ACCEPTED;
        let (seid, body) = match &msg.body {
            PfcpBody::HeartbeatRequest { .. } => (
                None,
                PfcpBody::HeartbeatResponse {
                    recovery_ts: self.upf_recovery_ts,
                },
            ),
            PfcpBody::AssociationSetupRequest { .. } => (
                None,
                PfcpBody::AssociationSetupResponse {
                    node: self.upf,
                    cause: accepted,
                    recovery_ts: self.upf_recovery_ts,
                },
            ),
            PfcpBody::SessionEstablishmentRequest(req) => {
                self.next_up_seid += 1;
                let up_seid = self.next_up_seid;
                self.up_sessions.insert(up_seid, req.cp_seid);
                (
                    Some(req.cp_seid),
                    PfcpBody::SessionEstablishmentResponse(SessionEstablishmentResponse {
                        cause: accepted,
                        up_seid: Some(up_seid),
                        up_fqcsid: self.upf_csid.map(|csid| FqCsid::new(self.upf, vec![csid])),
                    }),
                )
            }
            PfcpBody::SessionModificationRequest(_) => {
                let cp_seid = self.up_sessions.get(&msg.seid?).copied()?;
                (Some(cp_seid), PfcpBody::SessionModificationResponse { cause: accepted })
            }
            PfcpBody::SessionDeletionRequest => {
                let cp_seid = self.up_sessions.remove(&msg.seid?)?;
                (Some(cp_seid), PfcpBody::SessionDeletionResponse { cause: accepted })
            }
            _ => return None,
        };
        Some(PfcpMessage::new(seid, msg.seq, body))
    }

    fn answer_pcrf(&mut self, msg: &GxMessage) -> Option<GxMessage> {
        let GxBody::CreditControlRequest(ccr) = &msg.body else {
            return None;
        };
        if !self.gx_sessions.contains(&msg.session_id) {
            self.gx_sessions.push(msg.session_id.clone());
        }
        self.ccrs.push(ccr.clone());
        Some(GxMessage {
            session_id: msg.session_id.clone(),
            hop_by_hop: msg.hop_by_hop,
            body: GxBody::CreditControlAnswer(CreditControlAnswer::success(ccr.request_type, ccr.request_number)),
        })
    }
}

impl Default for MockPeers {
    fn default() -> Self {
        Self::new()
    }
}
