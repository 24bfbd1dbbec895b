//! Session Correlation Store
//!
//! At most one live record per PFCP SEID. A record carries the procedure
//! scratch state ([`RequestDescriptor`]), the inbound request to answer when
//! the procedure finishes ([`Origin`]), the completion state of every leg
//! and the outbound requests still waiting for an answer.

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;

use crate::error::{SaegwcError, SaegwcResult};
use crate::event::{Procedure, SessState};
use crate::message::{
    BearerContext, BearerResourceCommand, CreateSessionRequest, Envelope, GtpBody, GtpMessageType,
    GxBody, Outbound,
};
use crate::types::{gtp_cause, BearerQos, Ebi, FTeid, GtpInterface, Imsi};
use crate::xact::Seq24;

// ============================================================================
// Legs
// ============================================================================

/// Downstream protocol leg of a procedure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Leg {
    /// PFCP toward the user plane
    Sx,
    /// Diameter toward the PCRF
    Gx,
    /// GTPv2-C toward the PGW (SGW-C only)
    S5s8,
    /// GTPv2-C toward the access peer (MME, or SGW at a PGW-C)
    Access,
}

impl Leg {
    pub fn name(&self) -> &'static str {
        match self {
            Leg::Sx => "Sx",
            Leg::Gx => "Gx",
            Leg::S5s8 => "S5/S8",
            Leg::Access => "Access",
        }
    }
}

/// Completion status of one leg
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegStatus {
    Pending,
    Done,
    Failed(u8),
    /// Not required any more (disabled, or the peer is gone)
    Excused,
}

/// Per-procedure leg bookkeeping
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LegTracker {
    legs: Vec<(Leg, LegStatus)>,
}

impl LegTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&mut self, leg: Leg, status: LegStatus) {
        match self.legs.iter_mut().find(|(l, _)| *l == leg) {
            Some(entry) => entry.1 = status,
            None => self.legs.push((leg, status)),
        }
    }

    /// Mark a leg as waiting for an answer
    pub fn require(&mut self, leg: Leg) {
        self.set(leg, LegStatus::Pending);
    }

    pub fn complete(&mut self, leg: Leg) {
        self.set(leg, LegStatus::Done);
    }

    pub fn fail(&mut self, leg: Leg, cause: u8) {
        self.set(leg, LegStatus::Failed(cause));
    }

    pub fn excuse(&mut self, leg: Leg) {
        self.set(leg, LegStatus::Excused);
    }

    pub fn status(&self, leg: Leg) -> Option<LegStatus> {
        self.legs.iter().find(|(l, _)| *l == leg).map(|(_, s)| *s)
    }

    pub fn is_pending(&self, leg: Leg) -> bool {
        self.status(leg) == Some(LegStatus::Pending)
    }

    /// No leg is pending any more
    pub fn is_finished(&self) -> bool {
        self.legs.iter().all(|(_, s)| *s != LegStatus::Pending)
    }

    /// First failed leg and its cause
    pub fn first_failure(&self) -> Option<(Leg, u8)> {
        self.legs.iter().find_map(|(leg, s)| match s {
            LegStatus::Failed(cause) => Some((*leg, *cause)),
            _ => None,
        })
    }

    pub fn pending(&self) -> impl Iterator<Item = Leg> + '_ {
        self.legs
            .iter()
            .filter(|(_, s)| *s == LegStatus::Pending)
            .map(|(leg, _)| *leg)
    }
}

// ============================================================================
// Outbound Requests
// ============================================================================

/// Outbound request of a leg, as returned by a handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegRequest {
    pub leg: Leg,
    pub request: Outbound,
}

impl LegRequest {
    pub fn new(leg: Leg, request: Outbound) -> Self {
        Self { leg, request }
    }
}

/// Value an answer must echo to match its request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnswerKey {
    /// GTPv2-C and PFCP sequence number
    Seq(Seq24),
    /// Gx CC-Request-Number
    RequestNumber(u32),
}

impl AnswerKey {
    /// Key of an outbound request
    pub fn of_request(envelope: &Envelope) -> Option<Self> {
        match envelope {
            Envelope::Gtp { msg, .. } => Some(AnswerKey::Seq(msg.seq)),
            Envelope::Pfcp { msg, .. } => Some(AnswerKey::Seq(msg.seq)),
            Envelope::Gx { msg } => match &msg.body {
                GxBody::CreditControlRequest(ccr) => Some(AnswerKey::RequestNumber(ccr.request_number)),
                _ => None,
            },
        }
    }

    /// Key carried by an inbound answer
    pub fn of_answer(envelope: &Envelope) -> Option<Self> {
        match envelope {
            Envelope::Gtp { msg, .. } => Some(AnswerKey::Seq(msg.seq)),
            Envelope::Pfcp { msg, .. } => Some(AnswerKey::Seq(msg.seq)),
            Envelope::Gx { msg } => match &msg.body {
                GxBody::CreditControlAnswer(cca) => Some(AnswerKey::RequestNumber(cca.request_number)),
                _ => None,
            },
        }
    }
}

/// Outbound request waiting for its answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub leg: Leg,
    pub key: AnswerKey,
    /// Copy kept for retransmission
    pub request: Outbound,
    pub retries: u32,
    /// Retransmission timer key
    pub timer: Option<u64>,
}

// ============================================================================
// Procedure Scratch State
// ============================================================================

/// Remote access endpoint of a bearer before a procedure changed it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessSnapshot {
    pub ebi: Ebi,
    pub remote: Option<FTeid>,
}

/// Dedicated bearer activation phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationPhase {
    /// Rules installed on the user plane, access side not asked yet
    Install,
    /// Access side answered, downlink endpoints being committed
    Commit,
}

/// What started a bearer procedure, deciding how it is answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BearerTrigger {
    /// Re-Auth-Request from the PCRF, answered with RAA
    Pcrf,
    /// Bearer Resource Command, failures answered with a failure indication
    BearerResource { pti: u8 },
    /// Delete Bearer Command, failures answered with a failure indication
    Command,
    /// Request relayed from the PGW (SGW-C), answered toward the PGW
    Relay { pti: Option<u8> },
}

impl BearerTrigger {
    /// Procedure transaction id to echo toward the access side
    pub fn pti(&self) -> Option<u8> {
        match self {
            BearerTrigger::BearerResource { pti } => Some(*pti),
            BearerTrigger::Relay { pti } => *pti,
            BearerTrigger::Pcrf | BearerTrigger::Command => None,
        }
    }
}

/// Pending procedure state, one variant per procedure family
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestDescriptor {
    /// PDN setup; the original request is kept for forwarding and answering
    CreateSession { request: CreateSessionRequest },
    /// Handover Create Session on an existing PDN connection
    Relocation {
        request: CreateSessionRequest,
        previous: Vec<AccessSnapshot>,
        previous_sender: Option<FTeid>,
    },
    ModifyBearer {
        ebis: Vec<Ebi>,
        previous: Vec<AccessSnapshot>,
        previous_sender: Option<FTeid>,
    },
    ReleaseAccessBearers { previous: Vec<AccessSnapshot> },
    /// UE-initiated PDN release
    DeleteSession,
    /// Network-initiated PDN release (PCRF session release or relayed LBI delete)
    NetworkDetach,
    BearerActivation {
        ebis: Vec<Ebi>,
        phase: ActivationPhase,
        trigger: BearerTrigger,
        /// Rule names rejected by the access side
        rejected: Vec<String>,
    },
    BearerModification {
        previous: Vec<(Ebi, BearerQos)>,
        phase: ActivationPhase,
        trigger: BearerTrigger,
    },
    BearerDeactivation {
        ebis: Vec<Ebi>,
        rule_names: Vec<String>,
        trigger: BearerTrigger,
    },
    BearerResource { command: BearerResourceCommand },
    ChangeNotification { imsi: Option<Imsi> },
    /// Local teardown after peer failure or an error indication
    PeerCleanup { peer: Option<IpAddr> },
}

impl RequestDescriptor {
    pub fn name(&self) -> &'static str {
        match self {
            RequestDescriptor::CreateSession { .. } => "CreateSession",
            RequestDescriptor::Relocation { .. } => "Relocation",
            RequestDescriptor::ModifyBearer { .. } => "ModifyBearer",
            RequestDescriptor::ReleaseAccessBearers { .. } => "ReleaseAccessBearers",
            RequestDescriptor::DeleteSession => "DeleteSession",
            RequestDescriptor::NetworkDetach => "NetworkDetach",
            RequestDescriptor::BearerActivation { .. } => "BearerActivation",
            RequestDescriptor::BearerModification { .. } => "BearerModification",
            RequestDescriptor::BearerDeactivation { .. } => "BearerDeactivation",
            RequestDescriptor::BearerResource { .. } => "BearerResource",
            RequestDescriptor::ChangeNotification { .. } => "ChangeNotification",
            RequestDescriptor::PeerCleanup { .. } => "PeerCleanup",
        }
    }
}

/// Inbound request a procedure answers when it finishes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Gtp {
        peer: IpAddr,
        iface: GtpInterface,
        /// Peer TEID the answer is addressed to
        teid: u32,
        seq: Seq24,
        message: GtpMessageType,
    },
    Gx { session_id: String, hop_by_hop: u32 },
}

impl Origin {
    pub fn peer(&self) -> Option<IpAddr> {
        match self {
            Origin::Gtp { peer, .. } => Some(*peer),
            Origin::Gx { .. } => None,
        }
    }
}

// ============================================================================
// Correlation Record
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationRecord {
    pub procedure: Procedure,
    pub descriptor: RequestDescriptor,
    pub origin: Option<Origin>,
    /// Stable state to return to when the procedure ends without release
    pub resume: SessState,
    pub legs: LegTracker,
    pending: Vec<PendingRequest>,
}

impl CorrelationRecord {
    pub fn new(
        procedure: Procedure,
        descriptor: RequestDescriptor,
        origin: Option<Origin>,
        resume: SessState,
    ) -> Self {
        Self {
            procedure,
            descriptor,
            origin,
            resume,
            legs: LegTracker::new(),
            pending: Vec::new(),
        }
    }

    /// Track an outbound request; its leg becomes pending
    pub fn add_pending(&mut self, leg: Leg, request: Outbound) -> Option<&mut PendingRequest> {
        let key = AnswerKey::of_request(&request)?;
        self.legs.require(leg);
        self.pending.push(PendingRequest {
            leg,
            key,
            request,
            retries: 0,
            timer: None,
        });
        self.pending.last_mut()
    }

    /// Remove the pending request an answer belongs to
    pub fn take_matching(&mut self, leg: Leg, key: AnswerKey) -> Option<PendingRequest> {
        let index = self.pending.iter().position(|p| p.leg == leg && p.key == key)?;
        Some(self.pending.remove(index))
    }

    /// Remove every pending request of a leg
    pub fn drop_leg(&mut self, leg: Leg) -> Vec<PendingRequest> {
        let (dropped, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|p| p.leg == leg);
        self.pending = kept;
        dropped
    }

    pub fn pending(&self) -> &[PendingRequest] {
        &self.pending
    }

    pub fn pending_mut(&mut self) -> &mut [PendingRequest] {
        &mut self.pending
    }

    /// Drain all pending requests
    pub fn take_pending(&mut self) -> Vec<PendingRequest> {
        std::mem::take(&mut self.pending)
    }
}

/// Records keyed by SEID
#[derive(Debug, Default)]
pub struct CorrelationStore {
    records: HashMap<u64, CorrelationRecord>,
}

impl CorrelationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a record; fails while another one is live for the session
    pub fn begin(&mut self, seid: u64, record: CorrelationRecord) -> SaegwcResult<()> {
        if self.records.contains_key(&seid) {
            return Err(SaegwcError::AlreadyOutstanding { seid });
        }
        log::debug!(
            "[Correlation] begin SEID[0x{seid:016x}] {} {}",
            record.procedure.name(),
            record.descriptor.name()
        );
        self.records.insert(seid, record);
        Ok(())
    }

    /// Close the record of a session
    pub fn complete(&mut self, seid: u64) -> Option<CorrelationRecord> {
        let record = self.records.remove(&seid);
        if let Some(record) = &record {
            log::debug!(
                "[Correlation] complete SEID[0x{seid:016x}] {}",
                record.procedure.name()
            );
        }
        record
    }

    /// Descriptor of the outstanding request
    pub fn peek(&self, seid: u64) -> Option<&RequestDescriptor> {
        self.records.get(&seid).map(|r| &r.descriptor)
    }

    pub fn get(&self, seid: u64) -> Option<&CorrelationRecord> {
        self.records.get(&seid)
    }

    pub fn get_mut(&mut self, seid: u64) -> Option<&mut CorrelationRecord> {
        self.records.get_mut(&seid)
    }

    pub fn contains(&self, seid: u64) -> bool {
        self.records.contains_key(&seid)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn seids(&self) -> impl Iterator<Item = u64> + '_ {
        self.records.keys().copied()
    }
}

// ============================================================================
// UE-Level Aggregation
// ============================================================================

/// One answer for a request that touched several PDN connections
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UeAggregate {
    pub origin: Origin,
    /// SEIDs of the PDN connections still working
    pub waiting: BTreeSet<u64>,
    /// Worst cause seen so far
    pub cause: u8,
    pub bearer_contexts: Vec<BearerContext>,
}

impl UeAggregate {
    pub fn new(origin: Origin, seids: impl IntoIterator<Item = u64>) -> Self {
        Self {
            origin,
            waiting: seids.into_iter().collect(),
            cause: gtp_cause::REQUEST_ACCEPTED,
            bearer_contexts: Vec::new(),
        }
    }

    /// Fold one PDN connection's result in; true once all have reported
    pub fn complete(&mut self, seid: u64, cause: u8, contexts: Vec<BearerContext>) -> bool {
        if self.waiting.remove(&seid) {
            if !gtp_cause::is_accepted(cause) {
                self.cause = cause;
            }
            self.bearer_contexts.extend(contexts);
        }
        self.waiting.is_empty()
    }

    pub fn contains(&self, seid: u64) -> bool {
        self.waiting.contains(&seid)
    }

    /// Body of the aggregated answer
    pub fn answer(&self) -> Option<GtpBody> {
        let Origin::Gtp { message, .. } = &self.origin else {
            return None;
        };
        match message {
            GtpMessageType::ModifyBearerRequest => Some(GtpBody::ModifyBearerResponse(
                crate::message::ModifyBearerResponse {
                    cause: self.cause,
                    linked_ebi: None,
                    bearer_contexts: self.bearer_contexts.clone(),
                },
            )),
            GtpMessageType::ReleaseAccessBearersRequest => Some(GtpBody::ReleaseAccessBearersResponse(
                crate::message::ReleaseAccessBearersResponse { cause: self.cause },
            )),
            _ => None,
        }
    }
}
