//! SAEGW-C Procedure, State and Event Definitions
//!
//! The three axes of the dispatch table, plus the session-level event
//! envelope delivered to handlers.

use std::net::IpAddr;

use crate::message::{Envelope, GtpBody, GxBody, PfcpBody};
use crate::correlation::Leg;
use crate::types::{Csid, PeerKind};

// ============================================================================
// Procedure
// ============================================================================

/// EPC procedure a session is executing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Procedure {
    /// Create Session without handover indication or eNB endpoint
    InitialAttach,
    /// Create Session or Modify Bearer carrying an eNB S1-U endpoint
    ServiceRequest,
    /// Create Session or Modify Bearer with the handover indication set
    Handover,
    /// Signalling-only Modify Bearer
    ModifyBearer,
    ReleaseAccessBearers,
    /// PDN connection release, UE or network initiated
    Detach,
    DedicatedBearerActivation,
    BearerModification,
    DedicatedBearerDeactivation,
    UeRequestedBearerResource,
    ChangeNotification,
    /// Downlink data report toward an idle UE
    NetworkTriggeredServiceRequest,
    /// Cleanup after peer death, restart or connection-set deletion
    PeerRecovery,
}

impl Procedure {
    /// Every procedure, for table validation
    pub const ALL: [Procedure; 13] = [
        Procedure::InitialAttach,
        Procedure::ServiceRequest,
        Procedure::Handover,
        Procedure::ModifyBearer,
        Procedure::ReleaseAccessBearers,
        Procedure::Detach,
        Procedure::DedicatedBearerActivation,
        Procedure::BearerModification,
        Procedure::DedicatedBearerDeactivation,
        Procedure::UeRequestedBearerResource,
        Procedure::ChangeNotification,
        Procedure::NetworkTriggeredServiceRequest,
        Procedure::PeerRecovery,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Procedure::InitialAttach => "INITIAL_ATTACH",
            Procedure::ServiceRequest => "SERVICE_REQUEST",
            Procedure::Handover => "HANDOVER",
            Procedure::ModifyBearer => "MODIFY_BEARER",
            Procedure::ReleaseAccessBearers => "RELEASE_ACCESS_BEARERS",
            Procedure::Detach => "DETACH",
            Procedure::DedicatedBearerActivation => "DEDICATED_BEARER_ACTIVATION",
            Procedure::BearerModification => "BEARER_MODIFICATION",
            Procedure::DedicatedBearerDeactivation => "DEDICATED_BEARER_DEACTIVATION",
            Procedure::UeRequestedBearerResource => "UE_REQUESTED_BEARER_RESOURCE",
            Procedure::ChangeNotification => "CHANGE_NOTIFICATION",
            Procedure::NetworkTriggeredServiceRequest => "NETWORK_TRIGGERED_SERVICE_REQUEST",
            Procedure::PeerRecovery => "PEER_RECOVERY",
        }
    }

    /// Procedures that end with the PDN connection released
    pub fn is_teardown(&self) -> bool {
        matches!(self, Procedure::Detach | Procedure::PeerRecovery)
    }
}

// ============================================================================
// State
// ============================================================================

/// Per-PDN session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessState {
    /// No session yet
    Idle,
    /// Waiting for PFCP association with the selected user plane
    AssociationRequested,
    /// PFCP establishment sent
    SessionEstablishRequested,
    /// PFCP session up, other legs still pending
    SessionEstablished,
    /// Create Session forwarded to the PGW
    CreateSessionRequested,
    /// PFCP modification sent
    ModifyRequested,
    /// Create, Update or Delete Bearer Request sent toward the access side
    BearerRequested,
    /// CCR-Update sent
    PolicyRequested,
    /// Request relayed to the PGW
    ForwardRequested,
    /// Teardown in progress
    DeleteRequested,
    Connected,
    /// Access bearers released, downlink buffered
    IdleMode,
    /// Rolling back a failed setup
    ErrorOccurred,
    /// Session released
    Terminal,
}

impl SessState {
    pub const ALL: [SessState; 14] = [
        SessState::Idle,
        SessState::AssociationRequested,
        SessState::SessionEstablishRequested,
        SessState::SessionEstablished,
        SessState::CreateSessionRequested,
        SessState::ModifyRequested,
        SessState::BearerRequested,
        SessState::PolicyRequested,
        SessState::ForwardRequested,
        SessState::DeleteRequested,
        SessState::Connected,
        SessState::IdleMode,
        SessState::ErrorOccurred,
        SessState::Terminal,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SessState::Idle => "IDLE",
            SessState::AssociationRequested => "ASSOCIATION_REQUESTED",
            SessState::SessionEstablishRequested => "SESSION_ESTABLISH_REQUESTED",
            SessState::SessionEstablished => "SESSION_ESTABLISHED",
            SessState::CreateSessionRequested => "CREATE_SESSION_REQUESTED",
            SessState::ModifyRequested => "MODIFY_REQUESTED",
            SessState::BearerRequested => "BEARER_REQUESTED",
            SessState::PolicyRequested => "POLICY_REQUESTED",
            SessState::ForwardRequested => "FORWARD_REQUESTED",
            SessState::DeleteRequested => "DELETE_REQUESTED",
            SessState::Connected => "CONNECTED",
            SessState::IdleMode => "IDLE_MODE",
            SessState::ErrorOccurred => "ERROR_OCCURRED",
            SessState::Terminal => "TERMINAL",
        }
    }

    /// Stable states in which no procedure is running
    pub fn is_stable(&self) -> bool {
        matches!(self, SessState::Connected | SessState::IdleMode)
    }

    /// States in which a live PDN connection exists
    pub fn is_live(&self) -> bool {
        !matches!(self, SessState::Idle | SessState::Terminal)
    }
}

// ============================================================================
// Event
// ============================================================================

/// Triggering event kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    CsReqRcvd,
    CsRespRcvd,
    MbReqRcvd,
    DsReqRcvd,
    DsRespRcvd,
    CbReqRcvd,
    CbRespRcvd,
    UbReqRcvd,
    UbRespRcvd,
    DbReqRcvd,
    DbRespRcvd,
    DbCmdRcvd,
    DbFailIndRcvd,
    BrCmdRcvd,
    BrFailIndRcvd,
    CnReqRcvd,
    CnRespRcvd,
    RabReqRcvd,
    DdnAckRcvd,
    UpfAssociated,
    PfcpSessEstRespRcvd,
    PfcpSessModRespRcvd,
    PfcpSessDelRespRcvd,
    PfcpSessRptReqRcvd,
    CcaInitialRcvd,
    CcaUpdateRcvd,
    CcaTerminationRcvd,
    RarRcvd,
    ResponseTimeout,
    PeerDown,
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::CsReqRcvd => "CS_REQ_RCVD",
            EventKind::CsRespRcvd => "CS_RESP_RCVD",
            EventKind::MbReqRcvd => "MB_REQ_RCVD",
            EventKind::DsReqRcvd => "DS_REQ_RCVD",
            EventKind::DsRespRcvd => "DS_RESP_RCVD",
            EventKind::CbReqRcvd => "CB_REQ_RCVD",
            EventKind::CbRespRcvd => "CB_RESP_RCVD",
            EventKind::UbReqRcvd => "UB_REQ_RCVD",
            EventKind::UbRespRcvd => "UB_RESP_RCVD",
            EventKind::DbReqRcvd => "DB_REQ_RCVD",
            EventKind::DbRespRcvd => "DB_RESP_RCVD",
            EventKind::DbCmdRcvd => "DB_CMD_RCVD",
            EventKind::DbFailIndRcvd => "DB_FAIL_IND_RCVD",
            EventKind::BrCmdRcvd => "BR_CMD_RCVD",
            EventKind::BrFailIndRcvd => "BR_FAIL_IND_RCVD",
            EventKind::CnReqRcvd => "CN_REQ_RCVD",
            EventKind::CnRespRcvd => "CN_RESP_RCVD",
            EventKind::RabReqRcvd => "RAB_REQ_RCVD",
            EventKind::DdnAckRcvd => "DDN_ACK_RCVD",
            EventKind::UpfAssociated => "UPF_ASSOCIATED",
            EventKind::PfcpSessEstRespRcvd => "PFCP_SESS_EST_RESP_RCVD",
            EventKind::PfcpSessModRespRcvd => "PFCP_SESS_MOD_RESP_RCVD",
            EventKind::PfcpSessDelRespRcvd => "PFCP_SESS_DEL_RESP_RCVD",
            EventKind::PfcpSessRptReqRcvd => "PFCP_SESS_RPT_REQ_RCVD",
            EventKind::CcaInitialRcvd => "CCA_INITIAL_RCVD",
            EventKind::CcaUpdateRcvd => "CCA_UPDATE_RCVD",
            EventKind::CcaTerminationRcvd => "CCA_TERMINATION_RCVD",
            EventKind::RarRcvd => "RAR_RCVD",
            EventKind::ResponseTimeout => "RESPONSE_TIMEOUT",
            EventKind::PeerDown => "PEER_DOWN",
        }
    }

    /// Answers that must match an outstanding request of the session
    pub fn is_answer(&self) -> bool {
        matches!(
            self,
            EventKind::CsRespRcvd
                | EventKind::DsRespRcvd
                | EventKind::CbRespRcvd
                | EventKind::UbRespRcvd
                | EventKind::DbRespRcvd
                | EventKind::CnRespRcvd
                | EventKind::PfcpSessEstRespRcvd
                | EventKind::PfcpSessModRespRcvd
                | EventKind::PfcpSessDelRespRcvd
                | EventKind::CcaInitialRcvd
                | EventKind::CcaUpdateRcvd
                | EventKind::CcaTerminationRcvd
        )
    }

    /// Event kind of a session-level message, `None` for node-level ones
    pub fn of_message(envelope: &Envelope) -> Option<EventKind> {
        let kind = match envelope {
            Envelope::Gtp { msg, .. } => match &msg.body {
                GtpBody::CreateSessionRequest(_) => EventKind::CsReqRcvd,
                GtpBody::CreateSessionResponse(_) => EventKind::CsRespRcvd,
                GtpBody::ModifyBearerRequest(_) => EventKind::MbReqRcvd,
                GtpBody::DeleteSessionRequest(_) => EventKind::DsReqRcvd,
                GtpBody::DeleteSessionResponse(_) => EventKind::DsRespRcvd,
                GtpBody::CreateBearerRequest(_) => EventKind::CbReqRcvd,
                GtpBody::CreateBearerResponse(_) => EventKind::CbRespRcvd,
                GtpBody::UpdateBearerRequest(_) => EventKind::UbReqRcvd,
                GtpBody::UpdateBearerResponse(_) => EventKind::UbRespRcvd,
                GtpBody::DeleteBearerRequest(_) => EventKind::DbReqRcvd,
                GtpBody::DeleteBearerResponse(_) => EventKind::DbRespRcvd,
                GtpBody::DeleteBearerCommand(_) => EventKind::DbCmdRcvd,
                GtpBody::DeleteBearerFailureIndication(_) => EventKind::DbFailIndRcvd,
                GtpBody::BearerResourceCommand(_) => EventKind::BrCmdRcvd,
                GtpBody::BearerResourceFailureIndication(_) => EventKind::BrFailIndRcvd,
                GtpBody::ChangeNotificationRequest(_) => EventKind::CnReqRcvd,
                GtpBody::ChangeNotificationResponse(_) => EventKind::CnRespRcvd,
                GtpBody::ReleaseAccessBearersRequest => EventKind::RabReqRcvd,
                GtpBody::DownlinkDataNotificationAck { .. } => EventKind::DdnAckRcvd,
                GtpBody::EchoRequest { .. }
                | GtpBody::EchoResponse { .. }
                | GtpBody::ModifyBearerResponse(_)
                | GtpBody::ReleaseAccessBearersResponse(_)
                | GtpBody::DownlinkDataNotification(_)
                | GtpBody::DeletePdnConnectionSetRequest(_)
                | GtpBody::DeletePdnConnectionSetResponse { .. } => return None,
            },
            Envelope::Pfcp { msg, .. } => match &msg.body {
                PfcpBody::SessionEstablishmentResponse(_) => EventKind::PfcpSessEstRespRcvd,
                PfcpBody::SessionModificationResponse { .. } => EventKind::PfcpSessModRespRcvd,
                PfcpBody::SessionDeletionResponse { .. } => EventKind::PfcpSessDelRespRcvd,
                PfcpBody::SessionReportRequest(_) => EventKind::PfcpSessRptReqRcvd,
                _ => return None,
            },
            Envelope::Gx { msg } => match &msg.body {
                GxBody::CreditControlAnswer(cca) => match cca.request_type {
                    crate::message::CcRequestType::Initial => EventKind::CcaInitialRcvd,
                    crate::message::CcRequestType::Update => EventKind::CcaUpdateRcvd,
                    crate::message::CcRequestType::Termination => EventKind::CcaTerminationRcvd,
                },
                GxBody::ReAuthRequest(_) => EventKind::RarRcvd,
                GxBody::CreditControlRequest(_) | GxBody::ReAuthAnswer(_) => return None,
            },
        };
        Some(kind)
    }
}

/// Event delivered to a session handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessEvent {
    /// Protocol message addressed to the session
    Message(Envelope),
    /// A leg exhausted its retransmissions
    ResponseTimeout { leg: Leg },
    /// PFCP association with the user plane is up
    UpfAssociated { upf: IpAddr },
    /// Peer died, restarted or deleted a connection set
    PeerDown {
        peer: IpAddr,
        kind: PeerKind,
        /// Restricts cleanup to these peer CSIDs, all sessions when absent
        csids: Option<Vec<Csid>>,
    },
}

impl SessEvent {
    pub fn kind(&self) -> Option<EventKind> {
        match self {
            SessEvent::Message(envelope) => EventKind::of_message(envelope),
            SessEvent::ResponseTimeout { .. } => Some(EventKind::ResponseTimeout),
            SessEvent::UpfAssociated { .. } => Some(EventKind::UpfAssociated),
            SessEvent::PeerDown { .. } => Some(EventKind::PeerDown),
        }
    }

    pub fn envelope(&self) -> Option<&Envelope> {
        match self {
            SessEvent::Message(envelope) => Some(envelope),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{GtpMessage, PfcpMessage};
    use crate::types::GtpInterface;
    use crate::xact::Seq24;

    #[test]
    fn test_event_of_message() {
        let peer: IpAddr = "10.0.0.1".parse().unwrap();
        let env = Envelope::Gtp {
            peer,
            iface: GtpInterface::S11,
            msg: GtpMessage::new(1, Seq24::new(1), GtpBody::ReleaseAccessBearersRequest),
        };
        assert_eq!(EventKind::of_message(&env), Some(EventKind::RabReqRcvd));

        let echo = Envelope::Gtp {
            peer,
            iface: GtpInterface::S11,
            msg: GtpMessage::new(0, Seq24::new(1), GtpBody::EchoRequest { recovery: 1 }),
        };
        assert_eq!(EventKind::of_message(&echo), None);

        let del = Envelope::Pfcp {
            peer,
            msg: PfcpMessage::new(Some(1), Seq24::new(2), PfcpBody::SessionDeletionResponse { cause: 1 }),
        };
        assert_eq!(EventKind::of_message(&del), Some(EventKind::PfcpSessDelRespRcvd));
        assert!(EventKind::PfcpSessDelRespRcvd.is_answer());
    }

    #[test]
    fn test_state_predicates() {
        assert!(SessState::Connected.is_stable());
        assert!(SessState::IdleMode.is_stable());
        assert!(!SessState::ModifyRequested.is_stable());
        assert!(!SessState::Idle.is_live());
        assert!(SessState::ErrorOccurred.is_live());
    }

    #[test]
    fn test_names() {
        assert_eq!(Procedure::InitialAttach.name(), "INITIAL_ATTACH");
        assert_eq!(SessState::SessionEstablishRequested.name(), "SESSION_ESTABLISH_REQUESTED");
        assert_eq!(EventKind::CcaUpdateRcvd.name(), "CCA_UPDATE_RCVD");
        assert!(Procedure::PeerRecovery.is_teardown());
    }
}
