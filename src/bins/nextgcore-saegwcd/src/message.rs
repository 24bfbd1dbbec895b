//! Decoded Protocol Messages
//!
//! Structures exchanged with the GTPv2-C, PFCP and Gx codecs. Only the
//! information elements that drive session state are modelled; everything
//! else travels as opaque bytes. Message types are opaque tags with no
//! numeric meaning.

use std::net::{IpAddr, Ipv4Addr};

use bytes::Bytes;

use crate::types::{Ambr, BearerQos, FTeid, FqCsid, GtpInterface, Imsi};
use crate::xact::Seq24;

// ============================================================================
// GTPv2-C
// ============================================================================

/// GTPv2-C message tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GtpMessageType {
    EchoRequest,
    EchoResponse,
    CreateSessionRequest,
    CreateSessionResponse,
    ModifyBearerRequest,
    ModifyBearerResponse,
    DeleteSessionRequest,
    DeleteSessionResponse,
    CreateBearerRequest,
    CreateBearerResponse,
    UpdateBearerRequest,
    UpdateBearerResponse,
    DeleteBearerRequest,
    DeleteBearerResponse,
    DeleteBearerCommand,
    DeleteBearerFailureIndication,
    BearerResourceCommand,
    BearerResourceFailureIndication,
    ChangeNotificationRequest,
    ChangeNotificationResponse,
    ReleaseAccessBearersRequest,
    ReleaseAccessBearersResponse,
    DownlinkDataNotification,
    DownlinkDataNotificationAck,
    DeletePdnConnectionSetRequest,
    DeletePdnConnectionSetResponse,
}

impl GtpMessageType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::EchoRequest => "Echo Request",
            Self::EchoResponse => "Echo Response",
            Self::CreateSessionRequest => "Create Session Request",
            Self::CreateSessionResponse => "Create Session Response",
            Self::ModifyBearerRequest => "Modify Bearer Request",
            Self::ModifyBearerResponse => "Modify Bearer Response",
            Self::DeleteSessionRequest => "Delete Session Request",
            Self::DeleteSessionResponse => "Delete Session Response",
            Self::CreateBearerRequest => "Create Bearer Request",
            Self::CreateBearerResponse => "Create Bearer Response",
            Self::UpdateBearerRequest => "Update Bearer Request",
            Self::UpdateBearerResponse => "Update Bearer Response",
            Self::DeleteBearerRequest => "Delete Bearer Request",
            Self::DeleteBearerResponse => "Delete Bearer Response",
            Self::DeleteBearerCommand => "Delete Bearer Command",
            Self::DeleteBearerFailureIndication => "Delete Bearer Failure Indication",
            Self::BearerResourceCommand => "Bearer Resource Command",
            Self::BearerResourceFailureIndication => "Bearer Resource Failure Indication",
            Self::ChangeNotificationRequest => "Change Notification Request",
            Self::ChangeNotificationResponse => "Change Notification Response",
            Self::ReleaseAccessBearersRequest => "Release Access Bearers Request",
            Self::ReleaseAccessBearersResponse => "Release Access Bearers Response",
            Self::DownlinkDataNotification => "Downlink Data Notification",
            Self::DownlinkDataNotificationAck => "Downlink Data Notification Acknowledge",
            Self::DeletePdnConnectionSetRequest => "Delete PDN Connection Set Request",
            Self::DeletePdnConnectionSetResponse => "Delete PDN Connection Set Response",
        }
    }

    /// Initial messages of a transaction (requests, commands, notifications)
    pub fn is_initial(&self) -> bool {
        matches!(
            self,
            Self::EchoRequest
                | Self::CreateSessionRequest
                | Self::ModifyBearerRequest
                | Self::DeleteSessionRequest
                | Self::CreateBearerRequest
                | Self::UpdateBearerRequest
                | Self::DeleteBearerRequest
                | Self::DeleteBearerCommand
                | Self::BearerResourceCommand
                | Self::ChangeNotificationRequest
                | Self::ReleaseAccessBearersRequest
                | Self::DownlinkDataNotification
                | Self::DeletePdnConnectionSetRequest
        )
    }
}

/// Indication flags relevant to procedure selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Indication {
    /// Handover indication (HI)
    pub handover: bool,
    /// Scope indication (SI): delete locally, do not forward to the PGW
    pub scope: bool,
}

/// Bearer context IE
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BearerContext {
    pub ebi: u8,
    pub cause: Option<u8>,
    pub qos: Option<BearerQos>,
    pub tft: Option<Bytes>,
    pub s1u_enb: Option<FTeid>,
    pub s1u_sgw: Option<FTeid>,
    pub s5s8u_sgw: Option<FTeid>,
    pub s5s8u_pgw: Option<FTeid>,
}

impl BearerContext {
    pub fn new(ebi: u8) -> Self {
        Self {
            ebi,
            ..Default::default()
        }
    }

    /// Whether this context carries an eNB S1-U endpoint
    pub fn has_enb_fteid(&self) -> bool {
        self.s1u_enb.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CreateSessionRequest {
    pub imsi: Option<Imsi>,
    pub msisdn: Option<String>,
    pub apn: String,
    pub rat_type: u8,
    /// Control plane endpoint of the sender (MME S11 or SGW S5/S8)
    pub sender_fteid: Option<FTeid>,
    /// PGW control plane endpoint selected by the MME
    pub pgw_s5s8_fteid: Option<FTeid>,
    pub paa: Option<Ipv4Addr>,
    pub ambr: Option<Ambr>,
    pub indication: Indication,
    pub linked_ebi: Option<u8>,
    pub bearer_contexts: Vec<BearerContext>,
    pub mme_fqcsid: Option<FqCsid>,
    pub sgw_fqcsid: Option<FqCsid>,
    pub recovery: Option<u8>,
    pub uli: Option<Bytes>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CreateSessionResponse {
    pub cause: u8,
    pub sender_fteid: Option<FTeid>,
    pub paa: Option<Ipv4Addr>,
    pub ambr: Option<Ambr>,
    pub bearer_contexts: Vec<BearerContext>,
    pub sgw_fqcsid: Option<FqCsid>,
    pub pgw_fqcsid: Option<FqCsid>,
    pub recovery: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ModifyBearerRequest {
    pub indication: Indication,
    pub sender_fteid: Option<FTeid>,
    pub rat_type: Option<u8>,
    pub bearer_contexts: Vec<BearerContext>,
    pub uli: Option<Bytes>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ModifyBearerResponse {
    pub cause: u8,
    pub linked_ebi: Option<u8>,
    pub bearer_contexts: Vec<BearerContext>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeleteSessionRequest {
    pub linked_ebi: Option<u8>,
    pub indication: Indication,
    pub uli: Option<Bytes>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeleteSessionResponse {
    pub cause: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CreateBearerRequest {
    pub linked_ebi: u8,
    pub pti: Option<u8>,
    pub bearer_contexts: Vec<BearerContext>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CreateBearerResponse {
    pub cause: u8,
    pub bearer_contexts: Vec<BearerContext>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UpdateBearerRequest {
    pub pti: Option<u8>,
    pub ambr: Option<Ambr>,
    pub bearer_contexts: Vec<BearerContext>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UpdateBearerResponse {
    pub cause: u8,
    pub bearer_contexts: Vec<BearerContext>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeleteBearerRequest {
    /// Set when the whole PDN connection is released
    pub linked_ebi: Option<u8>,
    pub ebis: Vec<u8>,
    pub pti: Option<u8>,
    pub cause: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeleteBearerResponse {
    pub cause: u8,
    pub linked_ebi: Option<u8>,
    pub bearer_contexts: Vec<BearerContext>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeleteBearerCommand {
    pub ebis: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeleteBearerFailureIndication {
    pub cause: u8,
    pub bearer_contexts: Vec<BearerContext>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BearerResourceCommand {
    pub linked_ebi: u8,
    pub pti: u8,
    /// Traffic aggregate description
    pub tad: Option<Bytes>,
    /// Bearer to modify, when not asking for a new one
    pub ebi: Option<u8>,
    pub qos: Option<BearerQos>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BearerResourceFailureIndication {
    pub cause: u8,
    pub linked_ebi: u8,
    pub pti: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChangeNotificationRequest {
    pub imsi: Option<Imsi>,
    pub linked_ebi: Option<u8>,
    pub rat_type: Option<u8>,
    pub uli: Option<Bytes>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChangeNotificationResponse {
    pub cause: u8,
    pub imsi: Option<Imsi>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReleaseAccessBearersResponse {
    pub cause: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DownlinkDataNotification {
    pub ebi: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeletePdnConnectionSetRequest {
    pub fqcsids: Vec<FqCsid>,
}

/// GTPv2-C message body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GtpBody {
    EchoRequest { recovery: u8 },
    EchoResponse { recovery: u8 },
    CreateSessionRequest(CreateSessionRequest),
    CreateSessionResponse(CreateSessionResponse),
    ModifyBearerRequest(ModifyBearerRequest),
    ModifyBearerResponse(ModifyBearerResponse),
    DeleteSessionRequest(DeleteSessionRequest),
    DeleteSessionResponse(DeleteSessionResponse),
    CreateBearerRequest(CreateBearerRequest),
    CreateBearerResponse(CreateBearerResponse),
    UpdateBearerRequest(UpdateBearerRequest),
    UpdateBearerResponse(UpdateBearerResponse),
    DeleteBearerRequest(DeleteBearerRequest),
    DeleteBearerResponse(DeleteBearerResponse),
    DeleteBearerCommand(DeleteBearerCommand),
    DeleteBearerFailureIndication(DeleteBearerFailureIndication),
    BearerResourceCommand(BearerResourceCommand),
    BearerResourceFailureIndication(BearerResourceFailureIndication),
    ChangeNotificationRequest(ChangeNotificationRequest),
    ChangeNotificationResponse(ChangeNotificationResponse),
    ReleaseAccessBearersRequest,
    ReleaseAccessBearersResponse(ReleaseAccessBearersResponse),
    DownlinkDataNotification(DownlinkDataNotification),
    DownlinkDataNotificationAck { cause: u8 },
    DeletePdnConnectionSetRequest(DeletePdnConnectionSetRequest),
    DeletePdnConnectionSetResponse { cause: u8 },
}

impl GtpBody {
    pub fn message_type(&self) -> GtpMessageType {
        match self {
            GtpBody::EchoRequest { .. } => GtpMessageType::EchoRequest,
            GtpBody::EchoResponse { .. } => GtpMessageType::EchoResponse,
            GtpBody::CreateSessionRequest(_) => GtpMessageType::CreateSessionRequest,
            GtpBody::CreateSessionResponse(_) => GtpMessageType::CreateSessionResponse,
            GtpBody::ModifyBearerRequest(_) => GtpMessageType::ModifyBearerRequest,
            GtpBody::ModifyBearerResponse(_) => GtpMessageType::ModifyBearerResponse,
            GtpBody::DeleteSessionRequest(_) => GtpMessageType::DeleteSessionRequest,
            GtpBody::DeleteSessionResponse(_) => GtpMessageType::DeleteSessionResponse,
            GtpBody::CreateBearerRequest(_) => GtpMessageType::CreateBearerRequest,
            GtpBody::CreateBearerResponse(_) => GtpMessageType::CreateBearerResponse,
            GtpBody::UpdateBearerRequest(_) => GtpMessageType::UpdateBearerRequest,
            GtpBody::UpdateBearerResponse(_) => GtpMessageType::UpdateBearerResponse,
            GtpBody::DeleteBearerRequest(_) => GtpMessageType::DeleteBearerRequest,
            GtpBody::DeleteBearerResponse(_) => GtpMessageType::DeleteBearerResponse,
            GtpBody::DeleteBearerCommand(_) => GtpMessageType::DeleteBearerCommand,
            GtpBody::DeleteBearerFailureIndication(_) => {
                GtpMessageType::DeleteBearerFailureIndication
            }
            GtpBody::BearerResourceCommand(_) => GtpMessageType::BearerResourceCommand,
            GtpBody::BearerResourceFailureIndication(_) => {
                GtpMessageType::BearerResourceFailureIndication
            }
            GtpBody::ChangeNotificationRequest(_) => GtpMessageType::ChangeNotificationRequest,
            GtpBody::ChangeNotificationResponse(_) => GtpMessageType::ChangeNotificationResponse,
            GtpBody::ReleaseAccessBearersRequest => GtpMessageType::ReleaseAccessBearersRequest,
            GtpBody::ReleaseAccessBearersResponse(_) => {
                GtpMessageType::ReleaseAccessBearersResponse
            }
            GtpBody::DownlinkDataNotification(_) => GtpMessageType::DownlinkDataNotification,
            GtpBody::DownlinkDataNotificationAck { .. } => {
                GtpMessageType::DownlinkDataNotificationAck
            }
            GtpBody::DeletePdnConnectionSetRequest(_) => {
                GtpMessageType::DeletePdnConnectionSetRequest
            }
            GtpBody::DeletePdnConnectionSetResponse { .. } => {
                GtpMessageType::DeletePdnConnectionSetResponse
            }
        }
    }

    /// Cause IE of an answer, if the message carries one
    pub fn cause(&self) -> Option<u8> {
        match self {
            GtpBody::CreateSessionResponse(m) => Some(m.cause),
            GtpBody::ModifyBearerResponse(m) => Some(m.cause),
            GtpBody::DeleteSessionResponse(m) => Some(m.cause),
            GtpBody::CreateBearerResponse(m) => Some(m.cause),
            GtpBody::UpdateBearerResponse(m) => Some(m.cause),
            GtpBody::DeleteBearerResponse(m) => Some(m.cause),
            GtpBody::DeleteBearerFailureIndication(m) => Some(m.cause),
            GtpBody::BearerResourceFailureIndication(m) => Some(m.cause),
            GtpBody::ChangeNotificationResponse(m) => Some(m.cause),
            GtpBody::ReleaseAccessBearersResponse(m) => Some(m.cause),
            GtpBody::DownlinkDataNotificationAck { cause }
            | GtpBody::DeletePdnConnectionSetResponse { cause } => Some(*cause),
            _ => None,
        }
    }
}

/// Decoded GTPv2-C message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GtpMessage {
    /// Header TEID, 0 when the receiver is not yet known
    pub teid: u32,
    pub seq: Seq24,
    pub body: GtpBody,
}

impl GtpMessage {
    pub fn new(teid: u32, seq: Seq24, body: GtpBody) -> Self {
        Self { teid, seq, body }
    }

    pub fn message_type(&self) -> GtpMessageType {
        self.body.message_type()
    }
}

// ============================================================================
// PFCP
// ============================================================================

/// PFCP message tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PfcpMessageType {
    HeartbeatRequest,
    HeartbeatResponse,
    AssociationSetupRequest,
    AssociationSetupResponse,
    SessionSetDeletionRequest,
    SessionSetDeletionResponse,
    SessionEstablishmentRequest,
    SessionEstablishmentResponse,
    SessionModificationRequest,
    SessionModificationResponse,
    SessionDeletionRequest,
    SessionDeletionResponse,
    SessionReportRequest,
    SessionReportResponse,
}

impl PfcpMessageType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::HeartbeatRequest => "Heartbeat Request",
            Self::HeartbeatResponse => "Heartbeat Response",
            Self::AssociationSetupRequest => "Association Setup Request",
            Self::AssociationSetupResponse => "Association Setup Response",
            Self::SessionSetDeletionRequest => "Session Set Deletion Request",
            Self::SessionSetDeletionResponse => "Session Set Deletion Response",
            Self::SessionEstablishmentRequest => "Session Establishment Request",
            Self::SessionEstablishmentResponse => "Session Establishment Response",
            Self::SessionModificationRequest => "Session Modification Request",
            Self::SessionModificationResponse => "Session Modification Response",
            Self::SessionDeletionRequest => "Session Deletion Request",
            Self::SessionDeletionResponse => "Session Deletion Response",
            Self::SessionReportRequest => "Session Report Request",
            Self::SessionReportResponse => "Session Report Response",
        }
    }
}

/// Side a packet arrives from or is forwarded to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowDirection {
    /// Radio or serving gateway side
    Access,
    /// Packet data network or PDN gateway side
    Core,
}

/// FAR apply action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApplyAction {
    Forward,
    /// Buffer downlink packets and notify the control plane
    BufferNotify,
    Drop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatePdr {
    pub pdr_id: u16,
    pub precedence: u32,
    pub source: FlowDirection,
    pub local_fteid: Option<FTeid>,
    pub ue_ip: Option<Ipv4Addr>,
    pub sdf_filters: Vec<String>,
    pub far_id: u32,
    pub qer_ids: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateFar {
    pub far_id: u32,
    pub action: ApplyAction,
    pub destination: FlowDirection,
    pub outer_header: Option<FTeid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateFar {
    pub far_id: u32,
    pub action: ApplyAction,
    pub outer_header: Option<FTeid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateQer {
    pub qer_id: u32,
    pub qci: u8,
    pub mbr_ul: u64,
    pub mbr_dl: u64,
    pub gbr_ul: u64,
    pub gbr_dl: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionEstablishmentRequest {
    /// Node id of the control plane function
    pub node: Option<IpAddr>,
    /// Control plane SEID (F-SEID)
    pub cp_seid: u64,
    pub create_pdrs: Vec<CreatePdr>,
    pub create_fars: Vec<CreateFar>,
    pub create_qers: Vec<CreateQer>,
    pub cp_fqcsid: Option<FqCsid>,
    pub mme_fqcsid: Option<FqCsid>,
    pub sgw_fqcsid: Option<FqCsid>,
    pub pgw_fqcsid: Option<FqCsid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionEstablishmentResponse {
    pub cause: u8,
    pub up_seid: Option<u64>,
    pub up_fqcsid: Option<FqCsid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionModificationRequest {
    pub create_pdrs: Vec<CreatePdr>,
    pub create_fars: Vec<CreateFar>,
    pub create_qers: Vec<CreateQer>,
    pub update_fars: Vec<UpdateFar>,
    pub update_qers: Vec<CreateQer>,
    pub remove_pdrs: Vec<u16>,
    pub remove_fars: Vec<u32>,
    pub remove_qers: Vec<u32>,
}

impl SessionModificationRequest {
    /// Whether the request changes nothing
    pub fn is_empty(&self) -> bool {
        self.create_pdrs.is_empty()
            && self.create_fars.is_empty()
            && self.create_qers.is_empty()
            && self.update_fars.is_empty()
            && self.update_qers.is_empty()
            && self.remove_pdrs.is_empty()
            && self.remove_fars.is_empty()
            && self.remove_qers.is_empty()
    }
}

/// Report carried in a Session Report Request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionReport {
    /// Downlink data arrived for a buffering FAR
    DownlinkData { pdr_id: u16 },
    /// Usage report, accounted elsewhere
    Usage,
    /// GTP-U error indication from a remote endpoint
    ErrorIndication { remote: FTeid },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSetDeletionRequest {
    pub node: IpAddr,
    pub fqcsids: Vec<FqCsid>,
}

/// PFCP message body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PfcpBody {
    HeartbeatRequest { recovery_ts: u32 },
    HeartbeatResponse { recovery_ts: u32 },
    AssociationSetupRequest { node: IpAddr, recovery_ts: u32 },
    AssociationSetupResponse { node: IpAddr, cause: u8, recovery_ts: u32 },
    SessionSetDeletionRequest(SessionSetDeletionRequest),
    SessionSetDeletionResponse { cause: u8 },
    SessionEstablishmentRequest(SessionEstablishmentRequest),
    SessionEstablishmentResponse(SessionEstablishmentResponse),
    SessionModificationRequest(SessionModificationRequest),
    SessionModificationResponse { cause: u8 },
    SessionDeletionRequest,
    SessionDeletionResponse { cause: u8 },
    SessionReportRequest(SessionReport),
    SessionReportResponse { cause: u8 },
}

impl PfcpBody {
    pub fn message_type(&self) -> PfcpMessageType {
        match self {
            PfcpBody::HeartbeatRequest { .. } => PfcpMessageType::HeartbeatRequest,
            PfcpBody::HeartbeatResponse { .. } => PfcpMessageType::HeartbeatResponse,
            PfcpBody::AssociationSetupRequest { .. } => PfcpMessageType::AssociationSetupRequest,
            PfcpBody::AssociationSetupResponse { .. } => {
                PfcpMessageType::AssociationSetupResponse
            }
            PfcpBody::SessionSetDeletionRequest(_) => PfcpMessageType::SessionSetDeletionRequest,
            PfcpBody::SessionSetDeletionResponse { .. } => {
                PfcpMessageType::SessionSetDeletionResponse
            }
            PfcpBody::SessionEstablishmentRequest(_) => {
                PfcpMessageType::SessionEstablishmentRequest
            }
            PfcpBody::SessionEstablishmentResponse(_) => {
                PfcpMessageType::SessionEstablishmentResponse
            }
            PfcpBody::SessionModificationRequest(_) => {
                PfcpMessageType::SessionModificationRequest
            }
            PfcpBody::SessionModificationResponse { .. } => {
                PfcpMessageType::SessionModificationResponse
            }
            PfcpBody::SessionDeletionRequest => PfcpMessageType::SessionDeletionRequest,
            PfcpBody::SessionDeletionResponse { .. } => PfcpMessageType::SessionDeletionResponse,
            PfcpBody::SessionReportRequest(_) => PfcpMessageType::SessionReportRequest,
            PfcpBody::SessionReportResponse { .. } => PfcpMessageType::SessionReportResponse,
        }
    }
}

/// Decoded PFCP message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PfcpMessage {
    /// Header SEID; absent on node level messages
    pub seid: Option<u64>,
    pub seq: Seq24,
    pub body: PfcpBody,
}

impl PfcpMessage {
    pub fn new(seid: Option<u64>, seq: Seq24, body: PfcpBody) -> Self {
        Self { seid, seq, body }
    }

    pub fn message_type(&self) -> PfcpMessageType {
        self.body.message_type()
    }
}

// ============================================================================
// Gx
// ============================================================================

/// CC-Request-Type AVP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CcRequestType {
    Initial,
    Update,
    Termination,
}

impl CcRequestType {
    pub fn name(&self) -> &'static str {
        match self {
            CcRequestType::Initial => "INITIAL_REQUEST",
            CcRequestType::Update => "UPDATE_REQUEST",
            CcRequestType::Termination => "TERMINATION_REQUEST",
        }
    }
}

/// Charging-Rule-Install content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargingRule {
    pub name: String,
    pub qos: BearerQos,
    pub precedence: u32,
    pub flows: Vec<String>,
}

/// Charging-Rule-Report content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleReport {
    pub name: String,
    pub active: bool,
    pub failure_code: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditControlRequest {
    pub request_type: CcRequestType,
    pub request_number: u32,
    pub imsi: Option<Imsi>,
    pub apn: Option<String>,
    pub ue_ip: Option<Ipv4Addr>,
    pub default_qos: Option<BearerQos>,
    pub rule_reports: Vec<RuleReport>,
    pub tad: Option<Bytes>,
    pub uli: Option<Bytes>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditControlAnswer {
    pub request_type: CcRequestType,
    pub request_number: u32,
    pub result_code: u32,
    pub default_qos: Option<BearerQos>,
    pub ambr: Option<Ambr>,
    pub installs: Vec<ChargingRule>,
    pub removes: Vec<String>,
}

impl CreditControlAnswer {
    pub fn success(request_type: CcRequestType, request_number: u32) -> Self {
        Self {
            request_type,
            request_number,
            result_code: crate::types::gx_result::SUCCESS,
            default_qos: None,
            ambr: None,
            installs: Vec::new(),
            removes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReAuthRequest {
    pub installs: Vec<ChargingRule>,
    pub removes: Vec<String>,
    /// Session-Release-Cause present: tear the PDN connection down
    pub session_release: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReAuthAnswer {
    pub result_code: u32,
    pub rule_reports: Vec<RuleReport>,
}

/// Gx message body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GxBody {
    CreditControlRequest(CreditControlRequest),
    CreditControlAnswer(CreditControlAnswer),
    ReAuthRequest(ReAuthRequest),
    ReAuthAnswer(ReAuthAnswer),
}

impl GxBody {
    pub fn name(&self) -> &'static str {
        match self {
            GxBody::CreditControlRequest(_) => "Credit-Control-Request",
            GxBody::CreditControlAnswer(_) => "Credit-Control-Answer",
            GxBody::ReAuthRequest(_) => "Re-Auth-Request",
            GxBody::ReAuthAnswer(_) => "Re-Auth-Answer",
        }
    }
}

/// Decoded Gx message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GxMessage {
    pub session_id: String,
    pub hop_by_hop: u32,
    pub body: GxBody,
}

// ============================================================================
// Envelopes
// ============================================================================

/// A decoded message together with its peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    Gtp {
        peer: IpAddr,
        iface: GtpInterface,
        msg: GtpMessage,
    },
    Pfcp {
        peer: IpAddr,
        msg: PfcpMessage,
    },
    Gx {
        msg: GxMessage,
    },
}

/// Message received from a peer
pub type Inbound = Envelope;

/// Message to hand to the transmit path
pub type Outbound = Envelope;

impl Envelope {
    pub fn name(&self) -> &'static str {
        match self {
            Envelope::Gtp { msg, .. } => msg.message_type().name(),
            Envelope::Pfcp { msg, .. } => msg.message_type().name(),
            Envelope::Gx { msg } => msg.body.name(),
        }
    }

    /// Peer address, when the protocol is addressed by node
    pub fn peer(&self) -> Option<IpAddr> {
        match self {
            Envelope::Gtp { peer, .. } | Envelope::Pfcp { peer, .. } => Some(*peer),
            Envelope::Gx { .. } => None,
        }
    }

    pub fn gtp_type(&self) -> Option<GtpMessageType> {
        match self {
            Envelope::Gtp { msg, .. } => Some(msg.message_type()),
            _ => None,
        }
    }

    pub fn pfcp_type(&self) -> Option<PfcpMessageType> {
        match self {
            Envelope::Pfcp { msg, .. } => Some(msg.message_type()),
            _ => None,
        }
    }

    /// Transaction sequence number for GTP and PFCP messages
    pub fn seq(&self) -> Option<Seq24> {
        match self {
            Envelope::Gtp { msg, .. } => Some(msg.seq),
            Envelope::Pfcp { msg, .. } => Some(msg.seq),
            Envelope::Gx { .. } => None,
        }
    }
}
