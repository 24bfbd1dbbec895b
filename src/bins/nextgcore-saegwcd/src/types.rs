//! Protocol Value Types
//!
//! Identifiers, tunnel endpoints, QoS descriptors and cause codes shared by
//! the GTPv2-C, PFCP and Gx legs.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::error::{SaegwcError, SaegwcResult};

// ============================================================================
// Cause Codes
// ============================================================================

/// GTPv2-C cause values (TS 29.274 8.4)
pub mod gtp_cause {
    pub const REQUEST_ACCEPTED: u8 = 16;
    pub const REQUEST_ACCEPTED_PARTIALLY: u8 = 17;
    pub const CONTEXT_NOT_FOUND: u8 = 64;
    pub const INVALID_MESSAGE_FORMAT: u8 = 65;
    pub const SERVICE_NOT_SUPPORTED: u8 = 68;
    pub const MANDATORY_IE_INCORRECT: u8 = 69;
    pub const MANDATORY_IE_MISSING: u8 = 70;
    pub const SYSTEM_FAILURE: u8 = 72;
    pub const NO_RESOURCES_AVAILABLE: u8 = 73;
    pub const UE_NOT_RESPONDING: u8 = 87;
    pub const SERVICE_DENIED: u8 = 89;
    pub const REQUEST_REJECTED: u8 = 94;
    pub const IMSI_IMEI_NOT_KNOWN: u8 = 96;
    pub const REMOTE_PEER_NOT_RESPONDING: u8 = 100;
    pub const CONDITIONAL_IE_MISSING: u8 = 103;
    pub const TEMPORARILY_REJECTED: u8 = 110;

    /// Whether the cause is one of the acceptance values
    pub fn is_accepted(cause: u8) -> bool {
        cause == REQUEST_ACCEPTED || cause == REQUEST_ACCEPTED_PARTIALLY
    }
}

/// PFCP cause values (TS 29.244 8.2.1)
pub mod pfcp_cause {
    pub const REQUEST_ACCEPTED: u8 = 1;
    pub const REQUEST_REJECTED: u8 = 64;
    pub const SESSION_CONTEXT_NOT_FOUND: u8 = 65;
    pub const MANDATORY_IE_MISSING: u8 = 66;
    pub const NO_ESTABLISHED_PFCP_ASSOCIATION: u8 = 72;
    pub const RULE_CREATION_MODIFICATION_FAILURE: u8 = 73;
    pub const NO_RESOURCES_AVAILABLE: u8 = 75;
    pub const SYSTEM_FAILURE: u8 = 77;

    /// GTPv2-C cause reported upstream for a failed PFCP answer
    pub fn to_gtp(cause: u8) -> u8 {
        use super::gtp_cause;
        match cause {
            REQUEST_ACCEPTED => gtp_cause::REQUEST_ACCEPTED,
            SESSION_CONTEXT_NOT_FOUND => gtp_cause::CONTEXT_NOT_FOUND,
            MANDATORY_IE_MISSING => gtp_cause::MANDATORY_IE_MISSING,
            NO_RESOURCES_AVAILABLE => gtp_cause::NO_RESOURCES_AVAILABLE,
            NO_ESTABLISHED_PFCP_ASSOCIATION => gtp_cause::REMOTE_PEER_NOT_RESPONDING,
            _ => gtp_cause::SYSTEM_FAILURE,
        }
    }
}

/// Diameter result codes used on Gx (RFC 6733, TS 29.212)
pub mod gx_result {
    pub const SUCCESS: u32 = 2001;
    pub const LIMITED_SUCCESS: u32 = 2002;
    pub const UNKNOWN_SESSION_ID: u32 = 5002;
    pub const UNABLE_TO_COMPLY: u32 = 5012;
    pub const USER_UNKNOWN: u32 = 5030;
    pub const RESOURCES_EXCEEDED: u32 = 5006;
    pub const PCC_RULE_EVENT: u32 = 5142;

    /// Whether the answer counts as success
    pub fn is_success(code: u32) -> bool {
        code == SUCCESS || code == LIMITED_SUCCESS
    }

    /// GTPv2-C cause reported upstream for a failed Gx answer
    pub fn to_gtp(code: u32) -> u8 {
        use super::gtp_cause;
        match code {
            SUCCESS | LIMITED_SUCCESS => gtp_cause::REQUEST_ACCEPTED,
            USER_UNKNOWN => gtp_cause::IMSI_IMEI_NOT_KNOWN,
            RESOURCES_EXCEEDED => gtp_cause::NO_RESOURCES_AVAILABLE,
            _ => gtp_cause::SERVICE_DENIED,
        }
    }

    /// Result code answered to the PCRF for a GTPv2-C cause
    pub fn from_gtp(cause: u8) -> u32 {
        use super::gtp_cause;
        match cause {
            c if gtp_cause::is_accepted(c) => SUCCESS,
            gtp_cause::CONTEXT_NOT_FOUND => UNKNOWN_SESSION_ID,
            gtp_cause::NO_RESOURCES_AVAILABLE => RESOURCES_EXCEEDED,
            _ => UNABLE_TO_COMPLY,
        }
    }
}

// ============================================================================
// Roles and Interfaces
// ============================================================================

/// Role this control-plane node plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayRole {
    /// Serving gateway control plane
    Sgwc,
    /// PDN gateway control plane
    Pgwc,
    /// Combined SGW-C and PGW-C
    Saegwc,
}

impl GatewayRole {
    pub fn name(&self) -> &'static str {
        match self {
            GatewayRole::Sgwc => "SGW-C",
            GatewayRole::Pgwc => "PGW-C",
            GatewayRole::Saegwc => "SAEGW-C",
        }
    }

    /// Access side is S11 toward an MME
    pub fn has_s11(&self) -> bool {
        matches!(self, GatewayRole::Sgwc | GatewayRole::Saegwc)
    }

    /// Sessions are relayed to a PGW over S5/S8
    pub fn relays_to_pgw(&self) -> bool {
        matches!(self, GatewayRole::Sgwc)
    }

    /// Node anchors the PDN and may talk Gx
    pub fn anchors_pdn(&self) -> bool {
        matches!(self, GatewayRole::Pgwc | GatewayRole::Saegwc)
    }

    /// Interface on which UE-originated procedures arrive
    pub fn access_interface(&self) -> GtpInterface {
        if self.has_s11() {
            GtpInterface::S11
        } else {
            GtpInterface::S5s8
        }
    }

    /// Kind of peer sitting on the access side
    pub fn access_peer_kind(&self) -> PeerKind {
        if self.has_s11() {
            PeerKind::Mme
        } else {
            PeerKind::Sgw
        }
    }
}

impl Default for GatewayRole {
    fn default() -> Self {
        GatewayRole::Saegwc
    }
}

/// GTPv2-C control interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GtpInterface {
    S11,
    S5s8,
}

impl GtpInterface {
    pub fn name(&self) -> &'static str {
        match self {
            GtpInterface::S11 => "S11",
            GtpInterface::S5s8 => "S5/S8",
        }
    }
}

/// Egress interface owning an independent sequence number space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interface {
    S11,
    S5s8,
    Sx,
}

impl From<GtpInterface> for Interface {
    fn from(iface: GtpInterface) -> Self {
        match iface {
            GtpInterface::S11 => Interface::S11,
            GtpInterface::S5s8 => Interface::S5s8,
        }
    }
}

/// Role of a peer node, distinguishing liveness records at the same address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PeerKind {
    Mme,
    Sgw,
    Pgw,
    Upf,
}

impl PeerKind {
    pub fn name(&self) -> &'static str {
        match self {
            PeerKind::Mme => "MME",
            PeerKind::Sgw => "SGW",
            PeerKind::Pgw => "PGW",
            PeerKind::Upf => "UPF",
        }
    }

    /// Whether the peer is probed with PFCP heartbeats rather than GTP echo
    pub fn is_pfcp(&self) -> bool {
        matches!(self, PeerKind::Upf)
    }
}

// ============================================================================
// Subscriber and Bearer Identifiers
// ============================================================================

/// International Mobile Subscriber Identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Imsi(String);

impl Imsi {
    /// Parse a digit string of 5 to 15 digits
    pub fn new(digits: &str) -> Option<Self> {
        let valid = (5..=15).contains(&digits.len()) && digits.bytes().all(|b| b.is_ascii_digit());
        valid.then(|| Self(digits.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric value, used to spread new sessions over partitions
    pub fn as_u64(&self) -> u64 {
        self.0
            .bytes()
            .fold(0u64, |acc, b| acc.wrapping_mul(10).wrapping_add(u64::from(b - b'0')))
    }
}

impl fmt::Display for Imsi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// EPS bearer id, always within 1..=15
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ebi(u8);

impl Ebi {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 15;
    /// Lowest id a dedicated bearer may take
    pub const MIN_DEDICATED: u8 = 2;
    /// Number of usable bearer ids
    pub const COUNT: usize = (Self::MAX - Self::MIN + 1) as usize;

    /// Validate a raw bearer id; 0 and values above 15 are rejected
    pub fn new(value: u8) -> SaegwcResult<Self> {
        if (Self::MIN..=Self::MAX).contains(&value) {
            Ok(Self(value))
        } else {
            Err(SaegwcError::InvalidBearerId(value))
        }
    }

    pub fn value(self) -> u8 {
        self.0
    }

    /// Slot index of the bearer inside its PDN connection
    pub fn index(self) -> usize {
        usize::from(self.0 - Self::MIN)
    }

    /// Inverse of [`Ebi::index`]
    pub fn from_index(index: usize) -> SaegwcResult<Self> {
        u8::try_from(index)
            .ok()
            .and_then(|i| i.checked_add(Self::MIN))
            .ok_or(SaegwcError::InvalidBearerId(u8::MAX))
            .and_then(Self::new)
    }

    /// All valid bearer ids in ascending order
    pub fn all() -> impl Iterator<Item = Ebi> {
        (Self::MIN..=Self::MAX).map(Ebi)
    }

    /// Candidate ids for a dedicated bearer of the PDN whose default bearer
    /// is `default`: the ids above it first, then wrapping to 2
    pub fn dedicated_after(default: Ebi) -> impl Iterator<Item = Ebi> {
        let start = default.0.max(Self::MIN_DEDICATED - 1);
        (start + 1..=Self::MAX)
            .chain(Self::MIN_DEDICATED..=start)
            .filter(move |value| *value != default.0)
            .map(Ebi)
    }
}

impl fmt::Display for Ebi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Tunnel Endpoints, QoS and Connection Sets
// ============================================================================

/// Fully qualified tunnel endpoint identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FTeid {
    pub teid: u32,
    pub addr: IpAddr,
}

impl FTeid {
    pub fn new(teid: u32, addr: IpAddr) -> Self {
        Self { teid, addr }
    }
}

impl fmt::Display for FTeid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}@{}", self.teid, self.addr)
    }
}

/// Allocation and retention priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Arp {
    pub priority_level: u8,
    pub pre_emption_capability: bool,
    pub pre_emption_vulnerability: bool,
}

/// Bearer level QoS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BearerQos {
    pub qci: u8,
    pub arp: Arp,
    pub mbr_ul: u64,
    pub mbr_dl: u64,
    pub gbr_ul: u64,
    pub gbr_dl: u64,
}

impl BearerQos {
    /// Non-GBR profile with the given QCI and ARP priority
    pub fn non_gbr(qci: u8, priority_level: u8) -> Self {
        Self {
            qci,
            arp: Arp {
                priority_level,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Guaranteed bit rate QCI (TS 23.203 table 6.1.7)
    pub fn is_gbr(&self) -> bool {
        matches!(self.qci, 1..=4 | 65..=67 | 71..=76 | 82..=85)
    }
}

/// Aggregate maximum bit rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ambr {
    pub uplink: u64,
    pub downlink: u64,
}

/// Connection set identifier
pub type Csid = u16;

/// Fully qualified connection set identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FqCsid {
    /// Node that issued the identifiers
    pub node: IpAddr,
    pub csids: Vec<Csid>,
}

impl FqCsid {
    pub fn new(node: IpAddr, csids: Vec<Csid>) -> Self {
        Self { node, csids }
    }
}
