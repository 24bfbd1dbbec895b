//! SAEGW-C Error Types
//!
//! Error taxonomy shared by the classifier, the dispatcher and the
//! supporting tables. Every variant maps onto a GTPv2-C cause so that a
//! rejected request always produces a protocol answer.

use std::net::IpAddr;

use thiserror::Error;

use crate::types::gtp_cause;

/// SAEGW-C error type
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SaegwcError {
    /// No UE, PDN or bearer could be resolved for the carried identifier
    #[error("Context not found: {0}")]
    ContextNotFound(String),

    /// IMSI not present in the identity tables
    #[error("IMSI not known: {0}")]
    ImsiNotKnown(String),

    /// A request is already outstanding for the session
    #[error("Request already outstanding for SEID[0x{seid:016x}]")]
    AlreadyOutstanding { seid: u64 },

    /// Bearer id outside 1..=15
    #[error("Invalid bearer id: {0}")]
    InvalidBearerId(u8),

    /// No free bearer id left in the PDN connection
    #[error("Bearer id space exhausted")]
    BearerIdExhausted,

    /// Requested bearer id already allocated in the PDN connection
    #[error("Bearer id {0} already in use")]
    BearerIdInUse(u8),

    /// UE already holds the maximum number of PDN connections
    #[error("PDN connection limit reached: {max}")]
    PdnLimitReached { max: usize },

    /// Key already present in a unique identity space
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// Peer node detected as unreachable
    #[error("Peer unreachable: {0}")]
    PeerUnreachable(IpAddr),

    /// One leg of a multi-leg procedure failed
    #[error("Leg {leg} failed with cause {cause}")]
    PartialLegFailure { leg: &'static str, cause: u8 },

    /// Peer did not answer within the retransmission budget
    #[error("Remote peer not responding")]
    RemotePeerNotResponding,

    /// Mandatory information element absent
    #[error("Mandatory IE missing: {0}")]
    MissingIe(&'static str),

    /// Message not valid for this gateway role or procedure state
    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    /// Identifier pool exhausted
    #[error("Pool exhausted: {0}")]
    PoolExhausted(&'static str),

    /// Dispatch table inconsistency found at startup
    #[error("Dispatch table error: {0}")]
    DispatchTable(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Restart counter persistence failure
    #[error("Restart counter error: {0}")]
    RestartCounter(String),
}

impl SaegwcError {
    /// GTPv2-C cause reported when this error rejects a request
    pub fn gtp_cause(&self) -> u8 {
        match self {
            SaegwcError::ContextNotFound(_) => gtp_cause::CONTEXT_NOT_FOUND,
            SaegwcError::ImsiNotKnown(_) => gtp_cause::IMSI_IMEI_NOT_KNOWN,
            SaegwcError::AlreadyOutstanding { .. } => gtp_cause::TEMPORARILY_REJECTED,
            SaegwcError::InvalidBearerId(_) | SaegwcError::BearerIdInUse(_) => {
                gtp_cause::MANDATORY_IE_INCORRECT
            }
            SaegwcError::BearerIdExhausted
            | SaegwcError::PdnLimitReached { .. }
            | SaegwcError::PoolExhausted(_) => gtp_cause::NO_RESOURCES_AVAILABLE,
            SaegwcError::PartialLegFailure { cause, .. } => *cause,
            SaegwcError::PeerUnreachable(_) | SaegwcError::RemotePeerNotResponding => {
                gtp_cause::REMOTE_PEER_NOT_RESPONDING
            }
            SaegwcError::MissingIe(_) => gtp_cause::MANDATORY_IE_MISSING,
            SaegwcError::UnexpectedMessage(_) => gtp_cause::SERVICE_NOT_SUPPORTED,
            SaegwcError::DuplicateKey(_)
            | SaegwcError::DispatchTable(_)
            | SaegwcError::Config(_)
            | SaegwcError::RestartCounter(_) => gtp_cause::SYSTEM_FAILURE,
        }
    }
}

/// SAEGW-C Result type
pub type SaegwcResult<T> = Result<T, SaegwcError>;

/// Rejection of a single inbound message
///
/// Produced by the classifier and by handlers. The partition turns it
/// into the error answer of the triggering request, or drops it when the
/// trigger was itself an answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// GTPv2-C cause to report
    pub cause: u8,
    /// Underlying error
    pub error: SaegwcError,
}

impl Rejection {
    /// Reject with an explicit cause
    pub fn with_cause(cause: u8, error: SaegwcError) -> Self {
        Self { cause, error }
    }
}

impl From<SaegwcError> for Rejection {
    fn from(error: SaegwcError) -> Self {
        Self {
            cause: error.gtp_cause(),
            error,
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (cause {})", self.error, self.cause)
    }
}
