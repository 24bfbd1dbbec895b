//! NextGCore SAEGW-C (Session Coordinator for SGW-C / PGW-C)
//!
//! Control plane session coordination for the EPC gateways:
//! - S11 interface: GTPv2-C sessions toward the MME
//! - S5/S8-C interface: GTPv2-C between the serving and PDN gateway roles
//! - Sxa/Sxb interface: PFCP sessions toward the user plane
//! - Gx interface: policy and charging control toward the PCRF
//!
//! Sessions are sharded over partitions by local TEID and SEID. Each
//! partition owns its session tables and runs the session state machine;
//! node-level liveness and PFCP association live in the gateway.

pub mod arena;
pub mod classifier;
pub mod config;
pub mod context;
pub mod correlation;
pub mod csid;
pub mod error;
pub mod event;
pub mod gateway;
pub mod gtp_build;
pub mod gx_build;
pub mod gx_handler;
pub mod handler;
pub mod identity;
pub mod message;
pub mod partition;
pub mod peer;
pub mod recovery_handler;
pub mod restart;
pub mod s11_handler;
pub mod s5c_handler;
pub mod sm;
pub mod sx_build;
pub mod sx_handler;
pub mod timer;
pub mod types;
pub mod xact;

#[cfg(test)]
mod property_tests;

// Re-export commonly used types
pub use config::{RetransmissionPolicy, SaegwcConfig};
pub use error::{SaegwcError, SaegwcResult};
pub use gateway::{route, Gateway, GatewayHandle, Route};
pub use message::{Envelope, GtpBody, GtpMessage, GxBody, GxMessage, Inbound, Outbound, PfcpBody, PfcpMessage};
pub use partition::{Partition, PartitionInput};
pub use types::{GatewayRole, GtpInterface, PeerKind};
pub use xact::Seq24;
