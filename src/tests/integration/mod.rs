//! NextGCore SAEGW-C Integration Tests
//!
//! End-to-end procedure tests for the session coordinator. The gateway is
//! driven with decoded messages while simulated MME, UPF and PCRF peers
//! answer every request it sends.
//!
//! ## Test Categories
//!
//! - `session`: attach, detach, retransmission and unresolved UE handling
//! - `bearer`: PCRF-initiated activation and MME-commanded deactivation
//! - `recovery`: peer failure, connection set deletion and CSID cleanup
//! - `property`: property-based tests over routing and session lifecycles

pub mod common;
pub mod session;
pub mod bearer;
pub mod recovery;
pub mod property;

// Re-export common test utilities
pub use common::*;
