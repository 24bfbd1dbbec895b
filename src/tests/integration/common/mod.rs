//! Common test utilities and infrastructure
//!
//! This module provides shared utilities for integration tests including:
//! - Gateway construction for each test
//! - Request builders and outbound message inspection
//! - Simulated MME, UPF and PCRF peers

pub mod context;
pub mod message;
pub mod nf_mock;

pub use context::*;
pub use message::*;
pub use nf_mock::*;
