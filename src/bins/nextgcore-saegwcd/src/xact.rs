//! Transaction Sequence Numbers
//!
//! 24-bit sequence numbers shared by GTPv2-C and PFCP, the per-interface
//! allocators used for outbound requests and the per-session state that
//! detects retransmitted inbound requests.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::message::Outbound;
use crate::types::Interface;

// ============================================================================
// Seq24
// ============================================================================

/// 24-bit sequence number with serial-number comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Seq24(u32);

impl Seq24 {
    /// Size of the sequence space
    pub const MODULUS: u32 = 1 << 24;
    /// Largest representable value
    pub const MAX: u32 = Self::MODULUS - 1;
    const HALF: u32 = 1 << 23;

    /// Build from a raw value, keeping the low 24 bits
    pub fn new(value: u32) -> Self {
        Self(value & Self::MAX)
    }

    pub fn value(self) -> u32 {
        self.0
    }

    /// Successor, wrapping to 0 after 2^24 - 1
    pub fn next(self) -> Self {
        Self::new(self.0.wrapping_add(1))
    }

    /// Forward distance from `earlier` to `self` modulo 2^24
    pub fn distance_from(self, earlier: Seq24) -> u32 {
        self.0.wrapping_sub(earlier.0) & Self::MAX
    }

    /// Whether `self` follows `other` in serial-number order
    pub fn is_newer_than(self, other: Seq24) -> bool {
        let d = self.distance_from(other);
        d != 0 && d < Self::HALF
    }
}

impl std::fmt::Display for Seq24 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Outbound Sequence Allocation
// ============================================================================

/// Monotonic sequence counters, one per egress interface
///
/// Shared by every partition so that each interface sees a single
/// increasing sequence.
#[derive(Debug)]
pub struct SequenceAllocator {
    s11: AtomicU32,
    s5s8: AtomicU32,
    sx: AtomicU32,
}

impl SequenceAllocator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Allocator whose first value on every interface is `first`
    pub fn starting_at(first: u32) -> Self {
        Self {
            s11: AtomicU32::new(first),
            s5s8: AtomicU32::new(first),
            sx: AtomicU32::new(first),
        }
    }

    /// Next sequence number for the interface
    pub fn next(&self, iface: Interface) -> Seq24 {
        let counter = match iface {
            Interface::S11 => &self.s11,
            Interface::S5s8 => &self.s5s8,
            Interface::Sx => &self.sx,
        };
        // 2^32 is a multiple of 2^24 so masking keeps the wrap exact
        Seq24::new(counter.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SequenceAllocator {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Inbound Retransmission Detection
// ============================================================================

/// Classification of an inbound request sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqVerdict {
    /// First sighting, process normally
    New,
    /// Same number as the last accepted request
    Duplicate,
    /// Older than the last accepted request
    Stale,
}

/// Last accepted request number and the answer produced for it
#[derive(Debug, Clone, Default)]
pub struct RetransmitState {
    last: Option<Seq24>,
    response: Option<Outbound>,
}

impl RetransmitState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify an inbound request number
    pub fn check(&self, seq: Seq24) -> SeqVerdict {
        match self.last {
            None => SeqVerdict::New,
            Some(last) if last == seq => SeqVerdict::Duplicate,
            Some(last) if seq.is_newer_than(last) => SeqVerdict::New,
            Some(_) => SeqVerdict::Stale,
        }
    }

    /// Record a new request; the previous cached answer is discarded
    pub fn accept(&mut self, seq: Seq24) {
        self.last = Some(seq);
        self.response = None;
    }

    /// Cache the answer to the last accepted request
    pub fn store_response(&mut self, response: Outbound) {
        self.response = Some(response);
    }

    pub fn cached_response(&self) -> Option<&Outbound> {
        self.response.as_ref()
    }

    pub fn last_seq(&self) -> Option<Seq24> {
        self.last
    }
}
