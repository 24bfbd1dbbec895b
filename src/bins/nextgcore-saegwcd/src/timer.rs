//! SAEGW-C Timer Management
//!
//! Timer configuration and the delay queue each partition and the liveness
//! task own. Expired entries are drained by the owner and processed like
//! any inbound message.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

use crate::config::TimersConfig;

// ============================================================================
// Timer IDs
// ============================================================================

/// SAEGW-C timer identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// Outbound request retransmission (T3-RESPONSE)
    ResponseRetry,
    /// Periodic peer echo / heartbeat
    PeerProbe,
    /// Echo / heartbeat answer wait
    PeerProbeRetry,
}

impl TimerId {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ResponseRetry => "SAEGWC_TIMER_RESPONSE_RETRY",
            Self::PeerProbe => "SAEGWC_TIMER_PEER_PROBE",
            Self::PeerProbeRetry => "SAEGWC_TIMER_PEER_PROBE_RETRY",
        }
    }
}

// ============================================================================
// Timer Configuration
// ============================================================================

/// Timer configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerConfig {
    /// Timer is configured
    pub enabled: bool,
    /// Maximum retry count
    pub max_count: u32,
    /// Timer duration
    pub duration: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_count: 0,
            duration: Duration::ZERO,
        }
    }
}

impl TimerConfig {
    pub fn new(max_count: u32, duration: Duration) -> Self {
        Self {
            enabled: !duration.is_zero(),
            max_count,
            duration,
        }
    }
}

/// SAEGW-C timer configurations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaegwcTimerConfigs {
    /// Request retransmission: T3-RESPONSE interval, N3-REQUESTS resends
    pub response: TimerConfig,
    /// Peer probe interval; `max_count` is the unanswered probes tolerated
    pub probe: TimerConfig,
    /// Failed probe cycles after which an unreachable peer is forgotten
    pub remove_after_cycles: u32,
}

impl Default for SaegwcTimerConfigs {
    fn default() -> Self {
        Self::from(&TimersConfig::default())
    }
}

impl From<&TimersConfig> for SaegwcTimerConfigs {
    fn from(cfg: &TimersConfig) -> Self {
        Self {
            response: TimerConfig::new(cfg.n3_requests, Duration::from_millis(cfg.t3_response)),
            probe: TimerConfig::new(cfg.n3_requests, Duration::from_millis(cfg.echo_interval)),
            remove_after_cycles: cfg.remove_after_cycles,
        }
    }
}

impl SaegwcTimerConfigs {
    pub fn get(&self, timer_id: TimerId) -> &TimerConfig {
        match timer_id {
            TimerId::ResponseRetry | TimerId::PeerProbeRetry => &self.response,
            TimerId::PeerProbe => &self.probe,
        }
    }

    /// Time a Gx request is given before it counts as unanswered
    pub fn gx_answer_wait(&self) -> Duration {
        self.response.duration * (self.response.max_count + 1)
    }
}

// ============================================================================
// Delay Queue
// ============================================================================

/// Deadline-ordered queue with O(log n) insert and lazy cancellation
#[derive(Debug)]
pub struct DelayQueue<T> {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    entries: HashMap<u64, T>,
    next_key: u64,
}

impl<T> DelayQueue<T> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            entries: HashMap::new(),
            next_key: 1,
        }
    }

    /// Schedule a payload, returning its cancellation key
    pub fn schedule(&mut self, at: Instant, payload: T) -> u64 {
        let key = self.next_key;
        self.next_key += 1;
        self.heap.push(Reverse((at, key)));
        self.entries.insert(key, payload);
        key
    }

    /// Cancel an entry; unknown keys are a no-op
    pub fn cancel(&mut self, key: u64) -> Option<T> {
        self.entries.remove(&key)
    }

    /// Remove every entry due at `now`, in deadline order
    pub fn pop_expired(&mut self, now: Instant) -> Vec<(u64, T)> {
        let mut expired = Vec::new();
        while let Some(Reverse((at, key))) = self.heap.peek().copied() {
            if at > now {
                break;
            }
            self.heap.pop();
            if let Some(payload) = self.entries.remove(&key) {
                expired.push((key, payload));
            }
        }
        expired
    }

    /// Earliest live deadline
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((at, key))) = self.heap.peek().copied() {
            if self.entries.contains_key(&key) {
                return Some(at);
            }
            self.heap.pop();
        }
        None
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for DelayQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
