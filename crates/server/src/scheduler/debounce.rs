// Edit debouncer for the analysis scheduler.
//
// Coalesces rapid `auto`-mode edits on the same (connection, file) key
// within a configurable time window (default 2s). Each key is a small state
// machine: absent = idle, present = pending with a deadline, drained =
// submitted. Re-arming a pending key replaces its snapshot and pushes the
// deadline later; there is never more than one timer per key.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use atelier_common::types::Capability;
use uuid::Uuid;

/// Default debounce window.
const DEFAULT_DEBOUNCE_MS: u64 = 2_000;
/// Minimum allowed debounce window.
const MIN_DEBOUNCE_MS: u64 = 100;
/// Maximum allowed debounce window.
const MAX_DEBOUNCE_MS: u64 = 10_000;

/// Configuration for the debouncer.
#[derive(Debug, Clone)]
pub struct DebounceConfig {
    pub window: Duration,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self { window: Duration::from_millis(DEFAULT_DEBOUNCE_MS) }
    }
}

impl DebounceConfig {
    /// Create a config with the given window in milliseconds, clamped to
    /// [100, 10000].
    pub fn with_millis(ms: u64) -> Self {
        let clamped = ms.clamp(MIN_DEBOUNCE_MS, MAX_DEBOUNCE_MS);
        Self { window: Duration::from_millis(clamped) }
    }
}

/// An analysis request waiting out its debounce window, or ready to submit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisRequest {
    pub connection_id: Uuid,
    pub workspace_id: Option<String>,
    pub file_path: String,
    pub content: String,
    pub capabilities: Vec<Capability>,
}

struct PendingEntry {
    request: AnalysisRequest,
    deadline: Instant,
}

/// Debounces analysis requests, coalescing rapid edits on the same
/// (connection, file) key. Only the last snapshot within the window
/// survives; superseded edits never reach the engine.
pub struct Debouncer {
    config: DebounceConfig,
    pending: HashMap<(Uuid, String), PendingEntry>,
}

impl Debouncer {
    pub fn new(config: DebounceConfig) -> Self {
        Self { config, pending: HashMap::new() }
    }

    /// Arm (or re-arm) the debounce entry for this request's key. A pending
    /// entry is replaced wholesale: the previous snapshot is discarded and
    /// the deadline moves to `now + window`.
    pub fn arm(&mut self, request: AnalysisRequest) {
        self.arm_at(request, Instant::now());
    }

    /// Like `arm` but with a specific timestamp (for testing).
    pub(crate) fn arm_at(&mut self, request: AnalysisRequest, now: Instant) {
        let key = (request.connection_id, request.file_path.clone());
        self.pending.insert(key, PendingEntry { request, deadline: now + self.config.window });
    }

    /// Drain all requests whose debounce window has elapsed.
    pub fn drain_ready(&mut self) -> Vec<AnalysisRequest> {
        self.drain_ready_at(Instant::now())
    }

    /// Like `drain_ready` but with a specific timestamp (for testing).
    pub(crate) fn drain_ready_at(&mut self, now: Instant) -> Vec<AnalysisRequest> {
        let mut ready = Vec::new();
        self.pending.retain(|_, entry| {
            if now >= entry.deadline {
                ready.push(entry.request.clone());
                false
            } else {
                true
            }
        });
        ready
    }

    /// Drop all pending entries for a connection (on disconnect).
    /// Returns the number of discarded entries.
    pub fn cancel_connection(&mut self, connection_id: Uuid) -> usize {
        let before = self.pending.len();
        self.pending.retain(|(owner, _), _| *owner != connection_id);
        before - self.pending.len()
    }

    /// Number of keys still waiting in their debounce window.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Time of the earliest pending deadline, or None when idle.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|entry| entry.deadline).min()
    }
}
