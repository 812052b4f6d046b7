//! Aggregate statistics and per-request records.
//!
//! Counters are atomics owned by [`ProxyStats`]; nothing here takes a lock, so
//! reading a snapshot never waits behind the gate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::http::Method;
use chrono::{DateTime, Utc};
use llm_rate_limiter_common::StatsSnapshot;
use uuid::Uuid;

use crate::gate::ConcurrencyGate;

/// How a forwarded request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The backend response was delivered completely.
    Success,
    /// The backend failed after accepting the connection.
    BackendError,
    /// Connection refused or reset before a response.
    BackendUnreachable,
    /// The backend deadline elapsed.
    BackendTimeout,
    /// The client went away first. Also the state of any record that is
    /// dropped without being finished.
    ClientDisconnect,
}

impl Outcome {
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Outcome::BackendError | Outcome::BackendUnreachable | Outcome::BackendTimeout
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::BackendError => "backend_error",
            Outcome::BackendUnreachable => "backend_unreachable",
            Outcome::BackendTimeout => "backend_timeout",
            Outcome::ClientDisconnect => "client_disconnect",
        }
    }
}

/// Process-wide counters. Reset only by restarting the proxy.
#[derive(Debug)]
pub struct ProxyStats {
    total_requests: AtomicU64,
    active_requests: AtomicU64,
    rejected_requests: AtomicU64,
    total_errors: AtomicU64,
    total_bytes_forwarded: AtomicU64,
    client_disconnects: AtomicU64,
    started_at: DateTime<Utc>,
    started: Instant,
}

impl Default for ProxyStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyStats {
    pub fn new() -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            active_requests: AtomicU64::new(0),
            rejected_requests: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            total_bytes_forwarded: AtomicU64::new(0),
            client_disconnects: AtomicU64::new(0),
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    /// A forward-candidate was refused without being forwarded: 503 from
    /// the gate, or 413/400 for an unreadable body.
    pub fn record_rejected(&self) {
        self.rejected_requests.fetch_add(1, Ordering::SeqCst);
        self.total_requests.fetch_add(1, Ordering::SeqCst);
    }

    /// Open the record for an admitted request. Counts it as active until the
    /// returned record is dropped.
    pub fn begin(self: &Arc<Self>, method: &Method, path: &str) -> InFlight {
        self.active_requests.fetch_add(1, Ordering::SeqCst);
        InFlight {
            stats: self.clone(),
            id: Uuid::new_v4(),
            method: method.clone(),
            path: path.to_string(),
            started: Instant::now(),
            bytes_in: 0,
            bytes_out: 0,
            outcome: Outcome::ClientDisconnect,
        }
    }

    fn complete(&self, record: &InFlight) {
        match record.outcome {
            Outcome::ClientDisconnect => {
                self.client_disconnects.fetch_add(1, Ordering::SeqCst);
            }
            outcome => {
                self.total_requests.fetch_add(1, Ordering::SeqCst);
                if outcome.is_error() {
                    self.total_errors.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
        self.total_bytes_forwarded
            .fetch_add(record.bytes_in + record.bytes_out, Ordering::SeqCst);
        self.active_requests.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn active_requests(&self) -> u64 {
        self.active_requests.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self, gate: &ConcurrencyGate) -> StatsSnapshot {
        StatsSnapshot {
            total_requests: self.total_requests.load(Ordering::SeqCst),
            active_requests: self.active_requests.load(Ordering::SeqCst),
            queued_requests: gate.queued() as u64,
            rejected_requests: self.rejected_requests.load(Ordering::SeqCst),
            total_errors: self.total_errors.load(Ordering::SeqCst),
            total_bytes_forwarded: self.total_bytes_forwarded.load(Ordering::SeqCst),
            client_disconnects: self.client_disconnects.load(Ordering::SeqCst),
            max_concurrent: gate.capacity() as u64,
            available_slots: gate.available() as u64,
            started_at: Some(self.started_at),
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }
}

/// Ephemeral record of one admitted request.
///
/// Folded into the aggregate counters exactly once, when dropped. A record
/// that is never finished (its future or body stream was dropped mid-way)
/// counts as a client disconnect.
#[derive(Debug)]
pub struct InFlight {
    stats: Arc<ProxyStats>,
    id: Uuid,
    method: Method,
    path: String,
    started: Instant,
    bytes_in: u64,
    bytes_out: u64,
    outcome: Outcome,
}

impl InFlight {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn add_bytes_in(&mut self, n: usize) {
        self.bytes_in += n as u64;
    }

    pub fn add_bytes_out(&mut self, n: usize) {
        self.bytes_out += n as u64;
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out
    }

    pub fn finish(&mut self, outcome: Outcome) {
        self.outcome = outcome;
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        match self.outcome {
            Outcome::Success => tracing::debug!(
                request_id = %self.id,
                method = %self.method,
                path = %self.path,
                bytes_in = self.bytes_in,
                bytes_out = self.bytes_out,
                elapsed_ms,
                "forwarded request completed"
            ),
            outcome => tracing::warn!(
                request_id = %self.id,
                method = %self.method,
                path = %self.path,
                bytes_out = self.bytes_out,
                elapsed_ms,
                outcome = outcome.as_str(),
                "forwarded request did not complete"
            ),
        }
        self.stats.complete(self);
    }
}
