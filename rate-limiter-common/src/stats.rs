//! Statistics snapshot returned by `GET /proxy/stats`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Point-in-time view of the proxy's aggregate counters.
///
/// Counters are process-lifetime values and reset when the proxy restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Requests that received a terminal response (forwarded or refused).
    pub total_requests: u64,
    /// Requests being forwarded, passthrough paths included.
    pub active_requests: u64,
    /// Requests waiting for a gate slot.
    pub queued_requests: u64,
    /// Requests refused without being forwarded: 503 from the gate (queue
    /// timeout, queue full, shutdown) or 413/400 for the request body.
    pub rejected_requests: u64,
    /// Admitted requests that failed inside the proxy (502, 504, cut stream).
    pub total_errors: u64,
    /// Request body bytes sent upstream plus response bytes streamed back.
    pub total_bytes_forwarded: u64,
    /// Admitted requests abandoned by their client before completion.
    #[serde(default)]
    pub client_disconnects: u64,
    /// Configured gate capacity.
    #[serde(default)]
    pub max_concurrent: u64,
    /// Slots free right now.
    #[serde(default)]
    pub available_slots: u64,
    /// When the proxy process started serving.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub uptime_secs: u64,
}

impl StatsSnapshot {
    /// True when nothing is being forwarded or waiting for a slot.
    pub fn is_idle(&self) -> bool {
        self.active_requests == 0 && self.queued_requests == 0
    }

    /// Fraction of gate slots held, from 0.0 to 1.0.
    pub fn utilization(&self) -> f64 {
        if self.max_concurrent == 0 {
            return 0.0;
        }
        let held = self.max_concurrent.saturating_sub(self.available_slots);
        held as f64 / self.max_concurrent as f64
    }
}
