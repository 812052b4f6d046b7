//! Forwarding handler for every non-introspection path.

use std::error::Error as _;
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::response::Response;
use bytes::Bytes;
use http_body_util::LengthLimitError;
use tokio::time::Instant;

use crate::error::{ProxyError, Result};
use crate::forward::stream_response;
use crate::state::AppState;

/// Any method, any path - admit, forward, stream back.
pub async fn forward(State(state): State<Arc<AppState>>, request: Request) -> Result<Response> {
    let (parts, body) = request.into_parts();
    let path = parts.uri.path().to_string();

    // Buffer the upload before queueing so a slow client never holds a slot.
    let body = read_body(body, state.config.limits.max_body_bytes)
        .await
        .map_err(|e| {
            state.stats.record_rejected();
            tracing::warn!(method = %parts.method, path = %path, "request body refused: {}", e);
            e
        })?;

    let permit = if state.is_passthrough(&path) {
        None
    } else {
        let permit = state
            .gate
            .acquire(state.config.limits.queue_timeout())
            .await
            .map_err(|e| {
                state.stats.record_rejected();
                tracing::warn!(
                    method = %parts.method,
                    path = %path,
                    queued = state.gate.queued(),
                    "admission refused: {}",
                    e
                );
                ProxyError::from(e)
            })?;
        tracing::debug!(
            path = %path,
            waited_ms = permit.waited().as_millis() as u64,
            available = state.gate.available(),
            "gate slot acquired"
        );
        Some(permit)
    };

    let mut record = state.stats.begin(&parts.method, &path);
    let body_len = body.len();
    let timeout = state.forwarder.timeout();
    let deadline = Instant::now() + timeout;

    let upstream = match state.forwarder.send(&parts, body, deadline).await {
        Ok(upstream) => upstream,
        Err(e) => {
            tracing::warn!(request_id = %record.id(), path = %path, "{}", e);
            record.finish(e.outcome());
            return Err(e);
        }
    };
    record.add_bytes_in(body_len);

    Ok(stream_response(&parts.method, upstream, record, permit, deadline, timeout))
}

async fn read_body(body: Body, limit: usize) -> Result<Bytes> {
    to_bytes(body, limit).await.map_err(|e| {
        let over_limit = e
            .source()
            .map_or(false, |source| source.is::<LengthLimitError>());
        if over_limit {
            ProxyError::BodyTooLarge(limit)
        } else {
            ProxyError::BadRequestBody(e.to_string())
        }
    })
}
