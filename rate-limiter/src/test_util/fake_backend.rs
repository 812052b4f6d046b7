//! Programmable stand-in for llama-server.
//!
//! Routes:
//! - `GET /health` - `{"status":"ok"}`, or 503 after `set_healthy(false)`
//! - `POST /v1/completions` - sleeps `delay`, then `{"choices":[{"text":"ok"}]}`
//! - `GET /v1/models` - answers immediately
//! - `POST /v1/stream` - five SSE chunks, `delay` apart
//! - `POST /v1/broken-stream` - one SSE chunk, then the connection is aborted
//! - `/fail` - 500 with a JSON error
//! - `/hang` - never answers
//!
//! Every route except `/health` counts towards `in_flight` and `peak`.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub const COMPLETION_BODY: &str = r#"{"choices":[{"text":"ok"}]}"#;
pub const STREAM_CHUNKS: usize = 5;

#[derive(Debug)]
pub struct FakeBackendState {
    delay: Duration,
    healthy: AtomicBool,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    completed: AtomicUsize,
    abandoned: AtomicUsize,
}

impl FakeBackendState {
    fn track(self: &Arc<Self>) -> Tracked {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        Tracked {
            state: self.clone(),
            completed: false,
        }
    }
}

/// One call the backend is working on.
struct Tracked {
    state: Arc<FakeBackendState>,
    completed: bool,
}

impl Tracked {
    fn complete(mut self) {
        self.completed = true;
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.completed {
            self.state.completed.fetch_add(1, Ordering::SeqCst);
        } else {
            self.state.abandoned.fetch_add(1, Ordering::SeqCst);
        }
    }
}

pub struct FakeBackend {
    addr: SocketAddr,
    state: Arc<FakeBackendState>,
    handle: JoinHandle<()>,
}

impl FakeBackend {
    pub async fn start(delay: Duration) -> Self {
        let state = Arc::new(FakeBackendState {
            delay,
            healthy: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            abandoned: AtomicUsize::new(0),
        });

        let app = Router::new()
            .route("/health", get(health))
            .route("/v1/completions", post(completions))
            .route("/v1/models", get(models))
            .route("/v1/stream", post(stream))
            .route("/v1/broken-stream", post(broken_stream))
            .route("/fail", any(fail))
            .route("/hang", any(hang))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind fake backend");
        let addr = listener.local_addr().expect("fake backend has no address");
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            addr,
            state,
            handle,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.state.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn in_flight(&self) -> usize {
        self.state.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of calls ever open at once.
    pub fn peak(&self) -> usize {
        self.state.peak.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.state.completed.load(Ordering::SeqCst)
    }

    /// Calls dropped before they finished (the caller went away).
    pub fn abandoned(&self) -> usize {
        self.state.abandoned.load(Ordering::SeqCst)
    }
}

impl Drop for FakeBackend {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn health(State(state): State<Arc<FakeBackendState>>) -> Response {
    if state.healthy.load(Ordering::SeqCst) {
        Json(json!({"status": "ok"})).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": {"code": 503, "message": "Loading model"}})),
        )
            .into_response()
    }
}

async fn completions(State(state): State<Arc<FakeBackendState>>) -> Response {
    let tracked = state.track();
    tokio::time::sleep(state.delay).await;
    tracked.complete();
    (
        [(header::CONTENT_TYPE, "application/json")],
        COMPLETION_BODY,
    )
        .into_response()
}

async fn models(State(state): State<Arc<FakeBackendState>>) -> Response {
    let tracked = state.track();
    tracked.complete();
    Json(json!({"object": "list", "data": [{"id": "fake-model", "object": "model"}]})).into_response()
}

async fn stream(State(state): State<Arc<FakeBackendState>>) -> Response {
    let tracked = state.track();
    let delay = state.delay;

    let chunks = futures_util::stream::unfold(
        (0usize, Some(tracked)),
        move |(i, tracked)| async move {
            if i == STREAM_CHUNKS {
                if let Some(tracked) = tracked {
                    tracked.complete();
                }
                return None;
            }
            if i > 0 {
                tokio::time::sleep(delay).await;
            }
            let chunk = Bytes::from(format!("data: {{\"n\":{}}}\n\n", i));
            Some((Ok::<_, Infallible>(chunk), (i + 1, tracked)))
        },
    );

    (
        [(header::CONTENT_TYPE, "text/event-stream")],
        Body::from_stream(chunks),
    )
        .into_response()
}

async fn broken_stream(State(state): State<Arc<FakeBackendState>>) -> Response {
    let tracked = state.track();

    let chunks = futures_util::stream::unfold(
        (0usize, Some(tracked)),
        |(i, tracked)| async move {
            match i {
                0 => {
                    let chunk = Bytes::from_static(b"data: {\"n\":0}\n\n");
                    Some((Ok(chunk), (1, tracked)))
                }
                1 => {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    if let Some(tracked) = tracked {
                        tracked.complete();
                    }
                    let err = std::io::Error::new(
                        std::io::ErrorKind::ConnectionReset,
                        "backend crashed mid-stream",
                    );
                    Some((Err(err), (2, None)))
                }
                _ => None,
            }
        },
    );

    (
        [(header::CONTENT_TYPE, "text/event-stream")],
        Body::from_stream(chunks),
    )
        .into_response()
}

async fn fail(State(state): State<Arc<FakeBackendState>>) -> Response {
    let tracked = state.track();
    tracked.complete();
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": {"code": 500, "message": "GPU scheduler fault"}})),
    )
        .into_response()
}

async fn hang(State(state): State<Arc<FakeBackendState>>) -> Response {
    let _tracked = state.track();
    std::future::pending::<()>().await;
    StatusCode::OK.into_response()
}
