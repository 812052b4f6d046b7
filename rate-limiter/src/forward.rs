//! Forwarding to the backend and streaming its response back.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::http::header::{self, HeaderMap, HeaderName};
use axum::http::request::Parts;
use axum::http::{Method, StatusCode, Uri};
use axum::response::Response;
use bytes::Bytes;
use futures_util::stream::{BoxStream, Stream, StreamExt};
use llm_rate_limiter_common::HealthResponse;
use reqwest::{Client, Url};
use serde::Deserialize;
use tokio::time::{Instant, Sleep};

use crate::error::{ProxyError, Result};
use crate::gate::GatePermit;
use crate::stats::{InFlight, Outcome};

/// Headers that describe a single transport hop and are never forwarded.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// HTTP client bound to the single backend.
pub struct Forwarder {
    client: Client,
    base: String,
    timeout: Duration,
    health_timeout: Duration,
}

impl Forwarder {
    pub fn new(
        backend: &Url,
        timeout: Duration,
        health_timeout: Duration,
    ) -> std::result::Result<Self, reqwest::Error> {
        // No client-wide timeout: the deadline is applied per call so that it
        // covers the streamed body too.
        let client = Client::builder().no_proxy().build()?;
        Ok(Self {
            client,
            base: backend.as_str().trim_end_matches('/').to_string(),
            timeout,
            health_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Backend URL for an inbound request URI: base + path + query.
    pub fn target_url(&self, uri: &Uri) -> String {
        let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        format!("{}{}", self.base, path_and_query)
    }

    /// Send the request upstream and wait for the response head.
    ///
    /// Fails with `BackendTimeout` if `deadline` passes first. Dropping the
    /// returned future aborts the backend call.
    pub async fn send(&self, parts: &Parts, body: Bytes, deadline: Instant) -> Result<reqwest::Response> {
        let url = self.target_url(&parts.uri);
        tracing::debug!("Forwarding {} {}", parts.method, url);

        let request = self
            .client
            .request(parts.method.clone(), &url)
            .headers(upstream_headers(&parts.headers))
            .body(body);

        match tokio::time::timeout_at(deadline, request.send()).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(ProxyError::from_reqwest(e, self.timeout)),
            Err(_elapsed) => Err(ProxyError::BackendTimeout(self.timeout)),
        }
    }

    /// Quick probe of the backend's own `/health`.
    pub async fn probe_health(&self) -> HealthResponse {
        #[derive(Deserialize)]
        struct BackendHealth {
            status: Option<String>,
        }

        let url = format!("{}/health", self.base);
        let response = match self
            .client
            .get(&url)
            .timeout(self.health_timeout)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return HealthResponse::degraded(format!(
                    "backend health probe timed out after {}s",
                    self.health_timeout.as_secs()
                ))
            }
            Err(e) => return HealthResponse::degraded(format!("backend unreachable: {}", e)),
        };

        let status = response.status();
        if !status.is_success() {
            return HealthResponse::degraded(format!("backend health returned {}", status));
        }

        // llama-server answers {"status":"ok"}; anything else that parses is
        // a not-ready state. Non-JSON 2xx bodies count as healthy.
        match response.json::<BackendHealth>().await {
            Ok(BackendHealth {
                status: Some(backend_status),
            }) if backend_status != "ok" => {
                HealthResponse::degraded(format!("backend status: {}", backend_status))
            }
            _ => HealthResponse::ok(),
        }
    }
}

fn connection_listed(headers: &HeaderMap) -> Vec<HeaderName> {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect()
}

fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let listed = connection_listed(headers);
    let mut out = headers.clone();
    for name in HOP_BY_HOP {
        out.remove(name);
    }
    for name in &listed {
        out.remove(name);
    }
    out
}

/// Inbound request headers as sent upstream. `Host` and `Content-Length`
/// are recomputed by the client.
pub fn upstream_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = strip_hop_by_hop(headers);
    out.remove(header::HOST);
    out.remove(header::CONTENT_LENGTH);
    out
}

/// Backend response headers as returned to the client.
pub fn downstream_headers(headers: &HeaderMap) -> HeaderMap {
    strip_hop_by_hop(headers)
}

/// Turn the backend response into the client response.
///
/// The body is streamed chunk by chunk. The in-flight record and the gate
/// permit travel with the body, so the slot is held until the last byte is
/// sent or the client goes away.
pub fn stream_response(
    method: &Method,
    upstream: reqwest::Response,
    mut record: InFlight,
    permit: Option<GatePermit>,
    deadline: Instant,
    timeout: Duration,
) -> Response {
    let status = upstream.status();
    let headers = downstream_headers(upstream.headers());
    let content_length = upstream.content_length();

    let body = if *method == Method::HEAD
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
        || content_length == Some(0)
    {
        record.finish(Outcome::Success);
        Body::empty()
    } else {
        Body::from_stream(ForwardedBody {
            inner: upstream.bytes_stream().boxed(),
            deadline: Box::pin(tokio::time::sleep_until(deadline)),
            timeout,
            content_length,
            record,
            _permit: permit,
            done: false,
        })
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Backend body stream that owns the request's record and gate permit.
struct ForwardedBody {
    inner: BoxStream<'static, reqwest::Result<Bytes>>,
    deadline: Pin<Box<Sleep>>,
    timeout: Duration,
    /// Declared length. The server stops polling once it has written this
    /// many bytes, so the end of the stream may never be observed.
    content_length: Option<u64>,
    record: InFlight,
    _permit: Option<GatePermit>,
    done: bool,
}

impl Stream for ForwardedBody {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        // Headers are already out, so a late failure can only cut the stream.
        if this.deadline.as_mut().poll(cx).is_ready() {
            this.done = true;
            this.record.finish(Outcome::BackendTimeout);
            return Poll::Ready(Some(Err(ProxyError::BackendTimeout(this.timeout))));
        }

        match this.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.record.add_bytes_out(chunk.len());
                if this.content_length == Some(this.record.bytes_out()) {
                    this.done = true;
                    this.record.finish(Outcome::Success);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.done = true;
                this.record.finish(Outcome::BackendError);
                Poll::Ready(Some(Err(ProxyError::Stream(e.to_string()))))
            }
            Poll::Ready(None) => {
                this.done = true;
                this.record.finish(Outcome::Success);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::http::{HeaderValue, Request};
    use http_body_util::BodyExt;

    use crate::gate::ConcurrencyGate;
    use crate::stats::ProxyStats;

    fn forwarder(base: &str) -> Forwarder {
        Forwarder::new(
            &Url::parse(base).unwrap(),
            Duration::from_secs(300),
            Duration::from_secs(2),
        )
        .unwrap()
    }

    #[test]
    fn test_target_url_keeps_path_and_query() {
        let fwd = forwarder("http://localhost:8081");
        let uri: Uri = "/v1/completions?stream=true".parse().unwrap();
        assert_eq!(
            fwd.target_url(&uri),
            "http://localhost:8081/v1/completions?stream=true"
        );
    }

    #[test]
    fn test_target_url_with_base_prefix() {
        let fwd = forwarder("http://10.0.0.2:8081/llama/");
        let uri: Uri = "/v1/models".parse().unwrap();
        assert_eq!(fwd.target_url(&uri), "http://10.0.0.2:8081/llama/v1/models");
        assert_eq!(fwd.base_url(), "http://10.0.0.2:8081/llama");
    }

    #[test]
    fn test_upstream_headers_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("proxy:8080"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer x"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("12"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-trace-hop"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert("x-trace-hop", HeaderValue::from_static("1"));
        headers.insert("x-request-id", HeaderValue::from_static("abc"));

        let out = upstream_headers(&headers);
        assert_eq!(out.get(header::CONTENT_TYPE).unwrap(), "application/json");
        assert_eq!(out.get(header::AUTHORIZATION).unwrap(), "Bearer x");
        assert_eq!(out.get("x-request-id").unwrap(), "abc");
        assert!(out.get(header::HOST).is_none());
        assert!(out.get(header::CONTENT_LENGTH).is_none());
        assert!(out.get(header::CONNECTION).is_none());
        assert!(out.get("keep-alive").is_none());
        assert!(out.get(header::TRANSFER_ENCODING).is_none());
        assert!(out.get("x-trace-hop").is_none());
    }

    #[test]
    fn test_downstream_headers_keep_content_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("42"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("close"));

        let out = downstream_headers(&headers);
        assert_eq!(out.get(header::CONTENT_TYPE).unwrap(), "text/event-stream");
        assert_eq!(out.get(header::CONTENT_LENGTH).unwrap(), "42");
        assert!(out.get(header::TRANSFER_ENCODING).is_none());
        assert!(out.get(header::CONNECTION).is_none());
    }

    #[tokio::test]
    async fn test_probe_health_unreachable() {
        // Port 9 (discard) is closed on test hosts.
        let fwd = forwarder("http://127.0.0.1:9");
        let health = fwd.probe_health().await;
        assert!(!health.status.is_ok());
        assert!(health.detail.is_some());
    }

    async fn forward_completion(
        fwd: &Forwarder,
        stats: &Arc<ProxyStats>,
        gate: &ConcurrencyGate,
    ) -> Response {
        let permit = gate.acquire(Duration::from_secs(1)).await.unwrap();
        let (parts, ()) = Request::builder()
            .method(Method::POST)
            .uri("/v1/completions")
            .body(())
            .unwrap()
            .into_parts();
        let deadline = Instant::now() + fwd.timeout();
        let upstream = fwd.send(&parts, Bytes::new(), deadline).await.unwrap();
        let record = stats.begin(&parts.method, parts.uri.path());
        stream_response(&parts.method, upstream, record, Some(permit), deadline, fwd.timeout())
    }

    #[tokio::test]
    async fn test_fixed_length_body_finishes_on_last_byte() {
        const COMPLETION: &str = r#"{"choices":[{"text":"ok"}]}"#;
        let backend = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::path("/v1/completions"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_string(COMPLETION))
            .mount(&backend)
            .await;

        let fwd = forwarder(&backend.uri());
        let stats = Arc::new(ProxyStats::new());
        let gate = ConcurrencyGate::new(1, 0);
        let response = forward_completion(&fwd, &stats, &gate).await;
        assert_eq!(
            response.headers().get(header::CONTENT_LENGTH).unwrap(),
            COMPLETION.len().to_string().as_str()
        );

        // Read the declared bytes, then drop the body without polling for
        // the end, as hyper does for a Content-Length response.
        let mut body = response.into_body();
        let mut read = 0;
        while read < COMPLETION.len() {
            let frame = body.frame().await.unwrap().unwrap();
            read += frame.into_data().unwrap().len();
        }
        drop(body);

        let snapshot = stats.snapshot(&gate);
        assert_eq!(snapshot.total_requests, 1);
        assert_eq!(snapshot.client_disconnects, 0);
        assert_eq!(snapshot.total_bytes_forwarded, COMPLETION.len() as u64);
        assert_eq!(gate.available(), 1);
    }

    #[tokio::test]
    async fn test_body_dropped_early_counts_as_disconnect() {
        let backend = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::path("/v1/completions"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_string("x".repeat(64)))
            .mount(&backend)
            .await;

        let fwd = forwarder(&backend.uri());
        let stats = Arc::new(ProxyStats::new());
        let gate = ConcurrencyGate::new(1, 0);
        drop(forward_completion(&fwd, &stats, &gate).await);

        let snapshot = stats.snapshot(&gate);
        assert_eq!(snapshot.total_requests, 0);
        assert_eq!(snapshot.client_disconnects, 1);
        assert_eq!(gate.available(), 1);
    }
}
