// =============================================================================
// transport.rs - THE WIRE
// =============================================================================
//
// The gateway never speaks HTTP itself. It asks a Transport to "perform a
// call" (method, target, timeout) and gets back a status, a body and whatever
// rate-limit hints the provider was kind enough to send.
//
// ReqwestTransport is the production implementation. Tests plug in a scripted
// fake and never touch a socket.
// =============================================================================

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::clock::Clock;
use crate::error::UpstreamFailure;
use crate::models::Method;

/// One outbound request, fully resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundCall {
    pub method: Method,
    pub target: String,
    pub timeout: Duration,
    pub idempotency_key: Option<String>,
}

/// Provider quota headers, when present.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RateLimitHeaders {
    pub limit: Option<u64>,
    pub remaining: Option<u64>,
    /// Seconds (or epoch seconds, provider-dependent) until the quota resets.
    pub reset: Option<u64>,
}

impl RateLimitHeaders {
    pub fn is_empty(&self) -> bool {
        self.limit.is_none() && self.remaining.is_none() && self.reset.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Bytes,
    pub retry_after: Option<Duration>,
    pub rate_limit: Option<RateLimitHeaders>,
}

impl TransportResponse {
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            retry_after: None,
            rate_limit: None,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: Bytes::new(),
            retry_after: None,
            rate_limit: None,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("transport I/O error: {0}")]
    Io(String),
    #[error("invalid target URL {target}: {reason}")]
    InvalidTarget { target: String, reason: String },
}

impl From<TransportError> for UpstreamFailure {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Timeout(after) => UpstreamFailure::timeout(after),
            other => UpstreamFailure::Transient {
                status: None,
                detail: other.to_string(),
            },
        }
    }
}

/// The "perform network call" capability.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    async fn perform(&self, call: &OutboundCall) -> Result<TransportResponse, TransportError>;
}

/// Run `call` against `transport`, giving up once `call.timeout` has passed
/// on `clock`. The in-flight future is dropped on timeout.
pub async fn perform_with_deadline(
    transport: &dyn Transport,
    clock: &dyn Clock,
    call: &OutboundCall,
) -> Result<TransportResponse, TransportError> {
    tokio::select! {
        biased;
        result = transport.perform(call) => result,
        _ = clock.sleep(call.timeout) => Err(TransportError::Timeout(call.timeout)),
    }
}

/// Substitute the URL-encoded request key into a `{key}` template.
pub fn render_target(template: &str, key: &str) -> String {
    template.replace("{key}", &urlencoding::encode(key))
}

/// `Retry-After` is either delta-seconds or an HTTP date.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?;
    Some(
        (at.with_timezone(&Utc) - now)
            .to_std()
            .unwrap_or(Duration::ZERO),
    )
}

/// HTTP transport on reqwest.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    api_key: Option<String>,
}

impl ReqwestTransport {
    pub fn new(user_agent: &str, api_key: Option<String>) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        Ok(Self { client, api_key })
    }
}

fn header_u64(headers: &reqwest::header::HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse().ok())
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn perform(&self, call: &OutboundCall) -> Result<TransportResponse, TransportError> {
        let url = url::Url::parse(&call.target).map_err(|e| TransportError::InvalidTarget {
            target: call.target.clone(),
            reason: e.to_string(),
        })?;

        let method = match call.method {
            Method::Get => reqwest::Method::GET,
            Method::Head => reqwest::Method::HEAD,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        };

        let mut request = self
            .client
            .request(method, url)
            .timeout(call.timeout)
            .header("Accept", "application/json");
        if let Some(key) = &self.api_key {
            request = request.header("Ocp-Apim-Subscription-Key", key);
        }
        if let Some(idempotency_key) = &call.idempotency_key {
            request = request.header("Idempotency-Key", idempotency_key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(call.timeout)
            } else if e.is_connect() {
                TransportError::Connect(e.to_string())
            } else {
                TransportError::Io(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let headers = response.headers();
        let retry_after = headers
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| parse_retry_after(s, Utc::now()));
        let rate_limit = RateLimitHeaders {
            limit: header_u64(headers, "x-ratelimit-limit"),
            remaining: header_u64(headers, "x-ratelimit-remaining"),
            reset: header_u64(headers, "x-ratelimit-reset"),
        };

        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(call.timeout)
            } else {
                TransportError::Io(e.to_string())
            }
        })?;

        debug!(target = %call.target, status, bytes = body.len(), "Upstream call completed");

        Ok(TransportResponse {
            status,
            body,
            retry_after,
            rate_limit: Some(rate_limit).filter(|h| !h.is_empty()),
        })
    }
}
