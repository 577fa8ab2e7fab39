// =============================================================================
// error.rs - THE TAXONOMY OF BAD NEWS
// =============================================================================
//
// Upstream providers fail in many creative ways. The gateway sorts every one
// of them into a small, fixed set of buckets, because the retry loop, the
// circuit breaker and the adaptive rate limiter each need to know exactly
// which kind of bad news they are looking at.
//
// Status table (fixed):
//   timeout          -> Transient
//   5xx              -> Transient
//   429              -> RateLimited (honor Retry-After)
//   404              -> NotFound    (terminal, not counted)
//   401 / 403        -> FatalAuth   (terminal, opens breaker indefinitely)
//   anything else    -> Transient
// =============================================================================

use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::models::{Method, Priority};

/// Retry eligibility of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ErrorClass {
    Retryable,
    NonRetryable,
    Fatal,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::Retryable => write!(f, "RETRYABLE"),
            ErrorClass::NonRetryable => write!(f, "NON_RETRYABLE"),
            ErrorClass::Fatal => write!(f, "FATAL"),
        }
    }
}

/// A classified failure of a single upstream attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamFailure {
    /// Timeouts, 5xx, connection trouble and anything we don't recognize.
    Transient { status: Option<u16>, detail: String },
    /// Provider said 429. A capacity signal, not an availability signal.
    RateLimited { retry_after: Option<Duration> },
    /// The resource does not exist. The provider is fine.
    NotFound,
    /// Credentials rejected. Nobody recovers from this without a human.
    FatalAuth { status: u16 },
}

impl UpstreamFailure {
    pub fn class(&self) -> ErrorClass {
        match self {
            UpstreamFailure::Transient { .. } | UpstreamFailure::RateLimited { .. } => {
                ErrorClass::Retryable
            }
            UpstreamFailure::NotFound => ErrorClass::NonRetryable,
            UpstreamFailure::FatalAuth { .. } => ErrorClass::Fatal,
        }
    }

    /// Only availability failures move the breaker's failure counter.
    pub fn counts_toward_breaker(&self) -> bool {
        matches!(self, UpstreamFailure::Transient { .. })
    }

    pub fn timeout(after: Duration) -> Self {
        UpstreamFailure::Transient {
            status: None,
            detail: format!("timed out after {}ms", after.as_millis()),
        }
    }
}

impl fmt::Display for UpstreamFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamFailure::Transient { status: Some(s), detail } => {
                write!(f, "transient upstream error (HTTP {s}): {detail}")
            }
            UpstreamFailure::Transient { status: None, detail } => {
                write!(f, "transient upstream error: {detail}")
            }
            UpstreamFailure::RateLimited { retry_after: Some(d) } => {
                write!(f, "rate limited by provider, retry after {}s", d.as_secs())
            }
            UpstreamFailure::RateLimited { retry_after: None } => {
                write!(f, "rate limited by provider")
            }
            UpstreamFailure::NotFound => write!(f, "resource not found"),
            UpstreamFailure::FatalAuth { status } => {
                write!(f, "provider rejected credentials (HTTP {status})")
            }
        }
    }
}

/// Map an upstream HTTP status to the taxonomy. `None` means success.
pub fn classify_status(status: u16, retry_after: Option<Duration>) -> Option<UpstreamFailure> {
    match status {
        200..=399 => None,
        404 => Some(UpstreamFailure::NotFound),
        401 | 403 => Some(UpstreamFailure::FatalAuth { status }),
        429 => Some(UpstreamFailure::RateLimited { retry_after }),
        500..=599 => Some(UpstreamFailure::Transient {
            status: Some(status),
            detail: "provider server error".to_string(),
        }),
        other => Some(UpstreamFailure::Transient {
            status: Some(other),
            detail: "unclassified provider response".to_string(),
        }),
    }
}

/// The only error type callers of the gateway ever see.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{endpoint}: {key} not found upstream")]
    NotFound { endpoint: String, key: String },

    #[error("{endpoint}: provider rejected credentials (HTTP {status}); breaker held open until manual override")]
    FatalAuth { endpoint: String, status: u16 },

    #[error("{endpoint}: circuit open, call short-circuited")]
    CircuitOpen {
        endpoint: String,
        retry_in: Option<Duration>,
    },

    #[error("{endpoint}: {failure}")]
    Upstream {
        endpoint: String,
        failure: UpstreamFailure,
    },

    #[error("{endpoint}/{key}: every fallback tier failed (last cause: {cause})")]
    FallbackExhausted {
        endpoint: String,
        key: String,
        #[source]
        cause: Box<GatewayError>,
    },

    #[error("{endpoint}: capacity exceeded, {priority} request shed")]
    CapacityExceeded { endpoint: String, priority: Priority },

    #[error("{endpoint}: no rate-limit token available")]
    Throttled { endpoint: String },

    #[error("unknown endpoint: {0}")]
    UnknownEndpoint(String),

    #[error("{endpoint}: {method} requires an idempotency key")]
    IdempotencyKeyRequired { endpoint: String, method: Method },
}

impl GatewayError {
    pub fn upstream(endpoint: &str, failure: UpstreamFailure) -> Self {
        GatewayError::Upstream {
            endpoint: endpoint.to_string(),
            failure,
        }
    }

    /// Errors the facade answers with data from the fallback chain instead of
    /// surfacing them.
    pub fn is_absorbable(&self) -> bool {
        matches!(
            self,
            GatewayError::CircuitOpen { .. }
                | GatewayError::Throttled { .. }
                | GatewayError::Upstream { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_table() {
        assert_eq!(classify_status(200, None), None);
        assert_eq!(classify_status(304, None), None);
        assert_eq!(classify_status(404, None), Some(UpstreamFailure::NotFound));
        assert_eq!(
            classify_status(401, None),
            Some(UpstreamFailure::FatalAuth { status: 401 })
        );
        assert_eq!(
            classify_status(403, None),
            Some(UpstreamFailure::FatalAuth { status: 403 })
        );
        assert_eq!(
            classify_status(429, Some(Duration::from_secs(7))),
            Some(UpstreamFailure::RateLimited {
                retry_after: Some(Duration::from_secs(7))
            })
        );
        for status in [500, 502, 503, 504] {
            let failure = classify_status(status, None).unwrap();
            assert!(failure.counts_toward_breaker(), "{status} must count");
        }
    }

    #[test]
    fn test_unclassified_defaults_to_transient() {
        let failure = classify_status(418, None).unwrap();
        assert!(matches!(
            failure,
            UpstreamFailure::Transient { status: Some(418), .. }
        ));
        assert_eq!(failure.class(), ErrorClass::Retryable);
    }

    #[test]
    fn test_only_transient_counts_toward_breaker() {
        assert!(!UpstreamFailure::NotFound.counts_toward_breaker());
        assert!(!UpstreamFailure::FatalAuth { status: 401 }.counts_toward_breaker());
        assert!(!UpstreamFailure::RateLimited { retry_after: None }.counts_toward_breaker());
        assert!(UpstreamFailure::timeout(Duration::from_secs(5)).counts_toward_breaker());
    }

    #[test]
    fn test_classes() {
        assert_eq!(UpstreamFailure::NotFound.class(), ErrorClass::NonRetryable);
        assert_eq!(UpstreamFailure::FatalAuth { status: 403 }.class(), ErrorClass::Fatal);
    }
}
