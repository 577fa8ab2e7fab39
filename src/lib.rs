//! Gridiron Gateway: the resilience layer between the fantasy platform and
//! the football data providers it cannot live without.
//!
//! Every outbound call goes through [`gateway::Gateway::fetch`], which runs
//! it past a token bucket, a circuit breaker, a retry loop with jittered
//! backoff and, when all of that fails, a fallback chain of secondary
//! provider, fresh cache and honestly-labeled stale cache.

pub mod alerts;
pub mod cache;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod fallback;
pub mod gateway;
pub mod health;
pub mod metrics;
pub mod models;
pub mod rate_limiter;
pub mod registry;
pub mod retry;
pub mod transport;

#[cfg(test)]
mod testing;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::GatewayConfig;
pub use error::GatewayError;
pub use gateway::Gateway;
pub use models::{FetchRequest, FetchResponse, Freshness, Priority, SourceTier};
