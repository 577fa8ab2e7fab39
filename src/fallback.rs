// =============================================================================
// fallback.rs - PLAN B, C AND D
// =============================================================================
//
// When the primary provider can't answer, the caller still deserves an
// answer. Tiers, in order:
//
//   1. the secondary provider, if the endpoint names one
//   2. a cache entry that is still fresh
//   3. a stale cache entry, loudly labeled with when it was last updated
//   4. FallbackExhausted, the one outage error the platform ever sees
//
// Every answer carries its source tier and freshness, so the leaderboard can
// put a little "may be outdated" badge next to a six-hour-old score.
// =============================================================================

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, CacheWrite, ResponseCache};
use crate::clock::SharedClock;
use crate::error::GatewayError;
use crate::metrics::{EndpointStats, Recent};
use crate::models::{FetchRequest, FetchResponse, Freshness, Method, SourceTier};
use crate::registry::{EndpointRegistry, EndpointRuntime};
use crate::transport::{render_target, OutboundCall, Transport};

#[derive(Debug)]
pub struct FallbackChain {
    registry: Arc<EndpointRegistry>,
    cache: Arc<ResponseCache>,
    transport: Arc<dyn Transport>,
    clock: SharedClock,
    stale_marker: String,
}

impl FallbackChain {
    pub fn new(
        registry: Arc<EndpointRegistry>,
        cache: Arc<ResponseCache>,
        transport: Arc<dyn Transport>,
        clock: SharedClock,
        stale_marker: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            cache,
            transport,
            clock,
            stale_marker: stale_marker.into(),
        }
    }

    /// A fresh cache entry for `key`, if there is one. Used by read-through
    /// endpoints before they spend a token.
    pub fn fresh_from_cache(&self, runtime: &EndpointRuntime, key: &str) -> Option<FetchResponse> {
        let now = self.clock.wall_now();
        let stats = &runtime.stats;
        match self.cache.get(&runtime.config.name, key) {
            Some(entry) if entry.freshness(now) == Freshness::Live => {
                stats.incr_recent(&stats.cache_hits, Recent::CacheHit, self.clock.now());
                Some(self.from_entry(entry, Freshness::Live))
            }
            _ => {
                stats.incr_recent(&stats.cache_misses, Recent::CacheMiss, self.clock.now());
                None
            }
        }
    }

    /// Walk the tiers after the primary failed with `cause`.
    pub async fn resolve(
        &self,
        runtime: &EndpointRuntime,
        request: &FetchRequest,
        cause: GatewayError,
    ) -> Result<FetchResponse, GatewayError> {
        let name = runtime.config.name.as_str();

        // Cached reads cannot stand in for a write.
        if request.method == Method::Get {
            if let Some(response) = self.try_secondary(runtime, request).await {
                return Ok(response);
            }

            let now = self.clock.wall_now();
            let stats = &runtime.stats;
            if let Some(entry) = self.cache.get(name, &request.key) {
                stats.incr_recent(&stats.cache_hits, Recent::CacheHit, self.clock.now());
                let freshness = entry.freshness(now);
                if freshness == Freshness::Stale {
                    EndpointStats::incr(&runtime.stats.stale_served);
                    warn!(
                        endpoint = name,
                        key = %request.key,
                        age_secs = entry.age(now).as_secs(),
                        cause = %cause,
                        "Serving STALE cache entry"
                    );
                } else {
                    info!(endpoint = name, key = %request.key, cause = %cause, "Serving cached entry");
                }
                return Ok(self.from_entry(entry, freshness));
            }
            stats.incr_recent(&stats.cache_misses, Recent::CacheMiss, self.clock.now());
        }

        EndpointStats::incr(&runtime.stats.fallback_exhausted);
        warn!(endpoint = name, key = %request.key, cause = %cause, "💀 Every fallback tier failed");
        Err(GatewayError::FallbackExhausted {
            endpoint: name.to_string(),
            key: request.key.clone(),
            cause: Box::new(cause),
        })
    }

    /// One attempt against the secondary provider, through its own breaker
    /// and its own limiter. Never queues, never retries.
    async fn try_secondary(
        &self,
        primary: &EndpointRuntime,
        request: &FetchRequest,
    ) -> Option<FetchResponse> {
        let secondary_name = primary.config.secondary.as_deref()?;
        let secondary = self.registry.get(secondary_name)?;

        if secondary.health.fallback_active() {
            debug!(endpoint = secondary_name, "Secondary declared unhealthy, skipped");
            return None;
        }
        if !secondary.limiter.try_take().await {
            EndpointStats::incr(&secondary.stats.throttled);
            debug!(endpoint = secondary_name, "Secondary has no token, skipped");
            return None;
        }
        let guard = match secondary.breaker.try_acquire() {
            Ok(guard) => guard,
            Err(_) => {
                secondary.limiter.refund();
                EndpointStats::incr(&secondary.stats.circuit_rejections);
                return None;
            }
        };

        EndpointStats::incr(&secondary.stats.calls);
        let call = OutboundCall {
            method: request.method,
            target: render_target(&secondary.config.target, &request.key),
            timeout: secondary.config.timeout,
            idempotency_key: request.idempotency_key.clone(),
        };
        match secondary
            .perform(&*self.transport, &*self.clock, &call)
            .await
        {
            Ok(response) => {
                guard.succeed();
                EndpointStats::incr(&secondary.stats.primary_success);
                EndpointStats::incr(&primary.stats.secondary_served);

                let fetched_at = self.clock.wall_now();
                self.cache.put(
                    &primary.config.name,
                    &request.key,
                    CacheWrite {
                        payload: response.body.clone(),
                        fetched_at,
                        ttl: primary.config.cache_ttl,
                        source: SourceTier::Secondary,
                        served_by: secondary_name.to_string(),
                        permanent_after: primary.config.stale_correction_window,
                    },
                );
                info!(
                    endpoint = %primary.config.name,
                    secondary = secondary_name,
                    key = %request.key,
                    "Served by secondary provider"
                );
                Some(FetchResponse {
                    payload: response.body,
                    source: SourceTier::Secondary,
                    freshness: Freshness::Live,
                    fetched_at,
                    served_by: secondary_name.to_string(),
                    warning: None,
                })
            }
            Err(failure) => {
                debug!(endpoint = secondary_name, failure = %failure, "Secondary failed too");
                secondary.record_failure(guard, &failure).await;
                None
            }
        }
    }

    fn from_entry(&self, entry: CacheEntry, freshness: Freshness) -> FetchResponse {
        let warning = (freshness == Freshness::Stale).then(|| {
            format!(
                "{} (last updated {})",
                self.stale_marker,
                entry.fetched_at.to_rfc3339()
            )
        });
        FetchResponse {
            payload: entry.payload,
            source: SourceTier::Cache,
            freshness,
            fetched_at: entry.fetched_at,
            served_by: entry.served_by,
            warning,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertSink;
    use crate::circuit_breaker::CircuitState;
    use crate::clock::{Clock, ManualClock};
    use crate::config::EndpointConfig;
    use crate::models::DataCategory;
    use crate::testing::{test_config, Reply, ScriptedTransport, TEST_HOST};
    use bytes::Bytes;
    use std::time::Duration;

    struct Fixture {
        clock: Arc<ManualClock>,
        transport: Arc<ScriptedTransport>,
        registry: Arc<EndpointRegistry>,
        cache: Arc<ResponseCache>,
        chain: FallbackChain,
    }

    fn fixture() -> Fixture {
        let mut config = test_config();
        let mut backup = EndpointConfig::new(
            "news_backup",
            format!("{TEST_HOST}/news_backup/{{key}}"),
            DataCategory::News,
        );
        backup.failure_threshold = 1;
        config.endpoints.push(backup);
        for ep in &mut config.endpoints {
            if ep.name == "player_news" {
                ep.secondary = Some("news_backup".to_string());
            }
        }

        let clock = Arc::new(ManualClock::new());
        let transport = Arc::new(ScriptedTransport::new());
        let registry = Arc::new(EndpointRegistry::build(
            &config,
            clock.clone(),
            AlertSink::disabled(),
            None,
        ));
        let cache = Arc::new(ResponseCache::new(64));
        let chain = FallbackChain::new(
            registry.clone(),
            cache.clone(),
            transport.clone(),
            clock.clone(),
            "Data may be outdated",
        );
        Fixture {
            clock,
            transport,
            registry,
            cache,
            chain,
        }
    }

    fn seed(f: &Fixture, endpoint: &str, key: &str, body: &'static str, ttl: Duration) {
        f.cache.put(
            endpoint,
            key,
            CacheWrite {
                payload: Bytes::from_static(body.as_bytes()),
                fetched_at: f.clock.wall_now(),
                ttl,
                source: SourceTier::Primary,
                served_by: endpoint.to_string(),
                permanent_after: None,
            },
        );
    }

    fn outage(endpoint: &str) -> GatewayError {
        GatewayError::CircuitOpen {
            endpoint: endpoint.to_string(),
            retry_in: None,
        }
    }

    #[tokio::test]
    async fn test_nothing_left_is_exhausted() {
        let f = fixture();
        let runtime = f.registry.get("schedule").unwrap();
        let err = f
            .chain
            .resolve(&runtime, &FetchRequest::get("schedule", "2024"), outage("schedule"))
            .await
            .unwrap_err();
        match err {
            GatewayError::FallbackExhausted { endpoint, key, cause } => {
                assert_eq!(endpoint, "schedule");
                assert_eq!(key, "2024");
                assert!(matches!(*cause, GatewayError::CircuitOpen { .. }));
            }
            other => panic!("expected FallbackExhausted, got {other:?}"),
        }
        let stats = runtime.stats.snapshot();
        assert_eq!(stats.cache_misses, 1);
        assert_eq!(stats.fallback_exhausted, 1);
    }

    #[tokio::test]
    async fn test_fresh_cache_then_stale_with_marker() {
        let f = fixture();
        let runtime = f.registry.get("schedule").unwrap();
        seed(&f, "schedule", "2024", "week 1", Duration::from_secs(3600));
        let request = FetchRequest::get("schedule", "2024");

        let fresh = f.chain.resolve(&runtime, &request, outage("schedule")).await.unwrap();
        assert_eq!(fresh.source, SourceTier::Cache);
        assert_eq!(fresh.freshness, Freshness::Live);
        assert!(fresh.warning.is_none());

        f.clock.advance(Duration::from_secs(6 * 3600));
        let stale = f.chain.resolve(&runtime, &request, outage("schedule")).await.unwrap();
        assert_eq!(stale.freshness, Freshness::Stale);
        assert_eq!(stale.payload, "week 1");
        let warning = stale.warning.unwrap();
        assert!(warning.starts_with("Data may be outdated"));
        assert!(warning.contains(&stale.fetched_at.to_rfc3339()));
        assert_eq!(runtime.stats.snapshot().stale_served, 1);
    }

    #[tokio::test]
    async fn test_secondary_answers_and_fills_cache() {
        let f = fixture();
        f.transport.push("news_backup", Reply::Ok("backup news"));
        let runtime = f.registry.get("player_news").unwrap();
        let request = FetchRequest::get("player_news", "4314");

        let resp = f.chain.resolve(&runtime, &request, outage("player_news")).await.unwrap();
        assert_eq!(resp.source, SourceTier::Secondary);
        assert_eq!(resp.served_by, "news_backup");
        assert_eq!(resp.payload, "backup news");

        let cached = f.cache.get("player_news", "4314").unwrap();
        assert_eq!(cached.source, SourceTier::Secondary);
        assert_eq!(runtime.stats.snapshot().secondary_served, 1);
    }

    #[tokio::test]
    async fn test_secondary_failure_trips_its_own_breaker_and_falls_through() {
        let f = fixture();
        f.transport.push("news_backup", Reply::Status(502));
        seed(&f, "player_news", "4314", "old news", Duration::from_secs(300));
        let runtime = f.registry.get("player_news").unwrap();

        let resp = f
            .chain
            .resolve(&runtime, &FetchRequest::get("player_news", "4314"), outage("player_news"))
            .await
            .unwrap();
        assert_eq!(resp.source, SourceTier::Cache);

        let backup = f.registry.get("news_backup").unwrap();
        assert_eq!(backup.breaker.state(), CircuitState::Open);
        assert_eq!(runtime.breaker.state(), CircuitState::Closed);

        // Open secondary is skipped without a network call.
        f.chain
            .resolve(&runtime, &FetchRequest::get("player_news", "4314"), outage("player_news"))
            .await
            .unwrap();
        assert_eq!(f.transport.calls_to("news_backup"), 1);
    }

    #[tokio::test]
    async fn test_writes_never_served_from_cache() {
        let f = fixture();
        seed(&f, "schedule", "2024", "week 1", Duration::from_secs(3600));
        let runtime = f.registry.get("schedule").unwrap();
        let request = FetchRequest::get("schedule", "2024")
            .method(Method::Post)
            .idempotency_key("k-1");
        let err = f.chain.resolve(&runtime, &request, outage("schedule")).await.unwrap_err();
        assert!(matches!(err, GatewayError::FallbackExhausted { .. }));
    }

    #[tokio::test]
    async fn test_read_through_counts_hits_and_misses() {
        let f = fixture();
        let runtime = f.registry.get("player_profile").unwrap();
        assert!(f.chain.fresh_from_cache(&runtime, "18890").is_none());
        seed(&f, "player_profile", "18890", "bio", Duration::from_secs(3600));
        let hit = f.chain.fresh_from_cache(&runtime, "18890").unwrap();
        assert_eq!(hit.source, SourceTier::Cache);
        let stats = runtime.stats.snapshot();
        assert_eq!((stats.cache_hits, stats.cache_misses), (1, 1));
    }
}
