// =============================================================================
// gateway.rs - THE FRONT DOOR
// =============================================================================
//
// Every outbound call the platform makes comes through Gateway::fetch. The
// order never changes:
//
//   rate limiter -> circuit breaker -> retry loop -> fallback chain
//
// Transient trouble and provider throttling are absorbed here. Callers see
// data tagged with where it came from and how fresh it is, or exactly one of
// a few terminal errors (NotFound, FatalAuth, CapacityExceeded,
// FallbackExhausted, and the usage errors).
// =============================================================================

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::alerts::{AlertKind, AlertSink};
use crate::cache::{CacheWrite, ResponseCache};
use crate::circuit_breaker::CircuitState;
use crate::clock::SharedClock;
use crate::config::{ApiTier, GatewayConfig};
use crate::error::{GatewayError, UpstreamFailure};
use crate::fallback::FallbackChain;
use crate::metrics::{EndpointSnapshot, EndpointStats, MetricsSnapshot, Recent};
use crate::models::{FetchRequest, FetchResponse, Freshness, Method, Priority, SourceTier};
use crate::rate_limiter::store::TokenStore;
use crate::registry::{EndpointRegistry, EndpointRuntime};
use crate::retry::{RetryContext, RetryDecision, RetryPolicy};
use crate::transport::{render_target, OutboundCall, Transport};

/// One upstream fetch per (endpoint, key) at a time. Concurrent cold reads of
/// the same key line up behind the first and then read what it cached.
#[derive(Debug, Default)]
struct InFlight {
    keys: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

struct FlightTicket {
    key: String,
    slot: Arc<tokio::sync::Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
    keys: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
    waited: bool,
}

impl InFlight {
    async fn join(&self, endpoint: &str, key: &str) -> FlightTicket {
        let flight_key = format!("{endpoint}\u{1f}{key}");
        let slot = self
            .keys
            .lock()
            .entry(flight_key.clone())
            .or_default()
            .clone();
        let (guard, waited) = match slot.clone().try_lock_owned() {
            Ok(guard) => (guard, false),
            Err(_) => (slot.clone().lock_owned().await, true),
        };
        FlightTicket {
            key: flight_key,
            slot,
            guard: Some(guard),
            keys: self.keys.clone(),
            waited,
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.keys.lock().len()
    }
}

impl Drop for FlightTicket {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut keys = self.keys.lock();
        // Ours plus the map's: nobody else is waiting.
        if Arc::strong_count(&self.slot) == 2 {
            keys.remove(&self.key);
        }
    }
}

#[derive(Debug)]
pub struct Gateway {
    registry: Arc<EndpointRegistry>,
    cache: Arc<ResponseCache>,
    transport: Arc<dyn Transport>,
    fallback: FallbackChain,
    retry: RetryPolicy,
    clock: SharedClock,
    alerts: AlertSink,
    in_flight: InFlight,
    started_at: Instant,
}

impl Gateway {
    /// Wire up every endpoint from `config`. `store` backs the distributed
    /// rate limiter and is ignored unless distributed mode is on.
    pub fn new(
        config: &GatewayConfig,
        transport: Arc<dyn Transport>,
        clock: SharedClock,
        alerts: AlertSink,
        store: Option<Arc<dyn TokenStore>>,
    ) -> Self {
        let registry = Arc::new(EndpointRegistry::build(
            config,
            clock.clone(),
            alerts.clone(),
            store,
        ));
        let cache = Arc::new(ResponseCache::new(config.cache_capacity));
        let fallback = FallbackChain::new(
            registry.clone(),
            cache.clone(),
            transport.clone(),
            clock.clone(),
            config.stale_marker.clone(),
        );
        info!(
            endpoints = registry.len(),
            tier = ?config.rate_limit.tier,
            distributed = config.rate_limit.distributed,
            "🏈 Gateway assembled"
        );
        Self {
            registry,
            cache,
            transport,
            fallback,
            retry: RetryPolicy::new(&config.retry),
            in_flight: InFlight::default(),
            started_at: clock.now(),
            clock,
            alerts,
        }
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    /// Fetch `request.key` from `request.endpoint`.
    pub async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, GatewayError> {
        let runtime = self
            .registry
            .get(&request.endpoint)
            .ok_or_else(|| GatewayError::UnknownEndpoint(request.endpoint.clone()))?;

        if !request.method.is_idempotent() && request.idempotency_key.is_none() {
            return Err(GatewayError::IdempotencyKeyRequired {
                endpoint: request.endpoint.clone(),
                method: request.method,
            });
        }
        EndpointStats::incr(&runtime.stats.calls);

        if runtime.config.read_through && request.method == Method::Get {
            if let Some(hit) = self.fallback.fresh_from_cache(&runtime, &request.key) {
                debug!(endpoint = %request.endpoint, key = %request.key, "Read-through cache hit");
                return Ok(hit);
            }
        }

        let _ticket = if request.method == Method::Get {
            let ticket = self.in_flight.join(&request.endpoint, &request.key).await;
            if ticket.waited {
                if let Some(hit) = self.fallback.fresh_from_cache(&runtime, &request.key) {
                    debug!(
                        endpoint = %request.endpoint,
                        key = %request.key,
                        "Answered by a concurrent fetch"
                    );
                    return Ok(hit);
                }
            }
            Some(ticket)
        } else {
            None
        };

        match self.fetch_primary(&runtime, &request).await {
            Ok(response) => Ok(response),
            Err(e) if e.is_absorbable() => self.fallback.resolve(&runtime, &request, e).await,
            Err(e) => Err(e),
        }
    }

    async fn fetch_primary(
        &self,
        runtime: &EndpointRuntime,
        request: &FetchRequest,
    ) -> Result<FetchResponse, GatewayError> {
        let name = runtime.config.name.as_str();

        if runtime.health.fallback_active() {
            EndpointStats::incr(&runtime.stats.circuit_rejections);
            return Err(GatewayError::CircuitOpen {
                endpoint: name.to_string(),
                retry_in: None,
            });
        }

        if let Err(e) = runtime.limiter.acquire(request.priority).await {
            match &e {
                GatewayError::CapacityExceeded { .. } => runtime.stats.incr_recent(
                    &runtime.stats.shed,
                    Recent::Shed,
                    self.clock.now(),
                ),
                _ => EndpointStats::incr(&runtime.stats.throttled),
            }
            return Err(e);
        }

        let mut ctx = RetryContext::new(self.retry.clone(), request.idempotency_key.clone());
        let mut call = OutboundCall {
            method: request.method,
            target: render_target(&runtime.config.target, &request.key),
            timeout: runtime.config.timeout,
            idempotency_key: ctx.idempotency_key.clone(),
        };

        loop {
            let guard = match runtime.breaker.try_acquire() {
                Ok(guard) => guard,
                Err(rejection) => {
                    if !runtime.limiter.refund() {
                        debug!(endpoint = name, "Shared token spent on a call the breaker refused");
                    }
                    EndpointStats::incr(&runtime.stats.circuit_rejections);
                    return Err(GatewayError::CircuitOpen {
                        endpoint: name.to_string(),
                        retry_in: rejection.retry_in,
                    });
                }
            };

            call.timeout = ctx.attempt_timeout(runtime.config.timeout);
            let failure = match runtime
                .perform(&*self.transport, &*self.clock, &call)
                .await
            {
                Ok(response) => {
                    guard.succeed();
                    EndpointStats::incr(&runtime.stats.primary_success);
                    return Ok(self.store_primary(runtime, request, response.body));
                }
                Err(failure) => failure,
            };
            runtime.record_failure(guard, &failure).await;

            match &failure {
                UpstreamFailure::NotFound => {
                    return Err(GatewayError::NotFound {
                        endpoint: name.to_string(),
                        key: request.key.clone(),
                    });
                }
                UpstreamFailure::FatalAuth { status } => {
                    return Err(GatewayError::FatalAuth {
                        endpoint: name.to_string(),
                        status: *status,
                    });
                }
                _ => {}
            }

            match ctx.on_failure(&failure) {
                RetryDecision::GiveUp => {
                    debug!(
                        endpoint = name,
                        attempts = ctx.attempts_made(),
                        failure = %failure,
                        "Giving up on primary"
                    );
                    return Err(GatewayError::upstream(name, failure));
                }
                RetryDecision::RetryAfter(delay) => {
                    debug!(
                        endpoint = name,
                        attempt = ctx.attempts_made(),
                        delay_ms = delay.as_millis() as u64,
                        failure = %failure,
                        "Retrying after backoff"
                    );
                    self.clock.sleep(delay).await;
                    if !runtime.limiter.try_take().await {
                        debug!(endpoint = name, "No token for a retry, falling back");
                        return Err(GatewayError::upstream(name, failure));
                    }
                    EndpointStats::incr(&runtime.stats.retries);
                }
            }
        }
    }

    fn store_primary(
        &self,
        runtime: &EndpointRuntime,
        request: &FetchRequest,
        payload: bytes::Bytes,
    ) -> FetchResponse {
        let name = runtime.config.name.as_str();
        let fetched_at = self.clock.wall_now();
        if request.method == Method::Get {
            self.cache.put(
                name,
                &request.key,
                CacheWrite {
                    payload: payload.clone(),
                    fetched_at,
                    ttl: runtime.config.cache_ttl,
                    source: SourceTier::Primary,
                    served_by: name.to_string(),
                    permanent_after: runtime.config.stale_correction_window,
                },
            );
        }
        FetchResponse {
            payload,
            source: SourceTier::Primary,
            freshness: Freshness::Live,
            fetched_at,
            served_by: name.to_string(),
            warning: None,
        }
    }

    /// Pre-fetch `keys` at LOW priority, ahead of a game window. Returns how
    /// many were fetched fresh from a provider.
    pub async fn warm<I, K>(&self, endpoint: &str, keys: I) -> Result<usize, GatewayError>
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        if self.registry.get(endpoint).is_none() {
            return Err(GatewayError::UnknownEndpoint(endpoint.to_string()));
        }
        let mut warmed = 0;
        for key in keys {
            let request = FetchRequest::get(endpoint, key).priority(Priority::Low);
            match self.fetch(request).await {
                Ok(resp) if resp.source != SourceTier::Cache => warmed += 1,
                Ok(_) => {}
                Err(e) => debug!(endpoint, error = %e, "Warm-up fetch failed"),
            }
        }
        info!(endpoint, warmed, "🔥 Cache warmed");
        Ok(warmed)
    }

    /// Mark one cached entry stale ahead of its TTL.
    pub fn invalidate(&self, endpoint: &str, key: &str, reason: &str) -> Result<bool, GatewayError> {
        if self.registry.get(endpoint).is_none() {
            return Err(GatewayError::UnknownEndpoint(endpoint.to_string()));
        }
        let marked = self.cache.invalidate(endpoint, key);
        info!(endpoint, key, reason, marked, "Cache entry invalidated");
        Ok(marked)
    }

    /// Mark every cached entry of `endpoint` stale.
    pub fn invalidate_endpoint(&self, endpoint: &str, reason: &str) -> Result<usize, GatewayError> {
        if self.registry.get(endpoint).is_none() {
            return Err(GatewayError::UnknownEndpoint(endpoint.to_string()));
        }
        let entries = self.cache.invalidate_endpoint(endpoint);
        warn!(endpoint, reason, entries, "Cache invalidated for whole endpoint");
        self.alerts
            .raise(endpoint, AlertKind::CacheInvalidated { entries });
        Ok(entries)
    }

    /// Operator override: the upstream is confirmed healthy. Closes the
    /// breaker (even one held open by rejected credentials) and ends any
    /// probe-declared outage.
    pub fn force_close(&self, endpoint: &str, operator: &str) -> Result<(), GatewayError> {
        let runtime = self
            .registry
            .get(endpoint)
            .ok_or_else(|| GatewayError::UnknownEndpoint(endpoint.to_string()))?;
        runtime.breaker.manual_reset(operator);
        runtime.health.mark_healthy();
        Ok(())
    }

    /// Switch provider plans at runtime. Every endpoint limiter and the
    /// global pool are resized to the new tier without a restart.
    pub fn set_tier(&self, tier: ApiTier) {
        self.registry.set_tier(tier);
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        let mut endpoints = Vec::with_capacity(self.registry.len());
        for runtime in self.registry.iter() {
            endpoints.push(EndpointSnapshot {
                name: runtime.config.name.clone(),
                breaker: runtime.breaker.snapshot(),
                limiter: runtime.limiter.snapshot().await,
                health: runtime.health.snapshot(),
                stats: runtime.stats.snapshot(),
                recent: runtime.stats.recent.snapshot(self.clock.now()),
            });
        }
        let all_closed = endpoints
            .iter()
            .all(|e| e.breaker.state == CircuitState::Closed && e.health.declared_healthy);
        MetricsSnapshot {
            uptime_seconds: self
                .clock
                .now()
                .saturating_duration_since(self.started_at)
                .as_secs(),
            status: if all_closed { "healthy" } else { "degraded" }.to_string(),
            cache_entries: self.cache.len(),
            endpoints,
            alert_publisher: None,
        }
    }
}
