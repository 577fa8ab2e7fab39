// =============================================================================
// registry.rs - WHO'S WHO
// =============================================================================
//
// Everything the gateway knows about one upstream endpoint lives in an
// EndpointRuntime: its config, its breaker, its limiter, its probe record and
// its counters. The registry owns them all, built once from config and handed
// around by Arc. No globals, so every test gets its own isolated set.
// =============================================================================

use parking_lot::Mutex;
use portable_atomic::{AtomicBool, Ordering};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::alerts::{AlertKind, AlertSink};
use crate::circuit_breaker::{BreakerSettings, CallGuard, CircuitBreaker};
use crate::clock::{Clock, SharedClock};
use crate::config::{ApiTier, EndpointConfig, GatewayConfig, StatsConfig};
use crate::error::{classify_status, UpstreamFailure};
use crate::health::HealthState;
use crate::metrics::{EndpointStats, Recent};
use crate::rate_limiter::store::TokenStore;
use crate::rate_limiter::{EndpointLimiter, GlobalPool, LimiterSettings, SharedCounter};
use crate::transport::{perform_with_deadline, OutboundCall, Transport, TransportResponse};

pub const TOKEN_KEY_PREFIX: &str = "gridiron:tokens";

/// Live state of one endpoint.
#[derive(Debug)]
pub struct EndpointRuntime {
    pub config: EndpointConfig,
    pub breaker: CircuitBreaker,
    pub limiter: EndpointLimiter,
    pub health: HealthState,
    pub stats: EndpointStats,
    error_alert: StatsConfig,
    error_alert_armed: AtomicBool,
    alerts: AlertSink,
}

impl EndpointRuntime {
    /// One upstream attempt under this endpoint's timeout, classified.
    /// Latency and provider quota headers land in the stats either way.
    pub async fn perform(
        &self,
        transport: &dyn Transport,
        clock: &dyn Clock,
        call: &OutboundCall,
    ) -> Result<TransportResponse, UpstreamFailure> {
        let started = clock.now();
        let result = perform_with_deadline(transport, clock, call).await;
        let latency = clock.now().saturating_duration_since(started);
        self.stats
            .last_latency_ms
            .store(latency.as_secs_f64() * 1000.0, Ordering::Relaxed);

        let outcome = result.map_err(UpstreamFailure::from).and_then(|response| {
            if let Some(headers) = response.rate_limit {
                self.stats.record_headers(headers);
            }
            match classify_status(response.status, response.retry_after) {
                None => Ok(response),
                Some(failure) => Err(failure),
            }
        });
        self.note_outcome(&outcome, clock.now());
        outcome
    }

    /// Feed the rolling error rate and alert once each time it crosses the
    /// configured threshold. Provider throttling is not an error here.
    fn note_outcome(
        &self,
        outcome: &Result<TransportResponse, UpstreamFailure>,
        now: std::time::Instant,
    ) {
        let kind = match outcome {
            Ok(_) | Err(UpstreamFailure::NotFound) => Recent::UpstreamOk,
            Err(UpstreamFailure::Transient { .. }) | Err(UpstreamFailure::FatalAuth { .. }) => {
                Recent::UpstreamError
            }
            Err(UpstreamFailure::RateLimited { .. }) => return,
        };
        self.stats.recent.record(kind, now);

        let (attempts, rate) = self.stats.recent.error_rate(now);
        let percent = rate * 100.0;
        if attempts < self.error_alert.error_rate_min_samples {
            return;
        }
        if percent > self.error_alert.error_rate_alert_percent {
            if self.error_alert_armed.swap(false, Ordering::AcqRel) {
                warn!(
                    endpoint = %self.config.name,
                    error_rate_percent = percent,
                    attempts,
                    "Upstream error rate over the alert threshold"
                );
                self.alerts.raise(
                    &self.config.name,
                    AlertKind::HighErrorRate {
                        error_rate_percent: percent,
                        attempts,
                        window_secs: self.stats.recent.width().as_secs(),
                    },
                );
            }
        } else {
            self.error_alert_armed.store(true, Ordering::Release);
        }
    }

    /// Settle a failed attempt: breaker bookkeeping, adaptive rate and
    /// counters. Only transient failures count against the breaker.
    pub async fn record_failure(&self, guard: CallGuard<'_>, failure: &UpstreamFailure) {
        match failure {
            UpstreamFailure::Transient { .. } => {
                guard.fail();
                EndpointStats::incr(&self.stats.transient_failures);
            }
            UpstreamFailure::RateLimited { retry_after } => {
                guard.release();
                EndpointStats::incr(&self.stats.rate_limit_hits);
                self.limiter.on_rate_limited(*retry_after).await;
            }
            UpstreamFailure::NotFound => {
                guard.release();
                EndpointStats::incr(&self.stats.not_found);
            }
            UpstreamFailure::FatalAuth { status } => {
                guard.release();
                EndpointStats::incr(&self.stats.fatal_auth);
                self.breaker.open_indefinitely(*status);
            }
        }
    }
}

#[derive(Debug)]
pub struct EndpointRegistry {
    endpoints: Vec<Arc<EndpointRuntime>>,
    by_name: HashMap<String, usize>,
    global: Option<Arc<GlobalPool>>,
    tier: Mutex<ApiTier>,
}

impl EndpointRegistry {
    /// Build one runtime per configured endpoint, in config order.
    ///
    /// `store` is only used when distributed rate limiting is switched on.
    pub fn build(
        config: &GatewayConfig,
        clock: SharedClock,
        alerts: AlertSink,
        store: Option<Arc<dyn TokenStore>>,
    ) -> Self {
        let rl = &config.rate_limit;
        let tier_limit = f64::from(rl.tier.limit_per_minute());
        let global = rl
            .global_pool
            .then(|| Arc::new(GlobalPool::new(tier_limit, clock.clone())));
        let shared_store = store.filter(|_| rl.distributed);

        let mut endpoints = Vec::with_capacity(config.endpoints.len());
        let mut by_name = HashMap::with_capacity(config.endpoints.len());

        for ep in &config.endpoints {
            let per_minute = f64::from(ep.rate_limit_per_minute).min(tier_limit);
            let settings = LimiterSettings {
                per_minute,
                queue_enabled: rl.queue_enabled,
                max_queue_size: rl.max_queue_size,
                max_queue_wait: rl.max_queue_wait,
                alert_threshold_percent: rl.alert_threshold_percent,
                adaptive: rl.adaptive.clone(),
            };
            let shared = shared_store.as_ref().map(|store| SharedCounter {
                store: Arc::clone(store),
                instance_count: rl.instance_count,
                key_prefix: TOKEN_KEY_PREFIX.to_string(),
            });

            let breaker = CircuitBreaker::new(
                ep.name.clone(),
                BreakerSettings {
                    failure_threshold: ep.failure_threshold,
                    cool_down: ep.cool_down,
                    max_cool_down: ep.max_cool_down,
                    monitoring_window: config.breaker_monitoring_window,
                },
                clock.clone(),
                alerts.clone(),
            );
            let limiter = EndpointLimiter::new(
                ep.name.clone(),
                settings,
                shared,
                global.clone(),
                clock.clone(),
                alerts.clone(),
            );

            info!(
                endpoint = %ep.name,
                category = %ep.category,
                per_minute,
                distributed = shared_store.is_some(),
                secondary = ep.secondary.as_deref().unwrap_or("-"),
                "Endpoint registered"
            );

            by_name.insert(ep.name.clone(), endpoints.len());
            endpoints.push(Arc::new(EndpointRuntime {
                config: ep.clone(),
                breaker,
                limiter,
                health: HealthState::default(),
                stats: EndpointStats::with_window(config.stats.window),
                error_alert: config.stats.clone(),
                error_alert_armed: AtomicBool::new(true),
                alerts: alerts.clone(),
            }));
        }

        Self {
            endpoints,
            by_name,
            global,
            tier: Mutex::new(rl.tier),
        }
    }

    pub fn tier(&self) -> ApiTier {
        *self.tier.lock()
    }

    /// Move to another provider plan without a restart. Every endpoint's
    /// ceiling becomes min(its configured rate, the new tier limit), and the
    /// global pool is resized to the tier.
    pub fn set_tier(&self, tier: ApiTier) {
        let previous = std::mem::replace(&mut *self.tier.lock(), tier);
        let tier_limit = f64::from(tier.limit_per_minute());
        if let Some(global) = &self.global {
            global.reconfigure(tier_limit);
        }
        for runtime in &self.endpoints {
            let per_minute = f64::from(runtime.config.rate_limit_per_minute).min(tier_limit);
            runtime.limiter.set_ceiling(per_minute);
        }
        info!(from = ?previous, to = ?tier, tier_limit, "API tier changed");
    }

    pub fn get(&self, name: &str) -> Option<Arc<EndpointRuntime>> {
        self.by_name
            .get(name)
            .map(|&i| Arc::clone(&self.endpoints[i]))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<EndpointRuntime>> {
        self.endpoints.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.endpoints.iter().map(|e| e.config.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn global_pool(&self) -> Option<&Arc<GlobalPool>> {
        self.global.as_ref()
    }
}
