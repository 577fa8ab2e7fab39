// ═══════════════════════════════════════════════════════════════
// METRICS - Because if you can't measure it, it didn't happen
// ═══════════════════════════════════════════════════════════════
//
// Atomic counters per endpoint, no locks on the hot path. The snapshot
// stitches them together with breaker state, token levels and probe health,
// and a tiny HTTP server hands the whole thing out as JSON so the ops
// dashboard can tell at a glance which provider is ruining Sunday.

use parking_lot::Mutex;
use portable_atomic::{AtomicF64, AtomicU64, Ordering};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{error, info};

use crate::alerts::{PublisherSnapshot, PublisherStats};
use crate::circuit_breaker::CircuitBreakerSnapshot;
use crate::gateway::Gateway;
use crate::health::HealthSnapshot;
use crate::rate_limiter::LimiterSnapshot;
use crate::transport::RateLimitHeaders;

/// Oldest events are dropped past this many, whatever their age.
const MAX_RECENT_EVENTS: usize = 50_000;

/// Things worth counting over the last few minutes as well as forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recent {
    CacheHit,
    CacheMiss,
    Shed,
    UpstreamOk,
    UpstreamError,
}

impl Recent {
    fn slot(self) -> usize {
        match self {
            Recent::CacheHit => 0,
            Recent::CacheMiss => 1,
            Recent::Shed => 2,
            Recent::UpstreamOk => 3,
            Recent::UpstreamError => 4,
        }
    }
}

/// Event counts over a sliding time window. Timestamps come from the
/// gateway clock, so tests move the window by advancing a ManualClock.
#[derive(Debug)]
pub struct RollingWindow {
    width: Duration,
    inner: Mutex<WindowInner>,
}

#[derive(Debug, Default)]
struct WindowInner {
    events: VecDeque<(Instant, Recent)>,
    tallies: [u64; 5],
}

impl WindowInner {
    fn prune(&mut self, width: Duration, now: Instant) {
        while let Some(&(at, kind)) = self.events.front() {
            if now.saturating_duration_since(at) < width {
                break;
            }
            self.events.pop_front();
            self.tallies[kind.slot()] -= 1;
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecentSnapshot {
    pub window_secs: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub shed: u64,
    pub upstream_ok: u64,
    pub upstream_errors: u64,
    pub cache_hit_ratio: f64,
    pub error_rate: f64,
}

impl RollingWindow {
    pub fn new(width: Duration) -> Self {
        Self {
            width,
            inner: Mutex::new(WindowInner::default()),
        }
    }

    pub fn width(&self) -> Duration {
        self.width
    }

    pub fn record(&self, kind: Recent, now: Instant) {
        let mut inner = self.inner.lock();
        inner.prune(self.width, now);
        if inner.events.len() >= MAX_RECENT_EVENTS {
            if let Some((_, oldest)) = inner.events.pop_front() {
                inner.tallies[oldest.slot()] -= 1;
            }
        }
        inner.events.push_back((now, kind));
        inner.tallies[kind.slot()] += 1;
    }

    pub fn count(&self, kind: Recent, now: Instant) -> u64 {
        let mut inner = self.inner.lock();
        inner.prune(self.width, now);
        inner.tallies[kind.slot()]
    }

    /// Upstream attempts and the share of them that failed, inside the window.
    pub fn error_rate(&self, now: Instant) -> (u64, f64) {
        let mut inner = self.inner.lock();
        inner.prune(self.width, now);
        let ok = inner.tallies[Recent::UpstreamOk.slot()];
        let failed = inner.tallies[Recent::UpstreamError.slot()];
        (ok + failed, ratio(failed, ok + failed))
    }

    pub fn snapshot(&self, now: Instant) -> RecentSnapshot {
        let mut inner = self.inner.lock();
        inner.prune(self.width, now);
        let [hits, misses, shed, ok, failed] = inner.tallies;
        RecentSnapshot {
            window_secs: self.width.as_secs(),
            cache_hits: hits,
            cache_misses: misses,
            shed,
            upstream_ok: ok,
            upstream_errors: failed,
            cache_hit_ratio: ratio(hits, hits + misses),
            error_rate: ratio(failed, ok + failed),
        }
    }
}

impl Default for RollingWindow {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole > 0 {
        part as f64 / whole as f64
    } else {
        0.0
    }
}

/// Per-endpoint counters.
#[derive(Debug, Default)]
pub struct EndpointStats {
    pub calls: AtomicU64,
    pub primary_success: AtomicU64,
    pub secondary_served: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub stale_served: AtomicU64,
    pub shed: AtomicU64,
    pub throttled: AtomicU64,
    pub circuit_rejections: AtomicU64,
    pub retries: AtomicU64,
    pub transient_failures: AtomicU64,
    pub rate_limit_hits: AtomicU64,
    pub not_found: AtomicU64,
    pub fatal_auth: AtomicU64,
    pub fallback_exhausted: AtomicU64,
    pub last_latency_ms: AtomicF64,
    pub recent: RollingWindow,
    last_rate_limit_headers: Mutex<Option<RateLimitHeaders>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointStatsSnapshot {
    pub calls: u64,
    pub primary_success: u64,
    pub secondary_served: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub stale_served: u64,
    pub cache_hit_ratio: f64,
    pub shed: u64,
    pub throttled: u64,
    pub circuit_rejections: u64,
    pub retries: u64,
    pub transient_failures: u64,
    pub rate_limit_hits: u64,
    pub not_found: u64,
    pub fatal_auth: u64,
    pub fallback_exhausted: u64,
    pub last_latency_ms: f64,
    pub provider_quota: Option<RateLimitHeaders>,
}

impl EndpointStats {
    pub fn with_window(width: Duration) -> Self {
        Self {
            recent: RollingWindow::new(width),
            ..Self::default()
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Bump a lifetime counter and log the event in the rolling window.
    pub fn incr_recent(&self, counter: &AtomicU64, kind: Recent, now: Instant) {
        Self::incr(counter);
        self.recent.record(kind, now);
    }

    pub fn record_headers(&self, headers: RateLimitHeaders) {
        *self.last_rate_limit_headers.lock() = Some(headers);
    }

    pub fn snapshot(&self) -> EndpointStatsSnapshot {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        EndpointStatsSnapshot {
            calls: self.calls.load(Ordering::Relaxed),
            primary_success: self.primary_success.load(Ordering::Relaxed),
            secondary_served: self.secondary_served.load(Ordering::Relaxed),
            cache_hits: hits,
            cache_misses: misses,
            stale_served: self.stale_served.load(Ordering::Relaxed),
            cache_hit_ratio: ratio(hits, hits + misses),
            shed: self.shed.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
            circuit_rejections: self.circuit_rejections.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            transient_failures: self.transient_failures.load(Ordering::Relaxed),
            rate_limit_hits: self.rate_limit_hits.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
            fatal_auth: self.fatal_auth.load(Ordering::Relaxed),
            fallback_exhausted: self.fallback_exhausted.load(Ordering::Relaxed),
            last_latency_ms: self.last_latency_ms.load(Ordering::Relaxed),
            provider_quota: *self.last_rate_limit_headers.lock(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointSnapshot {
    pub name: String,
    pub breaker: CircuitBreakerSnapshot,
    pub limiter: LimiterSnapshot,
    pub health: HealthSnapshot,
    pub stats: EndpointStatsSnapshot,
    pub recent: RecentSnapshot,
}

/// The metrics snapshot - what gets serialized to JSON
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_seconds: u64,
    pub status: String,
    pub cache_entries: usize,
    pub endpoints: Vec<EndpointSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert_publisher: Option<PublisherSnapshot>,
}

impl MetricsSnapshot {
    pub fn with_publisher(mut self, stats: Option<&PublisherStats>) -> Self {
        self.alert_publisher = stats.map(PublisherStats::snapshot);
        self
    }
}

/// Serve the gateway snapshot as JSON on `port` until shutdown. Alert
/// publisher counters ride along when the publisher is running.
pub async fn run_metrics_server(
    gateway: Arc<Gateway>,
    publisher: Option<Arc<PublisherStats>>,
    port: u16,
    shutdown: &mut watch::Receiver<bool>,
) {
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    let addr = format!("0.0.0.0:{port}");
    let listener = match TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind metrics server on {}: {}", addr, e);
            return;
        }
    };

    info!("📊 Metrics server listening on http://{}", addr);

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((mut stream, _addr)) => {
                        let snapshot = gateway
                            .snapshot()
                            .await
                            .with_publisher(publisher.as_deref());
                        let json = serde_json::to_string_pretty(&snapshot)
                            .unwrap_or_else(|_| "{}".to_string());

                        let response = format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nAccess-Control-Allow-Origin: *\r\nContent-Length: {}\r\n\r\n{}",
                            json.len(),
                            json,
                        );

                        let _ = stream.write_all(response.as_bytes()).await;
                    }
                    Err(e) => {
                        error!("Metrics server accept error: {}", e);
                    }
                }
            }
            _ = shutdown.changed() => {
                info!("Metrics server: shutting down");
                break;
            }
        }
    }
}
