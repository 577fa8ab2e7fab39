// =============================================================================
// rate_limiter - THE BOUNCER
// =============================================================================
//
// One EndpointLimiter per upstream endpoint. It decides whether a call may
// spend a token right now, makes it wait in a priority queue if not, or turns
// it away.
//
//   token_bucket  the lazily refilled local bucket
//   store         the shared-counter interface (Redis, in-memory fake)
//   shared        distributed bucket with local-partition fallback
//   adaptive      reacting to provider 429s
//   priority      the bounded waiting room
//
// An optional GlobalPool sits behind every endpoint so the sum of all
// endpoints cannot exceed the subscription tier.
// =============================================================================

pub mod adaptive;
pub mod priority;
pub mod shared;
pub mod store;
pub mod token_bucket;

use parking_lot::Mutex;
use portable_atomic::{AtomicBool, Ordering};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::alerts::{AlertKind, AlertSink};
use crate::clock::SharedClock;
use crate::config::AdaptiveConfig;
use crate::error::GatewayError;
use crate::models::Priority;

use adaptive::{AdaptiveRate, RateLimitReaction};
use priority::{Enqueued, PriorityGate, Wakeup};
use shared::SharedBucket;
use store::{BucketSpec, TokenStore};
use token_bucket::TokenBucket;

const MIN_QUEUE_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone)]
pub struct LimiterSettings {
    pub per_minute: f64,
    pub queue_enabled: bool,
    pub max_queue_size: usize,
    pub max_queue_wait: Duration,
    pub alert_threshold_percent: f64,
    pub adaptive: AdaptiveConfig,
}

/// Where a distributed limiter keeps its budget.
#[derive(Debug, Clone)]
pub struct SharedCounter {
    pub store: Arc<dyn TokenStore>,
    pub instance_count: u32,
    pub key_prefix: String,
}

/// Tier-wide bucket shared by every endpoint of this process.
#[derive(Debug)]
pub struct GlobalPool {
    bucket: Mutex<TokenBucket>,
    clock: SharedClock,
}

impl GlobalPool {
    pub fn new(per_minute: f64, clock: SharedClock) -> Self {
        Self {
            bucket: Mutex::new(TokenBucket::per_minute(per_minute, clock.now())),
            clock,
        }
    }

    pub fn try_acquire(&self) -> bool {
        self.bucket.lock().try_acquire(1.0, self.clock.now())
    }

    pub fn refund(&self) {
        self.bucket.lock().refund(1.0, self.clock.now());
    }

    pub fn available(&self) -> f64 {
        self.bucket.lock().available(self.clock.now())
    }

    /// Resize to a new tier limit. Tokens on hand are kept up to the new size.
    pub fn reconfigure(&self, per_minute: f64) {
        let per_minute = per_minute.max(1.0);
        self.bucket
            .lock()
            .reconfigure(per_minute, per_minute / 60.0, self.clock.now());
    }
}

#[derive(Debug)]
enum Backend {
    Local(Mutex<TokenBucket>),
    Shared(SharedBucket),
}

#[derive(Debug)]
pub struct EndpointLimiter {
    endpoint: String,
    settings: LimiterSettings,
    backend: Backend,
    global: Option<Arc<GlobalPool>>,
    adaptive: AdaptiveRate,
    applied_per_minute: Mutex<f64>,
    gate: PriorityGate,
    low_alert_armed: AtomicBool,
    clock: SharedClock,
    alerts: AlertSink,
}

#[derive(Debug, Clone, Serialize)]
pub struct LimiterSnapshot {
    pub available_tokens: f64,
    pub capacity: f64,
    pub effective_per_minute: f64,
    pub ceiling_per_minute: f64,
    pub in_cool_down: bool,
    pub permanent_reductions: u32,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub distributed: bool,
    pub degraded: bool,
    pub global_available: Option<f64>,
}

impl EndpointLimiter {
    pub fn new(
        endpoint: impl Into<String>,
        settings: LimiterSettings,
        shared: Option<SharedCounter>,
        global: Option<Arc<GlobalPool>>,
        clock: SharedClock,
        alerts: AlertSink,
    ) -> Self {
        let endpoint = endpoint.into();
        let per_minute = settings.per_minute.max(1.0);
        let spec = BucketSpec {
            capacity: per_minute,
            refill_per_sec: per_minute / 60.0,
        };
        let backend = match shared {
            Some(counter) => Backend::Shared(SharedBucket::new(
                endpoint.clone(),
                format!("{}:{}", counter.key_prefix, endpoint),
                counter.store,
                spec,
                counter.instance_count,
                clock.clone(),
                alerts.clone(),
            )),
            None => Backend::Local(Mutex::new(TokenBucket::per_minute(per_minute, clock.now()))),
        };
        Self {
            adaptive: AdaptiveRate::new(per_minute, settings.adaptive.clone()),
            applied_per_minute: Mutex::new(per_minute),
            gate: PriorityGate::new(settings.max_queue_size),
            low_alert_armed: AtomicBool::new(true),
            endpoint,
            settings,
            backend,
            global,
            clock,
            alerts,
        }
    }

    /// Get a token for a call at `priority`, waiting in line if configured to.
    ///
    /// `CapacityExceeded` means the request was shed. `Throttled` means no
    /// token could be had in time.
    pub async fn acquire(&self, priority: Priority) -> Result<(), GatewayError> {
        self.sync_rate();

        if self.gate.is_empty() && self.take().await {
            return Ok(());
        }
        if !self.settings.queue_enabled {
            return Err(self.throttled());
        }

        let mut ticket = match self.gate.enqueue(priority) {
            Enqueued::Waiting(ticket) => ticket,
            Enqueued::Rejected => return Err(self.shed(priority)),
        };
        debug!(
            endpoint = %self.endpoint,
            priority = %priority,
            queue_depth = self.gate.len(),
            "Out of tokens, request queued"
        );

        let deadline = self.clock.now() + self.settings.max_queue_wait;
        loop {
            self.dispatch().await;

            match ticket.wakeup.try_recv() {
                Ok(Wakeup::Granted) => return Ok(()),
                Ok(Wakeup::Shed) => return Err(self.shed(priority)),
                Err(tokio::sync::oneshot::error::TryRecvError::Closed) => {
                    return Err(self.throttled())
                }
                Err(tokio::sync::oneshot::error::TryRecvError::Empty) => {}
            }

            let now = self.clock.now();
            if now >= deadline {
                if self.gate.withdraw(&ticket) {
                    return Err(self.throttled());
                }
                // Woken between the check above and the withdrawal.
                return match ticket.wakeup.try_recv() {
                    Ok(Wakeup::Granted) => Ok(()),
                    Ok(Wakeup::Shed) => Err(self.shed(priority)),
                    Err(_) => Err(self.throttled()),
                };
            }

            let wait = self
                .time_until_token()
                .min(deadline - now)
                .max(MIN_QUEUE_POLL);
            tokio::select! {
                woken = &mut ticket.wakeup => {
                    return match woken {
                        Ok(Wakeup::Granted) => Ok(()),
                        Ok(Wakeup::Shed) => Err(self.shed(priority)),
                        Err(_) => Err(self.throttled()),
                    };
                }
                _ = self.clock.sleep(wait) => {}
            }
        }
    }

    /// Take a token only if one is available right now. Used by retries and
    /// health probes, which never queue.
    pub async fn try_take(&self) -> bool {
        self.sync_rate();
        self.take().await
    }

    /// Return a token for a call that was never made. Returns false when
    /// the endpoint budget lives in the shared store: the store has no
    /// increment, so that token stays spent and the shared budget errs low.
    /// The in-process global pool gets its token back either way.
    pub fn refund(&self) -> bool {
        if let Some(global) = &self.global {
            global.refund();
        }
        match &self.backend {
            Backend::Local(bucket) => {
                bucket.lock().refund(1.0, self.clock.now());
                true
            }
            Backend::Shared(_) => false,
        }
    }

    /// Move the ceiling to a new plan limit and apply it right away.
    pub fn set_ceiling(&self, per_minute: f64) {
        self.adaptive.set_ceiling(per_minute);
        self.sync_rate();
    }

    /// Provider said 429: halve, cool down, maybe ratchet, maybe alert.
    pub async fn on_rate_limited(&self, retry_after: Option<Duration>) -> RateLimitReaction {
        let reaction = self
            .adaptive
            .on_rate_limited(retry_after, self.clock.now());
        warn!(
            endpoint = %self.endpoint,
            effective_per_minute = reaction.effective_per_minute,
            violations = reaction.violations_in_window,
            retry_after_secs = retry_after.map(|d| d.as_secs()),
            "Provider rate limit hit, slowing down"
        );
        self.sync_rate();

        if let Backend::Shared(shared) = &self.backend {
            shared
                .exhaust(retry_after.unwrap_or(self.settings.adaptive.cool_down))
                .await;
        }

        if let Some(ceiling) = reaction.new_ceiling_per_minute {
            warn!(
                endpoint = %self.endpoint,
                new_limit_per_minute = ceiling,
                "Repeated provider rate limiting, permanent reduction applied"
            );
            self.alerts.raise(
                &self.endpoint,
                AlertKind::TierUpgradeRecommended {
                    violations: reaction.violations_in_window,
                    new_limit_per_minute: ceiling,
                },
            );
        }
        reaction
    }

    pub async fn available(&self) -> f64 {
        match &self.backend {
            Backend::Local(bucket) => bucket.lock().available(self.clock.now()),
            Backend::Shared(shared) => shared.available().await,
        }
    }

    pub fn effective_per_minute(&self) -> f64 {
        self.adaptive.effective_per_minute(self.clock.now())
    }

    pub fn queue_depth(&self) -> usize {
        self.gate.len()
    }

    pub async fn snapshot(&self) -> LimiterSnapshot {
        let now = self.clock.now();
        let (distributed, degraded) = match &self.backend {
            Backend::Local(_) => (false, false),
            Backend::Shared(shared) => (true, shared.is_degraded()),
        };
        LimiterSnapshot {
            available_tokens: self.available().await,
            capacity: *self.applied_per_minute.lock(),
            effective_per_minute: self.adaptive.effective_per_minute(now),
            ceiling_per_minute: self.adaptive.ceiling_per_minute(),
            in_cool_down: self.adaptive.in_cool_down(now),
            permanent_reductions: self.adaptive.permanent_reductions(),
            queue_depth: self.gate.len(),
            queue_capacity: self.gate.capacity(),
            distributed,
            degraded,
            global_available: self.global.as_ref().map(|g| g.available()),
        }
    }

    async fn take(&self) -> bool {
        let granted = match &self.backend {
            Backend::Local(bucket) => bucket.lock().try_acquire(1.0, self.clock.now()),
            Backend::Shared(shared) => shared.try_acquire(1.0).await,
        };
        if !granted {
            return false;
        }
        if let Some(global) = &self.global {
            if !global.try_acquire() {
                if let Backend::Local(bucket) = &self.backend {
                    bucket.lock().refund(1.0, self.clock.now());
                }
                return false;
            }
        }
        self.check_low_tokens();
        true
    }

    /// Serve queued waiters in priority order while tokens last.
    async fn dispatch(&self) {
        while let Some(slot) = self.gate.next_in_line() {
            if !self.take().await {
                return;
            }
            if !self.gate.grant(slot) && !self.refund() {
                debug!(endpoint = %self.endpoint, "Waiter left, its shared token is lost");
            }
        }
    }

    fn time_until_token(&self) -> Duration {
        let per_minute = *self.applied_per_minute.lock();
        let fallback = Duration::from_secs_f64(60.0 / per_minute.max(1.0));
        match &self.backend {
            Backend::Local(bucket) => bucket
                .lock()
                .time_until(1.0, self.clock.now())
                .unwrap_or(self.settings.max_queue_wait),
            Backend::Shared(_) => fallback,
        }
    }

    /// Push the adaptive rate into the bucket if it moved.
    fn sync_rate(&self) {
        let effective = self
            .adaptive
            .effective_per_minute(self.clock.now())
            .max(1.0);
        let mut applied = self.applied_per_minute.lock();
        if (effective - *applied).abs() < 1e-9 {
            return;
        }
        *applied = effective;
        drop(applied);

        debug!(endpoint = %self.endpoint, per_minute = effective, "Applying new rate");
        match &self.backend {
            Backend::Local(bucket) => {
                bucket
                    .lock()
                    .reconfigure(effective, effective / 60.0, self.clock.now());
            }
            Backend::Shared(shared) => shared.reconfigure(BucketSpec {
                capacity: effective,
                refill_per_sec: effective / 60.0,
            }),
        }
    }

    fn check_low_tokens(&self) {
        let (available, capacity) = match &self.backend {
            Backend::Local(bucket) => {
                let mut bucket = bucket.lock();
                (bucket.available(self.clock.now()), bucket.capacity())
            }
            Backend::Shared(shared) => (shared.last_remaining(), *self.applied_per_minute.lock()),
        };
        let floor = capacity * (100.0 - self.settings.alert_threshold_percent) / 100.0;
        if available <= floor {
            if self.low_alert_armed.swap(false, Ordering::AcqRel) {
                self.alerts
                    .raise(&self.endpoint, AlertKind::LowTokens { available, capacity });
            }
        } else {
            self.low_alert_armed.store(true, Ordering::Release);
        }
    }

    fn shed(&self, priority: Priority) -> GatewayError {
        debug!(endpoint = %self.endpoint, priority = %priority, "Request shed");
        GatewayError::CapacityExceeded {
            endpoint: self.endpoint.clone(),
            priority,
        }
    }

    fn throttled(&self) -> GatewayError {
        GatewayError::Throttled {
            endpoint: self.endpoint.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::testing::settle;
    use store::InMemoryTokenStore;

    fn settings(per_minute: f64) -> LimiterSettings {
        LimiterSettings {
            per_minute,
            queue_enabled: true,
            max_queue_size: 100,
            max_queue_wait: Duration::from_secs(5),
            alert_threshold_percent: 80.0,
            adaptive: AdaptiveConfig::default(),
        }
    }

    fn local(clock: &Arc<ManualClock>, settings: LimiterSettings) -> EndpointLimiter {
        EndpointLimiter::new(
            "player_news",
            settings,
            None,
            None,
            clock.clone(),
            AlertSink::disabled(),
        )
    }

    async fn drain(limiter: &EndpointLimiter) {
        while limiter.try_take().await {}
    }

    #[tokio::test]
    async fn test_fast_path_until_empty() {
        let clock = Arc::new(ManualClock::new());
        let limiter = local(&clock, settings(30.0));
        for _ in 0..30 {
            assert!(limiter.try_take().await);
        }
        assert!(!limiter.try_take().await);
    }

    #[tokio::test]
    async fn test_queued_request_waits_for_refill() {
        let clock = Arc::new(ManualClock::new());
        let limiter = local(&clock, settings(30.0));
        drain(&limiter).await;

        limiter.acquire(Priority::Normal).await.unwrap();
        // One token at 0.5/s takes two seconds.
        assert!(clock.elapsed() >= Duration::from_secs(2));
        assert!(clock.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_queue_wait_expiry_is_throttled() {
        let clock = Arc::new(ManualClock::new());
        let mut s = settings(30.0);
        s.max_queue_wait = Duration::from_secs(1);
        let limiter = local(&clock, s);
        drain(&limiter).await;

        let err = limiter.acquire(Priority::Live).await.unwrap_err();
        assert!(matches!(err, GatewayError::Throttled { .. }));
        assert_eq!(limiter.queue_depth(), 0);
    }

    #[tokio::test]
    async fn test_without_queue_throttles_immediately() {
        let clock = Arc::new(ManualClock::new());
        let mut s = settings(30.0);
        s.queue_enabled = false;
        let limiter = local(&clock, s);
        drain(&limiter).await;
        assert!(matches!(
            limiter.acquire(Priority::Live).await,
            Err(GatewayError::Throttled { .. })
        ));
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_high_priority_served_first_once_token_refills() {
        let clock = Arc::new(ManualClock::held());
        let limiter = Arc::new(local(&clock, settings(30.0)));
        drain(&limiter).await;

        let low = tokio::spawn({
            let limiter = limiter.clone();
            async move { limiter.acquire(Priority::Low).await }
        });
        settle().await;
        let high = tokio::spawn({
            let limiter = limiter.clone();
            async move { limiter.acquire(Priority::High).await }
        });
        settle().await;
        assert_eq!(limiter.queue_depth(), 2);

        // One token refills. LOW has been waiting longer but HIGH gets it.
        clock.advance(Duration::from_secs(2));
        settle().await;
        assert!(high.is_finished());
        assert!(!low.is_finished());
        assert!(high.await.unwrap().is_ok());

        clock.advance(Duration::from_secs(2));
        settle().await;
        assert!(low.is_finished());
        assert!(low.await.unwrap().is_ok());
        assert_eq!(limiter.queue_depth(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_grants_in_priority_order() {
        let clock = Arc::new(ManualClock::new());
        let limiter = local(&clock, settings(30.0));
        drain(&limiter).await;

        let mut low = match limiter.gate.enqueue(Priority::Low) {
            Enqueued::Waiting(t) => t,
            Enqueued::Rejected => panic!("queue full"),
        };
        let mut high = match limiter.gate.enqueue(Priority::High) {
            Enqueued::Waiting(t) => t,
            Enqueued::Rejected => panic!("queue full"),
        };

        clock.advance(Duration::from_secs(2));
        limiter.dispatch().await;
        assert_eq!(high.wakeup.try_recv(), Ok(Wakeup::Granted));
        assert!(low.wakeup.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_refund_only_returns_local_tokens() {
        let clock = Arc::new(ManualClock::new());
        let limiter = local(&clock, settings(30.0));
        assert!(limiter.try_take().await);
        assert!(limiter.refund());
        assert_eq!(limiter.available().await, 30.0);

        let store = Arc::new(InMemoryTokenStore::new());
        let pool = Arc::new(GlobalPool::new(30.0, clock.clone()));
        let shared = EndpointLimiter::new(
            "live_game_stats",
            settings(30.0),
            Some(SharedCounter {
                store,
                instance_count: 1,
                key_prefix: "gridiron:tokens".to_string(),
            }),
            Some(pool.clone()),
            clock.clone(),
            AlertSink::disabled(),
        );
        assert!(shared.try_take().await);
        assert!(!shared.refund());
        assert_eq!(shared.available().await, 29.0);
        assert_eq!(pool.available(), 30.0);
    }

    #[tokio::test]
    async fn test_full_queue_sheds_low_priority() {
        let clock = Arc::new(ManualClock::new());
        let mut s = settings(30.0);
        s.max_queue_size = 1;
        let limiter = local(&clock, s);
        drain(&limiter).await;

        let _waiting = limiter.gate.enqueue(Priority::High);
        let err = limiter.acquire(Priority::Low).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::CapacityExceeded { priority: Priority::Low, .. }
        ));
    }

    #[tokio::test]
    async fn test_rate_limited_halves_capacity() {
        let clock = Arc::new(ManualClock::new());
        let limiter = local(&clock, settings(30.0));
        let reaction = limiter.on_rate_limited(None).await;
        assert_eq!(reaction.effective_per_minute, 15.0);
        assert_eq!(limiter.available().await, 15.0);
        assert_eq!(limiter.effective_per_minute(), 15.0);
    }

    #[tokio::test]
    async fn test_three_violations_raise_tier_alert() {
        let clock = Arc::new(ManualClock::new());
        let (alerts, rx) = AlertSink::channel(16);
        let limiter =
            EndpointLimiter::new("schedule", settings(30.0), None, None, clock.clone(), alerts);
        for _ in 0..3 {
            limiter.on_rate_limited(None).await;
            clock.advance(Duration::from_secs(120));
        }
        let tier_alerts: Vec<_> = rx
            .try_iter()
            .filter(|a| matches!(a.kind, AlertKind::TierUpgradeRecommended { .. }))
            .collect();
        assert_eq!(tier_alerts.len(), 1);
        assert!(matches!(
            tier_alerts[0].kind,
            AlertKind::TierUpgradeRecommended { violations: 3, new_limit_per_minute } if new_limit_per_minute == 24.0
        ));
    }

    #[tokio::test]
    async fn test_low_token_alert_fires_once_per_crossing() {
        let clock = Arc::new(ManualClock::new());
        let (alerts, rx) = AlertSink::channel(16);
        let limiter =
            EndpointLimiter::new("schedule", settings(30.0), None, None, clock.clone(), alerts);
        drain(&limiter).await;
        let low: Vec<_> = rx
            .try_iter()
            .filter(|a| matches!(a.kind, AlertKind::LowTokens { .. }))
            .collect();
        assert_eq!(low.len(), 1);
    }

    #[tokio::test]
    async fn test_global_pool_caps_all_endpoints() {
        let clock = Arc::new(ManualClock::new());
        let pool = Arc::new(GlobalPool::new(30.0, clock.clone()));
        let a = EndpointLimiter::new(
            "a",
            settings(30.0),
            None,
            Some(pool.clone()),
            clock.clone(),
            AlertSink::disabled(),
        );
        let b = EndpointLimiter::new(
            "b",
            settings(30.0),
            None,
            Some(pool.clone()),
            clock.clone(),
            AlertSink::disabled(),
        );
        let mut granted = 0;
        for _ in 0..30 {
            if a.try_take().await {
                granted += 1;
            }
            if b.try_take().await {
                granted += 1;
            }
        }
        assert_eq!(granted, 30);
        // The endpoint token was handed back when the pool said no.
        assert_eq!(a.available().await + b.available().await, 30.0);
    }

    #[tokio::test]
    async fn test_distributed_limiter_survives_store_outage() {
        let clock = Arc::new(ManualClock::new());
        let store = Arc::new(InMemoryTokenStore::new());
        let limiter = EndpointLimiter::new(
            "live_game_stats",
            settings(30.0),
            Some(SharedCounter {
                store: store.clone(),
                instance_count: 3,
                key_prefix: "gridiron:tokens".to_string(),
            }),
            None,
            clock.clone(),
            AlertSink::disabled(),
        );
        store.set_reachable(false);
        let mut granted = 0;
        for _ in 0..30 {
            if limiter.try_take().await {
                granted += 1;
            }
        }
        assert_eq!(granted, 10);
        assert!(limiter.snapshot().await.degraded);
    }
}
