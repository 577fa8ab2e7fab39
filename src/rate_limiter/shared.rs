// =============================================================================
// shared.rs - ONE BUDGET, MANY INSTANCES
// =============================================================================
//
// In distributed mode every instance decrements the same counter in the shared
// store. When the store is unreachable we fail CLOSED, not open: each instance
// drops to a local partition of capacity C / instance_count, so even with zero
// coordination the fleet as a whole cannot exceed C. Some budget goes unused
// while the store is down. That is the price.
// =============================================================================

use parking_lot::Mutex;
use portable_atomic::{AtomicBool, AtomicF64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::store::{BucketSpec, StoreError, StoredTokens, TokenStore};
use super::token_bucket::TokenBucket;
use crate::alerts::{AlertKind, AlertSink};
use crate::clock::SharedClock;

pub struct SharedBucket {
    endpoint: String,
    key: String,
    store: Arc<dyn TokenStore>,
    instance_count: u32,
    spec: Mutex<BucketSpec>,
    partition: Mutex<TokenBucket>,
    degraded: AtomicBool,
    /// Last remaining count the store reported. Seeds the partition when the
    /// store goes away.
    last_remaining: AtomicF64,
    clock: SharedClock,
    alerts: AlertSink,
}

impl std::fmt::Debug for SharedBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBucket")
            .field("key", &self.key)
            .field("degraded", &self.is_degraded())
            .finish()
    }
}

impl SharedBucket {
    pub fn new(
        endpoint: impl Into<String>,
        key: impl Into<String>,
        store: Arc<dyn TokenStore>,
        spec: BucketSpec,
        instance_count: u32,
        clock: SharedClock,
        alerts: AlertSink,
    ) -> Self {
        let instance_count = instance_count.max(1);
        let partition = TokenBucket::new(
            spec.capacity / instance_count as f64,
            spec.refill_per_sec / instance_count as f64,
            clock.now(),
        );
        Self {
            endpoint: endpoint.into(),
            key: key.into(),
            store,
            instance_count,
            spec: Mutex::new(spec),
            partition: Mutex::new(partition),
            degraded: AtomicBool::new(false),
            last_remaining: AtomicF64::new(spec.capacity),
            clock,
            alerts,
        }
    }

    pub async fn try_acquire(&self, n: f64) -> bool {
        let spec = *self.spec.lock();
        let now_ms = self.clock.wall_now().timestamp_millis();
        match self
            .store
            .conditional_decrement(&self.key, spec, n, now_ms)
            .await
        {
            Ok(outcome) => {
                self.mark_healthy();
                self.last_remaining.store(outcome.remaining, Ordering::Relaxed);
                outcome.allowed
            }
            Err(e) => {
                self.mark_degraded(&e);
                self.partition.lock().try_acquire(n, self.clock.now())
            }
        }
    }

    /// Tokens currently available to this instance.
    pub async fn available(&self) -> f64 {
        let spec = *self.spec.lock();
        let now_ms = self.clock.wall_now().timestamp_millis();
        match self.store.get(&self.key).await {
            Ok(Some(state)) => {
                self.mark_healthy();
                let elapsed = (now_ms - state.updated_ms).max(0) as f64 / 1000.0;
                (state.tokens + elapsed * spec.refill_per_sec).min(spec.capacity)
            }
            Ok(None) => {
                self.mark_healthy();
                spec.capacity
            }
            Err(e) => {
                self.mark_degraded(&e);
                self.partition.lock().available(self.clock.now())
            }
        }
    }

    /// Zero the shared budget so every instance backs off together. Used when
    /// the provider answers 429.
    pub async fn exhaust(&self, hold: Duration) {
        let now_ms = self.clock.wall_now().timestamp_millis();
        let zero = StoredTokens {
            tokens: 0.0,
            updated_ms: now_ms,
        };
        let ttl = hold.max(Duration::from_secs(60));
        if let Err(e) = self.store.set_with_ttl(&self.key, zero, ttl).await {
            self.mark_degraded(&e);
        }
        let now = self.clock.now();
        let mut partition = self.partition.lock();
        let (capacity, rate) = (partition.capacity(), partition.refill_per_sec());
        *partition = TokenBucket::empty(capacity, rate, now);
    }

    /// Apply a new shared capacity and rate (adaptive limiting).
    pub fn reconfigure(&self, spec: BucketSpec) {
        *self.spec.lock() = spec;
        let n = self.instance_count as f64;
        self.partition
            .lock()
            .reconfigure(spec.capacity / n, spec.refill_per_sec / n, self.clock.now());
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn last_remaining(&self) -> f64 {
        if self.is_degraded() {
            self.partition.lock().available(self.clock.now())
        } else {
            self.last_remaining.load(Ordering::Relaxed)
        }
    }

    pub fn partition_capacity(&self) -> f64 {
        self.partition.lock().capacity()
    }

    fn mark_degraded(&self, error: &StoreError) {
        if self.degraded.swap(true, Ordering::AcqRel) {
            return;
        }
        let spec = *self.spec.lock();
        let n = self.instance_count as f64;
        let seed = self.last_remaining.load(Ordering::Relaxed).min(spec.capacity) / n;
        *self.partition.lock() = TokenBucket::with_available(
            spec.capacity / n,
            spec.refill_per_sec / n,
            seed,
            self.clock.now(),
        );
        warn!(
            endpoint = %self.endpoint,
            error = %error,
            partition_capacity = spec.capacity / n,
            "Shared token store unreachable, falling back to local partition"
        );
        self.alerts.raise(
            &self.endpoint,
            AlertKind::SharedCounterDegraded {
                reason: error.to_string(),
            },
        );
    }

    fn mark_healthy(&self) {
        if self.degraded.swap(false, Ordering::AcqRel) {
            info!(endpoint = %self.endpoint, "Shared token store reachable again");
            self.alerts
                .raise(&self.endpoint, AlertKind::SharedCounterRestored);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::rate_limiter::store::InMemoryTokenStore;

    const SPEC: BucketSpec = BucketSpec {
        capacity: 30.0,
        refill_per_sec: 0.5,
    };

    fn bucket(
        store: &Arc<InMemoryTokenStore>,
        clock: &Arc<ManualClock>,
        instances: u32,
    ) -> SharedBucket {
        SharedBucket::new(
            "schedule",
            "gridiron:tokens:schedule",
            store.clone(),
            SPEC,
            instances,
            clock.clone(),
            AlertSink::disabled(),
        )
    }

    #[tokio::test]
    async fn test_instances_share_one_budget() {
        let store = Arc::new(InMemoryTokenStore::new());
        let clock = Arc::new(ManualClock::new());
        let a = bucket(&store, &clock, 3);
        let b = bucket(&store, &clock, 3);

        let mut granted = 0;
        for _ in 0..20 {
            if a.try_acquire(1.0).await {
                granted += 1;
            }
            if b.try_acquire(1.0).await {
                granted += 1;
            }
        }
        assert_eq!(granted, 30);
        assert!(!a.is_degraded());
    }

    #[tokio::test]
    async fn test_outage_falls_back_to_partition() {
        let store = Arc::new(InMemoryTokenStore::new());
        let clock = Arc::new(ManualClock::new());
        let instances: Vec<_> = (0..3).map(|_| bucket(&store, &clock, 3)).collect();
        store.set_reachable(false);

        let mut granted = 0;
        for inst in &instances {
            for _ in 0..30 {
                if inst.try_acquire(1.0).await {
                    granted += 1;
                }
            }
            assert!(inst.is_degraded());
            assert_eq!(inst.partition_capacity(), 10.0);
        }
        assert!(granted <= 30, "fleet overshot: {granted}");
        assert_eq!(granted, 30);
    }

    #[tokio::test]
    async fn test_partition_is_seeded_from_last_known_level() {
        let store = Arc::new(InMemoryTokenStore::new());
        let clock = Arc::new(ManualClock::new());
        let inst = bucket(&store, &clock, 2);
        for _ in 0..20 {
            assert!(inst.try_acquire(1.0).await);
        }
        store.set_reachable(false);
        // 10 left globally, so this instance may use 5 of them.
        let mut granted = 0;
        for _ in 0..10 {
            if inst.try_acquire(1.0).await {
                granted += 1;
            }
        }
        assert_eq!(granted, 5);
    }

    #[tokio::test]
    async fn test_recovers_when_store_returns() {
        let store = Arc::new(InMemoryTokenStore::new());
        let clock = Arc::new(ManualClock::new());
        let inst = bucket(&store, &clock, 2);
        store.set_reachable(false);
        inst.try_acquire(1.0).await;
        assert!(inst.is_degraded());
        store.set_reachable(true);
        assert!(inst.try_acquire(1.0).await);
        assert!(!inst.is_degraded());
    }

    #[tokio::test]
    async fn test_exhaust_zeroes_shared_budget() {
        let store = Arc::new(InMemoryTokenStore::new());
        let clock = Arc::new(ManualClock::new());
        let a = bucket(&store, &clock, 2);
        let b = bucket(&store, &clock, 2);
        a.exhaust(Duration::from_secs(30)).await;
        assert!(!b.try_acquire(1.0).await);
        clock.advance(Duration::from_secs(2));
        assert!(b.try_acquire(1.0).await);
    }
}
