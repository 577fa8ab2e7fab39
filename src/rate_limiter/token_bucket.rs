// =============================================================================
// token_bucket.rs - THE TOKEN JAR
// =============================================================================
//
// A classic token bucket, refilled lazily: no timer thread, no background
// task. Every access first tops the jar up by (elapsed * rate), clamped at
// capacity, then answers the question.
//
// Tokens are conserved. `available` lives in [0, capacity], always.
// =============================================================================

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    available: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket.
    pub fn new(capacity: f64, refill_per_sec: f64, now: Instant) -> Self {
        let capacity = capacity.max(0.0);
        Self {
            capacity,
            refill_per_sec: refill_per_sec.max(0.0),
            available: capacity,
            last_refill: now,
        }
    }

    /// Capacity `per_minute`, refilled evenly over a minute.
    pub fn per_minute(per_minute: f64, now: Instant) -> Self {
        Self::new(per_minute, per_minute / 60.0, now)
    }

    pub fn empty(capacity: f64, refill_per_sec: f64, now: Instant) -> Self {
        let mut bucket = Self::new(capacity, refill_per_sec, now);
        bucket.available = 0.0;
        bucket
    }

    /// A bucket holding `available` tokens (clamped to capacity).
    pub fn with_available(capacity: f64, refill_per_sec: f64, available: f64, now: Instant) -> Self {
        let mut bucket = Self::new(capacity, refill_per_sec, now);
        bucket.available = available.clamp(0.0, bucket.capacity);
        bucket
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.available = (self.available + elapsed * self.refill_per_sec).min(self.capacity);
            self.last_refill = now;
        }
    }

    /// Take `n` tokens iff at least `n` are available. Never blocks.
    pub fn try_acquire(&mut self, n: f64, now: Instant) -> bool {
        self.refill(now);
        if self.available >= n {
            self.available -= n;
            true
        } else {
            false
        }
    }

    pub fn available(&mut self, now: Instant) -> f64 {
        self.refill(now);
        self.available
    }

    /// How long until `n` tokens will be available. `None` if never.
    pub fn time_until(&mut self, n: f64, now: Instant) -> Option<Duration> {
        self.refill(now);
        if self.available >= n {
            return Some(Duration::ZERO);
        }
        if n > self.capacity || self.refill_per_sec <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(
            (n - self.available) / self.refill_per_sec,
        ))
    }

    /// Give back tokens taken for a call that never happened.
    pub fn refund(&mut self, n: f64, now: Instant) {
        self.refill(now);
        self.available = (self.available + n).min(self.capacity);
    }

    /// Change capacity and rate in place. Available tokens are clamped to the
    /// new capacity, never increased.
    pub fn reconfigure(&mut self, capacity: f64, refill_per_sec: f64, now: Instant) {
        self.refill(now);
        self.capacity = capacity.max(0.0);
        self.refill_per_sec = refill_per_sec.max(0.0);
        self.available = self.available.min(self.capacity);
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_per_sec(&self) -> f64 {
        self.refill_per_sec
    }
}
