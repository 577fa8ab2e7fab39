// =============================================================================
// clock.rs - THE TIMEKEEPER
// =============================================================================
//
// Every time-based decision in the gateway (cool-downs, token refills, cache
// ages, retry sleeps, probe intervals) asks a Clock instead of the operating
// system. Production wires in SystemClock. Tests wire in ManualClock and move
// time forward by hand, so "wait sixty seconds for the breaker" costs zero
// seconds of CI time.
// =============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Source of monotonic time, wall-clock time and sleeping.
#[async_trait]
pub trait Clock: Send + Sync + fmt::Debug {
    /// Monotonic "now", used for cool-downs, refills and deadlines.
    fn now(&self) -> Instant;

    /// Wall-clock "now", used for cache timestamps and anything shared with
    /// other processes (the distributed token counter, alerts).
    fn wall_now(&self) -> DateTime<Utc>;

    /// Suspend the current task for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Shared handle to a clock.
pub type SharedClock = Arc<dyn Clock>;

/// The real thing. Reads the OS clocks and sleeps on the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall_now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// A clock that only moves when told to.
///
/// Two flavors:
///
/// - [`ManualClock::new`]: `sleep` jumps the clock forward by the requested
///   duration and yields once, so code that sleeps in a loop makes progress
///   without any real waiting.
/// - [`ManualClock::held`]: `sleep` parks until [`advance`](Self::advance)
///   moves the clock past the sleeper's deadline. Use it when calls have to
///   be genuinely in flight at the same time.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    base_wall: DateTime<Utc>,
    offset: watch::Sender<Duration>,
    held: bool,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::build(Utc::now(), false)
    }

    /// Sleepers wait for [`advance`](Self::advance) instead of moving time.
    pub fn held() -> Self {
        Self::build(Utc::now(), true)
    }

    /// Start the wall clock at a specific instant.
    pub fn starting_at(wall: DateTime<Utc>) -> Self {
        Self::build(wall, false)
    }

    fn build(base_wall: DateTime<Utc>, held: bool) -> Self {
        let (offset, _) = watch::channel(Duration::ZERO);
        Self {
            base: Instant::now(),
            base_wall,
            offset,
            held,
        }
    }

    /// Move time forward and wake every sleeper whose deadline has passed.
    pub fn advance(&self, by: Duration) {
        self.offset.send_modify(|offset| *offset += by);
    }

    pub fn elapsed(&self) -> Duration {
        *self.offset.borrow()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + self.elapsed()
    }

    fn wall_now(&self) -> DateTime<Utc> {
        let offset = self.elapsed();
        self.base_wall + chrono::Duration::from_std(offset).unwrap_or(chrono::Duration::zero())
    }

    async fn sleep(&self, duration: Duration) {
        if !self.held {
            self.advance(duration);
            tokio::task::yield_now().await;
            return;
        }
        let mut ticks = self.offset.subscribe();
        let deadline = *ticks.borrow_and_update() + duration;
        while *ticks.borrow_and_update() < deadline {
            if ticks.changed().await.is_err() {
                return;
            }
        }
    }
}
