// =============================================================================
// adaptive.rs - LEARNING TO TAKE A HINT
// =============================================================================
//
// A provider 429 means our idea of the budget is wrong. So:
//
// 1. Halve the rate immediately and hold it for a cool-down (at least as long
//    as the provider's Retry-After).
// 2. After the cool-down, creep back up a step at a time instead of snapping
//    back to full speed and tripping the limit again.
// 3. If the provider keeps saying 429 inside a rolling window, stop hoping:
//    lower the ceiling for good and tell a human to buy a bigger tier.
//
// Restoration is computed lazily from the clock. Nothing runs in the
// background.
// =============================================================================

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::AdaptiveConfig;

#[derive(Debug)]
struct AdaptiveInner {
    ceiling_per_minute: f64,
    /// Multiplier in effect at the end of the cool-down.
    factor: f64,
    cool_down_until: Option<Instant>,
    violations: VecDeque<Instant>,
    permanent_reductions: u32,
}

/// What a 429 did to the limits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitReaction {
    pub effective_per_minute: f64,
    pub violations_in_window: u32,
    /// Set when this violation ratcheted the permanent ceiling down.
    pub new_ceiling_per_minute: Option<f64>,
}

#[derive(Debug)]
pub struct AdaptiveRate {
    config: AdaptiveConfig,
    inner: Mutex<AdaptiveInner>,
}

impl AdaptiveRate {
    pub fn new(ceiling_per_minute: f64, config: AdaptiveConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(AdaptiveInner {
                ceiling_per_minute,
                factor: 1.0,
                cool_down_until: None,
                violations: VecDeque::new(),
                permanent_reductions: 0,
            }),
        }
    }

    fn current_factor(&self, inner: &mut AdaptiveInner, now: Instant) -> f64 {
        let Some(until) = inner.cool_down_until else {
            return inner.factor;
        };
        if now < until {
            return inner.factor;
        }
        let interval = self.config.restore_interval.as_secs_f64().max(0.001);
        let steps = (now.duration_since(until).as_secs_f64() / interval).floor();
        let restored = inner.factor + steps * self.config.restore_step_percent / 100.0;
        if restored >= 1.0 {
            inner.factor = 1.0;
            inner.cool_down_until = None;
            1.0
        } else {
            restored
        }
    }

    /// Calls per minute currently allowed.
    pub fn effective_per_minute(&self, now: Instant) -> f64 {
        let mut inner = self.inner.lock();
        let factor = self.current_factor(&mut inner, now);
        inner.ceiling_per_minute * factor
    }

    pub fn ceiling_per_minute(&self) -> f64 {
        self.inner.lock().ceiling_per_minute
    }

    /// New provider plan. Violations seen under the old one no longer count
    /// toward a permanent reduction; an active cool-down still applies.
    pub fn set_ceiling(&self, per_minute: f64) {
        let mut inner = self.inner.lock();
        inner.ceiling_per_minute = per_minute.max(1.0);
        inner.violations.clear();
    }

    pub fn permanent_reductions(&self) -> u32 {
        self.inner.lock().permanent_reductions
    }

    pub fn in_cool_down(&self, now: Instant) -> bool {
        matches!(self.inner.lock().cool_down_until, Some(until) if now < until)
    }

    /// Record a provider 429.
    pub fn on_rate_limited(&self, retry_after: Option<Duration>, now: Instant) -> RateLimitReaction {
        let mut inner = self.inner.lock();

        let current = self.current_factor(&mut inner, now);
        inner.factor = (current / 2.0).max(self.config.min_rate_factor);
        let hold = retry_after
            .unwrap_or(Duration::ZERO)
            .max(self.config.cool_down);
        inner.cool_down_until = Some(now + hold);

        let window = self.config.violation_window;
        inner.violations.push_back(now);
        while let Some(&oldest) = inner.violations.front() {
            if now.saturating_duration_since(oldest) > window {
                inner.violations.pop_front();
            } else {
                break;
            }
        }
        let violations_in_window = inner.violations.len() as u32;

        let mut new_ceiling = None;
        if violations_in_window >= self.config.permanent_reduction_threshold {
            inner.ceiling_per_minute =
                (inner.ceiling_per_minute * self.config.permanent_reduction_percent / 100.0)
                    .max(1.0);
            inner.permanent_reductions += 1;
            inner.violations.clear();
            new_ceiling = Some(inner.ceiling_per_minute);
        }

        RateLimitReaction {
            effective_per_minute: inner.ceiling_per_minute * inner.factor,
            violations_in_window,
            new_ceiling_per_minute: new_ceiling,
        }
    }
}
