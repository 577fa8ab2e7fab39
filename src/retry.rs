// =============================================================================
// retry.rs - TRY, TRY AGAIN (BUT NOT ALL AT ONCE)
// =============================================================================
//
// Exponential backoff with jitter, so a thousand callers that failed together
// do not all come back together. Each retry also gets a longer leash than the
// attempt before it: a provider that timed out at ten seconds gets twenty.
//
// The policy is pure arithmetic. The gateway owns the loop, because each
// retry also has to win a rate-limit token and a breaker admission.
// =============================================================================

use rand::Rng;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::{ErrorClass, UpstreamFailure};

/// Backoff schedule: `min(base * 2^attempt + jitter, max_delay)`, with jitter
/// drawn from `[0, base * 2^attempt * jitter_ratio)`.
///
/// Keeping `jitter_ratio <= 1` makes the schedule non-decreasing: the largest
/// jittered delay for attempt `k` is below the smallest for attempt `k + 1`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
    jitter_ratio: f64,
    timeout_growth: f64,
    max_call_timeout: Duration,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            base_delay: config.base_delay,
            max_delay: config.max_delay.max(config.base_delay),
            max_attempts: config.max_attempts.max(1),
            jitter_ratio: config.jitter_ratio.clamp(0.0, 1.0),
            timeout_growth: config.timeout_growth.max(1.0),
            max_call_timeout: config.max_call_timeout,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Delay before retrying after the zero-based `attempt` failed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .as_secs_f64()
            * 2f64.powi(attempt.min(30) as i32);
        let jitter = if self.jitter_ratio > 0.0 && exp > 0.0 {
            rand::thread_rng().gen_range(0.0..exp * self.jitter_ratio)
        } else {
            0.0
        };
        Duration::from_secs_f64((exp + jitter).min(self.max_delay.as_secs_f64()))
    }

    /// Deadline for the zero-based `attempt` of a call whose first attempt
    /// gets `base`. Never shorter than `base`.
    pub fn timeout_for(&self, base: Duration, attempt: u32) -> Duration {
        let grown = base.as_secs_f64() * self.timeout_growth.powi(attempt.min(30) as i32);
        let ceiling = self.max_call_timeout.max(base).as_secs_f64();
        Duration::from_secs_f64(grown.min(ceiling))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

/// Per-call retry state.
#[derive(Debug, Clone)]
pub struct RetryContext {
    pub attempt: u32,
    pub max_attempts: u32,
    pub next_delay: Option<Duration>,
    pub idempotency_key: Option<String>,
    pub classification: Option<ErrorClass>,
    policy: RetryPolicy,
}

impl RetryContext {
    pub fn new(policy: RetryPolicy, idempotency_key: Option<String>) -> Self {
        Self {
            attempt: 0,
            max_attempts: policy.max_attempts(),
            next_delay: None,
            idempotency_key,
            classification: None,
            policy,
        }
    }

    /// Record the failure of the current attempt and decide what happens next.
    pub fn on_failure(&mut self, failure: &UpstreamFailure) -> RetryDecision {
        let class = failure.class();
        self.classification = Some(class);
        let failed_attempt = self.attempt;
        self.attempt += 1;

        if class != ErrorClass::Retryable || self.attempt >= self.max_attempts {
            self.next_delay = None;
            return RetryDecision::GiveUp;
        }

        let backoff = self.policy.delay_for(failed_attempt);
        let delay = match failure {
            UpstreamFailure::RateLimited {
                retry_after: Some(hint),
            } => {
                if *hint > self.policy.max_delay() {
                    self.next_delay = None;
                    return RetryDecision::GiveUp;
                }
                (*hint).max(backoff)
            }
            _ => backoff,
        };
        self.next_delay = Some(delay);
        RetryDecision::RetryAfter(delay)
    }

    pub fn attempts_made(&self) -> u32 {
        self.attempt
    }

    /// Deadline for the attempt about to be made.
    pub fn attempt_timeout(&self, base: Duration) -> Duration {
        self.policy.timeout_for(base, self.attempt)
    }
}
