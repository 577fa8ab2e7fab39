// =============================================================================
// circuit_breaker.rs - THE RESILIENCE GUARDIAN
// =============================================================================
//
// The Circuit Breaker pattern, as applied to football stats providers.
//
// When the stats feed goes down (and it WILL go down, usually at 1pm Eastern
// on a Sunday) we don't want to keep hammering it. Every doomed request burns
// a rate-limit token, holds a caller hostage until the timeout fires, and
// piles onto a provider that is already struggling.
//
// So each endpoint gets its own breaker:
//
//   CLOSED     normal. Transient failures bump a counter.
//   OPEN       every call is short-circuited to the fallback chain. No network.
//   HALF_OPEN  the cool-down is over. Exactly ONE trial call gets through.
//
// A failed trial doubles the cool-down (up to a ceiling). A successful trial
// closes the breaker and resets everything. Rejected credentials hold the
// breaker open until a human says otherwise.
//
// Only the trial permit can move the breaker out of HALF_OPEN. Late results
// from calls admitted while CLOSED are ignored once the state has moved on.
// =============================================================================

use parking_lot::Mutex;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::alerts::{AlertKind, AlertSink};
use crate::clock::SharedClock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum CircuitState {
    /// Normal operation. Requests flow through.
    Closed,
    /// Tripped. No requests allowed until the cool-down elapses.
    Open,
    /// Testing the waters with a single trial call.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Breaker tuning for one endpoint.
#[derive(Debug, Clone)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub cool_down: Duration,
    pub max_cool_down: Duration,
    /// Re-opening within this long of the previous open keeps the grown
    /// cool-down instead of resetting it to `cool_down`.
    pub monitoring_window: Duration,
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    current_cool_down: Duration,
    last_opened_at: Option<Instant>,
    trial_in_flight: bool,
    /// Set by rejected credentials. Only `manual_reset` clears it.
    held_open: bool,
    last_state_change: Instant,
    total_trips: u64,
}

/// Why a call was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejection {
    /// Time until the breaker will consider a trial. `None` while a trial is
    /// already outstanding or while the breaker is held open indefinitely.
    pub retry_in: Option<Duration>,
}

pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    inner: Mutex<BreakerInner>,
    clock: SharedClock,
    alerts: AlertSink,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        settings: BreakerSettings,
        clock: SharedClock,
        alerts: AlertSink,
    ) -> Self {
        let name = name.into();
        debug!(
            endpoint = %name,
            failure_threshold = settings.failure_threshold,
            cool_down_secs = settings.cool_down.as_secs(),
            max_cool_down_secs = settings.max_cool_down.as_secs(),
            "Circuit breaker initialized"
        );
        let now = clock.now();
        Self {
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                current_cool_down: settings.cool_down,
                last_opened_at: None,
                trial_in_flight: false,
                held_open: false,
                last_state_change: now,
                total_trips: 0,
            }),
            name,
            settings,
            clock,
            alerts,
        }
    }

    /// Ask for permission to make one upstream attempt.
    ///
    /// The returned guard must be settled with the attempt's outcome. Dropping
    /// it unsettled counts as neither success nor failure and releases the
    /// half-open trial slot if it held one.
    pub fn try_acquire(&self) -> Result<CallGuard<'_>, Rejection> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => Ok(CallGuard::new(self, false)),
            CircuitState::Open => {
                if inner.held_open {
                    return Err(Rejection { retry_in: None });
                }
                let opened_at = inner.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed >= inner.current_cool_down {
                    info!(
                        endpoint = %self.name,
                        cool_down_secs = inner.current_cool_down.as_secs(),
                        "Circuit breaker OPEN -> HALF_OPEN, admitting a trial call"
                    );
                    inner.state = CircuitState::HalfOpen;
                    inner.last_state_change = now;
                    inner.trial_in_flight = true;
                    Ok(CallGuard::new(self, true))
                } else {
                    Err(Rejection {
                        retry_in: Some(inner.current_cool_down - elapsed),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(Rejection { retry_in: None })
                } else {
                    inner.trial_in_flight = true;
                    Ok(CallGuard::new(self, true))
                }
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    pub fn current_cool_down(&self) -> Duration {
        self.inner.lock().current_cool_down
    }

    pub fn is_held_open(&self) -> bool {
        self.inner.lock().held_open
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn on_success(&self, trial: bool) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        if trial {
            inner.trial_in_flight = false;
            if inner.state == CircuitState::HalfOpen {
                info!(
                    endpoint = %self.name,
                    "Trial call succeeded, circuit breaker HALF_OPEN -> CLOSED"
                );
                self.close(&mut inner, now);
            }
        } else if inner.state == CircuitState::Closed {
            inner.consecutive_failures = 0;
        }
    }

    fn on_failure(&self, trial: bool) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        if trial {
            inner.trial_in_flight = false;
            if inner.state == CircuitState::HalfOpen {
                let doubled = inner
                    .current_cool_down
                    .saturating_mul(2)
                    .min(self.settings.max_cool_down);
                inner.current_cool_down = doubled;
                warn!(
                    endpoint = %self.name,
                    cool_down_secs = doubled.as_secs(),
                    "Trial call failed, circuit breaker HALF_OPEN -> OPEN"
                );
                self.enter_open(&mut inner, now);
            }
            return;
        }

        if inner.state != CircuitState::Closed {
            return;
        }
        inner.consecutive_failures += 1;
        if inner.consecutive_failures >= self.settings.failure_threshold {
            inner.current_cool_down = self.cool_down_for_reopen(&inner, now);
            warn!(
                endpoint = %self.name,
                failures = inner.consecutive_failures,
                cool_down_secs = inner.current_cool_down.as_secs(),
                "Circuit breaker TRIPPED, CLOSED -> OPEN"
            );
            self.enter_open(&mut inner, now);
        } else {
            debug!(
                endpoint = %self.name,
                failures = inner.consecutive_failures,
                threshold = self.settings.failure_threshold,
                "Transient failure recorded"
            );
        }
    }

    fn on_release(&self, trial: bool) {
        if trial {
            self.inner.lock().trial_in_flight = false;
        }
    }

    /// Open the breaker ahead of user traffic. Used by the health prober.
    pub fn force_open(&self, reason: &str) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::Open {
            return;
        }
        inner.current_cool_down = self.cool_down_for_reopen(&inner, now);
        warn!(
            endpoint = %self.name,
            reason,
            from = %inner.state,
            "Circuit breaker opened preemptively"
        );
        inner.trial_in_flight = false;
        self.enter_open(&mut inner, now);
    }

    /// Rejected credentials. Nothing but `manual_reset` closes this.
    pub fn open_indefinitely(&self, status: u16) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let already = inner.held_open;
        inner.held_open = true;
        inner.trial_in_flight = false;
        if inner.state != CircuitState::Open {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(now);
            inner.last_opened_at = Some(now);
            inner.last_state_change = now;
            inner.total_trips += 1;
        }
        drop(inner);

        if !already {
            warn!(
                endpoint = %self.name,
                status,
                "Provider rejected credentials, circuit breaker held OPEN until manual override"
            );
            self.alerts
                .raise(&self.name, AlertKind::CredentialsRejected { status });
        }
    }

    /// Operator override: force CLOSED regardless of state.
    pub fn manual_reset(&self, operator: &str) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let previous = inner.state;
        inner.held_open = false;
        inner.trial_in_flight = false;
        self.close(&mut inner, now);
        drop(inner);

        warn!(
            endpoint = %self.name,
            admin_override = true,
            operator,
            previous_state = %previous,
            "Circuit breaker manually forced CLOSED"
        );
        self.alerts.raise(
            &self.name,
            AlertKind::ManualOverride {
                operator: operator.to_string(),
                previous_state: previous.to_string(),
            },
        );
    }

    /// Automatic recovery confirmed by the health prober. A breaker held open
    /// by rejected credentials stays open.
    pub fn reset_by_health_probe(&self) -> bool {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        if inner.held_open {
            return false;
        }
        if inner.state != CircuitState::Closed {
            info!(
                endpoint = %self.name,
                from = %inner.state,
                "Health probes confirm recovery, circuit breaker -> CLOSED"
            );
        }
        inner.trial_in_flight = false;
        self.close(&mut inner, now);
        true
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let now = self.clock.now();
        let inner = self.inner.lock();
        let retry_in_secs = match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(at)) if !inner.held_open => Some(
                inner
                    .current_cool_down
                    .saturating_sub(now.saturating_duration_since(at))
                    .as_secs(),
            ),
            _ => None,
        };
        CircuitBreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            current_cool_down_secs: inner.current_cool_down.as_secs(),
            held_open: inner.held_open,
            trial_in_flight: inner.trial_in_flight,
            total_trips: inner.total_trips,
            time_in_current_state_secs: now
                .saturating_duration_since(inner.last_state_change)
                .as_secs(),
            retry_in_secs,
        }
    }

    fn cool_down_for_reopen(&self, inner: &BreakerInner, now: Instant) -> Duration {
        match inner.last_opened_at {
            Some(last)
                if now.saturating_duration_since(last) <= self.settings.monitoring_window =>
            {
                inner.current_cool_down
            }
            _ => self.settings.cool_down,
        }
    }

    fn enter_open(&self, inner: &mut BreakerInner, now: Instant) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(now);
        inner.last_opened_at = Some(now);
        inner.last_state_change = now;
        inner.total_trips += 1;
        self.alerts.raise(
            &self.name,
            AlertKind::BreakerOpened {
                consecutive_failures: inner.consecutive_failures,
                cool_down_secs: inner.current_cool_down.as_secs(),
            },
        );
    }

    fn close(&self, inner: &mut BreakerInner, now: Instant) {
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.current_cool_down = self.settings.cool_down;
        inner.opened_at = None;
        inner.last_state_change = now;
    }
}

/// Permission for one attempt. Settle it with the outcome.
#[must_use = "settle the guard with the outcome of the call"]
pub struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> CallGuard<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    /// Whether this guard holds the single half-open trial slot.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn succeed(mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    /// A failure that counts toward the breaker (transient only).
    pub fn fail(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.trial);
    }

    /// An outcome that says nothing about availability (not found, rate
    /// limited). Frees the trial slot without a transition.
    pub fn release(mut self) {
        self.settled = true;
        self.breaker.on_release(self.trial);
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_release(self.trial);
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CircuitBreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub current_cool_down_secs: u64,
    pub held_open: bool,
    pub trial_in_flight: bool,
    pub total_trips: u64,
    pub time_in_current_state_secs: u64,
    pub retry_in_secs: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn settings() -> BreakerSettings {
        BreakerSettings {
            failure_threshold: 5,
            cool_down: Duration::from_secs(60),
            max_cool_down: Duration::from_secs(300),
            monitoring_window: Duration::from_secs(600),
        }
    }

    fn breaker(clock: &Arc<ManualClock>) -> CircuitBreaker {
        CircuitBreaker::new("test", settings(), clock.clone(), AlertSink::disabled())
    }

    fn trip(cb: &CircuitBreaker) {
        for _ in 0..5 {
            cb.try_acquire().unwrap().fail();
        }
    }

    #[test]
    fn test_starts_closed() {
        let clock = Arc::new(ManualClock::new());
        let cb = breaker(&clock);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().is_ok());
    }

    #[test]
    fn test_trips_after_threshold_failures() {
        let clock = Arc::new(ManualClock::new());
        let cb = breaker(&clock);
        for _ in 0..4 {
            cb.try_acquire().unwrap().fail();
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.try_acquire().unwrap().fail();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.try_acquire().is_err());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let clock = Arc::new(ManualClock::new());
        let cb = breaker(&clock);
        for _ in 0..4 {
            cb.try_acquire().unwrap().fail();
        }
        cb.try_acquire().unwrap().succeed();
        cb.try_acquire().unwrap().fail();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 1);
    }

    #[test]
    fn test_half_open_only_after_full_cool_down() {
        let clock = Arc::new(ManualClock::new());
        let cb = breaker(&clock);
        trip(&cb);

        clock.advance(Duration::from_secs(59));
        let rejection = cb.try_acquire().err().unwrap();
        assert_eq!(rejection.retry_in, Some(Duration::from_secs(1)));
        assert_eq!(cb.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(1));
        let guard = cb.try_acquire().unwrap();
        assert!(guard.is_trial());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        guard.release();
    }

    #[test]
    fn test_trial_success_closes_and_resets() {
        let clock = Arc::new(ManualClock::new());
        let cb = breaker(&clock);
        trip(&cb);
        clock.advance(Duration::from_secs(60));
        cb.try_acquire().unwrap().succeed();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 0);
        assert_eq!(cb.current_cool_down(), Duration::from_secs(60));
    }

    #[test]
    fn test_trial_failure_doubles_cool_down_up_to_ceiling() {
        let clock = Arc::new(ManualClock::new());
        let cb = breaker(&clock);
        trip(&cb);

        let mut expected = 60;
        for _ in 0..4 {
            clock.advance(Duration::from_secs(expected));
            cb.try_acquire().unwrap().fail();
            expected = (expected * 2).min(300);
            assert_eq!(cb.state(), CircuitState::Open);
            assert_eq!(cb.current_cool_down(), Duration::from_secs(expected));
        }
        assert_eq!(cb.current_cool_down(), Duration::from_secs(300));
    }

    #[test]
    fn test_exactly_one_trial_in_flight() {
        let clock = Arc::new(ManualClock::new());
        let cb = breaker(&clock);
        trip(&cb);
        clock.advance(Duration::from_secs(60));

        let trial = cb.try_acquire().unwrap();
        for _ in 0..10 {
            assert_eq!(cb.try_acquire().err(), Some(Rejection { retry_in: None }));
        }
        drop(trial);
        // An abandoned trial frees the slot without a transition.
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.try_acquire().unwrap().is_trial());
    }

    #[test]
    fn test_exactly_one_trial_under_thread_contention() {
        let clock = Arc::new(ManualClock::new());
        let cb = Arc::new(breaker(&clock));
        trip(&cb);
        clock.advance(Duration::from_secs(60));

        let barrier = Arc::new(std::sync::Barrier::new(16));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cb = Arc::clone(&cb);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    match cb.try_acquire() {
                        Ok(guard) => {
                            std::mem::forget(guard);
                            1
                        }
                        Err(_) => 0,
                    }
                })
            })
            .collect();
        let admitted: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 1);
    }

    #[test]
    fn test_late_closed_outcomes_do_not_drive_half_open() {
        let clock = Arc::new(ManualClock::new());
        let cb = breaker(&clock);
        let straggler = cb.try_acquire().unwrap();
        trip(&cb);
        clock.advance(Duration::from_secs(60));
        let trial = cb.try_acquire().unwrap();
        straggler.succeed();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        trial.fail();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_repeated_open_keeps_grown_cool_down_within_window() {
        let clock = Arc::new(ManualClock::new());
        let cb = breaker(&clock);
        trip(&cb);
        clock.advance(Duration::from_secs(60));
        cb.try_acquire().unwrap().fail(); // cool-down now 120s
        clock.advance(Duration::from_secs(120));
        let trial = cb.try_acquire().unwrap();
        drop(trial);
        cb.force_open("probe failures");
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.current_cool_down(), Duration::from_secs(120));
    }

    #[test]
    fn test_open_outside_window_resets_to_base() {
        let clock = Arc::new(ManualClock::new());
        let cb = breaker(&clock);
        trip(&cb);
        clock.advance(Duration::from_secs(60));
        cb.try_acquire().unwrap().fail();
        clock.advance(Duration::from_secs(120));
        let trial = cb.try_acquire().unwrap();
        drop(trial);
        clock.advance(Duration::from_secs(3600));
        cb.force_open("probe failures");
        assert_eq!(cb.current_cool_down(), Duration::from_secs(60));
    }

    #[test]
    fn test_released_outcomes_never_count() {
        let clock = Arc::new(ManualClock::new());
        let cb = breaker(&clock);
        for _ in 0..20 {
            cb.try_acquire().unwrap().release();
        }
        assert_eq!(cb.consecutive_failures(), 0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_indefinite_open_needs_manual_reset() {
        let clock = Arc::new(ManualClock::new());
        let (alerts, rx) = AlertSink::channel(8);
        let cb = CircuitBreaker::new("test", settings(), clock.clone(), alerts);

        cb.open_indefinitely(401);
        clock.advance(Duration::from_secs(86_400));
        assert_eq!(cb.try_acquire().err(), Some(Rejection { retry_in: None }));
        assert!(!cb.reset_by_health_probe());
        assert_eq!(cb.state(), CircuitState::Open);

        cb.manual_reset("ops-oncall");
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(!cb.is_held_open());

        let kinds: Vec<_> = rx.try_iter().map(|a| a.kind).collect();
        assert_eq!(
            kinds,
            vec![
                AlertKind::CredentialsRejected { status: 401 },
                AlertKind::ManualOverride {
                    operator: "ops-oncall".to_string(),
                    previous_state: "OPEN".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_trip_raises_alert() {
        let clock = Arc::new(ManualClock::new());
        let (alerts, rx) = AlertSink::channel(8);
        let cb = CircuitBreaker::new("test", settings(), clock.clone(), alerts);
        trip(&cb);
        assert!(matches!(
            rx.try_recv().unwrap().kind,
            AlertKind::BreakerOpened { consecutive_failures: 5, cool_down_secs: 60 }
        ));
    }

    #[test]
    fn test_snapshot_reports_remaining_cool_down() {
        let clock = Arc::new(ManualClock::new());
        let cb = breaker(&clock);
        trip(&cb);
        clock.advance(Duration::from_secs(45));
        let snap = cb.snapshot();
        assert_eq!(snap.state, CircuitState::Open);
        assert_eq!(snap.retry_in_secs, Some(15));
        assert_eq!(snap.total_trips, 1);
    }
}
