// =============================================================================
// health.rs - THE CANARY
// =============================================================================
//
// Users should not be the ones who discover the stats feed is down. Each
// endpoint gets a background loop that pokes a cheap probe URL on a fixed
// schedule:
//
// - N consecutive probe failures: declare the endpoint unhealthy, open its
//   breaker before user traffic racks up the same failures, route callers to
//   the fallback chain and page someone.
// - M consecutive probe successes after that: declare it healthy, close the
//   breaker and stop falling back, without waiting for a user to prove it.
//
// Probes spend rate-limit tokens like everything else. No token, no probe.
// A 429 on a probe says nothing about availability and is ignored.
// =============================================================================

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::alerts::{AlertKind, AlertSink};
use crate::clock::SharedClock;
use crate::config::HealthConfig;
use crate::models::Method;
use crate::registry::{EndpointRegistry, EndpointRuntime};
use crate::transport::{perform_with_deadline, OutboundCall, Transport};

/// Probe bookkeeping for one endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct HealthProbeRecord {
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub declared_healthy: bool,
    pub last_probe_at: Option<DateTime<Utc>>,
    pub total_probes: u64,
}

impl Default for HealthProbeRecord {
    fn default() -> Self {
        Self {
            consecutive_successes: 0,
            consecutive_failures: 0,
            declared_healthy: true,
            last_probe_at: None,
            total_probes: 0,
        }
    }
}

pub type HealthSnapshot = HealthProbeRecord;

/// Shared, lock-protected probe record.
#[derive(Debug, Default)]
pub struct HealthState {
    record: Mutex<HealthProbeRecord>,
}

impl HealthState {
    pub fn snapshot(&self) -> HealthSnapshot {
        self.record.lock().clone()
    }

    /// True while the endpoint is declared unhealthy and callers should be
    /// routed straight to the fallback chain.
    pub fn fallback_active(&self) -> bool {
        !self.record.lock().declared_healthy
    }

    /// Operator override.
    pub fn mark_healthy(&self) {
        let mut record = self.record.lock();
        record.declared_healthy = true;
        record.consecutive_failures = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Success,
    Failure,
    /// Provider rate-limited the probe. No change.
    Neutral,
    /// No token to spend on a probe.
    Skipped,
}

/// What a probe did to the endpoint's declared health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    None,
    BecameUnhealthy,
    Recovered,
}

pub struct HealthProber {
    registry: Arc<EndpointRegistry>,
    transport: Arc<dyn Transport>,
    settings: HealthConfig,
    clock: SharedClock,
    alerts: AlertSink,
}

impl HealthProber {
    pub fn new(
        registry: Arc<EndpointRegistry>,
        transport: Arc<dyn Transport>,
        settings: HealthConfig,
        clock: SharedClock,
        alerts: AlertSink,
    ) -> Self {
        Self {
            registry,
            transport,
            settings,
            clock,
            alerts,
        }
    }

    /// Issue one probe against `runtime` and apply the result.
    pub async fn probe_endpoint(&self, runtime: &EndpointRuntime) -> (ProbeOutcome, HealthTransition) {
        let name = runtime.config.name.as_str();
        if !runtime.limiter.try_take().await {
            debug!(endpoint = name, "Probe skipped, no rate-limit token");
            return (ProbeOutcome::Skipped, HealthTransition::None);
        }

        let call = OutboundCall {
            method: Method::Get,
            target: runtime.config.probe_target.clone(),
            timeout: runtime.config.timeout,
            idempotency_key: None,
        };

        let outcome = match perform_with_deadline(&*self.transport, &*self.clock, &call).await {
            Ok(resp) if (200..400).contains(&resp.status) => ProbeOutcome::Success,
            Ok(resp) if resp.status == 429 => ProbeOutcome::Neutral,
            Ok(resp) if resp.status == 401 || resp.status == 403 => {
                runtime.breaker.open_indefinitely(resp.status);
                ProbeOutcome::Failure
            }
            Ok(resp) => {
                debug!(endpoint = name, status = resp.status, "Probe failed");
                ProbeOutcome::Failure
            }
            Err(e) => {
                debug!(endpoint = name, error = %e, "Probe failed");
                ProbeOutcome::Failure
            }
        };

        let transition = self.apply(runtime, outcome);
        (outcome, transition)
    }

    fn apply(&self, runtime: &EndpointRuntime, outcome: ProbeOutcome) -> HealthTransition {
        let name = runtime.config.name.as_str();
        let mut record = runtime.health.record.lock();
        record.last_probe_at = Some(self.clock.wall_now());
        record.total_probes += 1;

        match outcome {
            ProbeOutcome::Success => {
                record.consecutive_successes += 1;
                record.consecutive_failures = 0;
                if !record.declared_healthy
                    && record.consecutive_successes >= self.settings.healthy_threshold
                {
                    if !runtime.breaker.reset_by_health_probe() {
                        debug!(
                            endpoint = name,
                            "Probes pass but the breaker is held open for credentials, waiting for an operator"
                        );
                        return HealthTransition::None;
                    }
                    record.declared_healthy = true;
                    let successes = record.consecutive_successes;
                    drop(record);
                    info!(endpoint = name, successes, "✅ Endpoint healthy again, fallback off");
                    self.alerts.raise(
                        name,
                        AlertKind::EndpointRecovered {
                            consecutive_successes: successes,
                        },
                    );
                    return HealthTransition::Recovered;
                }
            }
            ProbeOutcome::Failure => {
                record.consecutive_failures += 1;
                record.consecutive_successes = 0;
                if record.declared_healthy
                    && record.consecutive_failures >= self.settings.unhealthy_threshold
                {
                    record.declared_healthy = false;
                    let failures = record.consecutive_failures;
                    drop(record);
                    runtime.breaker.force_open("health probes failing");
                    warn!(endpoint = name, failures, "🚨 Endpoint declared unhealthy, fallback on");
                    self.alerts.raise(
                        name,
                        AlertKind::EndpointUnhealthy {
                            consecutive_failures: failures,
                        },
                    );
                    return HealthTransition::BecameUnhealthy;
                }
            }
            ProbeOutcome::Neutral | ProbeOutcome::Skipped => {}
        }
        HealthTransition::None
    }

    /// Probe every endpoint once, concurrently.
    pub async fn probe_all(&self) -> Vec<(String, ProbeOutcome, HealthTransition)> {
        let probes = self.registry.iter().map(|runtime| async move {
            let (outcome, transition) = self.probe_endpoint(runtime).await;
            (runtime.config.name.clone(), outcome, transition)
        });
        futures::future::join_all(probes).await
    }

    /// Probe `endpoint` every interval until shutdown.
    pub async fn run_endpoint_loop(self: Arc<Self>, endpoint: String, mut shutdown: watch::Receiver<bool>) {
        let Some(runtime) = self.registry.get(&endpoint) else {
            warn!(endpoint = %endpoint, "No such endpoint, prober not started");
            return;
        };
        info!(
            endpoint = %endpoint,
            interval_secs = self.settings.probe_interval.as_secs(),
            "Health prober starting"
        );

        loop {
            tokio::select! {
                _ = self.clock.sleep(self.settings.probe_interval) => {
                    self.probe_endpoint(&runtime).await;
                }
                _ = shutdown.changed() => {
                    info!(endpoint = %endpoint, "Health prober shutting down");
                    return;
                }
            }
        }
    }

    /// One independent background task per endpoint.
    pub fn spawn_all(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        self.registry
            .names()
            .map(|name| {
                let prober = Arc::clone(&self);
                tokio::spawn(prober.run_endpoint_loop(name.to_string(), shutdown.clone()))
            })
            .collect()
    }

    pub fn probe_interval(&self) -> Duration {
        self.settings.probe_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use crate::clock::ManualClock;
    use crate::testing::{test_config, Reply, ScriptedTransport};

    fn setup(
        transport: Arc<ScriptedTransport>,
    ) -> (Arc<ManualClock>, Arc<EndpointRegistry>, HealthProber, crossbeam_channel::Receiver<crate::alerts::Alert>) {
        let clock = Arc::new(ManualClock::new());
        let (alerts, rx) = AlertSink::channel(64);
        let config = test_config();
        let registry = Arc::new(EndpointRegistry::build(
            &config,
            clock.clone(),
            alerts.clone(),
            None,
        ));
        let prober = HealthProber::new(
            registry.clone(),
            transport,
            config.health.clone(),
            clock.clone(),
            alerts,
        );
        (clock, registry, prober, rx)
    }

    #[tokio::test]
    async fn test_three_failures_open_breaker_preemptively() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_many("schedule", Reply::Status(503), 3);
        let (_clock, registry, prober, rx) = setup(transport);
        let runtime = registry.get("schedule").unwrap();

        for i in 0..3 {
            let (outcome, transition) = prober.probe_endpoint(&runtime).await;
            assert_eq!(outcome, ProbeOutcome::Failure);
            let expected = if i == 2 {
                HealthTransition::BecameUnhealthy
            } else {
                HealthTransition::None
            };
            assert_eq!(transition, expected);
        }
        assert_eq!(runtime.breaker.state(), CircuitState::Open);
        // User traffic never failed, the prober alone opened it.
        assert_eq!(runtime.breaker.consecutive_failures(), 0);
        assert!(runtime.health.fallback_active());
        assert!(rx
            .try_iter()
            .any(|a| matches!(a.kind, AlertKind::EndpointUnhealthy { consecutive_failures: 3 })));
    }

    #[tokio::test]
    async fn test_two_successes_restore_and_close() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_many("schedule", Reply::Status(503), 3);
        transport.push_many("schedule", Reply::Ok("ok"), 2);
        let (_clock, registry, prober, _rx) = setup(transport);
        let runtime = registry.get("schedule").unwrap();

        for _ in 0..3 {
            prober.probe_endpoint(&runtime).await;
        }
        let (_, t1) = prober.probe_endpoint(&runtime).await;
        assert_eq!(t1, HealthTransition::None);
        assert_eq!(runtime.breaker.state(), CircuitState::Open);

        let (_, t2) = prober.probe_endpoint(&runtime).await;
        assert_eq!(t2, HealthTransition::Recovered);
        assert_eq!(runtime.breaker.state(), CircuitState::Closed);
        assert!(!runtime.health.fallback_active());
    }

    #[tokio::test]
    async fn test_passing_health_checks_do_not_recover_rejected_credentials() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_many("schedule", Reply::Status(503), 3);
        transport.push_many("schedule", Reply::Ok("ok"), 3);
        let (_clock, registry, prober, rx) = setup(transport);
        let runtime = registry.get("schedule").unwrap();

        for _ in 0..3 {
            prober.probe_endpoint(&runtime).await;
        }
        runtime.breaker.open_indefinitely(401);

        for _ in 0..3 {
            let (outcome, transition) = prober.probe_endpoint(&runtime).await;
            assert_eq!(outcome, ProbeOutcome::Success);
            assert_eq!(transition, HealthTransition::None);
        }
        assert_eq!(runtime.breaker.state(), CircuitState::Open);
        assert!(runtime.health.fallback_active());
        assert!(!rx
            .try_iter()
            .any(|a| matches!(a.kind, AlertKind::EndpointRecovered { .. })));
    }

    #[tokio::test]
    async fn test_rate_limited_probe_is_neutral() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push("schedule", Reply::Status(503));
        transport.push("schedule", Reply::Status(503));
        transport.push("schedule", Reply::Status(429));
        transport.push("schedule", Reply::Status(503));
        let (_clock, registry, prober, _rx) = setup(transport);
        let runtime = registry.get("schedule").unwrap();

        prober.probe_endpoint(&runtime).await;
        prober.probe_endpoint(&runtime).await;
        let (outcome, _) = prober.probe_endpoint(&runtime).await;
        assert_eq!(outcome, ProbeOutcome::Neutral);
        assert_eq!(runtime.health.snapshot().consecutive_failures, 2);
        let (_, transition) = prober.probe_endpoint(&runtime).await;
        assert_eq!(transition, HealthTransition::BecameUnhealthy);
    }

    #[tokio::test]
    async fn test_hung_probe_times_out_as_failure() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push("schedule", Reply::Hang);
        let (clock, registry, prober, _rx) = setup(transport);
        let runtime = registry.get("schedule").unwrap();
        let (outcome, _) = prober.probe_endpoint(&runtime).await;
        assert_eq!(outcome, ProbeOutcome::Failure);
        assert_eq!(clock.elapsed(), runtime.config.timeout);
    }

    #[tokio::test]
    async fn test_probe_needs_a_token() {
        let transport = Arc::new(ScriptedTransport::new());
        let (_clock, registry, prober, _rx) = setup(transport.clone());
        let runtime = registry.get("schedule").unwrap();
        while runtime.limiter.try_take().await {}
        let (outcome, _) = prober.probe_endpoint(&runtime).await;
        assert_eq!(outcome, ProbeOutcome::Skipped);
        assert_eq!(transport.calls().len(), 0);
    }

    #[tokio::test]
    async fn test_probe_loop_stops_on_shutdown() {
        let transport = Arc::new(ScriptedTransport::new());
        let (_clock, _registry, prober, _rx) = setup(transport);
        let (tx, rx) = watch::channel(false);
        let handles = Arc::new(prober).spawn_all(rx);
        assert_eq!(handles.len(), 5);
        tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
