// =============================================================================
// alerts.rs - THE PAGER
// =============================================================================
//
// Some things need a human: a breaker held open by rejected credentials, a
// provider that keeps telling us to slow down, an operator forcing a breaker
// closed at 3am. Those become Alerts.
//
// Pipeline:
// 1. Hot-path code calls AlertSink::raise, which try_sends onto a bounded
//    crossbeam channel. It never blocks and never fails the caller. If the
//    channel is full the alert is logged and dropped.
// 2. AlertPublisher drains the channel in batches, PUBLISHes each alert on a
//    Redis pub/sub channel for the ops dashboard, and ZADDs it to a sorted set
//    scored by timestamp, so an offline dashboard can catch up later.
// =============================================================================

use anyhow::Result;
use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use portable_atomic::{AtomicU64, Ordering};
use redis::AsyncCommands;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "INFO"),
            Severity::Warning => write!(f, "WARNING"),
            Severity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlertKind {
    BreakerOpened {
        consecutive_failures: u32,
        cool_down_secs: u64,
    },
    /// Provider rejected our credentials. The breaker stays open until an
    /// operator resets it.
    CredentialsRejected { status: u16 },
    ManualOverride {
        operator: String,
        previous_state: String,
    },
    /// Repeated provider 429s. We are paying for too small a tier.
    TierUpgradeRecommended {
        violations: u32,
        new_limit_per_minute: f64,
    },
    LowTokens { available: f64, capacity: f64 },
    /// Too many upstream attempts failing over the rolling stats window.
    HighErrorRate {
        error_rate_percent: f64,
        attempts: u64,
        window_secs: u64,
    },
    EndpointUnhealthy { consecutive_failures: u32 },
    EndpointRecovered { consecutive_successes: u32 },
    SharedCounterDegraded { reason: String },
    SharedCounterRestored,
    CacheInvalidated { entries: usize },
}

impl AlertKind {
    pub fn severity(&self) -> Severity {
        match self {
            AlertKind::CredentialsRejected { .. } | AlertKind::EndpointUnhealthy { .. } => {
                Severity::Critical
            }
            AlertKind::BreakerOpened { .. }
            | AlertKind::ManualOverride { .. }
            | AlertKind::TierUpgradeRecommended { .. }
            | AlertKind::LowTokens { .. }
            | AlertKind::HighErrorRate { .. }
            | AlertKind::SharedCounterDegraded { .. } => Severity::Warning,
            AlertKind::EndpointRecovered { .. }
            | AlertKind::SharedCounterRestored
            | AlertKind::CacheInvalidated { .. } => Severity::Info,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: Uuid,
    pub raised_at: DateTime<Utc>,
    pub severity: Severity,
    pub endpoint: String,
    #[serde(flatten)]
    pub kind: AlertKind,
}

/// Cheap, cloneable handle for raising alerts from anywhere.
#[derive(Debug, Clone)]
pub struct AlertSink {
    tx: Option<Sender<Alert>>,
}

impl AlertSink {
    /// Create a sink and the receiver the publisher drains.
    pub fn channel(capacity: usize) -> (Self, Receiver<Alert>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that only logs.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn raise(&self, endpoint: &str, kind: AlertKind) {
        let alert = Alert {
            id: Uuid::new_v4(),
            raised_at: Utc::now(),
            severity: kind.severity(),
            endpoint: endpoint.to_string(),
            kind,
        };

        match alert.severity {
            Severity::Critical => error!(endpoint, alert = ?alert.kind, "🚨 Alert raised"),
            Severity::Warning => warn!(endpoint, alert = ?alert.kind, "Alert raised"),
            Severity::Info => info!(endpoint, alert = ?alert.kind, "Alert raised"),
        }

        let Some(tx) = &self.tx else { return };
        match tx.try_send(alert) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => {
                warn!(endpoint, alert_id = %dropped.id, "Alert channel full, alert dropped");
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!(endpoint, "Alert publisher gone, alert only logged");
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct PublisherStats {
    pub alerts_published: AtomicU64,
    pub alerts_persisted: AtomicU64,
    pub publish_errors: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublisherSnapshot {
    pub alerts_published: u64,
    pub alerts_persisted: u64,
    pub publish_errors: u64,
}

impl PublisherStats {
    pub fn snapshot(&self) -> PublisherSnapshot {
        PublisherSnapshot {
            alerts_published: self.alerts_published.load(Ordering::Relaxed),
            alerts_persisted: self.alerts_persisted.load(Ordering::Relaxed),
            publish_errors: self.publish_errors.load(Ordering::Relaxed),
        }
    }
}

/// Drains the alert channel into Redis.
pub struct AlertPublisher {
    redis_url: String,
    channel: String,
    history: String,
    receiver: Receiver<Alert>,
    shutdown: watch::Receiver<bool>,
    stats: Arc<PublisherStats>,
}

impl AlertPublisher {
    pub fn new(
        redis_url: impl Into<String>,
        channel: impl Into<String>,
        history: impl Into<String>,
        receiver: Receiver<Alert>,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, Arc<PublisherStats>) {
        let stats = Arc::new(PublisherStats::default());
        (
            Self {
                redis_url: redis_url.into(),
                channel: channel.into(),
                history: history.into(),
                receiver,
                shutdown,
                stats: Arc::clone(&stats),
            },
            stats,
        )
    }

    /// Run until shutdown, then flush what is left in the channel.
    pub async fn run(self) -> Result<()> {
        info!(channel = %self.channel, history = %self.history, "Alert publisher starting");

        let client = redis::Client::open(self.redis_url.as_str())?;
        let mut con = loop {
            match client.get_multiplexed_async_connection().await {
                Ok(con) => {
                    info!("Alert publisher connected to Redis");
                    break con;
                }
                Err(e) => {
                    warn!(error = %e, "Alert publisher cannot reach Redis, retrying in 5 seconds");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    if *self.shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        };

        const BATCH_SIZE: usize = 50;
        let mut batch: Vec<Alert> = Vec::with_capacity(BATCH_SIZE);

        loop {
            if *self.shutdown.borrow() {
                batch.clear();
                batch.extend(self.receiver.try_iter());
                if !batch.is_empty() {
                    if let Err(e) = self.publish_batch(&mut con, &batch).await {
                        error!(error = %e, "Failed to flush alerts during shutdown");
                    }
                }
                info!("Alert publisher stopped");
                return Ok(());
            }

            batch.clear();
            batch.extend(self.receiver.try_iter().take(BATCH_SIZE));

            if batch.is_empty() {
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }

            if let Err(e) = self.publish_batch(&mut con, &batch).await {
                error!(error = %e, batch_size = batch.len(), "Failed to publish alert batch");
                self.stats
                    .publish_errors
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
            }
        }
    }

    async fn publish_batch(
        &self,
        con: &mut redis::aio::MultiplexedConnection,
        batch: &[Alert],
    ) -> Result<()> {
        for alert in batch {
            let json = serde_json::to_string(alert)?;

            let _: () = con.publish(&self.channel, &json).await?;
            self.stats.alerts_published.fetch_add(1, Ordering::Relaxed);

            let score = alert.raised_at.timestamp() as f64;
            let _: () = con.zadd(&self.history, &json, score).await?;
            self.stats.alerts_persisted.fetch_add(1, Ordering::Relaxed);
        }
        debug!(batch_size = batch.len(), "Alert batch published");
        Ok(())
    }
}
