//! Test doubles: a scripted upstream and a config that points at it.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use portable_atomic::{AtomicBool, Ordering};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Notify;

use crate::config::GatewayConfig;
use crate::transport::{OutboundCall, RateLimitHeaders, Transport, TransportError, TransportResponse};

pub const TEST_HOST: &str = "https://provider.test";

/// One canned upstream behavior.
#[derive(Debug, Clone)]
pub enum Reply {
    Ok(&'static str),
    Status(u16),
    RateLimited(Option<Duration>),
    WithQuota(&'static str, RateLimitHeaders),
    Error(TransportError),
    /// Never answers.
    Hang,
    /// Answers 200 with the body once [`ScriptedTransport::release`] is called.
    Held(&'static str),
}

/// Upstream fake. Replies are queued per endpoint, where the endpoint is the
/// first path segment of the target (see [`test_config`]). An empty queue
/// answers 200 "ok".
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<OutboundCall>>,
    released: AtomicBool,
    gate: Notify,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, endpoint: &str, reply: Reply) {
        self.scripts
            .lock()
            .entry(endpoint.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn push_many(&self, endpoint: &str, reply: Reply, times: usize) {
        for _ in 0..times {
            self.push(endpoint, reply.clone());
        }
    }

    /// Let every `Reply::Held` call, current and future, answer.
    pub fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
        self.gate.notify_waiters();
    }

    async fn wait_for_release(&self) {
        loop {
            let opened = self.gate.notified();
            if self.released.load(Ordering::SeqCst) {
                return;
            }
            opened.await;
        }
    }

    pub fn calls(&self) -> Vec<OutboundCall> {
        self.calls.lock().clone()
    }

    pub fn calls_to(&self, endpoint: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| route(&c.target) == endpoint)
            .count()
    }
}

fn route(target: &str) -> String {
    url::Url::parse(target)
        .ok()
        .and_then(|u| u.path_segments().and_then(|mut s| s.next().map(str::to_string)))
        .unwrap_or_default()
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn perform(&self, call: &OutboundCall) -> Result<TransportResponse, TransportError> {
        self.calls.lock().push(call.clone());
        let reply = self
            .scripts
            .lock()
            .get_mut(&route(&call.target))
            .and_then(|q| q.pop_front())
            .unwrap_or(Reply::Ok("ok"));

        match reply {
            Reply::Ok(body) => Ok(TransportResponse::ok(Bytes::from_static(body.as_bytes()))),
            Reply::Status(status) => Ok(TransportResponse::status(status)),
            Reply::RateLimited(retry_after) => Ok(TransportResponse {
                retry_after,
                ..TransportResponse::status(429)
            }),
            Reply::WithQuota(body, headers) => Ok(TransportResponse {
                rate_limit: Some(headers),
                ..TransportResponse::ok(Bytes::from_static(body.as_bytes()))
            }),
            Reply::Error(e) => Err(e),
            Reply::Hang => std::future::pending().await,
            Reply::Held(body) => {
                self.wait_for_release().await;
                Ok(TransportResponse::ok(Bytes::from_static(body.as_bytes())))
            }
        }
    }
}

/// Give spawned tasks a chance to run up to their next real wait.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// Default endpoints re-pointed at the scripted transport, with retries kept
/// short.
pub fn test_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    for ep in &mut config.endpoints {
        ep.target = format!("{TEST_HOST}/{}/{{key}}", ep.name);
        ep.probe_target = format!("{TEST_HOST}/{}/health", ep.name);
    }
    config.retry.base_delay = Duration::from_millis(100);
    config.retry.max_delay = Duration::from_secs(2);
    config
}
