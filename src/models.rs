// =============================================================================
// models.rs - THE VOCABULARY OF THE GATEWAY
// =============================================================================
//
// The small set of types every layer speaks: what a caller asks for
// (FetchRequest), what comes back (FetchResponse), and the tags that tell the
// scoring engine and the leaderboard how much to trust a payload.
//
// The gateway never looks inside a payload. Stats, schedules and injury news
// are all just bytes to us. Freshness and provenance are what we care about.
// =============================================================================

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Request priority. Ordering matters: higher variants are served first when
/// tokens are scarce and are the last to be shed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    /// Warm-up fetches and other background work.
    Low,
    /// Profile lookups, player search.
    Normal,
    /// Roster and lineup screens a user is looking at right now.
    High,
    /// Live in-game polling. Scores move, so this goes first.
    Live,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "LOW"),
            Priority::Normal => write!(f, "NORMAL"),
            Priority::High => write!(f, "HIGH"),
            Priority::Live => write!(f, "LIVE"),
        }
    }
}

/// Which tier of the fallback chain produced a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceTier {
    Primary,
    Secondary,
    Cache,
}

impl fmt::Display for SourceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceTier::Primary => write!(f, "PRIMARY"),
            SourceTier::Secondary => write!(f, "SECONDARY"),
            SourceTier::Cache => write!(f, "CACHE"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Freshness {
    Live,
    Stale,
}

impl fmt::Display for Freshness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Freshness::Live => write!(f, "LIVE"),
            Freshness::Stale => write!(f, "STALE"),
        }
    }
}

/// Volatility class of an endpoint's data. Drives the default TTL policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataCategory {
    /// In-game stats. Seconds-scale TTL.
    LiveStats,
    /// Weekly / final stats. Short TTL during the stat-correction window,
    /// effectively permanent afterwards.
    FinalStats,
    /// News and injury reports.
    News,
    /// Game schedule.
    Schedule,
    /// Player bios and other static profile data. Hours-scale TTL.
    Profile,
}

impl DataCategory {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "live" | "live_stats" => Some(DataCategory::LiveStats),
            "final" | "final_stats" => Some(DataCategory::FinalStats),
            "news" => Some(DataCategory::News),
            "schedule" => Some(DataCategory::Schedule),
            "profile" => Some(DataCategory::Profile),
            _ => None,
        }
    }
}

impl fmt::Display for DataCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataCategory::LiveStats => write!(f, "live_stats"),
            DataCategory::FinalStats => write!(f, "final_stats"),
            DataCategory::News => write!(f, "news"),
            DataCategory::Schedule => write!(f, "schedule"),
            DataCategory::Profile => write!(f, "profile"),
        }
    }
}

/// HTTP-style method of an outbound call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    /// Safe to repeat without an idempotency key.
    pub fn is_idempotent(self) -> bool {
        matches!(self, Method::Get | Method::Head | Method::Put | Method::Delete)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        };
        write!(f, "{s}")
    }
}

/// What a data-access service asks the gateway for.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub endpoint: String,
    pub key: String,
    pub priority: Priority,
    pub method: Method,
    pub idempotency_key: Option<String>,
}

impl FetchRequest {
    /// A GET for `key` on `endpoint` at normal priority.
    pub fn get(endpoint: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            key: key.into(),
            priority: Priority::Normal,
            method: Method::Get,
            idempotency_key: None,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// A payload plus everything a consumer needs to decide how much to trust it.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub payload: Bytes,
    pub source: SourceTier,
    pub freshness: Freshness,
    /// When the payload was originally fetched from a provider.
    pub fetched_at: DateTime<Utc>,
    /// Name of the endpoint that actually produced the payload. Differs from
    /// the requested endpoint when the secondary provider answered.
    pub served_by: String,
    /// Human-readable marker for stale data, e.g. "Data may be outdated".
    pub warning: Option<String>,
}

impl FetchResponse {
    pub fn is_stale(&self) -> bool {
        self.freshness == Freshness::Stale
    }
}

impl fmt::Display for FetchResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} bytes from {} via {} ({}, fetched {})",
            self.payload.len(),
            self.served_by,
            self.source,
            self.freshness,
            self.fetched_at.to_rfc3339()
        )
    }
}
