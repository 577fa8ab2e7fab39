// =============================================================================
// cache.rs - THE MEMORY OF BETTER TIMES
// =============================================================================
//
// Every successful fetch lands here, so when the providers are on fire we can
// still answer with what we knew five minutes (or six hours) ago, honestly
// labeled.
//
// Rules:
// - An entry is LIVE while younger than its TTL, STALE after.
// - Finalized data (weekly stats) stops expiring once its correction window
//   has passed since it was first cached.
// - Invalidation marks an entry STALE immediately. It stays around for the
//   stale tier; it is never served as fresh again until refetched.
// - Writes never go backwards in time: an older fetched_at is rejected.
// =============================================================================

use bytes::Bytes;
use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::time::Duration;
use tracing::debug;

use crate::models::{Freshness, SourceTier};

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub payload: Bytes,
    pub fetched_at: DateTime<Utc>,
    /// When this key was first cached. Anchors the correction window.
    pub first_cached_at: DateTime<Utc>,
    pub ttl: Duration,
    pub source: SourceTier,
    pub served_by: String,
    pub permanent_after: Option<Duration>,
    pub invalidated: bool,
}

impl CacheEntry {
    pub fn freshness(&self, now: DateTime<Utc>) -> Freshness {
        if self.invalidated {
            return Freshness::Stale;
        }
        if let Some(window) = self.permanent_after {
            if elapsed(self.first_cached_at, now) >= window {
                return Freshness::Live;
            }
        }
        if elapsed(self.fetched_at, now) < self.ttl {
            Freshness::Live
        } else {
            Freshness::Stale
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        elapsed(self.fetched_at, now)
    }
}

fn elapsed(from: DateTime<Utc>, to: DateTime<Utc>) -> Duration {
    (to - from).to_std().unwrap_or(Duration::ZERO)
}

/// What a fresh fetch hands to the cache.
#[derive(Debug, Clone)]
pub struct CacheWrite {
    pub payload: Bytes,
    pub fetched_at: DateTime<Utc>,
    pub ttl: Duration,
    pub source: SourceTier,
    pub served_by: String,
    pub permanent_after: Option<Duration>,
}

#[derive(Debug)]
pub struct ResponseCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
}

pub fn cache_key(endpoint: &str, key: &str) -> String {
    format!("{endpoint}:{key}")
}

impl ResponseCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, endpoint: &str, key: &str) -> Option<CacheEntry> {
        self.entries.lock().get(&cache_key(endpoint, key)).cloned()
    }

    /// Store a fetch result. Returns false if a newer entry already exists.
    pub fn put(&self, endpoint: &str, key: &str, write: CacheWrite) -> bool {
        let k = cache_key(endpoint, key);
        let mut entries = self.entries.lock();

        let first_cached_at = match entries.peek(&k) {
            Some(existing) if existing.fetched_at > write.fetched_at => {
                debug!(
                    cache_key = %k,
                    existing = %existing.fetched_at,
                    incoming = %write.fetched_at,
                    "Rejected out-of-order cache write"
                );
                return false;
            }
            Some(existing) => existing.first_cached_at,
            None => write.fetched_at,
        };

        entries.put(
            k.clone(),
            CacheEntry {
                key: k,
                payload: write.payload,
                fetched_at: write.fetched_at,
                first_cached_at,
                ttl: write.ttl,
                source: write.source,
                served_by: write.served_by,
                permanent_after: write.permanent_after,
                invalidated: false,
            },
        );
        true
    }

    /// Mark one entry stale ahead of its TTL.
    pub fn invalidate(&self, endpoint: &str, key: &str) -> bool {
        match self.entries.lock().peek_mut(&cache_key(endpoint, key)) {
            Some(entry) => {
                entry.invalidated = true;
                true
            }
            None => false,
        }
    }

    /// Mark every entry of `endpoint` stale. Returns how many were marked.
    pub fn invalidate_endpoint(&self, endpoint: &str) -> usize {
        let prefix = format!("{endpoint}:");
        let mut marked = 0;
        for (k, entry) in self.entries.lock().iter_mut() {
            if k.starts_with(&prefix) && !entry.invalidated {
                entry.invalidated = true;
                marked += 1;
            }
        }
        marked
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
