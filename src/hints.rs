//! Optional write-through hint cache for session metadata.
//!
//! Hints are never authoritative: a missing or stale hint only means the
//! caller falls back to the relational store. The core runs fine with no
//! cache at all.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::session::{SessionId, SessionStatus};

/// Session metadata worth surviving a process restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHint {
    /// Last known status.
    pub status: SessionStatus,
    /// Phone identity, if known.
    pub phone: Option<String>,
    /// When the hint was written.
    pub updated_at: DateTime<Utc>,
}

/// TTL-bounded key/value hint store.
#[async_trait]
pub trait HintCache: Send + Sync {
    /// Write (or overwrite) a hint.
    async fn put(&self, id: &SessionId, hint: SessionHint);

    /// Read a hint if present and not expired.
    async fn get(&self, id: &SessionId) -> Option<SessionHint>;

    /// Drop a hint.
    async fn remove(&self, id: &SessionId);
}

/// In-process [`HintCache`] with a fixed TTL.
#[derive(Debug)]
pub struct MemoryHintCache {
    ttl: Duration,
    entries: DashMap<SessionId, (Instant, SessionHint)>,
}

impl MemoryHintCache {
    /// Create a cache whose entries expire after `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    /// Number of entries, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl HintCache for MemoryHintCache {
    async fn put(&self, id: &SessionId, hint: SessionHint) {
        self.entries.insert(id.clone(), (Instant::now(), hint));
    }

    async fn get(&self, id: &SessionId) -> Option<SessionHint> {
        let ttl = self.ttl;
        // remove_if evicts in place so an expired read never returns stale data.
        if self
            .entries
            .remove_if(id, |_, (written, _)| written.elapsed() >= ttl)
            .is_some()
        {
            return None;
        }
        self.entries.get(id).map(|entry| entry.value().1.clone())
    }

    async fn remove(&self, id: &SessionId) {
        self.entries.remove(id);
    }
}
