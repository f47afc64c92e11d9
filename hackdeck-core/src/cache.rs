//! Process-wide digest cache keyed by (normalized repository URL, commit).
//!
//! Entries are immutable; expiry is evaluated against an injected [`Clock`] on every read
//! so tests can move time without sleeping.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use moka::ops::compute::{CompResult, Op};
use moka::sync::Cache;
use tracing::{debug, info};

use crate::config::CacheSettings;
use crate::contract::Clock;
use crate::digest::Digest;

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct DigestCacheKey {
    repo_url: String,
    commit: String,
}

impl DigestCacheKey {
    /// `repo_url` should already be normalized; the commit is compared case-insensitively.
    pub fn new(repo_url: impl Into<String>, commit: &str) -> Self {
        Self {
            repo_url: repo_url.into(),
            commit: commit.trim().to_ascii_lowercase(),
        }
    }

    #[must_use]
    pub fn repo_url(&self) -> &str {
        &self.repo_url
    }

    #[must_use]
    pub fn commit(&self) -> &str {
        &self.commit
    }
}

#[derive(Debug)]
struct CachedDigest {
    digest: Arc<Digest>,
    created_at: DateTime<Utc>,
}

pub struct DigestCache {
    entries: Cache<DigestCacheKey, Arc<CachedDigest>>,
    expiry: chrono::Duration,
    clock: Arc<dyn Clock>,
}

impl DigestCache {
    pub fn new(settings: &CacheSettings, clock: Arc<dyn Clock>) -> Self {
        let entries = Cache::builder()
            .max_capacity(settings.max_entries)
            .eviction_listener(|k: Arc<DigestCacheKey>, _v, cause| {
                debug!(repo_url = %k.repo_url, commit = %k.commit, ?cause, "Evicting digest from cache");
            })
            .build();
        Self {
            entries,
            expiry: settings.expiry(),
            clock,
        }
    }

    /// The cached digest, if present and younger than the expiry window. Expired entries
    /// are dropped on the way.
    pub fn get(&self, key: &DigestCacheKey) -> Option<Arc<Digest>> {
        let entry = self.entries.get(key)?;
        let age = self.clock.now() - entry.created_at;
        if age >= self.expiry {
            info!(repo_url = %key.repo_url, commit = %key.commit, age_secs = age.num_seconds(), "Digest cache entry expired");
            self.entries.invalidate(key);
            return None;
        }
        debug!(repo_url = %key.repo_url, commit = %key.commit, "Digest cache hit");
        Some(Arc::clone(&entry.digest))
    }

    /// Store a digest unless a live entry already exists; returns whichever digest is cached.
    /// The check and the write happen atomically per key, so concurrent inserts agree on one
    /// digest. An expired entry is replaced.
    pub fn insert(&self, key: DigestCacheKey, digest: Arc<Digest>) -> Arc<Digest> {
        let now = self.clock.now();
        let expiry = self.expiry;
        let result = self.entries.entry(key).and_compute_with(|current| match current {
            Some(entry) if now - entry.value().created_at < expiry => Op::Nop,
            _ => Op::Put(Arc::new(CachedDigest {
                digest: Arc::clone(&digest),
                created_at: now,
            })),
        });
        match result {
            CompResult::Inserted(entry) | CompResult::ReplacedWith(entry) => {
                let key = entry.key();
                debug!(repo_url = %key.repo_url, commit = %key.commit, bytes = digest.len(), "Caching digest");
                Arc::clone(&entry.value().digest)
            }
            CompResult::Unchanged(entry) => Arc::clone(&entry.value().digest),
            CompResult::Removed(_) | CompResult::StillNone(_) => digest,
        }
    }

    pub fn invalidate_all(&self) {
        self.entries.invalidate_all();
    }

    /// Approximate number of entries, including ones not yet found to be expired.
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.entries.run_pending_tasks();
        self.entries.entry_count()
    }
}
