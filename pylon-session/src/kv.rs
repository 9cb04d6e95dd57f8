//! Pluggable key-value persistence.
//!
//! The [`KvStore`] trait abstracts over where session records live so that
//! callers can swap in Redis, SQLite, or anything else with per-key TTLs.
//! The built-in [`MemoryKv`] keeps everything in process memory and is what
//! the proxy binary and the test suite use.

use std::time::{Duration, Instant};

use dashmap::DashMap;

/// The persistence layer failed; callers retry a bounded number of times.
#[derive(Debug, thiserror::Error)]
#[error("key-value store unavailable: {0}")]
pub struct KvError(pub String);

/// An abstraction over keyed byte records with expiry.
pub trait KvStore: Send + Sync {
    /// Fetch the value for `key`, or `None` if absent or expired.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;

    /// Store `value` under `key`; the record vanishes after `ttl`.
    fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), KvError>;

    /// Remove `key`. Removing an absent key is not an error.
    fn delete(&self, key: &str) -> Result<(), KvError>;

    /// List all live keys starting with `prefix`.
    fn list(&self, prefix: &str) -> Result<Vec<String>, KvError>;

    /// Human-readable name of this backend (for log messages).
    fn name(&self) -> &str;
}

// ─── MemoryKv ─────────────────────────────────────────────────────────────────

struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// In-process key-value store with lazy expiry.
///
/// Expired entries are dropped on access; `list` never returns them.
#[derive(Default)]
pub struct MemoryKv {
    entries: DashMap<String, Entry>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self { entries: DashMap::new() }
    }

    /// Number of live (non-expired) entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.expires_at > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > Instant::now() {
                return Ok(Some(entry.value.clone()));
            }
        } else {
            return Ok(None);
        }
        // Expired: drop it so the map does not grow without bound.
        self.entries.remove(key);
        Ok(None)
    }

    fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), KvError> {
        self.entries.insert(
            key.to_owned(),
            Entry { value, expires_at: Instant::now() + ttl },
        );
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), KvError> {
        self.entries.remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        let now = Instant::now();
        Ok(self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix) && e.expires_at > now)
            .map(|e| e.key().clone())
            .collect())
    }

    fn name(&self) -> &str {
        "in-memory"
    }
}
