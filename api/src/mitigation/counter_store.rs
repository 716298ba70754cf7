use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

#[derive(Debug, thiserror::Error)]
pub enum CounterStoreError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
}

/// Time-windowed counters with atomic increment and absolute expiry.
///
/// Implementations must make `increment` atomic per key without serialising
/// unrelated keys. Reads may lag concurrent writers.
pub trait CounterStore: Send + Sync {
    /// Increment `key` and return the new value. A missing or expired counter
    /// starts again at 1 with expiry `now + ttl`; the expiry of a live counter
    /// is never extended.
    fn increment(
        &self,
        key: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<u64, CounterStoreError>;

    /// Current value, or `None` when absent or expired.
    fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<u64>, CounterStoreError>;

    /// Drop expired counters. Returns how many were removed.
    fn sweep(&self, now: DateTime<Utc>) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy)]
struct CounterEntry {
    count: u64,
    expires_at: DateTime<Utc>,
}

impl CounterEntry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Process-local store backed by a sharded concurrent map.
#[derive(Debug, Default)]
pub struct InMemoryCounterStore {
    counters: DashMap<String, CounterEntry>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CounterStore for InMemoryCounterStore {
    fn increment(
        &self,
        key: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<u64, CounterStoreError> {
        // The entry guard holds the shard lock, so read-modify-write is atomic.
        let mut entry = self
            .counters
            .entry(key.to_string())
            .or_insert(CounterEntry {
                count: 0,
                expires_at: now + ttl,
            });
        if !entry.is_live(now) {
            entry.count = 0;
            entry.expires_at = now + ttl;
        }
        entry.count = entry.count.saturating_add(1);
        Ok(entry.count)
    }

    fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<u64>, CounterStoreError> {
        let live = self
            .counters
            .get(key)
            .map(|entry| entry.is_live(now).then_some(entry.count));
        match live {
            Some(Some(count)) => Ok(Some(count)),
            Some(None) => {
                self.counters.remove_if(key, |_, entry| !entry.is_live(now));
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn sweep(&self, now: DateTime<Utc>) -> usize {
        let before = self.counters.len();
        self.counters.retain(|_, entry| entry.is_live(now));
        before.saturating_sub(self.counters.len())
    }

    fn len(&self) -> usize {
        self.counters.len()
    }
}
