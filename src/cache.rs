//! Local memory of who leads which resource.
//!
//! Entries are only written from quorum-confirmed rounds and are dropped as
//! soon as their local expiry passes, so a stale belief never outlives the
//! lease it was derived from.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub holder: String,
    pub expires_at: Instant,
}

/// Safety margin subtracted from a lease before trusting it locally.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockDrift {
    pub factor: f64,
    pub floor: Duration,
}

impl Default for ClockDrift {
    fn default() -> Self {
        Self {
            factor: 0.01,
            floor: Duration::from_millis(2),
        }
    }
}

impl ClockDrift {
    /// How long a lease of `ttl` granted by a round that took `elapsed` can
    /// be trusted locally. `None` when nothing is left.
    pub fn validity(&self, ttl: Duration, elapsed: Duration) -> Option<Duration> {
        let drift = ttl.mul_f64(self.factor) + self.floor;
        ttl.checked_sub(elapsed)
            .and_then(|left| left.checked_sub(drift))
            .filter(|left| !left.is_zero())
    }
}

#[derive(Debug, Default)]
pub struct LeaseCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl LeaseCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unexpired entry for `resource`. Expired entries are pruned on the way.
    pub fn get(&self, resource: &str) -> Option<CacheEntry> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, entry| entry.expires_at > now);
        entries.get(resource).cloned()
    }

    pub fn holder(&self, resource: &str) -> Option<String> {
        self.get(resource).map(|entry| entry.holder)
    }

    /// Whether `candidate` is believed to hold `resource` right now.
    pub fn holds(&self, resource: &str, candidate: &str) -> bool {
        self.get(resource)
            .map(|entry| entry.holder == candidate)
            .unwrap_or(false)
    }

    pub fn insert(&self, resource: &str, holder: &str, valid_for: Duration) {
        self.insert_until(resource, holder, Instant::now() + valid_for);
    }

    pub fn insert_until(&self, resource: &str, holder: &str, expires_at: Instant) {
        self.entries.lock().insert(
            resource.to_string(),
            CacheEntry {
                holder: holder.to_string(),
                expires_at,
            },
        );
    }

    pub fn remove(&self, resource: &str) -> Option<CacheEntry> {
        self.entries.lock().remove(resource)
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|entry| entry.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
