use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

use super::{store_key, LeaseStore};
use crate::error::StoreError;

#[derive(Debug, Clone)]
struct LeaseEntry {
    holder: String,
    expires_at: Instant,
}

/// In-process lease store.
///
/// Every operation runs under one lock, which gives it the same
/// indivisibility a server-side script has. Expiry follows the tokio clock so
/// tests can drive it with `tokio::time::pause`.
#[derive(Debug)]
pub struct MemoryLeaseStore {
    name: String,
    prefix: Option<String>,
    leases: Mutex<HashMap<String, LeaseEntry>>,
    available: AtomicBool,
    latency_ms: AtomicU64,
}

impl MemoryLeaseStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prefix: None,
            leases: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
        }
    }

    pub fn with_prefix(mut self, prefix: Option<&str>) -> Self {
        self.prefix = prefix.map(String::from);
        self
    }

    /// Make the store refuse every call until set back.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Delay every answer, used to push a store past the round timeout.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Force a holder regardless of the current state.
    pub fn seed(&self, resource: &str, holder: &str, ttl: Duration) {
        let key = store_key(self.prefix.as_deref(), resource);
        self.leases.lock().insert(
            key,
            LeaseEntry {
                holder: holder.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Current holder without going through the availability checks.
    pub fn holder(&self, resource: &str) -> Option<String> {
        let key = store_key(self.prefix.as_deref(), resource);
        let now = Instant::now();
        self.leases
            .lock()
            .get(&key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.holder.clone())
    }

    async fn enter(&self) -> Result<(), StoreError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!("{} is down", self.name)));
        }
        Ok(())
    }

    fn key(&self, resource: &str) -> String {
        store_key(self.prefix.as_deref(), resource)
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn acquire_or_renew(
        &self,
        resource: &str,
        candidate: &str,
        ttl: Duration,
    ) -> Result<String, StoreError> {
        self.enter().await?;
        let key = self.key(resource);
        let now = Instant::now();

        let mut leases = self.leases.lock();
        let entry = leases
            .entry(key)
            .and_modify(|entry| {
                if entry.expires_at <= now {
                    entry.holder = candidate.to_string();
                    entry.expires_at = now + ttl;
                } else if entry.holder == candidate {
                    entry.expires_at = now + ttl;
                }
            })
            .or_insert_with(|| LeaseEntry {
                holder: candidate.to_string(),
                expires_at: now + ttl,
            });
        trace!(store = %self.name, resource, holder = %entry.holder, "acquire_or_renew");
        Ok(entry.holder.clone())
    }

    async fn read(&self, resource: &str) -> Result<Option<String>, StoreError> {
        self.enter().await?;
        let key = self.key(resource);
        let now = Instant::now();

        let mut leases = self.leases.lock();
        match leases.get(&key) {
            Some(entry) if entry.expires_at > now => Ok(Some(entry.holder.clone())),
            Some(_) => {
                leases.remove(&key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn release_if_held(&self, resource: &str, candidate: &str) -> Result<bool, StoreError> {
        self.enter().await?;
        let key = self.key(resource);
        let now = Instant::now();

        let mut leases = self.leases.lock();
        let held = leases
            .get(&key)
            .map(|entry| entry.expires_at > now && entry.holder == candidate)
            .unwrap_or(false);
        if held {
            leases.remove(&key);
        }
        Ok(held)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn test_acquire_renew_and_contend() {
        let store = MemoryLeaseStore::new("a");

        assert_eq!(store.acquire_or_renew("svc", "A", TTL).await.unwrap(), "A");
        assert_eq!(store.acquire_or_renew("svc", "A", TTL).await.unwrap(), "A");
        assert_eq!(store.acquire_or_renew("svc", "B", TTL).await.unwrap(), "A");
        assert_eq!(store.read("svc").await.unwrap(), Some("A".to_string()));
        assert_eq!(store.read("other").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_frees_the_key() {
        let store = MemoryLeaseStore::new("a");
        store.acquire_or_renew("svc", "A", TTL).await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        // renewal resets the clock
        store.acquire_or_renew("svc", "A", TTL).await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(store.read("svc").await.unwrap(), Some("A".to_string()));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(store.read("svc").await.unwrap(), None);
        assert_eq!(store.acquire_or_renew("svc", "B", TTL).await.unwrap(), "B");
    }

    #[tokio::test]
    async fn test_release_only_by_holder() {
        let store = MemoryLeaseStore::new("a");
        store.seed("svc", "X", TTL);

        assert!(!store.release_if_held("svc", "Y").await.unwrap());
        assert_eq!(store.holder("svc"), Some("X".to_string()));

        assert!(store.release_if_held("svc", "X").await.unwrap());
        assert_eq!(store.holder("svc"), None);
        assert!(!store.release_if_held("svc", "X").await.unwrap());
    }

    #[tokio::test]
    async fn test_unavailable_is_an_error_not_vacancy() {
        let store = MemoryLeaseStore::new("a");
        store.set_available(false);

        assert!(matches!(store.read("svc").await, Err(StoreError::Unavailable(_))));
        assert!(store.acquire_or_renew("svc", "A", TTL).await.is_err());

        store.set_available(true);
        assert_eq!(store.read("svc").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_prefix_isolates_keys() {
        let store = MemoryLeaseStore::new("a").with_prefix(Some("/leader-election"));
        store.acquire_or_renew("svc", "A", TTL).await.unwrap();
        assert_eq!(store.holder("svc"), Some("A".to_string()));
        assert!(store.leases.lock().contains_key("/leader-election/svc"));
    }
}
