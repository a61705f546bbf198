//! Lease Store Backends
//!
//! One `LeaseStore` per independent backend. Each store provides:
//! - atomic acquire-or-renew of a key
//! - read of the current holder
//! - release conditioned on the current holder
//!
//! Stores answer for themselves only; quorum is decided by the elector.

pub mod memory;
#[cfg(feature = "redis-store")]
pub mod redis;
#[cfg(feature = "etcd-store")]
pub mod etcd;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use crate::error::{ElectionError, StoreError};

pub use memory::MemoryLeaseStore;

/// Uniform interface over one lease backend.
///
/// An unreachable backend must surface as `Err`, never as a vacant key.
#[async_trait]
pub trait LeaseStore: Send + Sync + fmt::Debug {
    /// Name used in logs and per-store error reports.
    fn name(&self) -> &str;

    /// Atomically set `resource` to `candidate` if absent, extend it if
    /// `candidate` already holds it, otherwise leave it. Returns the holder.
    async fn acquire_or_renew(
        &self,
        resource: &str,
        candidate: &str,
        ttl: Duration,
    ) -> Result<String, StoreError>;

    /// Extend a lease this process believes `candidate` holds.
    ///
    /// Backends with a cheaper renewal path override this.
    async fn renew(
        &self,
        resource: &str,
        candidate: &str,
        ttl: Duration,
    ) -> Result<String, StoreError> {
        self.acquire_or_renew(resource, candidate, ttl).await
    }

    async fn read(&self, resource: &str) -> Result<Option<String>, StoreError>;

    /// Delete `resource` only if `candidate` holds it.
    async fn release_if_held(&self, resource: &str, candidate: &str) -> Result<bool, StoreError>;
}

/// The operation one round dispatches to every store.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    AcquireOrRenew {
        resource: String,
        candidate: String,
        ttl: Duration,
    },
    Renew {
        resource: String,
        candidate: String,
        ttl: Duration,
    },
    Read {
        resource: String,
    },
    ReleaseIfHeld {
        resource: String,
        candidate: String,
    },
}

/// What one store said in reply to a `StoreOp`.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreAnswer {
    /// Current holder, `None` when the key is vacant.
    Holder(Option<String>),
    Released(bool),
}

impl StoreOp {
    pub fn resource(&self) -> &str {
        match self {
            StoreOp::AcquireOrRenew { resource, .. }
            | StoreOp::Renew { resource, .. }
            | StoreOp::Read { resource }
            | StoreOp::ReleaseIfHeld { resource, .. } => resource,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StoreOp::AcquireOrRenew { .. } => "acquire",
            StoreOp::Renew { .. } => "renew",
            StoreOp::Read { .. } => "read",
            StoreOp::ReleaseIfHeld { .. } => "release",
        }
    }

    pub async fn apply(&self, store: &dyn LeaseStore) -> Result<StoreAnswer, StoreError> {
        match self {
            StoreOp::AcquireOrRenew { resource, candidate, ttl } => store
                .acquire_or_renew(resource, candidate, *ttl)
                .await
                .map(|holder| StoreAnswer::Holder(Some(holder))),
            StoreOp::Renew { resource, candidate, ttl } => store
                .renew(resource, candidate, *ttl)
                .await
                .map(|holder| StoreAnswer::Holder(Some(holder))),
            StoreOp::Read { resource } => store.read(resource).await.map(StoreAnswer::Holder),
            StoreOp::ReleaseIfHeld { resource, candidate } => store
                .release_if_held(resource, candidate)
                .await
                .map(StoreAnswer::Released),
        }
    }
}

/// Key under which `resource` lives in a store.
pub fn store_key(prefix: Option<&str>, resource: &str) -> String {
    match prefix {
        Some(prefix) if !prefix.is_empty() => format!("{}/{}", prefix.trim_end_matches('/'), resource),
        _ => resource.to_string(),
    }
}

/// A parsed store endpoint from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEndpoint {
    Redis(String),
    Etcd(String),
    Memory(String),
}

impl StoreEndpoint {
    pub fn parse(endpoint: &str) -> Result<Self, ElectionError> {
        let endpoint = endpoint.trim();
        let (scheme, rest) = endpoint
            .split_once("://")
            .ok_or_else(|| ElectionError::config(format!("store endpoint '{}' has no scheme", endpoint)))?;
        if rest.is_empty() {
            return Err(ElectionError::config(format!("store endpoint '{}' has no address", endpoint)));
        }
        match scheme {
            "redis" | "rediss" => Ok(StoreEndpoint::Redis(endpoint.to_string())),
            "etcd" => Ok(StoreEndpoint::Etcd(format!("http://{}", rest))),
            "etcd+https" => Ok(StoreEndpoint::Etcd(format!("https://{}", rest))),
            "memory" => Ok(StoreEndpoint::Memory(rest.to_string())),
            other => Err(ElectionError::config(format!("unsupported store scheme '{}'", other))),
        }
    }
}

/// Build a store handle for every endpoint. Connections are established
/// lazily, so an unreachable backend only shows up as an abstention.
pub fn connect_all(
    endpoints: &[String],
    key_prefix: Option<&str>,
    timeout: Duration,
) -> Result<Vec<Arc<dyn LeaseStore>>, ElectionError> {
    endpoints
        .iter()
        .map(|endpoint| connect(endpoint, key_prefix, timeout))
        .collect()
}

pub fn connect(
    endpoint: &str,
    key_prefix: Option<&str>,
    timeout: Duration,
) -> Result<Arc<dyn LeaseStore>, ElectionError> {
    #[cfg(not(feature = "etcd-store"))]
    let _ = timeout;

    match StoreEndpoint::parse(endpoint)? {
        StoreEndpoint::Memory(name) => Ok(Arc::new(MemoryLeaseStore::new(name).with_prefix(key_prefix))),
        #[cfg(feature = "redis-store")]
        StoreEndpoint::Redis(url) => Ok(Arc::new(redis::RedisLeaseStore::open(&url, key_prefix)?)),
        #[cfg(feature = "etcd-store")]
        StoreEndpoint::Etcd(url) => Ok(Arc::new(etcd::EtcdLeaseStore::new(url, key_prefix, timeout))),
        #[allow(unreachable_patterns)]
        other => Err(ElectionError::config(format!(
            "store {:?} requires a backend feature that is not enabled",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoints() {
        assert_eq!(
            StoreEndpoint::parse("redis://10.0.0.1:6379/0").unwrap(),
            StoreEndpoint::Redis("redis://10.0.0.1:6379/0".to_string())
        );
        assert_eq!(
            StoreEndpoint::parse("etcd://127.0.0.1:2379").unwrap(),
            StoreEndpoint::Etcd("http://127.0.0.1:2379".to_string())
        );
        assert_eq!(
            StoreEndpoint::parse("etcd+https://etcd.local:2379").unwrap(),
            StoreEndpoint::Etcd("https://etcd.local:2379".to_string())
        );
        assert_eq!(
            StoreEndpoint::parse(" memory://a ").unwrap(),
            StoreEndpoint::Memory("a".to_string())
        );
        assert!(StoreEndpoint::parse("10.0.0.1:6379").is_err());
        assert!(StoreEndpoint::parse("zookeeper://zk:2181").is_err());
        assert!(StoreEndpoint::parse("memory://").is_err());
    }

    #[test]
    fn test_store_key() {
        assert_eq!(store_key(None, "svc"), "svc");
        assert_eq!(store_key(Some(""), "svc"), "svc");
        assert_eq!(store_key(Some("/leader-election/"), "svc"), "/leader-election/svc");
    }

    #[tokio::test]
    async fn test_op_dispatch() {
        let store = MemoryLeaseStore::new("a");
        let acquire = StoreOp::AcquireOrRenew {
            resource: "svc".to_string(),
            candidate: "A".to_string(),
            ttl: Duration::from_secs(10),
        };
        assert_eq!(acquire.kind(), "acquire");
        assert_eq!(acquire.resource(), "svc");
        assert_eq!(
            acquire.apply(&store).await.unwrap(),
            StoreAnswer::Holder(Some("A".to_string()))
        );

        let release = StoreOp::ReleaseIfHeld {
            resource: "svc".to_string(),
            candidate: "B".to_string(),
        };
        assert_eq!(release.apply(&store).await.unwrap(), StoreAnswer::Released(false));

        let read = StoreOp::Read { resource: "svc".to_string() };
        assert_eq!(
            read.apply(&store).await.unwrap(),
            StoreAnswer::Holder(Some("A".to_string()))
        );
    }
}
