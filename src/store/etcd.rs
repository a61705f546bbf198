//! Transactional lease store over etcd.
//!
//! Acquisition is a single compare-and-swap transaction: if the key's version
//! is 0 it is put with a fresh server-side lease, otherwise the transaction
//! reads the current value. Renewal refreshes the lease bound to the key and
//! never rewrites the key.
//!
//! TTLs are whole seconds, rounded up. A keep-alive restores the TTL the lease
//! was granted with, so a renewal with a different TTL keeps the old one until
//! the lease is re-created.

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, GetResponse, PutOptions, Txn, TxnOp, TxnOpResponse,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

use super::{store_key, LeaseStore};
use crate::error::StoreError;

pub struct EtcdLeaseStore {
    endpoint: String,
    prefix: Option<String>,
    timeout: Duration,
    client: tokio::sync::Mutex<Option<Client>>,
    /// Lease ids this process granted or renewed, keyed by `holder@key`.
    leases: Mutex<HashMap<String, i64>>,
}

impl fmt::Debug for EtcdLeaseStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EtcdLeaseStore")
            .field("endpoint", &self.endpoint)
            .field("prefix", &self.prefix)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// etcd lease TTL: whole seconds rounded up, at least one.
pub fn ttl_secs(ttl: Duration) -> i64 {
    let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
    let secs = millis.saturating_add(999) / 1000;
    i64::try_from(secs).unwrap_or(i64::MAX).max(1)
}

fn lease_key(key: &str, holder: &str) -> String {
    format!("{}@{}", holder, key)
}

fn first_kv(get: &GetResponse) -> Result<Option<(String, i64)>, StoreError> {
    match get.kvs().first() {
        Some(kv) => {
            let value = kv
                .value_str()
                .map_err(|e| StoreError::Protocol(format!("holder is not utf-8: {}", e)))?;
            Ok(Some((value.to_string(), kv.lease())))
        }
        None => Ok(None),
    }
}

fn get_response(responses: Vec<TxnOpResponse>) -> Option<GetResponse> {
    responses.into_iter().find_map(|op| match op {
        TxnOpResponse::Get(get) => Some(get),
        _ => None,
    })
}

impl EtcdLeaseStore {
    pub fn new(endpoint: impl Into<String>, prefix: Option<&str>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            prefix: prefix.map(String::from),
            timeout,
            client: tokio::sync::Mutex::new(None),
            leases: Mutex::new(HashMap::new()),
        }
    }

    async fn client(&self) -> Result<Client, StoreError> {
        let mut guard = self.client.lock().await;
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }
        debug!("Connecting to etcd store {}", self.endpoint);
        let options = ConnectOptions::new()
            .with_connect_timeout(self.timeout)
            .with_timeout(self.timeout);
        let client = Client::connect([self.endpoint.as_str()], Some(options)).await?;
        *guard = Some(client.clone());
        Ok(client)
    }

    async fn reset(&self, err: &StoreError) {
        if matches!(err, StoreError::Unavailable(_)) {
            warn!("etcd store {} failed, dropping client: {}", self.endpoint, err);
            *self.client.lock().await = None;
        }
    }

    fn key(&self, resource: &str) -> String {
        store_key(self.prefix.as_deref(), resource)
    }

    fn remember(&self, key: &str, holder: &str, lease_id: i64) {
        self.leases.lock().insert(lease_key(key, holder), lease_id);
    }

    fn forget(&self, key: &str, holder: &str) -> Option<i64> {
        self.leases.lock().remove(&lease_key(key, holder))
    }

    /// Send one keep-alive and return the TTL etcd reports; 0 means the
    /// lease is gone.
    async fn keep_alive(client: &mut Client, lease_id: i64) -> Result<i64, StoreError> {
        let (mut keeper, mut stream) = client.lease_keep_alive(lease_id).await?;
        keeper.keep_alive().await?;
        match stream.message().await? {
            Some(resp) => Ok(resp.ttl()),
            None => Err(StoreError::Protocol("etcd keepalive stream closed".to_string())),
        }
    }

    /// Whether `key` still holds `candidate` under `lease_id`.
    async fn bound_to(client: &mut Client, key: &str, candidate: &str, lease_id: i64) -> Result<bool, StoreError> {
        let txn = Txn::new().when(vec![
            Compare::value(key, CompareOp::Equal, candidate),
            Compare::lease(key, CompareOp::Equal, lease_id),
        ]);
        Ok(client.txn(txn).await?.succeeded())
    }

    async fn try_acquire(&self, resource: &str, candidate: &str, ttl: Duration) -> Result<String, StoreError> {
        let key = self.key(resource);
        let mut client = self.client().await?;

        let lease_id = client.lease_grant(ttl_secs(ttl), None).await?.id();
        let txn = Txn::new()
            .when(vec![Compare::version(key.as_str(), CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(
                key.as_str(),
                candidate,
                Some(PutOptions::new().with_lease(lease_id)),
            )])
            .or_else(vec![TxnOp::get(key.as_str(), None)]);

        let resp = match client.txn(txn).await {
            Ok(resp) => resp,
            Err(e) => {
                if let Err(revoke) = client.lease_revoke(lease_id).await {
                    debug!("Failed to revoke unused lease {}: {}", lease_id, revoke);
                }
                return Err(e.into());
            }
        };

        if resp.succeeded() {
            debug!(resource, candidate, lease_id, "etcd key created");
            self.remember(&key, candidate, lease_id);
            return Ok(candidate.to_string());
        }

        // the fresh lease is not bound to anything
        if let Err(e) = client.lease_revoke(lease_id).await {
            debug!("Failed to revoke unused lease {}: {}", lease_id, e);
        }

        let get = get_response(resp.op_responses())
            .ok_or_else(|| StoreError::Protocol("transaction returned no read".to_string()))?;
        let (holder, holder_lease) = first_kv(&get)?
            .ok_or_else(|| StoreError::Protocol(format!("{} vanished inside transaction", key)))?;

        if holder == candidate {
            let remaining = Self::keep_alive(&mut client, holder_lease).await?;
            if remaining <= 0 {
                self.forget(&key, candidate);
                return Err(StoreError::Protocol(format!("lease of {} expired during renewal", key)));
            }
            self.remember(&key, candidate, holder_lease);
        }
        Ok(holder)
    }

    async fn try_renew(&self, resource: &str, candidate: &str, ttl: Duration) -> Result<String, StoreError> {
        let key = self.key(resource);
        let lease_id = self.leases.lock().get(&lease_key(&key, candidate)).copied();
        if let Some(lease_id) = lease_id {
            let mut client = self.client().await?;
            if !Self::bound_to(&mut client, &key, candidate, lease_id).await? {
                debug!(resource, candidate, lease_id, "key no longer bound to remembered lease");
            } else if Self::keep_alive(&mut client, lease_id).await? > 0 {
                debug!(resource, candidate, lease_id, "etcd lease refreshed");
                return Ok(candidate.to_string());
            } else {
                debug!(resource, candidate, "remembered lease expired, re-acquiring");
            }
            self.forget(&key, candidate);
        }
        self.try_acquire(resource, candidate, ttl).await
    }

    async fn try_read(&self, resource: &str) -> Result<Option<String>, StoreError> {
        let mut client = self.client().await?;
        let get = client.get(self.key(resource), None).await?;
        Ok(first_kv(&get)?.map(|(holder, _)| holder))
    }

    async fn try_release(&self, resource: &str, candidate: &str) -> Result<bool, StoreError> {
        let key = self.key(resource);
        let mut client = self.client().await?;
        let txn = Txn::new()
            .when(vec![Compare::value(key.as_str(), CompareOp::Equal, candidate)])
            .and_then(vec![TxnOp::get(key.as_str(), None), TxnOp::delete(key.as_str(), None)]);

        let resp = client.txn(txn).await?;
        if !resp.succeeded() {
            return Ok(false);
        }

        self.forget(&key, candidate);
        let lease_id = get_response(resp.op_responses())
            .and_then(|get| first_kv(&get).ok().flatten())
            .map(|(_, lease)| lease)
            .filter(|lease| *lease != 0);
        if let Some(lease_id) = lease_id {
            if let Err(e) = client.lease_revoke(lease_id).await {
                debug!("Failed to revoke lease {} of {}: {}", lease_id, key, e);
            }
        }
        Ok(true)
    }

    async fn track<T>(&self, result: Result<T, StoreError>) -> Result<T, StoreError> {
        if let Err(e) = &result {
            self.reset(e).await;
        }
        result
    }
}

#[async_trait]
impl LeaseStore for EtcdLeaseStore {
    fn name(&self) -> &str {
        &self.endpoint
    }

    async fn acquire_or_renew(
        &self,
        resource: &str,
        candidate: &str,
        ttl: Duration,
    ) -> Result<String, StoreError> {
        let result = self.try_acquire(resource, candidate, ttl).await;
        self.track(result).await
    }

    async fn renew(&self, resource: &str, candidate: &str, ttl: Duration) -> Result<String, StoreError> {
        let result = self.try_renew(resource, candidate, ttl).await;
        self.track(result).await
    }

    async fn read(&self, resource: &str) -> Result<Option<String>, StoreError> {
        let result = self.try_read(resource).await;
        self.track(result).await
    }

    async fn release_if_held(&self, resource: &str, candidate: &str) -> Result<bool, StoreError> {
        let result = self.try_release(resource, candidate).await;
        self.track(result).await
    }
}
