//! Scripted lease store over Redis.
//!
//! Acquire-or-renew and release each run as one Lua script on the server, so
//! there is no read-then-write window between competing clients. TTLs are
//! sent in milliseconds (`PX` / `PEXPIRE`).

use ::redis::aio::MultiplexedConnection;
use ::redis::{Client, Script};
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{store_key, LeaseStore};
use crate::error::{ElectionError, StoreError};

const ACQUIRE_OR_RENEW_SCRIPT: &str = r#"
local ret = redis.call("set", KEYS[1], ARGV[1], "NX", "PX", ARGV[2])
if type(ret) == "table" and ret["ok"] == "OK" then
    return ARGV[1]
end
local holder = redis.call("get", KEYS[1])
if holder == ARGV[1] then
    redis.call("pexpire", KEYS[1], ARGV[2])
end
return holder
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    redis.call("del", KEYS[1])
    return 1
end
return 0
"#;

pub struct RedisLeaseStore {
    name: String,
    client: Client,
    prefix: Option<String>,
    connection: Mutex<Option<MultiplexedConnection>>,
    acquire: Script,
    release: Script,
}

impl fmt::Debug for RedisLeaseStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisLeaseStore")
            .field("name", &self.name)
            .field("prefix", &self.prefix)
            .finish()
    }
}

/// Redis TTL argument: whole milliseconds, at least one.
pub fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

impl RedisLeaseStore {
    /// Parse `url` without connecting; the connection is made on first use.
    pub fn open(url: &str, prefix: Option<&str>) -> Result<Self, ElectionError> {
        let client = Client::open(url)
            .map_err(|e| ElectionError::config(format!("invalid redis url '{}': {}", url, e)))?;
        Ok(Self {
            name: url.to_string(),
            client,
            prefix: prefix.map(String::from),
            connection: Mutex::new(None),
            acquire: Script::new(ACQUIRE_OR_RENEW_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        let mut guard = self.connection.lock().await;
        if let Some(con) = guard.as_ref() {
            return Ok(con.clone());
        }
        debug!("Connecting to redis store {}", self.name);
        let con = self.client.get_multiplexed_async_connection().await?;
        *guard = Some(con.clone());
        Ok(con)
    }

    /// Drop the cached connection so the next call reconnects.
    async fn reset(&self, err: &StoreError) {
        if matches!(err, StoreError::Unavailable(_)) {
            warn!("Redis store {} failed, dropping connection: {}", self.name, err);
            *self.connection.lock().await = None;
        }
    }

    fn key(&self, resource: &str) -> String {
        store_key(self.prefix.as_deref(), resource)
    }
}

#[async_trait]
impl LeaseStore for RedisLeaseStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn acquire_or_renew(
        &self,
        resource: &str,
        candidate: &str,
        ttl: Duration,
    ) -> Result<String, StoreError> {
        let mut con = self.connection().await?;
        let result: Result<Option<String>, StoreError> = self
            .acquire
            .key(self.key(resource))
            .arg(candidate)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut con)
            .await
            .map_err(StoreError::from);

        match result {
            Ok(Some(holder)) => Ok(holder),
            Ok(None) => Err(StoreError::Protocol(format!(
                "acquire script returned no holder for {}",
                resource
            ))),
            Err(e) => {
                self.reset(&e).await;
                Err(e)
            }
        }
    }

    async fn read(&self, resource: &str) -> Result<Option<String>, StoreError> {
        let mut con = self.connection().await?;
        let result: Result<Option<String>, StoreError> = ::redis::cmd("GET")
            .arg(self.key(resource))
            .query_async(&mut con)
            .await
            .map_err(StoreError::from);
        if let Err(e) = &result {
            self.reset(e).await;
        }
        result
    }

    async fn release_if_held(&self, resource: &str, candidate: &str) -> Result<bool, StoreError> {
        let mut con = self.connection().await?;
        let result: Result<i64, StoreError> = self
            .release
            .key(self.key(resource))
            .arg(candidate)
            .invoke_async(&mut con)
            .await
            .map_err(StoreError::from);
        match result {
            Ok(deleted) => Ok(deleted == 1),
            Err(e) => {
                self.reset(&e).await;
                Err(e)
            }
        }
    }
}
