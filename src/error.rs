use std::io;
use std::time::Duration;
use thiserror::Error;

/// Failure of a single lease store during one round.
///
/// Never crosses the facade: the elector records it as an abstention.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store did not answer within {0:?}")]
    Timeout(Duration),

    #[error("unexpected store reply: {0}")]
    Protocol(String),
}

#[derive(Debug, Error, Clone)]
pub enum ElectionError {
    /// Fewer than a majority of the configured stores agreed.
    #[error("no quorum for {resource}: {responded}/{configured} stores answered, best candidate had {best} votes")]
    NoQuorum {
        resource: String,
        configured: usize,
        responded: usize,
        best: usize,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("YAML error: {0}")]
    Yaml(String),

    #[error("JSON error: {0}")]
    Json(String),
}

pub type Result<T> = std::result::Result<T, ElectionError>;

impl ElectionError {
    pub fn config(msg: impl Into<String>) -> Self {
        ElectionError::Config(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        ElectionError::Store(msg.into())
    }

    /// Whether the caller should back off and run the whole round again.
    pub fn is_retriable(&self) -> bool {
        matches!(self, ElectionError::NoQuorum { .. })
    }
}

impl From<StoreError> for ElectionError {
    fn from(e: StoreError) -> Self {
        ElectionError::Store(e.to_string())
    }
}

impl From<io::Error> for ElectionError {
    fn from(e: io::Error) -> Self {
        ElectionError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for ElectionError {
    fn from(e: serde_json::Error) -> Self {
        ElectionError::Json(e.to_string())
    }
}

impl From<serde_yaml::Error> for ElectionError {
    fn from(e: serde_yaml::Error) -> Self {
        ElectionError::Yaml(e.to_string())
    }
}

#[cfg(feature = "redis-store")]
impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_timeout() {
            StoreError::Unavailable(format!("redis timeout: {}", e))
        } else if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
            StoreError::Unavailable(e.to_string())
        } else {
            StoreError::Protocol(e.to_string())
        }
    }
}

#[cfg(feature = "etcd-store")]
impl From<etcd_client::Error> for StoreError {
    fn from(e: etcd_client::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}
