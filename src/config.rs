use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};
use tracing::debug;
use crate::error::ElectionError;

pub const ENV_STORES: &str = "NEXA_ELECTION_STORES";
pub const ENV_TTL_MS: &str = "NEXA_ELECTION_TTL_MS";
pub const ENV_ID: &str = "NEXA_ELECTION_ID";

/// Longest lease any store is asked for: one week.
pub const MAX_TTL_MS: u64 = 7 * 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionConfig {
    /// Store endpoints, one `LeaseStore` each.
    #[serde(default)]
    pub stores: Vec<String>,
    /// Default lease TTL in milliseconds.
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,
    #[serde(default)]
    pub candidate_id: Option<String>,
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
    #[serde(default = "default_clock_drift_factor")]
    pub clock_drift_factor: f64,
    #[serde(default = "default_clock_drift_floor_ms")]
    pub clock_drift_floor_ms: u64,
    #[serde(default = "default_read_cache_ms")]
    pub read_cache_ms: u64,
    #[serde(default)]
    pub key_prefix: Option<String>,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Directory for rotated JSON logs; console only when absent.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            stores: Vec::new(),
            ttl_ms: default_ttl_ms(),
            candidate_id: None,
            store_timeout_ms: default_store_timeout_ms(),
            clock_drift_factor: default_clock_drift_factor(),
            clock_drift_floor_ms: default_clock_drift_floor_ms(),
            read_cache_ms: default_read_cache_ms(),
            key_prefix: None,
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            directory: None,
            max_files: default_max_log_files(),
        }
    }
}

fn default_ttl_ms() -> u64 {
    10_000
}

fn default_store_timeout_ms() -> u64 {
    2_000
}

fn default_clock_drift_factor() -> f64 {
    0.01
}

fn default_clock_drift_floor_ms() -> u64 {
    2
}

fn default_read_cache_ms() -> u64 {
    1_000
}

fn default_bind_addr() -> String {
    "127.0.0.1:5000".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    7
}

impl ElectionConfig {
    /// Load from `path`, or from the first well-known location that exists,
    /// then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ElectionError> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => {
                let candidates = [
                    PathBuf::from("election.yml"),
                    dirs::config_dir()
                        .map(|p| p.join("nexa/election.yml"))
                        .unwrap_or_default(),
                    PathBuf::from("/etc/nexa/election.yml"),
                ];
                match candidates.iter().find(|p| p.is_file()) {
                    Some(found) => Self::load_from_file(found)?,
                    None => Self::default(),
                }
            }
        };
        config.apply_env(|key| env::var(key).ok())?;
        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ElectionError> {
        debug!("Loading election config from {}", path.display());
        let content = fs::read_to_string(path)
            .map_err(|e| ElectionError::Config(format!("Failed to read config file {}: {}", path.display(), e)))?;

        serde_yaml::from_str(&content)
            .map_err(|e| ElectionError::Config(format!("Failed to parse config file {}: {}", path.display(), e)))
    }

    /// Overlay values from the environment. `lookup` is injected so tests do
    /// not have to mutate the process environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ElectionError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(stores) = lookup(ENV_STORES) {
            self.stores = stores
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(ttl) = lookup(ENV_TTL_MS) {
            self.ttl_ms = ttl
                .trim()
                .parse()
                .map_err(|e| ElectionError::Config(format!("{} must be an integer: {}", ENV_TTL_MS, e)))?;
        }
        if let Some(id) = lookup(ENV_ID) {
            if !id.trim().is_empty() {
                self.candidate_id = Some(id.trim().to_string());
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ElectionError> {
        if self.stores.is_empty() {
            return Err(ElectionError::config("at least one lease store must be configured"));
        }
        self.validate_timing()
    }

    /// Everything except the store list, for callers that bring their own stores.
    pub fn validate_timing(&self) -> Result<(), ElectionError> {
        if self.ttl_ms == 0 {
            return Err(ElectionError::config("ttl_ms must be greater than zero"));
        }
        if self.ttl_ms > MAX_TTL_MS {
            return Err(ElectionError::config(format!("ttl_ms must not exceed {}", MAX_TTL_MS)));
        }
        if self.store_timeout_ms == 0 {
            return Err(ElectionError::config("store_timeout_ms must be greater than zero"));
        }
        if !(0.0..1.0).contains(&self.clock_drift_factor) {
            return Err(ElectionError::config("clock_drift_factor must be in [0, 1)"));
        }
        if matches!(&self.candidate_id, Some(id) if id.is_empty()) {
            return Err(ElectionError::config("candidate_id must not be empty"));
        }
        Ok(())
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn read_cache(&self) -> Duration {
        Duration::from_millis(self.read_cache_ms)
    }

    pub fn clock_drift_floor(&self) -> Duration {
        Duration::from_millis(self.clock_drift_floor_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults_from_empty_yaml() {
        let config: ElectionConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.ttl_ms, 10_000);
        assert_eq!(config.store_timeout_ms, 2_000);
        assert_eq!(config.server.bind_addr, "127.0.0.1:5000");
        assert!(config.stores.is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "stores:\n  - redis://10.0.0.1:6379/0\n  - memory://b\nttl_ms: 3000\nkey_prefix: /leader-election\n"
        )
        .unwrap();

        let config = ElectionConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.stores.len(), 2);
        assert_eq!(config.ttl(), Duration::from_secs(3));
        assert_eq!(config.key_prefix.as_deref(), Some("/leader-election"));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            (ENV_STORES, "memory://a, memory://b,,memory://c"),
            (ENV_TTL_MS, "2500"),
            (ENV_ID, "node-1"),
        ]
        .into_iter()
        .collect();

        let mut config = ElectionConfig::default();
        config.apply_env(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.stores, vec!["memory://a", "memory://b", "memory://c"]);
        assert_eq!(config.ttl_ms, 2500);
        assert_eq!(config.candidate_id.as_deref(), Some("node-1"));

        let mut config = ElectionConfig::default();
        let err = config.apply_env(|k| (k == ENV_TTL_MS).then(|| "soon".to_string()));
        assert!(matches!(err, Err(ElectionError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_config() {
        let mut config = ElectionConfig::default();
        assert!(config.validate().is_err());

        config.stores.push("memory://a".to_string());
        assert!(config.validate().is_ok());

        config.ttl_ms = 0;
        assert!(config.validate().is_err());
        config.ttl_ms = MAX_TTL_MS + 1;
        assert!(config.validate().is_err());
        config.ttl_ms = MAX_TTL_MS;
        assert!(config.validate().is_ok());
        config.ttl_ms = 100;

        config.clock_drift_factor = 1.5;
        assert!(config.validate().is_err());
    }
}
