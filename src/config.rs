//! Runtime Configuration
//!
//! One `Config` drives clients, workers and the safety net. Values come from
//! built-in defaults, then an optional JSON file, then `SHARDSET_*` environment
//! variables, and are validated before use.

use crate::client::{NegativePolicy, RetryPolicy};
use crate::error::{CacheError, Result};
use crate::routing::HashKind;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

pub const ENV_PREFIX: &str = "SHARDSET_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Coordination root under which collections live.
    pub root: String,
    pub hash: HashKind,
    /// Worker addresses in shard order. When empty, clients use the address
    /// each worker publishes in its status node.
    pub shard_addresses: Vec<String>,
    pub negative_policy: NegativePolicy,
    pub connect_timeout_ms: u64,
    pub connect_attempts: usize,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub safety_net_timeout_ms: u64,
    pub safety_net_interval_ms: u64,
    pub load_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: "/shardset".to_string(),
            hash: HashKind::default(),
            shard_addresses: Vec::new(),
            negative_policy: NegativePolicy::default(),
            connect_timeout_ms: 1000,
            connect_attempts: 3,
            retry_base_ms: 150,
            retry_max_ms: 1200,
            heartbeat_interval_ms: 1000,
            safety_net_timeout_ms: 5000,
            safety_net_interval_ms: 1000,
            load_timeout_ms: 120_000,
        }
    }
}

fn parse_env<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.parse::<T>()
        .map_err(|_| CacheError::Config(format!("{}{} has an invalid value {:?}", ENV_PREFIX, key, raw)))
}

impl Config {
    /// Defaults overlaid with the given JSON file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(format!("{}{}", ENV_PREFIX, key)).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CacheError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| CacheError::Config(e.to_string()))
    }

    /// Overrides fields from `lookup`, which maps a key without the prefix
    /// (`ROOT`, `HASH`, ...) to its value.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup("ROOT") {
            self.root = root;
        }
        if let Some(hash) = lookup("HASH") {
            self.hash = hash.parse().map_err(CacheError::Config)?;
        }
        if let Some(addresses) = lookup("SHARD_ADDRESSES") {
            self.shard_addresses = addresses
                .split(',')
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(policy) = lookup("NEGATIVE_POLICY") {
            self.negative_policy = policy.parse().map_err(CacheError::Config)?;
        }

        let numbers: [(&str, &mut u64); 7] = [
            ("CONNECT_TIMEOUT_MS", &mut self.connect_timeout_ms),
            ("RETRY_BASE_MS", &mut self.retry_base_ms),
            ("RETRY_MAX_MS", &mut self.retry_max_ms),
            ("HEARTBEAT_INTERVAL_MS", &mut self.heartbeat_interval_ms),
            ("SAFETY_NET_TIMEOUT_MS", &mut self.safety_net_timeout_ms),
            ("SAFETY_NET_INTERVAL_MS", &mut self.safety_net_interval_ms),
            ("LOAD_TIMEOUT_MS", &mut self.load_timeout_ms),
        ];
        for (key, field) in numbers {
            if let Some(raw) = lookup(key) {
                *field = parse_env(key, &raw)?;
            }
        }
        if let Some(raw) = lookup("CONNECT_ATTEMPTS") {
            self.connect_attempts = parse_env("CONNECT_ATTEMPTS", &raw)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !self.root.starts_with('/') || self.root.len() < 2 || self.root.ends_with('/') {
            return Err(CacheError::Config(format!(
                "root must be an absolute path without a trailing slash, got {:?}",
                self.root
            )));
        }
        if self.connect_attempts == 0 {
            return Err(CacheError::Config("connect_attempts must be at least 1".into()));
        }
        if self.heartbeat_interval_ms == 0 || self.safety_net_interval_ms == 0 {
            return Err(CacheError::Config("intervals must be positive".into()));
        }
        if self.heartbeat_interval_ms >= self.safety_net_timeout_ms {
            return Err(CacheError::Config(format!(
                "heartbeat interval {}ms must be shorter than the safety net timeout {}ms",
                self.heartbeat_interval_ms, self.safety_net_timeout_ms
            )));
        }
        if self.retry_base_ms > self.retry_max_ms {
            return Err(CacheError::Config("retry_base_ms exceeds retry_max_ms".into()));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.connect_attempts,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            base_delay: Duration::from_millis(self.retry_base_ms),
            max_delay: Duration::from_millis(self.retry_max_ms),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn safety_net_timeout(&self) -> Duration {
        Duration::from_millis(self.safety_net_timeout_ms)
    }

    pub fn safety_net_interval(&self) -> Duration {
        Duration::from_millis(self.safety_net_interval_ms)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.retry_policy().base_delay, Duration::from_millis(150));
        assert_eq!(config.negative_policy, NegativePolicy::Authoritative);
    }

    #[test]
    fn test_json_overlays_defaults() {
        let config = Config::from_json(
            r#"{ "root": "/cache", "hash": "sha256", "shard_addresses": ["127.0.0.1:7000"],
                 "negative_policy": "consult_replicas" }"#,
        )
        .unwrap();

        assert_eq!(config.root, "/cache");
        assert_eq!(config.hash, HashKind::Sha256);
        assert_eq!(config.shard_addresses.len(), 1);
        assert_eq!(config.negative_policy, NegativePolicy::ConsultReplicas);
        assert_eq!(config.connect_attempts, 3);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env(env(&[
                ("ROOT", "/other"),
                ("HASH", "SHA256"),
                ("SHARD_ADDRESSES", "a:1, b:2,,"),
                ("HEARTBEAT_INTERVAL_MS", "250"),
                ("CONNECT_ATTEMPTS", "5"),
            ]))
            .unwrap();

        assert_eq!(config.root, "/other");
        assert_eq!(config.hash, HashKind::Sha256);
        assert_eq!(config.shard_addresses, vec!["a:1", "b:2"]);
        assert_eq!(config.heartbeat_interval(), Duration::from_millis(250));
        assert_eq!(config.connect_attempts, 5);
    }

    #[test]
    fn test_bad_env_value() {
        let mut config = Config::default();
        let result = config.apply_env(env(&[("LOAD_TIMEOUT_MS", "soon")]));
        assert!(matches!(result, Err(CacheError::Config(_))));
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.heartbeat_interval_ms = config.safety_net_timeout_ms;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.root = "relative".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.connect_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file() {
        let result = Config::load(Some(Path::new("/no/such/shardset.json")));
        assert!(matches!(result, Err(CacheError::Config(_))));
    }
}
