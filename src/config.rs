//! Configuration management for Slidewarden.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, WardenError};
use crate::guard::FailurePolicy;
use crate::ratelimit::{LimiterOptions, Representation, ThrottlerConfig, ThrottlerRules};

/// Prefix for nested environment overrides, e.g. `SLIDEWARDEN_STORE__BACKEND=redis`.
pub const ENV_PREFIX: &str = "SLIDEWARDEN";

/// Main configuration for Slidewarden.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WardenConfig {
    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Limiter tuning
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Guard configuration
    #[serde(default)]
    pub guard: GuardConfig,
}

/// Which store adapter to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store, not shared between processes
    Memory,
    /// Redis server shared by every limiter instance
    #[default]
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Prepended to every stored key
    #[serde(default)]
    pub key_prefix: String,

    /// Connection establishment timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Per-operation response timeout in milliseconds
    #[serde(default = "default_response_timeout")]
    pub response_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            key_prefix: String::new(),
            connect_timeout_ms: default_connect_timeout(),
            response_timeout_ms: default_response_timeout(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_connect_timeout() -> u64 {
    2000
}

fn default_response_timeout() -> u64 {
    500
}

/// Limiter tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Stored window representation
    #[serde(default)]
    pub representation: Representation,

    /// Conditional-write retries when the store cannot mutate atomically
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base retry backoff in milliseconds
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,

    /// Optional time box for a whole decision, in milliseconds
    #[serde(default)]
    pub operation_timeout_ms: Option<u64>,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            representation: Representation::default(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff(),
            operation_timeout_ms: None,
        }
    }
}

fn default_max_retries() -> u32 {
    10
}

fn default_retry_backoff() -> u64 {
    5
}

impl From<&LimiterConfig> for LimiterOptions {
    fn from(config: &LimiterConfig) -> Self {
        Self {
            representation: config.representation,
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            operation_timeout: config.operation_timeout_ms.map(Duration::from_millis),
        }
    }
}

/// Guard configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Outcome when the store is unavailable
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Throttlers to evaluate
    #[serde(default = "default_throttlers")]
    pub throttlers: Vec<ThrottlerConfig>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::default(),
            throttlers: default_throttlers(),
        }
    }
}

fn default_throttlers() -> Vec<ThrottlerConfig> {
    vec![ThrottlerConfig::new(
        crate::ratelimit::DEFAULT_CLIENT_ID,
        default_ttl(),
        default_limit(),
    )]
}

fn default_ttl() -> u64 {
    60
}

fn default_limit() -> u64 {
    10
}

impl GuardConfig {
    /// Validated throttler rules.
    pub fn rules(&self) -> Result<ThrottlerRules> {
        ThrottlerRules::from_throttlers(self.throttlers.clone())
    }
}

impl WardenConfig {
    /// Parse configuration from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| WardenError::Config(e.to_string()))
    }

    /// Load configuration from an optional file, then `SLIDEWARDEN_*`
    /// environment variables, then the flat `REDIS_URL`, `RATE_LIMIT_TTL`
    /// and `RATE_LIMIT_LIMIT` variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let mut loaded: WardenConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| WardenError::Config(e.to_string()))?;

        loaded.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(loaded)
    }

    /// Apply the flat variables the original deployment used.
    ///
    /// `RATE_LIMIT_TTL` and `RATE_LIMIT_LIMIT` adjust the first throttler.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("REDIS_URL") {
            self.store.redis_url = url;
        }

        let ttl = parse_override(&lookup, "RATE_LIMIT_TTL")?;
        let limit = parse_override(&lookup, "RATE_LIMIT_LIMIT")?;
        if ttl.is_none() && limit.is_none() {
            return Ok(());
        }

        if self.guard.throttlers.is_empty() {
            self.guard.throttlers = default_throttlers();
        }
        let first = &mut self.guard.throttlers[0];
        if let Some(ttl) = ttl {
            first.ttl_secs = ttl;
        }
        if let Some(limit) = limit {
            first.limit = limit;
        }
        Ok(())
    }
}

fn parse_override<F>(lookup: &F, name: &str) -> Result<Option<u64>>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|raw| {
            raw.trim()
                .parse::<u64>()
                .map_err(|e| WardenError::Config(format!("{name}={raw:?}: {e}")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_match_original_deployment() {
        let config = WardenConfig::default();
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.store.redis_url, "redis://localhost:6379");
        assert_eq!(config.guard.failure_policy, FailurePolicy::Closed);

        let throttler = &config.guard.throttlers[0];
        assert_eq!(throttler.name, "default");
        assert_eq!(throttler.ttl_secs, 60);
        assert_eq!(throttler.limit, 10);
    }

    #[test]
    fn test_from_yaml_partial() {
        let yaml = r#"
store:
  backend: memory
limiter:
  representation: counter
  operation_timeout_ms: 250
guard:
  failure_policy: open
  throttlers:
    - name: burst
      ttl_secs: 1
      limit: 20
"#;
        let config = WardenConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.response_timeout_ms, 500);
        assert_eq!(config.guard.failure_policy, FailurePolicy::Open);
        assert_eq!(config.guard.rules().unwrap().throttlers[0].name, "burst");

        let options = LimiterOptions::from(&config.limiter);
        assert_eq!(options.representation, Representation::Counter);
        assert_eq!(options.max_retries, 10);
        assert_eq!(options.operation_timeout, Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_from_yaml_rejects_unknown_backend() {
        let result = WardenConfig::from_yaml("store:\n  backend: memcached\n");
        assert!(matches!(result, Err(WardenError::Config(_))));
    }

    #[test]
    fn test_flat_overrides() {
        let env: HashMap<&str, &str> = [
            ("REDIS_URL", "redis://cache:6380"),
            ("RATE_LIMIT_TTL", "30"),
            ("RATE_LIMIT_LIMIT", "5"),
        ]
        .into_iter()
        .collect();

        let mut config = WardenConfig::default();
        config
            .apply_overrides(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.store.redis_url, "redis://cache:6380");
        assert_eq!(config.guard.throttlers[0].ttl_secs, 30);
        assert_eq!(config.guard.throttlers[0].limit, 5);
    }

    #[test]
    fn test_flat_override_must_be_numeric() {
        let mut config = WardenConfig::default();
        let result =
            config.apply_overrides(|name| (name == "RATE_LIMIT_LIMIT").then(|| "ten".to_string()));
        assert!(matches!(result, Err(WardenError::Config(_))));
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir()
            .join(format!("slidewarden-config-{}.yaml", std::process::id()));
        std::fs::write(&path, "store:\n  backend: memory\n  key_prefix: \"app:\"\n").unwrap();

        let config = WardenConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.key_prefix, "app:");
    }
}
