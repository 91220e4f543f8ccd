//! Throttler rules configuration and route matching.
//!
//! A throttler is one named limit (window, hit limit, block duration) that
//! applies to some set of routes. Each throttler's name doubles as the
//! client id its records are namespaced under.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::info;

use crate::error::{Result, WardenError};

fn default_throttler_name() -> String {
    super::DEFAULT_CLIENT_ID.to_string()
}

/// A single named limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottlerConfig {
    /// Throttler name, also the storage namespace
    #[serde(default = "default_throttler_name")]
    pub name: String,
    /// Window length in seconds
    #[serde(alias = "ttl")]
    pub ttl_secs: u64,
    /// Hits allowed per window
    pub limit: u64,
    /// Block duration reported when over the limit (defaults to the window)
    #[serde(default)]
    pub block_duration_secs: Option<u64>,
    /// Route prefixes this throttler applies to (empty means every route)
    #[serde(default)]
    pub routes: Vec<String>,
}

impl ThrottlerConfig {
    /// Create a throttler that applies to every route.
    pub fn new(name: &str, ttl_secs: u64, limit: u64) -> Self {
        Self {
            name: name.to_string(),
            ttl_secs,
            limit,
            block_duration_secs: None,
            routes: Vec::new(),
        }
    }

    /// Effective block duration in seconds.
    pub fn block_duration_secs(&self) -> u64 {
        self.block_duration_secs.unwrap_or(self.ttl_secs)
    }

    /// Whether this throttler covers `route`.
    ///
    /// A prefix matches on path-segment boundaries, so `/api` covers
    /// `/api/teams` but not `/apix`.
    pub fn matches(&self, route: &str) -> bool {
        if self.routes.is_empty() {
            return true;
        }

        self.routes.iter().any(|prefix| match route.strip_prefix(prefix.as_str()) {
            Some(rest) => rest.is_empty() || prefix.ends_with('/') || rest.starts_with('/'),
            None => false,
        })
    }
}

/// The full set of throttlers a guard evaluates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottlerRules {
    #[serde(default)]
    pub throttlers: Vec<ThrottlerConfig>,
}

impl ThrottlerRules {
    /// Build and validate a rule set.
    pub fn from_throttlers(throttlers: Vec<ThrottlerConfig>) -> Result<Self> {
        let rules = Self { throttlers };
        rules.validate()?;
        Ok(rules)
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading throttler rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        // A document describing one throttler
        if let Ok(throttler) = serde_yaml::from_str::<ThrottlerConfig>(yaml) {
            return Self::from_throttlers(vec![throttler]);
        }

        // Otherwise a `throttlers:` list
        let rules: ThrottlerRules = serde_yaml::from_str(yaml)
            .map_err(|e| WardenError::Config(format!("Failed to parse throttler rules: {}", e)))?;
        rules.validate()?;
        Ok(rules)
    }

    /// Reject zero windows, zero limits and duplicate names.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for throttler in &self.throttlers {
            if throttler.ttl_secs == 0 {
                return Err(WardenError::Config(format!(
                    "throttler '{}' has a zero ttl",
                    throttler.name
                )));
            }
            if throttler.limit == 0 {
                return Err(WardenError::Config(format!(
                    "throttler '{}' has a zero limit",
                    throttler.name
                )));
            }
            if !seen.insert(throttler.name.as_str()) {
                return Err(WardenError::Config(format!(
                    "throttler '{}' is defined twice",
                    throttler.name
                )));
            }
        }
        Ok(())
    }

    /// Throttlers covering `route`, in configuration order.
    pub fn applicable<'a>(
        &'a self,
        route: &'a str,
    ) -> impl Iterator<Item = &'a ThrottlerConfig> + 'a {
        self.throttlers.iter().filter(move |t| t.matches(route))
    }

    /// Look up a throttler by name.
    pub fn get(&self, name: &str) -> Option<&ThrottlerConfig> {
        self.throttlers.iter().find(|t| t.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.throttlers.is_empty()
    }
}
