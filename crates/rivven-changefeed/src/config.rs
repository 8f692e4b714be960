//! Configuration for the change feed processor
//!
//! Options deserialize from YAML with every field defaulted, so an empty
//! document is a valid configuration:
//!
//! ```yaml
//! host_name: ${HOSTNAME:-worker-1}
//! processor:
//!   lease_prefix: orders
//!   feed_poll_delay_ms: 1000
//!   start_from:
//!     type: beginning
//!   checkpoint:
//!     processed_document_count: 10
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use crate::checkpoint::CheckpointFrequency;
use crate::error::{ChangeFeedError, Result};
use crate::feed::ChangeFeedStartFrom;

/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Top-level configuration file
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ChangeFeedConfig {
    /// Name this host uses as lease owner (generated if not specified)
    #[serde(default)]
    pub host_name: Option<String>,

    #[serde(default)]
    pub processor: ChangeFeedProcessorOptions,
}

impl ChangeFeedConfig {
    /// Load and validate a YAML file, expanding environment variables
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ChangeFeedError::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let expanded = Self::expand_env_vars(content);
        let config: Self = serde_yaml::from_str(&expanded)
            .map_err(|e| ChangeFeedError::config(format!("failed to parse config: {e}")))?;
        config.processor.validate()?;
        Ok(config)
    }

    fn expand_env_vars(content: &str) -> String {
        ENV_VAR_REGEX
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default = caps.get(2).map(|m| m.as_str());
                std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
            })
            .to_string()
    }
}

/// Where fresh leases start reading
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StartFrom {
    /// Only changes made after the processor starts
    #[default]
    Now,
    /// Every change retained by the store
    Beginning,
    /// Changes made at or after `time`
    PointInTime { time: DateTime<Utc> },
}

impl From<&StartFrom> for ChangeFeedStartFrom {
    fn from(start: &StartFrom) -> Self {
        match start {
            StartFrom::Now => ChangeFeedStartFrom::Now,
            StartFrom::Beginning => ChangeFeedStartFrom::Beginning,
            StartFrom::PointInTime { time } => ChangeFeedStartFrom::PointInTime { time: *time },
        }
    }
}

/// Tuning for lease coordination and feed reading
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChangeFeedProcessorOptions {
    /// Prefix for lease document ids, to share one lease container
    #[serde(default)]
    pub lease_prefix: String,

    /// How often an owner renews its leases (milliseconds)
    #[serde(default = "default_lease_renew_interval_ms")]
    pub lease_renew_interval_ms: u64,

    /// How often the load balancer looks for leases to take (milliseconds)
    #[serde(default = "default_lease_acquire_interval_ms")]
    pub lease_acquire_interval_ms: u64,

    /// A lease not renewed for this long may be taken (milliseconds)
    #[serde(default = "default_lease_expiration_interval_ms")]
    pub lease_expiration_interval_ms: u64,

    /// Wait after an empty page (milliseconds)
    #[serde(default = "default_feed_poll_delay_ms")]
    pub feed_poll_delay_ms: u64,

    /// Page size for change feed reads
    #[serde(default = "default_max_items_per_page")]
    pub max_items_per_page: u32,

    #[serde(default)]
    pub start_from: StartFrom,

    /// Minimum leases per host (0 = no minimum)
    #[serde(default)]
    pub min_scale_count: usize,

    /// Maximum leases per host (0 = unbounded)
    #[serde(default)]
    pub max_scale_count: usize,

    #[serde(default)]
    pub checkpoint: CheckpointFrequency,

    /// Wait between bootstrap attempts while another host initializes (milliseconds)
    #[serde(default = "default_bootstrap_retry_delay_ms")]
    pub bootstrap_retry_delay_ms: u64,
}

fn default_lease_renew_interval_ms() -> u64 {
    17_000
}

fn default_lease_acquire_interval_ms() -> u64 {
    13_000
}

fn default_lease_expiration_interval_ms() -> u64 {
    60_000
}

fn default_feed_poll_delay_ms() -> u64 {
    5_000
}

fn default_max_items_per_page() -> u32 {
    100
}

fn default_bootstrap_retry_delay_ms() -> u64 {
    15_000
}

impl Default for ChangeFeedProcessorOptions {
    fn default() -> Self {
        Self {
            lease_prefix: String::new(),
            lease_renew_interval_ms: default_lease_renew_interval_ms(),
            lease_acquire_interval_ms: default_lease_acquire_interval_ms(),
            lease_expiration_interval_ms: default_lease_expiration_interval_ms(),
            feed_poll_delay_ms: default_feed_poll_delay_ms(),
            max_items_per_page: default_max_items_per_page(),
            start_from: StartFrom::default(),
            min_scale_count: 0,
            max_scale_count: 0,
            checkpoint: CheckpointFrequency::default(),
            bootstrap_retry_delay_ms: default_bootstrap_retry_delay_ms(),
        }
    }
}

impl ChangeFeedProcessorOptions {
    pub fn lease_renew_interval(&self) -> Duration {
        Duration::from_millis(self.lease_renew_interval_ms)
    }

    pub fn lease_acquire_interval(&self) -> Duration {
        Duration::from_millis(self.lease_acquire_interval_ms)
    }

    pub fn lease_expiration_interval(&self) -> Duration {
        Duration::from_millis(self.lease_expiration_interval_ms)
    }

    pub fn feed_poll_delay(&self) -> Duration {
        Duration::from_millis(self.feed_poll_delay_ms)
    }

    pub fn bootstrap_retry_delay(&self) -> Duration {
        Duration::from_millis(self.bootstrap_retry_delay_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_items_per_page == 0 {
            return Err(ChangeFeedError::config("max_items_per_page must be positive"));
        }
        for (name, value) in [
            ("lease_renew_interval_ms", self.lease_renew_interval_ms),
            ("lease_acquire_interval_ms", self.lease_acquire_interval_ms),
            ("lease_expiration_interval_ms", self.lease_expiration_interval_ms),
            ("feed_poll_delay_ms", self.feed_poll_delay_ms),
        ] {
            if value == 0 {
                return Err(ChangeFeedError::config(format!("{name} must be positive")));
            }
        }
        if self.lease_renew_interval_ms >= self.lease_expiration_interval_ms {
            return Err(ChangeFeedError::config(
                "lease_renew_interval_ms must be shorter than lease_expiration_interval_ms",
            ));
        }
        if self.max_scale_count > 0 && self.min_scale_count > self.max_scale_count {
            return Err(ChangeFeedError::config(
                "min_scale_count must not exceed max_scale_count",
            ));
        }
        self.checkpoint.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = ChangeFeedConfig::from_yaml("{}").unwrap();
        let options = config.processor;
        assert_eq!(options.lease_renew_interval(), Duration::from_secs(17));
        assert_eq!(options.lease_acquire_interval(), Duration::from_secs(13));
        assert_eq!(options.lease_expiration_interval(), Duration::from_secs(60));
        assert_eq!(options.feed_poll_delay(), Duration::from_secs(5));
        assert_eq!(options.max_items_per_page, 100);
        assert_eq!(options.start_from, StartFrom::Now);
        assert!(config.host_name.is_none());
    }

    #[test]
    fn test_parse_full_document() {
        let yaml = r#"
host_name: worker-7
processor:
  lease_prefix: orders
  feed_poll_delay_ms: 250
  max_scale_count: 4
  start_from:
    type: point_in_time
    time: "2024-01-01T00:00:00Z"
  checkpoint:
    processed_document_count: 3
"#;
        let config = ChangeFeedConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.host_name.as_deref(), Some("worker-7"));
        assert_eq!(config.processor.lease_prefix, "orders");
        assert_eq!(config.processor.feed_poll_delay(), Duration::from_millis(250));
        assert_eq!(config.processor.max_scale_count, 4);
        assert!(matches!(
            config.processor.start_from,
            StartFrom::PointInTime { .. }
        ));
        assert_eq!(config.processor.checkpoint.processed_document_count, Some(3));
    }

    #[test]
    fn test_env_var_expansion_with_default() {
        let config =
            ChangeFeedConfig::from_yaml("host_name: ${RIVVEN_CF_TEST_UNSET_VAR:-fallback}")
                .unwrap();
        assert_eq!(config.host_name.as_deref(), Some("fallback"));
    }

    #[test]
    fn test_validation() {
        let mut options = ChangeFeedProcessorOptions::default();
        assert!(options.validate().is_ok());

        options.lease_renew_interval_ms = 60_000;
        assert!(options.validate().is_err());

        let mut options = ChangeFeedProcessorOptions {
            max_items_per_page: 0,
            ..Default::default()
        };
        assert!(options.validate().is_err());

        options.max_items_per_page = 10;
        options.min_scale_count = 5;
        options.max_scale_count = 2;
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("changefeed.yaml");
        std::fs::write(&path, "processor:\n  lease_prefix: test\n").unwrap();
        let config = ChangeFeedConfig::from_file(&path).unwrap();
        assert_eq!(config.processor.lease_prefix, "test");

        assert!(ChangeFeedConfig::from_file(dir.path().join("missing.yaml")).is_err());
    }
}
