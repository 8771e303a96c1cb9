//! Operator configuration
//!
//! The binary fills a [`Configuration`] from CLI flags and environment
//! variables; `--dump-config` prints it back as YAML. Every field has a
//! default so a partial YAML document deserializes cleanly.

use serde::{Deserialize, Serialize};

use crate::{Error, Result, FLEET_SYSTEM_NAMESPACE};

/// Top-level operator configuration
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Configuration {
    /// Namespace holding kubeconfig secrets and other operator resources
    pub namespace: String,
    /// Log output settings
    pub logging: LoggingConfig,
    /// Rule controller and per-cluster sync controller settings
    pub sync_controller: SyncControllerConfig,
    /// Cluster discovery settings
    pub cluster_controller: ClusterControllerConfig,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            namespace: FLEET_SYSTEM_NAMESPACE.to_string(),
            logging: LoggingConfig::default(),
            sync_controller: SyncControllerConfig::default(),
            cluster_controller: ClusterControllerConfig::default(),
        }
    }
}

/// Log output format
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum LogFormat {
    /// One JSON object per line
    #[default]
    Json,
    /// Human readable output for local development
    Console,
}

impl std::str::FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "console" | "text" => Ok(Self::Console),
            other => Err(Error::config(format!("unknown log format {other:?}"))),
        }
    }
}

/// Logging settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingConfig {
    /// Output format
    pub format: LogFormat,
    /// 0 logs at info, 1 at debug, 2 and above at trace
    pub verbosity: u8,
}

/// Settings for the rule controller and the sync controllers it creates
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncControllerConfig {
    /// Rules reconciled concurrently
    pub worker_count: u16,
    /// Seconds between two sync passes of one controller
    pub resync_interval_seconds: u64,
    /// Seconds to wait for a replaced controller to stop
    pub stop_timeout_seconds: u64,
    /// Per-controller rate limit
    pub rate_limit: RateLimitConfig,
}

impl Default for SyncControllerConfig {
    fn default() -> Self {
        Self {
            worker_count: 1,
            resync_interval_seconds: 30,
            stop_timeout_seconds: 30,
            rate_limit: RateLimitConfig::default(),
        }
    }
}

/// Token bucket settings applied per object key
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitConfig {
    /// Keys tracked before the least recently used one is evicted
    pub max_keys: usize,
    /// Sustained rate per key
    pub max_rate_per_second: u32,
    /// Bucket size per key
    pub max_burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_keys: 1024,
            max_rate_per_second: 1,
            max_burst: 5,
        }
    }
}

/// Settings for cluster discovery and per-cluster bookkeeping
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterControllerConfig {
    /// FleetCluster objects reconciled concurrently
    pub worker_count: u16,
    /// Seconds between API pings of a member cluster; 0 disables pinging
    pub refresh_interval_seconds: u64,
    /// Seconds to wait for a leaving cluster's controllers to stop
    pub stop_grace_seconds: u64,
}

impl Default for ClusterControllerConfig {
    fn default() -> Self {
        Self {
            worker_count: 2,
            refresh_interval_seconds: 0,
            stop_grace_seconds: 30,
        }
    }
}

impl Configuration {
    /// Reject settings the controllers cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(Error::config("namespace must not be empty"));
        }
        if self.sync_controller.worker_count == 0 {
            return Err(Error::config("syncController.workerCount must be at least 1"));
        }
        if self.sync_controller.resync_interval_seconds == 0 {
            return Err(Error::config(
                "syncController.resyncIntervalSeconds must be at least 1",
            ));
        }
        let rl = &self.sync_controller.rate_limit;
        if rl.max_keys == 0 || rl.max_rate_per_second == 0 || rl.max_burst == 0 {
            return Err(Error::config(
                "syncController.rateLimit fields must all be at least 1",
            ));
        }
        if self.cluster_controller.worker_count == 0 {
            return Err(Error::config(
                "clusterController.workerCount must be at least 1",
            ));
        }
        Ok(())
    }

    /// Render as YAML for `--dump-config`
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| Error::serialization(e.to_string()))
    }

    /// Parse a YAML document, filling gaps with defaults
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| Error::serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn defaults_match_documented_values() {
        let config = Configuration::default();
        assert_eq!(config.namespace, FLEET_SYSTEM_NAMESPACE);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.sync_controller.worker_count, 1);
        assert_eq!(config.sync_controller.rate_limit.max_keys, 1024);
        assert_eq!(config.sync_controller.rate_limit.max_rate_per_second, 1);
        assert_eq!(config.sync_controller.rate_limit.max_burst, 5);
        assert_eq!(config.cluster_controller.worker_count, 2);
        assert_eq!(config.cluster_controller.refresh_interval_seconds, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config = Configuration::from_yaml(
            "syncController:\n  workerCount: 4\n  rateLimit:\n    maxBurst: 10\n",
        )
        .unwrap();
        assert_eq!(config.sync_controller.worker_count, 4);
        assert_eq!(config.sync_controller.rate_limit.max_burst, 10);
        assert_eq!(config.sync_controller.rate_limit.max_keys, 1024);
        assert_eq!(config.cluster_controller, ClusterControllerConfig::default());
    }

    #[test]
    fn dumped_yaml_uses_camel_case() {
        let yaml = Configuration::default().to_yaml().unwrap();
        assert!(yaml.contains("syncController:"));
        assert!(yaml.contains("maxRatePerSecond: 1"));
        assert!(yaml.contains("refreshIntervalSeconds: 0"));
    }

    #[rstest]
    #[case::zero_workers("syncController:\n  workerCount: 0\n")]
    #[case::zero_keys("syncController:\n  rateLimit:\n    maxKeys: 0\n")]
    #[case::zero_rate("syncController:\n  rateLimit:\n    maxRatePerSecond: 0\n")]
    #[case::zero_resync("syncController:\n  resyncIntervalSeconds: 0\n")]
    #[case::zero_cluster_workers("clusterController:\n  workerCount: 0\n")]
    #[case::empty_namespace("namespace: \"\"\n")]
    fn invalid_settings_are_rejected(#[case] yaml: &str) {
        let config = Configuration::from_yaml(yaml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::Config { .. }), "got {err:?}");
    }

    #[rstest]
    #[case("json", LogFormat::Json)]
    #[case("JSON", LogFormat::Json)]
    #[case("console", LogFormat::Console)]
    #[case("text", LogFormat::Console)]
    fn log_format_parses(#[case] input: &str, #[case] expected: LogFormat) {
        assert_eq!(input.parse::<LogFormat>().unwrap(), expected);
    }

    #[test]
    fn unknown_log_format_is_an_error() {
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
