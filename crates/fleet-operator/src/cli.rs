//! Command line interface
//!
//! Every setting can also come from a `FLEET_*` environment variable. The
//! parsed flags are folded into a [`Configuration`].

use clap::Parser;
use fleet_common::config::{
    ClusterControllerConfig, Configuration, LogFormat, LoggingConfig, RateLimitConfig,
    SyncControllerConfig,
};
use fleet_common::FLEET_SYSTEM_NAMESPACE;

/// Fleet sync operator - keeps resource sync controllers running on every member cluster
#[derive(Parser, Debug)]
#[command(name = "fleet-operator", version, about, long_about = None)]
pub struct Cli {
    /// Print the CRD manifests and exit
    #[arg(long)]
    pub crd: bool,

    /// Print the effective configuration as YAML and exit
    #[arg(long)]
    pub dump_config: bool,

    /// Namespace holding kubeconfig secrets
    #[arg(long, env = "FLEET_NAMESPACE", default_value = FLEET_SYSTEM_NAMESPACE)]
    pub namespace: String,

    /// Log format: json or console
    #[arg(long, env = "FLEET_LOG_FORMAT", default_value = "json")]
    pub log_format: LogFormat,

    /// Log verbosity: 0 info, 1 debug, 2 trace
    #[arg(long, env = "FLEET_LOG_VERBOSITY", default_value_t = 0)]
    pub log_verbosity: u8,

    /// Rules reconciled concurrently
    #[arg(long, env = "FLEET_SYNC_WORKER_COUNT", default_value_t = 1)]
    pub sync_worker_count: u16,

    /// Seconds between sync passes of one controller
    #[arg(long, env = "FLEET_SYNC_RESYNC_INTERVAL_SECONDS", default_value_t = 30)]
    pub sync_resync_interval_seconds: u64,

    /// Seconds to wait for a replaced controller to stop
    #[arg(long, env = "FLEET_SYNC_STOP_TIMEOUT_SECONDS", default_value_t = 30)]
    pub sync_stop_timeout_seconds: u64,

    /// Object keys tracked per controller rate limiter
    #[arg(long, env = "FLEET_SYNC_RATE_LIMIT_MAX_KEYS", default_value_t = 1024)]
    pub sync_rate_limit_max_keys: usize,

    /// Sustained syncs per second per object key
    #[arg(long, env = "FLEET_SYNC_RATE_LIMIT_MAX_RATE_PER_SECOND", default_value_t = 1)]
    pub sync_rate_limit_max_rate_per_second: u32,

    /// Burst size per object key
    #[arg(long, env = "FLEET_SYNC_RATE_LIMIT_MAX_BURST", default_value_t = 5)]
    pub sync_rate_limit_max_burst: u32,

    /// FleetCluster objects reconciled concurrently
    #[arg(long, env = "FLEET_CLUSTER_WORKER_COUNT", default_value_t = 2)]
    pub cluster_worker_count: u16,

    /// Seconds between member cluster API pings; 0 disables pinging
    #[arg(long, env = "FLEET_CLUSTER_REFRESH_INTERVAL_SECONDS", default_value_t = 0)]
    pub cluster_refresh_interval_seconds: u64,

    /// Seconds a leaving cluster gets to stop its controllers
    #[arg(long, env = "FLEET_CLUSTER_STOP_GRACE_SECONDS", default_value_t = 30)]
    pub cluster_stop_grace_seconds: u64,
}

impl Cli {
    /// Effective configuration
    pub fn configuration(&self) -> Configuration {
        Configuration {
            namespace: self.namespace.clone(),
            logging: LoggingConfig {
                format: self.log_format,
                verbosity: self.log_verbosity,
            },
            sync_controller: SyncControllerConfig {
                worker_count: self.sync_worker_count,
                resync_interval_seconds: self.sync_resync_interval_seconds,
                stop_timeout_seconds: self.sync_stop_timeout_seconds,
                rate_limit: RateLimitConfig {
                    max_keys: self.sync_rate_limit_max_keys,
                    max_rate_per_second: self.sync_rate_limit_max_rate_per_second,
                    max_burst: self.sync_rate_limit_max_burst,
                },
            },
            cluster_controller: ClusterControllerConfig {
                worker_count: self.cluster_worker_count,
                refresh_interval_seconds: self.cluster_refresh_interval_seconds,
                stop_grace_seconds: self.cluster_stop_grace_seconds,
            },
        }
    }
}
