//! Common types for the fleet sync operator: CRDs, errors, configuration and logging

#![deny(missing_docs)]

pub mod config;
pub mod crd;
pub mod error;
pub mod events;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group for every fleet CRD
pub const FLEET_API_GROUP: &str = "fleet.dev";

/// Default namespace for operator resources (kubeconfig secrets, leases)
pub const FLEET_SYSTEM_NAMESPACE: &str = "fleet-system";

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "fleet-operator";

/// Label stamped on synced copies naming the cluster they came from
pub const SOURCE_CLUSTER_LABEL: &str = "fleet.dev/source-cluster";

/// Label stamped on synced copies naming the rule that owns them
pub const SYNC_RULE_LABEL: &str = "fleet.dev/sync-rule";
