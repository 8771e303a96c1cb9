//! Custom Resource Definitions for the fleet sync operator

mod cluster;
mod rule;

pub use cluster::{FleetCluster, FleetClusterSpec, KubeconfigSecretRef, DEFAULT_KUBECONFIG_KEY};
pub use rule::{
    ObjectKeyMatch, ResourceSyncRule, ResourceSyncRuleSpec, SyncGroupVersionKind, SyncMatch,
    SyncMutations, SyncRule,
};
