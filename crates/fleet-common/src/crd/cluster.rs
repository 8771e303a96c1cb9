//! FleetCluster CRD
//!
//! A FleetCluster declares a member cluster. The operator reads the referenced
//! kubeconfig Secret, registers the cluster with the registry while the object
//! exists, and unregisters it when the object is deleted.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Default data key holding the kubeconfig inside the Secret
pub const DEFAULT_KUBECONFIG_KEY: &str = "kubeconfig";

fn default_kubeconfig_key() -> String {
    DEFAULT_KUBECONFIG_KEY.to_string()
}

/// FleetCluster declares one member of the fleet.
///
/// Example:
/// ```yaml
/// apiVersion: fleet.dev/v1alpha1
/// kind: FleetCluster
/// metadata:
///   name: east
/// spec:
///   clusterId: 5d1c1a6e-east
///   kubeconfigSecretRef:
///     name: east-kubeconfig
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "fleet.dev",
    version = "v1alpha1",
    kind = "FleetCluster",
    shortname = "fc",
    printcolumn = r#"{"name":"ClusterID","type":"string","jsonPath":".spec.clusterId"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct FleetClusterSpec {
    /// Unique cluster ID; defaults to the object name when empty
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_id: String,

    /// Secret holding the kubeconfig used to reach the cluster
    pub kubeconfig_secret_ref: KubeconfigSecretRef,
}

/// Reference to a kubeconfig stored in a Secret
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KubeconfigSecretRef {
    /// Secret name
    pub name: String,

    /// Secret namespace; defaults to the operator namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Data key holding the kubeconfig
    #[serde(default = "default_kubeconfig_key")]
    pub key: String,
}

impl FleetCluster {
    /// ID the cluster is registered under
    pub fn cluster_id(&self) -> String {
        if self.spec.cluster_id.is_empty() {
            self.name_any()
        } else {
            self.spec.cluster_id.clone()
        }
    }
}
