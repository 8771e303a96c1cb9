//! ResourceSyncRule CRD
//!
//! A ResourceSyncRule asks the operator to run one sync controller per
//! registered cluster, copying the selected objects of one kind back into the
//! control plane. The controllers are keyed by the rule's name; editing the
//! spec replaces every controller, deleting the rule removes them.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::GroupVersionKind;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// ResourceSyncRule selects objects of one kind on every member cluster.
///
/// Example:
/// ```yaml
/// apiVersion: fleet.dev/v1alpha1
/// kind: ResourceSyncRule
/// metadata:
///   name: sync-app-secrets
/// spec:
///   groupVersionKind:
///     version: v1
///     kind: Secret
///   rules:
///     - matches:
///         - namespaces: [apps]
///           labels:
///             fleet.dev/share: "true"
///       mutations:
///         labels:
///           fleet.dev/synced: "true"
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "fleet.dev",
    version = "v1alpha1",
    kind = "ResourceSyncRule",
    shortname = "rsr",
    printcolumn = r#"{"name":"Kind","type":"string","jsonPath":".spec.groupVersionKind.kind"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSyncRuleSpec {
    /// Kind of the objects to sync
    pub group_version_kind: SyncGroupVersionKind,

    /// Selection and mutation rules; an empty list selects every object
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<SyncRule>,
}

/// Group, version and kind of a synced resource
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct SyncGroupVersionKind {
    /// API group; empty for the core group
    #[serde(default)]
    pub group: String,
    /// API version (e.g., "v1")
    pub version: String,
    /// Kind (e.g., "Secret")
    pub kind: String,
}

impl SyncGroupVersionKind {
    /// Convert to the kube-rs representation used by discovery
    pub fn to_gvk(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(&self.group, &self.version, &self.kind)
    }
}

impl std::fmt::Display for SyncGroupVersionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.kind)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// One selection rule with the mutations applied to what it selects
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncRule {
    /// Any match selects the object; no matches selects everything
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matches: Vec<SyncMatch>,

    /// Changes applied to the local copy
    #[serde(default)]
    pub mutations: SyncMutations,
}

/// Object selector; all populated fields must match
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncMatch {
    /// Namespaces the object must live in
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<String>,

    /// Exact object key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_key: Option<ObjectKeyMatch>,

    /// Labels the object must carry
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// Name and optional namespace of a single object
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectKeyMatch {
    /// Object name
    pub name: String,
    /// Object namespace; unset for cluster-scoped kinds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Label and annotation changes applied to synced copies
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncMutations {
    /// Labels to add or overwrite
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Annotations to add or overwrite
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl SyncMatch {
    /// Check whether an object's metadata satisfies this match
    pub fn matches(&self, meta: &ObjectMeta) -> bool {
        let namespace = meta.namespace.as_deref();
        if !self.namespaces.is_empty()
            && !namespace.is_some_and(|ns| self.namespaces.iter().any(|n| n == ns))
        {
            return false;
        }
        if let Some(key) = &self.object_key {
            if meta.name.as_deref() != Some(key.name.as_str()) {
                return false;
            }
            if key.namespace.is_some() && key.namespace.as_deref() != namespace {
                return false;
            }
        }
        let labels = meta.labels.as_ref();
        self.labels
            .iter()
            .all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
    }
}

impl SyncRule {
    fn matches(&self, meta: &ObjectMeta) -> bool {
        self.matches.is_empty() || self.matches.iter().any(|m| m.matches(meta))
    }
}

impl ResourceSyncRuleSpec {
    /// Rules whose matches select the object, in declaration order
    ///
    /// A spec with no rules selects every object with no mutations, which is
    /// represented by `Some(vec![])`. `None` means the object is not selected.
    pub fn select(&self, meta: &ObjectMeta) -> Option<Vec<&SyncRule>> {
        if self.rules.is_empty() {
            return Some(Vec::new());
        }
        let selected: Vec<&SyncRule> = self.rules.iter().filter(|r| r.matches(meta)).collect();
        (!selected.is_empty()).then_some(selected)
    }
}

impl ResourceSyncRule {
    /// Validate the spec
    ///
    /// Failures are permanent: retrying an invalid rule cannot succeed until
    /// the rule itself is edited.
    pub fn validate(&self) -> Result<()> {
        let name = self.name_any();
        let gvk = &self.spec.group_version_kind;
        if gvk.version.trim().is_empty() {
            return Err(Error::validation_for_field(
                &name,
                "spec.groupVersionKind.version",
                "version must not be empty",
            ));
        }
        if gvk.kind.trim().is_empty() {
            return Err(Error::validation_for_field(
                &name,
                "spec.groupVersionKind.kind",
                "kind must not be empty",
            ));
        }
        for (i, rule) in self.spec.rules.iter().enumerate() {
            for (j, m) in rule.matches.iter().enumerate() {
                if m.object_key.as_ref().is_some_and(|k| k.name.is_empty()) {
                    return Err(Error::validation_for_field(
                        &name,
                        format!("spec.rules[{i}].matches[{j}].objectKey.name"),
                        "object key name must not be empty",
                    ));
                }
                if m.labels.keys().any(|k| k.is_empty()) {
                    return Err(Error::validation_for_field(
                        &name,
                        format!("spec.rules[{i}].matches[{j}].labels"),
                        "label keys must not be empty",
                    ));
                }
            }
        }
        Ok(())
    }
}
