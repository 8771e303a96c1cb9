//! Reference copier for arbitrary kinds
//!
//! Resolves the rule's kind through API discovery, reads source objects from
//! the member cluster and server-side applies them into the control-plane
//! cluster. Copies carry the source cluster and the owning rule as labels; a
//! copy owned by this rule whose source object disappeared is deleted.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use fleet_clusters::Cluster;
use fleet_common::crd::{ResourceSyncRule, SyncGroupVersionKind, SyncRule};
use fleet_common::{Result, FIELD_MANAGER, SOURCE_CLUSTER_LABEL, SYNC_RULE_LABEL};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::core::TypeMeta;
use kube::discovery::{pinned_kind, ApiCapabilities, ApiResource, Scope};
use kube::{Api, Client, ResourceExt};
use parking_lot::Mutex;
use tracing::{debug, info};

use super::{ObjectKey, ResourceSyncer};

type Resolved = (ApiResource, ApiCapabilities);

/// Copies objects into the control-plane cluster
pub struct DynamicObjectSyncer {
    local: Client,
    discovered: Mutex<HashMap<(String, SyncGroupVersionKind), Resolved>>,
}

impl DynamicObjectSyncer {
    /// Copy into the cluster `local` points at
    pub fn new(local: Client) -> Self {
        Self {
            local,
            discovered: Mutex::new(HashMap::new()),
        }
    }

    async fn resolve(&self, cluster: &Cluster, gvk: &SyncGroupVersionKind) -> Result<Resolved> {
        let cache_key = (cluster.id().to_string(), gvk.clone());
        let cached = self.discovered.lock().get(&cache_key).cloned();
        if let Some(hit) = cached {
            return Ok(hit);
        }
        let resolved = pinned_kind(&cluster.client(), &gvk.to_gvk()).await?;
        debug!(cluster = %cluster.id(), kind = %gvk, plural = %resolved.0.plural, "resolved kind");
        self.discovered.lock().insert(cache_key, resolved.clone());
        Ok(resolved)
    }
}

fn scoped_api(
    client: Client,
    resolved: &Resolved,
    namespace: Option<&str>,
) -> Api<DynamicObject> {
    let (ar, caps) = resolved;
    match (&caps.scope, namespace) {
        (Scope::Namespaced, Some(ns)) => Api::namespaced_with(client, ns, ar),
        _ => Api::all_with(client, ar),
    }
}

/// Clear fields the API server owns so the object can be applied elsewhere
fn strip_server_fields(meta: &mut ObjectMeta) {
    meta.uid = None;
    meta.resource_version = None;
    meta.creation_timestamp = None;
    meta.managed_fields = None;
    meta.generation = None;
    meta.deletion_timestamp = None;
    meta.deletion_grace_period_seconds = None;
    meta.owner_references = None;
    meta.finalizers = None;
}

/// Build the object applied into the control plane
fn prepare_copy(
    mut obj: DynamicObject,
    ar: &ApiResource,
    selected: &[&SyncRule],
    source_cluster: &str,
    rule_name: &str,
) -> DynamicObject {
    strip_server_fields(&mut obj.metadata);
    obj.types = Some(TypeMeta {
        api_version: ar.api_version.clone(),
        kind: ar.kind.clone(),
    });

    let labels = obj.metadata.labels.get_or_insert_with(Default::default);
    for rule in selected {
        labels.extend(rule.mutations.labels.clone());
    }
    labels.insert(SOURCE_CLUSTER_LABEL.to_string(), source_cluster.to_string());
    labels.insert(SYNC_RULE_LABEL.to_string(), rule_name.to_string());

    for rule in selected {
        if !rule.mutations.annotations.is_empty() {
            obj.metadata
                .annotations
                .get_or_insert_with(Default::default)
                .extend(rule.mutations.annotations.clone());
        }
    }

    // status is owned by whichever controller manages the source object
    if let Some(fields) = obj.data.as_object_mut() {
        fields.remove("status");
    }
    obj
}

/// Whether `obj` is a copy made by `rule` from `cluster`
fn copied_from(obj: &DynamicObject, cluster: &str, rule: &str) -> bool {
    let labels = obj.labels();
    labels.get(SOURCE_CLUSTER_LABEL).map(String::as_str) == Some(cluster)
        && labels.get(SYNC_RULE_LABEL).map(String::as_str) == Some(rule)
}

/// Label selector matching the copies `rule` made from `cluster`
fn copy_selector(cluster: &str, rule: &str) -> String {
    format!("{SOURCE_CLUSTER_LABEL}={cluster},{SYNC_RULE_LABEL}={rule}")
}

#[async_trait]
impl ResourceSyncer for DynamicObjectSyncer {
    async fn list_keys(
        &self,
        cluster: &Cluster,
        rule: &ResourceSyncRule,
    ) -> Result<Vec<ObjectKey>> {
        let resolved = self.resolve(cluster, &rule.spec.group_version_kind).await?;

        let remote = scoped_api(cluster.client(), &resolved, None);
        let mut keys: BTreeSet<ObjectKey> = remote
            .list(&ListParams::default())
            .await?
            .items
            .iter()
            .filter(|obj| rule.spec.select(&obj.metadata).is_some())
            .map(|obj| ObjectKey::from_meta(&obj.metadata))
            .collect();

        // Copies whose source may be gone
        let local = scoped_api(self.local.clone(), &resolved, None);
        let selector = copy_selector(cluster.id(), &rule.name_any());
        let copies = local.list(&ListParams::default().labels(&selector)).await?;
        keys.extend(copies.items.iter().map(|obj| ObjectKey::from_meta(&obj.metadata)));

        Ok(keys.into_iter().collect())
    }

    async fn sync_object(
        &self,
        cluster: &Cluster,
        rule: &ResourceSyncRule,
        key: &ObjectKey,
    ) -> Result<()> {
        let resolved = self.resolve(cluster, &rule.spec.group_version_kind).await?;
        let namespace = key.namespace.as_deref();
        let remote = scoped_api(cluster.client(), &resolved, namespace);
        let local = scoped_api(self.local.clone(), &resolved, namespace);

        let source = remote
            .get_opt(&key.name)
            .await?
            .filter(|obj| rule.spec.select(&obj.metadata).is_some());
        let Some(source) = source else {
            let Some(copy) = local.get_opt(&key.name).await? else {
                return Ok(());
            };
            if !copied_from(&copy, cluster.id(), &rule.name_any()) {
                return Ok(());
            }
            match local.delete(&key.name, &DeleteParams::default()).await {
                Ok(_) => info!(cluster = %cluster.id(), object = %key, "removed stale copy"),
                Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                Err(e) => return Err(e.into()),
            }
            return Ok(());
        };

        let selected = rule.spec.select(&source.metadata).unwrap_or_default();
        let copy = prepare_copy(
            source,
            &resolved.0,
            &selected,
            cluster.id(),
            &rule.name_any(),
        );
        local
            .patch(
                &key.name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&copy),
            )
            .await?;
        debug!(cluster = %cluster.id(), object = %key, "object synced");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_common::crd::SyncMutations;
    use kube::core::GroupVersionKind;

    fn secret_resource() -> ApiResource {
        ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk("", "v1", "Secret"), "secrets")
    }

    fn remote_secret() -> DynamicObject {
        let mut obj = DynamicObject::new("db", &secret_resource()).within("apps");
        obj.metadata.uid = Some("0b1e".to_string());
        obj.metadata.resource_version = Some("42".to_string());
        obj.metadata.labels = Some([("app".to_string(), "db".to_string())].into());
        obj.data = serde_json::json!({
            "data": {"password": "aHVudGVyMg=="},
            "status": {"observed": true}
        });
        obj
    }

    #[test]
    fn copies_drop_server_fields_and_status() {
        let copy = prepare_copy(remote_secret(), &secret_resource(), &[], "east", "apps-secrets");

        assert_eq!(copy.metadata.uid, None);
        assert_eq!(copy.metadata.resource_version, None);
        assert_eq!(copy.metadata.namespace.as_deref(), Some("apps"));
        assert_eq!(copy.types.as_ref().map(|t| t.kind.as_str()), Some("Secret"));
        assert!(copy.data.get("status").is_none());
        assert!(copy.data.get("data").is_some());
    }

    #[test]
    fn copies_carry_mutations_and_source_label() {
        let rule = SyncRule {
            matches: vec![],
            mutations: SyncMutations {
                labels: [("fleet.dev/synced".to_string(), "true".to_string())].into(),
                annotations: [("note".to_string(), "copied".to_string())].into(),
            },
        };
        let copy = prepare_copy(
            remote_secret(),
            &secret_resource(),
            &[&rule],
            "east",
            "apps-secrets",
        );

        let labels = copy.metadata.labels.as_ref().unwrap();
        assert_eq!(labels["app"], "db");
        assert_eq!(labels["fleet.dev/synced"], "true");
        assert_eq!(labels[SOURCE_CLUSTER_LABEL], "east");
        assert_eq!(labels[SYNC_RULE_LABEL], "apps-secrets");
        assert_eq!(copy.metadata.annotations.as_ref().unwrap()["note"], "copied");
    }

    #[test]
    fn copies_belong_to_one_rule_and_one_cluster() {
        let copy = prepare_copy(remote_secret(), &secret_resource(), &[], "east", "apps-secrets");

        assert!(copied_from(&copy, "east", "apps-secrets"));
        assert!(!copied_from(&copy, "west", "apps-secrets"));
        // a second rule over the same kind must leave this copy alone
        assert!(!copied_from(&copy, "east", "db-secrets"));

        let mut unowned = copy.clone();
        unowned.labels_mut().remove(SYNC_RULE_LABEL);
        assert!(!copied_from(&unowned, "east", "apps-secrets"));
    }

    #[test]
    fn copy_selector_requires_both_labels() {
        assert_eq!(
            copy_selector("east", "db-secrets"),
            "fleet.dev/source-cluster=east,fleet.dev/sync-rule=db-secrets"
        );
    }
}
