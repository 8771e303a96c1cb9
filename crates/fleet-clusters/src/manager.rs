//! Cluster registry
//!
//! The [`Manager`] owns every registered [`Cluster`] and runs named hooks when
//! clusters join or leave. Hooks run in registration order; re-adding a hook
//! under an existing name replaces it in place. A failing hook is logged and
//! never undoes the registration it was reacting to.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_common::{Error, Result};
use futures::future::join_all;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cluster::Cluster;

/// Default time a leaving cluster gets to stop its controllers
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(30);

/// Callback invoked when a cluster joins or leaves the registry
#[async_trait]
pub trait ClusterHook: Send + Sync {
    /// React to `cluster`; errors are logged by the registry
    async fn call(&self, cluster: Arc<Cluster>) -> Result<()>;
}

#[derive(Clone)]
struct NamedHook {
    name: String,
    hook: Arc<dyn ClusterHook>,
}

fn upsert_hook(hooks: &RwLock<Vec<NamedHook>>, name: String, hook: Arc<dyn ClusterHook>) {
    let mut hooks = hooks.write();
    match hooks.iter_mut().find(|h| h.name == name) {
        Some(existing) => existing.hook = hook,
        None => hooks.push(NamedHook { name, hook }),
    }
}

async fn run_hooks(kind: &str, hooks: Vec<NamedHook>, cluster: &Arc<Cluster>) {
    for NamedHook { name, hook } in hooks {
        if let Err(e) = hook.call(Arc::clone(cluster)).await {
            warn!(
                cluster = %cluster.id(),
                hook = %name,
                kind,
                error = %e,
                "cluster hook failed"
            );
        }
    }
}

/// Registry of fleet members
pub struct Manager {
    scope: CancellationToken,
    clusters: RwLock<BTreeMap<String, Arc<Cluster>>>,
    after_add: RwLock<Vec<NamedHook>>,
    before_remove: RwLock<Vec<NamedHook>>,
    stop_grace: Duration,
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

impl Manager {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::with_stop_grace(DEFAULT_STOP_GRACE)
    }

    /// Create an empty registry that waits `stop_grace` for leaving clusters
    pub fn with_stop_grace(stop_grace: Duration) -> Self {
        Self {
            scope: CancellationToken::new(),
            clusters: RwLock::new(BTreeMap::new()),
            after_add: RwLock::new(Vec::new()),
            before_remove: RwLock::new(Vec::new()),
            stop_grace,
        }
    }

    /// Registry-wide scope, cancelled on shutdown
    pub fn scope(&self) -> &CancellationToken {
        &self.scope
    }

    /// Add a cluster and run the after-add hooks
    ///
    /// Fails without side effects if the ID is taken or the registry is
    /// shutting down.
    pub async fn register(&self, cluster: Cluster) -> Result<Arc<Cluster>> {
        let cluster = Arc::new(cluster);
        {
            // shutdown() cancels under this guard
            let mut clusters = self.clusters.write();
            if self.scope.is_cancelled() {
                return Err(Error::internal_with_context(
                    "registry",
                    format!("cannot register {} during shutdown", cluster.id()),
                ));
            }
            if clusters.contains_key(cluster.id()) {
                return Err(Error::DuplicateCluster {
                    cluster: cluster.id().to_string(),
                });
            }
            clusters.insert(cluster.id().to_string(), Arc::clone(&cluster));
        }
        info!(cluster = %cluster.id(), name = %cluster.name(), "cluster registered");

        let hooks = self.after_add.read().clone();
        run_hooks("after-add", hooks, &cluster).await;
        Ok(cluster)
    }

    /// Run the before-remove hooks, drop the cluster and stop its controllers
    ///
    /// Returns `false` for an unknown ID.
    pub async fn unregister(&self, id: &str) -> bool {
        let Some(cluster) = self.get(id) else {
            return false;
        };

        let hooks = self.before_remove.read().clone();
        run_hooks("before-remove", hooks, &cluster).await;

        let removed = {
            let mut clusters = self.clusters.write();
            match clusters.get(id) {
                Some(current) if Arc::ptr_eq(current, &cluster) => clusters.remove(id),
                _ => None,
            }
        };
        let Some(cluster) = removed else {
            // Someone else unregistered it while the hooks ran
            return false;
        };

        cluster.stop(self.stop_grace).await;
        info!(cluster = %id, "cluster unregistered");
        true
    }

    /// Cluster with this ID
    pub fn get(&self, id: &str) -> Option<Arc<Cluster>> {
        self.clusters.read().get(id).cloned()
    }

    /// Point-in-time copy of every cluster, ordered by ID
    pub fn get_all(&self) -> Vec<Arc<Cluster>> {
        self.clusters.read().values().cloned().collect()
    }

    /// Number of registered clusters
    pub fn len(&self) -> usize {
        self.clusters.read().len()
    }

    /// Whether no cluster is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add or replace a hook run after a cluster is registered
    pub fn add_on_after_add_hook(&self, name: impl Into<String>, hook: Arc<dyn ClusterHook>) {
        upsert_hook(&self.after_add, name.into(), hook);
    }

    /// Add or replace a hook run before a cluster is unregistered
    pub fn add_on_before_remove_hook(&self, name: impl Into<String>, hook: Arc<dyn ClusterHook>) {
        upsert_hook(&self.before_remove, name.into(), hook);
    }

    /// Cancel the registry scope and stop every cluster
    ///
    /// Hooks are not run; this is process teardown, not membership change.
    pub async fn shutdown(&self) {
        let clusters: Vec<_> = {
            let mut clusters = self.clusters.write();
            self.scope.cancel();
            std::mem::take(&mut *clusters).into_values().collect()
        };
        info!(clusters = clusters.len(), "stopping all clusters");
        join_all(clusters.iter().map(|c| c.stop(self.stop_grace))).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::tests::test_cluster;
    use crate::controller::tests::idle_controller;
    use parking_lot::Mutex;

    /// Hook recording every call as "<tag>:<cluster>"
    struct Recorder {
        tag: &'static str,
        calls: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    impl Recorder {
        fn new(tag: &'static str, calls: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                tag,
                calls: Arc::clone(calls),
                fail: false,
            })
        }
    }

    #[async_trait]
    impl ClusterHook for Recorder {
        async fn call(&self, cluster: Arc<Cluster>) -> Result<()> {
            self.calls
                .lock()
                .push(format!("{}:{}", self.tag, cluster.id()));
            if self.fail {
                return Err(Error::internal("hook failed"));
            }
            Ok(())
        }
    }

    /// Hook that checks the cluster is still registered when it runs
    struct StillRegistered {
        manager: std::sync::Weak<Manager>,
        seen: Arc<Mutex<Option<bool>>>,
    }

    #[async_trait]
    impl ClusterHook for StillRegistered {
        async fn call(&self, cluster: Arc<Cluster>) -> Result<()> {
            let registered = self
                .manager
                .upgrade()
                .is_some_and(|m| m.get(cluster.id()).is_some());
            *self.seen.lock() = Some(registered);
            Ok(())
        }
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected_without_side_effects() {
        let manager = Manager::new();
        let calls = Arc::new(Mutex::new(Vec::new()));
        manager.add_on_after_add_hook("record", Recorder::new("add", &calls));

        let first = manager.register(test_cluster("east")).await.unwrap();
        let err = manager.register(test_cluster("east")).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateCluster { .. }));

        assert_eq!(manager.len(), 1);
        assert!(Arc::ptr_eq(&manager.get("east").unwrap(), &first));
        assert_eq!(*calls.lock(), vec!["add:east"]);
    }

    #[tokio::test]
    async fn hooks_run_in_order_and_same_name_replaces() {
        let manager = Manager::new();
        let calls = Arc::new(Mutex::new(Vec::new()));
        manager.add_on_after_add_hook("first", Recorder::new("one", &calls));
        manager.add_on_after_add_hook("second", Recorder::new("two", &calls));
        manager.add_on_after_add_hook("first", Recorder::new("uno", &calls));

        manager.register(test_cluster("east")).await.unwrap();
        assert_eq!(*calls.lock(), vec!["uno:east", "two:east"]);
    }

    #[tokio::test]
    async fn failing_hook_does_not_undo_registration() {
        let manager = Manager::new();
        let calls = Arc::new(Mutex::new(Vec::new()));
        manager.add_on_after_add_hook(
            "broken",
            Arc::new(Recorder {
                tag: "broken",
                calls: Arc::clone(&calls),
                fail: true,
            }),
        );
        manager.add_on_after_add_hook("record", Recorder::new("add", &calls));

        manager.register(test_cluster("east")).await.unwrap();
        assert!(manager.get("east").is_some());
        assert_eq!(*calls.lock(), vec!["broken:east", "add:east"]);
    }

    #[tokio::test]
    async fn unregister_runs_hooks_before_removal_and_stops_controllers() {
        let manager = Arc::new(Manager::new());
        let seen = Arc::new(Mutex::new(None));
        manager.add_on_before_remove_hook(
            "check",
            Arc::new(StillRegistered {
                manager: Arc::downgrade(&manager),
                seen: Arc::clone(&seen),
            }),
        );

        let cluster = manager.register(test_cluster("east")).await.unwrap();
        let ctrl = idle_controller("sync-secrets");
        cluster.add_controller(Arc::clone(&ctrl)).unwrap();

        assert!(manager.unregister("east").await);
        assert_eq!(*seen.lock(), Some(true));
        assert!(manager.get("east").is_none());
        assert!(ctrl.is_stopped());
        assert!(cluster.is_stopping());
    }

    #[tokio::test]
    async fn unregister_of_unknown_id_is_a_no_op() {
        let manager = Manager::new();
        let calls = Arc::new(Mutex::new(Vec::new()));
        manager.add_on_before_remove_hook("record", Recorder::new("remove", &calls));

        assert!(!manager.unregister("nowhere").await);
        assert!(calls.lock().is_empty());
    }

    #[tokio::test]
    async fn get_all_is_a_snapshot_in_id_order() {
        let manager = Manager::new();
        manager.register(test_cluster("west")).await.unwrap();
        manager.register(test_cluster("east")).await.unwrap();

        let snapshot = manager.get_all();
        manager.unregister("west").await;

        let ids: Vec<_> = snapshot.iter().map(|c| c.id().to_string()).collect();
        assert_eq!(ids, vec!["east", "west"]);
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn shutdown_stops_everything_and_rejects_new_clusters() {
        let manager = Manager::new();
        let cluster = manager.register(test_cluster("east")).await.unwrap();
        let ctrl = idle_controller("sync-secrets");
        cluster.add_controller(Arc::clone(&ctrl)).unwrap();

        manager.shutdown().await;
        assert!(ctrl.is_stopped());
        assert!(manager.is_empty());
        assert!(manager.scope().is_cancelled());
        assert!(manager.register(test_cluster("west")).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn register_racing_shutdown_leaves_nothing_behind() {
        for i in 0..200 {
            let manager = Arc::new(Manager::new());
            let barrier = Arc::new(tokio::sync::Barrier::new(2));

            let registering = {
                let (manager, barrier) = (Arc::clone(&manager), Arc::clone(&barrier));
                tokio::spawn(async move {
                    barrier.wait().await;
                    manager.register(test_cluster(&format!("c{i}"))).await
                })
            };
            let stopping = {
                let (manager, barrier) = (Arc::clone(&manager), Arc::clone(&barrier));
                tokio::spawn(async move {
                    barrier.wait().await;
                    manager.shutdown().await;
                })
            };

            stopping.await.unwrap();
            if let Ok(cluster) = registering.await.unwrap() {
                assert!(cluster.is_stopping());
            }
            assert!(manager.is_empty(), "cluster registered after shutdown");
        }
    }
}
