//! FleetCluster discovery
//!
//! Each FleetCluster object names a member cluster and a kubeconfig Secret.
//! While the object exists the cluster stays registered with the [`Manager`];
//! deleting it unregisters the cluster, which stops all of its controllers.
//! Editing the cluster ID or rotating the kubeconfig re-registers it.
//!
//! Every registered cluster also gets a `cluster-heartbeat` controller that
//! pings its API server and logs reachability changes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_clusters::{
    Cluster, ClusterHook, ManagedController, ManagedReconciler, Manager, ReconcilerBase,
};
use fleet_common::crd::FleetCluster;
use fleet_common::{Error, Result};
use k8s_openapi::api::core::v1::Secret;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{finalizer, Error as FinalizerError, Event as Finalizer};
use kube::{Api, Client, Config, ResourceExt};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[cfg(test)]
use mockall::automock;

/// Finalizer guaranteeing a deleted FleetCluster is unregistered
pub const CLUSTER_FINALIZER: &str = "fleet.dev/cluster";

/// Name of the per-cluster heartbeat controller
pub const HEARTBEAT_CONTROLLER: &str = "cluster-heartbeat";

/// Connect timeout for member cluster clients
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Read timeout for member cluster clients
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// How often a registered cluster's kubeconfig is checked for rotation
pub const KUBECONFIG_RECHECK_INTERVAL: Duration = Duration::from_secs(300);

/// Builds API clients for member clusters
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    /// Client for the cluster described by `cluster`
    async fn connect(&self, cluster: &FleetCluster) -> Result<Client>;

    /// Opaque token that changes whenever the connection details change
    async fn revision(&self, cluster: &FleetCluster) -> Result<String>;
}

/// Reads kubeconfigs from Secrets on the control plane
pub struct KubeconfigSecretConnector {
    client: Client,
    namespace: String,
}

impl KubeconfigSecretConnector {
    /// Read Secrets through `client`, defaulting to `namespace`
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    async fn secret(&self, cluster: &FleetCluster) -> Result<(String, Secret)> {
        let secret_ref = &cluster.spec.kubeconfig_secret_ref;
        let namespace = secret_ref
            .namespace
            .clone()
            .unwrap_or_else(|| self.namespace.clone());
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        let secret = secrets.get(&secret_ref.name).await?;
        Ok((namespace, secret))
    }
}

/// Build a client from kubeconfig YAML with member-cluster timeouts
pub async fn client_from_kubeconfig(yaml: &str) -> Result<Client> {
    let kubeconfig = Kubeconfig::from_yaml(yaml)
        .map_err(|e| Error::config(format!("invalid kubeconfig: {e}")))?;
    let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::config(format!("failed to load kubeconfig: {e}")))?;
    config.connect_timeout = Some(CONNECT_TIMEOUT);
    config.read_timeout = Some(READ_TIMEOUT);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("connector", format!("failed to create client: {e}"))
    })
}

#[async_trait]
impl ClusterConnector for KubeconfigSecretConnector {
    async fn connect(&self, cluster: &FleetCluster) -> Result<Client> {
        let secret_ref = &cluster.spec.kubeconfig_secret_ref;
        let (namespace, secret) = self.secret(cluster).await?;
        let data = secret
            .data
            .as_ref()
            .and_then(|d| d.get(&secret_ref.key))
            .ok_or_else(|| {
                Error::config(format!(
                    "secret {namespace}/{} has no key {}",
                    secret_ref.name, secret_ref.key
                ))
            })?;
        let yaml = std::str::from_utf8(&data.0)
            .map_err(|e| Error::serialization_for_kind("Secret", e.to_string()))?;
        client_from_kubeconfig(yaml).await
    }

    async fn revision(&self, cluster: &FleetCluster) -> Result<String> {
        let secret_ref = &cluster.spec.kubeconfig_secret_ref;
        let (namespace, secret) = self.secret(cluster).await?;
        Ok(format!(
            "{namespace}/{}#{}@{}",
            secret_ref.name,
            secret_ref.key,
            secret.resource_version().unwrap_or_default()
        ))
    }
}

/// What a FleetCluster object was last registered as
#[derive(Clone, Debug, PartialEq)]
struct Registration {
    cluster_id: String,
    revision: String,
}

/// Shared state for the FleetCluster controller
pub struct ClusterContext {
    client: Client,
    manager: Arc<Manager>,
    connector: Arc<dyn ClusterConnector>,
    /// Keyed by FleetCluster name
    registrations: Mutex<HashMap<String, Registration>>,
}

impl ClusterContext {
    /// Register clusters into `manager`, connecting through `connector`
    pub fn new(
        client: Client,
        manager: Arc<Manager>,
        connector: Arc<dyn ClusterConnector>,
    ) -> Self {
        Self {
            client,
            manager,
            connector,
            registrations: Mutex::new(HashMap::new()),
        }
    }
}

/// Reconcile one FleetCluster
pub async fn reconcile(cluster: Arc<FleetCluster>, ctx: Arc<ClusterContext>) -> Result<Action> {
    let api: Api<FleetCluster> = Api::all(ctx.client.clone());
    let result = finalizer(&api, CLUSTER_FINALIZER, cluster, |event| async {
        match event {
            Finalizer::Apply(cluster) => ensure_registered(&cluster, &ctx).await,
            Finalizer::Cleanup(cluster) => {
                ensure_unregistered(&cluster, &ctx).await;
                Ok(Action::await_change())
            }
        }
    })
    .await;

    match result {
        Ok(action) => Ok(action),
        Err(FinalizerError::ApplyFailed(e)) | Err(FinalizerError::CleanupFailed(e)) => Err(e),
        Err(e) => Err(Error::internal_with_context("finalizer", e.to_string())),
    }
}

/// Register the cluster, replacing a stale registration of the same object
///
/// A registration is stale once the cluster ID or the kubeconfig revision
/// differs from what it was made with.
pub async fn ensure_registered(cluster: &FleetCluster, ctx: &ClusterContext) -> Result<Action> {
    let name = cluster.name_any();
    let wanted = Registration {
        cluster_id: cluster.cluster_id(),
        revision: ctx.connector.revision(cluster).await?,
    };
    let recheck = Action::requeue(KUBECONFIG_RECHECK_INTERVAL);

    let previous = ctx.registrations.lock().get(&name).cloned();
    match previous {
        Some(previous) if previous == wanted && ctx.manager.get(&wanted.cluster_id).is_some() => {
            debug!(cluster = %wanted.cluster_id, "cluster already registered");
            return Ok(recheck);
        }
        Some(previous) => {
            info!(
                fleet_cluster = %name,
                old_id = %previous.cluster_id,
                new_id = %wanted.cluster_id,
                "cluster connection changed, re-registering"
            );
            ctx.registrations.lock().remove(&name);
            ctx.manager.unregister(&previous.cluster_id).await;
        }
        None if ctx.manager.get(&wanted.cluster_id).is_some() => {
            warn!(
                fleet_cluster = %name,
                cluster = %wanted.cluster_id,
                "cluster ID already registered by another FleetCluster"
            );
            return Ok(recheck);
        }
        None => {}
    }

    let client = ctx.connector.connect(cluster).await?;
    match ctx
        .manager
        .register(Cluster::new(&wanted.cluster_id, &name, client))
        .await
    {
        Ok(_) => {
            ctx.registrations.lock().insert(name, wanted);
            Ok(recheck)
        }
        Err(Error::DuplicateCluster { .. }) => Ok(recheck),
        Err(e) => Err(e),
    }
}

/// Drop whatever registration this FleetCluster made
pub async fn ensure_unregistered(cluster: &FleetCluster, ctx: &ClusterContext) {
    let previous = ctx.registrations.lock().remove(&cluster.name_any());
    if let Some(previous) = previous {
        ctx.manager.unregister(&previous.cluster_id).await;
    }
}

/// Requeue policy for failed FleetCluster reconciles
pub fn error_policy(
    cluster: Arc<FleetCluster>,
    error: &Error,
    _ctx: Arc<ClusterContext>,
) -> Action {
    error!(?error, cluster = %cluster.name_any(), "cluster reconciliation failed");
    if error.is_retryable() {
        Action::requeue(Duration::from_secs(5))
    } else {
        Action::requeue(Duration::from_secs(60))
    }
}

/// Periodically pings a member cluster's API server
pub struct HeartbeatReconciler {
    base: ReconcilerBase,
    interval: Duration,
    reachable: AtomicBool,
}

impl HeartbeatReconciler {
    /// Ping every `interval`; a zero interval disables pinging
    pub fn new(interval: Duration) -> Self {
        Self {
            base: ReconcilerBase::new(HEARTBEAT_CONTROLLER),
            interval,
            reachable: AtomicBool::new(true),
        }
    }

    async fn ping(&self, client: &Client) {
        match client.apiserver_version().await {
            Ok(info) => {
                if !self.reachable.swap(true, Ordering::SeqCst) {
                    info!(version = %info.git_version, "cluster reachable again");
                }
            }
            Err(e) => {
                if self.reachable.swap(false, Ordering::SeqCst) {
                    warn!(error = %e, "cluster unreachable");
                }
            }
        }
    }
}

#[async_trait]
impl ManagedReconciler for HeartbeatReconciler {
    fn base(&self) -> &ReconcilerBase {
        &self.base
    }

    async fn run(&self, scope: CancellationToken) -> Result<()> {
        if self.interval.is_zero() {
            scope.cancelled().await;
            return Ok(());
        }
        let client = self.base.client().ok_or_else(|| Error::MissingContext {
            reconciler: HEARTBEAT_CONTROLLER.to_string(),
        })?;

        loop {
            tokio::select! {
                _ = scope.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.interval) => self.ping(&client).await,
            }
        }
    }
}

/// After-add hook starting the heartbeat controller on each new cluster
pub struct HeartbeatHook {
    interval: Duration,
}

impl HeartbeatHook {
    /// Ping new clusters every `interval`
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

#[async_trait]
impl ClusterHook for HeartbeatHook {
    async fn call(&self, cluster: Arc<Cluster>) -> Result<()> {
        let reconciler = HeartbeatReconciler::new(self.interval);
        reconciler.base().set_client(cluster.client());
        cluster.add_controller(Arc::new(ManagedController::new(
            HEARTBEAT_CONTROLLER,
            Arc::new(reconciler),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_client;
    use std::sync::atomic::AtomicUsize;
    use fleet_clusters::ControllerState;
    use fleet_common::crd::{FleetClusterSpec, KubeconfigSecretRef};

    fn fleet_cluster(name: &str) -> FleetCluster {
        FleetCluster::new(
            name,
            FleetClusterSpec {
                cluster_id: String::new(),
                kubeconfig_secret_ref: KubeconfigSecretRef {
                    name: format!("{name}-kubeconfig"),
                    namespace: None,
                    key: "kubeconfig".to_string(),
                },
            },
        )
    }

    fn context(manager: &Arc<Manager>, connector: MockClusterConnector) -> ClusterContext {
        ClusterContext::new(test_client(), Arc::clone(manager), Arc::new(connector))
    }

    /// Connector whose kubeconfig never changes
    fn stable_connector() -> MockClusterConnector {
        let mut connector = MockClusterConnector::new();
        connector
            .expect_revision()
            .returning(|_| Ok("fleet-system/kubeconfig#kubeconfig@1".to_string()));
        connector.expect_connect().returning(|_| Ok(test_client()));
        connector
    }

    fn registered_ids(manager: &Manager) -> Vec<String> {
        manager.get_all().iter().map(|c| c.id().to_string()).collect()
    }

    #[tokio::test]
    async fn new_cluster_is_registered_with_a_heartbeat() {
        let manager = Arc::new(Manager::new());
        manager.add_on_after_add_hook(
            HEARTBEAT_CONTROLLER,
            Arc::new(HeartbeatHook::new(Duration::ZERO)),
        );
        let mut connector = MockClusterConnector::new();
        connector.expect_revision().returning(|_| Ok("v1".to_string()));
        connector
            .expect_connect()
            .times(1)
            .returning(|_| Ok(test_client()));
        let ctx = context(&manager, connector);

        let action = ensure_registered(&fleet_cluster("east"), &ctx).await.unwrap();
        assert_eq!(action, Action::requeue(KUBECONFIG_RECHECK_INTERVAL));
        let cluster = manager.get("east").unwrap();
        assert_eq!(cluster.name(), "east");
        let heartbeat = cluster.get_controller(HEARTBEAT_CONTROLLER).unwrap();
        assert_eq!(heartbeat.state(), ControllerState::Running);
        assert!(heartbeat.reconciler().as_rule_bound().is_none());

        // already registered: no second connect
        ensure_registered(&fleet_cluster("east"), &ctx).await.unwrap();
        manager.shutdown().await;
        assert!(heartbeat.is_stopped());
    }

    #[tokio::test]
    async fn connect_failure_leaves_registry_untouched() {
        let manager = Arc::new(Manager::new());
        let mut connector = MockClusterConnector::new();
        connector.expect_revision().returning(|_| Ok("v1".to_string()));
        connector
            .expect_connect()
            .returning(|_| Err(Error::config("secret has no key kubeconfig")));
        let ctx = context(&manager, connector);

        let err = ensure_registered(&fleet_cluster("east"), &ctx)
            .await
            .unwrap_err();
        assert!(err.is_permanent());
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn explicit_cluster_id_is_the_registry_key() {
        let manager = Arc::new(Manager::new());
        let ctx = context(&manager, stable_connector());

        let mut fc = fleet_cluster("east");
        fc.spec.cluster_id = "5d1c1a6e".to_string();
        ensure_registered(&fc, &ctx).await.unwrap();
        assert!(manager.get("5d1c1a6e").is_some());
        assert!(manager.get("east").is_none());
    }

    #[tokio::test]
    async fn cluster_id_edit_moves_the_registration() {
        let manager = Arc::new(Manager::new());
        let ctx = context(&manager, stable_connector());

        let mut fc = fleet_cluster("east");
        fc.spec.cluster_id = "id-a".to_string();
        ensure_registered(&fc, &ctx).await.unwrap();
        let first = manager.get("id-a").unwrap();

        fc.spec.cluster_id = "id-b".to_string();
        ensure_registered(&fc, &ctx).await.unwrap();
        assert_eq!(registered_ids(&manager), vec!["id-b"]);
        assert!(first.is_stopping());

        ensure_unregistered(&fc, &ctx).await;
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn rotated_kubeconfig_reconnects() {
        let manager = Arc::new(Manager::new());
        let mut connector = MockClusterConnector::new();
        let checks = AtomicUsize::new(0);
        connector.expect_revision().returning(move |_| {
            let revision = if checks.fetch_add(1, Ordering::SeqCst) < 2 { 1 } else { 2 };
            Ok(format!("fleet-system/east-kubeconfig#kubeconfig@{revision}"))
        });
        connector
            .expect_connect()
            .times(2)
            .returning(|_| Ok(test_client()));
        let ctx = context(&manager, connector);
        let fc = fleet_cluster("east");

        ensure_registered(&fc, &ctx).await.unwrap();
        let before = manager.get("east").unwrap();
        ensure_registered(&fc, &ctx).await.unwrap();
        assert!(Arc::ptr_eq(&before, &manager.get("east").unwrap()));

        ensure_registered(&fc, &ctx).await.unwrap();
        let after = manager.get("east").unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert!(before.is_stopping());
        assert_eq!(registered_ids(&manager), vec!["east"]);
    }

    #[tokio::test]
    async fn deleting_a_duplicate_leaves_the_owner_registered() {
        let manager = Arc::new(Manager::new());
        let ctx = context(&manager, stable_connector());

        let mut owner = fleet_cluster("east");
        owner.spec.cluster_id = "shared".to_string();
        let mut duplicate = fleet_cluster("east-again");
        duplicate.spec.cluster_id = "shared".to_string();

        ensure_registered(&owner, &ctx).await.unwrap();
        ensure_registered(&duplicate, &ctx).await.unwrap();
        ensure_unregistered(&duplicate, &ctx).await;
        assert_eq!(registered_ids(&manager), vec!["shared"]);

        ensure_unregistered(&owner, &ctx).await;
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn heartbeat_without_client_fails_when_pinging_is_enabled() {
        let reconciler = HeartbeatReconciler::new(Duration::from_secs(1));
        let err = reconciler.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::MissingContext { .. }));
    }

    #[tokio::test]
    async fn invalid_kubeconfig_is_a_config_error() {
        let Err(err) = client_from_kubeconfig("not: [a kubeconfig").await else {
            panic!("expected an error");
        };
        assert!(matches!(err, Error::Config { .. }));
    }
}
