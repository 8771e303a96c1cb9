//! Per-cluster sync controllers
//!
//! Each (rule, cluster) pair runs one [`SyncReconciler`] inside a managed
//! controller. Every resync interval it lists the objects the rule selects on
//! the cluster and hands each one, rate limited per object key, to a
//! [`ResourceSyncer`] that performs the actual copy.

mod dynamic;

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use fleet_clusters::{
    Cluster, ManagedController, ManagedReconciler, RateLimiter, ReconcilerBase, RuleBound,
};
use fleet_common::config::{RateLimitConfig, SyncControllerConfig};
use fleet_common::crd::ResourceSyncRule;
use fleet_common::events::{actions, reasons, EventPublisher};
use fleet_common::Result;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

pub use dynamic::DynamicObjectSyncer;

/// Namespace and name of one object
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Namespace; `None` for cluster-scoped objects
    pub namespace: Option<String>,
    /// Name
    pub name: String,
}

impl ObjectKey {
    /// Key of the object described by `meta`
    pub fn from_meta(meta: &ObjectMeta) -> Self {
        Self {
            namespace: meta.namespace.clone(),
            name: meta.name.clone().unwrap_or_default(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}/{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Copies objects selected by a rule from a member cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceSyncer: Send + Sync {
    /// Keys to process this pass: selected source objects plus stale copies
    async fn list_keys(
        &self,
        cluster: &Cluster,
        rule: &ResourceSyncRule,
    ) -> Result<Vec<ObjectKey>>;

    /// Copy one object; a source object that is gone removes its copy
    async fn sync_object(
        &self,
        cluster: &Cluster,
        rule: &ResourceSyncRule,
        key: &ObjectKey,
    ) -> Result<()>;
}

/// Builds the managed controller for a (cluster, rule) pair
pub trait ControllerFactory: Send + Sync {
    /// Build an unstarted controller named after the rule
    fn build(
        &self,
        cluster: &Arc<Cluster>,
        rule: &ResourceSyncRule,
    ) -> Result<Arc<ManagedController>>;
}

#[derive(Debug, Default, PartialEq, Eq)]
struct PassStats {
    synced: usize,
    limited: usize,
    failed: usize,
}

/// Runs one rule against one cluster
pub struct SyncReconciler {
    base: ReconcilerBase,
    rule: ResourceSyncRule,
    cluster: Weak<Cluster>,
    limiter: RateLimiter,
    syncer: Arc<dyn ResourceSyncer>,
    resync_interval: Duration,
}

impl SyncReconciler {
    /// Create a reconciler with its own rate limiter
    pub fn new(
        cluster: &Arc<Cluster>,
        rule: ResourceSyncRule,
        limiter: RateLimiter,
        syncer: Arc<dyn ResourceSyncer>,
        resync_interval: Duration,
    ) -> Self {
        Self {
            base: ReconcilerBase::new(rule.name_any()),
            rule,
            cluster: Arc::downgrade(cluster),
            limiter,
            syncer,
            resync_interval,
        }
    }

    async fn sync_pass(&self, cluster: &Cluster, scope: &CancellationToken) -> Result<PassStats> {
        let keys = self.syncer.list_keys(cluster, &self.rule).await?;
        let mut stats = PassStats::default();
        for key in keys {
            if scope.is_cancelled() {
                break;
            }
            if !self.limiter.allow(&key.to_string()) {
                stats.limited += 1;
                continue;
            }
            match self.syncer.sync_object(cluster, &self.rule, &key).await {
                Ok(()) => stats.synced += 1,
                Err(e) => {
                    stats.failed += 1;
                    warn!(object = %key, error = %e, "failed to sync object");
                }
            }
        }
        Ok(stats)
    }

    async fn report_failure(&self, note: String) {
        if let Some(recorder) = self.base.recorder() {
            recorder
                .publish(
                    &self.rule.object_ref(&()),
                    EventType::Warning,
                    reasons::SYNC_FAILED,
                    actions::SYNC,
                    Some(note),
                )
                .await;
        }
    }
}

#[async_trait]
impl ManagedReconciler for SyncReconciler {
    fn base(&self) -> &ReconcilerBase {
        &self.base
    }

    fn start(&self) -> Result<()> {
        self.rule.validate()
    }

    async fn run(&self, scope: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(self.resync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = scope.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }
            let Some(cluster) = self.cluster.upgrade() else {
                debug!("cluster is gone, leaving work loop");
                return Ok(());
            };

            tokio::select! {
                _ = scope.cancelled() => return Ok(()),
                result = self.sync_pass(&cluster, &scope) => match result {
                    Ok(stats) => debug!(
                        synced = stats.synced,
                        limited = stats.limited,
                        failed = stats.failed,
                        "sync pass finished"
                    ),
                    Err(e) => {
                        warn!(error = %e, "sync pass failed");
                        self.report_failure(format!("cluster {}: {e}", cluster.id())).await;
                    }
                },
            }
        }
    }

    fn as_rule_bound(&self) -> Option<&dyn RuleBound> {
        Some(self)
    }
}

impl RuleBound for SyncReconciler {
    fn current_rule(&self) -> &ResourceSyncRule {
        &self.rule
    }
}

/// Builds sync controllers, each with a fresh rate limiter
pub struct SyncControllerBuilder {
    rate_limit: RateLimitConfig,
    resync_interval: Duration,
    syncer: Arc<dyn ResourceSyncer>,
    recorder: Option<Arc<dyn EventPublisher>>,
}

impl SyncControllerBuilder {
    /// Create a builder from the sync controller settings
    pub fn new(config: &SyncControllerConfig, syncer: Arc<dyn ResourceSyncer>) -> Self {
        Self {
            rate_limit: config.rate_limit,
            resync_interval: Duration::from_secs(config.resync_interval_seconds),
            syncer,
            recorder: None,
        }
    }

    /// Publish sync failures as events on the rule
    pub fn with_recorder(mut self, recorder: Arc<dyn EventPublisher>) -> Self {
        self.recorder = Some(recorder);
        self
    }
}

impl ControllerFactory for SyncControllerBuilder {
    fn build(
        &self,
        cluster: &Arc<Cluster>,
        rule: &ResourceSyncRule,
    ) -> Result<Arc<ManagedController>> {
        let limiter = RateLimiter::from_config(&self.rate_limit)?;
        let reconciler = SyncReconciler::new(
            cluster,
            rule.clone(),
            limiter,
            Arc::clone(&self.syncer),
            self.resync_interval,
        );
        reconciler.base().set_client(cluster.client());
        if let Some(recorder) = &self.recorder {
            reconciler.base().set_recorder(Arc::clone(recorder));
        }
        Ok(Arc::new(ManagedController::new(
            rule.name_any(),
            Arc::new(reconciler),
        )))
    }
}
