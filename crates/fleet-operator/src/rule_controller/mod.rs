//! ResourceSyncRule reconciliation
//!
//! A rule maps to one sync controller per registered cluster, named after the
//! rule. For each cluster the reconciler:
//!
//! - creates the controller when none exists,
//! - replaces it when its rule spec differs (or it is not rule-bound): the
//!   old one is removed and fully stopped before the new one is added,
//! - leaves it alone when the spec is unchanged.
//!
//! A missing rule removes its controller from every cluster. One cluster
//! failing never blocks the others; the failures are reported together once
//! every cluster has been visited.

use std::sync::Arc;
use std::time::Duration;

use fleet_clusters::{Cluster, Manager};
use fleet_common::crd::ResourceSyncRule;
use fleet_common::events::{actions, reasons, EventPublisher};
use fleet_common::{Error, Result};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::runtime::finalizer::{finalizer, Error as FinalizerError, Event as Finalizer};
use kube::{Api, Client, Resource, ResourceExt};
use tracing::{debug, error, info, warn};

use crate::rules::RuleSource;
use crate::sync::ControllerFactory;


/// Finalizer guaranteeing controllers are removed before a rule disappears
pub const RULE_FINALIZER: &str = "fleet.dev/resource-sync-rule";

/// Default time to wait for a replaced controller to stop
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Requeue delay after a transient failure
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Requeue delay after a failure that needs a spec change
const PERMANENT_RETRY_DELAY: Duration = Duration::from_secs(300);

/// Per-cluster outcome of one reconcile, as cluster IDs
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncSummary {
    /// Clusters that got a new controller
    pub created: Vec<String>,
    /// Clusters whose controller was replaced after a spec change
    pub replaced: Vec<String>,
    /// Clusters already running the current spec
    pub unchanged: Vec<String>,
    /// Clusters whose controller was removed
    pub removed: Vec<String>,
    /// Clusters that failed
    pub failed: Vec<String>,
}

impl SyncSummary {
    /// Whether any controller was created, replaced or removed
    pub fn changed(&self) -> bool {
        !(self.created.is_empty() && self.replaced.is_empty() && self.removed.is_empty())
    }
}

enum ClusterOutcome {
    Created,
    Replaced,
    Unchanged,
}

/// Fans rules out to every registered cluster
pub struct RuleReconciler {
    manager: Arc<Manager>,
    rules: Arc<dyn RuleSource>,
    factory: Arc<dyn ControllerFactory>,
    stop_timeout: Duration,
}

impl RuleReconciler {
    /// Create a reconciler over `manager`'s clusters
    pub fn new(
        manager: Arc<Manager>,
        rules: Arc<dyn RuleSource>,
        factory: Arc<dyn ControllerFactory>,
    ) -> Self {
        Self {
            manager,
            rules,
            factory,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    /// Bound the wait for a replaced controller to stop
    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    /// Reconcile the rule called `name` against every cluster
    pub async fn reconcile_rule(&self, name: &str) -> Result<SyncSummary> {
        match self.rules.get(name).await? {
            Some(rule) => self.apply(&rule).await,
            None => Ok(self.remove_everywhere(name)),
        }
    }

    /// Remove the controller called `name` from every cluster
    ///
    /// Does not wait for the controllers to stop.
    pub fn remove_everywhere(&self, name: &str) -> SyncSummary {
        let mut summary = SyncSummary::default();
        for cluster in self.manager.get_all() {
            if cluster.remove_controller_by_name(name).is_some() {
                summary.removed.push(cluster.id().to_string());
            }
        }
        if !summary.removed.is_empty() {
            info!(rule = %name, clusters = ?summary.removed, "removed rule controllers");
        }
        summary
    }

    /// Converge every cluster on `rule`
    ///
    /// Returns a permanent validation error for a malformed rule, and a
    /// retryable `PartialSync` error if any cluster failed.
    pub async fn apply(&self, rule: &ResourceSyncRule) -> Result<SyncSummary> {
        rule.validate()?;
        let name = rule.name_any();

        let mut summary = SyncSummary::default();
        for cluster in self.manager.get_all() {
            let id = cluster.id().to_string();
            match self.sync_cluster(&cluster, rule).await {
                Ok(ClusterOutcome::Created) => summary.created.push(id),
                Ok(ClusterOutcome::Replaced) => summary.replaced.push(id),
                Ok(ClusterOutcome::Unchanged) => summary.unchanged.push(id),
                Err(e) => {
                    warn!(rule = %name, cluster = %id, error = %e, "failed to sync rule");
                    summary.failed.push(id);
                }
            }
        }

        debug!(
            rule = %name,
            created = summary.created.len(),
            replaced = summary.replaced.len(),
            unchanged = summary.unchanged.len(),
            failed = summary.failed.len(),
            "rule reconciled"
        );
        if !summary.failed.is_empty() {
            return Err(Error::PartialSync {
                rule: name,
                clusters: summary.failed,
            });
        }
        Ok(summary)
    }

    async fn sync_cluster(
        &self,
        cluster: &Arc<Cluster>,
        rule: &ResourceSyncRule,
    ) -> Result<ClusterOutcome> {
        let name = rule.name_any();
        let Some(existing) = cluster.get_controller(&name) else {
            cluster.add_controller(self.factory.build(cluster, rule)?)?;
            info!(rule = %name, cluster = %cluster.id(), "controller created");
            return Ok(ClusterOutcome::Created);
        };

        let current = existing
            .reconciler()
            .as_rule_bound()
            .map(|bound| bound.current_rule().spec.clone());
        if current.as_ref() == Some(&rule.spec) {
            return Ok(ClusterOutcome::Unchanged);
        }

        debug!(
            rule = %name,
            cluster = %cluster.id(),
            rule_bound = current.is_some(),
            "spec changed, replacing controller"
        );
        cluster.remove_controller(&existing);
        if tokio::time::timeout(self.stop_timeout, existing.stopped())
            .await
            .is_err()
        {
            return Err(Error::StopTimeout {
                cluster: cluster.id().to_string(),
                controller: name,
                timeout_secs: self.stop_timeout.as_secs(),
            });
        }

        cluster.add_controller(self.factory.build(cluster, rule)?)?;
        info!(rule = %name, cluster = %cluster.id(), "controller replaced");
        Ok(ClusterOutcome::Replaced)
    }
}

/// Shared state for the rule controller
pub struct RuleContext {
    /// Control-plane client
    pub client: Client,
    /// Fan-out logic
    pub reconciler: RuleReconciler,
    /// Event publisher
    pub events: Arc<dyn EventPublisher>,
}

impl RuleContext {
    /// Bundle the rule controller's dependencies
    pub fn new(
        client: Client,
        reconciler: RuleReconciler,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            client,
            reconciler,
            events,
        }
    }
}

/// Reconcile one ResourceSyncRule
///
/// Applies go through [`RuleReconciler::reconcile_rule`] so the rule is read
/// fresh; deletion is handled by the finalizer's cleanup step.
pub async fn reconcile(rule: Arc<ResourceSyncRule>, ctx: Arc<RuleContext>) -> Result<Action> {
    let api: Api<ResourceSyncRule> = Api::all(ctx.client.clone());
    let result = finalizer(&api, RULE_FINALIZER, rule, |event| async {
        match event {
            Finalizer::Apply(rule) => apply_rule(&rule, &ctx).await,
            Finalizer::Cleanup(rule) => cleanup_rule(&rule, &ctx).await,
        }
    })
    .await;

    match result {
        Ok(action) => Ok(action),
        Err(FinalizerError::ApplyFailed(e)) | Err(FinalizerError::CleanupFailed(e)) => Err(e),
        Err(e) => Err(Error::internal_with_context("finalizer", e.to_string())),
    }
}

async fn apply_rule(rule: &ResourceSyncRule, ctx: &RuleContext) -> Result<Action> {
    let name = rule.name_any();
    let resource_ref = rule.object_ref(&());
    match ctx.reconciler.reconcile_rule(&name).await {
        Ok(summary) => {
            for (reason, clusters) in [
                (reasons::CONTROLLER_CREATED, &summary.created),
                (reasons::CONTROLLER_REPLACED, &summary.replaced),
            ] {
                if !clusters.is_empty() {
                    ctx.events
                        .publish(
                            &resource_ref,
                            EventType::Normal,
                            reason,
                            actions::SYNC,
                            Some(format!("clusters: {}", clusters.join(", "))),
                        )
                        .await;
                }
            }
            Ok(Action::await_change())
        }
        Err(e) if e.is_permanent() => {
            // Retrying cannot help until the rule is edited
            warn!(rule = %name, error = %e, "rule rejected");
            let reason = match &e {
                Error::Validation { .. } => reasons::VALIDATION_FAILED,
                _ => reasons::SYNC_FAILED,
            };
            ctx.events
                .publish(
                    &resource_ref,
                    EventType::Warning,
                    reason,
                    actions::SYNC,
                    Some(e.to_string()),
                )
                .await;
            Ok(Action::await_change())
        }
        Err(e) => {
            ctx.events
                .publish(
                    &resource_ref,
                    EventType::Warning,
                    reasons::SYNC_FAILED,
                    actions::SYNC,
                    Some(e.to_string()),
                )
                .await;
            Err(e)
        }
    }
}

async fn cleanup_rule(rule: &ResourceSyncRule, ctx: &RuleContext) -> Result<Action> {
    let summary = ctx.reconciler.remove_everywhere(&rule.name_any());
    if !summary.removed.is_empty() {
        ctx.events
            .publish(
                &rule.object_ref(&()),
                EventType::Normal,
                reasons::CONTROLLERS_REMOVED,
                actions::CLEANUP,
                Some(format!("clusters: {}", summary.removed.join(", "))),
            )
            .await;
    }
    Ok(Action::await_change())
}

/// Requeue policy for failed rule reconciles
pub fn error_policy(
    rule: Arc<ResourceSyncRule>,
    error: &Error,
    _ctx: Arc<RuleContext>,
) -> Action {
    error!(
        ?error,
        rule = %rule.name_any(),
        cluster = error.cluster(),
        "rule reconciliation failed"
    );
    requeue_after(error)
}

fn requeue_after(error: &Error) -> Action {
    if error.is_retryable() {
        Action::requeue(RETRY_DELAY)
    } else {
        Action::requeue(PERMANENT_RETRY_DELAY)
    }
}
