//! Controller runner - builds the operator's controller futures
//!
//! Each `build_*` function returns a boxed future the caller can join. The
//! futures complete after SIGTERM/SIGINT once in-flight reconciles finish.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use fleet_common::crd::{FleetCluster, ResourceSyncRule};
use futures::StreamExt;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use crate::cluster_controller::{self, ClusterContext};
use crate::rule_controller::{self, RuleContext};
use crate::trigger::RuleRequests;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// A controller future ready to be awaited
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Build the ResourceSyncRule controller
///
/// Besides its own watch it reconciles every rule name arriving on
/// `requests`, which the cluster-join trigger feeds.
pub fn build_rule_controller(
    client: Client,
    ctx: Arc<RuleContext>,
    requests: RuleRequests,
    workers: u16,
) -> ControllerFuture {
    let rules: Api<ResourceSyncRule> = Api::all(client);
    tracing::info!(workers, "- ResourceSyncRule controller");

    Box::pin(
        Controller::new(rules, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
            .with_config(ControllerConfig::default().concurrency(workers))
            .reconcile_on(requests.into_object_refs())
            .shutdown_on_signal()
            .run(
                rule_controller::reconcile,
                rule_controller::error_policy,
                ctx,
            )
            .for_each(log_reconcile_result("ResourceSyncRule")),
    )
}

/// Build the FleetCluster discovery controller
pub fn build_cluster_controller(
    client: Client,
    ctx: Arc<ClusterContext>,
    workers: u16,
) -> ControllerFuture {
    let clusters: Api<FleetCluster> = Api::all(client);
    tracing::info!(workers, "- FleetCluster controller");

    Box::pin(
        Controller::new(
            clusters,
            WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
        )
        .with_config(ControllerConfig::default().concurrency(workers))
        .shutdown_on_signal()
        .run(
            cluster_controller::reconcile,
            cluster_controller::error_policy,
            ctx,
        )
        .for_each(log_reconcile_result("FleetCluster")),
    )
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
