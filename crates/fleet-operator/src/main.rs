//! Fleet sync operator - fans ResourceSyncRules out to every member cluster

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt, ResourceExt};

use fleet_clusters::Manager;
use fleet_common::config::Configuration;
use fleet_common::crd::{FleetCluster, ResourceSyncRule};
use fleet_common::events::{EventPublisher, KubeEventPublisher};
use fleet_common::telemetry::init_logging;
use fleet_common::FIELD_MANAGER;
use fleet_operator::cli::Cli;
use fleet_operator::cluster_controller::{
    ClusterContext, HeartbeatHook, KubeconfigSecretConnector, HEARTBEAT_CONTROLLER,
};
use fleet_operator::controller_runner::{build_cluster_controller, build_rule_controller};
use fleet_operator::rule_controller::{RuleContext, RuleReconciler};
use fleet_operator::rules::{KubeRuleSource, RuleSource};
use fleet_operator::sync::{DynamicObjectSyncer, SyncControllerBuilder};
use fleet_operator::trigger::ClusterJoinTrigger;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crds = [ResourceSyncRule::crd(), FleetCluster::crd()];
        for crd in &crds {
            let yaml = serde_yaml::to_string(crd)
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("---\n{yaml}");
        }
        return Ok(());
    }

    let config = cli.configuration();
    config.validate()?;
    if cli.dump_config {
        print!("{}", config.to_yaml()?);
        return Ok(());
    }

    init_logging(&config.logging)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting fleet operator");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;
    ensure_crds_installed(&client).await?;

    run_controllers(client, config).await;
    Ok(())
}

/// Install or update the operator's CRDs with server-side apply
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in [ResourceSyncRule::crd(), FleetCluster::crd()] {
        let name = crd.name_any();
        tracing::info!(crd = %name, "Installing CRD");
        crds.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to install CRD {}: {}", name, e))?;
    }
    Ok(())
}

/// Wire the registry, hooks and controllers, then run until signalled
async fn run_controllers(client: Client, config: Configuration) {
    let manager = Arc::new(Manager::with_stop_grace(Duration::from_secs(
        config.cluster_controller.stop_grace_seconds,
    )));
    let rules: Arc<dyn RuleSource> = Arc::new(KubeRuleSource::new(client.clone()));
    let events: Arc<dyn EventPublisher> =
        Arc::new(KubeEventPublisher::new(client.clone(), FIELD_MANAGER));

    let (trigger, requests) = ClusterJoinTrigger::new(Arc::clone(&rules));
    trigger.install(&manager);
    manager.add_on_after_add_hook(
        HEARTBEAT_CONTROLLER,
        Arc::new(HeartbeatHook::new(Duration::from_secs(
            config.cluster_controller.refresh_interval_seconds,
        ))),
    );

    let syncer = Arc::new(DynamicObjectSyncer::new(client.clone()));
    let factory = Arc::new(
        SyncControllerBuilder::new(&config.sync_controller, syncer)
            .with_recorder(Arc::clone(&events)),
    );
    let reconciler = RuleReconciler::new(Arc::clone(&manager), rules, factory)
        .with_stop_timeout(Duration::from_secs(
            config.sync_controller.stop_timeout_seconds,
        ));

    let rule_ctx = Arc::new(RuleContext::new(client.clone(), reconciler, events));
    let cluster_ctx = Arc::new(ClusterContext::new(
        client.clone(),
        Arc::clone(&manager),
        Arc::new(KubeconfigSecretConnector::new(
            client.clone(),
            config.namespace.clone(),
        )),
    ));

    tracing::info!("Starting controllers");
    let controllers = vec![
        build_rule_controller(
            client.clone(),
            rule_ctx,
            requests,
            config.sync_controller.worker_count,
        ),
        build_cluster_controller(client, cluster_ctx, config.cluster_controller.worker_count),
    ];
    futures::future::join_all(controllers).await;

    tracing::info!("Controllers stopped, shutting down clusters");
    manager.shutdown().await;
}
