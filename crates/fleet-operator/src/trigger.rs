//! Cluster-join trigger for the rule controller
//!
//! Registering a cluster does not change any ResourceSyncRule, so the rule
//! watch never fires for it. This hook closes the gap: on every join it lists
//! all rules and queues one reconcile request per rule name, which the rule
//! controller consumes alongside its watch events.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use fleet_clusters::{Cluster, ClusterHook, Manager};
use fleet_common::crd::ResourceSyncRule;
use fleet_common::Result;
use futures::{Stream, StreamExt};
use kube::runtime::reflector::ObjectRef;
use kube::ResourceExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

use crate::rules::RuleSource;

/// Name the hook is registered under
pub const TRIGGER_HOOK_NAME: &str = "trigger-resource-sync-rule-reconcile";

/// Registry hook queueing every rule when a cluster joins
pub struct ClusterJoinTrigger {
    rules: Arc<dyn RuleSource>,
    tx: mpsc::UnboundedSender<String>,
}

/// Receiving half: rule names to reconcile
pub struct RuleRequests {
    inner: UnboundedReceiverStream<String>,
}

impl ClusterJoinTrigger {
    /// Create the hook and the stream it feeds
    pub fn new(rules: Arc<dyn RuleSource>) -> (Self, RuleRequests) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self { rules, tx },
            RuleRequests {
                inner: UnboundedReceiverStream::new(rx),
            },
        )
    }

    /// Register as an after-add hook on `manager`
    pub fn install(self, manager: &Manager) {
        manager.add_on_after_add_hook(TRIGGER_HOOK_NAME, Arc::new(self));
    }
}

#[async_trait]
impl ClusterHook for ClusterJoinTrigger {
    async fn call(&self, cluster: Arc<Cluster>) -> Result<()> {
        let rules = self.rules.list().await?;
        for rule in &rules {
            if self.tx.send(rule.name_any()).is_err() {
                warn!(cluster = %cluster.id(), "rule controller is gone, dropping join trigger");
                return Ok(());
            }
        }
        debug!(cluster = %cluster.id(), rules = rules.len(), "queued rules for new cluster");
        Ok(())
    }
}

impl RuleRequests {
    /// Requests as object references for `Controller::reconcile_on`
    pub fn into_object_refs(self) -> impl Stream<Item = ObjectRef<ResourceSyncRule>> + Send {
        self.map(|name| ObjectRef::new(&name))
    }
}

impl Stream for RuleRequests {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
