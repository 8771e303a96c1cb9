//! Kubernetes Event recording for fleet controllers.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "ControllerCreated")
    /// * `action` - What action was taken (e.g. "Sync")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as `controller_name`
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// Publisher that drops every event, for tests and dry runs.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reasons shown in the REASON column of `kubectl get events`.
pub mod reasons {
    /// A sync controller was started on a cluster
    pub const CONTROLLER_CREATED: &str = "ControllerCreated";
    /// A sync controller was replaced after a spec change
    pub const CONTROLLER_REPLACED: &str = "ControllerReplaced";
    /// The rule's controllers were removed from every cluster
    pub const CONTROLLERS_REMOVED: &str = "ControllersRemoved";
    /// The rule failed to sync on at least one cluster
    pub const SYNC_FAILED: &str = "SyncFailed";
    /// The rule spec is invalid
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
}

/// Event actions shown in the ACTION column of `kubectl get events`.
pub mod actions {
    /// Rule fan-out
    pub const SYNC: &str = "Sync";
    /// Rule deletion
    pub const CLEANUP: &str = "Cleanup";
}
