//! Error types for the fleet sync operator
//!
//! Variants carry the cluster, controller or rule they concern so that a
//! failed reconcile can be traced back to its fan-out target from the logs.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for fleet operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A cluster with the same ID is already registered
    #[error("cluster {cluster} is already registered")]
    DuplicateCluster {
        /// ID of the cluster
        cluster: String,
    },

    /// A controller with the same name already runs on the cluster
    #[error("controller {controller} already exists on cluster {cluster}")]
    DuplicateController {
        /// ID of the cluster
        cluster: String,
        /// Name of the controller
        controller: String,
    },

    /// A removed controller with the same name has not finished stopping
    #[error("controller {controller} on cluster {cluster} is still stopping")]
    ControllerDraining {
        /// ID of the cluster
        cluster: String,
        /// Name of the controller
        controller: String,
    },

    /// The cluster is being torn down and accepts no new controllers
    #[error("cluster {cluster} is stopping")]
    ClusterStopping {
        /// ID of the cluster
        cluster: String,
    },

    /// Validation error for rule specs
    #[error("validation error for {rule}: {message}")]
    Validation {
        /// Name of the rule with the invalid spec
        rule: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.groupVersionKind.kind")
        field: Option<String>,
    },

    /// A managed controller failed to start
    #[error("failed to start controller {controller}: {message}")]
    ControllerStart {
        /// Name of the controller
        controller: String,
        /// Description of what failed
        message: String,
    },

    /// A reconciler was started without an execution scope
    #[error("reconciler {reconciler} has no execution context")]
    MissingContext {
        /// Name of the reconciler
        reconciler: String,
    },

    /// A removed controller did not stop in time
    #[error("controller {controller} on cluster {cluster} did not stop within {timeout_secs}s")]
    StopTimeout {
        /// ID of the cluster
        cluster: String,
        /// Name of the controller
        controller: String,
        /// How long we waited
        timeout_secs: u64,
    },

    /// A rule was applied to some clusters but failed on others
    #[error("rule {rule} failed to sync on clusters: {}", clusters.join(", "))]
    PartialSync {
        /// Name of the rule
        rule: String,
        /// IDs of the clusters that failed
        clusters: Vec<String>,
    },

    /// Invalid operator configuration
    #[error("configuration error: {message}")]
    Config {
        /// Description of what's invalid
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "registry", "syncer", "finalizer")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            rule: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with rule context and field path
    pub fn validation_for_field(
        rule: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            rule: rule.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a controller start error
    pub fn controller_start(controller: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ControllerStart {
            controller: controller.into(),
            message: msg.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error for a specific resource kind
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation, configuration and serialization errors need a spec or
    /// config fix and are not retried. Registry conflicts clear up on their
    /// own once the competing controller or cluster goes away.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                // Missing objects may appear, conflicts and throttling clear up
                kube::Error::Api(ae) => {
                    !(400..500).contains(&ae.code) || matches!(ae.code, 404 | 409 | 429)
                }
                _ => true,
            },
            Error::DuplicateCluster { .. } => false,
            Error::DuplicateController { .. } => true,
            Error::ControllerDraining { .. } => true,
            Error::ClusterStopping { .. } => false,
            Error::Validation { .. } => false,
            Error::ControllerStart { .. } => true,
            Error::MissingContext { .. } => false,
            Error::StopTimeout { .. } => true,
            Error::PartialSync { .. } => true,
            Error::Config { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Errors that will not go away until the input changes
    pub fn is_permanent(&self) -> bool {
        !self.is_retryable()
    }

    /// Get the cluster ID if this error is associated with a specific cluster
    pub fn cluster(&self) -> Option<&str> {
        match self {
            Error::DuplicateCluster { cluster }
            | Error::DuplicateController { cluster, .. }
            | Error::ControllerDraining { cluster, .. }
            | Error::ClusterStopping { cluster }
            | Error::StopTimeout { cluster, .. } => Some(cluster),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> Error {
        Error::Kube {
            source: kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: "test".to_string(),
                reason: "Test".to_string(),
                code,
            }),
        }
    }

    // ==========================================================================
    // Story Tests: how failures surface while fanning rules out to clusters
    // ==========================================================================

    /// Story: a malformed rule is rejected without retry
    #[test]
    fn story_validation_errors_wait_for_a_spec_change() {
        let err = Error::validation_for_field(
            "sync-secrets",
            "spec.groupVersionKind.kind",
            "must not be empty",
        );
        assert!(err.to_string().contains("sync-secrets"));
        assert!(err.is_permanent());
        match &err {
            Error::Validation { field, .. } => {
                assert_eq!(field.as_deref(), Some("spec.groupVersionKind.kind"));
            }
            _ => panic!("Expected Validation variant"),
        }

        assert!(Error::config("workerCount must be at least 1").is_permanent());
        assert!(Error::serialization_for_kind("ResourceSyncRule", "bad json").is_permanent());
    }

    /// Story: registry conflicts carry the cluster they happened on
    #[test]
    fn story_registry_conflicts_name_the_cluster() {
        let err = Error::DuplicateController {
            cluster: "east".to_string(),
            controller: "sync-secrets".to_string(),
        };
        assert_eq!(err.cluster(), Some("east"));
        assert!(err.to_string().contains("sync-secrets"));
        assert!(err.is_retryable());

        let err = Error::DuplicateCluster {
            cluster: "west".to_string(),
        };
        assert_eq!(err.cluster(), Some("west"));
        assert!(err.is_permanent());

        let err = Error::StopTimeout {
            cluster: "east".to_string(),
            controller: "sync-secrets".to_string(),
            timeout_secs: 30,
        };
        assert!(err.to_string().contains("30s"));
        assert!(err.is_retryable());
    }

    /// Story: a partial fan-out is retried and lists every failed cluster
    #[test]
    fn story_partial_sync_is_retried() {
        let err = Error::PartialSync {
            rule: "sync-secrets".to_string(),
            clusters: vec!["east".to_string(), "west".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "rule sync-secrets failed to sync on clusters: east, west"
        );
        assert!(err.is_retryable());
        assert_eq!(err.cluster(), None);
    }

    #[test]
    fn kube_errors_are_classified_by_status_code() {
        assert!(api_error(500).is_retryable());
        assert!(api_error(409).is_retryable());
        assert!(api_error(429).is_retryable());
        assert!(api_error(403).is_permanent());
        assert!(api_error(404).is_retryable());
        assert!(api_error(400).is_permanent());
    }

    #[test]
    fn internal_errors_keep_their_context() {
        let err = Error::internal_with_context("registry", "shutting down");
        assert!(err.to_string().contains("[registry]"));
        assert!(Error::internal("boom")
            .to_string()
            .contains(&format!("[{UNKNOWN_CONTEXT}]")));
    }
}
