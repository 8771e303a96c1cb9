//! Reconciler abstraction for managed controllers
//!
//! A [`ManagedReconciler`] is the unit of work a [`ManagedController`] runs on
//! one cluster. Its [`ReconcilerBase`] carries the ambient context the
//! controller hands over at start: execution scope, API client, log span and
//! event publisher. Each field can be set once; later sets are ignored so a
//! context seeded by a builder is never overwritten by the controller.
//!
//! [`ManagedController`]: crate::controller::ManagedController

use std::sync::Arc;

use async_trait::async_trait;
use fleet_common::crd::ResourceSyncRule;
use fleet_common::events::EventPublisher;
use fleet_common::Result;
use kube::Client;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::Span;

#[derive(Default)]
struct Ambient {
    scope: Option<CancellationToken>,
    client: Option<Client>,
    span: Option<Span>,
    recorder: Option<Arc<dyn EventPublisher>>,
}

/// Shared state embedded in every reconciler
pub struct ReconcilerBase {
    name: String,
    ambient: RwLock<Ambient>,
}

fn set_once<T>(slot: &mut Option<T>, value: T) -> bool {
    if slot.is_some() {
        return false;
    }
    *slot = Some(value);
    true
}

impl ReconcilerBase {
    /// Create an empty base for the reconciler `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ambient: RwLock::new(Ambient::default()),
        }
    }

    /// Reconciler name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Install the execution scope; returns `false` if one was already set
    pub fn set_scope(&self, scope: CancellationToken) -> bool {
        set_once(&mut self.ambient.write().scope, scope)
    }

    /// Execution scope, if set
    pub fn scope(&self) -> Option<CancellationToken> {
        self.ambient.read().scope.clone()
    }

    /// Install the API client; returns `false` if one was already set
    pub fn set_client(&self, client: Client) -> bool {
        set_once(&mut self.ambient.write().client, client)
    }

    /// API client, if set
    pub fn client(&self) -> Option<Client> {
        self.ambient.read().client.clone()
    }

    /// Install the log span; returns `false` if one was already set
    pub fn set_span(&self, span: Span) -> bool {
        set_once(&mut self.ambient.write().span, span)
    }

    /// Log span, or a disabled span when unset
    pub fn span(&self) -> Span {
        self.ambient.read().span.clone().unwrap_or_else(Span::none)
    }

    /// Install the event publisher; returns `false` if one was already set
    pub fn set_recorder(&self, recorder: Arc<dyn EventPublisher>) -> bool {
        set_once(&mut self.ambient.write().recorder, recorder)
    }

    /// Event publisher, if set
    pub fn recorder(&self) -> Option<Arc<dyn EventPublisher>> {
        self.ambient.read().recorder.clone()
    }

    /// Drop every ambient reference. Safe to call more than once.
    pub fn clear(&self) {
        *self.ambient.write() = Ambient::default();
    }
}

impl std::fmt::Debug for ReconcilerBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ambient = self.ambient.read();
        f.debug_struct("ReconcilerBase")
            .field("name", &self.name)
            .field("scope", &ambient.scope.is_some())
            .field("client", &ambient.client.is_some())
            .field("recorder", &ambient.recorder.is_some())
            .finish()
    }
}

/// Work unit driven by a managed controller
///
/// `run` must be re-entrant and return promptly once `scope` is cancelled.
#[async_trait]
pub trait ManagedReconciler: Send + Sync + 'static {
    /// Ambient context
    fn base(&self) -> &ReconcilerBase;

    /// Reconciler name
    fn name(&self) -> &str {
        self.base().name()
    }

    /// Hook run once before the work loop is spawned
    fn start(&self) -> Result<()> {
        Ok(())
    }

    /// Work loop; returns when `scope` is cancelled or the work is done
    async fn run(&self, scope: CancellationToken) -> Result<()>;

    /// Release ambient resources after the loop exits
    fn do_cleanup(&self) {
        self.base().clear();
    }

    /// Rule this reconciler runs, for reconcilers driven by a rule
    fn as_rule_bound(&self) -> Option<&dyn RuleBound> {
        None
    }
}

/// Reconcilers created from a [`ResourceSyncRule`]
pub trait RuleBound: Send + Sync {
    /// The rule the reconciler was built from
    fn current_rule(&self) -> &ResourceSyncRule;
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_common::events::NoopEventPublisher;

    #[test]
    fn first_writer_wins() {
        let base = ReconcilerBase::new("sync-secrets");
        let first = CancellationToken::new();
        let second = CancellationToken::new();

        assert!(base.set_scope(first.clone()));
        assert!(!base.set_scope(second.clone()));

        first.cancel();
        assert!(base.scope().is_some_and(|scope| scope.is_cancelled()));
        assert!(!second.is_cancelled());
    }

    #[test]
    fn recorder_and_span_are_set_once() {
        let base = ReconcilerBase::new("sync-secrets");
        assert!(base.recorder().is_none());
        assert!(base.set_recorder(Arc::new(NoopEventPublisher)));
        assert!(!base.set_recorder(Arc::new(NoopEventPublisher)));
        assert!(base.recorder().is_some());

        assert!(base.set_span(tracing::info_span!("first")));
        assert!(!base.set_span(tracing::info_span!("second")));
    }

    #[test]
    fn cleanup_drops_ambient_context_and_is_idempotent() {
        let base = ReconcilerBase::new("sync-secrets");
        base.set_scope(CancellationToken::new());
        base.clear();
        base.clear();
        assert!(base.scope().is_none());
        assert!(base.client().is_none());
    }
}
