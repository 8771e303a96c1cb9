//! Managed controller lifecycle
//!
//! A [`ManagedController`] owns one background task running a
//! [`ManagedReconciler`]. Its state only moves forward:
//!
//! ```text
//! Created -> Starting -> Running -> Stopping -> Stopped
//! ```
//!
//! `Created` may jump straight to `Stopped` when stopped before start, and a
//! failed start ends in `Stopped`. A stopped controller is never restarted;
//! callers build a new one instead. The stopped signal fires exactly once.

use std::sync::{Arc, OnceLock};

use fleet_common::{Error, Result};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::reconciler::ManagedReconciler;

/// Lifecycle state of a managed controller
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ControllerState {
    /// Built but not started
    Created,
    /// Start in progress
    Starting,
    /// Work loop running
    Running,
    /// Stop requested, waiting for the loop to exit
    Stopping,
    /// Loop exited and resources released
    Stopped,
}

/// Lifecycle wrapper around one reconciler on one cluster
pub struct ManagedController {
    name: String,
    reconciler: Arc<dyn ManagedReconciler>,
    state: Mutex<ControllerState>,
    scope: OnceLock<CancellationToken>,
    stopped_tx: watch::Sender<bool>,
}

impl ManagedController {
    /// Wrap `reconciler` in a controller called `name`
    pub fn new(name: impl Into<String>, reconciler: Arc<dyn ManagedReconciler>) -> Self {
        let (stopped_tx, _) = watch::channel(false);
        Self {
            name: name.into(),
            reconciler,
            state: Mutex::new(ControllerState::Created),
            scope: OnceLock::new(),
            stopped_tx,
        }
    }

    /// Controller name, unique per cluster
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The wrapped reconciler
    pub fn reconciler(&self) -> &Arc<dyn ManagedReconciler> {
        &self.reconciler
    }

    /// Current state
    pub fn state(&self) -> ControllerState {
        *self.state.lock()
    }

    /// Whether the stopped signal has fired
    pub fn is_stopped(&self) -> bool {
        *self.stopped_tx.borrow()
    }

    /// Start the work loop under a child of `parent`
    ///
    /// Fails if the controller was already started or stopped, if the
    /// reconciler's start hook fails, or if the reconciler ends up without an
    /// execution scope. A failed start leaves the controller stopped.
    pub fn start(self: &Arc<Self>, parent: &CancellationToken, cluster: &str) -> Result<()> {
        let base = self.reconciler.base();
        let scope = {
            let mut state = self.state.lock();
            if *state != ControllerState::Created {
                return Err(Error::controller_start(
                    &self.name,
                    format!("cannot start from state {:?}", *state),
                ));
            }
            base.set_scope(parent.child_token());
            base.set_span(info_span!("managed_controller", cluster, controller = %self.name));

            // Whatever scope the reconciler holds is the one stop() must cancel
            match base.scope() {
                Some(scope) => {
                    let _ = self.scope.set(scope.clone());
                    *state = ControllerState::Starting;
                    scope
                }
                None => {
                    drop(state);
                    self.finish();
                    return Err(Error::MissingContext {
                        reconciler: self.reconciler.name().to_string(),
                    });
                }
            }
        };

        if let Err(e) = self.reconciler.start() {
            self.finish();
            return Err(Error::controller_start(&self.name, e.to_string()));
        }

        let this = Arc::clone(self);
        let span = base.span();
        tokio::spawn(
            async move {
                debug!("work loop started");
                if let Err(e) = this.reconciler.run(scope).await {
                    warn!(error = %e, "work loop exited with error");
                }
                this.finish();
                debug!("work loop finished");
            }
            .instrument(span),
        );

        self.advance(ControllerState::Running);
        info!(controller = %self.name, cluster, "managed controller started");
        Ok(())
    }

    /// Request a stop; returns immediately and is safe to call repeatedly
    pub fn stop(&self) {
        let mut state = self.state.lock();
        match *state {
            ControllerState::Created => {
                *state = ControllerState::Stopped;
                drop(state);
                self.reconciler.do_cleanup();
                self.stopped_tx.send_replace(true);
            }
            ControllerState::Starting | ControllerState::Running => {
                *state = ControllerState::Stopping;
                drop(state);
                if let Some(scope) = self.scope.get() {
                    scope.cancel();
                }
            }
            ControllerState::Stopping | ControllerState::Stopped => {}
        }
    }

    /// Resolves once the controller has stopped, immediately if it already has
    ///
    /// The returned future does not borrow the controller.
    pub fn stopped(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut rx = self.stopped_tx.subscribe();
        async move {
            // An error means the controller was dropped, which also ends it
            let _ = rx.wait_for(|stopped| *stopped).await;
        }
    }

    fn advance(&self, next: ControllerState) {
        let mut state = self.state.lock();
        if *state < next {
            *state = next;
        }
    }

    fn finish(&self) {
        self.advance(ControllerState::Stopped);
        self.reconciler.do_cleanup();
        self.stopped_tx.send_replace(true);
    }
}

impl std::fmt::Debug for ManagedController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedController")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}
