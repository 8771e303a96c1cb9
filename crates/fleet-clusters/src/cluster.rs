//! A member cluster and the controllers running against it
//!
//! Controller names are unique per cluster. Removing a controller signals it
//! to stop and returns at once; until it has actually stopped it sits in a
//! draining list that blocks a new controller of the same name, so at most
//! one live controller per name ever runs on a cluster.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use fleet_common::{Error, Result};
use futures::future::join_all;
use kube::Client;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::controller::ManagedController;

/// One member of the fleet
pub struct Cluster {
    id: String,
    name: String,
    client: Client,
    scope: CancellationToken,
    controllers: RwLock<BTreeMap<String, Arc<ManagedController>>>,
    draining: Mutex<Vec<Arc<ManagedController>>>,
}

impl Cluster {
    /// Create a cluster with an empty controller set
    pub fn new(id: impl Into<String>, name: impl Into<String>, client: Client) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            client,
            scope: CancellationToken::new(),
            controllers: RwLock::new(BTreeMap::new()),
            draining: Mutex::new(Vec::new()),
        }
    }

    /// Unique cluster ID
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Human readable name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// API client for the cluster
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// Scope every controller on this cluster runs under
    pub fn scope(&self) -> &CancellationToken {
        &self.scope
    }

    /// Whether the cluster is being torn down
    pub fn is_stopping(&self) -> bool {
        self.scope.is_cancelled()
    }

    /// Whether a controller with this name is registered
    pub fn has_controller(&self, name: &str) -> bool {
        self.controllers.read().contains_key(name)
    }

    /// Registered controller with this name
    pub fn get_controller(&self, name: &str) -> Option<Arc<ManagedController>> {
        self.controllers.read().get(name).cloned()
    }

    /// Snapshot of the registered controllers, ordered by name
    pub fn controllers(&self) -> Vec<Arc<ManagedController>> {
        self.controllers.read().values().cloned().collect()
    }

    /// Names of the registered controllers
    pub fn controller_names(&self) -> Vec<String> {
        self.controllers.read().keys().cloned().collect()
    }

    /// Start `ctrl` under the cluster scope and register it
    pub fn add_controller(&self, ctrl: Arc<ManagedController>) -> Result<()> {
        // stop() cancels the scope under this guard
        let mut controllers = self.controllers.write();
        if self.is_stopping() {
            return Err(Error::ClusterStopping {
                cluster: self.id.clone(),
            });
        }
        if controllers.contains_key(ctrl.name()) {
            return Err(Error::DuplicateController {
                cluster: self.id.clone(),
                controller: ctrl.name().to_string(),
            });
        }
        if self.is_draining(ctrl.name()) {
            return Err(Error::ControllerDraining {
                cluster: self.id.clone(),
                controller: ctrl.name().to_string(),
            });
        }

        ctrl.start(&self.scope, &self.id)?;
        controllers.insert(ctrl.name().to_string(), ctrl);
        Ok(())
    }

    /// Remove this exact controller instance and signal it to stop
    ///
    /// Returns `false` if the registered controller under that name is a
    /// different instance (or none). Does not wait for the stop.
    pub fn remove_controller(&self, ctrl: &Arc<ManagedController>) -> bool {
        let removed = {
            let mut controllers = self.controllers.write();
            let removed = match controllers.get(ctrl.name()) {
                Some(current) if Arc::ptr_eq(current, ctrl) => controllers.remove(ctrl.name()),
                _ => None,
            };
            if let Some(ctrl) = &removed {
                self.mark_draining(Arc::clone(ctrl));
            }
            removed
        };
        match removed {
            Some(ctrl) => {
                self.signal_stop(&ctrl);
                true
            }
            None => false,
        }
    }

    /// Remove the controller registered under `name` and signal it to stop
    pub fn remove_controller_by_name(&self, name: &str) -> Option<Arc<ManagedController>> {
        let removed = {
            let mut controllers = self.controllers.write();
            let removed = controllers.remove(name);
            if let Some(ctrl) = &removed {
                self.mark_draining(Arc::clone(ctrl));
            }
            removed
        };
        if let Some(ctrl) = &removed {
            self.signal_stop(ctrl);
        }
        removed
    }

    /// Cancel the cluster scope and wait up to `grace` for every controller
    ///
    /// Controllers still running after `grace` are logged and left to finish
    /// on their own.
    pub async fn stop(&self, grace: Duration) {
        let removed: Vec<_> = {
            let mut controllers = self.controllers.write();
            self.scope.cancel();
            let removed: Vec<_> = std::mem::take(&mut *controllers).into_values().collect();
            for ctrl in &removed {
                self.mark_draining(Arc::clone(ctrl));
            }
            removed
        };
        for ctrl in &removed {
            self.signal_stop(ctrl);
        }

        let pending: Vec<_> = self.draining.lock().clone();
        let waits = pending.iter().map(|c| c.stopped());
        if tokio::time::timeout(grace, join_all(waits)).await.is_err() {
            let stragglers: Vec<_> = pending
                .iter()
                .filter(|c| !c.is_stopped())
                .map(|c| c.name().to_string())
                .collect();
            warn!(
                cluster = %self.id,
                ?stragglers,
                grace_secs = grace.as_secs(),
                "controllers did not stop within the grace period"
            );
        }
        self.prune_draining();
        info!(cluster = %self.id, controllers = removed.len(), "cluster stopped");
    }

    /// Park a controller that just left the map; caller holds the map guard
    fn mark_draining(&self, ctrl: Arc<ManagedController>) {
        let mut draining = self.draining.lock();
        draining.retain(|c| !c.is_stopped());
        draining.push(ctrl);
    }

    fn signal_stop(&self, ctrl: &ManagedController) {
        ctrl.stop();
        debug!(cluster = %self.id, controller = %ctrl.name(), "controller removed");
    }

    fn is_draining(&self, name: &str) -> bool {
        let mut draining = self.draining.lock();
        draining.retain(|c| !c.is_stopped());
        draining.iter().any(|c| c.name() == name)
    }

    fn prune_draining(&self) {
        self.draining.lock().retain(|c| !c.is_stopped());
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("controllers", &self.controller_names())
            .finish()
    }
}
