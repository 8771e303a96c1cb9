//! Cluster registry and managed controller lifecycle
//!
//! A [`Manager`] holds the fleet's [`Cluster`]s; each cluster holds the
//! [`ManagedController`]s running against it. Controllers wrap a
//! [`ManagedReconciler`] and are started, stopped and replaced as whole
//! units, never restarted in place.

pub mod cluster;
pub mod controller;
pub mod manager;
pub mod ratelimit;
pub mod reconciler;

pub use cluster::Cluster;
pub use controller::{ControllerState, ManagedController};
pub use manager::{ClusterHook, Manager};
pub use ratelimit::{RateLimiter, RateQuota};
pub use reconciler::{ManagedReconciler, ReconcilerBase, RuleBound};
