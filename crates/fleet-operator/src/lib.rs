//! Fleet sync operator
//!
//! Watches `ResourceSyncRule` objects and keeps one sync controller per rule
//! running on every cluster in the registry. Clusters join through
//! `FleetCluster` objects; each join re-evaluates every rule.

pub mod cli;
pub mod cluster_controller;
pub mod controller_runner;
pub mod rule_controller;
pub mod rules;
pub mod sync;
pub mod trigger;
