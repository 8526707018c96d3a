//! Control plane core for a virtual application network site
//!
//! This library provides:
//! - Service registry tracking local definitions and federated peer snapshots
//! - Service sync over the network's message bus
//! - Reconciliation of proxy workloads and service resources
//! - Per-object retry backoff for the resource controllers

pub mod cluster;
pub mod config;
pub mod engine;
pub mod error;
pub mod loader;
pub mod metrics;
pub mod reconciler;
pub mod registry;
pub mod resources;
pub mod sync;

#[cfg(test)]
mod testing;

pub use cluster::{Cluster, ConfigSourceUpdate};
pub use config::{ControllerConfig, OwnerIdentity};
pub use engine::{Engine, ResourceKind};
pub use error::{CoreError, Result};
pub use metrics::SyncMetrics;
pub use registry::SyncRegistry;
pub use sync::{ServiceSync, SyncBus};
