//! Kubernetes integration for the site controller
pub mod client;
pub mod cluster;

pub use client::SiteClient;
pub use cluster::KubeCluster;
