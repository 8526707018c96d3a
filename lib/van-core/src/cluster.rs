//! Cluster operations the engine depends on
//!
//! The engine never talks to the platform directly. Everything it reads or
//! writes goes through [`Cluster`], which the Kubernetes integration
//! implements and tests replace with an in-memory recording fake.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use std::collections::BTreeMap;
use van_api::ServiceRecord;

use crate::Result;

/// Changes folded into the configuration source on behalf of one origin
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConfigSourceUpdate {
    pub origin: String,
    /// Records to write, keyed by address in the configuration source
    pub upserts: Vec<ServiceRecord>,
    /// Addresses to remove from the configuration source
    pub removals: Vec<String>,
}

impl ConfigSourceUpdate {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.removals.is_empty()
    }
}

#[async_trait]
pub trait Cluster: Send + Sync {
    /// Raw entries of the configuration source; `None` when it does not exist
    async fn read_config_source(&self) -> Result<Option<BTreeMap<String, String>>>;

    /// Apply upserts and removals to the configuration source
    async fn update_config_source(&self, update: &ConfigSourceUpdate) -> Result<()>;

    /// Every proxy workload, selected by the proxy type label
    async fn list_proxies(&self) -> Result<Vec<Deployment>>;

    async fn create_proxy(&self, deployment: &Deployment) -> Result<Deployment>;

    async fn replace_proxy(&self, deployment: &Deployment) -> Result<Deployment>;

    async fn delete_proxy(&self, name: &str) -> Result<()>;

    /// Every service resource in the namespace, managed or not
    async fn list_services(&self) -> Result<Vec<Service>>;

    async fn create_service(&self, service: &Service) -> Result<Service>;

    async fn replace_service(&self, service: &Service) -> Result<Service>;

    async fn delete_service(&self, name: &str) -> Result<()>;
}
