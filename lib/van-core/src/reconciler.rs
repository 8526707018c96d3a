//! Drives proxy workloads and service resources toward the desired records
//!
//! [`plan`] is a pure function of the desired records and the actual-state
//! caches. [`Reconciler::reconcile`] applies a plan best-effort: a failed
//! action is logged and the remaining actions still run. Successful actions
//! are written back into the caches so that a second pass over unchanged
//! inputs issues no further calls.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info, warn};
use van_api::names::{proxy_name, service_name};
use van_api::ServiceRecord;

use crate::cluster::Cluster;
use crate::config::OwnerIdentity;
use crate::metrics::SyncMetrics;
use crate::resources::{
    is_owned, proxy_deployment, proxy_matches, proxy_service, service_matches,
};
use crate::Result;

/// Cached view of the resources actually present in the cluster
#[derive(Clone, Debug, Default)]
pub struct ActualState {
    /// Proxy workloads by name
    pub proxies: BTreeMap<String, Deployment>,
    /// Service resources by name
    pub services: BTreeMap<String, Service>,
}

impl ActualState {
    pub fn replace_proxies(&mut self, proxies: Vec<Deployment>) {
        self.proxies = proxies
            .into_iter()
            .filter_map(|d| d.metadata.name.clone().map(|name| (name, d)))
            .collect();
    }

    pub fn replace_services(&mut self, services: Vec<Service>) {
        self.services = services
            .into_iter()
            .filter_map(|s| s.metadata.name.clone().map(|name| (name, s)))
            .collect();
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ReconcileAction {
    CreateProxy(ServiceRecord),
    UpdateProxy(ServiceRecord),
    DeleteProxy(String),
    CreateService(ServiceRecord),
    UpdateService(ServiceRecord),
    DeleteService(String),
}

impl ReconcileAction {
    pub fn verb(&self) -> &'static str {
        match self {
            ReconcileAction::CreateProxy(_) | ReconcileAction::CreateService(_) => "create",
            ReconcileAction::UpdateProxy(_) | ReconcileAction::UpdateService(_) => "update",
            ReconcileAction::DeleteProxy(_) | ReconcileAction::DeleteService(_) => "delete",
        }
    }

    pub fn resource(&self) -> &'static str {
        match self {
            ReconcileAction::CreateProxy(_)
            | ReconcileAction::UpdateProxy(_)
            | ReconcileAction::DeleteProxy(_) => "proxy",
            _ => "service",
        }
    }

    /// Name of the resource the action touches
    pub fn name(&self) -> String {
        match self {
            ReconcileAction::CreateProxy(r) | ReconcileAction::UpdateProxy(r) => r.proxy_name(),
            ReconcileAction::CreateService(r) | ReconcileAction::UpdateService(r) => {
                r.address.clone()
            }
            ReconcileAction::DeleteProxy(name) | ReconcileAction::DeleteService(name) => {
                name.clone()
            }
        }
    }
}

impl fmt::Display for ReconcileAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.verb(), self.resource(), self.name())
    }
}

/// Compute the actions converging `actual` toward `desired`
pub fn plan(
    desired: &BTreeMap<String, ServiceRecord>,
    actual: &ActualState,
    owner: Option<&OwnerIdentity>,
) -> Vec<ReconcileAction> {
    let mut actions = Vec::new();

    for record in desired.values() {
        if record.is_headless() {
            debug!(address = %record.address, "Headless service is not proxied here");
            continue;
        }
        match actual.proxies.get(&proxy_name(&record.address)) {
            None => actions.push(ReconcileAction::CreateProxy(record.clone())),
            Some(proxy) if !proxy_matches(record, proxy) => {
                actions.push(ReconcileAction::UpdateProxy(record.clone()))
            }
            Some(_) => {}
        }
    }

    for name in actual.proxies.keys() {
        if !desired.contains_key(service_name(name)) {
            actions.push(ReconcileAction::DeleteProxy(name.clone()));
        }
    }

    for record in desired.values() {
        if record.is_headless() {
            continue;
        }
        match actual.services.get(&record.address) {
            None => actions.push(ReconcileAction::CreateService(record.clone())),
            Some(service) if !service_matches(record, service) => {
                if is_owned(service, owner) {
                    actions.push(ReconcileAction::UpdateService(record.clone()));
                } else {
                    debug!(service = %record.address, "Leaving unmanaged service unchanged");
                }
            }
            Some(_) => {}
        }
    }

    for (name, service) in &actual.services {
        if !desired.contains_key(name) && is_owned(service, owner) {
            actions.push(ReconcileAction::DeleteService(name.clone()));
        }
    }

    actions
}

/// Outcome counts of one reconcile pass
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReconcileSummary {
    pub applied: usize,
    pub failed: usize,
}

pub struct Reconciler {
    namespace: String,
    proxy_image: String,
    owner: Option<OwnerIdentity>,
    metrics: SyncMetrics,
}

impl Reconciler {
    pub fn new(
        namespace: String,
        proxy_image: String,
        owner: Option<OwnerIdentity>,
        metrics: SyncMetrics,
    ) -> Self {
        Self {
            namespace,
            proxy_image,
            owner,
            metrics,
        }
    }

    /// Plan and apply one pass, updating `actual` with every successful action
    pub async fn reconcile(
        &self,
        cluster: &dyn Cluster,
        desired: &BTreeMap<String, ServiceRecord>,
        actual: &mut ActualState,
    ) -> ReconcileSummary {
        let actions = plan(desired, actual, self.owner.as_ref());
        let mut summary = ReconcileSummary::default();
        if actions.is_empty() {
            debug!("Reconcile: nothing to do");
            return summary;
        }

        for action in actions {
            info!("Reconcile: {}", action);
            match self.apply(cluster, &action, actual).await {
                Ok(()) => {
                    summary.applied += 1;
                    self.metrics
                        .reconcile_actions_total
                        .with_label_values(&[action.verb(), action.resource()])
                        .inc();
                }
                Err(e) => {
                    summary.failed += 1;
                    warn!("Failed to {}: {}", action, e);
                    self.metrics
                        .reconcile_failures_total
                        .with_label_values(&[action.verb(), action.resource()])
                        .inc();
                }
            }
        }
        summary
    }

    async fn apply(
        &self,
        cluster: &dyn Cluster,
        action: &ReconcileAction,
        actual: &mut ActualState,
    ) -> Result<()> {
        let owner = self.owner.as_ref();
        match action {
            ReconcileAction::CreateProxy(record) => {
                let deployment =
                    proxy_deployment(record, &self.namespace, &self.proxy_image, owner)?;
                let created = cluster.create_proxy(&deployment).await?;
                actual.proxies.insert(record.proxy_name(), created);
            }
            ReconcileAction::UpdateProxy(record) => {
                let mut deployment =
                    proxy_deployment(record, &self.namespace, &self.proxy_image, owner)?;
                if let Some(existing) = actual.proxies.get(&record.proxy_name()) {
                    deployment.metadata.resource_version =
                        existing.metadata.resource_version.clone();
                }
                let replaced = cluster.replace_proxy(&deployment).await?;
                actual.proxies.insert(record.proxy_name(), replaced);
            }
            ReconcileAction::DeleteProxy(name) => {
                cluster.delete_proxy(name).await?;
                actual.proxies.remove(name);
            }
            ReconcileAction::CreateService(record) => {
                let service = proxy_service(record, &self.namespace, owner);
                let created = cluster.create_service(&service).await?;
                actual.services.insert(record.address.clone(), created);
            }
            ReconcileAction::UpdateService(record) => {
                let mut service = proxy_service(record, &self.namespace, owner);
                if let Some(existing) = actual.services.get(&record.address) {
                    service.metadata.resource_version =
                        existing.metadata.resource_version.clone();
                    // clusterIP is immutable once assigned
                    if let (Some(spec), Some(existing_spec)) =
                        (service.spec.as_mut(), existing.spec.as_ref())
                    {
                        spec.cluster_ip = existing_spec.cluster_ip.clone();
                        spec.cluster_ips = existing_spec.cluster_ips.clone();
                    }
                }
                let replaced = cluster.replace_service(&service).await?;
                actual.services.insert(record.address.clone(), replaced);
            }
            ReconcileAction::DeleteService(name) => {
                cluster.delete_service(name).await?;
                actual.services.remove(name);
            }
        }
        Ok(())
    }
}
