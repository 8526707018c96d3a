//! In-memory cluster that records every call

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use van_api::encode_record;

use crate::cluster::{Cluster, ConfigSourceUpdate};
use crate::{CoreError, Result};

#[derive(Default)]
struct FakeState {
    config: Option<BTreeMap<String, String>>,
    proxies: BTreeMap<String, Deployment>,
    services: BTreeMap<String, Service>,
    calls: Vec<String>,
    failing: HashSet<String>,
}

#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<FakeState>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(entries: &[(&str, &str)]) -> Self {
        let cluster = Self::new();
        cluster.state.lock().unwrap().config = Some(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        cluster
    }

    /// Make every future call matching `call` fail
    pub fn fail(&self, call: &str) {
        self.state.lock().unwrap().failing.insert(call.to_string());
    }

    pub fn recover(&self, call: &str) {
        self.state.lock().unwrap().failing.remove(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub fn config(&self) -> BTreeMap<String, String> {
        self.state.lock().unwrap().config.clone().unwrap_or_default()
    }

    pub fn set_config_entry(&self, key: &str, value: &str) {
        self.state
            .lock()
            .unwrap()
            .config
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
    }

    pub fn insert_service(&self, service: Service) {
        let name = service.metadata.name.clone().unwrap_or_default();
        self.state.lock().unwrap().services.insert(name, service);
    }

    pub fn proxy_names(&self) -> Vec<String> {
        self.state.lock().unwrap().proxies.keys().cloned().collect()
    }

    pub fn service_names(&self) -> Vec<String> {
        self.state.lock().unwrap().services.keys().cloned().collect()
    }

    fn record(&self, call: String) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.failing.contains(&call) {
            return Err(CoreError::Internal(format!("injected failure: {}", call)));
        }
        state.calls.push(call);
        Ok(())
    }
}

fn name_of(meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> String {
    meta.name.clone().unwrap_or_default()
}

#[async_trait]
impl Cluster for FakeCluster {
    async fn read_config_source(&self) -> Result<Option<BTreeMap<String, String>>> {
        let state = self.state.lock().unwrap();
        if state.failing.contains("read_config_source") {
            return Err(CoreError::Internal("injected failure: read_config_source".to_string()));
        }
        Ok(state.config.clone())
    }

    async fn update_config_source(&self, update: &ConfigSourceUpdate) -> Result<()> {
        self.record(format!("update_config_source {}", update.origin))?;
        let mut state = self.state.lock().unwrap();
        let config = state.config.get_or_insert_with(BTreeMap::new);
        for record in &update.upserts {
            let mut record = record.clone();
            record.origin = update.origin.clone();
            config.insert(record.address.clone(), encode_record(&record)?);
        }
        for name in &update.removals {
            config.remove(name);
        }
        Ok(())
    }

    async fn list_proxies(&self) -> Result<Vec<Deployment>> {
        Ok(self.state.lock().unwrap().proxies.values().cloned().collect())
    }

    async fn create_proxy(&self, deployment: &Deployment) -> Result<Deployment> {
        let name = name_of(&deployment.metadata);
        self.record(format!("create_proxy {}", name))?;
        self.state
            .lock()
            .unwrap()
            .proxies
            .insert(name, deployment.clone());
        Ok(deployment.clone())
    }

    async fn replace_proxy(&self, deployment: &Deployment) -> Result<Deployment> {
        let name = name_of(&deployment.metadata);
        self.record(format!("replace_proxy {}", name))?;
        self.state
            .lock()
            .unwrap()
            .proxies
            .insert(name, deployment.clone());
        Ok(deployment.clone())
    }

    async fn delete_proxy(&self, name: &str) -> Result<()> {
        self.record(format!("delete_proxy {}", name))?;
        self.state.lock().unwrap().proxies.remove(name);
        Ok(())
    }

    async fn list_services(&self) -> Result<Vec<Service>> {
        Ok(self.state.lock().unwrap().services.values().cloned().collect())
    }

    async fn create_service(&self, service: &Service) -> Result<Service> {
        let name = name_of(&service.metadata);
        self.record(format!("create_service {}", name))?;
        self.state
            .lock()
            .unwrap()
            .services
            .insert(name, service.clone());
        Ok(service.clone())
    }

    async fn replace_service(&self, service: &Service) -> Result<Service> {
        let name = name_of(&service.metadata);
        self.record(format!("replace_service {}", name))?;
        self.state
            .lock()
            .unwrap()
            .services
            .insert(name, service.clone());
        Ok(service.clone())
    }

    async fn delete_service(&self, name: &str) -> Result<()> {
        self.record(format!("delete_service {}", name))?;
        self.state.lock().unwrap().services.remove(name);
        Ok(())
    }
}
