//! Cluster operations backed by the Kubernetes API

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, info};
use van_api::encode_record;
use van_api::names::TYPE_PROXY_SELECTOR;
use van_core::cluster::{Cluster, ConfigSourceUpdate};
use van_core::Result;

use crate::client::SiteClient;

pub struct KubeCluster {
    client: SiteClient,
    config_source: String,
}

impl KubeCluster {
    pub fn new(client: SiteClient, config_source: impl Into<String>) -> Self {
        Self {
            client,
            config_source: config_source.into(),
        }
    }
}

fn is_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(response) if response.code == 404)
}

fn name_of(meta: &ObjectMeta) -> &str {
    meta.name.as_deref().unwrap_or_default()
}

/// Encoded entries for every upsert, stamped with the update's origin
fn encoded_upserts(update: &ConfigSourceUpdate) -> Result<BTreeMap<String, String>> {
    let mut entries = BTreeMap::new();
    for record in &update.upserts {
        let mut record = record.clone();
        record.origin = update.origin.clone();
        entries.insert(record.address.clone(), encode_record(&record)?);
    }
    Ok(entries)
}

/// Merge patch setting upserted entries and nulling removed ones
fn config_patch(update: &ConfigSourceUpdate) -> Result<Value> {
    let mut data = Map::new();
    for (address, encoded) in encoded_upserts(update)? {
        data.insert(address, Value::String(encoded));
    }
    for address in &update.removals {
        data.insert(address.clone(), Value::Null);
    }
    Ok(json!({ "data": data }))
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn read_config_source(&self) -> Result<Option<BTreeMap<String, String>>> {
        let config_map = self.client.config_maps().get_opt(&self.config_source).await?;
        Ok(config_map.map(|cm| cm.data.unwrap_or_default()))
    }

    async fn update_config_source(&self, update: &ConfigSourceUpdate) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }
        let api = self.client.config_maps();
        let patch = config_patch(update)?;
        match api
            .patch(&self.config_source, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => {
                debug!("Patched {} on behalf of {}", self.config_source, update.origin);
                Ok(())
            }
            Err(e) if is_not_found(&e) => {
                info!("Creating {}", self.config_source);
                let config_map = ConfigMap {
                    metadata: ObjectMeta {
                        name: Some(self.config_source.clone()),
                        namespace: Some(self.client.namespace().to_string()),
                        ..Default::default()
                    },
                    data: Some(encoded_upserts(update)?),
                    ..Default::default()
                };
                api.create(&PostParams::default(), &config_map).await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list_proxies(&self) -> Result<Vec<Deployment>> {
        let params = ListParams::default().labels(TYPE_PROXY_SELECTOR);
        Ok(self.client.deployments().list(&params).await?.items)
    }

    async fn create_proxy(&self, deployment: &Deployment) -> Result<Deployment> {
        Ok(self
            .client
            .deployments()
            .create(&PostParams::default(), deployment)
            .await?)
    }

    async fn replace_proxy(&self, deployment: &Deployment) -> Result<Deployment> {
        Ok(self
            .client
            .deployments()
            .replace(name_of(&deployment.metadata), &PostParams::default(), deployment)
            .await?)
    }

    async fn delete_proxy(&self, name: &str) -> Result<()> {
        match self
            .client
            .deployments()
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_services(&self) -> Result<Vec<Service>> {
        Ok(self
            .client
            .services()
            .list(&ListParams::default())
            .await?
            .items)
    }

    async fn create_service(&self, service: &Service) -> Result<Service> {
        Ok(self
            .client
            .services()
            .create(&PostParams::default(), service)
            .await?)
    }

    async fn replace_service(&self, service: &Service) -> Result<Service> {
        Ok(self
            .client
            .services()
            .replace(name_of(&service.metadata), &PostParams::default(), service)
            .await?)
    }

    async fn delete_service(&self, name: &str) -> Result<()> {
        match self
            .client
            .services()
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
