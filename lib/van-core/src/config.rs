//! Controller configuration from the process environment

use serde::Deserialize;
use std::time::Duration;
use tracing::info;
use van_api::names::SERVICE_CONFIG_SOURCE;

use crate::{CoreError, Result};

pub const ENV_SITE_ID: &str = "VAN_SITE_ID";
pub const ENV_NAMESPACE: &str = "VAN_NAMESPACE";
pub const ENV_CONFIG_SOURCE: &str = "VAN_SERVICES_CONFIGMAP";
pub const ENV_OWNER_NAME: &str = "OWNER_NAME";
pub const ENV_OWNER_UID: &str = "OWNER_UID";
pub const ENV_BUS_URL: &str = "VAN_BUS_URL";
pub const ENV_PROXY_IMAGE: &str = "VAN_PROXY_IMAGE";
pub const ENV_SYNC_INTERVAL: &str = "VAN_SYNC_INTERVAL_SECS";
pub const ENV_ORIGIN_TTL: &str = "VAN_ORIGIN_TTL_SECS";
pub const ENV_METRICS_ADDR: &str = "VAN_METRICS_ADDR";
pub const ENV_CONFIG_FILE: &str = "VAN_CONFIG_FILE";

/// Identity of the workload that owns the service resources this controller
/// creates
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnerIdentity {
    pub name: String,
    pub uid: String,
}

#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Identifier of this site, stamped on every snapshot it sends
    pub origin: String,
    pub namespace: String,
    /// Name of the configuration source holding the service records
    pub config_source: String,
    /// Without an owner no service resource is ever considered owned
    pub owner: Option<OwnerIdentity>,
    pub bus_url: String,
    pub proxy_image: String,
    pub sync_interval: Duration,
    pub age_check_interval: Duration,
    /// Silence after which a peer's records are evicted; zero disables aging
    pub origin_ttl: Duration,
    pub max_requeues: u32,
    pub metrics_addr: String,
}

/// Optional overrides read from a YAML file
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ConfigFile {
    site_id: Option<String>,
    namespace: Option<String>,
    config_source: Option<String>,
    bus_url: Option<String>,
    proxy_image: Option<String>,
    sync_interval_secs: Option<u64>,
    age_check_interval_secs: Option<u64>,
    origin_ttl_secs: Option<u64>,
    max_requeues: Option<u32>,
    metrics_addr: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            origin: String::new(),
            namespace: "default".to_string(),
            config_source: SERVICE_CONFIG_SOURCE.to_string(),
            owner: None,
            bus_url: "amqp://skupper-messaging:5672".to_string(),
            proxy_image: "quay.io/skupper/proxy".to_string(),
            sync_interval: Duration::from_secs(5),
            age_check_interval: Duration::from_secs(30),
            origin_ttl: Duration::from_secs(60),
            max_requeues: 5,
            metrics_addr: "0.0.0.0:9090".to_string(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from the process environment, applying the YAML file
    /// named by `VAN_CONFIG_FILE` underneath it
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(path) = std::env::var(ENV_CONFIG_FILE) {
            let contents = std::fs::read_to_string(&path).map_err(|e| {
                CoreError::InvalidConfiguration(format!("failed to read {}: {}", path, e))
            })?;
            config.apply_yaml(&contents)?;
            info!("Loaded configuration file {}", path);
        }
        config.apply_lookup(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay values from a YAML document
    pub fn apply_yaml(&mut self, contents: &str) -> Result<()> {
        let file: ConfigFile = serde_yaml::from_str(contents)?;
        if let Some(v) = file.site_id {
            self.origin = v;
        }
        if let Some(v) = file.namespace {
            self.namespace = v;
        }
        if let Some(v) = file.config_source {
            self.config_source = v;
        }
        if let Some(v) = file.bus_url {
            self.bus_url = v;
        }
        if let Some(v) = file.proxy_image {
            self.proxy_image = v;
        }
        if let Some(v) = file.sync_interval_secs {
            self.sync_interval = Duration::from_secs(v);
        }
        if let Some(v) = file.age_check_interval_secs {
            self.age_check_interval = Duration::from_secs(v);
        }
        if let Some(v) = file.origin_ttl_secs {
            self.origin_ttl = Duration::from_secs(v);
        }
        if let Some(v) = file.max_requeues {
            self.max_requeues = v;
        }
        if let Some(v) = file.metrics_addr {
            self.metrics_addr = v;
        }
        Ok(())
    }

    /// Overlay values from a key lookup, normally the process environment
    pub fn apply_lookup<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = non_empty(ENV_SITE_ID) {
            self.origin = v;
        }
        if let Some(v) = non_empty(ENV_NAMESPACE) {
            self.namespace = v;
        }
        if let Some(v) = non_empty(ENV_CONFIG_SOURCE) {
            self.config_source = v;
        }
        if let Some(v) = non_empty(ENV_BUS_URL) {
            self.bus_url = v;
        }
        if let Some(v) = non_empty(ENV_PROXY_IMAGE) {
            self.proxy_image = v;
        }
        if let Some(v) = non_empty(ENV_METRICS_ADDR) {
            self.metrics_addr = v;
        }
        if let Some(v) = non_empty(ENV_SYNC_INTERVAL) {
            self.sync_interval = Duration::from_secs(parse_secs(ENV_SYNC_INTERVAL, &v)?);
        }
        if let Some(v) = non_empty(ENV_ORIGIN_TTL) {
            self.origin_ttl = Duration::from_secs(parse_secs(ENV_ORIGIN_TTL, &v)?);
        }

        self.owner = match (non_empty(ENV_OWNER_NAME), non_empty(ENV_OWNER_UID)) {
            (Some(name), Some(uid)) => Some(OwnerIdentity { name, uid }),
            _ => self.owner.take(),
        };
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.origin.is_empty() {
            return Err(CoreError::InvalidConfiguration(format!(
                "{} must be set to this site's identifier",
                ENV_SITE_ID
            )));
        }
        if self.sync_interval.is_zero() {
            return Err(CoreError::InvalidConfiguration(
                "sync interval must be greater than zero".to_string(),
            ));
        }
        if self.age_check_interval.is_zero() {
            return Err(CoreError::InvalidConfiguration(
                "age check interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether silent origins are evicted
    pub fn aging_enabled(&self) -> bool {
        !self.origin_ttl.is_zero()
    }
}

fn parse_secs(key: &str, value: &str) -> Result<u64> {
    value.parse().map_err(|_| {
        CoreError::InvalidConfiguration(format!("{} is not a number of seconds: {}", key, value))
    })
}
