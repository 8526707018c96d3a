//! Single-port record format still sent by older sites

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::Deserialize;
use std::collections::BTreeMap;

use crate::service::{Headless, ServiceRecord, ServiceTarget};

#[derive(Clone, Debug, Default, Deserialize)]
pub struct LegacyServiceRecord {
    pub address: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub port: u16,
    #[serde(rename = "eventchannel", default)]
    pub event_channel: bool,
    #[serde(rename = "aggregate", default)]
    pub aggregation: String,
    #[serde(default)]
    pub headless: Option<LegacyHeadless>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub targets: Vec<LegacyServiceTarget>,
    #[serde(default)]
    pub origin: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyHeadless {
    pub name: String,
    #[serde(default)]
    pub size: u32,
    #[serde(default)]
    pub target_port: u16,
    #[serde(default)]
    pub affinity: BTreeMap<String, String>,
    #[serde(default)]
    pub anti_affinity: BTreeMap<String, String>,
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default)]
    pub cpu_request: Option<Quantity>,
    #[serde(default)]
    pub memory_request: Option<Quantity>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyServiceTarget {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub selector: String,
    #[serde(default)]
    pub target_port: u16,
    #[serde(default)]
    pub service: String,
}

/// Map the single service port onto a target port, when one was given
fn port_mapping(port: u16, target_port: u16) -> BTreeMap<u16, u16> {
    let mut ports = BTreeMap::new();
    if target_port > 0 {
        ports.insert(port, target_port);
    }
    ports
}

impl From<LegacyServiceRecord> for ServiceRecord {
    fn from(legacy: LegacyServiceRecord) -> Self {
        let port = legacy.port;
        let headless = legacy.headless.map(|h| Headless {
            name: h.name,
            size: h.size,
            target_ports: port_mapping(port, h.target_port),
            affinity: h.affinity,
            anti_affinity: h.anti_affinity,
            node_selector: h.node_selector,
            cpu_request: h.cpu_request,
            memory_request: h.memory_request,
            cpu_limit: None,
            memory_limit: None,
        });
        let targets = legacy
            .targets
            .into_iter()
            .map(|t| ServiceTarget {
                name: t.name,
                selector: t.selector,
                target_ports: port_mapping(port, t.target_port),
                service: t.service,
            })
            .collect();

        ServiceRecord {
            address: legacy.address,
            protocol: legacy.protocol,
            ports: if port > 0 { vec![port] } else { Vec::new() },
            event_channel: legacy.event_channel,
            aggregation: legacy.aggregation,
            headless,
            labels: legacy.labels,
            targets,
            origin: legacy.origin,
            ..Default::default()
        }
    }
}
