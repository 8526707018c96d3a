use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::names::{self, ORIGIN_ANNOTATION};

/// ServiceRecord is a network-reachable address declared by a site.
///
/// The address is the only stable identity: a changed record replaces the
/// previous one wholesale.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    /// Address, unique across the whole network
    pub address: String,

    /// Protocol tag: tcp, http, http2
    pub protocol: String,

    /// Ports the address is exposed on
    #[serde(default)]
    pub ports: Vec<u16>,

    /// Deliver to every consumer instead of one
    #[serde(rename = "eventchannel", default, skip_serializing_if = "is_false")]
    pub event_channel: bool,

    /// Aggregation strategy for multicast responses
    #[serde(rename = "aggregate", default, skip_serializing_if = "String::is_empty")]
    pub aggregation: String,

    /// Present when the record is backed by a stateful, per-replica workload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headless: Option<Headless>,

    /// Labels copied onto the resources created for this record
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Local workloads traffic for this address is forwarded to
    #[serde(default)]
    pub targets: Vec<ServiceTarget>,

    /// Empty when authored locally, otherwise the advertising site
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub origin: String,

    #[serde(rename = "enableTls", default, skip_serializing_if = "is_false")]
    pub enable_tls: bool,

    #[serde(rename = "tlsCredentials", default, skip_serializing_if = "String::is_empty")]
    pub tls_credentials: String,
}

/// Headless backing for a ServiceRecord
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Headless {
    /// Name of the stateful workload
    pub name: String,

    /// Number of replicas
    pub size: u32,

    /// Service port to target port
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub target_ports: BTreeMap<u16, u16>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub affinity: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub anti_affinity: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_request: Option<Quantity>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_request: Option<Quantity>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<Quantity>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<Quantity>,
}

/// Local traffic target of a ServiceRecord
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceTarget {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// Label selector of the backing pods
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub selector: String,

    /// Service port to target port
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub target_ports: BTreeMap<u16, u16>,

    /// Backing service, when the target is a service rather than a selector
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service: String,
}

impl ServiceRecord {
    /// Create a record with the fields every record needs
    pub fn new(address: impl Into<String>, protocol: impl Into<String>, ports: Vec<u16>) -> Self {
        Self {
            address: address.into(),
            protocol: protocol.into(),
            ports,
            ..Default::default()
        }
    }

    /// Authored by this site
    pub fn is_local(&self) -> bool {
        self.origin.is_empty()
    }

    /// Derived from an annotation and therefore never synchronized
    pub fn is_annotated(&self) -> bool {
        self.origin == ORIGIN_ANNOTATION
    }

    /// Advertised by a peer site
    pub fn is_remote(&self) -> bool {
        !self.is_local() && !self.is_annotated()
    }

    pub fn is_headless(&self) -> bool {
        self.headless.is_some()
    }

    /// Name of the proxy workload for this record
    pub fn proxy_name(&self) -> String {
        names::proxy_name(&self.address)
    }

    /// Copy of this record carrying only what is advertised to peers
    pub fn advertised(&self) -> Self {
        Self {
            address: self.address.clone(),
            protocol: self.protocol.clone(),
            ports: self.ports.clone(),
            event_channel: self.event_channel,
            aggregation: self.aggregation.clone(),
            headless: self.headless.clone(),
            origin: self.origin.clone(),
            ..Default::default()
        }
    }

    /// Whether two records describe the same service from a peer's point of
    /// view. Targets, labels and origin are local concerns and are ignored.
    pub fn is_equivalent(&self, other: &ServiceRecord) -> bool {
        if self.protocol != other.protocol
            || self.ports != other.ports
            || self.event_channel != other.event_channel
            || self.aggregation != other.aggregation
        {
            return false;
        }
        match (&self.headless, &other.headless) {
            (None, None) => true,
            (Some(a), Some(b)) => {
                a.name == b.name && a.size == b.size && a.target_ports == b.target_ports
            }
            _ => false,
        }
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}
