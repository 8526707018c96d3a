//! Templates for the cluster resources backing a service record

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap;
use van_api::names::{
    ADDRESS_QUALIFIER, CONTROLLED_QUALIFIER, INTERNAL_TYPE_QUALIFIER, ORIGIN_QUALIFIER,
    PROXY_CONFIG_ENV, PROXY_QUALIFIER, TYPE_PROXY,
};
use van_api::{decode_record, encode_record, ServiceRecord};

use crate::config::OwnerIdentity;
use crate::Result;

const PROXY_CONTAINER: &str = "proxy";

/// Owner reference stamped on, and expected on, every managed service
pub fn owner_reference(owner: &OwnerIdentity) -> OwnerReference {
    OwnerReference {
        api_version: "apps/v1".to_string(),
        kind: "Deployment".to_string(),
        name: owner.name.clone(),
        uid: owner.uid.clone(),
        ..Default::default()
    }
}

/// Labels selecting the pods of a record's proxy
pub fn proxy_selector(address: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (INTERNAL_TYPE_QUALIFIER.to_string(), TYPE_PROXY.to_string()),
        (ADDRESS_QUALIFIER.to_string(), address.to_string()),
    ])
}

/// Proxy workload forwarding the record's ports across the network
pub fn proxy_deployment(
    record: &ServiceRecord,
    namespace: &str,
    image: &str,
    owner: Option<&OwnerIdentity>,
) -> Result<Deployment> {
    let config = encode_record(record)?;
    let labels = proxy_selector(&record.address);

    let ports = record
        .ports
        .iter()
        .map(|port| ContainerPort {
            container_port: i32::from(*port),
            ..Default::default()
        })
        .collect();

    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(record.proxy_name()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            owner_references: owner.map(|o| vec![owner_reference(o)]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: PROXY_CONTAINER.to_string(),
                        image: Some(image.to_string()),
                        env: Some(vec![EnvVar {
                            name: PROXY_CONFIG_ENV.to_string(),
                            value: Some(config),
                            ..Default::default()
                        }]),
                        ports: Some(ports),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Service resource exposing a record's proxy under the record's address
pub fn proxy_service(
    record: &ServiceRecord,
    namespace: &str,
    owner: Option<&OwnerIdentity>,
) -> Service {
    let mut annotations = BTreeMap::from([
        (CONTROLLED_QUALIFIER.to_string(), "true".to_string()),
        (PROXY_QUALIFIER.to_string(), record.proxy_name()),
    ]);
    if record.is_remote() {
        annotations.insert(ORIGIN_QUALIFIER.to_string(), record.origin.clone());
    }

    Service {
        metadata: ObjectMeta {
            name: Some(record.address.clone()),
            namespace: Some(namespace.to_string()),
            labels: (!record.labels.is_empty()).then(|| record.labels.clone()),
            annotations: Some(annotations),
            owner_references: owner.map(|o| vec![owner_reference(o)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(proxy_selector(&record.address)),
            ports: Some(service_ports(record)),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn service_ports(record: &ServiceRecord) -> Vec<ServicePort> {
    record
        .ports
        .iter()
        .map(|port| ServicePort {
            name: Some(format!("port{}", port)),
            port: i32::from(*port),
            target_port: Some(IntOrString::Int(i32::from(*port))),
            ..Default::default()
        })
        .collect()
}

/// The record a proxy workload was templated from, if it carries one
pub fn embedded_proxy_config(deployment: &Deployment) -> Option<String> {
    deployment
        .spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .first()?
        .env
        .as_ref()?
        .iter()
        .find(|var| var.name == PROXY_CONFIG_ENV)?
        .value
        .clone()
}

/// Whether a proxy workload already runs the desired record's configuration
pub fn proxy_matches(desired: &ServiceRecord, deployment: &Deployment) -> bool {
    embedded_proxy_config(deployment)
        .and_then(|encoded| decode_record(&encoded).ok())
        .map_or(false, |current| current == *desired)
}

/// Whether a service resource exposes exactly the desired record's ports
pub fn service_matches(desired: &ServiceRecord, service: &Service) -> bool {
    let mut actual: Vec<i32> = service
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .map(|ports| ports.iter().map(|p| p.port).collect())
        .unwrap_or_default();
    let mut wanted: Vec<i32> = desired.ports.iter().map(|p| i32::from(*p)).collect();
    actual.sort_unstable();
    wanted.sort_unstable();
    actual == wanted
}

/// A service is owned when it is annotated as controlled and its owner
/// references are exactly the configured owner
pub fn is_owned(service: &Service, owner: Option<&OwnerIdentity>) -> bool {
    let Some(owner) = owner else {
        return false;
    };
    let controlled = service
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(CONTROLLED_QUALIFIER))
        .map_or(false, |v| v == "true");
    if !controlled {
        return false;
    }

    let expected = owner_reference(owner);
    match service.metadata.owner_references.as_deref() {
        Some([actual]) => {
            actual.api_version == expected.api_version
                && actual.kind == expected.kind
                && actual.name == expected.name
                && actual.uid == expected.uid
        }
        _ => false,
    }
}
