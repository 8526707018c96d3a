//! Well-known names shared by every site in a network

/// Annotation marking a service resource as managed by this control plane
pub const CONTROLLED_QUALIFIER: &str = "internal.skupper.io/controlled";
/// Label key identifying the kind of a managed workload
pub const INTERNAL_TYPE_QUALIFIER: &str = "internal.skupper.io/type";
/// Label value for proxy workloads
pub const TYPE_PROXY: &str = "proxy";
/// Label selector matching every proxy workload
pub const TYPE_PROXY_SELECTOR: &str = "internal.skupper.io/type=proxy";
/// Label/annotation carrying the service address a resource serves
pub const ADDRESS_QUALIFIER: &str = "skupper.io/address";
/// Annotation on a service resource naming its proxy
pub const PROXY_QUALIFIER: &str = "skupper.io/proxy";
/// Annotation recording the origin of a synchronized record
pub const ORIGIN_QUALIFIER: &str = "internal.skupper.io/origin";

/// Name of the configuration source holding one entry per ServiceRecord
pub const SERVICE_CONFIG_SOURCE: &str = "skupper-services";
/// Environment variable holding the proxy's serialized ServiceRecord
pub const PROXY_CONFIG_ENV: &str = "SKUPPER_PROXY_CONFIG";
/// Suffix appended to a service address to name its proxy workload
pub const PROXY_SUFFIX: &str = "-proxy";

/// Multicast address every site sends and receives snapshots on
pub const SERVICE_SYNC_ADDRESS: &str = "mc/$skupper-service-sync";
/// Subject of a full-registry snapshot
pub const SUBJECT_SYNC_UPDATE: &str = "service-sync-update";
/// Subject asking peers to broadcast their snapshot immediately
pub const SUBJECT_SYNC_REQUEST: &str = "service-sync-request";
/// Application property carrying the sender's site identifier
pub const PROPERTY_ORIGIN: &str = "origin";
/// Application property carrying the sender's software version
pub const PROPERTY_VERSION: &str = "version";

/// Origin sentinel for records derived from annotations; never synchronized
pub const ORIGIN_ANNOTATION: &str = "annotation";

/// Name of the proxy workload for a service address
pub fn proxy_name(address: &str) -> String {
    format!("{}{}", address, PROXY_SUFFIX)
}

/// Service address served by a proxy workload name
pub fn service_name(proxy_name: &str) -> &str {
    proxy_name.strip_suffix(PROXY_SUFFIX).unwrap_or(proxy_name)
}
