//! Engine owning every registry and cache
//!
//! All loops (resource controllers, service sync sender and receiver) go
//! through [`Engine`]. Its state sits behind a single async mutex, so a reconcile
//! pass, a snapshot merge and a cache refresh never interleave.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex as SyncMutex};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info};
use van_api::ServiceRecord;

use crate::cluster::{Cluster, ConfigSourceUpdate};
use crate::config::ControllerConfig;
use crate::loader::load_definitions;
use crate::metrics::SyncMetrics;
use crate::reconciler::{ActualState, ReconcileSummary, Reconciler};
use crate::registry::{RegistryDiff, SyncRegistry};
use crate::Result;

/// The watched resource classes, one controller each
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    ConfigSource,
    ProxyWorkloads,
    ServiceResources,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 3] = [
        ResourceKind::ConfigSource,
        ResourceKind::ProxyWorkloads,
        ResourceKind::ServiceResources,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::ConfigSource => "config-source",
            ResourceKind::ProxyWorkloads => "proxy-workloads",
            ResourceKind::ServiceResources => "service-resources",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Default)]
struct EngineState {
    registry: SyncRegistry,
    /// Every record in the configuration source
    desired: BTreeMap<String, ServiceRecord>,
    /// Resource classes listed at least once
    loaded: HashSet<ResourceKind>,
    actual: ActualState,
}

struct EngineInner {
    config: ControllerConfig,
    cluster: Arc<dyn Cluster>,
    reconciler: Reconciler,
    metrics: SyncMetrics,
    state: Mutex<EngineState>,
    /// Consecutive failed passes per watched object
    failures: SyncMutex<HashMap<(ResourceKind, String), u32>>,
}

const REQUEUE_BASE_DELAY: Duration = Duration::from_millis(5);
const REQUEUE_MAX_DELAY: Duration = Duration::from_secs(1000);

#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(config: ControllerConfig, cluster: Arc<dyn Cluster>, metrics: SyncMetrics) -> Self {
        let reconciler = Reconciler::new(
            config.namespace.clone(),
            config.proxy_image.clone(),
            config.owner.clone(),
            metrics.clone(),
        );
        Self {
            inner: Arc::new(EngineInner {
                config,
                cluster,
                reconciler,
                metrics,
                state: Mutex::new(EngineState::default()),
                failures: SyncMutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> &SyncMetrics {
        &self.inner.metrics
    }

    /// Re-list one resource class into its cache, then reconcile. Classes
    /// that have never been listed are listed first, so a pass never runs
    /// against an unloaded desired set or cache.
    pub async fn refresh_and_reconcile(&self, kind: ResourceKind) -> Result<ReconcileSummary> {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;

        self.refresh(state, kind).await?;
        for other in ResourceKind::ALL {
            if !state.loaded.contains(&other) {
                self.refresh(state, other).await?;
            }
        }

        Ok(self
            .inner
            .reconciler
            .reconcile(self.inner.cluster.as_ref(), &state.desired, &mut state.actual)
            .await)
    }

    async fn refresh(&self, state: &mut EngineState, kind: ResourceKind) -> Result<()> {
        let cluster = self.inner.cluster.as_ref();
        match kind {
            ResourceKind::ConfigSource => {
                let entries = match cluster.read_config_source().await? {
                    Some(entries) => entries,
                    None => {
                        debug!("Service configuration source not found, no services defined");
                        BTreeMap::new()
                    }
                };
                state.desired = load_definitions(&entries);
                info!(
                    "Desired service configuration updated: {:?}",
                    state.desired.keys().collect::<Vec<_>>()
                );
                state
                    .registry
                    .definitions_updated(&state.desired, Instant::now());
                self.update_gauges(&state.registry);
            }
            ResourceKind::ProxyWorkloads => {
                state.actual.replace_proxies(cluster.list_proxies().await?);
                debug!(
                    "Proxy workloads updated: {:?}",
                    state.actual.proxies.keys().collect::<Vec<_>>()
                );
            }
            ResourceKind::ServiceResources => {
                state.actual.replace_services(cluster.list_services().await?);
                debug!(
                    "Service resources updated: {:?}",
                    state.actual.services.keys().collect::<Vec<_>>()
                );
            }
        }
        state.loaded.insert(kind);
        Ok(())
    }

    /// Reconcile against the current caches without refreshing them
    pub async fn reconcile(&self) -> ReconcileSummary {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        self.inner
            .reconciler
            .reconcile(self.inner.cluster.as_ref(), &state.desired, &mut state.actual)
            .await
    }

    /// The ordered local records to broadcast
    pub async fn snapshot(&self) -> Vec<ServiceRecord> {
        self.inner.state.lock().await.registry.snapshot()
    }

    /// Merge a peer's snapshot and fold the changes into the configuration
    /// source, from where they reach the reconciler like local records
    pub async fn merge_snapshot(
        &self,
        origin: &str,
        records: Vec<ServiceRecord>,
    ) -> Result<RegistryDiff> {
        let incoming: BTreeMap<String, ServiceRecord> = records
            .into_iter()
            .map(|mut record| {
                record.origin = origin.to_string();
                (record.address.clone(), record)
            })
            .collect();

        // The registry only records the snapshot once the configuration
        // source holds it, so a failed write is planned again on the next one
        let mut state = self.inner.state.lock().await;
        let diff = state.registry.plan_definitions(origin, &incoming);
        self.persist(&diff).await?;
        state
            .registry
            .commit_definitions(origin, incoming, Instant::now());
        self.update_gauges(&state.registry);
        Ok(diff)
    }

    /// Evict origins that have gone silent, when aging is enabled. An origin
    /// whose removals fail to persist stays registered and is retried on the
    /// next check.
    pub async fn age_out(&self) -> Result<Vec<RegistryDiff>> {
        if !self.inner.config.aging_enabled() {
            return Ok(Vec::new());
        }
        let mut state = self.inner.state.lock().await;
        let aged = state
            .registry
            .plan_age_out(Instant::now(), self.inner.config.origin_ttl);

        let mut result = Ok(());
        for diff in &aged {
            if let Err(e) = self.persist(diff).await {
                result = Err(e);
                break;
            }
            state.registry.evict(&diff.origin);
        }
        self.update_gauges(&state.registry);
        result.map(|()| aged)
    }

    pub async fn federated(&self, origin: &str) -> Option<BTreeMap<String, ServiceRecord>> {
        self.inner
            .state
            .lock()
            .await
            .registry
            .federated(origin)
            .cloned()
    }

    /// Forget the failure history of a watched object after a clean pass
    pub fn requeue_succeeded(&self, kind: ResourceKind, key: &str) {
        self.failures().remove(&(kind, key.to_string()));
    }

    /// Count a failed pass for a watched object. Returns the delay before
    /// the next attempt, doubling from 5ms up to 1000s, or `None` once the
    /// object has used up `max_requeues` retries; it is then left until it
    /// changes again.
    pub fn requeue_after_failure(&self, kind: ResourceKind, key: &str) -> Option<Duration> {
        let max_requeues = self.inner.config.max_requeues;
        let mut failures = self.failures();
        let count = failures.entry((kind, key.to_string())).or_insert(0);
        *count += 1;
        if *count <= max_requeues {
            let exponent = (*count - 1).min(31);
            return Some(
                REQUEUE_BASE_DELAY
                    .checked_mul(1u32 << exponent)
                    .map_or(REQUEUE_MAX_DELAY, |d| d.min(REQUEUE_MAX_DELAY)),
            );
        }

        failures.remove(&(kind, key.to_string()));
        error!(
            kind = %kind,
            key = %key,
            "Dropping {} after {} retries",
            key,
            max_requeues
        );
        self.inner
            .metrics
            .queue_drops_total
            .with_label_values(&[kind.as_str()])
            .inc();
        None
    }

    fn failures(&self) -> std::sync::MutexGuard<'_, HashMap<(ResourceKind, String), u32>> {
        // The counts stay consistent even if a holder panicked
        self.inner.failures.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn persist(&self, diff: &RegistryDiff) -> Result<()> {
        if diff.is_empty() {
            return Ok(());
        }
        let update = ConfigSourceUpdate {
            origin: diff.origin.clone(),
            upserts: diff.changed.clone(),
            removals: diff.removals.clone(),
        };
        info!(
            origin = %diff.origin,
            "Updating service definitions: changed {:?}, removed {:?}",
            update.upserts.iter().map(|r| &r.address).collect::<Vec<_>>(),
            update.removals
        );
        self.inner.cluster.update_config_source(&update).await
    }

    fn update_gauges(&self, registry: &SyncRegistry) {
        self.inner
            .metrics
            .local_services
            .set(registry.local().len() as i64);
        self.inner
            .metrics
            .federated_origins
            .set(registry.origins().count() as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OwnerIdentity;
    use crate::resources::proxy_service;
    use crate::testing::FakeCluster;
    use k8s_openapi::api::core::v1::Service;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::time::Duration;

    fn config() -> ControllerConfig {
        ControllerConfig {
            origin: "site-1".to_string(),
            namespace: "van".to_string(),
            owner: Some(OwnerIdentity {
                name: "van-controller".to_string(),
                uid: "uid-1".to_string(),
            }),
            ..Default::default()
        }
    }

    fn engine(cluster: Arc<FakeCluster>) -> Engine {
        Engine::new(config(), cluster, SyncMetrics::new().unwrap())
    }

    async fn refresh_all(engine: &Engine) {
        for kind in ResourceKind::ALL {
            engine.refresh_and_reconcile(kind).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_local_only_scenario() {
        let cluster = Arc::new(FakeCluster::with_config(&[(
            "foo",
            r#"{"address":"foo","protocol":"tcp","ports":[8080]}"#,
        )]));
        let engine = engine(cluster.clone());
        refresh_all(&engine).await;

        let snapshot = engine.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].address, "foo");
        assert_eq!(cluster.proxy_names(), vec!["foo-proxy"]);
        assert_eq!(cluster.service_names(), vec!["foo"]);
    }

    #[tokio::test]
    async fn test_annotation_records_reconciled_not_broadcast() {
        let cluster = Arc::new(FakeCluster::with_config(&[(
            "annotated",
            r#"{"address":"annotated","protocol":"tcp","ports":[80],"origin":"annotation"}"#,
        )]));
        let engine = engine(cluster.clone());
        refresh_all(&engine).await;

        assert!(engine.snapshot().await.is_empty());
        assert_eq!(cluster.proxy_names(), vec!["annotated-proxy"]);
    }

    #[tokio::test]
    async fn test_remote_add_and_retract() {
        let cluster = Arc::new(FakeCluster::new());
        let engine = engine(cluster.clone());
        refresh_all(&engine).await;

        let svc2 = ServiceRecord::new("svc2", "http", vec![80]);
        let diff = engine.merge_snapshot("site-2", vec![svc2]).await.unwrap();
        assert_eq!(diff.changed.len(), 1);
        assert_eq!(diff.changed[0].address, "svc2");
        assert!(engine.federated("site-2").await.unwrap().contains_key("svc2"));

        let stored = van_api::decode_record(&cluster.config()["svc2"]).unwrap();
        assert_eq!(stored.origin, "site-2");

        engine
            .refresh_and_reconcile(ResourceKind::ConfigSource)
            .await
            .unwrap();
        assert_eq!(cluster.proxy_names(), vec!["svc2-proxy"]);
        assert_eq!(cluster.service_names(), vec!["svc2"]);

        let diff = engine.merge_snapshot("site-2", Vec::new()).await.unwrap();
        assert_eq!(diff.deleted, vec!["svc2"]);
        assert!(!cluster.config().contains_key("svc2"));

        engine
            .refresh_and_reconcile(ResourceKind::ConfigSource)
            .await
            .unwrap();
        assert!(cluster.proxy_names().is_empty());
        assert!(cluster.service_names().is_empty());
    }

    #[tokio::test]
    async fn test_local_definition_takes_precedence() {
        let cluster = Arc::new(FakeCluster::new());
        let engine = engine(cluster.clone());
        engine
            .merge_snapshot("site-2", vec![ServiceRecord::new("shared", "tcp", vec![8080])])
            .await
            .unwrap();
        engine
            .refresh_and_reconcile(ResourceKind::ConfigSource)
            .await
            .unwrap();
        assert!(engine.snapshot().await.is_empty());

        cluster.set_config_entry(
            "shared",
            r#"{"address":"shared","protocol":"tcp","ports":[9090]}"#,
        );
        engine
            .refresh_and_reconcile(ResourceKind::ConfigSource)
            .await
            .unwrap();

        let snapshot = engine.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].ports, vec![9090]);
        let federated = engine.federated("site-2").await.unwrap_or_default();
        assert!(!federated.contains_key("shared"));
    }

    #[tokio::test]
    async fn test_unowned_orphan_survives() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.insert_service(Service {
            metadata: ObjectMeta {
                name: Some("kubernetes".to_string()),
                ..Default::default()
            },
            ..Default::default()
        });
        let engine = engine(cluster.clone());
        refresh_all(&engine).await;
        assert_eq!(cluster.service_names(), vec!["kubernetes"]);
    }

    #[tokio::test]
    async fn test_owned_orphan_removed() {
        let cluster = Arc::new(FakeCluster::new());
        let stale = ServiceRecord::new("stale", "tcp", vec![8080]);
        cluster.insert_service(proxy_service(&stale, "van", config().owner.as_ref()));
        let engine = engine(cluster.clone());
        refresh_all(&engine).await;
        assert!(cluster.service_names().is_empty());
    }

    #[tokio::test]
    async fn test_repeated_reconcile_is_quiet() {
        let cluster = Arc::new(FakeCluster::with_config(&[(
            "foo",
            r#"{"address":"foo","protocol":"tcp","ports":[8080]}"#,
        )]));
        let engine = engine(cluster.clone());
        refresh_all(&engine).await;
        cluster.clear_calls();

        assert_eq!(engine.reconcile().await, ReconcileSummary::default());
        refresh_all(&engine).await;
        assert!(cluster.calls().is_empty());
    }

    #[tokio::test]
    async fn test_age_out_removes_config_entries() {
        let cluster = Arc::new(FakeCluster::new());
        let mut config = config();
        config.origin_ttl = Duration::from_millis(1);
        let engine = Engine::new(config, cluster.clone(), SyncMetrics::new().unwrap());

        engine
            .merge_snapshot("site-2", vec![ServiceRecord::new("svc2", "tcp", vec![8080])])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let aged = engine.age_out().await.unwrap();
        assert_eq!(aged.len(), 1);
        assert!(cluster.config().is_empty());
        assert!(engine.federated("site-2").await.is_none());
    }

    #[tokio::test]
    async fn test_failed_retraction_retried() {
        let cluster = Arc::new(FakeCluster::new());
        let engine = engine(cluster.clone());
        engine
            .merge_snapshot("site-2", vec![ServiceRecord::new("y", "tcp", vec![8080])])
            .await
            .unwrap();
        assert!(cluster.config().contains_key("y"));

        cluster.fail("update_config_source site-2");
        assert!(engine.merge_snapshot("site-2", Vec::new()).await.is_err());
        assert!(engine.federated("site-2").await.unwrap().contains_key("y"));

        cluster.recover("update_config_source site-2");
        let diff = engine.merge_snapshot("site-2", Vec::new()).await.unwrap();
        assert_eq!(diff.deleted, vec!["y"]);
        assert_eq!(diff.removals, vec!["y"]);
        assert!(!cluster.config().contains_key("y"));
    }

    #[tokio::test]
    async fn test_failed_addition_retried() {
        let cluster = Arc::new(FakeCluster::new());
        let engine = engine(cluster.clone());
        let svc2 = ServiceRecord::new("svc2", "tcp", vec![8080]);

        cluster.fail("update_config_source site-2");
        assert!(engine.merge_snapshot("site-2", vec![svc2.clone()]).await.is_err());
        assert!(engine.federated("site-2").await.is_none());

        cluster.recover("update_config_source site-2");
        let diff = engine.merge_snapshot("site-2", vec![svc2]).await.unwrap();
        assert_eq!(diff.changed.len(), 1);
        assert!(cluster.config().contains_key("svc2"));
    }

    #[tokio::test]
    async fn test_failed_age_out_retried() {
        let cluster = Arc::new(FakeCluster::new());
        let mut config = config();
        config.origin_ttl = Duration::from_millis(1);
        let engine = Engine::new(config, cluster.clone(), SyncMetrics::new().unwrap());
        engine
            .merge_snapshot("site-2", vec![ServiceRecord::new("svc2", "tcp", vec![8080])])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        cluster.fail("update_config_source site-2");
        assert!(engine.age_out().await.is_err());
        assert!(engine.federated("site-2").await.is_some());

        cluster.recover("update_config_source site-2");
        assert_eq!(engine.age_out().await.unwrap().len(), 1);
        assert!(cluster.config().is_empty());
    }

    #[tokio::test]
    async fn test_first_pass_lists_every_class() {
        let cluster = Arc::new(FakeCluster::with_config(&[(
            "foo",
            r#"{"address":"foo","protocol":"tcp","ports":[8080]}"#,
        )]));
        let engine = engine(cluster.clone());
        engine
            .refresh_and_reconcile(ResourceKind::ConfigSource)
            .await
            .unwrap();
        refresh_all(&engine).await;

        let creates = cluster
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("create_"))
            .count();
        assert_eq!(creates, 2);
    }

    #[tokio::test]
    async fn test_services_wait_for_config_source() {
        let cluster = Arc::new(FakeCluster::with_config(&[(
            "foo",
            r#"{"address":"foo","protocol":"tcp","ports":[8080]}"#,
        )]));
        let foo = ServiceRecord::new("foo", "tcp", vec![8080]);
        cluster.insert_service(proxy_service(&foo, "van", config().owner.as_ref()));
        let engine = engine(cluster.clone());

        engine
            .refresh_and_reconcile(ResourceKind::ServiceResources)
            .await
            .unwrap();
        assert_eq!(cluster.service_names(), vec!["foo"]);
        assert_eq!(cluster.proxy_names(), vec!["foo-proxy"]);
    }

    #[tokio::test]
    async fn test_requeue_backs_off_then_drops() {
        let engine = engine(Arc::new(FakeCluster::new()));
        let kind = ResourceKind::ConfigSource;
        let key = "van/skupper-services";

        assert_eq!(
            engine.requeue_after_failure(kind, key),
            Some(Duration::from_millis(5))
        );
        assert_eq!(
            engine.requeue_after_failure(kind, key),
            Some(Duration::from_millis(10))
        );
        for _ in 2..engine.config().max_requeues {
            assert!(engine.requeue_after_failure(kind, key).is_some());
        }
        assert_eq!(engine.requeue_after_failure(kind, key), None);
        let drops = engine
            .metrics()
            .queue_drops_total
            .with_label_values(&["config-source"])
            .get();
        assert_eq!(drops, 1);

        // A dropped object starts over when it changes again
        assert_eq!(
            engine.requeue_after_failure(kind, key),
            Some(Duration::from_millis(5))
        );
    }

    #[tokio::test]
    async fn test_requeue_success_resets_and_kinds_are_separate() {
        let engine = engine(Arc::new(FakeCluster::new()));
        engine.requeue_after_failure(ResourceKind::ServiceResources, "van/foo");
        engine.requeue_after_failure(ResourceKind::ServiceResources, "van/foo");
        assert_eq!(
            engine.requeue_after_failure(ResourceKind::ProxyWorkloads, "van/foo"),
            Some(Duration::from_millis(5))
        );

        engine.requeue_succeeded(ResourceKind::ServiceResources, "van/foo");
        assert_eq!(
            engine.requeue_after_failure(ResourceKind::ServiceResources, "van/foo"),
            Some(Duration::from_millis(5))
        );
    }
}
