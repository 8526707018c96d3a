//! Prometheus metrics for service synchronization and reconciliation

use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

use crate::{CoreError, Result};

/// Metrics shared by every loop of the engine
#[derive(Clone)]
pub struct SyncMetrics {
    /// Snapshots broadcast by this site
    pub snapshots_sent_total: IntCounter,
    /// Snapshots received, by outcome: merged, self, invalid
    pub snapshots_received_total: IntCounterVec,
    /// Reconcile actions applied, by action and resource
    pub reconcile_actions_total: IntCounterVec,
    /// Reconcile actions that failed, by action and resource
    pub reconcile_failures_total: IntCounterVec,
    /// Watched objects dropped after exhausting their retries, by resource kind
    pub queue_drops_total: IntCounterVec,
    /// Records authored by this site
    pub local_services: IntGauge,
    /// Peer sites with records in the federated registry
    pub federated_origins: IntGauge,
    /// Unix time of the last successful broadcast
    pub last_broadcast_timestamp_seconds: IntGauge,
    pub registry: Arc<Registry>,
}

impl SyncMetrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let snapshots_sent_total = IntCounter::new(
            "van_snapshots_sent_total",
            "Service sync snapshots broadcast by this site",
        )?;
        let snapshots_received_total = IntCounterVec::new(
            Opts::new(
                "van_snapshots_received_total",
                "Service sync snapshots received by outcome",
            ),
            &["outcome"],
        )?;
        let reconcile_actions_total = IntCounterVec::new(
            Opts::new("van_reconcile_actions_total", "Reconcile actions applied"),
            &["action", "resource"],
        )?;
        let reconcile_failures_total = IntCounterVec::new(
            Opts::new("van_reconcile_failures_total", "Reconcile actions that failed"),
            &["action", "resource"],
        )?;
        let queue_drops_total = IntCounterVec::new(
            Opts::new(
                "van_queue_drops_total",
                "Watched objects dropped after exhausting retries",
            ),
            &["kind"],
        )?;
        let local_services = IntGauge::new("van_local_services", "Locally authored services")?;
        let federated_origins =
            IntGauge::new("van_federated_origins", "Peer sites with federated services")?;
        let last_broadcast_timestamp_seconds = IntGauge::new(
            "van_last_broadcast_timestamp_seconds",
            "Unix time of the last successful snapshot broadcast",
        )?;

        registry.register(Box::new(snapshots_sent_total.clone()))?;
        registry.register(Box::new(snapshots_received_total.clone()))?;
        registry.register(Box::new(reconcile_actions_total.clone()))?;
        registry.register(Box::new(reconcile_failures_total.clone()))?;
        registry.register(Box::new(queue_drops_total.clone()))?;
        registry.register(Box::new(local_services.clone()))?;
        registry.register(Box::new(federated_origins.clone()))?;
        registry.register(Box::new(last_broadcast_timestamp_seconds.clone()))?;

        Ok(Self {
            snapshots_sent_total,
            snapshots_received_total,
            reconcile_actions_total,
            reconcile_failures_total,
            queue_drops_total,
            local_services,
            federated_origins,
            last_broadcast_timestamp_seconds,
            registry,
        })
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| CoreError::Internal(e.to_string()))
    }
}
