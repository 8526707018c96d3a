//! Service sync: broadcast the local registry to peer sites and merge theirs

use rand::Rng;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};
use van_api::names::{SUBJECT_SYNC_REQUEST, SUBJECT_SYNC_UPDATE};
use van_api::{decode_snapshot, encode_snapshot, ServiceRecord};

use super::bus::{BusLink, BusReceiver, BusSender, SyncBus, SyncMessage};
use crate::engine::Engine;
use crate::Result;

const RECONNECT_MIN: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(60);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct ServiceSync {
    engine: Engine,
    bus: Arc<dyn SyncBus>,
    resync: Arc<Notify>,
}

impl ServiceSync {
    pub fn new(engine: Engine, bus: Arc<dyn SyncBus>) -> Self {
        Self {
            engine,
            bus,
            resync: Arc::new(Notify::new()),
        }
    }

    fn origin(&self) -> &str {
        &self.engine.config().origin
    }

    /// Keep a bus session alive until shutdown, reconnecting with backoff
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting service sync for site {}", self.origin());
        let mut delay = RECONNECT_MIN;

        while !*shutdown.borrow() {
            let link = tokio::select! {
                link = self.bus.connect() => link,
                _ = shutdown.changed() => break,
            };
            match link {
                Ok(link) => {
                    delay = RECONNECT_MIN;
                    match self.session(link, shutdown.clone()).await {
                        Ok(()) => continue,
                        Err(e) => {
                            warn!("Service sync session ended, reconnecting in {:?}: {}", delay, e)
                        }
                    }
                }
                Err(e) => {
                    warn!("Failed to connect for service sync, retrying in {:?}: {}", delay, e);
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(with_jitter(delay)) => {}
                _ = shutdown.changed() => break,
            }
            delay = (delay * 2).min(RECONNECT_MAX);
        }
        info!("Service sync stopped");
    }

    /// One connection: a sender task plus the receive loop on this task.
    /// Returns when either side fails or shutdown is signalled.
    async fn session(&self, link: BusLink, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let BusLink {
            mut sender,
            mut receiver,
        } = link;

        let (stop_tx, stop_rx) = watch::channel(false);
        let sync = self.clone();
        let mut send_task = tokio::spawn(async move {
            let result = sync.send_loop(sender.as_mut(), stop_rx).await;
            close_quietly("sender", sender.close()).await;
            result
        });

        let result = tokio::select! {
            result = self.receive_loop(receiver.as_mut()) => result,
            result = &mut send_task => {
                match result {
                    Ok(result) => result,
                    Err(e) => Err(crate::CoreError::Internal(format!("sender task failed: {}", e))),
                }
            }
            _ = shutdown.changed() => Ok(()),
        };

        let _ = stop_tx.send(true);
        if !send_task.is_finished() {
            let _ = tokio::time::timeout(CLOSE_TIMEOUT * 2, &mut send_task).await;
        }
        close_quietly("receiver", receiver.close()).await;
        result
    }

    async fn send_loop(
        &self,
        sender: &mut dyn BusSender,
        mut stop: watch::Receiver<bool>,
    ) -> Result<()> {
        let config = self.engine.config();
        if let Err(e) = sender.send(&SyncMessage::request(self.origin())).await {
            warn!("Failed to send service sync request: {}", e);
        }

        let mut broadcast = tokio::time::interval(config.sync_interval);
        let mut age_check = tokio::time::interval(config.age_check_interval);
        age_check.reset();

        // A failed send is retried on the next tick; only the receiver ends a session
        loop {
            tokio::select! {
                _ = broadcast.tick() => {
                    if let Err(e) = self.broadcast(sender).await {
                        warn!("Failed to send service sync update: {}", e);
                    }
                }
                _ = self.resync.notified() => {
                    debug!("Service sync requested by a peer");
                    if let Err(e) = self.broadcast(sender).await {
                        warn!("Failed to send service sync update: {}", e);
                    }
                }
                _ = age_check.tick(), if config.aging_enabled() => {
                    if let Err(e) = self.engine.age_out().await {
                        error!("Failed to remove aged out service definitions: {}", e);
                    }
                }
                _ = stop.changed() => return Ok(()),
            }
        }
    }

    async fn broadcast(&self, sender: &mut dyn BusSender) -> Result<()> {
        let snapshot = self.engine.snapshot().await;
        let body = encode_snapshot(&snapshot)?;
        sender.send(&SyncMessage::update(self.origin(), body)).await?;

        let metrics = self.engine.metrics();
        metrics.snapshots_sent_total.inc();
        metrics
            .last_broadcast_timestamp_seconds
            .set(chrono::Utc::now().timestamp());
        debug!("Broadcast {} service definition(s)", snapshot.len());
        Ok(())
    }

    async fn receive_loop(&self, receiver: &mut dyn BusReceiver) -> Result<()> {
        loop {
            let message = receiver.recv().await?;
            self.handle_message(message).await;
        }
    }

    /// Apply one inbound message. Bad messages are logged and dropped.
    pub async fn handle_message(&self, message: SyncMessage) {
        match message.subject.as_str() {
            SUBJECT_SYNC_REQUEST => {
                if message.origin.as_deref() != Some(self.origin()) {
                    self.resync.notify_one();
                }
            }
            SUBJECT_SYNC_UPDATE => self.handle_update(message).await,
            other => warn!("Service sync message with unknown subject {:?}", other),
        }
    }

    async fn handle_update(&self, message: SyncMessage) {
        let metrics = self.engine.metrics();
        let Some(origin) = message.origin else {
            warn!("Service sync update without origin");
            metrics
                .snapshots_received_total
                .with_label_values(&["invalid"])
                .inc();
            return;
        };
        if origin == self.origin() {
            metrics
                .snapshots_received_total
                .with_label_values(&["self"])
                .inc();
            return;
        }
        if let Some(version) = &message.version {
            debug!(origin = %origin, version = %version, "Service sync update received");
        }

        let records = match message.body.as_deref().map(decode_snapshot) {
            Some(Ok(records)) => records,
            Some(Err(e)) => {
                warn!(origin = %origin, "Invalid service sync update: {}", e);
                metrics
                    .snapshots_received_total
                    .with_label_values(&["invalid"])
                    .inc();
                return;
            }
            None => {
                warn!(origin = %origin, "Service sync update without body");
                metrics
                    .snapshots_received_total
                    .with_label_values(&["invalid"])
                    .inc();
                return;
            }
        };

        // Later entries win when a peer repeats an address
        let records: Vec<ServiceRecord> = records
            .into_iter()
            .map(|record| (record.address.clone(), record))
            .collect::<BTreeMap<_, _>>()
            .into_values()
            .collect();

        match self.engine.merge_snapshot(&origin, records).await {
            Ok(diff) => {
                metrics
                    .snapshots_received_total
                    .with_label_values(&["merged"])
                    .inc();
                if !diff.is_empty() {
                    info!(
                        origin = %origin,
                        "Merged service definitions, {} changed, {} removed",
                        diff.changed.len(),
                        diff.removals.len()
                    );
                }
            }
            Err(e) => {
                error!(origin = %origin, "Failed to update service definitions: {}", e);
                metrics
                    .snapshots_received_total
                    .with_label_values(&["failed"])
                    .inc();
            }
        }
    }
}

/// Spread reconnects of sites that lost the bus together
fn with_jitter(delay: Duration) -> Duration {
    let max_jitter = (delay.as_millis() / 4) as u64;
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=max_jitter))
}

async fn close_quietly<F>(side: &str, close: F)
where
    F: std::future::Future<Output = Result<()>>,
{
    match tokio::time::timeout(CLOSE_TIMEOUT, close).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Error closing service sync {}: {}", side, e),
        Err(_) => debug!("Timed out closing service sync {}", side),
    }
}
