//! In-process bus: every connected link receives every message, including
//! its own, the way a multicast address behaves

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

use super::bus::{BusLink, BusReceiver, BusSender, SyncBus, SyncMessage};
use crate::{CoreError, Result};

#[derive(Clone)]
pub struct MemoryBus {
    tx: broadcast::Sender<SyncMessage>,
    refused_connects: Arc<AtomicUsize>,
    failed_sends: Arc<AtomicUsize>,
    connects: Arc<AtomicUsize>,
}

impl MemoryBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            refused_connects: Arc::new(AtomicUsize::new(0)),
            failed_sends: Arc::new(AtomicUsize::new(0)),
            connects: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Inject a message as if another site had sent it
    pub fn publish(&self, message: SyncMessage) {
        let _ = self.tx.send(message);
    }

    /// Observe every message sent on the bus
    pub fn subscribe(&self) -> broadcast::Receiver<SyncMessage> {
        self.tx.subscribe()
    }

    /// Refuse the next `count` connection attempts
    pub fn refuse_connects(&self, count: usize) {
        self.refused_connects.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` sends from any link
    pub fn fail_sends(&self, count: usize) {
        self.failed_sends.store(count, Ordering::SeqCst);
    }

    /// Successful connections so far
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl SyncBus for MemoryBus {
    async fn connect(&self) -> Result<BusLink> {
        let refused = self
            .refused_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(CoreError::Bus("connection refused".to_string()));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(BusLink {
            sender: Box::new(MemorySender {
                tx: self.tx.clone(),
                failed_sends: Arc::clone(&self.failed_sends),
            }),
            receiver: Box::new(MemoryReceiver {
                rx: self.tx.subscribe(),
            }),
        })
    }
}

struct MemorySender {
    tx: broadcast::Sender<SyncMessage>,
    failed_sends: Arc<AtomicUsize>,
}

#[async_trait]
impl BusSender for MemorySender {
    async fn send(&mut self, message: &SyncMessage) -> Result<()> {
        let failed = self
            .failed_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(CoreError::Bus("send failed".to_string()));
        }
        // No subscribers is not an error on a multicast address
        let _ = self.tx.send(message.clone());
        Ok(())
    }
}

struct MemoryReceiver {
    rx: broadcast::Receiver<SyncMessage>,
}

#[async_trait]
impl BusReceiver for MemoryReceiver {
    async fn recv(&mut self) -> Result<SyncMessage> {
        loop {
            match self.rx.recv().await {
                Ok(message) => return Ok(message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Service sync receiver lagged, skipped {} messages", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(CoreError::Bus("bus closed".to_string()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_links_see_each_other() {
        let bus = MemoryBus::default();
        let mut a = bus.connect().await.unwrap();
        let mut b = bus.connect().await.unwrap();

        a.sender
            .send(&SyncMessage::request("site-a"))
            .await
            .unwrap();
        let seen_by_b = b.receiver.recv().await.unwrap();
        let seen_by_a = a.receiver.recv().await.unwrap();
        assert_eq!(seen_by_b.origin.as_deref(), Some("site-a"));
        assert_eq!(seen_by_a, seen_by_b);
    }

    #[tokio::test]
    async fn test_refused_connects() {
        let bus = MemoryBus::default();
        bus.refuse_connects(1);
        assert!(bus.connect().await.is_err());
        assert!(bus.connect().await.is_ok());
    }
}
