//! Message bus shared by every site of a network

use async_trait::async_trait;
use van_api::names::{SUBJECT_SYNC_REQUEST, SUBJECT_SYNC_UPDATE};

use crate::Result;

/// One message on the service sync address
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SyncMessage {
    pub subject: String,
    /// Site identifier of the sender
    pub origin: Option<String>,
    /// Software version of the sender
    pub version: Option<String>,
    /// Encoded snapshot for updates
    pub body: Option<String>,
}

impl SyncMessage {
    pub fn update(origin: &str, body: String) -> Self {
        Self {
            subject: SUBJECT_SYNC_UPDATE.to_string(),
            origin: Some(origin.to_string()),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
            body: Some(body),
        }
    }

    pub fn request(origin: &str) -> Self {
        Self {
            subject: SUBJECT_SYNC_REQUEST.to_string(),
            origin: Some(origin.to_string()),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
            body: None,
        }
    }
}

/// Both directions of an established bus connection
pub struct BusLink {
    pub sender: Box<dyn BusSender>,
    pub receiver: Box<dyn BusReceiver>,
}

#[async_trait]
pub trait SyncBus: Send + Sync {
    /// Open a connection with a sender and a receiver on the sync address
    async fn connect(&self) -> Result<BusLink>;
}

#[async_trait]
pub trait BusSender: Send {
    async fn send(&mut self, message: &SyncMessage) -> Result<()>;

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
pub trait BusReceiver: Send {
    /// Wait for the next message; an error means the link is unusable
    async fn recv(&mut self) -> Result<SyncMessage>;

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
