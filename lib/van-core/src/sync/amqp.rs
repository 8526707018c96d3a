//! AMQP 1.0 transport for the service sync address

use async_trait::async_trait;
use fe2o3_amqp::connection::ConnectionHandle;
use fe2o3_amqp::session::SessionHandle;
use fe2o3_amqp::types::messaging::{
    AmqpValue, ApplicationProperties, Body, Message, Properties,
};
use fe2o3_amqp::types::primitives::{SimpleValue, Value};
use fe2o3_amqp::{Connection, Receiver, Sender, Session};
use std::time::Duration;
use tracing::{debug, info};
use van_api::names::{PROPERTY_ORIGIN, PROPERTY_VERSION, SERVICE_SYNC_ADDRESS};

use super::bus::{BusLink, BusReceiver, BusSender, SyncBus, SyncMessage};
use crate::{CoreError, Result};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

fn bus_error(e: impl std::fmt::Display) -> CoreError {
    CoreError::Bus(e.to_string())
}

/// Connects to the site's messaging service
pub struct AmqpBus {
    url: String,
    container_id: String,
}

impl AmqpBus {
    pub fn new(url: impl Into<String>, origin: &str) -> Self {
        Self {
            url: url.into(),
            container_id: format!("{}-service-sync-{}", origin, uuid::Uuid::new_v4()),
        }
    }
}

#[async_trait]
impl SyncBus for AmqpBus {
    async fn connect(&self) -> Result<BusLink> {
        info!("Establishing connection to {} for service sync", self.url);
        let mut connection = Connection::open(self.container_id.clone(), self.url.as_str())
            .await
            .map_err(bus_error)?;
        let mut session = Session::begin(&mut connection).await.map_err(bus_error)?;

        let sender = Sender::attach(
            &mut session,
            format!("{}-sender", self.container_id),
            SERVICE_SYNC_ADDRESS,
        )
        .await
        .map_err(bus_error)?;
        let receiver = Receiver::attach(
            &mut session,
            format!("{}-receiver", self.container_id),
            SERVICE_SYNC_ADDRESS,
        )
        .await
        .map_err(bus_error)?;
        info!("Service sync connection established");

        Ok(BusLink {
            sender: Box::new(AmqpSender {
                sender: Some(sender),
            }),
            receiver: Box::new(AmqpReceiver {
                receiver,
                session,
                connection,
            }),
        })
    }
}

struct AmqpSender {
    sender: Option<Sender>,
}

#[async_trait]
impl BusSender for AmqpSender {
    async fn send(&mut self, message: &SyncMessage) -> Result<()> {
        let sender = self
            .sender
            .as_mut()
            .ok_or_else(|| CoreError::Bus("sender closed".to_string()))?;
        let mut properties = ApplicationProperties::builder();
        if let Some(origin) = &message.origin {
            properties = properties.insert(PROPERTY_ORIGIN, origin.clone());
        }
        if let Some(version) = &message.version {
            properties = properties.insert(PROPERTY_VERSION, version.clone());
        }

        let amqp_message = Message::builder()
            .properties(
                Properties::builder()
                    .subject(message.subject.clone())
                    .build(),
            )
            .application_properties(properties.build())
            .value(message.body.clone().unwrap_or_default())
            .build();
        sender.send(amqp_message).await.map_err(bus_error)?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let Some(sender) = self.sender.take() else {
            return Ok(());
        };
        tokio::time::timeout(CLOSE_TIMEOUT, sender.close())
            .await
            .map_err(bus_error)?
            .map_err(bus_error)
    }
}

struct AmqpReceiver {
    receiver: Receiver,
    session: SessionHandle<()>,
    connection: ConnectionHandle<()>,
}

fn string_property(properties: Option<&ApplicationProperties>, key: &str) -> Option<String> {
    match properties?.0.get(key)? {
        SimpleValue::String(value) => Some(value.clone()),
        _ => None,
    }
}

#[async_trait]
impl BusReceiver for AmqpReceiver {
    async fn recv(&mut self) -> Result<SyncMessage> {
        let delivery = self
            .receiver
            .recv::<Body<Value>>()
            .await
            .map_err(bus_error)?;
        self.receiver.accept(&delivery).await.map_err(bus_error)?;

        let message = delivery.message();
        let subject = message
            .properties
            .as_ref()
            .and_then(|p| p.subject.clone())
            .unwrap_or_default();
        let application_properties = message.application_properties.as_ref();
        let body = match delivery.body() {
            Body::Value(AmqpValue(Value::String(body))) => Some(body.clone()),
            _ => None,
        };
        debug!(subject = %subject, "Received service sync message");

        Ok(SyncMessage {
            subject,
            origin: string_property(application_properties, PROPERTY_ORIGIN),
            version: string_property(application_properties, PROPERTY_VERSION),
            body,
        })
    }

    async fn close(&mut self) -> Result<()> {
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, self.session.end()).await;
        tokio::time::timeout(CLOSE_TIMEOUT, self.connection.close())
            .await
            .map_err(bus_error)?
            .map_err(bus_error)
    }
}
