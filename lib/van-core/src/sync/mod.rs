//! Service sync over the site's message bus

pub mod bus;
pub mod memory;
pub mod service_sync;

#[cfg(feature = "amqp")]
pub mod amqp;

pub use bus::{BusLink, BusReceiver, BusSender, SyncBus, SyncMessage};
pub use memory::MemoryBus;
pub use service_sync::ServiceSync;

#[cfg(feature = "amqp")]
pub use amqp::AmqpBus;
