//! Hivelink Pipeline - broker plumbing for the hivelink device cloud
//!
//! This library holds everything the ingest, storage and authorization
//! services share:
//!
//! - The compact observation container codec devices upload
//! - Routing keys and per-device resource names
//! - AMQP sessions, the reconnecting consumer loop and batch buffering
//! - Device/template metadata lookup and its invalidation-driven cache
//!
//! # Example
//!
//! ```rust,no_run
//! use hivelink_pipeline::prelude::*;
//! use std::sync::Arc;
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl MessageHandler for Printer {
//!     async fn handle(&self, message: IncomingMessage) -> Result<(), ConsumerError> {
//!         println!("{}", message.routing_key());
//!         Ok(())
//!     }
//! }
//!
//! struct PrinterFactory;
//!
//! impl HandlerFactory for PrinterFactory {
//!     type Handler = Printer;
//!
//!     fn name(&self) -> &str {
//!         "printer"
//!     }
//!
//!     fn subscriptions(&self) -> Vec<Subscription> {
//!         vec![Subscription::exclusive("hivelink.routed", vec!["#".into()])]
//!     }
//!
//!     fn create(&self, _channel: Arc<dyn BrokerChannel>) -> Printer {
//!         Printer
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = BrokerConfig::from_env()?;
//!     let consumer = BrokerConsumer::new(config, "printer-0", PrinterFactory);
//!     consumer.run(CancellationToken::new()).await;
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod cache;
pub mod channel;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod directory;
pub mod model;
pub mod producer;
pub mod routing;

// Re-export main types
pub use batch::{Batch, BatchBuffer};
pub use cache::TemplateCache;
pub use channel::{AmqpChannel, AmqpSession, BrokerChannel, BrokerError};
pub use codec::{Container, ContainerError, DataType, Position, Record, Statistics, Value};
pub use config::{BrokerConfig, ConfigError, DatabaseConfig, LoggingConfig, PublishConfig};
pub use consumer::{
    BrokerConsumer, ConnectionState, ConsumerError, HandlerFactory, IncomingMessage,
    MessageHandler, MessageMetadata, Subscription,
};
pub use directory::{DeviceDirectory, DeviceRecord, DirectoryError, PgDeviceDirectory, Template};
pub use model::{
    CommandMessage, EventMessage, Notification, NotificationCategory, PulseMessage,
    RoutedObservation,
};
pub use producer::{OutgoingMessage, ProducerError};

#[cfg(any(test, feature = "testing"))]
pub use channel::MockBrokerChannel;
#[cfg(any(test, feature = "testing"))]
pub use directory::MockDeviceDirectory;

/// Async trait for message handlers (re-export for convenience)
pub use async_trait::async_trait;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::channel::BrokerChannel;
    pub use crate::config::BrokerConfig;
    pub use crate::consumer::{
        BrokerConsumer, ConsumerError, HandlerFactory, IncomingMessage, MessageHandler,
        Subscription,
    };
    pub use crate::producer::OutgoingMessage;
    pub use async_trait::async_trait;
    pub use tokio_util::sync::CancellationToken;
}
