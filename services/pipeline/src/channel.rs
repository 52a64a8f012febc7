//! Broker session and the channel seam used by message handlers.
//!
//! A session owns one AMQP connection with two channels: one for consuming
//! and acknowledging deliveries, and one in transaction mode for publishing.
//! Keeping acks off the publishing channel means a rolled-back publish
//! transaction never undoes an acknowledgement.

use crate::config::BrokerConfig;
use crate::producer::OutgoingMessage;
use async_trait::async_trait;
use lapin::options::{
    BasicAckOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ExchangeKind};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// Errors raised by broker I/O
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Failed to connect to broker: {0}")]
    ConnectionError(String),

    #[error("Failed to open channel: {0}")]
    ChannelError(String),

    #[error("Failed to declare {kind} {name}: {message}")]
    TopologyError {
        kind: &'static str,
        name: String,
        message: String,
    },

    #[error("Failed to publish to {exchange}/{routing_key}: {message}")]
    PublishError {
        exchange: String,
        routing_key: String,
        message: String,
    },

    #[error("Failed to commit publish transaction: {0}")]
    TransactionError(String),

    #[error("Failed to settle delivery {tag}: {message}")]
    SettleError { tag: u64, message: String },
}

/// Acknowledge and publish operations a handler needs from its session.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Acknowledge a delivery; with `multiple`, every earlier unacknowledged
    /// delivery on the channel as well.
    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), BrokerError>;

    /// Reject a delivery, optionally returning it to its queue.
    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool)
        -> Result<(), BrokerError>;

    /// Publish a single message.
    async fn publish(&self, message: OutgoingMessage) -> Result<(), BrokerError>;

    /// Publish all messages atomically.
    async fn publish_batch(&self, messages: Vec<OutgoingMessage>) -> Result<(), BrokerError>;
}

/// A connected broker session
pub struct AmqpSession {
    connection: Connection,
    consume: Channel,
    publish: Channel,
}

impl AmqpSession {
    /// Connect, open both channels and declare the pipeline exchanges
    #[instrument(skip(config), fields(uri_host = %redact_uri(&config.uri)))]
    pub async fn connect(config: &BrokerConfig, worker: &str) -> Result<Self, BrokerError> {
        let connection = Connection::connect(&config.uri, config.connection_properties(worker))
            .await
            .map_err(|e| BrokerError::ConnectionError(e.to_string()))?;

        let consume = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::ChannelError(e.to_string()))?;
        consume
            .basic_qos(config.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::ChannelError(e.to_string()))?;

        let publish = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::ChannelError(e.to_string()))?;
        publish
            .tx_select()
            .await
            .map_err(|e| BrokerError::ChannelError(e.to_string()))?;

        for exchange in [&config.exchanges.device_traffic, &config.exchanges.routed] {
            declare_topic_exchange(&consume, exchange).await?;
        }

        info!(worker, "Broker session established");

        Ok(Self {
            connection,
            consume,
            publish,
        })
    }

    /// Channel used for consuming and settling deliveries
    pub fn consume_channel(&self) -> &Channel {
        &self.consume
    }

    /// Handle implementing [`BrokerChannel`] for this session
    pub fn channel(&self) -> AmqpChannel {
        AmqpChannel {
            consume: self.consume.clone(),
            publish: self.publish.clone(),
            publish_gate: Mutex::new(()),
        }
    }

    /// Close the connection, letting in-flight operations fail naturally
    pub async fn close(self) {
        if let Err(e) = self.connection.close(200, "shutdown").await {
            debug!(error = %e, "Error closing broker connection");
        }
    }
}

async fn declare_topic_exchange(channel: &Channel, name: &str) -> Result<(), BrokerError> {
    channel
        .exchange_declare(
            name,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| BrokerError::TopologyError {
            kind: "exchange",
            name: name.to_string(),
            message: e.to_string(),
        })
}

/// Strip credentials from an AMQP URI for logging
pub fn redact_uri(uri: &str) -> String {
    match (uri.find("://"), uri.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => {
            format!("{}://{}", &uri[..scheme], &uri[at + 1..])
        }
        _ => uri.to_string(),
    }
}

/// [`BrokerChannel`] over lapin
pub struct AmqpChannel {
    consume: Channel,
    publish: Channel,
    // one transaction in flight per publishing channel
    publish_gate: Mutex<()>,
}

impl AmqpChannel {
    async fn send(&self, message: &OutgoingMessage) -> Result<(), BrokerError> {
        self.publish
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                BasicPublishOptions::default(),
                &message.payload,
                message.properties(),
            )
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::PublishError {
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                message: e.to_string(),
            })
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), BrokerError> {
        self.consume
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await
            .map_err(|e| BrokerError::SettleError {
                tag: delivery_tag,
                message: e.to_string(),
            })
    }

    async fn nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), BrokerError> {
        self.consume
            .basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
            .await
            .map_err(|e| BrokerError::SettleError {
                tag: delivery_tag,
                message: e.to_string(),
            })
    }

    async fn publish(&self, message: OutgoingMessage) -> Result<(), BrokerError> {
        self.publish_batch(vec![message]).await
    }

    #[instrument(skip(self, messages), fields(count = messages.len()))]
    async fn publish_batch(&self, messages: Vec<OutgoingMessage>) -> Result<(), BrokerError> {
        if messages.is_empty() {
            return Ok(());
        }

        let _gate = self.publish_gate.lock().await;

        for message in &messages {
            if let Err(e) = self.send(message).await {
                if let Err(rollback) = self.publish.tx_rollback().await {
                    warn!(error = %rollback, "Failed to roll back publish transaction");
                }
                return Err(e);
            }
        }

        self.publish
            .tx_commit()
            .await
            .map_err(|e| BrokerError::TransactionError(e.to_string()))?;

        debug!(count = messages.len(), "Published batch");
        Ok(())
    }
}
