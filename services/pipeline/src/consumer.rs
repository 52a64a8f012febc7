//! Broker consumer run loop for the hivelink pipeline.
//!
//! [`BrokerConsumer`] owns one worker's connection lifecycle:
//! `Disconnected -> Connecting -> Consuming`, falling back to `Disconnected`
//! and retrying after a fixed delay whenever the session fails. Each session
//! gets a fresh handler from a [`HandlerFactory`], so batch state never
//! outlives the channel whose delivery tags it holds.

use crate::channel::{AmqpSession, BrokerChannel, BrokerError};
use crate::config::BrokerConfig;
use async_trait::async_trait;
use backoff::backoff::{Backoff, Constant};
use futures::stream::{self, BoxStream, StreamExt};
use lapin::message::Delivery;
use lapin::options::{BasicConsumeOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::Channel;
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Bytes of payload included in forensic log lines
const PAYLOAD_PREVIEW_LEN: usize = 256;

/// Errors that can occur during message consumption
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Failed to deserialize message: {0}")]
    DeserializationError(String),

    #[error("Message processing error: {0}")]
    ProcessingError(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("Delivery stream closed")]
    StreamClosed,
}

impl ConsumerError {
    /// Errors that leave the session unusable and force a reconnect
    pub fn ends_session(&self) -> bool {
        matches!(self, ConsumerError::Broker(_) | ConsumerError::StreamClosed)
    }
}

/// Metadata about a received delivery
#[derive(Debug, Clone, PartialEq)]
pub struct MessageMetadata {
    /// Exchange the message was published to
    pub exchange: String,
    /// Routing key the message was published with
    pub routing_key: String,
    /// Channel-scoped delivery tag
    pub delivery_tag: u64,
    /// Whether the broker delivered this message before
    pub redelivered: bool,
}

/// A received message with payload and metadata
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage {
    /// Raw message payload
    pub payload: Vec<u8>,
    /// Message metadata
    pub metadata: MessageMetadata,
}

impl IncomingMessage {
    pub fn new(routing_key: impl Into<String>, delivery_tag: u64, payload: Vec<u8>) -> Self {
        Self {
            payload,
            metadata: MessageMetadata {
                exchange: String::new(),
                routing_key: routing_key.into(),
                delivery_tag,
                redelivered: false,
            },
        }
    }

    /// Deserialize the payload as JSON
    pub fn decode_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, ConsumerError> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| ConsumerError::DeserializationError(e.to_string()))
    }

    pub fn routing_key(&self) -> &str {
        &self.metadata.routing_key
    }

    pub fn delivery_tag(&self) -> u64 {
        self.metadata.delivery_tag
    }

    /// Lossy, truncated payload text for logging dropped messages
    pub fn payload_preview(&self) -> String {
        let end = self.payload.len().min(PAYLOAD_PREVIEW_LEN);
        let mut preview = String::from_utf8_lossy(&self.payload[..end]).into_owned();
        if self.payload.len() > end {
            preview.push_str("...");
        }
        preview
    }
}

impl From<Delivery> for IncomingMessage {
    fn from(delivery: Delivery) -> Self {
        Self {
            payload: delivery.data,
            metadata: MessageMetadata {
                exchange: delivery.exchange.as_str().to_string(),
                routing_key: delivery.routing_key.as_str().to_string(),
                delivery_tag: delivery.delivery_tag,
                redelivered: delivery.redelivered,
            },
        }
    }
}

/// Handler trait for processing messages
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process a single message
    async fn handle(&self, message: IncomingMessage) -> Result<(), ConsumerError>;

    /// Called on every polling tick of the consumer loop
    async fn tick(&self) -> Result<(), ConsumerError> {
        Ok(())
    }

    /// Called when message processing fails without ending the session
    async fn on_error(&self, message: &IncomingMessage, error: &ConsumerError) {
        warn!(
            routing_key = %message.metadata.routing_key,
            delivery_tag = message.metadata.delivery_tag,
            error = %error,
            "Message processing failed"
        );
    }
}

/// A queue to consume and the bindings feeding it
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    /// Queue name; empty for a broker-named queue
    pub queue: String,
    pub exchange: String,
    pub bindings: Vec<String>,
    /// Durable shared queue, or exclusive auto-delete queue for this session
    pub durable: bool,
}

impl Subscription {
    /// Durable queue shared by every worker of a kind
    pub fn durable(
        queue: impl Into<String>,
        exchange: impl Into<String>,
        bindings: Vec<String>,
    ) -> Self {
        Self {
            queue: queue.into(),
            exchange: exchange.into(),
            bindings,
            durable: true,
        }
    }

    /// Broker-named queue private to one session, so each worker sees every
    /// matching message
    pub fn exclusive(exchange: impl Into<String>, bindings: Vec<String>) -> Self {
        Self {
            queue: String::new(),
            exchange: exchange.into(),
            bindings,
            durable: false,
        }
    }
}

/// Builds a handler for each broker session
pub trait HandlerFactory: Send + Sync {
    type Handler: MessageHandler;

    /// Name used for logging and the connection name
    fn name(&self) -> &str;

    fn subscriptions(&self) -> Vec<Subscription>;

    /// Let the broker settle deliveries on send
    fn auto_ack(&self) -> bool {
        false
    }

    fn create(&self, channel: Arc<dyn BrokerChannel>) -> Self::Handler;
}

/// State of a worker's broker connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Consuming,
    Stopped,
}

/// Reconnecting consumer for one worker
pub struct BrokerConsumer<F: HandlerFactory> {
    config: BrokerConfig,
    worker: String,
    factory: F,
    state: Arc<RwLock<ConnectionState>>,
}

impl<F: HandlerFactory> BrokerConsumer<F> {
    pub fn new(config: BrokerConfig, worker: impl Into<String>, factory: F) -> Self {
        Self {
            config,
            worker: worker.into(),
            factory,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
        }
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Consume until `shutdown` is cancelled, reconnecting after failures
    #[instrument(skip(self, shutdown), fields(worker = %self.worker, kind = %self.factory.name()))]
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut backoff = Constant::new(self.config.reconnect_delay());
        let mut attempts = 0u32;

        while !shutdown.is_cancelled() {
            *self.state.write() = ConnectionState::Connecting;

            match self.session(&shutdown).await {
                Ok(()) => break,
                Err(e) => {
                    attempts += 1;
                    *self.state.write() = ConnectionState::Disconnected;

                    let delay = backoff
                        .next_backoff()
                        .unwrap_or_else(|| self.config.reconnect_delay());
                    warn!(
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Broker session ended, reconnecting"
                    );

                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        *self.state.write() = ConnectionState::Stopped;
        info!("Consumer stopped");
    }

    async fn session(&self, shutdown: &CancellationToken) -> Result<(), ConsumerError> {
        let session = AmqpSession::connect(&self.config, &self.worker).await?;
        let handler = self.factory.create(Arc::new(session.channel()));

        let mut deliveries = self
            .subscribe(session.consume_channel())
            .await
            .map_err(ConsumerError::Broker)?;

        *self.state.write() = ConnectionState::Consuming;
        info!("Consuming");

        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Received shutdown signal");
                    break Ok(());
                }
                _ = ticker.tick() => {
                    if let Err(e) = handler.tick().await {
                        if e.ends_session() {
                            break Err(e);
                        }
                        error!(error = %e, "Polling tick failed");
                    }
                }
                next = deliveries.next() => {
                    match next {
                        Some(Ok(delivery)) => {
                            let message = IncomingMessage::from(delivery);
                            debug!(
                                routing_key = %message.metadata.routing_key,
                                delivery_tag = message.metadata.delivery_tag,
                                "Received delivery"
                            );
                            if let Err(e) = dispatch(&handler, message).await {
                                break Err(e);
                            }
                        }
                        Some(Err(e)) => {
                            break Err(ConsumerError::Broker(BrokerError::ChannelError(e.to_string())));
                        }
                        None => break Err(ConsumerError::StreamClosed),
                    }
                }
            }
        };

        session.close().await;
        result
    }

    async fn subscribe(
        &self,
        channel: &Channel,
    ) -> Result<BoxStream<'static, lapin::Result<Delivery>>, BrokerError> {
        let mut consumers = Vec::new();

        for (index, subscription) in self.factory.subscriptions().into_iter().enumerate() {
            let queue = channel
                .queue_declare(
                    &subscription.queue,
                    QueueDeclareOptions {
                        durable: subscription.durable,
                        exclusive: !subscription.durable,
                        auto_delete: !subscription.durable,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BrokerError::TopologyError {
                    kind: "queue",
                    name: subscription.queue.clone(),
                    message: e.to_string(),
                })?;
            let queue_name = queue.name().as_str().to_string();

            for pattern in &subscription.bindings {
                channel
                    .queue_bind(
                        &queue_name,
                        &subscription.exchange,
                        pattern,
                        QueueBindOptions::default(),
                        FieldTable::default(),
                    )
                    .await
                    .map_err(|e| BrokerError::TopologyError {
                        kind: "binding",
                        name: format!("{} -> {}", pattern, queue_name),
                        message: e.to_string(),
                    })?;
            }

            let consumer = channel
                .basic_consume(
                    &queue_name,
                    &format!("{}-{}-{}", self.factory.name(), self.worker, index),
                    BasicConsumeOptions {
                        no_ack: self.factory.auto_ack(),
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BrokerError::ChannelError(e.to_string()))?;

            debug!(queue = %queue_name, bindings = ?subscription.bindings, "Subscribed");
            consumers.push(consumer.boxed());
        }

        Ok(stream::select_all(consumers).boxed())
    }
}

/// Hand one message to the handler. Only session-ending errors propagate.
pub async fn dispatch<H: MessageHandler + ?Sized>(
    handler: &H,
    message: IncomingMessage,
) -> Result<(), ConsumerError> {
    let preview = message.clone();
    match handler.handle(message).await {
        Ok(()) => Ok(()),
        Err(e) if e.ends_session() => Err(e),
        Err(e) => {
            handler.on_error(&preview, &e).await;
            Ok(())
        }
    }
}
