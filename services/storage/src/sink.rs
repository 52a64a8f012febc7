//! Batching sink-consumer framework.
//!
//! A [`Sink`] knows how to turn one routed delivery into a stored entity and
//! how to write a batch of them. [`BatchingConsumer`] supplies everything
//! else: notification handling, the batch buffer, timer and size triggered
//! flushes, and settlement of deliveries.
//!
//! Settlement rules:
//!
//! - notifications evict cache entries and are acked on their own
//! - deliveries that can never be stored are nacked without requeue
//! - deliveries that failed on a transient lookup are nacked with requeue
//! - a stored batch is acked cumulatively up to its highest delivery tag
//! - a failed batch write is nacked cumulatively with requeue

use crate::config::ConsumerKind;
use crate::repository::StorageError;
use async_trait::async_trait;
use hivelink_pipeline::batch::BatchBuffer;
use hivelink_pipeline::cache::TemplateCache;
use hivelink_pipeline::channel::BrokerChannel;
use hivelink_pipeline::consumer::{
    ConsumerError, HandlerFactory, IncomingMessage, MessageHandler, Subscription,
};
use hivelink_pipeline::model::Notification;
use hivelink_pipeline::routing;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Why a delivery could not be turned into an entity
#[derive(Error, Debug)]
pub enum SinkError {
    /// The delivery can never be stored; drop it
    #[error("poison message: {0}")]
    Poison(String),

    /// A lookup failed; the delivery may succeed later
    #[error("transient failure: {0}")]
    Transient(String),
}

/// One kind of stored entity
#[async_trait]
pub trait Sink: Send + Sync + 'static {
    type Entity: Send + Sync + 'static;

    fn kind(&self) -> ConsumerKind;

    /// Routing key patterns on the routed exchange this sink consumes
    fn bindings(&self) -> Vec<String>;

    /// Validate a delivery and map it to an entity
    async fn prepare(
        &self,
        message: &IncomingMessage,
        cache: &TemplateCache,
    ) -> Result<Self::Entity, SinkError>;

    /// Write a batch. Returns the number of entities accepted.
    async fn store(&self, entities: &[Self::Entity]) -> Result<u64, StorageError>;
}

/// Buffers entities from one broker session and flushes them to a [`Sink`]
pub struct BatchingConsumer<S: Sink> {
    sink: Arc<S>,
    channel: Arc<dyn BrokerChannel>,
    cache: Arc<TemplateCache>,
    buffer: BatchBuffer<S::Entity>,
    max_batch_age: Duration,
    flush_gate: Mutex<()>,
}

impl<S: Sink> BatchingConsumer<S> {
    pub fn new(
        sink: Arc<S>,
        channel: Arc<dyn BrokerChannel>,
        cache: Arc<TemplateCache>,
        batch_size: usize,
        max_batch_age: Duration,
    ) -> Self {
        Self {
            sink,
            channel,
            cache,
            buffer: BatchBuffer::new(batch_size),
            max_batch_age,
            flush_gate: Mutex::new(()),
        }
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Write everything buffered and settle the deliveries behind it.
    pub async fn flush(&self) -> Result<(), ConsumerError> {
        let _gate = self.flush_gate.lock().await;
        let Some(batch) = self.buffer.take() else {
            return Ok(());
        };
        let kind = self.sink.kind().as_str();
        let count = batch.len();

        match self.sink.store(&batch.items).await {
            Ok(stored) if stored > 0 => {
                self.channel.ack(batch.last_tag, true).await?;
                metrics::counter!("storage.entities.stored", "kind" => kind).increment(stored);
                debug!(kind, stored, last_tag = batch.last_tag, "Flushed batch");
            }
            Ok(_) => {
                warn!(kind, count, last_tag = batch.last_tag, "Storage accepted nothing, requeueing batch");
                self.channel.nack(batch.last_tag, true, true).await?;
                metrics::counter!("storage.entities.requeued", "kind" => kind).increment(count as u64);
            }
            Err(e) => {
                warn!(kind, count, last_tag = batch.last_tag, error = %e, "Storage write failed, requeueing batch");
                self.channel.nack(batch.last_tag, true, true).await?;
                metrics::counter!("storage.entities.requeued", "kind" => kind).increment(count as u64);
            }
        }
        Ok(())
    }

    async fn handle_notification(&self, message: &IncomingMessage) -> Result<(), ConsumerError> {
        match message.decode_json::<Notification>() {
            Ok(notification) => {
                self.cache.apply(&notification);
            }
            Err(e) => {
                warn!(
                    routing_key = %message.routing_key(),
                    error = %e,
                    payload = %message.payload_preview(),
                    "Ignoring undecodable notification"
                );
            }
        }
        self.channel.ack(message.delivery_tag(), false).await?;
        Ok(())
    }
}

#[async_trait]
impl<S: Sink> MessageHandler for BatchingConsumer<S> {
    async fn handle(&self, message: IncomingMessage) -> Result<(), ConsumerError> {
        if routing::is_notification(message.routing_key()) {
            return self.handle_notification(&message).await;
        }

        let tag = message.delivery_tag();
        let kind = self.sink.kind().as_str();

        match self.sink.prepare(&message, &self.cache).await {
            Ok(entity) => {
                if self.buffer.push(entity, tag) {
                    self.flush().await?;
                }
            }
            Err(SinkError::Poison(reason)) => {
                warn!(
                    kind,
                    routing_key = %message.routing_key(),
                    delivery_tag = tag,
                    reason = %reason,
                    payload = %message.payload_preview(),
                    "Dropping message"
                );
                self.channel.nack(tag, false, false).await?;
                metrics::counter!("storage.entities.dropped", "kind" => kind).increment(1);
            }
            Err(SinkError::Transient(reason)) => {
                warn!(
                    kind,
                    routing_key = %message.routing_key(),
                    delivery_tag = tag,
                    reason = %reason,
                    "Requeueing message"
                );
                self.channel.nack(tag, false, true).await?;
                metrics::counter!("storage.entities.requeued", "kind" => kind).increment(1);
            }
        }
        Ok(())
    }

    async fn tick(&self) -> Result<(), ConsumerError> {
        if self.buffer.is_due(self.max_batch_age) {
            info!(kind = self.sink.kind().as_str(), pending = self.buffer.len(), "Flushing aged batch");
            self.flush().await?;
        }
        Ok(())
    }
}

/// Builds a [`BatchingConsumer`] per broker session for one worker
pub struct SinkFactory<S: Sink> {
    sink: Arc<S>,
    cache: Arc<TemplateCache>,
    queue: String,
    exchange: String,
    batch_size: usize,
    max_batch_age: Duration,
}

impl<S: Sink> SinkFactory<S> {
    pub fn new(
        sink: Arc<S>,
        cache: Arc<TemplateCache>,
        queue: impl Into<String>,
        exchange: impl Into<String>,
        batch_size: usize,
        max_batch_age: Duration,
    ) -> Self {
        Self {
            sink,
            cache,
            queue: queue.into(),
            exchange: exchange.into(),
            batch_size,
            max_batch_age,
        }
    }
}

impl<S: Sink> HandlerFactory for SinkFactory<S> {
    type Handler = BatchingConsumer<S>;

    fn name(&self) -> &str {
        self.sink.kind().as_str()
    }

    fn subscriptions(&self) -> Vec<Subscription> {
        vec![
            Subscription::durable(self.queue.clone(), self.exchange.clone(), self.sink.bindings()),
            // every worker needs every notification for its own cache
            Subscription::exclusive(self.exchange.clone(), vec![routing::notification_binding()]),
        ]
    }

    fn create(&self, channel: Arc<dyn BrokerChannel>) -> BatchingConsumer<S> {
        BatchingConsumer::new(
            Arc::clone(&self.sink),
            channel,
            Arc::clone(&self.cache),
            self.batch_size,
            self.max_batch_age,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hivelink_pipeline::channel::{BrokerError, MockBrokerChannel};
    use hivelink_pipeline::directory::MockDeviceDirectory;
    use mockall::predicate::eq;
    use parking_lot::Mutex as SyncMutex;
    use tokio_test::{assert_err, assert_ok};

    /// Stores payloads as strings; "poison" and "later" bodies fail prepare.
    struct TextSink {
        stored: SyncMutex<Vec<String>>,
        fail_store: bool,
    }

    impl TextSink {
        fn new(fail_store: bool) -> Arc<Self> {
            Arc::new(Self {
                stored: SyncMutex::new(Vec::new()),
                fail_store,
            })
        }
    }

    #[async_trait]
    impl Sink for TextSink {
        type Entity = String;

        fn kind(&self) -> ConsumerKind {
            ConsumerKind::Event
        }

        fn bindings(&self) -> Vec<String> {
            vec!["*.evt.*".to_string()]
        }

        async fn prepare(
            &self,
            message: &IncomingMessage,
            _cache: &TemplateCache,
        ) -> Result<String, SinkError> {
            match message.payload.as_slice() {
                b"poison" => Err(SinkError::Poison("bad body".into())),
                b"later" => Err(SinkError::Transient("directory down".into())),
                body => Ok(String::from_utf8_lossy(body).into_owned()),
            }
        }

        async fn store(&self, entities: &[String]) -> Result<u64, StorageError> {
            if self.fail_store {
                return Err(StorageError::Migration("database unavailable".into()));
            }
            self.stored.lock().extend_from_slice(entities);
            Ok(entities.len() as u64)
        }
    }

    fn cache(directory: MockDeviceDirectory) -> Arc<TemplateCache> {
        Arc::new(TemplateCache::new(Arc::new(directory)))
    }

    fn consumer(
        sink: Arc<TextSink>,
        channel: MockBrokerChannel,
        batch_size: usize,
    ) -> BatchingConsumer<TextSink> {
        BatchingConsumer::new(
            sink,
            Arc::new(channel),
            cache(MockDeviceDirectory::new()),
            batch_size,
            Duration::from_secs(2),
        )
    }

    fn event(tag: u64, body: &str) -> IncomingMessage {
        IncomingMessage::new("X1.evt.1", tag, body.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn test_nth_item_triggers_flush_and_cumulative_ack() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_ack()
            .with(eq(3u64), eq(true))
            .times(1)
            .returning(|_, _| Ok(()));

        let sink = TextSink::new(false);
        let consumer = consumer(Arc::clone(&sink), channel, 3);

        assert_ok!(consumer.handle(event(1, "a")).await);
        assert_ok!(consumer.handle(event(2, "b")).await);
        assert!(sink.stored.lock().is_empty());
        assert_ok!(consumer.handle(event(3, "c")).await);

        assert_eq!(sink.stored.lock().as_slice(), ["a", "b", "c"]);
        assert_eq!(consumer.pending(), 0);
    }

    #[tokio::test]
    async fn test_storage_failure_requeues_and_clears_buffer() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_nack()
            .with(eq(2u64), eq(true), eq(true))
            .times(1)
            .returning(|_, _, _| Ok(()));
        channel.expect_ack().never();

        let consumer = consumer(TextSink::new(true), channel, 2);
        assert_ok!(consumer.handle(event(1, "a")).await);
        assert_ok!(consumer.handle(event(2, "b")).await);
        assert_eq!(consumer.pending(), 0);
    }

    #[tokio::test]
    async fn test_poison_dropped_without_requeue() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_nack()
            .with(eq(4u64), eq(false), eq(false))
            .times(1)
            .returning(|_, _, _| Ok(()));

        let consumer = consumer(TextSink::new(false), channel, 10);
        assert_ok!(consumer.handle(event(4, "poison")).await);
        assert_eq!(consumer.pending(), 0);
    }

    #[tokio::test]
    async fn test_transient_prepare_failure_requeues_single_delivery() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_nack()
            .with(eq(5u64), eq(false), eq(true))
            .times(1)
            .returning(|_, _, _| Ok(()));

        let consumer = consumer(TextSink::new(false), channel, 10);
        assert_ok!(consumer.handle(event(5, "later")).await);
    }

    #[tokio::test]
    async fn test_notification_evicts_and_acks_immediately() {
        let mut directory = MockDeviceDirectory::new();
        directory.expect_device().times(2).returning(|id| {
            Ok(Some(hivelink_pipeline::directory::DeviceRecord {
                id: id.to_string(),
                template_id: "T1".to_string(),
                psk: "secret".to_string(),
            }))
        });
        directory
            .expect_template()
            .returning(|id| Ok(Some(hivelink_pipeline::directory::Template::new(id))));

        let mut channel = MockBrokerChannel::new();
        channel
            .expect_ack()
            .with(eq(9u64), eq(false))
            .times(1)
            .returning(|_, _| Ok(()));

        let cache = cache(directory);
        assert_ok!(cache.template_for("X1").await);

        let consumer = BatchingConsumer::new(
            TextSink::new(false),
            Arc::new(channel),
            Arc::clone(&cache),
            10,
            Duration::from_secs(2),
        );
        let body = serde_json::to_vec(&Notification::device_template_changed("X1")).unwrap();
        assert_ok!(
            consumer
                .handle(IncomingMessage::new("system.notification.device", 9, body))
                .await
        );
        assert_eq!(cache.cached_devices(), 0);
        assert_eq!(consumer.pending(), 0);

        // the next lookup goes back to the directory
        assert_ok!(cache.template_for("X1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_batch_flushed_by_tick_only_after_max_age() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_ack()
            .with(eq(2u64), eq(true))
            .times(1)
            .returning(|_, _| Ok(()));

        let sink = TextSink::new(false);
        let consumer = consumer(Arc::clone(&sink), channel, 100);
        assert_ok!(consumer.handle(event(1, "a")).await);
        assert_ok!(consumer.handle(event(2, "b")).await);

        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_ok!(consumer.tick().await);
        assert_eq!(consumer.pending(), 2);

        tokio::time::advance(Duration::from_millis(500)).await;
        assert_ok!(consumer.tick().await);
        assert_eq!(consumer.pending(), 0);
        assert_eq!(sink.stored.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_settle_failure_ends_session() {
        let mut channel = MockBrokerChannel::new();
        channel.expect_nack().returning(|tag, _, _| {
            Err(BrokerError::SettleError {
                tag,
                message: "channel closed".into(),
            })
        });

        let consumer = consumer(TextSink::new(false), channel, 10);
        let err = assert_err!(consumer.handle(event(1, "poison")).await);
        assert!(err.ends_session());
    }

    #[test]
    fn test_factory_subscribes_durable_queue_and_notifications() {
        let factory = SinkFactory::new(
            TextSink::new(false),
            cache(MockDeviceDirectory::new()),
            "hivelink.storage.event",
            "hivelink.routed",
            10,
            Duration::from_secs(2),
        );
        let subscriptions = factory.subscriptions();
        assert_eq!(factory.name(), "event");
        assert_eq!(subscriptions.len(), 2);
        assert!(subscriptions[0].durable);
        assert_eq!(subscriptions[0].bindings, ["*.evt.*"]);
        assert!(!subscriptions[1].durable);
        assert_eq!(subscriptions[1].bindings, ["system.notification.#"]);
    }
}
