//! Container fan-out.
//!
//! Consumes device container uploads, decodes them and republishes every
//! record as its own routed observation. Republished messages are buffered
//! and sent as one broker transaction; the upload deliveries that fed the
//! batch are then settled with a single cumulative ack.

use crate::config::ChopperConfig;
use hivelink_pipeline::batch::BatchBuffer;
use hivelink_pipeline::channel::BrokerChannel;
use hivelink_pipeline::codec::{self, ContainerError, DataType};
use hivelink_pipeline::config::{ExchangeConfig, PublishConfig};
use hivelink_pipeline::consumer::{
    ConsumerError, HandlerFactory, IncomingMessage, MessageHandler, Subscription,
};
use hivelink_pipeline::model::RoutedObservation;
use hivelink_pipeline::producer::OutgoingMessage;
use hivelink_pipeline::routing::{self, ContainerEncoding, DeviceRoute};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Why an upload can never be fanned out
#[derive(Error, Debug)]
pub enum PoisonReason {
    #[error("empty container body")]
    Empty,

    #[error("invalid base64: {0}")]
    Encoding(String),

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error("failed to serialize observation: {0}")]
    Serialization(String),
}

/// Decode an upload body into routed messages for the given device.
pub fn fan_out(
    device_id: &str,
    encoding: ContainerEncoding,
    body: &[u8],
    routed_exchange: &str,
    publish: &PublishConfig,
) -> Result<Vec<OutgoingMessage>, PoisonReason> {
    if body.is_empty() {
        return Err(PoisonReason::Empty);
    }

    let raw = match encoding {
        ContainerEncoding::Raw => body.to_vec(),
        ContainerEncoding::Base64 => codec::decode_base64_forgiving(body)
            .map_err(|e| PoisonReason::Encoding(e.to_string()))?,
    };
    let container = codec::decode(&raw)?;

    container
        .records
        .into_iter()
        .map(|record| {
            let routing_key = if record.data_type() == DataType::Statistics {
                routing::statistics_key(device_id, record.observation_id)
            } else {
                routing::observation_key(device_id, record.observation_id)
            };
            let observation = RoutedObservation::from_record(device_id, record);
            OutgoingMessage::new_json(routed_exchange, routing_key, &observation)
                .map(|m| m.with_publish_config(publish))
                .map_err(|e| PoisonReason::Serialization(e.to_string()))
        })
        .collect()
}

/// Builds a [`Chopper`] per broker session
pub struct ChopperFactory {
    exchanges: ExchangeConfig,
    publish: PublishConfig,
    config: ChopperConfig,
}

impl ChopperFactory {
    pub fn new(exchanges: ExchangeConfig, publish: PublishConfig, config: ChopperConfig) -> Self {
        Self {
            exchanges,
            publish,
            config,
        }
    }
}

impl HandlerFactory for ChopperFactory {
    type Handler = Chopper;

    fn name(&self) -> &str {
        "chopper"
    }

    fn subscriptions(&self) -> Vec<Subscription> {
        vec![Subscription::durable(
            self.config.queue.clone(),
            self.exchanges.device_traffic.clone(),
            vec![routing::binding_pattern(routing::CONTAINER_SEGMENT)],
        )]
    }

    fn create(&self, channel: Arc<dyn BrokerChannel>) -> Chopper {
        Chopper::new(
            channel,
            self.exchanges.routed.clone(),
            self.publish.clone(),
            self.config.batch_size,
            self.config.max_batch_age(),
        )
    }
}

/// Fan-out handler for one broker session
pub struct Chopper {
    channel: Arc<dyn BrokerChannel>,
    routed_exchange: String,
    publish: PublishConfig,
    buffer: BatchBuffer<OutgoingMessage>,
    max_batch_age: Duration,
    // serializes flushes from deliveries and ticks
    flush_gate: Mutex<()>,
}

impl Chopper {
    pub fn new(
        channel: Arc<dyn BrokerChannel>,
        routed_exchange: String,
        publish: PublishConfig,
        batch_size: usize,
        max_batch_age: Duration,
    ) -> Self {
        Self {
            channel,
            routed_exchange,
            publish,
            buffer: BatchBuffer::new(batch_size),
            max_batch_age,
            flush_gate: Mutex::new(()),
        }
    }

    /// Messages waiting for the next flush
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Publish everything buffered as one transaction and settle the
    /// originating uploads.
    pub async fn flush(&self) -> Result<(), ConsumerError> {
        let _gate = self.flush_gate.lock().await;
        let Some(batch) = self.buffer.take() else {
            return Ok(());
        };
        let count = batch.len();

        match self.channel.publish_batch(batch.items).await {
            Ok(()) => {
                self.channel.ack(batch.last_tag, true).await?;
                debug!(count, last_tag = batch.last_tag, "Flushed fan-out batch");
            }
            Err(e) => {
                warn!(
                    count,
                    last_tag = batch.last_tag,
                    error = %e,
                    "Fan-out publish failed, requeueing uploads"
                );
                self.channel.nack(batch.last_tag, true, true).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for Chopper {
    async fn handle(&self, message: IncomingMessage) -> Result<(), ConsumerError> {
        let tag = message.delivery_tag();

        let (device_id, encoding) = match DeviceRoute::parse(message.routing_key()) {
            Some(DeviceRoute::Container {
                device_id,
                encoding,
            }) => (device_id, encoding),
            _ => {
                debug!(routing_key = %message.routing_key(), "Ignoring non-container delivery");
                self.channel.ack(tag, false).await?;
                return Ok(());
            }
        };

        let messages = match fan_out(
            device_id,
            encoding,
            &message.payload,
            &self.routed_exchange,
            &self.publish,
        ) {
            Ok(messages) => messages,
            Err(reason) => {
                warn!(
                    routing_key = %message.routing_key(),
                    delivery_tag = tag,
                    reason = %reason,
                    payload = %message.payload_preview(),
                    "Dropping malformed container"
                );
                self.channel.nack(tag, false, false).await?;
                return Ok(());
            }
        };

        if messages.is_empty() {
            self.channel.ack(tag, false).await?;
            return Ok(());
        }

        debug!(device_id, records = messages.len(), "Decoded container");
        if self.buffer.push_many(messages, tag) {
            self.flush().await?;
        }
        Ok(())
    }

    async fn tick(&self) -> Result<(), ConsumerError> {
        if self.buffer.is_due(self.max_batch_age) {
            info!(pending = self.buffer.len(), "Flushing aged fan-out batch");
            self.flush().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use hivelink_pipeline::channel::{BrokerError, MockBrokerChannel};
    use hivelink_pipeline::codec::{Record, Statistics, Value, VERSION_1, VERSION_2};
    use mockall::predicate::eq;

    const ROUTED: &str = "hivelink.routed";

    fn container(records: usize) -> Vec<u8> {
        let ts = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let records: Vec<Record> = (0..records)
            .map(|i| Record::new(i as u32, ts, Value::Integer(i as i64)))
            .collect();
        codec::encode(&records, VERSION_1, 0).unwrap().to_vec()
    }

    fn chopper(channel: MockBrokerChannel, batch_size: usize) -> Chopper {
        Chopper::new(
            Arc::new(channel),
            ROUTED.to_string(),
            PublishConfig::default(),
            batch_size,
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_fan_out_routes_each_record() {
        let ts = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let records = vec![
            Record::new(5, ts, Value::Double(1.0)),
            Record::new(
                9,
                ts,
                Value::Statistics(Statistics {
                    count: 1,
                    mean: 1.0,
                    min: 1.0,
                    max: 1.0,
                    median: 1.0,
                    stddev: 0.0,
                    range_from: ts,
                    range_to: ts,
                }),
            ),
        ];
        let body = codec::encode(&records, VERSION_2, 0).unwrap();

        let messages = fan_out("X1", ContainerEncoding::Raw, &body, ROUTED, &PublishConfig::default())
            .unwrap();
        let keys: Vec<_> = messages.iter().map(|m| m.routing_key.as_str()).collect();
        assert_eq!(keys, ["X1.obs.5", "X1.stats.9"]);
        assert!(messages.iter().all(|m| m.ttl == Some(Duration::from_secs(60)) && !m.persistent));

        let first: RoutedObservation = serde_json::from_slice(&messages[0].payload).unwrap();
        assert_eq!(first.device_id, "X1");
        assert_eq!(first.value, Value::Double(1.0));
    }

    #[test]
    fn test_fan_out_keeps_non_finite_readings() {
        use hivelink_pipeline::codec::Position;
        use hivelink_pipeline::model::value_to_json;

        let ts = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let records = vec![
            Record::new(5, ts, Value::Double(f64::NAN)),
            Record::new(
                6,
                ts,
                Value::Position(Position {
                    lat: 1.0,
                    lon: f64::INFINITY,
                    alt: f64::NAN,
                }),
            ),
            Record::new(
                9,
                ts,
                Value::Statistics(Statistics {
                    count: 1,
                    mean: 3.0,
                    min: 3.0,
                    max: 3.0,
                    median: 3.0,
                    stddev: f64::NAN,
                    range_from: ts,
                    range_to: ts,
                }),
            ),
        ];
        let body = codec::encode(&records, VERSION_2, 0).unwrap();
        let messages = fan_out("X1", ContainerEncoding::Raw, &body, ROUTED, &PublishConfig::default())
            .unwrap();
        assert_eq!(messages.len(), records.len());

        for (message, record) in messages.iter().zip(&records) {
            let routed: RoutedObservation = serde_json::from_slice(&message.payload).unwrap();
            assert_eq!(routed.observation_id, record.observation_id);
            assert_eq!(value_to_json(&routed.value), value_to_json(&record.value));
        }
        let first: RoutedObservation = serde_json::from_slice(&messages[0].payload).unwrap();
        assert!(matches!(first.value, Value::Double(v) if v.is_nan()));
    }

    #[test]
    fn test_fan_out_base64_with_missing_padding() {
        use base64::Engine;
        let raw = container(1);
        let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(&raw);
        let messages = fan_out(
            "X1",
            ContainerEncoding::Base64,
            encoded.as_bytes(),
            ROUTED,
            &PublishConfig::default(),
        )
        .unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn test_fan_out_poison_reasons() {
        let publish = PublishConfig::default();
        assert!(matches!(
            fan_out("X1", ContainerEncoding::Raw, b"", ROUTED, &publish),
            Err(PoisonReason::Empty)
        ));
        assert!(matches!(
            fan_out("X1", ContainerEncoding::Base64, b"!!!!", ROUTED, &publish),
            Err(PoisonReason::Encoding(_))
        ));
        let mut truncated = container(2);
        truncated.pop();
        assert!(matches!(
            fan_out("X1", ContainerEncoding::Raw, &truncated, ROUTED, &publish),
            Err(PoisonReason::Container(_))
        ));
    }

    #[tokio::test]
    async fn test_full_batch_publishes_and_acks_cumulatively() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_publish_batch()
            .withf(|messages| messages.len() == 4)
            .times(1)
            .returning(|_| Ok(()));
        channel
            .expect_ack()
            .with(eq(2u64), eq(true))
            .times(1)
            .returning(|_, _| Ok(()));

        let chopper = chopper(channel, 4);
        chopper
            .handle(IncomingMessage::new("X1.container.raw", 1, container(2)))
            .await
            .unwrap();
        assert_eq!(chopper.pending(), 2);
        chopper
            .handle(IncomingMessage::new("X2.container.raw", 2, container(2)))
            .await
            .unwrap();
        assert_eq!(chopper.pending(), 0);
    }

    #[tokio::test]
    async fn test_publish_failure_requeues_batch() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_publish_batch()
            .times(1)
            .returning(|_| Err(BrokerError::TransactionError("rollback".into())));
        channel
            .expect_nack()
            .with(eq(7u64), eq(true), eq(true))
            .times(1)
            .returning(|_, _, _| Ok(()));
        channel.expect_ack().never();

        let chopper = chopper(channel, 1);
        chopper
            .handle(IncomingMessage::new("X1.container.raw", 7, container(3)))
            .await
            .unwrap();
        assert_eq!(chopper.pending(), 0);
    }

    #[tokio::test]
    async fn test_malformed_container_dropped_without_requeue() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_nack()
            .with(eq(3u64), eq(false), eq(false))
            .times(1)
            .returning(|_, _, _| Ok(()));
        channel.expect_publish_batch().never();

        let chopper = chopper(channel, 10);
        chopper
            .handle(IncomingMessage::new("X1.container.b64", 3, b"%%%".to_vec()))
            .await
            .unwrap();
        assert_eq!(chopper.pending(), 0);
    }

    #[tokio::test]
    async fn test_non_container_and_empty_container_acked_individually() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_ack()
            .with(eq(1u64), eq(false))
            .times(1)
            .returning(|_, _| Ok(()));
        channel
            .expect_ack()
            .with(eq(2u64), eq(false))
            .times(1)
            .returning(|_, _| Ok(()));

        let chopper = chopper(channel, 10);
        chopper
            .handle(IncomingMessage::new("X1.cmdresp.4", 1, b"{}".to_vec()))
            .await
            .unwrap();
        chopper
            .handle(IncomingMessage::new("X1.container.raw", 2, container(0)))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_batch_flushed_by_tick_once_aged() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_publish_batch()
            .times(1)
            .returning(|_| Ok(()));
        channel
            .expect_ack()
            .with(eq(5u64), eq(true))
            .times(1)
            .returning(|_, _| Ok(()));

        let chopper = chopper(channel, 100);
        chopper
            .handle(IncomingMessage::new("X1.container.raw", 5, container(3)))
            .await
            .unwrap();

        chopper.tick().await.unwrap();
        assert_eq!(chopper.pending(), 3);

        tokio::time::advance(Duration::from_secs(1)).await;
        chopper.tick().await.unwrap();
        assert_eq!(chopper.pending(), 0);
    }

    #[tokio::test]
    async fn test_settle_failure_ends_session() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_ack()
            .returning(|tag, _| {
                Err(BrokerError::SettleError {
                    tag,
                    message: "channel closed".into(),
                })
            });

        let chopper = chopper(channel, 10);
        let err = chopper
            .handle(IncomingMessage::new("unrelated", 1, vec![]))
            .await
            .unwrap_err();
        assert!(err.ends_session());
    }
}
