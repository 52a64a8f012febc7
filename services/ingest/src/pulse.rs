//! Device heartbeat synthesis.
//!
//! Two strategies publish `Heartbeat` pulses onto the routed exchange: one
//! watches device traffic, the other polls the broker's connection list.
//! Both are best-effort; a missed window only delays the next pulse.

use crate::config::PulseConfig;
use crate::management::{self, ConnectionSource, ManagementError};
use async_trait::async_trait;
use chrono::Utc;
use hivelink_pipeline::channel::{AmqpSession, BrokerChannel, BrokerError};
use hivelink_pipeline::config::{BrokerConfig, ConfigError, PublishConfig};
use hivelink_pipeline::consumer::{
    BrokerConsumer, ConsumerError, HandlerFactory, IncomingMessage, MessageHandler, Subscription,
};
use hivelink_pipeline::model::PulseMessage;
use hivelink_pipeline::producer::OutgoingMessage;
use hivelink_pipeline::routing::{self, DeviceRoute};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[derive(Error, Debug)]
pub enum PulseError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Management(#[from] ManagementError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to serialize pulse: {0}")]
    SerializationError(String),
}

/// Common lifecycle of the pulse strategies
#[async_trait]
pub trait PulseGenerator: Send {
    /// Acquire whatever the generator needs before running
    async fn init(&mut self) -> Result<(), PulseError>;

    /// Generate pulses until `shutdown` is cancelled
    async fn run(&mut self, shutdown: CancellationToken) -> Result<(), PulseError>;
}

/// Next pulse due time per device
pub struct PulseSchedule {
    interval: Duration,
    due: Mutex<HashMap<String, Instant>>,
}

impl PulseSchedule {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            due: Mutex::new(HashMap::new()),
        }
    }

    /// Device traffic seen at `now`. A first sighting pulses immediately;
    /// afterwards only once the interval has been exceeded.
    pub fn on_traffic(&self, device_id: &str, now: Instant) -> bool {
        let mut due = self.due.lock();
        match due.get_mut(device_id) {
            Some(next) if now <= *next => false,
            Some(next) => {
                *next = now + self.interval;
                true
            }
            None => {
                due.insert(device_id.to_string(), now + self.interval);
                true
            }
        }
    }

    /// Device listed as connected at `now`. Unseen devices are due at once.
    pub fn on_poll(&self, device_id: &str, now: Instant) -> bool {
        let mut due = self.due.lock();
        let next = due.entry(device_id.to_string()).or_insert(now);
        if now >= *next {
            *next = now + self.interval;
            true
        } else {
            false
        }
    }

    pub fn next_due(&self, device_id: &str) -> Option<Instant> {
        self.due.lock().get(device_id).copied()
    }

    pub fn len(&self) -> usize {
        self.due.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn pulse_message(
    routed_exchange: &str,
    device_id: &str,
    publish: &PublishConfig,
) -> Result<OutgoingMessage, PulseError> {
    let pulse = PulseMessage::heartbeat(device_id, Utc::now());
    OutgoingMessage::new_json(routed_exchange, routing::pulse_key(device_id), &pulse)
        .map(|m| m.with_publish_config(publish))
        .map_err(|e| PulseError::SerializationError(e.to_string()))
}

/// Builds traffic-watching handlers that share one schedule
#[derive(Clone)]
pub struct TrafficPulseFactory {
    device_exchange: String,
    routed_exchange: String,
    queue: String,
    publish: PublishConfig,
    schedule: Arc<PulseSchedule>,
}

impl HandlerFactory for TrafficPulseFactory {
    type Handler = TrafficPulseHandler;

    fn name(&self) -> &str {
        "pulse-traffic"
    }

    fn subscriptions(&self) -> Vec<Subscription> {
        vec![Subscription::durable(
            self.queue.clone(),
            self.device_exchange.clone(),
            vec![
                routing::binding_pattern(routing::CONTAINER_SEGMENT),
                routing::binding_pattern(routing::COMMAND_RESPONSE_SEGMENT),
            ],
        )]
    }

    fn auto_ack(&self) -> bool {
        true
    }

    fn create(&self, channel: Arc<dyn BrokerChannel>) -> TrafficPulseHandler {
        TrafficPulseHandler {
            channel,
            routed_exchange: self.routed_exchange.clone(),
            publish: self.publish.clone(),
            schedule: Arc::clone(&self.schedule),
        }
    }
}

pub struct TrafficPulseHandler {
    channel: Arc<dyn BrokerChannel>,
    routed_exchange: String,
    publish: PublishConfig,
    schedule: Arc<PulseSchedule>,
}

#[async_trait]
impl MessageHandler for TrafficPulseHandler {
    async fn handle(&self, message: IncomingMessage) -> Result<(), ConsumerError> {
        let device_id = match DeviceRoute::parse(message.routing_key()) {
            Some(route @ DeviceRoute::Container { .. })
            | Some(route @ DeviceRoute::CommandResponse { .. }) => route.device_id(),
            _ => return Ok(()),
        };

        if !self.schedule.on_traffic(device_id, Instant::now()) {
            return Ok(());
        }

        let pulse = pulse_message(&self.routed_exchange, device_id, &self.publish)
            .map_err(|e| ConsumerError::ProcessingError(e.to_string()))?;
        self.channel.publish(pulse).await?;
        debug!(device_id, "Published traffic pulse");
        Ok(())
    }
}

/// Pulses derived from device traffic
pub struct TrafficPulseGenerator {
    broker: BrokerConfig,
    workers: usize,
    factory: TrafficPulseFactory,
}

impl TrafficPulseGenerator {
    pub fn new(broker: BrokerConfig, config: &PulseConfig) -> Self {
        let factory = TrafficPulseFactory {
            device_exchange: broker.exchanges.device_traffic.clone(),
            routed_exchange: broker.exchanges.routed.clone(),
            queue: config.queue.clone(),
            publish: broker.publish.clone(),
            schedule: Arc::new(PulseSchedule::new(config.interval())),
        };
        Self {
            broker,
            workers: config.workers,
            factory,
        }
    }
}

#[async_trait]
impl PulseGenerator for TrafficPulseGenerator {
    async fn init(&mut self) -> Result<(), PulseError> {
        self.broker.validate()?;
        Ok(())
    }

    #[instrument(skip(self, shutdown), fields(workers = self.workers))]
    async fn run(&mut self, shutdown: CancellationToken) -> Result<(), PulseError> {
        let handles: Vec<_> = (0..self.workers)
            .map(|index| {
                let consumer = BrokerConsumer::new(
                    self.broker.clone(),
                    format!("pulse-traffic-{}", index),
                    self.factory.clone(),
                );
                let shutdown = shutdown.clone();
                tokio::spawn(async move { consumer.run(shutdown).await })
            })
            .collect();

        for handle in futures::future::join_all(handles).await {
            if let Err(e) = handle {
                warn!(error = %e, "Pulse worker task failed");
            }
        }
        info!(devices = self.factory.schedule.len(), "Traffic pulse generator stopped");
        Ok(())
    }
}

/// Pulses derived from the broker's live connection list
pub struct ConnectionPulseGenerator {
    broker: BrokerConfig,
    source: Arc<dyn ConnectionSource>,
    schedule: PulseSchedule,
    skip_prefixes: Vec<String>,
    poll_interval: Duration,
    session: Option<AmqpSession>,
    channel: Option<Arc<dyn BrokerChannel>>,
}

impl ConnectionPulseGenerator {
    pub fn new(broker: BrokerConfig, config: &PulseConfig, source: Arc<dyn ConnectionSource>) -> Self {
        Self {
            broker,
            source,
            schedule: PulseSchedule::new(config.interval()),
            skip_prefixes: config.skip_prefixes.clone(),
            poll_interval: config.poll_interval(),
            session: None,
            channel: None,
        }
    }

    /// Fetch the connection list once and pulse every due device.
    /// Returns the number of pulses published.
    pub async fn poll_once(
        &self,
        channel: &dyn BrokerChannel,
        now: Instant,
    ) -> Result<usize, PulseError> {
        let connections = self.source.connections().await?;
        let devices = management::device_identities(&connections, &self.skip_prefixes);

        let mut published = 0;
        for device_id in devices {
            if self.schedule.on_poll(&device_id, now) {
                let pulse = pulse_message(
                    &self.broker.exchanges.routed,
                    &device_id,
                    &self.broker.publish,
                )?;
                channel.publish(pulse).await?;
                published += 1;
            }
        }
        Ok(published)
    }

    async fn disconnect(&mut self) {
        self.channel = None;
        if let Some(session) = self.session.take() {
            session.close().await;
        }
    }
}

#[async_trait]
impl PulseGenerator for ConnectionPulseGenerator {
    async fn init(&mut self) -> Result<(), PulseError> {
        self.broker.validate()?;
        let session = AmqpSession::connect(&self.broker, "pulse-connections").await?;
        self.channel = Some(Arc::new(session.channel()));
        self.session = Some(session);
        Ok(())
    }

    #[instrument(skip(self, shutdown))]
    async fn run(&mut self, shutdown: CancellationToken) -> Result<(), PulseError> {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if self.channel.is_none() {
                if let Err(e) = self.init().await {
                    warn!(error = %e, "Reconnect failed, skipping poll");
                    continue;
                }
            }
            let Some(channel) = self.channel.clone() else {
                continue;
            };

            match self.poll_once(channel.as_ref(), Instant::now()).await {
                Ok(published) => debug!(published, "Connection poll complete"),
                Err(PulseError::Broker(e)) => {
                    warn!(error = %e, "Broker failure during poll, reconnecting next tick");
                    self.disconnect().await;
                }
                Err(e) => warn!(error = %e, "Connection poll failed"),
            }
        }

        self.disconnect().await;
        info!(devices = self.schedule.len(), "Connection pulse generator stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::management::{ConnectionInfo, MockConnectionSource};
    use hivelink_pipeline::channel::MockBrokerChannel;

    const INTERVAL: Duration = Duration::from_secs(60);

    fn connected(users: &[&str]) -> Vec<ConnectionInfo> {
        users
            .iter()
            .map(|u| ConnectionInfo {
                user: Some(u.to_string()),
                state: Some("running".to_string()),
            })
            .collect()
    }

    #[test]
    fn test_traffic_pulse_interval() {
        let schedule = PulseSchedule::new(INTERVAL);
        let t0 = Instant::now();

        assert!(schedule.on_traffic("X1", t0));
        assert!(!schedule.on_traffic("X1", t0 + Duration::from_secs(30)));
        assert!(!schedule.on_traffic("X1", t0 + INTERVAL));

        let t1 = t0 + Duration::from_secs(61);
        assert!(schedule.on_traffic("X1", t1));
        assert_eq!(schedule.next_due("X1"), Some(t1 + INTERVAL));
        assert!(!schedule.on_traffic("X1", t1 + Duration::from_secs(1)));
    }

    #[test]
    fn test_poll_pulse_due_inclusive() {
        let schedule = PulseSchedule::new(INTERVAL);
        let t0 = Instant::now();

        assert!(schedule.on_poll("X1", t0));
        assert!(!schedule.on_poll("X1", t0 + Duration::from_secs(30)));
        assert!(schedule.on_poll("X1", t0 + INTERVAL));
        assert_eq!(schedule.next_due("X1"), Some(t0 + INTERVAL + INTERVAL));
    }

    #[test]
    fn test_devices_scheduled_independently() {
        let schedule = PulseSchedule::new(INTERVAL);
        let t0 = Instant::now();
        assert!(schedule.on_traffic("X1", t0));
        assert!(schedule.on_traffic("X2", t0 + Duration::from_secs(10)));
        assert_eq!(schedule.len(), 2);
    }

    fn traffic_handler(channel: MockBrokerChannel) -> TrafficPulseHandler {
        TrafficPulseHandler {
            channel: Arc::new(channel),
            routed_exchange: "hivelink.routed".to_string(),
            publish: PublishConfig::default(),
            schedule: Arc::new(PulseSchedule::new(INTERVAL)),
        }
    }

    #[tokio::test]
    async fn test_traffic_handler_publishes_once_per_window() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_publish()
            .withf(|m| m.routing_key == "X1.pulse" && m.exchange == "hivelink.routed")
            .times(1)
            .returning(|_| Ok(()));

        let handler = traffic_handler(channel);
        handler
            .handle(IncomingMessage::new("X1.container.b64", 1, vec![]))
            .await
            .unwrap();
        handler
            .handle(IncomingMessage::new("X1.cmdresp.2", 2, vec![]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_traffic_handler_ignores_other_routes() {
        let mut channel = MockBrokerChannel::new();
        channel.expect_publish().never();

        let handler = traffic_handler(channel);
        for key in ["X1.cmd.2", "X1.obs.5", "system.notification.template", "junk"] {
            handler.handle(IncomingMessage::new(key, 1, vec![])).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_pulse_body() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_publish()
            .withf(|m| {
                let pulse: PulseMessage = serde_json::from_slice(&m.payload).unwrap();
                pulse.device_id == "X9" && m.ttl == Some(Duration::from_secs(60))
            })
            .times(1)
            .returning(|_| Ok(()));

        traffic_handler(channel)
            .handle(IncomingMessage::new("X9.container.raw", 1, vec![]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_connection_poll_pulses_due_devices() {
        let mut source = MockConnectionSource::new();
        source
            .expect_connections()
            .returning(|| Ok(connected(&["X1", "X2", "internal-storage"])));

        let mut channel = MockBrokerChannel::new();
        channel.expect_publish().times(2).returning(|_| Ok(()));

        let generator = ConnectionPulseGenerator::new(
            BrokerConfig::default(),
            &PulseConfig::default(),
            Arc::new(source),
        );
        let t0 = Instant::now();
        assert_eq!(generator.poll_once(&channel, t0).await.unwrap(), 2);
        assert_eq!(
            generator
                .poll_once(&channel, t0 + Duration::from_secs(30))
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_connection_poll_surfaces_management_errors() {
        let mut source = MockConnectionSource::new();
        source
            .expect_connections()
            .returning(|| Err(ManagementError::RequestError("503".into())));

        let generator = ConnectionPulseGenerator::new(
            BrokerConfig::default(),
            &PulseConfig::default(),
            Arc::new(source),
        );
        let channel = MockBrokerChannel::new();
        assert!(matches!(
            generator.poll_once(&channel, Instant::now()).await,
            Err(PulseError::Management(_))
        ));
    }
}
