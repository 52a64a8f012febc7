//! The five sink consumers.

use crate::config::ConsumerKind;
use crate::repository::{
    CommandEntity, EventEntity, ObservationEntity, PulseEntity, Repository, StatisticsEntity,
    StorageError,
};
use crate::sink::{Sink, SinkError};
use async_trait::async_trait;
use chrono::Utc;
use hivelink_pipeline::cache::TemplateCache;
use hivelink_pipeline::codec::Value;
use hivelink_pipeline::consumer::IncomingMessage;
use hivelink_pipeline::model::{
    self, CommandMessage, EventMessage, PulseCategory, PulseMessage, RoutedObservation,
};
use hivelink_pipeline::routing::{self, DeviceRoute};
use std::sync::Arc;
use std::time::Duration;

fn route(message: &IncomingMessage) -> Result<DeviceRoute<'_>, SinkError> {
    DeviceRoute::parse(message.routing_key())
        .ok_or_else(|| SinkError::Poison("unroutable routing key".to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(message: &IncomingMessage) -> Result<T, SinkError> {
    message
        .decode_json()
        .map_err(|e| SinkError::Poison(e.to_string()))
}

fn same_device(route_device: &str, body_device: &str) -> Result<(), SinkError> {
    if route_device != body_device {
        return Err(SinkError::Poison(format!(
            "body device {} does not match routing key device {}",
            body_device, route_device
        )));
    }
    Ok(())
}

/// Stores observations whose device, observation id and type match the
/// device's template.
pub struct ObservationSink {
    repository: Arc<dyn Repository<ObservationEntity>>,
    max_future_skew: chrono::Duration,
}

impl ObservationSink {
    pub fn new(repository: Arc<dyn Repository<ObservationEntity>>, max_future_skew: Duration) -> Self {
        Self {
            repository,
            max_future_skew: chrono::Duration::from_std(max_future_skew)
                .unwrap_or(chrono::Duration::hours(1)),
        }
    }
}

#[async_trait]
impl Sink for ObservationSink {
    type Entity = ObservationEntity;

    fn kind(&self) -> ConsumerKind {
        ConsumerKind::Observation
    }

    fn bindings(&self) -> Vec<String> {
        vec![routing::binding_pattern(routing::OBSERVATION_SEGMENT)]
    }

    async fn prepare(
        &self,
        message: &IncomingMessage,
        cache: &TemplateCache,
    ) -> Result<ObservationEntity, SinkError> {
        let DeviceRoute::Observation { device_id, .. } = route(message)? else {
            return Err(SinkError::Poison("not an observation key".to_string()));
        };
        let observation: RoutedObservation = decode(message)?;
        same_device(device_id, &observation.device_id)?;

        let template = cache
            .template_for(device_id)
            .await
            .map_err(|e| SinkError::Transient(e.to_string()))?
            .ok_or_else(|| SinkError::Poison(format!("unknown device {}", device_id)))?;

        let expected = template
            .observation_type(observation.observation_id)
            .ok_or_else(|| {
                SinkError::Poison(format!(
                    "observation {} not in template {}",
                    observation.observation_id, template.id
                ))
            })?;
        if expected != observation.data_type() {
            return Err(SinkError::Poison(format!(
                "observation {} is {} but template declares {}",
                observation.observation_id,
                observation.data_type().as_str(),
                expected.as_str()
            )));
        }

        if observation.timestamp > Utc::now() + self.max_future_skew {
            return Err(SinkError::Poison(format!(
                "timestamp {} is too far in the future",
                observation.timestamp
            )));
        }

        Ok(ObservationEntity {
            device_id: observation.device_id,
            observation_id: i64::from(observation.observation_id),
            data_type: expected.as_str().to_string(),
            value: model::value_to_json(&observation.value),
            timestamp: observation.timestamp,
        })
    }

    async fn store(&self, entities: &[ObservationEntity]) -> Result<u64, StorageError> {
        self.repository.create_batch(entities).await
    }
}

pub struct StatisticsSink {
    repository: Arc<dyn Repository<StatisticsEntity>>,
}

impl StatisticsSink {
    pub fn new(repository: Arc<dyn Repository<StatisticsEntity>>) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl Sink for StatisticsSink {
    type Entity = StatisticsEntity;

    fn kind(&self) -> ConsumerKind {
        ConsumerKind::Statistics
    }

    fn bindings(&self) -> Vec<String> {
        vec![routing::binding_pattern(routing::STATISTICS_SEGMENT)]
    }

    async fn prepare(
        &self,
        message: &IncomingMessage,
        _cache: &TemplateCache,
    ) -> Result<StatisticsEntity, SinkError> {
        let DeviceRoute::Statistics { device_id, .. } = route(message)? else {
            return Err(SinkError::Poison("not a statistics key".to_string()));
        };
        let observation: RoutedObservation = decode(message)?;
        same_device(device_id, &observation.device_id)?;

        let stats = match observation.value {
            Value::Statistics(stats) => stats,
            other => {
                return Err(SinkError::Poison(format!(
                    "expected Statistics, got {}",
                    other.data_type().as_str()
                )))
            }
        };

        Ok(StatisticsEntity {
            device_id: observation.device_id,
            observation_id: i64::from(observation.observation_id),
            count: i64::from(stats.count),
            mean: stats.mean,
            min: stats.min,
            max: stats.max,
            median: stats.median,
            stddev: stats.stddev,
            range_from: stats.range_from,
            range_to: stats.range_to,
            timestamp: observation.timestamp,
        })
    }

    async fn store(&self, entities: &[StatisticsEntity]) -> Result<u64, StorageError> {
        self.repository.create_batch(entities).await
    }
}

pub struct CommandSink {
    repository: Arc<dyn Repository<CommandEntity>>,
}

impl CommandSink {
    pub fn new(repository: Arc<dyn Repository<CommandEntity>>) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl Sink for CommandSink {
    type Entity = CommandEntity;

    fn kind(&self) -> ConsumerKind {
        ConsumerKind::Command
    }

    fn bindings(&self) -> Vec<String> {
        vec![routing::binding_pattern(routing::COMMAND_SEGMENT)]
    }

    async fn prepare(
        &self,
        message: &IncomingMessage,
        _cache: &TemplateCache,
    ) -> Result<CommandEntity, SinkError> {
        let DeviceRoute::Command { device_id, .. } = route(message)? else {
            return Err(SinkError::Poison("not a command key".to_string()));
        };
        let command: CommandMessage = decode(message)?;
        same_device(device_id, &command.device_id)?;

        Ok(CommandEntity {
            device_id: command.device_id,
            command_id: i64::from(command.command_id),
            payload: command.payload,
            timestamp: command.timestamp,
        })
    }

    async fn store(&self, entities: &[CommandEntity]) -> Result<u64, StorageError> {
        self.repository.create_batch(entities).await
    }
}

pub struct EventSink {
    repository: Arc<dyn Repository<EventEntity>>,
}

impl EventSink {
    pub fn new(repository: Arc<dyn Repository<EventEntity>>) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl Sink for EventSink {
    type Entity = EventEntity;

    fn kind(&self) -> ConsumerKind {
        ConsumerKind::Event
    }

    fn bindings(&self) -> Vec<String> {
        vec![routing::binding_pattern(routing::EVENT_SEGMENT)]
    }

    async fn prepare(
        &self,
        message: &IncomingMessage,
        _cache: &TemplateCache,
    ) -> Result<EventEntity, SinkError> {
        let DeviceRoute::Event { device_id, .. } = route(message)? else {
            return Err(SinkError::Poison("not an event key".to_string()));
        };
        let event: EventMessage = decode(message)?;
        same_device(device_id, &event.device_id)?;

        Ok(EventEntity {
            device_id: event.device_id,
            event_id: i64::from(event.event_id),
            payload: event.payload,
            timestamp: event.timestamp,
        })
    }

    async fn store(&self, entities: &[EventEntity]) -> Result<u64, StorageError> {
        self.repository.create_batch(entities).await
    }
}

pub struct PulseSink {
    repository: Arc<dyn Repository<PulseEntity>>,
}

impl PulseSink {
    pub fn new(repository: Arc<dyn Repository<PulseEntity>>) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl Sink for PulseSink {
    type Entity = PulseEntity;

    fn kind(&self) -> ConsumerKind {
        ConsumerKind::Pulse
    }

    fn bindings(&self) -> Vec<String> {
        vec![routing::binding_pattern(routing::PULSE_SEGMENT)]
    }

    async fn prepare(
        &self,
        message: &IncomingMessage,
        _cache: &TemplateCache,
    ) -> Result<PulseEntity, SinkError> {
        let DeviceRoute::Pulse { device_id } = route(message)? else {
            return Err(SinkError::Poison("not a pulse key".to_string()));
        };
        let pulse: PulseMessage = decode(message)?;
        same_device(device_id, &pulse.device_id)?;

        let category = match pulse.category {
            PulseCategory::Heartbeat => "Heartbeat",
        };
        Ok(PulseEntity {
            device_id: pulse.device_id,
            category: category.to_string(),
            timestamp: pulse.timestamp,
        })
    }

    async fn store(&self, entities: &[PulseEntity]) -> Result<u64, StorageError> {
        self.repository.create_batch(entities).await
    }
}
