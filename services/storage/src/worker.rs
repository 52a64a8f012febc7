//! Worker spawning by consumer kind.
//!
//! Each worker owns its own broker connection, batch buffer and template
//! cache. Repositories share the process-wide connection pool.

use crate::config::{Config, ConsumerKind, WorkerConfig};
use crate::pg_repository::{
    PgCommandRepository, PgEventRepository, PgObservationRepository, PgPulseRepository,
    PgStatisticsRepository,
};
use crate::repository::{
    CommandEntity, EventEntity, ObservationEntity, PulseEntity, Repository, StatisticsEntity,
};
use crate::sink::{Sink, SinkFactory};
use crate::sinks::{CommandSink, EventSink, ObservationSink, PulseSink, StatisticsSink};
use hivelink_pipeline::cache::TemplateCache;
use hivelink_pipeline::config::{BrokerConfig, ConfigError};
use hivelink_pipeline::consumer::BrokerConsumer;
use hivelink_pipeline::directory::DeviceDirectory;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// One repository per entity kind
#[derive(Clone)]
pub struct Repositories {
    pub observations: Arc<dyn Repository<ObservationEntity>>,
    pub statistics: Arc<dyn Repository<StatisticsEntity>>,
    pub commands: Arc<dyn Repository<CommandEntity>>,
    pub events: Arc<dyn Repository<EventEntity>>,
    pub pulses: Arc<dyn Repository<PulseEntity>>,
}

impl Repositories {
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            observations: Arc::new(PgObservationRepository::new(pool.clone())),
            statistics: Arc::new(PgStatisticsRepository::new(pool.clone())),
            commands: Arc::new(PgCommandRepository::new(pool.clone())),
            events: Arc::new(PgEventRepository::new(pool.clone())),
            pulses: Arc::new(PgPulseRepository::new(pool)),
        }
    }
}

/// Resolve every configured worker group's kind before anything starts.
pub fn plan(workers: &[WorkerConfig]) -> Result<Vec<(ConsumerKind, &WorkerConfig)>, ConfigError> {
    workers
        .iter()
        .map(|worker| worker.kind().map(|kind| (kind, worker)))
        .collect()
}

/// Start every configured worker. Nothing is spawned if any worker group
/// names an unknown kind.
pub fn spawn_workers(
    config: &Config,
    repositories: &Repositories,
    directory: Arc<dyn DeviceDirectory>,
    shutdown: &CancellationToken,
) -> Result<Vec<JoinHandle<()>>, ConfigError> {
    let mut handles = Vec::new();

    for (kind, worker) in plan(&config.workers)? {
        for index in 0..worker.count {
            let name = format!("{}-{}", kind, index);
            let cache = Arc::new(TemplateCache::new(Arc::clone(&directory)));
            let handle = match kind {
                ConsumerKind::Observation => spawn(
                    ObservationSink::new(
                        Arc::clone(&repositories.observations),
                        config.observations.max_future_skew(),
                    ),
                    &config.broker,
                    worker,
                    name,
                    cache,
                    shutdown,
                ),
                ConsumerKind::Statistics => spawn(
                    StatisticsSink::new(Arc::clone(&repositories.statistics)),
                    &config.broker,
                    worker,
                    name,
                    cache,
                    shutdown,
                ),
                ConsumerKind::Command => spawn(
                    CommandSink::new(Arc::clone(&repositories.commands)),
                    &config.broker,
                    worker,
                    name,
                    cache,
                    shutdown,
                ),
                ConsumerKind::Event => spawn(
                    EventSink::new(Arc::clone(&repositories.events)),
                    &config.broker,
                    worker,
                    name,
                    cache,
                    shutdown,
                ),
                ConsumerKind::Pulse => spawn(
                    PulseSink::new(Arc::clone(&repositories.pulses)),
                    &config.broker,
                    worker,
                    name,
                    cache,
                    shutdown,
                ),
            };
            handles.push(handle);
        }
        info!(kind = %kind, count = worker.count, "Started sink workers");
    }

    Ok(handles)
}

fn spawn<S: Sink>(
    sink: S,
    broker: &BrokerConfig,
    worker: &WorkerConfig,
    name: String,
    cache: Arc<TemplateCache>,
    shutdown: &CancellationToken,
) -> JoinHandle<()> {
    let kind = sink.kind();
    let factory = SinkFactory::new(
        Arc::new(sink),
        cache,
        worker.queue_name(kind),
        broker.exchanges.routed.clone(),
        worker.batch_size,
        worker.max_batch_age(),
    );
    let consumer = BrokerConsumer::new(broker.clone(), name, factory);
    let shutdown = shutdown.clone();
    tokio::spawn(async move { consumer.run(shutdown).await })
}
