//! Hivelink Storage Service
//!
//! Batching sink consumers that persist routed device traffic in PostgreSQL.
//! One worker group per consumer kind reads its durable queue on the routed
//! exchange, validates each delivery, buffers the resulting entities and
//! writes them in batches. Every worker also listens for metadata
//! notifications to keep its template cache current.
//!
//! ## Architecture
//!
//! ```text
//! routed exchange
//! ┌──────────────────────┐     ┌───────────────────┐     ┌──────────────────┐
//! │ *.obs.*   *.stats.*  │────▶│ BatchingConsumer  │────▶│ Repository       │
//! │ *.cmd.*   *.evt.*    │     │  + Sink per kind  │     │ (PostgreSQL)     │
//! │ *.pulse              │     └───────────────────┘     └──────────────────┘
//! │ system.notification.#│────▶ TemplateCache eviction
//! └──────────────────────┘
//! ```

pub mod config;
pub mod pg_repository;
pub mod repository;
pub mod sink;
pub mod sinks;
pub mod worker;

pub use config::{Config, ConsumerKind, WorkerConfig};
pub use pg_repository::run_migrations;
pub use repository::{
    CommandEntity, EventEntity, ObservationEntity, PulseEntity, Repository, StatisticsEntity,
    StorageError,
};
pub use sink::{BatchingConsumer, Sink, SinkError, SinkFactory};
pub use sinks::{CommandSink, EventSink, ObservationSink, PulseSink, StatisticsSink};
pub use worker::{spawn_workers, Repositories};
