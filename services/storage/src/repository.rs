//! Stored entities and the repository seam the sinks write through.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Invalid stored row: {0}")]
    InvalidRow(String),
}

/// One stored observation value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ObservationEntity {
    pub device_id: String,
    pub observation_id: i64,
    /// Data type name, as in the template schema
    pub data_type: String,
    pub value: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Aggregated statistics a device computed over a time range
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct StatisticsEntity {
    pub device_id: String,
    pub observation_id: i64,
    pub count: i64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub median: f64,
    pub stddev: f64,
    pub range_from: DateTime<Utc>,
    pub range_to: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct CommandEntity {
    pub device_id: String,
    pub command_id: i64,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct EventEntity {
    pub device_id: String,
    pub event_id: i64,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct PulseEntity {
    pub device_id: String,
    pub category: String,
    pub timestamp: DateTime<Utc>,
}

/// Storage for one entity kind.
///
/// Writes are idempotent: storing an entity that already exists succeeds
/// without duplicating it, so redelivered batches can be written again.
#[async_trait]
pub trait Repository<E: Send + Sync + 'static>: Send + Sync {
    /// Store one entity. Returns whether it was accepted.
    async fn create(&self, entity: &E) -> Result<bool, StorageError> {
        let stored = self.create_batch(std::slice::from_ref(entity)).await?;
        Ok(stored > 0)
    }

    /// Store a batch in one write. Returns the number of entities accepted.
    async fn create_batch(&self, entities: &[E]) -> Result<u64, StorageError>;

    /// Most recent entities for a device, newest first
    async fn get(&self, device_id: &str, limit: i64) -> Result<Vec<E>, StorageError>;
}
