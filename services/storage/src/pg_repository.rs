//! PostgreSQL repositories.
//!
//! Every batch is one multi-row insert with `ON CONFLICT DO NOTHING`, so a
//! redelivered batch is accepted again without duplicating rows. The count
//! returned is the number of entities the write accepted, duplicates
//! included.

use crate::repository::{
    CommandEntity, EventEntity, ObservationEntity, PulseEntity, Repository, StatisticsEntity,
    StorageError,
};
use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::{Postgres, QueryBuilder};
use std::collections::HashMap;
use tracing::{debug, info, instrument};

/// Apply the bundled schema migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), StorageError> {
    info!("Running database migrations");

    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| StorageError::Migration(e.to_string()))?;

    info!("Database migrations completed");
    Ok(())
}

/// Keep only the newest entity per (device, observation).
fn latest_values(entities: &[ObservationEntity]) -> Vec<&ObservationEntity> {
    let mut latest: HashMap<(&str, i64), &ObservationEntity> = HashMap::new();
    for entity in entities {
        latest
            .entry((entity.device_id.as_str(), entity.observation_id))
            .and_modify(|current| {
                if entity.timestamp > current.timestamp {
                    *current = entity;
                }
            })
            .or_insert(entity);
    }
    latest.into_values().collect()
}

/// Observations plus the per-device current value table
pub struct PgObservationRepository {
    pool: PgPool,
}

impl PgObservationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Repository<ObservationEntity> for PgObservationRepository {
    #[instrument(skip(self, entities), fields(count = entities.len()))]
    async fn create_batch(&self, entities: &[ObservationEntity]) -> Result<u64, StorageError> {
        if entities.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;

        let mut insert: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO observations (device_id, observation_id, data_type, value, timestamp) ",
        );
        insert.push_values(entities, |mut row, e| {
            row.push_bind(e.device_id.clone())
                .push_bind(e.observation_id)
                .push_bind(e.data_type.clone())
                .push_bind(e.value.clone())
                .push_bind(e.timestamp);
        });
        insert.push(" ON CONFLICT DO NOTHING");
        let inserted = insert.build().execute(&mut *tx).await?.rows_affected();

        // one row per key, otherwise the upsert would touch a row twice
        let latest = latest_values(entities);
        let mut upsert: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO current_values (device_id, observation_id, data_type, value, timestamp) ",
        );
        upsert.push_values(latest, |mut row, e| {
            row.push_bind(e.device_id.clone())
                .push_bind(e.observation_id)
                .push_bind(e.data_type.clone())
                .push_bind(e.value.clone())
                .push_bind(e.timestamp);
        });
        upsert.push(
            " ON CONFLICT (device_id, observation_id) DO UPDATE SET \
             data_type = EXCLUDED.data_type, value = EXCLUDED.value, timestamp = EXCLUDED.timestamp \
             WHERE current_values.timestamp < EXCLUDED.timestamp",
        );
        upsert.build().execute(&mut *tx).await?;

        tx.commit().await?;

        debug!(inserted, "Stored observation batch");
        Ok(entities.len() as u64)
    }

    async fn get(&self, device_id: &str, limit: i64) -> Result<Vec<ObservationEntity>, StorageError> {
        let rows = sqlx::query_as::<_, ObservationEntity>(
            r#"
            SELECT device_id, observation_id, data_type, value, timestamp
            FROM observations
            WHERE device_id = $1
            ORDER BY timestamp DESC
            LIMIT $2
            "#,
        )
        .bind(device_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

impl PgObservationRepository {
    /// Current value of every observation a device reported
    pub async fn current_values(
        &self,
        device_id: &str,
    ) -> Result<Vec<ObservationEntity>, StorageError> {
        let rows = sqlx::query_as::<_, ObservationEntity>(
            r#"
            SELECT device_id, observation_id, data_type, value, timestamp
            FROM current_values
            WHERE device_id = $1
            ORDER BY observation_id
            "#,
        )
        .bind(device_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

pub struct PgStatisticsRepository {
    pool: PgPool,
}

impl PgStatisticsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Repository<StatisticsEntity> for PgStatisticsRepository {
    #[instrument(skip(self, entities), fields(count = entities.len()))]
    async fn create_batch(&self, entities: &[StatisticsEntity]) -> Result<u64, StorageError> {
        if entities.is_empty() {
            return Ok(0);
        }

        let mut insert: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO observation_statistics \
             (device_id, observation_id, count, mean, min, max, median, stddev, range_from, range_to, timestamp) ",
        );
        insert.push_values(entities, |mut row, e| {
            row.push_bind(e.device_id.clone())
                .push_bind(e.observation_id)
                .push_bind(e.count)
                .push_bind(e.mean)
                .push_bind(e.min)
                .push_bind(e.max)
                .push_bind(e.median)
                .push_bind(e.stddev)
                .push_bind(e.range_from)
                .push_bind(e.range_to)
                .push_bind(e.timestamp);
        });
        insert.push(" ON CONFLICT DO NOTHING");
        insert.build().execute(&self.pool).await?;

        Ok(entities.len() as u64)
    }

    async fn get(&self, device_id: &str, limit: i64) -> Result<Vec<StatisticsEntity>, StorageError> {
        let rows = sqlx::query_as::<_, StatisticsEntity>(
            r#"
            SELECT device_id, observation_id, count, mean, min, max, median, stddev,
                   range_from, range_to, timestamp
            FROM observation_statistics
            WHERE device_id = $1
            ORDER BY range_to DESC
            LIMIT $2
            "#,
        )
        .bind(device_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

pub struct PgCommandRepository {
    pool: PgPool,
}

impl PgCommandRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Repository<CommandEntity> for PgCommandRepository {
    #[instrument(skip(self, entities), fields(count = entities.len()))]
    async fn create_batch(&self, entities: &[CommandEntity]) -> Result<u64, StorageError> {
        if entities.is_empty() {
            return Ok(0);
        }

        let mut insert: QueryBuilder<Postgres> =
            QueryBuilder::new("INSERT INTO commands (device_id, command_id, payload, timestamp) ");
        insert.push_values(entities, |mut row, e| {
            row.push_bind(e.device_id.clone())
                .push_bind(e.command_id)
                .push_bind(e.payload.clone())
                .push_bind(e.timestamp);
        });
        insert.push(" ON CONFLICT DO NOTHING");
        insert.build().execute(&self.pool).await?;

        Ok(entities.len() as u64)
    }

    async fn get(&self, device_id: &str, limit: i64) -> Result<Vec<CommandEntity>, StorageError> {
        let rows = sqlx::query_as::<_, CommandEntity>(
            "SELECT device_id, command_id, payload, timestamp FROM commands \
             WHERE device_id = $1 ORDER BY timestamp DESC LIMIT $2",
        )
        .bind(device_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

pub struct PgEventRepository {
    pool: PgPool,
}

impl PgEventRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Repository<EventEntity> for PgEventRepository {
    #[instrument(skip(self, entities), fields(count = entities.len()))]
    async fn create_batch(&self, entities: &[EventEntity]) -> Result<u64, StorageError> {
        if entities.is_empty() {
            return Ok(0);
        }

        let mut insert: QueryBuilder<Postgres> =
            QueryBuilder::new("INSERT INTO events (device_id, event_id, payload, timestamp) ");
        insert.push_values(entities, |mut row, e| {
            row.push_bind(e.device_id.clone())
                .push_bind(e.event_id)
                .push_bind(e.payload.clone())
                .push_bind(e.timestamp);
        });
        insert.push(" ON CONFLICT DO NOTHING");
        insert.build().execute(&self.pool).await?;

        Ok(entities.len() as u64)
    }

    async fn get(&self, device_id: &str, limit: i64) -> Result<Vec<EventEntity>, StorageError> {
        let rows = sqlx::query_as::<_, EventEntity>(
            "SELECT device_id, event_id, payload, timestamp FROM events \
             WHERE device_id = $1 ORDER BY timestamp DESC LIMIT $2",
        )
        .bind(device_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

pub struct PgPulseRepository {
    pool: PgPool,
}

impl PgPulseRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Repository<PulseEntity> for PgPulseRepository {
    #[instrument(skip(self, entities), fields(count = entities.len()))]
    async fn create_batch(&self, entities: &[PulseEntity]) -> Result<u64, StorageError> {
        if entities.is_empty() {
            return Ok(0);
        }

        let mut insert: QueryBuilder<Postgres> =
            QueryBuilder::new("INSERT INTO pulses (device_id, category, timestamp) ");
        insert.push_values(entities, |mut row, e| {
            row.push_bind(e.device_id.clone())
                .push_bind(e.category.clone())
                .push_bind(e.timestamp);
        });
        insert.push(" ON CONFLICT DO NOTHING");
        insert.build().execute(&self.pool).await?;

        Ok(entities.len() as u64)
    }

    async fn get(&self, device_id: &str, limit: i64) -> Result<Vec<PulseEntity>, StorageError> {
        let rows = sqlx::query_as::<_, PulseEntity>(
            "SELECT device_id, category, timestamp FROM pulses \
             WHERE device_id = $1 ORDER BY timestamp DESC LIMIT $2",
        )
        .bind(device_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn obs(device: &str, id: i64, secs: i64, value: i64) -> ObservationEntity {
        ObservationEntity {
            device_id: device.to_string(),
            observation_id: id,
            data_type: "Integer".to_string(),
            value: serde_json::json!(value),
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    #[test]
    fn test_latest_values_keeps_newest_per_key() {
        let batch = vec![
            obs("X1", 1, 100, 1),
            obs("X1", 1, 300, 3),
            obs("X1", 1, 200, 2),
            obs("X1", 2, 50, 9),
            obs("X2", 1, 10, 7),
        ];
        let mut latest: Vec<_> = latest_values(&batch)
            .into_iter()
            .map(|e| (e.device_id.as_str(), e.observation_id, e.value.as_i64().unwrap()))
            .collect();
        latest.sort();
        assert_eq!(latest, [("X1", 1, 3), ("X1", 2, 9), ("X2", 1, 7)]);
    }
}
