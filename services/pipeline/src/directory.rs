//! Device and template metadata lookup.

use crate::codec::DataType;
use crate::config::DatabaseConfig;
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{info, instrument};

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("Failed to connect to device directory: {0}")]
    ConnectionError(String),

    #[error("Device directory query failed: {0}")]
    QueryError(String),

    #[error("Invalid directory row: {0}")]
    InvalidRow(String),
}

impl From<sqlx::Error> for DirectoryError {
    fn from(e: sqlx::Error) -> Self {
        DirectoryError::QueryError(e.to_string())
    }
}

/// A provisioned device
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct DeviceRecord {
    pub id: String,
    pub template_id: String,
    /// Pre-shared key the device authenticates with
    pub psk: String,
}

/// Observation schema shared by every device of a template
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Template {
    pub id: String,
    pub observations: HashMap<u32, DataType>,
}

impl Template {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            observations: HashMap::new(),
        }
    }

    pub fn with_observation(mut self, observation_id: u32, data_type: DataType) -> Self {
        self.observations.insert(observation_id, data_type);
        self
    }

    pub fn observation_type(&self, observation_id: u32) -> Option<DataType> {
        self.observations.get(&observation_id).copied()
    }
}

/// Source of truth for device and template metadata
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    async fn device(&self, device_id: &str) -> Result<Option<DeviceRecord>, DirectoryError>;

    async fn template(&self, template_id: &str) -> Result<Option<Template>, DirectoryError>;
}

/// Device directory backed by PostgreSQL
pub struct PgDeviceDirectory {
    pool: PgPool,
}

#[derive(FromRow)]
struct ObservationRow {
    observation_id: i64,
    data_type: String,
}

impl PgDeviceDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a directory with its own connection pool
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, DirectoryError> {
        let pool = connect_pool(config).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Open a PostgreSQL pool from the shared database settings
pub async fn connect_pool(config: &DatabaseConfig) -> Result<PgPool, DirectoryError> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.connect_timeout())
        .idle_timeout(Some(config.idle_timeout()))
        .connect(&config.url)
        .await
        .map_err(|e| DirectoryError::ConnectionError(e.to_string()))?;

    info!("Connected to PostgreSQL database");
    Ok(pool)
}

/// Build a template schema from its `template_observations` rows.
fn template_from_rows(
    template_id: &str,
    rows: impl IntoIterator<Item = ObservationRow>,
) -> Result<Template, DirectoryError> {
    let mut template = Template::new(template_id);
    for row in rows {
        let observation_id = u32::try_from(row.observation_id).map_err(|_| {
            DirectoryError::InvalidRow(format!("observation id {}", row.observation_id))
        })?;
        let data_type = row
            .data_type
            .parse::<DataType>()
            .map_err(DirectoryError::InvalidRow)?;
        template.observations.insert(observation_id, data_type);
    }
    Ok(template)
}

#[async_trait]
impl DeviceDirectory for PgDeviceDirectory {
    #[instrument(skip(self))]
    async fn device(&self, device_id: &str) -> Result<Option<DeviceRecord>, DirectoryError> {
        let device = sqlx::query_as::<_, DeviceRecord>(
            "SELECT id, template_id, psk FROM devices WHERE id = $1",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(device)
    }

    #[instrument(skip(self))]
    async fn template(&self, template_id: &str) -> Result<Option<Template>, DirectoryError> {
        let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM templates WHERE id = $1")
            .bind(template_id)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Ok(None);
        }

        let rows = sqlx::query_as::<_, ObservationRow>(
            "SELECT observation_id, data_type FROM template_observations WHERE template_id = $1",
        )
        .bind(template_id)
        .fetch_all(&self.pool)
        .await?;

        template_from_rows(template_id, rows).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_schema_lookup() {
        let template = Template::new("T1")
            .with_observation(5, DataType::Double)
            .with_observation(6, DataType::Statistics);
        assert_eq!(template.observation_type(5), Some(DataType::Double));
        assert_eq!(template.observation_type(7), None);
    }

    fn row(observation_id: i64, data_type: &str) -> ObservationRow {
        ObservationRow {
            observation_id,
            data_type: data_type.to_string(),
        }
    }

    #[test]
    fn test_template_from_stored_rows() {
        let template = template_from_rows(
            "T1",
            [row(5, "Double"), row(6, "statistics"), row(7, "int")],
        )
        .unwrap();
        assert_eq!(template.observation_type(5), Some(DataType::Double));
        assert_eq!(template.observation_type(6), Some(DataType::Statistics));
        assert_eq!(template.observation_type(7), Some(DataType::Integer));
    }

    #[test]
    fn test_template_rows_rejected() {
        let cases = [
            row(5, "float"),
            row(-1, "Double"),
            row(i64::from(u32::MAX) + 1, "Double"),
        ];
        for bad in cases {
            assert!(matches!(
                template_from_rows("T1", [row(1, "Boolean"), bad]),
                Err(DirectoryError::InvalidRow(_))
            ));
        }

        let max = template_from_rows("T1", [row(i64::from(u32::MAX), "Binary")]).unwrap();
        assert_eq!(max.observation_type(u32::MAX), Some(DataType::Binary));
    }
}
