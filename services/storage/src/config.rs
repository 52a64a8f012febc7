use hivelink_pipeline::config::{BrokerConfig, ConfigError, DatabaseConfig, LoggingConfig};
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Main configuration for the storage service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Broker configuration
    #[serde(default)]
    pub broker: BrokerConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Sink workers to run
    #[serde(default = "default_workers")]
    pub workers: Vec<WorkerConfig>,
    /// Observation validation
    #[serde(default)]
    pub observations: ObservationConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    /// Run migrations on startup
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

/// One group of identical sink workers
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Consumer kind (observation, command, event, pulse, statistics)
    pub kind: String,
    /// Number of workers, each with its own connection
    #[serde(default = "default_worker_count")]
    pub count: usize,
    /// Entities per storage write
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Age after which a partial batch is flushed
    #[serde(default = "default_max_batch_age_ms")]
    pub max_batch_age_ms: u64,
    /// Queue override; defaults to `hivelink.storage.<kind>`
    #[serde(default)]
    pub queue: Option<String>,
}

/// Observation validation settings
#[derive(Debug, Clone, Deserialize)]
pub struct ObservationConfig {
    /// Observations further in the future than this are dropped
    #[serde(default = "default_max_future_skew_secs")]
    pub max_future_skew_secs: u64,
}

/// The five sink consumer kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsumerKind {
    Observation,
    Command,
    Event,
    Pulse,
    Statistics,
}

impl ConsumerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumerKind::Observation => "observation",
            ConsumerKind::Command => "command",
            ConsumerKind::Event => "event",
            ConsumerKind::Pulse => "pulse",
            ConsumerKind::Statistics => "statistics",
        }
    }
}

impl fmt::Display for ConsumerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConsumerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "observation" => Ok(ConsumerKind::Observation),
            "command" => Ok(ConsumerKind::Command),
            "event" => Ok(ConsumerKind::Event),
            "pulse" => Ok(ConsumerKind::Pulse),
            "statistics" => Ok(ConsumerKind::Statistics),
            _ => Err(ConfigError::UnknownConsumerKind(s.to_string())),
        }
    }
}

// Default value functions
fn default_service_name() -> String {
    "hivelink-storage".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_run_migrations() -> bool {
    true
}

fn default_worker_count() -> usize {
    1
}

fn default_batch_size() -> usize {
    500
}

fn default_max_batch_age_ms() -> u64 {
    2000
}

fn default_max_future_skew_secs() -> u64 {
    3600
}

fn default_workers() -> Vec<WorkerConfig> {
    [
        ConsumerKind::Observation,
        ConsumerKind::Command,
        ConsumerKind::Event,
        ConsumerKind::Pulse,
        ConsumerKind::Statistics,
    ]
    .iter()
    .map(|kind| WorkerConfig {
        kind: kind.as_str().to_string(),
        count: default_worker_count(),
        batch_size: default_batch_size(),
        max_batch_age_ms: default_max_batch_age_ms(),
        queue: None,
    })
    .collect()
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            metrics_port: default_metrics_port(),
            run_migrations: default_run_migrations(),
        }
    }
}

impl Default for ObservationConfig {
    fn default() -> Self {
        Self {
            max_future_skew_secs: default_max_future_skew_secs(),
        }
    }
}

impl ObservationConfig {
    pub fn max_future_skew(&self) -> Duration {
        Duration::from_secs(self.max_future_skew_secs)
    }
}

impl WorkerConfig {
    pub fn kind(&self) -> Result<ConsumerKind, ConfigError> {
        self.kind.parse()
    }

    pub fn max_batch_age(&self) -> Duration {
        Duration::from_millis(self.max_batch_age_ms)
    }

    pub fn queue_name(&self, kind: ConsumerKind) -> String {
        self.queue
            .clone()
            .unwrap_or_else(|| format!("hivelink.storage.{}", kind))
    }
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/storage").required(false))
            .add_source(config::File::with_name("/etc/hivelink/storage").required(false))
            // Override with environment variables
            // STORAGE__BROKER__URI -> broker.uri
            .add_source(
                config::Environment::with_prefix("STORAGE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Validate the configuration; unknown consumer kinds are fatal
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.broker.validate()?;
        self.database.validate()?;

        for worker in &self.workers {
            worker.kind()?;
            if worker.batch_size == 0 {
                return Err(ConfigError::InvalidValue {
                    key: format!("workers.{}.batch_size", worker.kind),
                    message: "must be greater than 0".to_string(),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Config {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_default_values() {
        let config = parse(r#"{"database":{"url":"postgres://localhost/hivelink"}}"#);
        assert_eq!(config.workers.len(), 5);
        assert_eq!(config.observations.max_future_skew(), Duration::from_secs(3600));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_consumer_kind_is_fatal() {
        let config = parse(
            r#"{"database":{"url":"postgres://localhost/hivelink"},"workers":[{"kind":"telemetry"}]}"#,
        );
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownConsumerKind(kind)) if kind == "telemetry"
        ));
    }

    #[test]
    fn test_consumer_kind_names() {
        assert_eq!("Pulse".parse::<ConsumerKind>().unwrap(), ConsumerKind::Pulse);
        assert_eq!(ConsumerKind::Statistics.to_string(), "statistics");
    }

    #[test]
    fn test_queue_name_defaults_to_kind() {
        let worker = &parse(r#"{"database":{"url":"postgres://x"}}"#).workers[0];
        assert_eq!(worker.queue_name(ConsumerKind::Observation), "hivelink.storage.observation");
    }
}
