//! Configuration management for the ingest service.
//!
//! Loaded from optional files and `INGEST__`-prefixed environment variables,
//! e.g. `INGEST__BROKER__URI` or `INGEST__CHOPPER__BATCH_SIZE`.

use config::{Config, Environment, File};
use hivelink_pipeline::config::{BrokerConfig, ConfigError, LoggingConfig};
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;

/// Which worker family this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    Chopper,
    PulseTraffic,
    PulseConnections,
}

impl FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chopper" => Ok(Mode::Chopper),
            "pulse-traffic" => Ok(Mode::PulseTraffic),
            "pulse-connections" => Ok(Mode::PulseConnections),
            other => Err(ConfigError::InvalidValue {
                key: "mode".to_string(),
                message: format!("unknown mode {}", other),
            }),
        }
    }
}

/// Main configuration for the ingest service.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_mode")]
    pub mode: Mode,

    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub chopper: ChopperConfig,

    #[serde(default)]
    pub pulse: PulseConfig,

    #[serde(default)]
    pub management: ManagementConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Fan-out worker configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ChopperConfig {
    /// Number of independent workers, each with its own connection
    #[serde(default = "default_chopper_workers")]
    pub workers: usize,

    /// Durable queue receiving container uploads
    #[serde(default = "default_chopper_queue")]
    pub queue: String,

    /// Republished messages per broker transaction
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Age after which a partial batch is flushed by the polling tick
    #[serde(default = "default_max_batch_age_ms")]
    pub max_batch_age_ms: u64,
}

/// Pulse generator configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PulseConfig {
    /// Minimum spacing between pulses of one device
    #[serde(default = "default_pulse_interval_secs")]
    pub interval_secs: u64,

    /// Workers consuming device traffic
    #[serde(default = "default_pulse_workers")]
    pub workers: usize,

    /// Queue the traffic-driven generator consumes
    #[serde(default = "default_pulse_queue")]
    pub queue: String,

    /// Interval between connection list polls
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Broker users with these prefixes are never devices
    #[serde(default = "default_skip_prefixes")]
    pub skip_prefixes: Vec<String>,
}

/// Broker management API access.
#[derive(Debug, Clone, Deserialize)]
pub struct ManagementConfig {
    #[serde(default = "default_management_url")]
    pub url: String,

    #[serde(default = "default_management_user")]
    pub username: String,

    #[serde(default = "default_management_user")]
    pub password: String,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

// Default value functions
fn default_mode() -> Mode {
    Mode::Chopper
}
fn default_chopper_workers() -> usize {
    4
}
fn default_chopper_queue() -> String {
    "hivelink.ingest.containers".to_string()
}
fn default_batch_size() -> usize {
    200
}
fn default_max_batch_age_ms() -> u64 {
    1000
}
fn default_pulse_interval_secs() -> u64 {
    60
}
fn default_pulse_workers() -> usize {
    1
}
fn default_pulse_queue() -> String {
    "hivelink.ingest.pulse".to_string()
}
fn default_poll_interval_secs() -> u64 {
    30
}
fn default_skip_prefixes() -> Vec<String> {
    vec!["federation-".to_string(), "internal-".to_string()]
}
fn default_management_url() -> String {
    "http://localhost:15672".to_string()
}
fn default_management_user() -> String {
    "guest".to_string()
}
fn default_request_timeout_secs() -> u64 {
    10
}

impl Default for ChopperConfig {
    fn default() -> Self {
        Self {
            workers: default_chopper_workers(),
            queue: default_chopper_queue(),
            batch_size: default_batch_size(),
            max_batch_age_ms: default_max_batch_age_ms(),
        }
    }
}

impl Default for PulseConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_pulse_interval_secs(),
            workers: default_pulse_workers(),
            queue: default_pulse_queue(),
            poll_interval_secs: default_poll_interval_secs(),
            skip_prefixes: default_skip_prefixes(),
        }
    }
}

impl Default for ManagementConfig {
    fn default() -> Self {
        Self {
            url: default_management_url(),
            username: default_management_user(),
            password: default_management_user(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl ChopperConfig {
    pub fn max_batch_age(&self) -> Duration {
        Duration::from_millis(self.max_batch_age_ms)
    }
}

impl PulseConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl ManagementConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl IngestConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Later sources override earlier ones:
    /// 1. `config/ingest`
    /// 2. `/etc/hivelink/ingest`
    /// 3. Environment variables (`INGEST__BROKER__URI` -> `broker.uri`)
    pub fn load() -> Result<Self, config::ConfigError> {
        Config::builder()
            .add_source(File::with_name("config/ingest").required(false))
            .add_source(File::with_name("/etc/hivelink/ingest").required(false))
            .add_source(
                Environment::with_prefix("INGEST")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.broker.validate()?;

        let workers = match self.mode {
            Mode::Chopper => self.chopper.workers,
            Mode::PulseTraffic => self.pulse.workers,
            Mode::PulseConnections => 1,
        };
        if workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "workers".to_string(),
                message: "at least one worker is required".to_string(),
            });
        }

        if self.chopper.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "chopper.batch_size".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        if self.pulse.interval_secs == 0 || self.pulse.poll_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "pulse".to_string(),
                message: "intervals must be greater than 0".to_string(),
            });
        }

        if self.mode == Mode::PulseConnections && self.management.url.is_empty() {
            return Err(ConfigError::MissingRequired("management.url".to_string()));
        }

        Ok(())
    }
}
