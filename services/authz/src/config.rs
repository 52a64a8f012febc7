use hivelink_pipeline::config::{ConfigError, DatabaseConfig, LoggingConfig};
use serde::Deserialize;

/// Main configuration for the authorization backend
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// HTTP listener
    #[serde(default)]
    pub api: ApiConfig,
    /// Device directory database
    pub database: DatabaseConfig,
    /// Broker-side policy
    #[serde(default)]
    pub policy: PolicyConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// API server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
}

/// What devices may touch besides their own resources
#[derive(Debug, Clone, Deserialize)]
pub struct PolicyConfig {
    /// The only virtual host devices may open
    #[serde(default = "default_vhost")]
    pub vhost: String,
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8081
}

fn default_vhost() -> String {
    "/".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            vhost: default_vhost(),
        }
    }
}

impl ApiConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/authz").required(false))
            .add_source(config::File::with_name("/etc/hivelink/authz").required(false))
            // AUTHZ__DATABASE__URL -> database.url
            .add_source(
                config::Environment::with_prefix("AUTHZ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.database.validate()?;
        if self.policy.vhost.is_empty() {
            return Err(ConfigError::MissingRequired("policy.vhost".to_string()));
        }
        Ok(())
    }
}
