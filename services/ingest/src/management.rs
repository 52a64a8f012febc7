//! Broker management API client.
//!
//! Only the live connection list is used: it tells the connection-driven
//! pulse generator which devices currently hold a session.

use crate::config::ManagementConfig;
use async_trait::async_trait;
use hivelink_pipeline::routing;
use serde::Deserialize;
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Error, Debug)]
pub enum ManagementError {
    #[error("Failed to build management client: {0}")]
    ClientError(String),

    #[error("Management API request failed: {0}")]
    RequestError(String),

    #[error("Failed to decode management API response: {0}")]
    DecodeError(String),
}

/// One entry of the broker's connection list
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionInfo {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
}

/// Source of the identities currently connected to the broker
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait ConnectionSource: Send + Sync {
    async fn connections(&self) -> Result<Vec<ConnectionInfo>, ManagementError>;
}

pub struct ManagementClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
}

impl ManagementClient {
    pub fn new(config: &ManagementConfig) -> Result<Self, ManagementError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ManagementError::ClientError(e.to_string()))?;
        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }
}

#[async_trait]
impl ConnectionSource for ManagementClient {
    #[instrument(skip(self), fields(base_url = %self.base_url))]
    async fn connections(&self) -> Result<Vec<ConnectionInfo>, ManagementError> {
        let url = format!("{}/api/connections?columns=user,state", self.base_url);
        let response = self
            .http
            .get(url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| ManagementError::RequestError(e.to_string()))?
            .error_for_status()
            .map_err(|e| ManagementError::RequestError(e.to_string()))?;

        let connections: Vec<ConnectionInfo> = response
            .json()
            .await
            .map_err(|e| ManagementError::DecodeError(e.to_string()))?;
        debug!(count = connections.len(), "Fetched broker connections");
        Ok(connections)
    }
}

/// Device identities among the connections, excluding service accounts.
///
/// Users with a skipped prefix, closing connections and names that cannot be
/// device ids are dropped; duplicates collapse to one entry.
pub fn device_identities(connections: &[ConnectionInfo], skip_prefixes: &[String]) -> Vec<String> {
    connections
        .iter()
        .filter(|c| c.state.as_deref().map_or(true, |s| s == "running"))
        .filter_map(|c| c.user.as_deref())
        .filter(|user| !skip_prefixes.iter().any(|p| user.starts_with(p.as_str())))
        .filter(|user| routing::is_valid_device_id(user))
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(user: &str, state: Option<&str>) -> ConnectionInfo {
        ConnectionInfo {
            user: Some(user.to_string()),
            state: state.map(str::to_string),
        }
    }

    #[test]
    fn test_device_identities_filtering() {
        let connections = vec![
            conn("X2", Some("running")),
            conn("X1", None),
            conn("X1", Some("running")),
            conn("federation-upstream", Some("running")),
            conn("internal-storage", Some("running")),
            conn("X3", Some("closing")),
            conn("bad.name", Some("running")),
            ConnectionInfo {
                user: None,
                state: None,
            },
        ];
        let skip = vec!["federation-".to_string(), "internal-".to_string()];
        assert_eq!(device_identities(&connections, &skip), vec!["X1", "X2"]);
    }

    #[test]
    fn test_connection_list_shape() {
        let body = r#"[{"user":"X1","state":"running","name":"10.0.0.1:5000 -> 10.0.0.2:5672"}]"#;
        let connections: Vec<ConnectionInfo> = serde_json::from_str(body).unwrap();
        assert_eq!(connections[0].user.as_deref(), Some("X1"));
    }
}
