//! Outgoing broker messages.
//!
//! Every message the pipeline publishes is built here and handed to a
//! [`BrokerChannel`](crate::channel::BrokerChannel), which sends it either on
//! its own or as part of a transactional batch.

use crate::config::PublishConfig;
use lapin::BasicProperties;
use std::time::Duration;
use thiserror::Error;

/// AMQP delivery mode for transient messages
const DELIVERY_MODE_TRANSIENT: u8 = 1;
/// AMQP delivery mode for messages written to disk by the broker
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Errors that can occur while building outgoing messages
#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("Failed to serialize message: {0}")]
    SerializationError(String),
}

/// Message to be published to an exchange
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    /// Exchange to publish to
    pub exchange: String,
    /// Routing key
    pub routing_key: String,
    /// Serialized message payload
    pub payload: Vec<u8>,
    /// Per-message expiration
    pub ttl: Option<Duration>,
    /// Persistent delivery mode
    pub persistent: bool,
}

impl OutgoingMessage {
    /// Create a new outgoing message with a raw payload
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            payload,
            ttl: None,
            persistent: false,
        }
    }

    /// Create a new outgoing message with a JSON payload
    pub fn new_json<T: serde::Serialize>(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        message: &T,
    ) -> Result<Self, ProducerError> {
        let payload = serde_json::to_vec(message)
            .map_err(|e| ProducerError::SerializationError(e.to_string()))?;
        Ok(Self::new(exchange, routing_key, payload))
    }

    /// Set the message expiration
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Set the delivery mode
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// Apply the configured TTL and delivery mode
    pub fn with_publish_config(self, config: &PublishConfig) -> Self {
        self.with_ttl(Duration::from_millis(config.ttl_ms))
            .persistent(config.persistent)
    }

    /// AMQP properties carrying the expiration and delivery mode
    pub fn properties(&self) -> BasicProperties {
        let mode = if self.persistent {
            DELIVERY_MODE_PERSISTENT
        } else {
            DELIVERY_MODE_TRANSIENT
        };
        let mut properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(mode);
        if let Some(ttl) = self.ttl {
            properties = properties.with_expiration(ttl.as_millis().to_string().into());
        }
        properties
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outgoing_message_builder() {
        let message = OutgoingMessage::new_json("hivelink.routed", "X1.pulse", &serde_json::json!({"a": 1}))
            .unwrap()
            .with_ttl(Duration::from_secs(60));

        assert_eq!(message.routing_key, "X1.pulse");
        assert_eq!(message.payload, br#"{"a":1}"#);
        assert!(!message.persistent);

        let props = message.properties();
        assert_eq!(props.expiration().as_ref().map(|e| e.as_str()), Some("60000"));
        assert_eq!(*props.delivery_mode(), Some(DELIVERY_MODE_TRANSIENT));
    }

    #[test]
    fn test_publish_config_applied() {
        let config = PublishConfig {
            ttl_ms: 1500,
            persistent: true,
        };
        let message = OutgoingMessage::new("x", "k", vec![]).with_publish_config(&config);
        assert_eq!(message.ttl, Some(Duration::from_millis(1500)));
        assert_eq!(*message.properties().delivery_mode(), Some(DELIVERY_MODE_PERSISTENT));
    }

    #[test]
    fn test_no_ttl_means_no_expiration() {
        let message = OutgoingMessage::new("x", "k", vec![1]);
        assert!(message.properties().expiration().is_none());
    }
}
