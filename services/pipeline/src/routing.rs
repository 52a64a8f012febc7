//! Routing keys and per-device resource names.
//!
//! Publishers, consumers and the authorization backend all derive names from
//! these functions; nothing else in the workspace formats a routing key or a
//! device resource name by hand.

use std::fmt;

pub const CONTAINER_SEGMENT: &str = "container";
pub const OBSERVATION_SEGMENT: &str = "obs";
pub const STATISTICS_SEGMENT: &str = "stats";
pub const COMMAND_SEGMENT: &str = "cmd";
pub const COMMAND_RESPONSE_SEGMENT: &str = "cmdresp";
pub const EVENT_SEGMENT: &str = "evt";
pub const PULSE_SEGMENT: &str = "pulse";

/// Prefix of every system notification routing key.
pub const NOTIFICATION_PREFIX: &str = "system.notification";
/// Reserved key devices may read from but never publish to.
pub const BROADCAST_ROUTING_KEY: &str = "broadcast";

const DEVICE_QUEUE_SUFFIX: &str = "mqtt";
const PROTOCOL_EXCHANGE_SUFFIX: &str = "protocol";

/// Transfer encoding of an uploaded container body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerEncoding {
    Raw,
    Base64,
}

impl ContainerEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerEncoding::Raw => "raw",
            ContainerEncoding::Base64 => "b64",
        }
    }

    fn parse(tag: &str) -> Option<Self> {
        match tag {
            "raw" => Some(ContainerEncoding::Raw),
            "b64" => Some(ContainerEncoding::Base64),
            _ => None,
        }
    }
}

/// A routing key that addresses a single device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRoute<'a> {
    Container {
        device_id: &'a str,
        encoding: ContainerEncoding,
    },
    Observation {
        device_id: &'a str,
        observation_id: u32,
    },
    Statistics {
        device_id: &'a str,
        observation_id: u32,
    },
    Command {
        device_id: &'a str,
        command_id: u32,
    },
    CommandResponse {
        device_id: &'a str,
        command_id: u32,
    },
    Event {
        device_id: &'a str,
        event_id: u32,
    },
    Pulse {
        device_id: &'a str,
    },
}

impl<'a> DeviceRoute<'a> {
    /// Parse a routing key. Returns `None` for anything that is not a
    /// well-formed per-device key.
    pub fn parse(routing_key: &'a str) -> Option<Self> {
        let mut parts = routing_key.split('.');
        let device_id = parts.next()?;
        if !is_valid_device_id(device_id) {
            return None;
        }
        let kind = parts.next()?;
        let arg = parts.next();
        if parts.next().is_some() {
            return None;
        }

        let route = match (kind, arg) {
            (CONTAINER_SEGMENT, Some(tag)) => DeviceRoute::Container {
                device_id,
                encoding: ContainerEncoding::parse(tag)?,
            },
            (OBSERVATION_SEGMENT, Some(id)) => DeviceRoute::Observation {
                device_id,
                observation_id: id.parse().ok()?,
            },
            (STATISTICS_SEGMENT, Some(id)) => DeviceRoute::Statistics {
                device_id,
                observation_id: id.parse().ok()?,
            },
            (COMMAND_SEGMENT, Some(id)) => DeviceRoute::Command {
                device_id,
                command_id: id.parse().ok()?,
            },
            (COMMAND_RESPONSE_SEGMENT, Some(id)) => DeviceRoute::CommandResponse {
                device_id,
                command_id: id.parse().ok()?,
            },
            (EVENT_SEGMENT, Some(id)) => DeviceRoute::Event {
                device_id,
                event_id: id.parse().ok()?,
            },
            (PULSE_SEGMENT, None) => DeviceRoute::Pulse { device_id },
            _ => return None,
        };

        Some(route)
    }

    pub fn device_id(&self) -> &'a str {
        match *self {
            DeviceRoute::Container { device_id, .. }
            | DeviceRoute::Observation { device_id, .. }
            | DeviceRoute::Statistics { device_id, .. }
            | DeviceRoute::Command { device_id, .. }
            | DeviceRoute::CommandResponse { device_id, .. }
            | DeviceRoute::Event { device_id, .. }
            | DeviceRoute::Pulse { device_id } => device_id,
        }
    }
}

impl fmt::Display for DeviceRoute<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceRoute::Container {
                device_id,
                encoding,
            } => write!(f, "{}.{}.{}", device_id, CONTAINER_SEGMENT, encoding.as_str()),
            DeviceRoute::Observation {
                device_id,
                observation_id,
            } => write!(f, "{}.{}.{}", device_id, OBSERVATION_SEGMENT, observation_id),
            DeviceRoute::Statistics {
                device_id,
                observation_id,
            } => write!(f, "{}.{}.{}", device_id, STATISTICS_SEGMENT, observation_id),
            DeviceRoute::Command {
                device_id,
                command_id,
            } => write!(f, "{}.{}.{}", device_id, COMMAND_SEGMENT, command_id),
            DeviceRoute::CommandResponse {
                device_id,
                command_id,
            } => write!(
                f,
                "{}.{}.{}",
                device_id, COMMAND_RESPONSE_SEGMENT, command_id
            ),
            DeviceRoute::Event {
                device_id,
                event_id,
            } => write!(f, "{}.{}.{}", device_id, EVENT_SEGMENT, event_id),
            DeviceRoute::Pulse { device_id } => write!(f, "{}.{}", device_id, PULSE_SEGMENT),
        }
    }
}

/// Device ids are used verbatim as the first routing key segment, so they
/// must not contain separators or topic wildcards.
pub fn is_valid_device_id(device_id: &str) -> bool {
    !device_id.is_empty()
        && device_id
            .chars()
            .all(|c| c != '.' && c != '*' && c != '#' && !c.is_whitespace())
}

pub fn container_key(device_id: &str, encoding: ContainerEncoding) -> String {
    DeviceRoute::Container {
        device_id,
        encoding,
    }
    .to_string()
}

pub fn observation_key(device_id: &str, observation_id: u32) -> String {
    DeviceRoute::Observation {
        device_id,
        observation_id,
    }
    .to_string()
}

pub fn statistics_key(device_id: &str, observation_id: u32) -> String {
    DeviceRoute::Statistics {
        device_id,
        observation_id,
    }
    .to_string()
}

pub fn pulse_key(device_id: &str) -> String {
    DeviceRoute::Pulse { device_id }.to_string()
}

/// Binding pattern matching one route kind for every device.
pub fn binding_pattern(segment: &str) -> String {
    if segment == PULSE_SEGMENT {
        format!("*.{}", segment)
    } else {
        format!("*.{}.*", segment)
    }
}

/// Binding pattern matching every system notification.
pub fn notification_binding() -> String {
    format!("{}.#", NOTIFICATION_PREFIX)
}

pub fn notification_key(scope: &str) -> String {
    format!("{}.{}", NOTIFICATION_PREFIX, scope)
}

pub fn is_notification(routing_key: &str) -> bool {
    routing_key
        .strip_prefix(NOTIFICATION_PREFIX)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('.'))
}

/// Queue the MQTT adapter declares for a device session.
pub fn device_queue(device_id: &str) -> String {
    format!("{}.{}", device_id, DEVICE_QUEUE_SUFFIX)
}

/// Exchange devices of a template publish to and bind from.
pub fn protocol_exchange(template_id: &str) -> String {
    format!("{}.{}", template_id, PROTOCOL_EXCHANGE_SUFFIX)
}

/// Routing-key prefix that scopes a device's topic permissions.
pub fn device_topic_prefix(device_id: &str) -> String {
    format!("{}.", device_id)
}
