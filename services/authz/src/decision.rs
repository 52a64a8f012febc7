//! Whitelist authorization decisions for broker hooks.
//!
//! Every decision is recomputed from the device record on each request and
//! defaults to [`Decision::Deny`]. A device may only touch:
//!
//! - its own session queue, `<device>.mqtt`
//! - its template's protocol exchange, `<template>.protocol`
//! - routing keys under `<device>.`, plus the broadcast key for reads

use hivelink_pipeline::directory::DeviceRecord;
use hivelink_pipeline::routing;
use std::str::FromStr;
use subtle::ConstantTimeEq;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Allow => "allow",
            Decision::Deny => "deny",
        }
    }

    fn from_bool(allowed: bool) -> Self {
        if allowed {
            Decision::Allow
        } else {
            Decision::Deny
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Configure,
    Write,
    Read,
}

impl FromStr for Permission {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "configure" => Ok(Permission::Configure),
            "write" => Ok(Permission::Write),
            "read" => Ok(Permission::Read),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Exchange,
    Queue,
    Topic,
}

impl FromStr for ResourceKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exchange" => Ok(ResourceKind::Exchange),
            "queue" => Ok(ResourceKind::Queue),
            "topic" => Ok(ResourceKind::Topic),
            _ => Err(()),
        }
    }
}

/// One hook invocation, already parsed from its form body
#[derive(Debug, Clone, PartialEq)]
pub enum AuthRequest {
    User {
        username: String,
        password: Option<String>,
    },
    Vhost {
        username: String,
        vhost: String,
    },
    Resource {
        username: String,
        kind: ResourceKind,
        name: String,
        permission: Permission,
    },
    Topic {
        username: String,
        /// Exchange the routing key is used on
        name: String,
        permission: Permission,
        routing_key: String,
    },
}

impl AuthRequest {
    pub fn username(&self) -> &str {
        match self {
            AuthRequest::User { username, .. }
            | AuthRequest::Vhost { username, .. }
            | AuthRequest::Resource { username, .. }
            | AuthRequest::Topic { username, .. } => username,
        }
    }
}

/// Decide a request for the template named in the hook path.
///
/// `device` is the directory record for the request's username, if any.
pub fn decide(
    request: &AuthRequest,
    template_id: &str,
    device: Option<&DeviceRecord>,
    vhost: &str,
) -> Decision {
    let Some(device) = device else {
        return Decision::Deny;
    };
    if device.id != request.username() || device.template_id != template_id {
        return Decision::Deny;
    }

    let allowed = match request {
        AuthRequest::User { password, .. } => password
            .as_deref()
            .is_some_and(|password| bool::from(password.as_bytes().ct_eq(device.psk.as_bytes()))),
        AuthRequest::Vhost { vhost: requested, .. } => requested == vhost,
        AuthRequest::Resource {
            kind,
            name,
            permission,
            ..
        } => resource_allowed(device, *kind, name, *permission),
        AuthRequest::Topic {
            name,
            permission,
            routing_key,
            ..
        } => {
            name == &routing::protocol_exchange(&device.template_id)
                && topic_allowed(&device.id, *permission, routing_key)
        }
    };

    Decision::from_bool(allowed)
}

fn resource_allowed(
    device: &DeviceRecord,
    kind: ResourceKind,
    name: &str,
    permission: Permission,
) -> bool {
    match kind {
        // the session queue is declared, bound and consumed by the device
        ResourceKind::Queue => name == routing::device_queue(&device.id),
        // the protocol exchange is pre-declared; devices publish to and bind from it
        ResourceKind::Exchange => {
            name == routing::protocol_exchange(&device.template_id)
                && matches!(permission, Permission::Write | Permission::Read)
        }
        ResourceKind::Topic => false,
    }
}

fn topic_allowed(device_id: &str, permission: Permission, routing_key: &str) -> bool {
    let own = routing_key.starts_with(&routing::device_topic_prefix(device_id));
    match permission {
        Permission::Write => own,
        Permission::Read => own || routing_key == routing::BROADCAST_ROUTING_KEY,
        Permission::Configure => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VHOST: &str = "/";

    fn x1() -> DeviceRecord {
        DeviceRecord {
            id: "X1".to_string(),
            template_id: "T1".to_string(),
            psk: "secret".to_string(),
        }
    }

    fn resource(username: &str, kind: ResourceKind, name: &str, permission: Permission) -> AuthRequest {
        AuthRequest::Resource {
            username: username.to_string(),
            kind,
            name: name.to_string(),
            permission,
        }
    }

    fn topic(username: &str, permission: Permission, routing_key: &str) -> AuthRequest {
        AuthRequest::Topic {
            username: username.to_string(),
            name: "T1.protocol".to_string(),
            permission,
            routing_key: routing_key.to_string(),
        }
    }

    #[test]
    fn test_protocol_exchange_write_for_known_device() {
        let device = x1();
        let request = resource("X1", ResourceKind::Exchange, "T1.protocol", Permission::Write);
        assert_eq!(decide(&request, "T1", Some(&device), VHOST), Decision::Allow);

        // X2 does not exist
        let request = resource("X2", ResourceKind::Exchange, "T1.protocol", Permission::Write);
        assert_eq!(decide(&request, "T1", None, VHOST), Decision::Deny);
    }

    #[test]
    fn test_topic_prefix_scoping() {
        let device = x1();
        let allow = topic("X1", Permission::Read, "X1.obs.5");
        assert_eq!(decide(&allow, "T1", Some(&device), VHOST), Decision::Allow);

        let other = topic("X1", Permission::Read, "X2.obs.5");
        assert_eq!(decide(&other, "T1", Some(&device), VHOST), Decision::Deny);

        let write = topic("X1", Permission::Write, "X1.container.b64");
        assert_eq!(decide(&write, "T1", Some(&device), VHOST), Decision::Allow);

        // "X10.obs.5" is not under "X1."
        let lookalike = topic("X1", Permission::Write, "X10.obs.5");
        assert_eq!(decide(&lookalike, "T1", Some(&device), VHOST), Decision::Deny);
    }

    #[test]
    fn test_broadcast_key_is_read_only() {
        let device = x1();
        let read = topic("X1", Permission::Read, routing::BROADCAST_ROUTING_KEY);
        assert_eq!(decide(&read, "T1", Some(&device), VHOST), Decision::Allow);
        let write = topic("X1", Permission::Write, routing::BROADCAST_ROUTING_KEY);
        assert_eq!(decide(&write, "T1", Some(&device), VHOST), Decision::Deny);
    }

    #[test]
    fn test_user_requires_matching_psk() {
        let device = x1();
        let good = AuthRequest::User {
            username: "X1".into(),
            password: Some("secret".into()),
        };
        assert_eq!(decide(&good, "T1", Some(&device), VHOST), Decision::Allow);

        let bad = AuthRequest::User {
            username: "X1".into(),
            password: Some("secreT".into()),
        };
        assert_eq!(decide(&bad, "T1", Some(&device), VHOST), Decision::Deny);

        let missing = AuthRequest::User {
            username: "X1".into(),
            password: None,
        };
        assert_eq!(decide(&missing, "T1", Some(&device), VHOST), Decision::Deny);
    }

    #[test]
    fn test_identity_must_match_record_and_template() {
        let device = x1();
        let request = AuthRequest::User {
            username: "X1".into(),
            password: Some("secret".into()),
        };
        // template in the hook path differs from the device's
        assert_eq!(decide(&request, "T2", Some(&device), VHOST), Decision::Deny);

        let impostor = AuthRequest::User {
            username: "X2".into(),
            password: Some("secret".into()),
        };
        assert_eq!(decide(&impostor, "T1", Some(&device), VHOST), Decision::Deny);
    }

    #[test]
    fn test_resource_whitelist() {
        let device = x1();
        let cases = [
            (ResourceKind::Queue, "X1.mqtt", Permission::Configure, Decision::Allow),
            (ResourceKind::Queue, "X1.mqtt", Permission::Read, Decision::Allow),
            (ResourceKind::Queue, "X2.mqtt", Permission::Read, Decision::Deny),
            (ResourceKind::Exchange, "T1.protocol", Permission::Read, Decision::Allow),
            (ResourceKind::Exchange, "T1.protocol", Permission::Configure, Decision::Deny),
            (ResourceKind::Exchange, "T2.protocol", Permission::Write, Decision::Deny),
            (ResourceKind::Exchange, "amq.topic", Permission::Write, Decision::Deny),
            (ResourceKind::Topic, "T1.protocol", Permission::Write, Decision::Deny),
        ];
        for (kind, name, permission, expected) in cases {
            let request = resource("X1", kind, name, permission);
            assert_eq!(
                decide(&request, "T1", Some(&device), VHOST),
                expected,
                "{:?} {} {:?}",
                kind,
                name,
                permission
            );
        }
    }

    #[test]
    fn test_vhost_and_topic_exchange() {
        let device = x1();
        let vhost = AuthRequest::Vhost {
            username: "X1".into(),
            vhost: "/".into(),
        };
        assert_eq!(decide(&vhost, "T1", Some(&device), VHOST), Decision::Allow);
        assert_eq!(decide(&vhost, "T1", Some(&device), "/devices"), Decision::Deny);

        let wrong_exchange = AuthRequest::Topic {
            username: "X1".into(),
            name: "amq.topic".into(),
            permission: Permission::Write,
            routing_key: "X1.obs.5".into(),
        };
        assert_eq!(decide(&wrong_exchange, "T1", Some(&device), VHOST), Decision::Deny);
    }
}
