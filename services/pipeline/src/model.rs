//! JSON message bodies exchanged over the routed exchange.

use crate::codec::{DataType, Record, Value};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One observation after fan-out, published once per container record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawObservation", into = "RawObservation")]
pub struct RoutedObservation {
    pub device_id: String,
    pub observation_id: u32,
    pub timestamp: DateTime<Utc>,
    pub value: Value,
}

impl RoutedObservation {
    pub fn from_record(device_id: impl Into<String>, record: Record) -> Self {
        Self {
            device_id: device_id.into(),
            observation_id: record.observation_id,
            timestamp: record.timestamp,
            value: record.value,
        }
    }

    pub fn data_type(&self) -> DataType {
        self.value.data_type()
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawObservation {
    device_id: String,
    observation_id: u32,
    data_type: DataType,
    value: serde_json::Value,
    timestamp: DateTime<Utc>,
}

impl From<RoutedObservation> for RawObservation {
    fn from(obs: RoutedObservation) -> Self {
        Self {
            device_id: obs.device_id,
            observation_id: obs.observation_id,
            data_type: obs.value.data_type(),
            value: value_to_json(&obs.value),
            timestamp: obs.timestamp,
        }
    }
}

impl TryFrom<RawObservation> for RoutedObservation {
    type Error = String;

    fn try_from(raw: RawObservation) -> Result<Self, Self::Error> {
        Ok(Self {
            value: value_from_json(raw.data_type, raw.value)?,
            device_id: raw.device_id,
            observation_id: raw.observation_id,
            timestamp: raw.timestamp,
        })
    }
}

/// JSON form of a value; binary payloads become base64 strings.
pub fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Boolean(v) => serde_json::Value::from(*v),
        Value::Double(v) => json_f64::to_json(*v),
        Value::Integer(v) => serde_json::Value::from(*v),
        Value::String(v) => serde_json::Value::from(v.as_str()),
        Value::Binary(v) => serde_json::Value::from(STANDARD.encode(v)),
        Value::Position(p) => serde_json::to_value(p).unwrap_or(serde_json::Value::Null),
        Value::Statistics(s) => serde_json::to_value(s).unwrap_or(serde_json::Value::Null),
    }
}

/// Interpret a JSON value as the given data type.
pub fn value_from_json(data_type: DataType, json: serde_json::Value) -> Result<Value, String> {
    let mismatch = || format!("value does not match data type {}", data_type.as_str());
    let value = match data_type {
        DataType::Boolean => Value::Boolean(json.as_bool().ok_or_else(mismatch)?),
        DataType::Double => Value::Double(json_f64::from_json(&json).ok_or_else(mismatch)?),
        DataType::Integer => Value::Integer(json.as_i64().ok_or_else(mismatch)?),
        DataType::String => Value::String(json.as_str().ok_or_else(mismatch)?.to_string()),
        DataType::Binary => {
            let encoded = json.as_str().ok_or_else(mismatch)?;
            Value::Binary(STANDARD.decode(encoded).map_err(|e| e.to_string())?)
        }
        DataType::Position => {
            Value::Position(serde_json::from_value(json).map_err(|e| e.to_string())?)
        }
        DataType::Statistics => {
            Value::Statistics(serde_json::from_value(json).map_err(|e| e.to_string())?)
        }
    };
    Ok(value)
}

/// Lossless JSON form of `f64`.
///
/// Finite values are plain numbers. NaN and the infinities, which JSON numbers
/// cannot carry, are the strings `"NaN"`, `"Infinity"` and `"-Infinity"`.
pub mod json_f64 {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    const NAN: &str = "NaN";
    const INFINITY: &str = "Infinity";
    const NEG_INFINITY: &str = "-Infinity";

    fn name(v: f64) -> Option<&'static str> {
        if v.is_nan() {
            Some(NAN)
        } else if v == f64::INFINITY {
            Some(INFINITY)
        } else if v == f64::NEG_INFINITY {
            Some(NEG_INFINITY)
        } else {
            None
        }
    }

    fn parse_name(s: &str) -> Option<f64> {
        match s {
            NAN => Some(f64::NAN),
            INFINITY => Some(f64::INFINITY),
            NEG_INFINITY => Some(f64::NEG_INFINITY),
            _ => None,
        }
    }

    pub fn to_json(v: f64) -> serde_json::Value {
        match name(v) {
            Some(name) => serde_json::Value::from(name),
            None => serde_json::Value::from(v),
        }
    }

    pub fn from_json(json: &serde_json::Value) -> Option<f64> {
        match json {
            serde_json::Value::String(s) => parse_name(s),
            other => other.as_f64(),
        }
    }

    pub fn serialize<S: Serializer>(v: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        match name(*v) {
            Some(name) => serializer.serialize_str(name),
            None => serializer.serialize_f64(*v),
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Named(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(v) => Ok(v),
            Repr::Named(s) => {
                parse_name(&s).ok_or_else(|| D::Error::custom(format!("not a float: '{}'", s)))
            }
        }
    }
}

/// What changed in the device/template metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationCategory {
    TemplateChanged,
    DeviceTemplateChanged,
}

/// Cache invalidation broadcast by the administrative side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub category: NotificationCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

impl Notification {
    pub fn template_changed(template_id: impl Into<String>) -> Self {
        Self {
            category: NotificationCategory::TemplateChanged,
            template_id: Some(template_id.into()),
            device_id: None,
        }
    }

    pub fn device_template_changed(device_id: impl Into<String>) -> Self {
        Self {
            category: NotificationCategory::DeviceTemplateChanged,
            template_id: None,
            device_id: Some(device_id.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PulseCategory {
    Heartbeat,
}

/// Synthesized liveness signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PulseMessage {
    pub device_id: String,
    pub category: PulseCategory,
    pub timestamp: DateTime<Utc>,
}

impl PulseMessage {
    pub fn heartbeat(device_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            device_id: device_id.into(),
            category: PulseCategory::Heartbeat,
            timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandMessage {
    pub device_id: String,
    pub command_id: u32,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMessage {
    pub device_id: String,
    pub event_id: u32,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Position, Statistics};
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_observation_json_shape() {
        let obs = RoutedObservation {
            device_id: "X1".into(),
            observation_id: 5,
            timestamp: ts(),
            value: Value::Double(21.5),
        };
        let json = serde_json::to_value(&obs).unwrap();
        assert_eq!(json["deviceId"], "X1");
        assert_eq!(json["observationId"], 5);
        assert_eq!(json["dataType"], "Double");
        assert_eq!(json["value"], 21.5);
    }

    #[test]
    fn test_structured_values_survive_json() {
        let values = [
            Value::Position(Position {
                lat: 1.5,
                lon: -2.0,
                alt: 0.0,
            }),
            Value::Binary(vec![0xde, 0xad]),
            Value::Statistics(Statistics {
                count: 3,
                mean: 1.0,
                min: 0.0,
                max: 2.0,
                median: 1.0,
                stddev: 0.5,
                range_from: ts(),
                range_to: ts(),
            }),
        ];
        for value in values {
            let obs = RoutedObservation {
                device_id: "X1".into(),
                observation_id: 1,
                timestamp: ts(),
                value,
            };
            let bytes = serde_json::to_vec(&obs).unwrap();
            assert_eq!(serde_json::from_slice::<RoutedObservation>(&bytes).unwrap(), obs);
        }
    }

    #[test]
    fn test_non_finite_floats_survive_json() {
        let stats = Statistics {
            count: 1,
            mean: 4.0,
            min: 4.0,
            max: 4.0,
            median: 4.0,
            stddev: f64::NAN,
            range_from: ts(),
            range_to: ts(),
        };
        let values = [
            Value::Double(f64::NAN),
            Value::Double(f64::NEG_INFINITY),
            Value::Position(Position {
                lat: f64::INFINITY,
                lon: 2.0,
                alt: f64::NAN,
            }),
            Value::Statistics(stats),
        ];
        for value in values {
            let obs = RoutedObservation {
                device_id: "X1".into(),
                observation_id: 1,
                timestamp: ts(),
                value: value.clone(),
            };
            let bytes = serde_json::to_vec(&obs).unwrap();
            let back = serde_json::from_slice::<RoutedObservation>(&bytes).unwrap();
            // NaN != NaN, so compare the canonical JSON of both sides
            assert_eq!(value_to_json(&back.value), value_to_json(&value));
            assert_eq!(back.data_type(), value.data_type());
        }

        let json = serde_json::to_value(&RoutedObservation {
            device_id: "X1".into(),
            observation_id: 5,
            timestamp: ts(),
            value: Value::Double(f64::NAN),
        })
        .unwrap();
        assert_eq!(json["value"], "NaN");
    }

    #[test]
    fn test_unknown_float_name_rejected() {
        let body = r#"{"deviceId":"X1","observationId":1,"dataType":"Double","value":"nan","timestamp":"2023-11-14T22:13:20Z"}"#;
        assert!(serde_json::from_str::<RoutedObservation>(body).is_err());
    }

    #[test]
    fn test_value_type_mismatch_rejected() {
        let body = r#"{"deviceId":"X1","observationId":1,"dataType":"Boolean","value":"yes","timestamp":"2023-11-14T22:13:20Z"}"#;
        assert!(serde_json::from_str::<RoutedObservation>(body).is_err());
    }

    #[test]
    fn test_notification_shape() {
        let n: Notification =
            serde_json::from_str(r#"{"category":"TemplateChanged","templateId":"T1"}"#).unwrap();
        assert_eq!(n, Notification::template_changed("T1"));
        let json = serde_json::to_string(&Notification::device_template_changed("X1")).unwrap();
        assert_eq!(json, r#"{"category":"DeviceTemplateChanged","deviceId":"X1"}"#);
    }
}
