//! Compact observation container codec.
//!
//! A container batches many typed, timestamped readings from one device into
//! a single upload. Layout (all integers big-endian):
//!
//! ```text
//! header : version u8 | flags u8 | record_count u16
//! record : observation_id u32 | type_tag u8 | timestamp | value
//! ```
//!
//! `timestamp` is a `u32` of Unix seconds, or an `i64` of Unix milliseconds
//! when [`FLAG_EPOCH_MILLIS_64`] is set. Values:
//!
//! | tag | type       | encoding                                             |
//! |-----|------------|------------------------------------------------------|
//! | 0   | Boolean    | u8                                                   |
//! | 1   | Double     | f64                                                  |
//! | 2   | Integer    | i64                                                  |
//! | 3   | Position   | f64 lat, f64 lon, f64 alt                            |
//! | 4   | String     | u16 length, UTF-8 bytes                              |
//! | 5   | Binary     | u32 length, bytes (version 2)                        |
//! | 6   | Statistics | u32 count, f64 mean/min/max/median/stddev, 2 × timestamp (version 2) |

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

pub const VERSION_1: u8 = 1;
pub const VERSION_2: u8 = 2;
/// Timestamps are 64-bit Unix milliseconds instead of 32-bit Unix seconds.
pub const FLAG_EPOCH_MILLIS_64: u8 = 0x01;

const HEADER_LEN: usize = 4;

const TAG_BOOLEAN: u8 = 0;
const TAG_DOUBLE: u8 = 1;
const TAG_INTEGER: u8 = 2;
const TAG_POSITION: u8 = 3;
const TAG_STRING: u8 = 4;
const TAG_BINARY: u8 = 5;
const TAG_STATISTICS: u8 = 6;

pub type Result<T> = std::result::Result<T, ContainerError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ContainerError {
    #[error("malformed container: {0}")]
    MalformedContainer(String),

    #[error("unsupported container version {0}")]
    UnsupportedVersion(u8),

    #[error("{data_type:?} values require container version {required}, got {version}")]
    UnsupportedForVersion {
        data_type: DataType,
        version: u8,
        required: u8,
    },

    #[error("too many records for one container: {0}")]
    TooManyRecords(usize),

    #[error("{data_type:?} value too long: {len} bytes")]
    ValueTooLong { data_type: DataType, len: usize },

    #[error("timestamp {0} is not representable with the selected width")]
    TimestampOutOfRange(DateTime<Utc>),
}

fn malformed(reason: impl Into<String>) -> ContainerError {
    ContainerError::MalformedContainer(reason.into())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Boolean,
    Double,
    Integer,
    Position,
    String,
    Binary,
    Statistics,
}

impl DataType {
    pub fn as_str(self) -> &'static str {
        match self {
            DataType::Boolean => "Boolean",
            DataType::Double => "Double",
            DataType::Integer => "Integer",
            DataType::Position => "Position",
            DataType::String => "String",
            DataType::Binary => "Binary",
            DataType::Statistics => "Statistics",
        }
    }

    fn tag(self) -> u8 {
        match self {
            DataType::Boolean => TAG_BOOLEAN,
            DataType::Double => TAG_DOUBLE,
            DataType::Integer => TAG_INTEGER,
            DataType::Position => TAG_POSITION,
            DataType::String => TAG_STRING,
            DataType::Binary => TAG_BINARY,
            DataType::Statistics => TAG_STATISTICS,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            TAG_BOOLEAN => Some(DataType::Boolean),
            TAG_DOUBLE => Some(DataType::Double),
            TAG_INTEGER => Some(DataType::Integer),
            TAG_POSITION => Some(DataType::Position),
            TAG_STRING => Some(DataType::String),
            TAG_BINARY => Some(DataType::Binary),
            TAG_STATISTICS => Some(DataType::Statistics),
            _ => None,
        }
    }

    /// Oldest container version able to carry this type.
    pub fn min_version(self) -> u8 {
        match self {
            DataType::Binary | DataType::Statistics => VERSION_2,
            _ => VERSION_1,
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = String;

    /// Case-insensitive; also accepts the short forms `bool` and `int`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "boolean" | "bool" => Ok(DataType::Boolean),
            "double" => Ok(DataType::Double),
            "integer" | "int" => Ok(DataType::Integer),
            "position" => Ok(DataType::Position),
            "string" => Ok(DataType::String),
            "binary" => Ok(DataType::Binary),
            "statistics" => Ok(DataType::Statistics),
            _ => Err(format!("unknown data type '{}'", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    #[serde(with = "crate::model::json_f64")]
    pub lat: f64,
    #[serde(with = "crate::model::json_f64")]
    pub lon: f64,
    #[serde(with = "crate::model::json_f64")]
    pub alt: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Statistics {
    pub count: u32,
    #[serde(with = "crate::model::json_f64")]
    pub mean: f64,
    #[serde(with = "crate::model::json_f64")]
    pub min: f64,
    #[serde(with = "crate::model::json_f64")]
    pub max: f64,
    #[serde(with = "crate::model::json_f64")]
    pub median: f64,
    #[serde(with = "crate::model::json_f64")]
    pub stddev: f64,
    pub range_from: DateTime<Utc>,
    pub range_to: DateTime<Utc>,
}

/// A typed observation value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Boolean(bool),
    Double(f64),
    Integer(i64),
    Position(Position),
    String(String),
    Binary(Vec<u8>),
    Statistics(Statistics),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Boolean(_) => DataType::Boolean,
            Value::Double(_) => DataType::Double,
            Value::Integer(_) => DataType::Integer,
            Value::Position(_) => DataType::Position,
            Value::String(_) => DataType::String,
            Value::Binary(_) => DataType::Binary,
            Value::Statistics(_) => DataType::Statistics,
        }
    }
}

/// One reading inside a container.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub observation_id: u32,
    pub timestamp: DateTime<Utc>,
    pub value: Value,
}

impl Record {
    pub fn new(observation_id: u32, timestamp: DateTime<Utc>, value: Value) -> Self {
        Self {
            observation_id,
            timestamp,
            value,
        }
    }

    pub fn data_type(&self) -> DataType {
        self.value.data_type()
    }
}

/// A decoded container.
#[derive(Debug, Clone, PartialEq)]
pub struct Container {
    pub version: u8,
    pub flags: u8,
    pub records: Vec<Record>,
}

impl Container {
    pub fn new(version: u8, flags: u8, records: Vec<Record>) -> Self {
        Self {
            version,
            flags,
            records,
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        encode(&self.records, self.version, self.flags)
    }

    pub fn decode(input: &[u8]) -> Result<Self> {
        decode(input)
    }
}

/// Encode records into a container blob.
pub fn encode(records: &[Record], version: u8, flags: u8) -> Result<Bytes> {
    if version != VERSION_1 && version != VERSION_2 {
        return Err(ContainerError::UnsupportedVersion(version));
    }
    let count = u16::try_from(records.len())
        .map_err(|_| ContainerError::TooManyRecords(records.len()))?;
    let wide = flags & FLAG_EPOCH_MILLIS_64 != 0;

    let mut buf = BytesMut::with_capacity(HEADER_LEN + records.len() * 16);
    buf.put_u8(version);
    buf.put_u8(flags);
    buf.put_u16(count);

    for record in records {
        let data_type = record.data_type();
        if data_type.min_version() > version {
            return Err(ContainerError::UnsupportedForVersion {
                data_type,
                version,
                required: data_type.min_version(),
            });
        }
        buf.put_u32(record.observation_id);
        buf.put_u8(data_type.tag());
        put_timestamp(&mut buf, &record.timestamp, wide)?;
        put_value(&mut buf, &record.value, wide)?;
    }

    Ok(buf.freeze())
}

/// Decode a container blob.
pub fn decode(input: &[u8]) -> Result<Container> {
    let mut reader = Reader { buf: input };

    reader.need(HEADER_LEN, "header")?;
    let version = reader.buf.get_u8();
    if version != VERSION_1 && version != VERSION_2 {
        return Err(malformed(format!("unsupported version {}", version)));
    }
    let flags = reader.buf.get_u8();
    let count = reader.buf.get_u16() as usize;
    let wide = flags & FLAG_EPOCH_MILLIS_64 != 0;

    if count.saturating_mul(min_record_len(wide)) > reader.buf.remaining() {
        return Err(malformed(format!(
            "declared {} records but only {} bytes remain",
            count,
            reader.buf.remaining()
        )));
    }

    let mut records = Vec::with_capacity(count);
    for index in 0..count {
        reader.need(5, "record header")?;
        let observation_id = reader.buf.get_u32();
        let tag = reader.buf.get_u8();
        let data_type = DataType::from_tag(tag)
            .filter(|t| t.min_version() <= version)
            .ok_or_else(|| {
                malformed(format!(
                    "unknown type tag {} in record {} of a version {} container",
                    tag, index, version
                ))
            })?;
        let timestamp = reader.timestamp(wide)?;
        let value = reader.value(data_type, wide)?;
        records.push(Record {
            observation_id,
            timestamp,
            value,
        });
    }

    if reader.buf.has_remaining() {
        return Err(malformed(format!(
            "{} trailing bytes after {} records",
            reader.buf.remaining(),
            count
        )));
    }

    Ok(Container {
        version,
        flags,
        records,
    })
}

fn timestamp_len(wide: bool) -> usize {
    if wide {
        8
    } else {
        4
    }
}

// Smallest record: id + tag + timestamp + one-byte boolean.
fn min_record_len(wide: bool) -> usize {
    4 + 1 + timestamp_len(wide) + 1
}

fn put_timestamp(buf: &mut BytesMut, ts: &DateTime<Utc>, wide: bool) -> Result<()> {
    if wide {
        buf.put_i64(ts.timestamp_millis());
    } else {
        let secs =
            u32::try_from(ts.timestamp()).map_err(|_| ContainerError::TimestampOutOfRange(*ts))?;
        buf.put_u32(secs);
    }
    Ok(())
}

fn put_value(buf: &mut BytesMut, value: &Value, wide: bool) -> Result<()> {
    match value {
        Value::Boolean(v) => buf.put_u8(u8::from(*v)),
        Value::Double(v) => buf.put_f64(*v),
        Value::Integer(v) => buf.put_i64(*v),
        Value::Position(p) => {
            buf.put_f64(p.lat);
            buf.put_f64(p.lon);
            buf.put_f64(p.alt);
        }
        Value::String(s) => {
            let len = u16::try_from(s.len()).map_err(|_| ContainerError::ValueTooLong {
                data_type: DataType::String,
                len: s.len(),
            })?;
            buf.put_u16(len);
            buf.put_slice(s.as_bytes());
        }
        Value::Binary(b) => {
            let len = u32::try_from(b.len()).map_err(|_| ContainerError::ValueTooLong {
                data_type: DataType::Binary,
                len: b.len(),
            })?;
            buf.put_u32(len);
            buf.put_slice(b);
        }
        Value::Statistics(s) => {
            buf.put_u32(s.count);
            buf.put_f64(s.mean);
            buf.put_f64(s.min);
            buf.put_f64(s.max);
            buf.put_f64(s.median);
            buf.put_f64(s.stddev);
            put_timestamp(buf, &s.range_from, wide)?;
            put_timestamp(buf, &s.range_to, wide)?;
        }
    }
    Ok(())
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl Reader<'_> {
    fn need(&self, len: usize, what: &str) -> Result<()> {
        if self.buf.remaining() < len {
            return Err(malformed(format!(
                "truncated {}: need {} bytes, have {}",
                what,
                len,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn timestamp(&mut self, wide: bool) -> Result<DateTime<Utc>> {
        self.need(timestamp_len(wide), "timestamp")?;
        let parsed = if wide {
            let millis = self.buf.get_i64();
            Utc.timestamp_millis_opt(millis).single()
        } else {
            let secs = self.buf.get_u32();
            Utc.timestamp_opt(i64::from(secs), 0).single()
        };
        parsed.ok_or_else(|| malformed("timestamp out of range"))
    }

    fn f64s<const N: usize>(&mut self, what: &str) -> Result<[f64; N]> {
        self.need(8 * N, what)?;
        let mut out = [0.0; N];
        for slot in out.iter_mut() {
            *slot = self.buf.get_f64();
        }
        Ok(out)
    }

    fn bytes(&mut self, len: usize, what: &str) -> Result<Vec<u8>> {
        self.need(len, what)?;
        let out = self.buf[..len].to_vec();
        self.buf.advance(len);
        Ok(out)
    }

    fn value(&mut self, data_type: DataType, wide: bool) -> Result<Value> {
        let value = match data_type {
            DataType::Boolean => {
                self.need(1, "boolean")?;
                Value::Boolean(self.buf.get_u8() != 0)
            }
            DataType::Double => {
                let [v] = self.f64s::<1>("double")?;
                Value::Double(v)
            }
            DataType::Integer => {
                self.need(8, "integer")?;
                Value::Integer(self.buf.get_i64())
            }
            DataType::Position => {
                let [lat, lon, alt] = self.f64s::<3>("position")?;
                Value::Position(Position { lat, lon, alt })
            }
            DataType::String => {
                self.need(2, "string length")?;
                let len = self.buf.get_u16() as usize;
                let raw = self.bytes(len, "string")?;
                let s = String::from_utf8(raw).map_err(|_| malformed("string is not UTF-8"))?;
                Value::String(s)
            }
            DataType::Binary => {
                self.need(4, "binary length")?;
                let len = self.buf.get_u32() as usize;
                Value::Binary(self.bytes(len, "binary")?)
            }
            DataType::Statistics => {
                self.need(4, "statistics count")?;
                let count = self.buf.get_u32();
                let [mean, min, max, median, stddev] = self.f64s::<5>("statistics")?;
                let range_from = self.timestamp(wide)?;
                let range_to = self.timestamp(wide)?;
                Value::Statistics(Statistics {
                    count,
                    mean,
                    min,
                    max,
                    median,
                    stddev,
                    range_from,
                    range_to,
                })
            }
        };
        Ok(value)
    }
}

const FORGIVING: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

/// Decode base64 from constrained device firmware.
///
/// Padding may be missing or excessive. Input whose unpadded length leaves a
/// dangling sextet is trimmed to the previous quantum boundary before giving
/// up.
pub fn decode_base64_forgiving(input: &[u8]) -> std::result::Result<Vec<u8>, base64::DecodeError> {
    let cleaned: Vec<u8> = input
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    let end = cleaned
        .iter()
        .rposition(|&b| b != b'=')
        .map_or(0, |pos| pos + 1);
    let mut body = &cleaned[..end];

    match FORGIVING.decode(body) {
        Ok(decoded) => Ok(decoded),
        Err(err) => {
            if body.len() % 4 == 1 {
                body = &body[..body.len() - 1];
                FORGIVING.decode(body)
            } else {
                Err(err)
            }
        }
    }
}
