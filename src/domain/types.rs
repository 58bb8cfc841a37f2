//! Junction records and the upstream feed wire format

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::debug;

/// Get current epoch milliseconds
#[inline]
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Newtype wrapper for junction identifiers
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JunctionId(pub String);

impl JunctionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JunctionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JunctionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Latest known measurement for one intersection
///
/// Serializes with the field names used on the feed so egress consumers see
/// the same shape they would read upstream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JunctionRecord {
    pub junction_id: JunctionId,
    pub latitude: f64,
    pub longitude: f64,
    pub vehicle_density: i64,
    #[serde(rename = "greenLightDuration")]
    pub green_light_duration_secs: u32,
    #[serde(rename = "timestamp")]
    pub timestamp_ms: u64,
    pub emergency_vehicle_present: bool,
}

impl JunctionRecord {
    pub fn new(id: &str, latitude: f64, longitude: f64, vehicle_density: i64) -> Self {
        Self {
            junction_id: JunctionId::from(id),
            latitude,
            longitude,
            vehicle_density,
            green_light_duration_secs: 0,
            timestamp_ms: 0,
            emergency_vehicle_present: false,
        }
    }

    pub fn with_green_light(mut self, secs: u32) -> Self {
        self.green_light_duration_secs = secs;
        self
    }

    pub fn with_timestamp(mut self, timestamp_ms: u64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    pub fn with_emergency(mut self, present: bool) -> Self {
        self.emergency_vehicle_present = present;
        self
    }

    /// Build a record from one feed entry
    ///
    /// `key` is the child key the entry was stored under; it stands in for a
    /// missing `junctionId`. Returns None when the entry cannot be used.
    fn from_wire(key: Option<&str>, value: Value, received_at_ms: u64) -> Option<Self> {
        let wire: WireJunction = match serde_json::from_value(value) {
            Ok(w) => w,
            Err(e) => {
                debug!(key = ?key, error = %e, "junction_entry_unparseable");
                return None;
            }
        };

        let junction_id = wire
            .junction_id
            .filter(|id| !id.is_empty())
            .or_else(|| key.map(str::to_string))?;

        let latitude = wire.latitude.filter(|v| v.is_finite() && v.abs() <= 90.0)?;
        let longitude = wire.longitude.filter(|v| v.is_finite() && v.abs() <= 180.0)?;
        let vehicle_density = wire.vehicle_density?;
        let green_light_duration_secs = u32::try_from(wire.green_light_duration.unwrap_or(0)).ok()?;

        let timestamp_ms = match wire.timestamp {
            TimestampValue::EpochMs(ms) => ms,
            TimestampValue::IsoString(s) => parse_iso_time(&s)?,
            TimestampValue::None => received_at_ms,
        };

        Some(Self {
            junction_id: JunctionId(junction_id),
            latitude,
            longitude,
            vehicle_density,
            green_light_duration_secs,
            timestamp_ms,
            emergency_vehicle_present: wire.emergency_vehicle_present.unwrap_or(false),
        })
    }
}

/// One junction entry as it appears on the feed
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireJunction {
    #[serde(default)]
    junction_id: Option<String>,
    #[serde(default)]
    latitude: Option<f64>,
    #[serde(default)]
    longitude: Option<f64>,
    #[serde(default)]
    vehicle_density: Option<i64>,
    #[serde(default)]
    green_light_duration: Option<i64>,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    timestamp: TimestampValue,
    #[serde(default)]
    emergency_vehicle_present: Option<bool>,
}

/// Timestamp that can be either ISO 8601 string or epoch milliseconds
#[derive(Debug, Clone, Default)]
pub enum TimestampValue {
    #[default]
    None,
    IsoString(String),
    EpochMs(u64),
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<TimestampValue, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{self, Visitor};

    struct TimestampVisitor;

    impl<'de> Visitor<'de> for TimestampVisitor {
        type Value = TimestampValue;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a string or integer timestamp")
        }

        fn visit_str<E>(self, value: &str) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(TimestampValue::IsoString(value.to_string()))
        }

        fn visit_u64<E>(self, value: u64) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(TimestampValue::EpochMs(value))
        }

        fn visit_i64<E>(self, value: i64) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(TimestampValue::EpochMs(u64::try_from(value).unwrap_or(0)))
        }

        // JavaScript producers write whole numbers as floats
        fn visit_f64<E>(self, value: f64) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            if value.is_finite() && value >= 0.0 {
                Ok(TimestampValue::EpochMs(value as u64))
            } else {
                Ok(TimestampValue::EpochMs(0))
            }
        }

        fn visit_unit<E>(self) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(TimestampValue::None)
        }
    }

    deserializer.deserialize_any(TimestampVisitor)
}

/// Parse ISO 8601 timestamp to epoch milliseconds
fn parse_iso_time(time_str: &str) -> Option<u64> {
    OffsetDateTime::parse(time_str, &Rfc3339)
        .ok()
        .and_then(|dt| u64::try_from(dt.unix_timestamp_nanos() / 1_000_000).ok())
}

/// Full set of junctions delivered by one feed push
#[derive(Debug, Clone, Default)]
pub struct FeedSnapshot {
    pub records: Vec<JunctionRecord>,
    /// Entries that could not be turned into a record
    pub skipped: usize,
    pub received_at_ms: u64,
}

impl FeedSnapshot {
    pub fn new(records: Vec<JunctionRecord>) -> Self {
        Self { records, skipped: 0, received_at_ms: epoch_ms() }
    }
}

/// Upstream subscription failure
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FeedError {
    #[error("feed transport error: {0}")]
    Transport(String),
    #[error("feed permission denied: {0}")]
    Permission(String),
    #[error("feed payload rejected: {0}")]
    Payload(String),
}

/// One delivery from the upstream feed
#[derive(Debug, Clone)]
pub enum FeedEvent {
    Snapshot(FeedSnapshot),
    Error(FeedError),
}

/// Parse one feed payload into a snapshot
///
/// Accepts an object keyed by child key or an array of junction objects.
/// `null` is an empty feed. Entries that do not parse are skipped and counted.
pub fn parse_snapshot(payload: &[u8], received_at_ms: u64) -> Result<FeedSnapshot, FeedError> {
    let root: Value =
        serde_json::from_slice(payload).map_err(|e| FeedError::Payload(e.to_string()))?;

    let mut snapshot = FeedSnapshot { records: Vec::new(), skipped: 0, received_at_ms };

    match root {
        Value::Null => {}
        Value::Object(children) => {
            snapshot.records.reserve(children.len());
            for (key, value) in children {
                match JunctionRecord::from_wire(Some(&key), value, received_at_ms) {
                    Some(record) => snapshot.records.push(record),
                    None => snapshot.skipped += 1,
                }
            }
        }
        Value::Array(entries) => {
            snapshot.records.reserve(entries.len());
            for value in entries {
                match JunctionRecord::from_wire(None, value, received_at_ms) {
                    Some(record) => snapshot.records.push(record),
                    None => snapshot.skipped += 1,
                }
            }
        }
        other => {
            return Err(FeedError::Payload(format!("unexpected root type: {}", json_type(&other))));
        }
    }

    Ok(snapshot)
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
