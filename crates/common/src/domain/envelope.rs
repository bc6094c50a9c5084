use crate::domain::result::{DomainError, DomainResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Envelope schema version stamped on every event
pub const SCHEMA_VERSION: &str = "1.0";

/// Kind of event carried by an envelope, serialized with its dotted wire name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "session.created")]
    SessionCreated,
    #[serde(rename = "weight.recorded")]
    WeightRecorded,
    #[serde(rename = "image.captured")]
    ImageCaptured,
    #[serde(rename = "session.finalized")]
    SessionFinalized,
    #[serde(rename = "device.status")]
    DeviceStatus,
    #[serde(rename = "telemetry.reading")]
    TelemetryReading,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::SessionCreated => "session.created",
            EventType::WeightRecorded => "weight.recorded",
            EventType::ImageCaptured => "image.captured",
            EventType::SessionFinalized => "session.finalized",
            EventType::DeviceStatus => "device.status",
            EventType::TelemetryReading => "telemetry.reading",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "session.created" => Ok(EventType::SessionCreated),
            "weight.recorded" => Ok(EventType::WeightRecorded),
            "image.captured" => Ok(EventType::ImageCaptured),
            "session.finalized" => Ok(EventType::SessionFinalized),
            "device.status" => Ok(EventType::DeviceStatus),
            "telemetry.reading" => Ok(EventType::TelemetryReading),
            other => Err(DomainError::ValidationError(format!(
                "unknown event type: {}",
                other
            ))),
        }
    }
}

/// Canonical event wrapper carried over the broker.
///
/// `event_id` is fixed at creation and survives buffering and republishing;
/// only `retry_count` changes between attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub schema_version: String,
    pub event_id: String,
    pub trace_id: String,
    pub tenant_id: String,
    pub device_id: String,
    pub event_type: EventType,
    #[serde(with = "utc_timestamp")]
    pub ts: DateTime<Utc>,
    pub payload: Map<String, Value>,
    pub content_hash: String,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(with = "utc_timestamp")]
    pub produced_at: DateTime<Utc>,
}

/// Input for creating an envelope
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub tenant_id: String,
    pub device_id: String,
    pub event_type: EventType,
    pub payload: Map<String, Value>,
    pub trace_id: String,
    /// Event time. Callers default a missing time to `Utc::now()` themselves.
    pub ts: DateTime<Utc>,
    /// Stable key the event id is derived from. `None` yields a fresh id.
    pub idempotency_key: Option<String>,
}

impl EventEnvelope {
    /// Build an envelope: assigns the event id, hashes the payload and stamps
    /// `produced_at`.
    pub fn new(event: NewEvent) -> DomainResult<Self> {
        let content_hash = content_hash(&event.payload)?;
        let event_id = match &event.idempotency_key {
            Some(key) => derive_id(key),
            None => xid::new().to_string(),
        };

        Ok(Self {
            schema_version: SCHEMA_VERSION.to_string(),
            event_id,
            trace_id: event.trace_id,
            tenant_id: event.tenant_id,
            device_id: event.device_id,
            event_type: event.event_type,
            ts: event.ts,
            payload: event.payload,
            content_hash,
            retry_count: 0,
            produced_at: Utc::now(),
        })
    }

    pub fn encode(&self) -> DomainResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> DomainResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Copy of this envelope for a republish attempt
    pub fn next_attempt(&self) -> Self {
        let mut next = self.clone();
        next.retry_count = next.retry_count.saturating_add(1);
        next
    }
}

/// SHA-256 (hex) over the JCS-canonical form of a payload: sorted keys, no
/// whitespace. Identical payloads always hash identically.
pub fn content_hash(payload: &Map<String, Value>) -> DomainResult<String> {
    let canonical = serde_json_canonicalizer::to_vec(payload)
        .map_err(|e| DomainError::Codec(format!("failed to canonicalize payload: {}", e)))?;
    Ok(sha256_hex(&canonical))
}

/// Deterministic 32-hex-character identifier for a key
pub fn derive_id(key: &str) -> String {
    let mut digest = sha256_hex(key.as_bytes());
    digest.truncate(32);
    digest
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// RFC3339 in UTC with a trailing `Z`, keeping sub-second precision as needed
mod utc_timestamp {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}
