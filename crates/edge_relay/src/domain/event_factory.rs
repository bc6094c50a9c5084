use crate::mqtt::{session_topic, status_topic, telemetry_topic, validate_topic_segment};
use chrono::{DateTime, Utc};
use common::domain::{
    derive_id, DomainResult, EventEnvelope, EventType, NewEvent, Qos, Session, StationIdentity,
};
use serde_json::{Map, Value};

/// Metric name of the weight telemetry stream
pub const WEIGHT_METRIC: &str = "weight";

/// Station connectivity reported on the retained status topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Online,
    Offline,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
        }
    }
}

/// An envelope together with where and how it must be published
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEvent {
    pub topic: String,
    pub envelope: EventEnvelope,
    pub qos: Qos,
    pub retain: bool,
}

/// Builds envelopes and topics for one station.
///
/// Everything produced for a capture is keyed off the capture id: the trace id
/// and session id are derived from it, and each event id from
/// `(trace_id, event_type, ordinal)`. Processing the same capture again yields
/// the same identifiers.
#[derive(Debug, Clone)]
pub struct EventFactory {
    identity: StationIdentity,
    qos: Qos,
}

impl EventFactory {
    pub fn new(identity: StationIdentity, qos: Qos) -> Self {
        Self { identity, qos }
    }

    pub fn identity(&self) -> &StationIdentity {
        &self.identity
    }

    pub fn qos(&self) -> Qos {
        self.qos
    }

    pub fn trace_id_for(&self, capture_id: &str) -> String {
        derive_id(&format!("trace:{}", capture_id))
    }

    pub fn session_id_for(&self, capture_id: &str) -> String {
        let digest = derive_id(&format!("session:{}", capture_id));
        format!("sess-{}", &digest[..16])
    }

    /// Event on the session topic. `ordinal` distinguishes repeated events of
    /// the same type within a session (image index, weight index).
    pub fn session_event(
        &self,
        session: &Session,
        event_type: EventType,
        ordinal: usize,
        ts: DateTime<Utc>,
        payload: Map<String, Value>,
    ) -> DomainResult<OutboundEvent> {
        validate_topic_segment("session_id", &session.session_id)?;
        let mut body = self.session_fields(session);
        body.extend(payload);

        let envelope = self.envelope(
            event_type,
            &session.trace_id,
            ts,
            body,
            Some(idempotency_key(&session.trace_id, event_type, ordinal)),
        )?;

        Ok(OutboundEvent {
            topic: session_topic(&self.identity, &session.session_id, event_type),
            envelope,
            qos: self.qos,
            retain: false,
        })
    }

    /// `telemetry.reading` for a recorded weight, on the telemetry topic
    pub fn weight_telemetry(
        &self,
        session: &Session,
        ordinal: usize,
        weight_kg: f64,
        ts: DateTime<Utc>,
    ) -> DomainResult<OutboundEvent> {
        let mut body = Map::new();
        body.insert("metric".to_string(), Value::from(WEIGHT_METRIC));
        body.insert("value".to_string(), Value::from(weight_kg));
        body.insert("unit".to_string(), Value::from("kg"));
        body.insert("session_id".to_string(), Value::from(session.session_id.as_str()));
        body.insert("station_id".to_string(), Value::from(self.identity.station_id.as_str()));

        let event_type = EventType::TelemetryReading;
        let envelope = self.envelope(
            event_type,
            &session.trace_id,
            ts,
            body,
            Some(idempotency_key(&session.trace_id, event_type, ordinal)),
        )?;

        Ok(OutboundEvent {
            topic: telemetry_topic(&self.identity, WEIGHT_METRIC),
            envelope,
            qos: self.qos,
            retain: false,
        })
    }

    /// Retained `device.status` event. `extras` are merged into the payload.
    pub fn status_event(
        &self,
        status: DeviceStatus,
        extras: Map<String, Value>,
    ) -> DomainResult<OutboundEvent> {
        let mut body = Map::new();
        body.insert("status".to_string(), Value::from(status.as_str()));
        body.insert("station_id".to_string(), Value::from(self.identity.station_id.as_str()));
        body.extend(extras);

        let trace_id = xid::new().to_string();
        let envelope = self.envelope(EventType::DeviceStatus, &trace_id, Utc::now(), body, None)?;

        Ok(OutboundEvent {
            topic: status_topic(&self.identity),
            envelope,
            qos: self.qos,
            retain: true,
        })
    }

    fn envelope(
        &self,
        event_type: EventType,
        trace_id: &str,
        ts: DateTime<Utc>,
        payload: Map<String, Value>,
        idempotency_key: Option<String>,
    ) -> DomainResult<EventEnvelope> {
        EventEnvelope::new(NewEvent {
            tenant_id: self.identity.tenant_id.clone(),
            device_id: self.identity.device_id.clone(),
            event_type,
            payload,
            trace_id: trace_id.to_string(),
            ts,
            idempotency_key,
        })
    }

    fn session_fields(&self, session: &Session) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert("session_id".to_string(), Value::from(session.session_id.as_str()));
        fields.insert(
            "batch_id".to_string(),
            session.batch_id.clone().map(Value::from).unwrap_or(Value::Null),
        );
        fields.insert("farm_id".to_string(), Value::from(self.identity.farm_id.as_str()));
        fields.insert("barn_id".to_string(), Value::from(self.identity.barn_id.as_str()));
        fields.insert("station_id".to_string(), Value::from(self.identity.station_id.as_str()));
        fields
    }
}

fn idempotency_key(trace_id: &str, event_type: EventType, ordinal: usize) -> String {
    format!("{}:{}:{}", trace_id, event_type.as_str(), ordinal)
}

/// Unwrap a `json!` object literal into a payload map
pub fn payload(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
