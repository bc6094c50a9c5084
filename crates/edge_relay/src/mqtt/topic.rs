use common::domain::{DomainError, DomainResult, EventType, StationIdentity};

/// Topic for a session-scoped event:
/// `iot/weighvision/{tenant}/{farm}/{barn}/{station}/session/{session_id}/{event_type}`
pub fn session_topic(identity: &StationIdentity, session_id: &str, event_type: EventType) -> String {
    format!(
        "iot/weighvision/{}/{}/{}/{}/session/{}/{}",
        identity.tenant_id,
        identity.farm_id,
        identity.barn_id,
        identity.station_id,
        session_id,
        event_type.as_str()
    )
}

/// Topic for a raw telemetry metric:
/// `iot/telemetry/{tenant}/{farm}/{barn}/{device}/{metric}`
pub fn telemetry_topic(identity: &StationIdentity, metric: &str) -> String {
    format!(
        "iot/telemetry/{}/{}/{}/{}/{}",
        identity.tenant_id, identity.farm_id, identity.barn_id, identity.device_id, metric
    )
}

/// Retained online/offline status topic: `iot/status/{tenant}/{farm}/{barn}/{device}`
pub fn status_topic(identity: &StationIdentity) -> String {
    format!(
        "iot/status/{}/{}/{}/{}",
        identity.tenant_id, identity.farm_id, identity.barn_id, identity.device_id
    )
}

/// Check a value that becomes one level of a topic, such as a session id.
/// Separators, the `+`/`#` wildcards and NUL are refused.
pub fn validate_topic_segment(field: &str, value: &str) -> DomainResult<()> {
    if value.is_empty() {
        return Err(DomainError::ValidationError(format!("{} is empty", field)));
    }
    if value.contains(['/', '+', '#', '\0']) {
        return Err(DomainError::ValidationError(format!(
            "{} {:?} is not a valid topic level",
            field, value
        )));
    }
    Ok(())
}

/// Check a topic name before publishing; brokers refuse wildcards in it
pub fn validate_publish_topic(topic: &str) -> DomainResult<()> {
    if topic.is_empty() || topic.contains(['+', '#', '\0']) {
        return Err(DomainError::ValidationError(format!(
            "{:?} is not a valid publish topic",
            topic
        )));
    }
    Ok(())
}

/// Parse broker URL in format mqtt://host:port or tcp://host:port or host:port
pub fn parse_broker_url(url: &str) -> DomainResult<(&str, u16)> {
    let url = url.trim();
    let url = url.trim_start_matches("mqtt://");
    let url = url.trim_start_matches("tcp://");

    let parts: Vec<&str> = url.split(':').collect();
    match parts.as_slice() {
        [host] if !host.is_empty() => Ok((host, 1883)), // Default MQTT port
        [host, port] if !host.is_empty() => {
            let port = port.parse::<u16>().map_err(|_| {
                DomainError::ValidationError(format!("Invalid port in broker URL: {}", port))
            })?;
            Ok((host, port))
        }
        _ => Err(DomainError::ValidationError(format!(
            "Invalid broker URL format: {}",
            url
        ))),
    }
}
