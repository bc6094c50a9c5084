use crate::domain::envelope::EventEnvelope;
use crate::domain::result::{DomainError, DomainResult};
use async_trait::async_trait;

/// MQTT delivery guarantee level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl Qos {
    pub fn as_u8(&self) -> u8 {
        match self {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }

    pub fn from_u8(level: u8) -> DomainResult<Self> {
        match level {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            other => Err(DomainError::ValidationError(format!(
                "invalid QoS level: {}",
                other
            ))),
        }
    }
}

/// Where an event ended up after a publish-or-buffer call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    Buffered,
}

/// Trait for handing events to the broker
///
/// Implementations should:
/// - Publish immediately when connected
/// - Fall back to the durable offline buffer otherwise
/// - Never block waiting for a reconnect
/// - Return an error only when the event could neither be published nor buffered
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish_or_buffer(
        &self,
        topic: &str,
        envelope: &EventEnvelope,
        qos: Qos,
        retain: bool,
    ) -> DomainResult<PublishOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_levels() {
        for qos in [Qos::AtMostOnce, Qos::AtLeastOnce, Qos::ExactlyOnce] {
            assert_eq!(Qos::from_u8(qos.as_u8()).unwrap(), qos);
        }
        assert!(Qos::from_u8(3).is_err());
    }
}
