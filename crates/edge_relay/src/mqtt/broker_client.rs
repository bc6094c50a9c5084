use crate::buffer::{BufferedEvent, OfflineEventBuffer, ReplayOutcome};
use crate::domain::{payload, DeviceStatus, EventFactory, OutboundEvent};
use async_trait::async_trait;
use common::domain::{DomainResult, EventEnvelope, EventPublisher, PublishOutcome, Qos};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::Notify;
use tracing::{debug, info, instrument, warn};

/// Raw publish seam over the MQTT client
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MqttTransport: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos, retain: bool)
        -> DomainResult<()>;
}

/// Publish-or-buffer front of the broker connection.
///
/// While `connected` is down every event goes to the offline buffer. It only
/// goes up once the buffer has been drained, and it is flipped under the
/// buffer's write lock, so no event is ever buffered while later ones go out
/// live. A failed live publish takes the client offline and asks the network
/// loop for a recovery replay.
pub struct BrokerClient {
    transport: Arc<dyn MqttTransport>,
    buffer: Arc<OfflineEventBuffer>,
    factory: EventFactory,
    connected: AtomicBool,
    active_endpoint: RwLock<Option<String>>,
    recovery: Notify,
}

impl BrokerClient {
    pub fn new(
        transport: Arc<dyn MqttTransport>,
        buffer: Arc<OfflineEventBuffer>,
        factory: EventFactory,
    ) -> Self {
        Self {
            transport,
            buffer,
            factory,
            connected: AtomicBool::new(false),
            active_endpoint: RwLock::new(None),
            recovery: Notify::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Endpoint of the current or last connection, for status and logs only
    pub fn active_endpoint(&self) -> Option<String> {
        self.active_endpoint
            .read()
            .map(|endpoint| endpoint.clone())
            .unwrap_or_default()
    }

    pub fn buffer(&self) -> &Arc<OfflineEventBuffer> {
        &self.buffer
    }

    /// Offline status to register as the MQTT last will
    pub fn last_will(&self) -> DomainResult<OutboundEvent> {
        self.factory
            .status_event(DeviceStatus::Offline, payload(json!({ "reason": "connection_lost" })))
    }

    /// Connect callback: drain the buffer, go live, then announce `online`.
    #[instrument(skip(self))]
    pub async fn on_connected(&self, endpoint: &str) {
        if let Ok(mut active) = self.active_endpoint.write() {
            *active = Some(endpoint.to_string());
        }
        info!(endpoint = %endpoint, "connected to broker");
        self.resume().await;
    }

    /// Replay until the buffer is empty, go live, then announce `online`.
    /// Stays offline if a replay pass is interrupted.
    pub async fn resume(&self) {
        let mut pass = 0;
        loop {
            pass += 1;
            match self.replay_buffer().await {
                Ok(ReplayOutcome::Empty) | Ok(ReplayOutcome::Completed { .. }) => {}
                Ok(ReplayOutcome::Interrupted { remaining, .. }) => {
                    warn!(remaining, "replay interrupted, staying offline");
                    return;
                }
                Ok(ReplayOutcome::AlreadyRunning) => {
                    debug!("replay already running, leaving go-live to it");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "buffer replay failed");
                    return;
                }
            }

            match self
                .buffer
                .mark_drained(|| self.connected.store(true, Ordering::SeqCst))
                .await
            {
                Ok(true) => break,
                Ok(false) => debug!(pass, "events buffered during replay, replaying again"),
                Err(e) => {
                    warn!(error = %e, "failed to inspect buffer after replay");
                    return;
                }
            }
        }

        self.publish_status(
            DeviceStatus::Online,
            payload(json!({ "endpoint": self.active_endpoint() })),
        )
        .await;
    }

    /// Resolves when a failed live publish left events in the buffer
    pub async fn recovery_requested(&self) {
        self.recovery.notified().await
    }

    /// Disconnect callback. The broker delivers the `offline` last will.
    pub fn on_disconnected(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            warn!(endpoint = ?self.active_endpoint(), "disconnected from broker");
        }
    }

    /// Publish `offline` explicitly before a graceful disconnect
    pub async fn publish_offline_status(&self) {
        if !self.is_connected() {
            return;
        }
        self.publish_status(DeviceStatus::Offline, payload(json!({ "reason": "shutdown" })))
            .await;
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Heartbeat status through the regular publish-or-buffer path
    pub async fn publish_heartbeat(&self) -> DomainResult<PublishOutcome> {
        let buffered = self.buffer.size().await?;
        let event = self.factory.status_event(
            DeviceStatus::Online,
            payload(json!({
                "endpoint": self.active_endpoint(),
                "buffered_events": buffered,
            })),
        )?;
        self.publish_or_buffer(&event.topic, &event.envelope, event.qos, event.retain)
            .await
    }

    /// Replay the offline buffer straight to the transport, bumping
    /// `retry_count` on every republished envelope.
    pub async fn replay_buffer(&self) -> DomainResult<ReplayOutcome> {
        let transport = Arc::clone(&self.transport);
        self.buffer
            .replay(move |event: BufferedEvent| {
                let transport = Arc::clone(&transport);
                async move {
                    let qos = Qos::from_u8(event.qos)?;
                    let bytes = next_attempt_bytes(&event.payload);
                    transport.publish(&event.topic, bytes, qos, event.retain).await
                }
            })
            .await
    }

    async fn publish_status(&self, status: DeviceStatus, extras: Map<String, Value>) {
        let result: DomainResult<()> = async {
            let event = self.factory.status_event(status, extras)?;
            let bytes = event.envelope.encode()?;
            self.transport
                .publish(&event.topic, bytes, event.qos, event.retain)
                .await
        }
        .await;

        match result {
            Ok(()) => debug!(status = status.as_str(), "status published"),
            Err(e) => warn!(status = status.as_str(), error = %e, "failed to publish status"),
        }
    }
}

#[async_trait]
impl EventPublisher for BrokerClient {
    #[instrument(
        skip_all,
        fields(topic = %topic, event_id = %envelope.event_id, event_type = %envelope.event_type)
    )]
    async fn publish_or_buffer(
        &self,
        topic: &str,
        envelope: &EventEnvelope,
        qos: Qos,
        retain: bool,
    ) -> DomainResult<PublishOutcome> {
        if !self.is_connected() {
            let buffered = self
                .buffer
                .add_if(topic, envelope, qos, retain, || !self.is_connected())
                .await?;
            if buffered {
                return Ok(PublishOutcome::Buffered);
            }
            debug!("went live while buffering, publishing directly");
        }

        let bytes = envelope.encode()?;
        match self.transport.publish(topic, bytes, qos, retain).await {
            Ok(()) => {
                debug!("event published");
                Ok(PublishOutcome::Published)
            }
            Err(e) => {
                warn!(error = %e, "publish failed, going offline and buffering event");
                self.buffer
                    .add_if(topic, envelope, qos, retain, || {
                        self.connected.store(false, Ordering::SeqCst);
                        true
                    })
                    .await?;
                self.recovery.notify_one();
                Ok(PublishOutcome::Buffered)
            }
        }
    }
}

/// Re-encode a buffered envelope for its next attempt. Lines that no longer
/// decode are sent as stored.
fn next_attempt_bytes(encoded: &str) -> Vec<u8> {
    let next = EventEnvelope::decode(encoded.as_bytes())
        .and_then(|envelope| envelope.next_attempt().encode());
    match next {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "buffered envelope not decodable, republishing as stored");
            encoded.as_bytes().to_vec()
        }
    }
}
