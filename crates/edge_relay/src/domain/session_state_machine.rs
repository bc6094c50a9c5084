use crate::domain::{payload, read_stable_weight, EventFactory, OutboundEvent, StabilityConfig};
use chrono::{DateTime, Utc};
use common::domain::{
    BindMediaRequest, BindWeightRequest, CaptureDevice, CreateSessionRequest, DomainError,
    DomainResult, EventPublisher, EventType, FinalizeSessionRequest, MediaRef, MediaUploader,
    PublishOutcome, Session, SessionRelay, SessionState, UploadContext,
};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Collaborators a session emits through
#[derive(Clone)]
pub struct SessionServices {
    pub factory: EventFactory,
    pub publisher: Arc<dyn EventPublisher>,
    pub uploader: Arc<dyn MediaUploader>,
    pub relay: Arc<dyn SessionRelay>,
}

/// What one `capture_and_record` round produced
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRound {
    pub media: Option<MediaRef>,
    pub weight_kg: Option<f64>,
}

/// Lifecycle of one weigh session: `created → capturing → finalized | failed`.
///
/// Each transition publishes its event before mutating state, so a failed
/// publish leaves the session where it was. Session relay calls follow the
/// event and never fail a transition.
pub struct SessionStateMachine {
    session: Session,
    services: SessionServices,
    capture_rounds: usize,
}

impl SessionStateMachine {
    pub fn new(session: Session, services: SessionServices) -> Self {
        Self {
            session,
            services,
            capture_rounds: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.session.state
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn into_session(self) -> Session {
        self.session
    }

    /// `created → capturing`, emits `session.created`
    #[instrument(skip_all, fields(session_id = %self.session.session_id, trace_id = %self.session.trace_id))]
    pub async fn start(&mut self, ts: DateTime<Utc>) -> DomainResult<()> {
        self.require(SessionState::Created, "start")?;

        let event = self.services.factory.session_event(
            &self.session,
            EventType::SessionCreated,
            0,
            ts,
            payload(json!({ "started_at": self.session.started_at })),
        )?;
        self.emit(&event).await?;
        self.session.state = SessionState::Capturing;
        info!("session started");

        let identity = self.services.factory.identity();
        self.services
            .relay
            .create_session(&CreateSessionRequest {
                session_id: self.session.session_id.clone(),
                event_id: event.envelope.event_id.clone(),
                tenant_id: identity.tenant_id.clone(),
                farm_id: identity.farm_id.clone(),
                barn_id: identity.barn_id.clone(),
                station_id: identity.station_id.clone(),
                device_id: identity.device_id.clone(),
                batch_id: self.session.batch_id.clone(),
                started_at: self.session.started_at,
            })
            .await;
        Ok(())
    }

    /// Record a stable weight: `weight.recorded` plus a weight `telemetry.reading`.
    /// Only a storage failure of the telemetry reading fails the call.
    #[instrument(skip_all, fields(session_id = %self.session.session_id, weight_kg = weight_kg))]
    pub async fn record_weight(&mut self, weight_kg: f64, ts: DateTime<Utc>) -> DomainResult<()> {
        self.require(SessionState::Capturing, "record_weight")?;
        if !weight_kg.is_finite() || weight_kg < 0.0 {
            return Err(DomainError::ValidationError(format!(
                "invalid weight reading: {}",
                weight_kg
            )));
        }

        let ordinal = self.session.weights.len();
        let event = self.services.factory.session_event(
            &self.session,
            EventType::WeightRecorded,
            ordinal,
            ts,
            payload(json!({ "weight_kg": weight_kg, "unit": "kg", "recorded_at": ts })),
        )?;
        self.emit(&event).await?;
        self.session.weights.push(weight_kg);

        let telemetry = self
            .services
            .factory
            .weight_telemetry(&self.session, ordinal, weight_kg, ts)?;
        match self.emit(&telemetry).await {
            Ok(_) => {}
            Err(e @ DomainError::Storage(_)) => return Err(e),
            Err(e) => warn!(error = %e, "failed to emit weight telemetry"),
        }

        self.services
            .relay
            .bind_weight(&BindWeightRequest {
                session_id: self.session.session_id.clone(),
                event_id: event.envelope.event_id.clone(),
                weight_kg,
                recorded_at: ts,
            })
            .await;
        Ok(())
    }

    /// Upload one image and emit `image.captured` once it has a `media_id`.
    ///
    /// `ordinal` is the image's position within the capture. A failed upload
    /// returns `Ok(None)` without an event; the session stays usable.
    #[instrument(skip_all, fields(session_id = %self.session.session_id, ordinal = ordinal, size = bytes.len()))]
    pub async fn record_image(
        &mut self,
        bytes: Vec<u8>,
        content_type: &str,
        ordinal: usize,
        ts: DateTime<Utc>,
    ) -> DomainResult<Option<MediaRef>> {
        self.require(SessionState::Capturing, "record_image")?;

        let identity = self.services.factory.identity();
        let ctx = UploadContext {
            tenant_id: identity.tenant_id.clone(),
            farm_id: identity.farm_id.clone(),
            barn_id: identity.barn_id.clone(),
            device_id: identity.device_id.clone(),
            session_id: self.session.session_id.clone(),
            trace_id: self.session.trace_id.clone(),
        };

        let media = match self.services.uploader.upload(&ctx, bytes, content_type).await {
            Ok(media) => media,
            Err(e) => {
                warn!(error = %e, "media upload abandoned for this attempt");
                return Ok(None);
            }
        };

        let event = self.services.factory.session_event(
            &self.session,
            EventType::ImageCaptured,
            ordinal,
            ts,
            payload(json!({
                "media_id": media.media_id,
                "object_key": media.object_key,
                "content_type": media.content_type,
                "size_bytes": media.size_bytes,
                "image_index": ordinal,
            })),
        )?;
        self.emit(&event).await?;
        self.session.images.push(media.clone());

        self.services
            .relay
            .bind_media(&BindMediaRequest {
                session_id: self.session.session_id.clone(),
                event_id: event.envelope.event_id.clone(),
                media_id: media.media_id.clone(),
                object_key: media.object_key.clone(),
            })
            .await;
        Ok(Some(media))
    }

    /// Capture an image and a stable weight from the device.
    ///
    /// Unstable weight only omits `weight.recorded`. A device failure fails
    /// the session.
    #[instrument(skip_all, fields(session_id = %self.session.session_id))]
    pub async fn capture_and_record(
        &mut self,
        device: &dyn CaptureDevice,
        stability: &StabilityConfig,
    ) -> DomainResult<CaptureRound> {
        self.require(SessionState::Capturing, "capture_and_record")?;
        let round = self.capture_rounds;
        self.capture_rounds += 1;

        let image = match device.capture_image().await {
            Ok(image) => image,
            Err(e) => {
                self.fail(&format!("image capture failed: {}", e));
                return Err(e);
            }
        };
        let media = self
            .record_image(image.bytes, &image.content_type, round, Utc::now())
            .await?;

        let weight_kg = match read_stable_weight(device, stability).await {
            Ok(weight) => weight,
            Err(e) => {
                self.fail(&format!("weight read failed: {}", e));
                return Err(e);
            }
        };
        match weight_kg {
            Some(weight) => self.record_weight(weight, Utc::now()).await?,
            None => debug!("no stable weight this round"),
        }

        Ok(CaptureRound { media, weight_kg })
    }

    /// `capturing → finalized`, emits `session.finalized` with the mean weight
    #[instrument(skip_all, fields(session_id = %self.session.session_id, trace_id = %self.session.trace_id))]
    pub async fn finalize(&mut self, ts: DateTime<Utc>) -> DomainResult<Option<f64>> {
        self.require(SessionState::Capturing, "finalize")?;

        let final_weight = self.session.mean_weight();
        let image_count = self.session.images.len();
        let event = self.services.factory.session_event(
            &self.session,
            EventType::SessionFinalized,
            0,
            ts,
            payload(json!({
                "final_weight_kg": final_weight,
                "image_count": image_count,
                "weight_count": self.session.weights.len(),
                "finalized_at": ts,
            })),
        )?;
        self.emit(&event).await?;
        self.session.final_weight = final_weight;
        self.session.state = SessionState::Finalized;
        info!(final_weight_kg = ?final_weight, image_count, "session finalized");

        self.services
            .relay
            .finalize_session(&FinalizeSessionRequest {
                session_id: self.session.session_id.clone(),
                event_id: event.envelope.event_id.clone(),
                final_weight_kg: final_weight,
                image_count,
                finalized_at: ts,
            })
            .await;
        Ok(final_weight)
    }

    /// Drive the session to `failed`; terminal sessions are left alone
    pub fn fail(&mut self, reason: &str) {
        if self.session.state.is_terminal() {
            return;
        }
        warn!(
            session_id = %self.session.session_id,
            from = %self.session.state,
            reason = %reason,
            "session failed"
        );
        self.session.state = SessionState::Failed;
    }

    fn require(&self, expected: SessionState, operation: &'static str) -> DomainResult<()> {
        if self.session.state != expected {
            return Err(DomainError::InvalidTransition {
                state: self.session.state.to_string(),
                operation,
            });
        }
        Ok(())
    }

    async fn emit(&self, event: &OutboundEvent) -> DomainResult<PublishOutcome> {
        let outcome = self
            .services
            .publisher
            .publish_or_buffer(&event.topic, &event.envelope, event.qos, event.retain)
            .await?;
        debug!(
            event_type = %event.envelope.event_type,
            event_id = %event.envelope.event_id,
            outcome = ?outcome,
            "event emitted"
        );
        Ok(outcome)
    }
}
