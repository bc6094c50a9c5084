use crate::domain::{SessionServices, SessionStateMachine};
use chrono::Utc;
use common::domain::{
    CaptureMedia, CaptureRecord, CaptureSource, DomainError, DomainResult, MediaSource,
    ProcessedMarkerStore, Session, SessionState,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Pause after the capture source itself failed
const SOURCE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// What happened to one capture record
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureOutcome {
    Processed {
        session_id: String,
        final_weight_kg: Option<f64>,
        images: usize,
    },
    /// The marker store already had this capture
    AlreadyProcessed,
    /// Events were emitted but the session failed; the capture is marked so
    /// it is not retried forever
    Abandoned { session_id: String, reason: String },
}

/// Turns capture records into session event streams.
///
/// Per capture: `session.created`, weight, one `image.captured` per uploaded
/// file, `session.finalized`, then the processed marker. The marker is
/// written last so a crash anywhere before it reprocesses the capture with
/// the same event ids.
pub struct ProcessingLoop {
    source: Box<dyn CaptureSource>,
    markers: Arc<dyn ProcessedMarkerStore>,
    services: SessionServices,
}

impl ProcessingLoop {
    pub fn new(
        source: Box<dyn CaptureSource>,
        markers: Arc<dyn ProcessedMarkerStore>,
        services: SessionServices,
    ) -> Self {
        Self {
            source,
            markers,
            services,
        }
    }

    /// Pull captures until the source is exhausted or the token is cancelled
    pub async fn run(mut self, ctx: CancellationToken) -> anyhow::Result<()> {
        info!("processing loop started");
        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                next = self.source.next_capture() => match next {
                    Ok(Some(record)) => {
                        let capture_id = record.capture_id.clone();
                        match self.process_capture(record).await {
                            Ok(outcome) => debug!(capture_id = %capture_id, outcome = ?outcome, "capture handled"),
                            Err(e) => error!(
                                capture_id = %capture_id,
                                error = %e,
                                "capture left unprocessed"
                            ),
                        }
                    }
                    Ok(None) => {
                        info!("capture source exhausted");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "capture source failed");
                        tokio::select! {
                            _ = ctx.cancelled() => break,
                            _ = tokio::time::sleep(SOURCE_ERROR_BACKOFF) => {}
                        }
                    }
                }
            }
        }
        info!("processing loop stopped");
        Ok(())
    }

    /// Run one capture through its session.
    ///
    /// An error means the capture is left unmarked and will be picked up
    /// again; nothing durable was lost by not finishing it.
    #[instrument(skip_all, fields(capture_id = %record.capture_id))]
    pub async fn process_capture(&self, record: CaptureRecord) -> DomainResult<CaptureOutcome> {
        if self.markers.is_processed(&record.capture_id).await? {
            debug!("capture already processed, skipping");
            return Ok(CaptureOutcome::AlreadyProcessed);
        }

        let factory = &self.services.factory;
        let session_id = record
            .session_id
            .clone()
            .unwrap_or_else(|| factory.session_id_for(&record.capture_id));
        let session = Session::new(
            session_id.clone(),
            record.batch_id.clone(),
            factory.trace_id_for(&record.capture_id),
            record.captured_at,
        );
        let mut sm = SessionStateMachine::new(session, self.services.clone());

        let outcome = match drive_session(&mut sm, &record).await {
            Ok(final_weight_kg) => CaptureOutcome::Processed {
                session_id,
                final_weight_kg,
                images: sm.session().images.len(),
            },
            Err(e) => {
                let emitted = sm.state() == SessionState::Capturing;
                sm.fail(&e.to_string());
                if !emitted || matches!(e, DomainError::Storage(_)) {
                    return Err(e);
                }
                CaptureOutcome::Abandoned {
                    session_id,
                    reason: e.to_string(),
                }
            }
        };

        self.markers
            .mark_processed(&record.capture_id, Utc::now())
            .await?;
        info!(outcome = ?outcome, "capture processed");
        Ok(outcome)
    }
}

async fn drive_session(
    sm: &mut SessionStateMachine,
    record: &CaptureRecord,
) -> DomainResult<Option<f64>> {
    let ts = record.captured_at;
    sm.start(ts).await?;

    if let Some(weight_kg) = record.weight_kg {
        sm.record_weight(weight_kg, ts).await?;
    }

    for (ordinal, media) in record.media.iter().enumerate() {
        let Some(bytes) = read_media(media).await else {
            continue;
        };
        sm.record_image(bytes, &media.content_type, ordinal, ts)
            .await?;
    }

    sm.finalize(ts).await
}

async fn read_media(media: &CaptureMedia) -> Option<Vec<u8>> {
    match &media.source {
        MediaSource::Memory(bytes) => Some(bytes.clone()),
        MediaSource::File(path) => match tokio::fs::read(path).await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(media = %media.name, path = %path.display(), error = %e, "skipping unreadable media file");
                None
            }
        },
    }
}
