use crate::domain::{read_stable_weight, StabilityConfig};
use crate::mqtt::validate_topic_segment;
use async_trait::async_trait;
use chrono::Utc;
use common::domain::{
    CaptureDevice, CaptureMedia, CaptureRecord, CaptureSource, DomainResult, MediaSource,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

/// Request to capture one weighing from the device
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CaptureTrigger {
    pub session_id: Option<String>,
    pub batch_id: Option<String>,
}

/// Push-based source: every trigger captures one image and one stable weight
pub struct DeviceCaptureSource {
    triggers: mpsc::Receiver<CaptureTrigger>,
    device: Arc<dyn CaptureDevice>,
    stability: StabilityConfig,
}

impl DeviceCaptureSource {
    /// Returns the source and the sender used to trigger captures. The source
    /// is exhausted once every sender is dropped.
    pub fn new(
        device: Arc<dyn CaptureDevice>,
        stability: StabilityConfig,
        capacity: usize,
    ) -> (Self, mpsc::Sender<CaptureTrigger>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                triggers: rx,
                device,
                stability,
            },
            tx,
        )
    }
}

#[async_trait]
impl CaptureSource for DeviceCaptureSource {
    #[instrument(skip(self))]
    async fn next_capture(&mut self) -> DomainResult<Option<CaptureRecord>> {
        let trigger = loop {
            let Some(trigger) = self.triggers.recv().await else {
                return Ok(None);
            };
            let checked = trigger
                .session_id
                .as_deref()
                .map(|id| validate_topic_segment("session_id", id));
            match checked {
                Some(Err(e)) => warn!(error = %e, "dropping capture trigger"),
                _ => break trigger,
            }
        };

        let capture_id = xid::new().to_string();
        let captured_at = Utc::now();
        let image = self.device.capture_image().await?;
        let weight_kg = read_stable_weight(self.device.as_ref(), &self.stability).await?;
        debug!(capture_id = %capture_id, weight_kg = ?weight_kg, "device capture taken");

        let extension = if image.content_type == "image/png" {
            "png"
        } else {
            "jpg"
        };
        Ok(Some(CaptureRecord {
            media: vec![CaptureMedia {
                name: format!("{}.{}", capture_id, extension),
                content_type: image.content_type,
                source: MediaSource::Memory(image.bytes),
            }],
            capture_id,
            session_id: trigger.session_id,
            batch_id: trigger.batch_id,
            captured_at,
            weight_kg,
        }))
    }
}
