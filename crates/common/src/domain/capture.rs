use crate::domain::result::DomainResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::PathBuf;

/// Image bytes straight from the camera
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedImage {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// Where the bytes of a capture's media file live
#[derive(Debug, Clone, PartialEq)]
pub enum MediaSource {
    Memory(Vec<u8>),
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureMedia {
    pub name: String,
    pub content_type: String,
    pub source: MediaSource,
}

/// One observed capture, independent of how it was observed
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRecord {
    /// Stable identifier; the processed marker and all idempotency keys hang off it
    pub capture_id: String,
    pub session_id: Option<String>,
    pub batch_id: Option<String>,
    pub captured_at: DateTime<Utc>,
    pub weight_kg: Option<f64>,
    pub media: Vec<CaptureMedia>,
}

/// Camera/scale hardware, consumed as a black box
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    /// Capture one (already rectified) image
    async fn capture_image(&self) -> DomainResult<CapturedImage>;

    /// One raw scale reading in kilograms
    async fn read_weight(&self) -> DomainResult<f64>;
}

/// Producer of capture records, push- or poll-based
#[async_trait]
pub trait CaptureSource: Send + Sync {
    /// Wait for the next unseen capture. `Ok(None)` means the source is exhausted.
    async fn next_capture(&mut self) -> DomainResult<Option<CaptureRecord>>;
}

/// Content type guessed from a media file extension
pub fn content_type_for(name: &str) -> Option<&'static str> {
    let ext = name.rsplit_once('.')?.1.to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        _ => None,
    }
}
