use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Body of `POST /api/v1/weighvision/sessions`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub session_id: String,
    pub event_id: String,
    pub tenant_id: String,
    pub farm_id: String,
    pub barn_id: String,
    pub station_id: String,
    pub device_id: String,
    pub batch_id: Option<String>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindWeightRequest {
    pub session_id: String,
    pub event_id: String,
    pub weight_kg: f64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindMediaRequest {
    pub session_id: String,
    pub event_id: String,
    pub media_id: String,
    pub object_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeSessionRequest {
    pub session_id: String,
    pub event_id: String,
    pub final_weight_kg: Option<f64>,
    pub image_count: usize,
    pub finalized_at: DateTime<Utc>,
}

/// Trait mirroring session state into the server-side session record
///
/// Every call carries the `event_id` that caused it so retried calls are
/// deduplicated server-side. Calls are best effort: they return `false` after
/// exhausting retries and never fail the caller.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait SessionRelay: Send + Sync {
    async fn create_session(&self, request: &CreateSessionRequest) -> bool;

    async fn bind_weight(&self, request: &BindWeightRequest) -> bool;

    async fn bind_media(&self, request: &BindMediaRequest) -> bool;

    async fn finalize_session(&self, request: &FinalizeSessionRequest) -> bool;
}
