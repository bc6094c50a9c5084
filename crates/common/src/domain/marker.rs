use crate::domain::result::DomainResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Durable `capture_id → processed_at` ledger.
///
/// The presence of an entry is the single source of truth for "do not
/// reprocess this capture".
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait ProcessedMarkerStore: Send + Sync {
    async fn is_processed(&self, capture_id: &str) -> DomainResult<bool>;

    async fn processed_at(&self, capture_id: &str) -> DomainResult<Option<DateTime<Utc>>>;

    async fn mark_processed(&self, capture_id: &str, processed_at: DateTime<Utc>)
        -> DomainResult<()>;
}
