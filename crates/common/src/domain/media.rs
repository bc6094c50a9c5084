use crate::domain::result::DomainResult;
use crate::domain::session::MediaRef;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Body of `POST {media_store}/api/v1/media/images/presign`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresignRequest {
    pub tenant_id: String,
    pub farm_id: String,
    pub barn_id: String,
    pub device_id: String,
    pub session_id: String,
    pub content_type: String,
    pub content_length: usize,
}

/// Presign answer from the media store.
///
/// Some deployments return `media_id` in place of `object_key`; either one
/// identifies the object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresignResponse {
    #[serde(default, alias = "uploadUrl")]
    pub upload_url: String,
    #[serde(default, alias = "objectKey")]
    pub object_key: String,
    #[serde(default, alias = "mediaId")]
    pub media_id: Option<String>,
    #[serde(default, alias = "expiresIn")]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl PresignResponse {
    /// Key of the object to upload, falling back to `media_id`
    pub fn object_key(&self) -> &str {
        if !self.object_key.is_empty() {
            return &self.object_key;
        }
        self.media_id.as_deref().unwrap_or("")
    }

    pub fn is_valid(&self) -> bool {
        !self.upload_url.is_empty() && !self.object_key().is_empty()
    }
}

/// Body of `POST {media_store}/api/v1/media/images/complete`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteRequest {
    pub tenant_id: String,
    pub farm_id: String,
    pub barn_id: String,
    pub device_id: String,
    pub session_id: String,
    pub object_key: String,
    pub content_type: String,
    pub size_bytes: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompleteResponse {
    #[serde(default, alias = "mediaId")]
    pub media_id: String,
    #[serde(default, alias = "objectKey")]
    pub object_key: String,
}

impl CompleteResponse {
    pub fn is_valid(&self) -> bool {
        !self.media_id.is_empty() && !self.object_key.is_empty()
    }
}

/// Identifiers an upload is scoped to
#[derive(Debug, Clone, PartialEq)]
pub struct UploadContext {
    pub tenant_id: String,
    pub farm_id: String,
    pub barn_id: String,
    pub device_id: String,
    pub session_id: String,
    pub trace_id: String,
}

/// Trait for the presign → PUT → complete upload protocol
///
/// Implementations must only return a `MediaRef` after the complete step
/// succeeded, so no event can reference a media id the server doesn't know.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait MediaUploader: Send + Sync {
    async fn upload(
        &self,
        ctx: &UploadContext,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> DomainResult<MediaRef>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presign_response_validity() {
        let valid: PresignResponse = serde_json::from_str(
            r#"{"upload_url":"https://s3/put","object_key":"a/b.jpg","expires_in":600}"#,
        )
        .unwrap();
        assert!(valid.is_valid());

        let empty_url: PresignResponse =
            serde_json::from_str(r#"{"upload_url":"","object_key":"a/b.jpg"}"#).unwrap();
        assert!(!empty_url.is_valid());

        let missing_key: PresignResponse =
            serde_json::from_str(r#"{"upload_url":"https://s3/put"}"#).unwrap();
        assert!(!missing_key.is_valid());
    }

    #[test]
    fn test_presign_response_media_id_fallback() {
        let response: PresignResponse = serde_json::from_str(
            r#"{"uploadUrl":"https://s3/put","mediaId":"m-1","headers":{"x-amz-acl":"private"}}"#,
        )
        .unwrap();

        assert!(response.is_valid());
        assert_eq!(response.object_key(), "m-1");
        assert_eq!(response.headers.get("x-amz-acl").unwrap(), "private");
    }

    #[test]
    fn test_complete_response_validity() {
        let valid = CompleteResponse {
            media_id: "m-1".to_string(),
            object_key: "a/b.jpg".to_string(),
        };
        assert!(valid.is_valid());
        assert!(!CompleteResponse::default().is_valid());
    }
}
