use crate::domain::RetryPolicy;
use crate::http::HttpTransport;
use async_trait::async_trait;
use common::domain::{
    CompleteRequest, CompleteResponse, DomainError, DomainResult, MediaRef, MediaUploader,
    PresignRequest, PresignResponse, UploadContext,
};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

const PRESIGN_PATH: &str = "/api/v1/media/images/presign";
const COMPLETE_PATH: &str = "/api/v1/media/images/complete";
pub const TRACE_ID_HEADER: &str = "X-Trace-Id";

#[derive(Debug, Clone)]
pub struct MediaUploaderConfig {
    pub media_store_url: String,
    pub retry: RetryPolicy,
}

/// Presign → PUT → complete upload against the media store.
///
/// Each step is retried on its own. A `MediaRef` is only handed out after the
/// complete step returned a valid `media_id`.
pub struct PresignedMediaUploader {
    http: Arc<dyn HttpTransport>,
    base_url: String,
    retry: RetryPolicy,
}

impl PresignedMediaUploader {
    pub fn new(http: Arc<dyn HttpTransport>, config: MediaUploaderConfig) -> Self {
        Self {
            http,
            base_url: config.media_store_url.trim_end_matches('/').to_string(),
            retry: config.retry,
        }
    }

    /// Step 1. `None` once retries are exhausted or the response shape stays invalid.
    #[instrument(skip_all, fields(session_id = %request.session_id, trace_id = %trace_id))]
    pub async fn request_presign(
        &self,
        request: &PresignRequest,
        trace_id: &str,
    ) -> Option<PresignResponse> {
        let url = format!("{}{}", self.base_url, PRESIGN_PATH);
        let body = serde_json::to_value(request).ok()?;
        let headers = trace_headers(trace_id);

        let result = self
            .retry
            .run("presign", |_| async {
                let presign: PresignResponse =
                    self.post_for(&url, &body, &headers, "presign").await?;
                if !presign.is_valid() {
                    return Err(DomainError::Protocol(
                        "presign response without upload_url or object_key".to_string(),
                    ));
                }
                Ok(presign)
            })
            .await;

        match result {
            Ok(presign) => Some(presign),
            Err(e) => {
                warn!(error = %e, "presign failed");
                None
            }
        }
    }

    /// Step 2. PUT the bytes to the presigned URL; only 200/201 count.
    #[instrument(skip_all, fields(object_key = %presign.object_key(), size = bytes.len()))]
    pub async fn upload_image(
        &self,
        bytes: &[u8],
        presign: &PresignResponse,
        content_type: &str,
    ) -> bool {
        let mut headers = BTreeMap::new();
        headers.insert("Content-Type".to_string(), content_type.to_string());
        headers.extend(presign.headers.clone());

        let result = self
            .retry
            .run("upload", |_| async {
                let response = self
                    .http
                    .put_bytes(&presign.upload_url, bytes.to_vec(), &headers)
                    .await?;
                match response.status {
                    200 | 201 => Ok(()),
                    status => Err(DomainError::HttpStatus {
                        status,
                        url: redact_query(&presign.upload_url),
                    }),
                }
            })
            .await;

        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "image upload failed");
                false
            }
        }
    }

    /// Step 3. Register the object and obtain its durable `media_id`.
    #[instrument(skip_all, fields(object_key = %request.object_key, trace_id = %trace_id))]
    pub async fn complete_upload(
        &self,
        request: &CompleteRequest,
        trace_id: &str,
    ) -> Option<CompleteResponse> {
        let url = format!("{}{}", self.base_url, COMPLETE_PATH);
        let body = serde_json::to_value(request).ok()?;
        let headers = trace_headers(trace_id);

        let result = self
            .retry
            .run("complete", |_| async {
                let complete: CompleteResponse =
                    self.post_for(&url, &body, &headers, "complete").await?;
                if !complete.is_valid() {
                    return Err(DomainError::Protocol(
                        "complete response without media_id or object_key".to_string(),
                    ));
                }
                Ok(complete)
            })
            .await;

        match result {
            Ok(complete) => Some(complete),
            Err(e) => {
                warn!(error = %e, "upload completion failed");
                None
            }
        }
    }

    async fn post_for<T: DeserializeOwned>(
        &self,
        url: &str,
        body: &serde_json::Value,
        headers: &BTreeMap<String, String>,
        step: &str,
    ) -> DomainResult<T> {
        let response = self.http.post_json(url, body, headers).await?;
        if !matches!(response.status, 200 | 201) {
            return Err(DomainError::HttpStatus {
                status: response.status,
                url: url.to_string(),
            });
        }
        serde_json::from_slice(&response.body)
            .map_err(|e| DomainError::Protocol(format!("malformed {} response: {}", step, e)))
    }
}

#[async_trait]
impl MediaUploader for PresignedMediaUploader {
    #[instrument(
        skip_all,
        fields(session_id = %ctx.session_id, trace_id = %ctx.trace_id, content_type = %content_type)
    )]
    async fn upload(
        &self,
        ctx: &UploadContext,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> DomainResult<MediaRef> {
        let size_bytes = bytes.len();
        let presign_request = PresignRequest {
            tenant_id: ctx.tenant_id.clone(),
            farm_id: ctx.farm_id.clone(),
            barn_id: ctx.barn_id.clone(),
            device_id: ctx.device_id.clone(),
            session_id: ctx.session_id.clone(),
            content_type: content_type.to_string(),
            content_length: size_bytes,
        };

        let presign = self
            .request_presign(&presign_request, &ctx.trace_id)
            .await
            .ok_or_else(|| DomainError::Protocol("presign step failed".to_string()))?;

        if !self.upload_image(&bytes, &presign, content_type).await {
            return Err(DomainError::Protocol("upload step failed".to_string()));
        }

        let complete_request = CompleteRequest {
            tenant_id: ctx.tenant_id.clone(),
            farm_id: ctx.farm_id.clone(),
            barn_id: ctx.barn_id.clone(),
            device_id: ctx.device_id.clone(),
            session_id: ctx.session_id.clone(),
            object_key: presign.object_key().to_string(),
            content_type: content_type.to_string(),
            size_bytes,
        };
        let complete = self
            .complete_upload(&complete_request, &ctx.trace_id)
            .await
            .ok_or_else(|| DomainError::Protocol("complete step failed".to_string()))?;

        info!(media_id = %complete.media_id, size_bytes, "image uploaded");
        debug!(object_key = %complete.object_key, "upload registered");

        Ok(MediaRef {
            media_id: complete.media_id,
            object_key: complete.object_key,
            content_type: content_type.to_string(),
            size_bytes,
        })
    }
}

fn trace_headers(trace_id: &str) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    headers.insert(TRACE_ID_HEADER.to_string(), trace_id.to_string());
    headers
}

/// Presigned URLs carry credentials in the query string; keep them out of logs
fn redact_query(url: &str) -> String {
    url.split('?').next().unwrap_or(url).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{HttpResponse, MockHttpTransport};
    use serde_json::json;
    use std::time::Duration;

    fn config() -> MediaUploaderConfig {
        MediaUploaderConfig {
            media_store_url: "http://media.local/".to_string(),
            retry: RetryPolicy::new(3, Duration::ZERO, Duration::ZERO),
        }
    }

    fn ctx() -> UploadContext {
        UploadContext {
            tenant_id: "t1".to_string(),
            farm_id: "f1".to_string(),
            barn_id: "b1".to_string(),
            device_id: "d1".to_string(),
            session_id: "sess-1".to_string(),
            trace_id: "trace-1".to_string(),
        }
    }

    fn json_response(status: u16, body: serde_json::Value) -> DomainResult<HttpResponse> {
        Ok(HttpResponse {
            status,
            body: serde_json::to_vec(&body).unwrap(),
        })
    }

    fn presign_ok() -> serde_json::Value {
        json!({
            "upload_url": "https://s3.local/bucket/a.jpg?X-Amz-Signature=abc",
            "object_key": "t1/sess-1/a.jpg",
            "expires_in": 600,
            "headers": {"x-amz-acl": "private"}
        })
    }

    #[tokio::test]
    async fn test_upload_runs_all_three_steps() {
        let mut http = MockHttpTransport::new();
        http.expect_post_json()
            .withf(|url, body, headers| {
                url == "http://media.local/api/v1/media/images/presign"
                    && body["content_length"] == 4
                    && headers.get(TRACE_ID_HEADER).map(String::as_str) == Some("trace-1")
            })
            .times(1)
            .returning(|_, _, _| json_response(200, presign_ok()));
        http.expect_put_bytes()
            .withf(|url, body, headers| {
                url.starts_with("https://s3.local/bucket/a.jpg")
                    && body == &vec![1, 2, 3, 4]
                    && headers.get("Content-Type").map(String::as_str) == Some("image/jpeg")
                    && headers.get("x-amz-acl").map(String::as_str) == Some("private")
            })
            .times(1)
            .returning(|_, _, _| {
                Ok(HttpResponse {
                    status: 200,
                    body: Vec::new(),
                })
            });
        http.expect_post_json()
            .withf(|url, body, _| {
                url == "http://media.local/api/v1/media/images/complete"
                    && body["object_key"] == "t1/sess-1/a.jpg"
            })
            .times(1)
            .returning(|_, _, _| {
                json_response(201, json!({"media_id": "m-1", "object_key": "t1/sess-1/a.jpg"}))
            });

        let uploader = PresignedMediaUploader::new(Arc::new(http), config());
        let media = uploader.upload(&ctx(), vec![1, 2, 3, 4], "image/jpeg").await.unwrap();

        assert_eq!(media.media_id, "m-1");
        assert_eq!(media.object_key, "t1/sess-1/a.jpg");
        assert_eq!(media.size_bytes, 4);
    }

    #[tokio::test]
    async fn test_empty_upload_url_exhausts_retries() {
        let mut http = MockHttpTransport::new();
        http.expect_post_json()
            .times(3)
            .returning(|_, _, _| json_response(200, json!({"upload_url": "", "object_key": "k"})));
        http.expect_put_bytes().times(0);

        let uploader = PresignedMediaUploader::new(Arc::new(http), config());
        let result = uploader.upload(&ctx(), vec![1], "image/jpeg").await;

        assert!(matches!(result, Err(DomainError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_presign_retries_server_errors() {
        let mut http = MockHttpTransport::new();
        let mut calls = 0;
        http.expect_post_json().times(2).returning(move |_, _, _| {
            calls += 1;
            if calls == 1 {
                json_response(503, json!({}))
            } else {
                json_response(200, presign_ok())
            }
        });

        let uploader = PresignedMediaUploader::new(Arc::new(http), config());
        let request = PresignRequest {
            tenant_id: "t1".to_string(),
            farm_id: "f1".to_string(),
            barn_id: "b1".to_string(),
            device_id: "d1".to_string(),
            session_id: "sess-1".to_string(),
            content_type: "image/jpeg".to_string(),
            content_length: 10,
        };

        let presign = uploader.request_presign(&request, "trace-1").await.unwrap();
        assert_eq!(presign.object_key(), "t1/sess-1/a.jpg");
    }

    #[tokio::test]
    async fn test_upload_image_rejects_other_success_codes() {
        let mut http = MockHttpTransport::new();
        http.expect_put_bytes().times(1).returning(|_, _, _| {
            Ok(HttpResponse {
                status: 204,
                body: Vec::new(),
            })
        });

        let uploader = PresignedMediaUploader::new(Arc::new(http), config());
        let presign: PresignResponse = serde_json::from_value(presign_ok()).unwrap();

        assert!(!uploader.upload_image(&[1, 2], &presign, "image/jpeg").await);
    }

    #[tokio::test]
    async fn test_invalid_complete_response_fails_upload() {
        let mut http = MockHttpTransport::new();
        http.expect_post_json()
            .withf(|url, _, _| url.ends_with("/presign"))
            .returning(|_, _, _| json_response(200, presign_ok()));
        http.expect_put_bytes().returning(|_, _, _| {
            Ok(HttpResponse {
                status: 200,
                body: Vec::new(),
            })
        });
        http.expect_post_json()
            .withf(|url, _, _| url.ends_with("/complete"))
            .times(3)
            .returning(|_, _, _| json_response(200, json!({"object_key": "t1/sess-1/a.jpg"})));

        let uploader = PresignedMediaUploader::new(Arc::new(http), config());
        let result = uploader.upload(&ctx(), vec![9], "image/png").await;

        assert!(result.is_err());
    }

    #[test]
    fn test_redact_query() {
        assert_eq!(redact_query("https://s3/a.jpg?sig=secret"), "https://s3/a.jpg");
        assert_eq!(redact_query("https://s3/a.jpg"), "https://s3/a.jpg");
    }
}
