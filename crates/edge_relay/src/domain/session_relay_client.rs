use crate::domain::RetryPolicy;
use crate::http::HttpTransport;
use async_trait::async_trait;
use common::domain::{
    BindMediaRequest, BindWeightRequest, CreateSessionRequest, DomainError, FinalizeSessionRequest,
    SessionRelay,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";
/// Relay calls that may wait for the background worker
pub const RELAY_QUEUE_CAPACITY: usize = 256;
const SESSIONS_PATH: &str = "/api/v1/weighvision/sessions";

#[derive(Debug, Clone)]
pub struct SessionRelayConfig {
    pub session_api_url: String,
    pub retry: RetryPolicy,
}

/// REST projection of session state.
///
/// Every call sends its causing `event_id` both in the body and as the
/// `Idempotency-Key` header. A 409 means the server already applied it.
pub struct HttpSessionRelayClient {
    http: Arc<dyn HttpTransport>,
    base_url: String,
    retry: RetryPolicy,
}

impl HttpSessionRelayClient {
    pub fn new(http: Arc<dyn HttpTransport>, config: SessionRelayConfig) -> Self {
        Self {
            http,
            base_url: config.session_api_url.trim_end_matches('/').to_string(),
            retry: config.retry,
        }
    }

    async fn post<T: Serialize>(
        &self,
        operation: &str,
        path: &str,
        event_id: &str,
        request: &T,
    ) -> bool {
        let url = format!("{}{}", self.base_url, path);
        let body = match serde_json::to_value(request) {
            Ok(body) => body,
            Err(e) => {
                warn!(operation = %operation, error = %e, "failed to encode relay request");
                return false;
            }
        };
        let mut headers = BTreeMap::new();
        headers.insert(IDEMPOTENCY_KEY_HEADER.to_string(), event_id.to_string());

        let result = self
            .retry
            .run(operation, |_| async {
                let response = self.http.post_json(&url, &body, &headers).await?;
                match response.status {
                    200 | 201 | 204 | 409 => Ok(response.status),
                    status => Err(DomainError::HttpStatus {
                        status,
                        url: url.clone(),
                    }),
                }
            })
            .await;

        match result {
            Ok(status) => {
                debug!(operation = %operation, status, "session relay call accepted");
                true
            }
            Err(e) => {
                warn!(
                    operation = %operation,
                    event_id = %event_id,
                    error = %e,
                    "session relay call failed"
                );
                false
            }
        }
    }
}

#[async_trait]
impl SessionRelay for HttpSessionRelayClient {
    #[instrument(skip_all, fields(session_id = %request.session_id))]
    async fn create_session(&self, request: &CreateSessionRequest) -> bool {
        self.post("create", SESSIONS_PATH, &request.event_id, request)
            .await
    }

    #[instrument(skip_all, fields(session_id = %request.session_id))]
    async fn bind_weight(&self, request: &BindWeightRequest) -> bool {
        let path = format!("{}/{}/bind-weight", SESSIONS_PATH, request.session_id);
        self.post("bind-weight", &path, &request.event_id, request)
            .await
    }

    #[instrument(skip_all, fields(session_id = %request.session_id, media_id = %request.media_id))]
    async fn bind_media(&self, request: &BindMediaRequest) -> bool {
        let path = format!("{}/{}/bind-media", SESSIONS_PATH, request.session_id);
        self.post("bind-media", &path, &request.event_id, request)
            .await
    }

    #[instrument(skip_all, fields(session_id = %request.session_id))]
    async fn finalize_session(&self, request: &FinalizeSessionRequest) -> bool {
        let path = format!("{}/{}/finalize", SESSIONS_PATH, request.session_id);
        self.post("finalize", &path, &request.event_id, request)
            .await
    }
}

#[derive(Debug, Clone, PartialEq)]
enum RelayCall {
    Create(CreateSessionRequest),
    BindWeight(BindWeightRequest),
    BindMedia(BindMediaRequest),
    Finalize(FinalizeSessionRequest),
}

/// `SessionRelay` that queues calls for a background worker, so slow REST
/// calls never hold up event emission. Calls run one at a time in the order
/// they were made. A `true` result means the call was queued; when the
/// queue is full the call is dropped, since the REST projection is best
/// effort and MQTT stays the source of truth.
#[derive(Clone)]
pub struct BackgroundSessionRelay {
    tx: mpsc::Sender<RelayCall>,
}

/// Worker half of `BackgroundSessionRelay`
pub struct SessionRelayWorker {
    rx: mpsc::Receiver<RelayCall>,
    inner: Arc<dyn SessionRelay>,
}

impl BackgroundSessionRelay {
    pub fn new(inner: Arc<dyn SessionRelay>, capacity: usize) -> (Self, SessionRelayWorker) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, SessionRelayWorker { rx, inner })
    }

    fn enqueue(&self, call: RelayCall) -> bool {
        match self.tx.try_send(call) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(call)) => {
                warn!(call = ?call, "session relay queue full, dropping call");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("session relay worker stopped, dropping call");
                false
            }
        }
    }
}

#[async_trait]
impl SessionRelay for BackgroundSessionRelay {
    async fn create_session(&self, request: &CreateSessionRequest) -> bool {
        self.enqueue(RelayCall::Create(request.clone()))
    }

    async fn bind_weight(&self, request: &BindWeightRequest) -> bool {
        self.enqueue(RelayCall::BindWeight(request.clone()))
    }

    async fn bind_media(&self, request: &BindMediaRequest) -> bool {
        self.enqueue(RelayCall::BindMedia(request.clone()))
    }

    async fn finalize_session(&self, request: &FinalizeSessionRequest) -> bool {
        self.enqueue(RelayCall::Finalize(request.clone()))
    }
}

impl SessionRelayWorker {
    /// Drain queued calls until cancelled or every sender is gone
    pub async fn run(mut self, ctx: CancellationToken) -> anyhow::Result<()> {
        info!("session relay worker started");
        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                call = self.rx.recv() => match call {
                    Some(call) => self.dispatch(call).await,
                    None => break,
                }
            }
        }
        info!("session relay worker stopped");
        Ok(())
    }

    async fn dispatch(&self, call: RelayCall) {
        match call {
            RelayCall::Create(request) => {
                self.inner.create_session(&request).await;
            }
            RelayCall::BindWeight(request) => {
                self.inner.bind_weight(&request).await;
            }
            RelayCall::BindMedia(request) => {
                self.inner.bind_media(&request).await;
            }
            RelayCall::Finalize(request) => {
                self.inner.finalize_session(&request).await;
            }
        }
    }
}
