use common::domain::{
    CaptureRecord, EventEnvelope, EventType, ProcessedMarkerStore, Qos, StationIdentity,
};
use edge_relay::capture::{DirectoryCaptureSource, DirectoryPollConfig};
use edge_relay::domain::{
    CaptureOutcome, EventFactory, MediaUploaderConfig, PresignedMediaUploader, ProcessingLoop,
    RetryPolicy, SessionServices,
};
use edge_relay::store::SqliteProcessedMarkerStore;
use mocks::{CountingRelay, FakeMediaStore, InMemoryMarkers, RecordingPublisher};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

mod mocks {
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use common::domain::{
        BindMediaRequest, BindWeightRequest, CreateSessionRequest, DomainResult, EventEnvelope,
        EventPublisher, FinalizeSessionRequest, ProcessedMarkerStore, PublishOutcome, Qos,
        SessionRelay,
    };
    use edge_relay::http::{HttpResponse, HttpTransport};
    use serde_json::json;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingPublisher {
        events: Mutex<Vec<EventEnvelope>>,
    }

    impl RecordingPublisher {
        pub fn events(&self) -> Vec<EventEnvelope> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventPublisher for RecordingPublisher {
        async fn publish_or_buffer(
            &self,
            _topic: &str,
            envelope: &EventEnvelope,
            _qos: Qos,
            _retain: bool,
        ) -> DomainResult<PublishOutcome> {
            self.events.lock().unwrap().push(envelope.clone());
            Ok(PublishOutcome::Buffered)
        }
    }

    #[derive(Default)]
    pub struct InMemoryMarkers {
        markers: Mutex<HashMap<String, DateTime<Utc>>>,
    }

    #[async_trait]
    impl ProcessedMarkerStore for InMemoryMarkers {
        async fn is_processed(&self, capture_id: &str) -> DomainResult<bool> {
            Ok(self.markers.lock().unwrap().contains_key(capture_id))
        }

        async fn processed_at(&self, capture_id: &str) -> DomainResult<Option<DateTime<Utc>>> {
            Ok(self.markers.lock().unwrap().get(capture_id).copied())
        }

        async fn mark_processed(
            &self,
            capture_id: &str,
            processed_at: DateTime<Utc>,
        ) -> DomainResult<()> {
            self.markers
                .lock()
                .unwrap()
                .entry(capture_id.to_string())
                .or_insert(processed_at);
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct CountingRelay {
        pub calls: AtomicUsize,
    }

    #[async_trait]
    impl SessionRelay for CountingRelay {
        async fn create_session(&self, _request: &CreateSessionRequest) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            true
        }

        async fn bind_weight(&self, _request: &BindWeightRequest) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            true
        }

        async fn bind_media(&self, _request: &BindMediaRequest) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            true
        }

        async fn finalize_session(&self, _request: &FinalizeSessionRequest) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    /// Media store answering presign/complete deterministically from the request
    pub struct FakeMediaStore {
        upload_url: String,
        pub puts: AtomicUsize,
    }

    impl FakeMediaStore {
        pub fn new(upload_url: &str) -> Self {
            Self {
                upload_url: upload_url.to_string(),
                puts: AtomicUsize::new(0),
            }
        }

        fn ok(body: serde_json::Value) -> DomainResult<HttpResponse> {
            Ok(HttpResponse {
                status: 200,
                body: serde_json::to_vec(&body).unwrap(),
            })
        }
    }

    #[async_trait]
    impl HttpTransport for FakeMediaStore {
        async fn post_json(
            &self,
            url: &str,
            body: &serde_json::Value,
            _headers: &BTreeMap<String, String>,
        ) -> DomainResult<HttpResponse> {
            if url.ends_with("/presign") {
                let object_key = format!(
                    "{}/{}.jpg",
                    body["session_id"].as_str().unwrap_or_default(),
                    body["content_length"]
                );
                return Self::ok(json!({
                    "upload_url": self.upload_url,
                    "object_key": object_key,
                    "expires_in": 600,
                }));
            }
            let object_key = body["object_key"].as_str().unwrap_or_default();
            Self::ok(json!({
                "media_id": format!("media:{}", object_key),
                "object_key": object_key,
            }))
        }

        async fn put_bytes(
            &self,
            _url: &str,
            _body: Vec<u8>,
            _headers: &BTreeMap<String, String>,
        ) -> DomainResult<HttpResponse> {
            self.puts.fetch_add(1, Ordering::SeqCst);
            Ok(HttpResponse {
                status: 200,
                body: Vec::new(),
            })
        }
    }
}

struct Pipeline {
    publisher: Arc<RecordingPublisher>,
    media_store: Arc<FakeMediaStore>,
    relay: Arc<CountingRelay>,
    processing_loop: ProcessingLoop,
}

fn identity() -> StationIdentity {
    StationIdentity {
        tenant_id: "t1".to_string(),
        farm_id: "f1".to_string(),
        barn_id: "b1".to_string(),
        station_id: "st1".to_string(),
        device_id: "d1".to_string(),
    }
}

fn poll_config(dir: &TempDir) -> DirectoryPollConfig {
    DirectoryPollConfig {
        capture_dir: dir.path().to_path_buf(),
        poll_interval: Duration::from_millis(10),
        stability_threshold_kg: 0.5,
    }
}

fn pipeline(
    dir: &TempDir,
    markers: Arc<dyn ProcessedMarkerStore>,
    upload_url: &str,
) -> Pipeline {
    let publisher = Arc::new(RecordingPublisher::default());
    let media_store = Arc::new(FakeMediaStore::new(upload_url));
    let relay = Arc::new(CountingRelay::default());
    let uploader = PresignedMediaUploader::new(
        media_store.clone(),
        MediaUploaderConfig {
            media_store_url: "http://media.local".to_string(),
            retry: RetryPolicy::new(2, Duration::ZERO, Duration::ZERO),
        },
    );

    let processing_loop = ProcessingLoop::new(
        Box::new(DirectoryCaptureSource::new(poll_config(dir))),
        markers,
        SessionServices {
            factory: EventFactory::new(identity(), Qos::AtLeastOnce),
            publisher: publisher.clone(),
            uploader: Arc::new(uploader),
            relay: relay.clone(),
        },
    );

    Pipeline {
        publisher,
        media_store,
        relay,
        processing_loop,
    }
}

fn write(dir: &TempDir, name: &str, contents: &[u8]) {
    std::fs::write(dir.path().join(name), contents).unwrap();
}

async fn scan(dir: &TempDir) -> Vec<CaptureRecord> {
    DirectoryCaptureSource::new(poll_config(dir))
        .scan()
        .await
        .unwrap()
}

fn fingerprint(events: &[EventEnvelope]) -> Vec<(EventType, String, String)> {
    events
        .iter()
        .map(|e| (e.event_type, e.event_id.clone(), e.content_hash.clone()))
        .collect()
}

#[tokio::test]
async fn test_reprocessing_after_crash_reproduces_event_ids() {
    let dir = TempDir::new().unwrap();
    write(
        &dir,
        "cap_001.json",
        br#"{"batch_id":"batch-3","captured_at":"2025-03-01T08:00:00Z","weight_kg":120.5}"#,
    );
    write(&dir, "cap_001.jpg", &[0xFF, 0xD8, 0xFF, 0xE0]);
    let record = scan(&dir).await.remove(0);

    let committed = Arc::new(InMemoryMarkers::default());
    let first = pipeline(&dir, committed.clone(), "https://s3.local/put?sig=1");
    first
        .processing_loop
        .process_capture(record.clone())
        .await
        .unwrap();

    // Crash before the marker commit: a fresh marker store sees the capture again
    let second = pipeline(&dir, Arc::new(InMemoryMarkers::default()), "https://s3.local/put?sig=2");
    second
        .processing_loop
        .process_capture(record.clone())
        .await
        .unwrap();

    let first_events = first.publisher.events();
    assert_eq!(first_events.len(), 5);
    assert_eq!(fingerprint(&first_events), fingerprint(&second.publisher.events()));
    assert!(first_events.iter().all(|e| e.trace_id == first_events[0].trace_id));

    let third = pipeline(&dir, committed, "https://s3.local/put?sig=3");
    let outcome = third.processing_loop.process_capture(record).await.unwrap();
    assert_eq!(outcome, CaptureOutcome::AlreadyProcessed);
    assert!(third.publisher.events().is_empty());
}

#[tokio::test]
async fn test_empty_upload_url_emits_no_image_event() {
    let dir = TempDir::new().unwrap();
    write(&dir, "cap_002.json", br#"{"weight_kg":95.0}"#);
    write(&dir, "cap_002.jpg", &[0xFF, 0xD8]);
    let record = scan(&dir).await.remove(0);

    let p = pipeline(&dir, Arc::new(InMemoryMarkers::default()), "");
    let outcome = p.processing_loop.process_capture(record).await.unwrap();

    assert!(matches!(outcome, CaptureOutcome::Processed { images: 0, .. }));
    let events = p.publisher.events();
    assert!(events.iter().all(|e| e.event_type != EventType::ImageCaptured));
    assert_eq!(events.last().unwrap().event_type, EventType::SessionFinalized);
    assert_eq!(events.last().unwrap().payload["image_count"], 0);
    assert_eq!(
        p.media_store.puts.load(std::sync::atomic::Ordering::SeqCst),
        0
    );
}

#[tokio::test]
async fn test_unstable_readings_omit_weight_but_keep_images() {
    let dir = TempDir::new().unwrap();
    write(&dir, "cap_003.json", br#"{"weight_readings":[120.0,121.4,120.2]}"#);
    write(&dir, "cap_003.png", &[0x89, 0x50]);
    let record = scan(&dir).await.remove(0);
    assert_eq!(record.weight_kg, None);

    let p = pipeline(&dir, Arc::new(InMemoryMarkers::default()), "https://s3.local/put");
    p.processing_loop.process_capture(record).await.unwrap();

    let types: Vec<EventType> = p.publisher.events().iter().map(|e| e.event_type).collect();
    assert_eq!(
        types,
        vec![
            EventType::SessionCreated,
            EventType::ImageCaptured,
            EventType::SessionFinalized,
        ]
    );
    let finalized = p.publisher.events().pop().unwrap();
    assert!(finalized.payload["final_weight_kg"].is_null());
}

#[tokio::test]
async fn test_markers_survive_restart() {
    let dir = TempDir::new().unwrap();
    let state = TempDir::new().unwrap();
    let db_path = state.path().join("markers.db");
    write(&dir, "a.json", br#"{"weight_kg":100.0}"#);
    write(&dir, "b.json", br#"{"weight_kg":101.0}"#);

    {
        let markers = Arc::new(SqliteProcessedMarkerStore::open(&db_path).unwrap());
        let p = pipeline(&dir, markers, "https://s3.local/put");
        for record in scan(&dir).await {
            let outcome = p.processing_loop.process_capture(record).await.unwrap();
            assert!(matches!(outcome, CaptureOutcome::Processed { .. }));
        }
        // create + bind-weight + finalize per capture
        assert_eq!(p.relay.calls.load(std::sync::atomic::Ordering::SeqCst), 6);
    }

    let markers = Arc::new(SqliteProcessedMarkerStore::open(&db_path).unwrap());
    assert!(markers.is_processed("a").await.unwrap());
    let p = pipeline(&dir, markers, "https://s3.local/put");
    for record in scan(&dir).await {
        let outcome = p.processing_loop.process_capture(record).await.unwrap();
        assert_eq!(outcome, CaptureOutcome::AlreadyProcessed);
    }
    assert!(p.publisher.events().is_empty());
}

#[tokio::test]
async fn test_marker_aware_scan_skips_processed_captures() {
    let dir = TempDir::new().unwrap();
    let state = TempDir::new().unwrap();
    write(&dir, "a.json", br#"{"weight_kg":100.0}"#);
    write(&dir, "b.json", br#"{"weight_kg":101.0}"#);
    let markers: Arc<dyn ProcessedMarkerStore> =
        Arc::new(SqliteProcessedMarkerStore::open(&state.path().join("markers.db")).unwrap());
    markers
        .mark_processed("a", chrono::Utc::now())
        .await
        .unwrap();

    let mut source = DirectoryCaptureSource::new(poll_config(&dir)).with_markers(markers);
    let ids: Vec<String> = source
        .scan()
        .await
        .unwrap()
        .into_iter()
        .map(|record| record.capture_id)
        .collect();

    assert_eq!(ids, vec!["b".to_string()]);
}
