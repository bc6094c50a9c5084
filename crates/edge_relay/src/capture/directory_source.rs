use crate::domain::stable_mean;
use crate::mqtt::validate_topic_segment;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::domain::{
    content_type_for, CaptureMedia, CaptureRecord, CaptureSource, DomainError, DomainResult,
    MediaSource, ProcessedMarkerStore,
};
use serde::Deserialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

const METADATA_EXTENSION: &str = "json";
const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Debug, Clone)]
pub struct DirectoryPollConfig {
    pub capture_dir: PathBuf,
    pub poll_interval: Duration,
    /// Spread allowed across `weight_readings` for a weight to be recorded
    pub stability_threshold_kg: f64,
}

/// Metadata file written by the capture station next to its images
#[derive(Debug, Deserialize)]
struct CaptureMetadata {
    capture_id: Option<String>,
    session_id: Option<String>,
    batch_id: Option<String>,
    captured_at: Option<DateTime<Utc>>,
    weight_kg: Option<f64>,
    #[serde(default)]
    weight_readings: Vec<f64>,
    images: Option<Vec<String>>,
}

/// Polls a capture directory for `*.json` metadata files.
///
/// Every scan yields every unprocessed capture in file name order, so a
/// capture left unmarked is picked up again on the next scan. With a marker
/// store attached, metadata files of processed captures are remembered and
/// not read again.
pub struct DirectoryCaptureSource {
    config: DirectoryPollConfig,
    markers: Option<Arc<dyn ProcessedMarkerStore>>,
    /// capture id of every metadata file parsed so far
    capture_ids: HashMap<PathBuf, String>,
    /// metadata files whose capture is marked processed
    settled: HashSet<PathBuf>,
    pending: VecDeque<CaptureRecord>,
    scanned: bool,
}

impl DirectoryCaptureSource {
    pub fn new(config: DirectoryPollConfig) -> Self {
        Self {
            config,
            markers: None,
            capture_ids: HashMap::new(),
            settled: HashSet::new(),
            pending: VecDeque::new(),
            scanned: false,
        }
    }

    /// Skip metadata of captures already marked in `markers`
    pub fn with_markers(mut self, markers: Arc<dyn ProcessedMarkerStore>) -> Self {
        self.markers = Some(markers);
        self
    }

    /// One pass over the capture directory. Malformed metadata is skipped.
    #[instrument(skip(self), fields(capture_dir = %self.config.capture_dir.display()))]
    pub async fn scan(&mut self) -> DomainResult<Vec<CaptureRecord>> {
        let mut entries = match tokio::fs::read_dir(&self.config.capture_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("capture directory does not exist yet");
                return Ok(Vec::new());
            }
            Err(e) => return Err(DomainError::Storage(e.into())),
        };

        let mut metadata_files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| DomainError::Storage(e.into()))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some(METADATA_EXTENSION) {
                metadata_files.push(path);
            }
        }
        metadata_files.sort();

        let mut records = Vec::with_capacity(metadata_files.len());
        for path in metadata_files {
            if self.settled.contains(&path) {
                continue;
            }
            let known_id = self
                .capture_ids
                .get(&path)
                .cloned()
                .or_else(|| file_stem(&path).map(str::to_string));
            if let Some(capture_id) = &known_id {
                if self.is_processed(capture_id).await? {
                    self.settled.insert(path);
                    continue;
                }
            }

            match self.load_record(&path).await {
                Ok(record) => {
                    self.capture_ids
                        .insert(path.clone(), record.capture_id.clone());
                    let checked = known_id.as_deref() == Some(record.capture_id.as_str());
                    if !checked && self.is_processed(&record.capture_id).await? {
                        self.settled.insert(path);
                    } else {
                        records.push(record);
                    }
                }
                Err(e) => warn!(path = %path.display(), error = %e, "skipping capture metadata"),
            }
        }
        debug!(
            captures = records.len(),
            settled = self.settled.len(),
            "capture directory scanned"
        );
        Ok(records)
    }

    async fn is_processed(&self, capture_id: &str) -> DomainResult<bool> {
        match &self.markers {
            Some(markers) => markers.is_processed(capture_id).await,
            None => Ok(false),
        }
    }

    async fn load_record(&self, path: &Path) -> DomainResult<CaptureRecord> {
        let raw = tokio::fs::read(path)
            .await
            .map_err(|e| DomainError::Storage(e.into()))?;
        let metadata: CaptureMetadata = serde_json::from_slice(&raw).map_err(|e| {
            DomainError::ValidationError(format!("malformed capture metadata: {}", e))
        })?;

        let stem = file_stem(path)
            .ok_or_else(|| DomainError::ValidationError("metadata file has no name".to_string()))?;
        if let Some(session_id) = &metadata.session_id {
            validate_topic_segment("session_id", session_id)?;
        }

        let captured_at = match metadata.captured_at {
            Some(ts) => ts,
            None => modified_at(path).await?,
        };

        let weight_kg = match metadata.weight_kg {
            Some(weight) => Some(weight),
            None if !metadata.weight_readings.is_empty() => {
                stable_mean(&metadata.weight_readings, self.config.stability_threshold_kg)
            }
            None => None,
        };

        let media = match metadata.images {
            Some(names) => names
                .into_iter()
                .filter_map(|name| self.media_entry(name))
                .collect(),
            None => self.media_for_stem(stem).await,
        };

        Ok(CaptureRecord {
            capture_id: metadata.capture_id.unwrap_or_else(|| stem.to_string()),
            session_id: metadata.session_id,
            batch_id: metadata.batch_id,
            captured_at,
            weight_kg,
            media,
        })
    }

    fn media_entry(&self, name: String) -> Option<CaptureMedia> {
        let Some(content_type) = content_type_for(&name) else {
            warn!(media = %name, "unsupported media type, skipping");
            return None;
        };
        Some(CaptureMedia {
            source: MediaSource::File(self.config.capture_dir.join(&name)),
            content_type: content_type.to_string(),
            name,
        })
    }

    async fn media_for_stem(&self, stem: &str) -> Vec<CaptureMedia> {
        let mut media = Vec::new();
        for ext in IMAGE_EXTENSIONS {
            let name = format!("{}.{}", stem, ext);
            if tokio::fs::metadata(self.config.capture_dir.join(&name))
                .await
                .is_ok()
            {
                media.extend(self.media_entry(name));
            }
        }
        media
    }
}

fn file_stem(path: &Path) -> Option<&str> {
    path.file_stem().and_then(|stem| stem.to_str())
}

async fn modified_at(path: &Path) -> DomainResult<DateTime<Utc>> {
    let modified = tokio::fs::metadata(path)
        .await
        .and_then(|meta| meta.modified())
        .map_err(|e| DomainError::Storage(e.into()))?;
    Ok(DateTime::<Utc>::from(modified))
}

#[async_trait]
impl CaptureSource for DirectoryCaptureSource {
    async fn next_capture(&mut self) -> DomainResult<Option<CaptureRecord>> {
        loop {
            if let Some(record) = self.pending.pop_front() {
                return Ok(Some(record));
            }
            if self.scanned {
                tokio::time::sleep(self.config.poll_interval).await;
            }
            self.scanned = true;
            self.pending = self.scan().await?.into();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use common::domain::MockProcessedMarkerStore;
    use tempfile::TempDir;

    fn source(dir: &TempDir) -> DirectoryCaptureSource {
        DirectoryCaptureSource::new(DirectoryPollConfig {
            capture_dir: dir.path().to_path_buf(),
            poll_interval: Duration::from_millis(10),
            stability_threshold_kg: 0.5,
        })
    }

    fn write(dir: &TempDir, name: &str, contents: &[u8]) {
        std::fs::write(dir.path().join(name), contents).unwrap();
    }

    #[tokio::test]
    async fn test_scan_reads_metadata_and_listed_images() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "cap_001.json",
            br#"{"capture_id":"c-1","batch_id":"b-9","captured_at":"2025-03-01T08:00:00Z",
                 "weight_kg":120.5,"images":["left.jpg","right.png","notes.txt"]}"#,
        );

        let records = source(&dir).scan().await.unwrap();

        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.capture_id, "c-1");
        assert_eq!(record.batch_id.as_deref(), Some("b-9"));
        assert_eq!(
            record.captured_at,
            Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap()
        );
        assert_eq!(record.weight_kg, Some(120.5));
        let names: Vec<&str> = record.media.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["left.jpg", "right.png"]);
        assert_eq!(
            record.media[0].source,
            MediaSource::File(dir.path().join("left.jpg"))
        );
    }

    #[tokio::test]
    async fn test_stem_images_and_defaults() {
        let dir = TempDir::new().unwrap();
        write(&dir, "cap_002.json", b"{}");
        write(&dir, "cap_002.jpg", &[0xFF, 0xD8]);
        write(&dir, "cap_003.png", &[0x89]);

        let records = source(&dir).scan().await.unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].capture_id, "cap_002");
        assert_eq!(records[0].weight_kg, None);
        assert_eq!(records[0].media.len(), 1);
        assert_eq!(records[0].media[0].content_type, "image/jpeg");
    }

    #[tokio::test]
    async fn test_weight_readings_must_be_stable() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a.json", br#"{"weight_readings":[120.0,120.2,120.1]}"#);
        write(&dir, "b.json", br#"{"weight_readings":[120.0,121.5]}"#);

        let records = source(&dir).scan().await.unwrap();

        assert!((records[0].weight_kg.unwrap() - 120.1).abs() < 1e-9);
        assert_eq!(records[1].weight_kg, None);
    }

    #[tokio::test]
    async fn test_malformed_metadata_is_skipped() {
        let dir = TempDir::new().unwrap();
        write(&dir, "bad.json", b"{not json");
        write(&dir, "good.json", br#"{"capture_id":"ok"}"#);

        let records = source(&dir).scan().await.unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].capture_id, "ok");
    }

    #[tokio::test]
    async fn test_wildcard_session_id_is_skipped() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a.json", br#"{"capture_id":"c-1","session_id":"lot+7"}"#);
        write(&dir, "b.json", br#"{"capture_id":"c-2","session_id":"pen/4"}"#);
        write(&dir, "c.json", br#"{"capture_id":"c-3","session_id":"lot-7"}"#);

        let records = source(&dir).scan().await.unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].session_id.as_deref(), Some("lot-7"));
    }

    #[tokio::test]
    async fn test_processed_captures_are_not_reread() {
        let dir = TempDir::new().unwrap();
        write(&dir, "cap_1.json", br#"{"capture_id":"renamed-1"}"#);
        write(&dir, "cap_2.json", b"{}");

        let mut markers = MockProcessedMarkerStore::new();
        // cap_1: stem lookup, then the id from its metadata
        markers
            .expect_is_processed()
            .withf(|id| id == "cap_1")
            .times(1)
            .returning(|_| Ok(false));
        markers
            .expect_is_processed()
            .withf(|id| id == "renamed-1")
            .times(1)
            .returning(|_| Ok(true));
        markers
            .expect_is_processed()
            .withf(|id| id == "cap_2")
            .times(2)
            .returning(|_| Ok(false));
        let mut source = source(&dir).with_markers(Arc::new(markers));

        let first = source.scan().await.unwrap();
        std::fs::write(dir.path().join("cap_1.json"), b"{not json any more").unwrap();
        let second = source.scan().await.unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(first[0].capture_id, "cap_2");
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].capture_id, "cap_2");
    }

    #[tokio::test]
    async fn test_missing_directory_is_empty() {
        let dir = TempDir::new().unwrap();
        let mut source = DirectoryCaptureSource::new(DirectoryPollConfig {
            capture_dir: dir.path().join("not-yet"),
            poll_interval: Duration::from_millis(10),
            stability_threshold_kg: 0.5,
        });

        assert!(source.scan().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_next_capture_rescans_after_interval() {
        let dir = TempDir::new().unwrap();
        write(&dir, "first.json", b"{}");
        let mut source = source(&dir);

        let first = source.next_capture().await.unwrap().unwrap();
        assert_eq!(first.capture_id, "first");

        write(&dir, "second.json", b"{}");
        let again = source.next_capture().await.unwrap().unwrap();
        let next = source.next_capture().await.unwrap().unwrap();

        assert_eq!(again.capture_id, "first");
        assert_eq!(next.capture_id, "second");
    }
}
