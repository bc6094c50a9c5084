use anyhow::Context;
use chrono::{DateTime, Utc};
use common::domain::{DomainError, DomainResult, EventEnvelope, Qos};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// One undelivered event, stored as a single JSON line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferedEvent {
    pub topic: String,
    /// Encoded envelope
    pub payload: String,
    pub qos: u8,
    pub retain: bool,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct EventBufferConfig {
    pub path: PathBuf,
    /// Replay rate limit in events per second, `0` disables the limit
    pub replay_throttle: f64,
    /// Upper bound of the random delay before each replayed publish
    pub replay_backoff_ms: u64,
}

impl Default for EventBufferConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/weighvision/buffer/events.jsonl"),
            replay_throttle: 10.0,
            replay_backoff_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// Nothing was buffered
    Empty,
    /// The log was worked off and compacted. Corrupt lines and events the
    /// broker refused for good were moved to the quarantine file.
    Completed { published: usize, quarantined: usize },
    /// A publish failed with a retryable error; the log was left untouched
    Interrupted { published: usize, remaining: usize },
    /// Another replay is in progress
    AlreadyRunning,
}

/// Append-only JSONL log of events that could not be published.
///
/// All file mutation goes through `write_lock`, so appends from the processing
/// loop never interleave with the compaction done at the end of a replay.
/// Replays themselves are single-flight. Lines that cannot be replayed are
/// kept in a `.corrupt` file next to the log rather than dropped.
#[derive(Debug)]
pub struct OfflineEventBuffer {
    config: EventBufferConfig,
    write_lock: Mutex<()>,
    replay_gate: Mutex<()>,
}

impl OfflineEventBuffer {
    pub fn new(config: EventBufferConfig) -> Self {
        Self {
            config,
            write_lock: Mutex::new(()),
            replay_gate: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Append one event. Durable once this returns.
    pub async fn add(
        &self,
        topic: &str,
        envelope: &EventEnvelope,
        qos: Qos,
        retain: bool,
    ) -> DomainResult<()> {
        self.add_if(topic, envelope, qos, retain, || true).await?;
        Ok(())
    }

    /// Append one event if `guard` returns true. `guard` runs under the write
    /// lock, so it is ordered against `mark_drained`. Returns whether the
    /// event was appended.
    #[instrument(skip_all, fields(topic = %topic, event_id = %envelope.event_id))]
    pub async fn add_if<G: FnOnce() -> bool>(
        &self,
        topic: &str,
        envelope: &EventEnvelope,
        qos: Qos,
        retain: bool,
        guard: G,
    ) -> DomainResult<bool> {
        let event = BufferedEvent {
            topic: topic.to_string(),
            payload: serde_json::to_string(envelope)?,
            qos: qos.as_u8(),
            retain,
            ts: envelope.ts,
        };
        let mut line = serde_json::to_string(&event)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if !guard() {
            return Ok(false);
        }
        self.append_line(&line).await.map_err(DomainError::Storage)?;

        debug!("event buffered");
        Ok(true)
    }

    /// Sidecar receiving lines that can never be replayed
    pub fn quarantine_path(&self) -> PathBuf {
        let mut path = self.config.path.clone().into_os_string();
        path.push(".corrupt");
        PathBuf::from(path)
    }

    /// Number of buffered lines
    pub async fn size(&self) -> DomainResult<usize> {
        let _guard = self.write_lock.lock().await;
        self.count_lines().await
    }

    /// Run `on_drained` only if the buffer is empty, atomically with respect
    /// to appends. Returns whether it ran.
    pub async fn mark_drained<F: FnOnce()>(&self, on_drained: F) -> DomainResult<bool> {
        let _guard = self.write_lock.lock().await;
        if self.count_lines().await? > 0 {
            return Ok(false);
        }
        on_drained();
        Ok(true)
    }

    /// Publish every buffered event in timestamp order through `publish`.
    ///
    /// Each publish waits out the throttle interval plus a random jitter.
    /// The first retryable failure stops the replay with the log left intact.
    /// Events rejected with a permanent error are quarantined and the replay
    /// moves on. After a full pass the replayed lines are removed; lines
    /// appended meanwhile are kept for the next replay.
    #[instrument(skip_all, fields(path = %self.config.path.display()))]
    pub async fn replay<F, Fut>(&self, mut publish: F) -> DomainResult<ReplayOutcome>
    where
        F: FnMut(BufferedEvent) -> Fut,
        Fut: Future<Output = DomainResult<()>>,
    {
        let Ok(_gate) = self.replay_gate.try_lock() else {
            debug!("replay already in progress");
            return Ok(ReplayOutcome::AlreadyRunning);
        };

        let snapshot = {
            let _guard = self.write_lock.lock().await;
            self.read_snapshot().await?
        };
        let snapshot_len = snapshot.len() as u64;

        let (mut events, mut rejected) = parse_lines(&snapshot);
        if events.is_empty() && rejected.is_empty() {
            if snapshot_len > 0 {
                self.compact(snapshot_len).await?;
            }
            return Ok(ReplayOutcome::Empty);
        }
        events.sort_by_key(|event| event.ts);

        let total = events.len();
        info!(events = total, corrupt = rejected.len(), "replaying buffered events");

        let min_interval = throttle_interval(self.config.replay_throttle);
        let mut last_publish: Option<Instant> = None;
        let mut published = 0;

        for (attempted, event) in events.into_iter().enumerate() {
            if let (Some(interval), Some(last)) = (min_interval, last_publish) {
                let elapsed = last.elapsed();
                if elapsed < interval {
                    tokio::time::sleep(interval - elapsed).await;
                }
            }

            let jitter_ms = rand::thread_rng().gen_range(0..=self.config.replay_backoff_ms);
            if jitter_ms > 0 {
                tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
            }

            last_publish = Some(Instant::now());
            let line = serde_json::to_vec(&event)?;
            let topic = event.topic.clone();
            match publish(event).await {
                Ok(()) => published += 1,
                Err(e) if e.is_retryable() => {
                    warn!(
                        topic = %topic,
                        published,
                        remaining = total - attempted,
                        error = %e,
                        "replay interrupted, keeping buffer"
                    );
                    return Ok(ReplayOutcome::Interrupted {
                        published,
                        remaining: total - attempted,
                    });
                }
                Err(e) => {
                    warn!(topic = %topic, error = %e, "event rejected, quarantining");
                    rejected.push(line);
                }
            }
        }

        let quarantined = rejected.len();
        if quarantined > 0 {
            self.quarantine(&rejected).await?;
        }
        self.compact(snapshot_len).await?;
        info!(published, quarantined, "buffer replay complete");
        Ok(ReplayOutcome::Completed {
            published,
            quarantined,
        })
    }

    async fn append_line(&self, line: &str) -> anyhow::Result<()> {
        let path = &self.config.path;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;

        // A crash mid-append leaves a line without its newline.
        if file.metadata().await?.len() > 0 {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::End(-1)).await?;
            file.read_exact(&mut last).await?;
            if last[0] != b'\n' {
                warn!(path = %path.display(), "sealing torn buffer line");
                file.write_all(b"\n").await?;
            }
        }

        file.write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed to append to {}", path.display()))?;
        file.flush().await?;
        file.sync_data()
            .await
            .with_context(|| format!("failed to sync {}", path.display()))?;
        Ok(())
    }

    async fn quarantine(&self, lines: &[Vec<u8>]) -> DomainResult<()> {
        let path = self.quarantine_path();
        let result: anyhow::Result<()> = async {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
                .with_context(|| format!("failed to open {}", path.display()))?;
            for line in lines {
                file.write_all(line).await?;
                file.write_all(b"\n").await?;
            }
            file.flush().await?;
            file.sync_data()
                .await
                .with_context(|| format!("failed to sync {}", path.display()))?;
            Ok(())
        }
        .await;
        result.map_err(DomainError::Storage)?;

        warn!(path = %path.display(), lines = lines.len(), "buffer lines quarantined");
        Ok(())
    }

    async fn read_snapshot(&self) -> DomainResult<Vec<u8>> {
        match fs::read(&self.config.path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(DomainError::Storage(anyhow::Error::new(e).context(format!(
                "failed to read {}",
                self.config.path.display()
            )))),
        }
    }

    async fn count_lines(&self) -> DomainResult<usize> {
        let bytes = self.read_snapshot().await?;
        Ok(bytes
            .split(|b| *b == b'\n')
            .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
            .count())
    }

    /// Drop the first `replayed_len` bytes of the log
    async fn compact(&self, replayed_len: u64) -> DomainResult<()> {
        let _guard = self.write_lock.lock().await;
        let current = self.read_snapshot().await?;
        let path = &self.config.path;

        let result: anyhow::Result<()> = async {
            if current.len() as u64 <= replayed_len {
                if !current.is_empty() {
                    fs::remove_file(path)
                        .await
                        .with_context(|| format!("failed to remove {}", path.display()))?;
                }
                return Ok(());
            }

            let tail = &current[replayed_len as usize..];
            let tmp = path.with_extension("jsonl.tmp");
            let mut file = fs::File::create(&tmp)
                .await
                .with_context(|| format!("failed to create {}", tmp.display()))?;
            file.write_all(tail).await?;
            file.flush().await?;
            file.sync_data().await?;
            fs::rename(&tmp, path)
                .await
                .with_context(|| format!("failed to replace {}", path.display()))?;
            debug!(kept_bytes = tail.len(), "kept events appended during replay");
            Ok(())
        }
        .await;

        result.map_err(DomainError::Storage)
    }
}

fn throttle_interval(events_per_sec: f64) -> Option<Duration> {
    if events_per_sec.is_finite() && events_per_sec > 0.0 {
        Some(Duration::from_secs_f64(1.0 / events_per_sec))
    } else {
        None
    }
}

/// Split the log into decodable events and raw corrupt lines
fn parse_lines(bytes: &[u8]) -> (Vec<BufferedEvent>, Vec<Vec<u8>>) {
    let mut events = Vec::new();
    let mut corrupt = Vec::new();
    for (index, line) in bytes.split(|b| *b == b'\n').enumerate() {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice(line) {
            Ok(event) => events.push(event),
            Err(e) => {
                warn!(line = index + 1, error = %e, "corrupt buffer line");
                corrupt.push(line.to_vec());
            }
        }
    }
    (events, corrupt)
}
