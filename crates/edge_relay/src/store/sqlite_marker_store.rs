use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::domain::{DomainError, DomainResult, ProcessedMarkerStore};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS processed_captures (
    capture_id   TEXT PRIMARY KEY,
    processed_at TEXT NOT NULL
);
";

/// Processed markers in a local SQLite database
#[derive(Clone)]
pub struct SqliteProcessedMarkerStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteProcessedMarkerStore {
    pub fn open(path: &Path) -> DomainResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))
                .map_err(DomainError::Storage)?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open marker database {}", path.display()))
            .map_err(DomainError::Storage)?;
        info!(path = %path.display(), "opened processed marker store");
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> DomainResult<Self> {
        let conn = Connection::open_in_memory()
            .context("failed to open in-memory marker database")
            .map_err(DomainError::Storage)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> DomainResult<Self> {
        conn.execute_batch(SCHEMA)
            .context("failed to create processed_captures table")
            .map_err(DomainError::Storage)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, op: F) -> DomainResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> anyhow::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| anyhow::anyhow!("marker database lock poisoned"))?;
            op(&guard)
        })
        .await
        .map_err(|e| DomainError::Storage(e.into()))?
        .map_err(DomainError::Storage)
    }
}

#[async_trait]
impl ProcessedMarkerStore for SqliteProcessedMarkerStore {
    async fn is_processed(&self, capture_id: &str) -> DomainResult<bool> {
        Ok(self.processed_at(capture_id).await?.is_some())
    }

    async fn processed_at(&self, capture_id: &str) -> DomainResult<Option<DateTime<Utc>>> {
        let capture_id = capture_id.to_string();
        let raw: Option<String> = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT processed_at FROM processed_captures WHERE capture_id = ?1",
                    params![capture_id],
                    |row| row.get(0),
                )
                .optional()
                .context("failed to query processed marker")
            })
            .await?;

        raw.map(|ts| {
            DateTime::parse_from_rfc3339(&ts)
                .map(|ts| ts.with_timezone(&Utc))
                .context("corrupt processed_at timestamp")
                .map_err(DomainError::Storage)
        })
        .transpose()
    }

    async fn mark_processed(
        &self,
        capture_id: &str,
        processed_at: DateTime<Utc>,
    ) -> DomainResult<()> {
        let id = capture_id.to_string();
        let inserted = self
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO processed_captures (capture_id, processed_at) VALUES (?1, ?2)",
                    params![id, processed_at.to_rfc3339()],
                )
                .context("failed to write processed marker")
            })
            .await?;

        debug!(capture_id = %capture_id, inserted = inserted > 0, "processed marker written");
        Ok(())
    }
}
