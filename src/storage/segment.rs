//! # Segments
//!
//! A segment is one SQLite database file in the data directory plus a JSON
//! marker recording its lifecycle state:
//!
//! ```text
//! active ──► sealed ──► archived ──► reclaimed
//! ```
//!
//! The marker is the only source of truth used on restart; it is always
//! written to a temporary file and renamed into place.

use crate::error::{Result, TurboError};
use crate::models::Batch;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};
use uuid::Uuid;

const DB_EXTENSION: &str = "db";
const MARKER_SUFFIX: &str = ".marker.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentState {
    /// Receiving appends
    Active,
    /// Immutable, waiting for archival upload
    Sealed,
    /// Upload confirmed, local file still present
    Archived,
    /// Local file deleted
    Reclaimed,
}

impl SegmentState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Reclaimed)
    }

    /// Only single forward steps are allowed
    pub fn can_transition_to(&self, next: SegmentState) -> bool {
        matches!(
            (self, next),
            (Self::Active, Self::Sealed) | (Self::Sealed, Self::Archived) | (Self::Archived, Self::Reclaimed)
        )
    }
}

impl fmt::Display for SegmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Sealed => write!(f, "sealed"),
            Self::Archived => write!(f, "archived"),
            Self::Reclaimed => write!(f, "reclaimed"),
        }
    }
}

impl std::str::FromStr for SegmentState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "sealed" => Ok(Self::Sealed),
            "archived" => Ok(Self::Archived),
            "reclaimed" => Ok(Self::Reclaimed),
            _ => Err(format!("Invalid segment state: {s}")),
        }
    }
}

/// Sortable segment identifier: `seg-<unix millis>-<random>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentId(String);

impl SegmentId {
    pub fn generate() -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!(
            "seg-{:013}-{}",
            Utc::now().timestamp_millis(),
            &suffix[..8]
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn db_path(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(format!("{}.{DB_EXTENSION}", self.0))
    }

    pub fn marker_path(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(format!("{}{MARKER_SUFFIX}", self.0))
    }

    /// SQLite sidecar files that must go with the database
    pub fn sidecar_paths(&self, data_dir: &Path) -> [PathBuf; 2] {
        [
            data_dir.join(format!("{}.{DB_EXTENSION}-wal", self.0)),
            data_dir.join(format!("{}.{DB_EXTENSION}-shm", self.0)),
        ]
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SegmentId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Persisted lifecycle record for one segment, including archival retry
/// state so upload backoff survives restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentMarker {
    pub segment_id: SegmentId,
    pub state: SegmentState,
    pub created_at: DateTime<Utc>,
    pub sealed_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
    pub reclaimed_at: Option<DateTime<Utc>>,
    pub size_bytes: Option<u64>,
    pub record_count: Option<u64>,
    pub archive_key: Option<String>,
    #[serde(default)]
    pub upload_attempts: u32,
    pub next_upload_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl SegmentMarker {
    pub fn new_active(segment_id: SegmentId) -> Self {
        Self {
            segment_id,
            state: SegmentState::Active,
            created_at: Utc::now(),
            sealed_at: None,
            archived_at: None,
            reclaimed_at: None,
            size_bytes: None,
            record_count: None,
            archive_key: None,
            upload_attempts: 0,
            next_upload_at: None,
            last_error: None,
        }
    }

    /// Move to `next`, stamping the matching timestamp
    pub fn transition(&mut self, next: SegmentState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(TurboError::InvalidTransition {
                segment_id: self.segment_id.to_string(),
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        let now = Utc::now();
        match next {
            SegmentState::Sealed => self.sealed_at = Some(now),
            SegmentState::Archived => {
                self.archived_at = Some(now);
                self.next_upload_at = None;
                self.last_error = None;
            }
            SegmentState::Reclaimed => self.reclaimed_at = Some(now),
            SegmentState::Active => {}
        }
        self.state = next;
        Ok(())
    }

    pub fn upload_due(&self, now: DateTime<Utc>) -> bool {
        self.state == SegmentState::Sealed && self.next_upload_at.map_or(true, |at| now >= at)
    }

    /// A reclaimed marker is kept for `retention` after reclamation
    pub fn prune_due(&self, now: DateTime<Utc>, retention: chrono::Duration) -> bool {
        self.state == SegmentState::Reclaimed && self.reclaimed_at.map_or(true, |at| now - at >= retention)
    }

    pub async fn save(&self, data_dir: &Path) -> Result<()> {
        let path = self.segment_id.marker_path(data_dir);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        trace!(segment_id = %self.segment_id, state = %self.state, "Segment marker saved");
        Ok(())
    }

    /// Delete the marker file; a missing file is not an error
    pub async fn remove(&self, data_dir: &Path) -> Result<()> {
        match tokio::fs::remove_file(self.segment_id.marker_path(data_dir)).await {
            Ok(()) => {
                trace!(segment_id = %self.segment_id, "Segment marker removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Every marker in `data_dir`, oldest segment first
    pub async fn list(data_dir: &Path) -> Result<Vec<SegmentMarker>> {
        let mut markers = Vec::new();
        let mut entries = match tokio::fs::read_dir(data_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(markers),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if name.to_string_lossy().ends_with(MARKER_SUFFIX) {
                markers.push(Self::load(&entry.path()).await?);
            }
        }
        markers.sort_by(|a, b| a.segment_id.cmp(&b.segment_id));
        Ok(markers)
    }
}

/// A record as read back from a segment
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub batch_id: String,
    pub record_index: i64,
    pub cursor: i64,
    pub subject: String,
    pub status: String,
    pub record_json: String,
}

/// SQLite database behind one segment
#[derive(Debug, Clone)]
pub struct SegmentStore {
    id: SegmentId,
    path: PathBuf,
    pool: SqlitePool,
}

impl SegmentStore {
    /// Open or create the database for `id` in `data_dir`
    pub async fn open(data_dir: &Path, id: &SegmentId) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        Self::open_path(id.clone(), id.db_path(data_dir), true).await
    }

    /// Open an existing database file, e.g. one restored from the archive
    pub async fn open_existing(path: &Path) -> Result<Self> {
        let id = path
            .file_stem()
            .map(|stem| SegmentId::from(stem.to_string_lossy().as_ref()))
            .ok_or_else(|| TurboError::Io(format!("not a segment path: {}", path.display())))?;
        Self::open_path(id, path.to_path_buf(), false).await
    }

    async fn open_path(id: SegmentId, path: PathBuf, create: bool) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(create)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        // Single writer; one connection keeps transactions strictly serial
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| TurboError::database("open segment", e))?;

        let store = Self { id, path, pool };
        store.initialize_schema().await?;
        debug!(segment_id = %store.id, path = %store.path.display(), "Segment database opened");
        Ok(store)
    }

    async fn initialize_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                batch_id TEXT NOT NULL,
                record_index INTEGER NOT NULL,
                batch_sequence INTEGER NOT NULL,
                cursor INTEGER NOT NULL,
                subject TEXT NOT NULL,
                kind TEXT NOT NULL,
                status TEXT NOT NULL,
                record TEXT NOT NULL CHECK(json_valid(record)),
                processed_at TEXT NOT NULL,
                written_at TEXT NOT NULL,
                PRIMARY KEY (batch_id, record_index)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| TurboError::database("create records table", e))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_cursor ON records(cursor)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_subject ON records(subject)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub fn id(&self) -> &SegmentId {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a batch in one transaction. Rows already present for
    /// `(batch_id, record_index)` are ignored, so replays do not duplicate.
    /// Returns the number of rows inserted.
    pub async fn append_batch(&self, batch: &Batch) -> Result<u64> {
        let batch_id = batch.id.to_string();
        let written_at = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for (index, record) in batch.records.iter().enumerate() {
            let record_json = serde_json::to_string(record)?;
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO records (
                    batch_id, record_index, batch_sequence, cursor, subject,
                    kind, status, record, processed_at, written_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&batch_id)
            .bind(index as i64)
            .bind(batch.sequence as i64)
            .bind(record.event.cursor as i64)
            .bind(&record.event.subject)
            .bind(record.event.kind.to_string())
            .bind(record.status.to_string())
            .bind(record_json)
            .bind(record.processed_at.to_rfc3339())
            .bind(&written_at)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }

        tx.commit().await?;
        Ok(inserted)
    }

    pub async fn count_records(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM records")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    /// All records in insertion order
    pub async fn records(&self) -> Result<Vec<StoredRecord>> {
        let rows: Vec<(String, i64, i64, String, String, String)> = sqlx::query_as(
            "SELECT batch_id, record_index, cursor, subject, status, record FROM records ORDER BY rowid",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(
                |(batch_id, record_index, cursor, subject, status, record_json)| StoredRecord {
                    batch_id,
                    record_index,
                    cursor,
                    subject,
                    status,
                    record_json,
                },
            )
            .collect())
    }

    /// Logical database size, including pages still in the WAL
    pub async fn size_bytes(&self) -> Result<u64> {
        let page_count: i64 = sqlx::query_scalar("PRAGMA page_count")
            .fetch_one(&self.pool)
            .await?;
        let page_size: i64 = sqlx::query_scalar("PRAGMA page_size")
            .fetch_one(&self.pool)
            .await?;
        Ok((page_count * page_size).max(0) as u64)
    }

    /// Fold the WAL into the main file and close the pool, leaving a single
    /// self-contained database file.
    pub async fn checkpoint_and_close(self) -> Result<()> {
        self.checkpoint().await?;
        self.pool.close().await;
        Ok(())
    }

    /// Fold the WAL into the main file and truncate it, keeping the pool open.
    pub async fn checkpoint(&self) -> Result<()> {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await
            .map_err(|e| TurboError::database("wal checkpoint", e))?;
        Ok(())
    }
}
