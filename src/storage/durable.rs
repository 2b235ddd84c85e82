//! # Durable Writer
//!
//! Owns the single active segment. Appends go through here and nowhere
//! else, so the active segment never sees concurrent writers.
//!
//! An append returns as soon as its transaction commits. Crossing the size
//! bound only signals the rotation manager, which swaps in a fresh segment
//! under the writer lock and seals the retired one after releasing it.

use super::segment::{SegmentId, SegmentMarker, SegmentState, SegmentStore};
use crate::config::StorageConfig;
use crate::error::Result;
use crate::logging::log_segment_operation;
use crate::metrics::{names, SharedMetrics};
use crate::models::Batch;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// One append attempt against the durable store. Retries and timeouts are
/// applied by the caller.
#[async_trait]
pub trait DurableSink: Send + Sync + 'static {
    async fn append_batch(&self, batch: &Batch) -> Result<u64>;
}

pub type SharedDurableWriter = Arc<Mutex<DurableWriter>>;

pub struct DurableWriter {
    data_dir: PathBuf,
    store: SegmentStore,
    marker: SegmentMarker,
    opened_at: Instant,
    max_size_bytes: u64,
    max_age: Duration,
    rotation_due: Arc<Notify>,
    metrics: SharedMetrics,
}

impl std::fmt::Debug for DurableWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableWriter")
            .field("data_dir", &self.data_dir)
            .field("active_segment", &self.marker.segment_id)
            .field("max_size_bytes", &self.max_size_bytes)
            .field("max_age", &self.max_age)
            .finish()
    }
}

/// A segment swapped out of the writer but not yet sealed. Its marker still
/// reads `active` until [`RetiredSegment::seal`] completes; if sealing never
/// happens the rotation manager seals it from the marker.
#[derive(Debug)]
pub struct RetiredSegment {
    store: SegmentStore,
    marker: SegmentMarker,
    next_active: SegmentId,
}

impl RetiredSegment {
    pub fn id(&self) -> &SegmentId {
        &self.marker.segment_id
    }

    /// Checkpoint the retired segment into a single file and mark it sealed.
    pub async fn seal(self, data_dir: &Path, metrics: &SharedMetrics) -> Result<SegmentId> {
        let Self {
            store,
            mut marker,
            next_active,
        } = self;
        let record_count = store.count_records().await?;
        let size_bytes = store.size_bytes().await?;
        store.checkpoint_and_close().await?;

        marker.record_count = Some(record_count);
        marker.size_bytes = Some(size_bytes);
        marker.transition(SegmentState::Sealed)?;
        marker.save(data_dir).await?;

        metrics.increment_counter(names::SEGMENTS_SEALED, 1);
        log_segment_operation(
            "seal",
            marker.segment_id.as_str(),
            "sealed",
            Some(size_bytes),
            Some(&format!("records={record_count} next_active={next_active}")),
        );
        Ok(marker.segment_id)
    }
}

impl DurableWriter {
    /// Create a fresh active segment in the configured data directory.
    /// `rotation_due` is notified when an append crosses the size bound and
    /// after every inline [`rotate`](Self::rotate).
    pub async fn open(config: &StorageConfig, rotation_due: Arc<Notify>, metrics: SharedMetrics) -> Result<Self> {
        let data_dir = config.data_dir.clone();
        let (store, marker) = Self::create_segment(&data_dir).await?;
        info!(
            segment_id = %marker.segment_id,
            data_dir = %data_dir.display(),
            max_size_bytes = config.segment_max_size(),
            max_age_seconds = config.segment_max_age_seconds,
            "💾 STORAGE: Durable writer opened"
        );
        Ok(Self {
            data_dir,
            store,
            marker,
            opened_at: Instant::now(),
            max_size_bytes: config.segment_max_size(),
            max_age: config.segment_max_age(),
            rotation_due,
            metrics,
        })
    }

    async fn create_segment(data_dir: &Path) -> Result<(SegmentStore, SegmentMarker)> {
        let id = SegmentId::generate();
        let store = SegmentStore::open(data_dir, &id).await?;
        let marker = SegmentMarker::new_active(id);
        marker.save(data_dir).await?;
        Ok((store, marker))
    }

    pub fn active_segment(&self) -> &SegmentId {
        &self.marker.segment_id
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn store(&self) -> &SegmentStore {
        &self.store
    }

    /// Append one batch to the active segment. Once the transaction commits
    /// the append has succeeded; a segment past its size bound is only
    /// reported to the rotation manager.
    pub async fn append(&mut self, batch: &Batch) -> Result<u64> {
        let inserted = self.store.append_batch(batch).await?;
        debug!(
            segment_id = %self.marker.segment_id,
            batch_id = %batch.id,
            inserted,
            "Batch appended to active segment"
        );
        match self.store.size_bytes().await {
            Ok(size) if size >= self.max_size_bytes => self.rotation_due.notify_one(),
            Ok(_) => {}
            Err(e) => warn!(segment_id = %self.marker.segment_id, error = %e, "Segment size check failed"),
        }
        Ok(inserted)
    }

    /// Swap in a fresh segment when the active one exceeds its size or age
    /// bound, returning the retired segment for sealing.
    pub async fn retire_if_due(&mut self) -> Result<Option<RetiredSegment>> {
        let age = self.opened_at.elapsed();
        let size = self.store.size_bytes().await?;
        if size < self.max_size_bytes && age < self.max_age {
            return Ok(None);
        }
        // an empty segment past its age bound is not worth archiving
        if size < self.max_size_bytes && self.store.count_records().await? == 0 {
            self.opened_at = Instant::now();
            return Ok(None);
        }
        let trigger = if size >= self.max_size_bytes { "size" } else { "age" };
        debug!(segment_id = %self.marker.segment_id, size, trigger, "Segment rotation due");
        self.retire().await.map(Some)
    }

    /// Swap in a fresh active segment unconditionally.
    pub async fn retire(&mut self) -> Result<RetiredSegment> {
        let (next_store, next_marker) = Self::create_segment(&self.data_dir).await?;
        let store = std::mem::replace(&mut self.store, next_store);
        let marker = std::mem::replace(&mut self.marker, next_marker);
        self.opened_at = Instant::now();
        Ok(RetiredSegment {
            store,
            marker,
            next_active: self.marker.segment_id.clone(),
        })
    }

    /// Retire and seal the active segment in one step, then wake the
    /// rotation manager to archive it.
    pub async fn rotate(&mut self) -> Result<SegmentId> {
        let retired = self.retire().await?;
        let sealed = retired.seal(&self.data_dir, &self.metrics).await?;
        self.rotation_due.notify_one();
        Ok(sealed)
    }

    /// Fold the active segment's WAL into its file. The marker stays
    /// `active`; the next startup seals it.
    pub async fn checkpoint(&self) -> Result<()> {
        self.store.checkpoint().await?;
        debug!(segment_id = %self.marker.segment_id, "Active segment checkpointed");
        Ok(())
    }

    /// Checkpoint and close the active segment, leaving its marker `active`.
    pub async fn close(self) -> Result<()> {
        let id = self.marker.segment_id.clone();
        self.store.checkpoint_and_close().await?;
        debug!(segment_id = %id, "Durable writer closed");
        Ok(())
    }
}

#[async_trait]
impl DurableSink for Mutex<DurableWriter> {
    async fn append_batch(&self, batch: &Batch) -> Result<u64> {
        self.lock().await.append(batch).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::InMemoryMetrics;
    use crate::models::{BatchId, EnrichedRecord, EventKind, RawEvent};
    use chrono::Utc;
    use tempfile::TempDir;

    fn batch(cursors: std::ops::Range<u64>) -> Batch {
        Batch {
            id: BatchId::new(),
            sequence: 0,
            records: cursors
                .map(|c| EnrichedRecord::skipped(RawEvent::new(c, EventKind::Create, "did:plc:t", "{}")))
                .collect(),
            opened_at: Utc::now(),
            sealed_at: Utc::now(),
        }
    }

    fn config(dir: &TempDir, max_size: u64) -> StorageConfig {
        StorageConfig {
            data_dir: dir.path().to_path_buf(),
            segment_max_size_bytes: max_size,
            ..StorageConfig::default()
        }
    }

    #[tokio::test]
    async fn test_append_past_size_bound_only_signals_rotation() {
        let dir = TempDir::new().unwrap();
        let rotation_due = Arc::new(Notify::new());
        let metrics = Arc::new(InMemoryMetrics::new());
        let mut writer = DurableWriter::open(&config(&dir, 1), rotation_due.clone(), metrics.clone())
            .await
            .unwrap();
        let first = writer.active_segment().clone();

        assert_eq!(writer.append(&batch(0..3)).await.unwrap(), 3);
        assert_eq!(writer.active_segment(), &first);
        // permit stored by notify_one
        rotation_due.notified().await;
        assert_eq!(metrics.counter(names::SEGMENTS_SEALED), 0);

        let retired = writer.retire_if_due().await.unwrap().expect("size bound crossed");
        assert_eq!(retired.id(), &first);
        assert_ne!(writer.active_segment(), &first);
        retired.seal(dir.path(), &(metrics.clone() as SharedMetrics)).await.unwrap();

        let markers = SegmentMarker::list(dir.path()).await.unwrap();
        let old = markers.iter().find(|m| m.segment_id == first).unwrap();
        assert_eq!(old.state, SegmentState::Sealed);
        assert_eq!(old.record_count, Some(3));
        assert_eq!(metrics.counter(names::SEGMENTS_SEALED), 1);
    }

    #[tokio::test]
    async fn test_appends_continue_while_retired_segment_is_unsealed() {
        let dir = TempDir::new().unwrap();
        let metrics = Arc::new(InMemoryMetrics::new());
        let mut writer = DurableWriter::open(&config(&dir, u64::MAX), Arc::new(Notify::new()), metrics)
            .await
            .unwrap();
        let first_batch = batch(0..2);
        writer.append(&first_batch).await.unwrap();
        let retired = writer.retire().await.unwrap();

        writer.append(&batch(2..5)).await.unwrap();
        assert_eq!(writer.store().count_records().await.unwrap(), 3);

        // the retired segment keeps exactly the batch committed before the swap
        let marker = SegmentMarker::load(&retired.id().marker_path(dir.path())).await.unwrap();
        assert_eq!(marker.state, SegmentState::Active);
        let records = retired.store.records().await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.batch_id == first_batch.id.to_string()));
    }

    #[tokio::test]
    async fn test_no_rotation_below_thresholds() {
        let dir = TempDir::new().unwrap();
        let metrics = Arc::new(InMemoryMetrics::new());
        let mut writer = DurableWriter::open(&config(&dir, u64::MAX), Arc::new(Notify::new()), metrics)
            .await
            .unwrap();
        let active = writer.active_segment().clone();
        writer.append(&batch(0..10)).await.unwrap();
        assert!(writer.retire_if_due().await.unwrap().is_none());
        assert_eq!(writer.active_segment(), &active);
        assert_eq!(writer.store().count_records().await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_sealed_segment_is_never_appended_again() {
        let dir = TempDir::new().unwrap();
        let metrics = Arc::new(InMemoryMetrics::new());
        let mut writer = DurableWriter::open(&config(&dir, u64::MAX), Arc::new(Notify::new()), metrics)
            .await
            .unwrap();
        writer.append(&batch(0..2)).await.unwrap();
        let sealed_id = writer.rotate().await.unwrap();
        writer.append(&batch(2..4)).await.unwrap();

        let sealed = SegmentStore::open_existing(&sealed_id.db_path(dir.path())).await.unwrap();
        assert_eq!(sealed.count_records().await.unwrap(), 2);
        assert_eq!(writer.store().count_records().await.unwrap(), 2);
    }
}
