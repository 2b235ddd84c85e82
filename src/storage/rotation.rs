//! # Rotation Manager
//!
//! Rotates the active segment when the writer reports it full or it ages
//! out, then drives retired segments through
//! `sealed -> archived -> reclaimed`. Sealing (count, checkpoint, marker)
//! happens after the writer lock is released, so appends never wait on it.
//!
//! Every pass works from markers alone ([`plan_recovery`]), so a crash or a
//! failed seal at any point of the lifecycle resumes where it stopped: an
//! `active` marker other than the writer's is sealed, a `sealed` segment is
//! uploaded again under the same key, an `archived` segment is reclaimed.
//! Local files are deleted only after the archive has confirmed the upload,
//! and `reclaimed` markers are pruned once their retention has passed.

use super::archive::SegmentArchive;
use super::durable::SharedDurableWriter;
use super::segment::{SegmentId, SegmentMarker, SegmentState, SegmentStore};
use crate::config::StorageConfig;
use crate::error::Result;
use crate::logging::log_segment_operation;
use crate::metrics::{names, SharedMetrics};
use crate::utils::backoff::BackoffPolicy;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Active segment left behind by a previous process
    Seal(SegmentId),
    /// Sealed but never confirmed archived
    Archive(SegmentId),
    /// Archived but local file not yet deleted
    Reclaim(SegmentId),
}

/// Decide what each stored segment needs, ignoring the segment that is
/// currently active in this process.
pub fn plan_recovery(markers: &[SegmentMarker], current_active: Option<&SegmentId>) -> Vec<RecoveryAction> {
    markers
        .iter()
        .filter(|marker| Some(&marker.segment_id) != current_active)
        .filter_map(|marker| match marker.state {
            SegmentState::Active => Some(RecoveryAction::Seal(marker.segment_id.clone())),
            SegmentState::Sealed => Some(RecoveryAction::Archive(marker.segment_id.clone())),
            SegmentState::Archived => Some(RecoveryAction::Reclaim(marker.segment_id.clone())),
            SegmentState::Reclaimed => None,
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub sealed: usize,
    pub archived: usize,
    pub reclaimed: usize,
    pub failed: usize,
    pub pruned: usize,
}

pub struct RotationManager {
    data_dir: PathBuf,
    writer: SharedDurableWriter,
    archive: SegmentArchive,
    backoff: BackoffPolicy,
    check_interval: Duration,
    marker_retention: chrono::Duration,
    rotation_due: Arc<Notify>,
    metrics: SharedMetrics,
}

impl RotationManager {
    pub fn new(
        config: &StorageConfig,
        writer: SharedDurableWriter,
        archive: SegmentArchive,
        rotation_due: Arc<Notify>,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            data_dir: config.data_dir.clone(),
            writer,
            archive,
            backoff: BackoffPolicy::new(config.archive_retry_base_delay(), config.archive_retry_max_delay()),
            check_interval: config.rotation_check_interval(),
            marker_retention: chrono::Duration::from_std(config.reclaimed_marker_retention())
                .unwrap_or_else(|_| chrono::Duration::days(365)),
            rotation_due,
            metrics,
        }
    }

    pub fn archive(&self) -> &SegmentArchive {
        &self.archive
    }

    /// Resume every segment's lifecycle from its marker, ignoring upload
    /// backoff left over from the previous run.
    pub async fn recover(&self) -> Result<ArchiveSummary> {
        let active = self.writer.lock().await.active_segment().clone();
        let markers = SegmentMarker::list(&self.data_dir).await?;
        let plan = plan_recovery(&markers, Some(&active));
        if plan.is_empty() {
            return Ok(ArchiveSummary::default());
        }
        info!(actions = plan.len(), "🔄 ROTATION: Recovering segments from previous run");
        self.archive_all(true).await
    }

    /// Retire the active segment if it is past its size or age bound and
    /// seal it. The writer lock is held only for the swap.
    pub async fn rotate_if_due(&self) -> Result<Option<SegmentId>> {
        let retired = self.writer.lock().await.retire_if_due().await?;
        match retired {
            Some(retired) => retired.seal(&self.data_dir, &self.metrics).await.map(Some),
            None => Ok(None),
        }
    }

    async fn seal_stale(&self, marker: &mut SegmentMarker) -> Result<()> {
        let db_path = marker.segment_id.db_path(&self.data_dir);
        if tokio::fs::try_exists(&db_path).await? {
            let store = SegmentStore::open_existing(&db_path).await?;
            marker.record_count = Some(store.count_records().await?);
            marker.size_bytes = Some(store.size_bytes().await?);
            store.checkpoint_and_close().await?;
        } else {
            marker.record_count = Some(0);
            marker.size_bytes = Some(0);
        }
        marker.transition(SegmentState::Sealed)?;
        marker.save(&self.data_dir).await?;
        self.metrics.increment_counter(names::SEGMENTS_SEALED, 1);
        log_segment_operation("recover_seal", marker.segment_id.as_str(), "sealed", marker.size_bytes, None);
        Ok(())
    }

    /// Upload every sealed segment whose backoff has elapsed and reclaim
    /// every archived one.
    pub async fn archive_pending(&self) -> Result<ArchiveSummary> {
        self.archive_all(false).await
    }

    async fn archive_all(&self, ignore_backoff: bool) -> Result<ArchiveSummary> {
        let mut summary = ArchiveSummary::default();
        let active = self.writer.lock().await.active_segment().clone();
        let now = Utc::now();
        for mut marker in SegmentMarker::list(&self.data_dir).await? {
            match marker.state {
                SegmentState::Active if marker.segment_id != active => {
                    self.seal_stale(&mut marker).await?;
                    summary.sealed += 1;
                    if !self.archive_segment(&mut marker).await? {
                        summary.failed += 1;
                        continue;
                    }
                    summary.archived += 1;
                }
                SegmentState::Sealed if ignore_backoff || marker.upload_due(now) => {
                    if !self.archive_segment(&mut marker).await? {
                        summary.failed += 1;
                        continue;
                    }
                    summary.archived += 1;
                }
                SegmentState::Archived => {}
                SegmentState::Reclaimed if marker.prune_due(now, self.marker_retention) => {
                    marker.remove(&self.data_dir).await?;
                    summary.pruned += 1;
                    continue;
                }
                _ => continue,
            }
            self.reclaim(&mut marker).await?;
            summary.reclaimed += 1;
        }
        if summary != ArchiveSummary::default() {
            debug!(?summary, "Archive pass complete");
        }
        Ok(summary)
    }

    /// Upload one sealed segment. Upload failures are recorded in the
    /// marker and reported as `false`; marker I/O errors propagate.
    async fn archive_segment(&self, marker: &mut SegmentMarker) -> Result<bool> {
        let id = marker.segment_id.clone();
        let db_path = id.db_path(&self.data_dir);
        match self.archive.upload(&id, &db_path).await {
            Ok(receipt) => {
                marker.archive_key = Some(receipt.key);
                marker.transition(SegmentState::Archived)?;
                marker.save(&self.data_dir).await?;
                self.metrics.increment_counter(names::SEGMENTS_ARCHIVED, 1);
                log_segment_operation(
                    "archive",
                    id.as_str(),
                    "archived",
                    Some(receipt.compressed_bytes),
                    Some(&format!("original_bytes={}", receipt.original_bytes)),
                );
                Ok(true)
            }
            Err(e) => {
                marker.upload_attempts += 1;
                let delay = self.backoff.delay_for(marker.upload_attempts);
                marker.next_upload_at = Some(
                    Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(60)),
                );
                marker.last_error = Some(e.to_string());
                marker.save(&self.data_dir).await?;
                self.metrics.increment_counter(names::ARCHIVE_UPLOAD_FAILURES, 1);
                warn!(
                    segment_id = %id,
                    attempts = marker.upload_attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "Segment upload failed, staying sealed"
                );
                Ok(false)
            }
        }
    }

    async fn reclaim(&self, marker: &mut SegmentMarker) -> Result<()> {
        let id = &marker.segment_id;
        let [wal, shm] = id.sidecar_paths(&self.data_dir);
        for path in [id.db_path(&self.data_dir), wal, shm] {
            remove_if_present(&path).await?;
        }
        marker.transition(SegmentState::Reclaimed)?;
        marker.save(&self.data_dir).await?;
        self.metrics.increment_counter(names::SEGMENTS_RECLAIMED, 1);
        log_segment_operation("reclaim", marker.segment_id.as_str(), "reclaimed", None, None);
        Ok(())
    }

    /// Rebuild a segment database from the archive alone.
    pub async fn restore_segment(&self, id: &SegmentId, dest: &Path) -> Result<u64> {
        self.archive.restore(id, dest).await
    }

    async fn tick(&self) {
        if let Err(e) = self.rotate_if_due().await {
            error!(error = %e, "Segment rotation failed");
        }
        if let Err(e) = self.archive_pending().await {
            error!(error = %e, "Archive pass failed");
        }
    }

    /// Run until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            check_interval_ms = self.check_interval.as_millis() as u64,
            "🔄 ROTATION: Manager started"
        );

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = self.rotation_due.notified() => self.tick().await,
                _ = ticker.tick() => self.tick().await,
            }
        }
        info!("🔄 ROTATION: Manager stopped");
    }
}

async fn remove_if_present(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
