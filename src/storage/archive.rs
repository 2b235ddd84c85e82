//! # Segment Archive
//!
//! Cold storage for sealed segments. A segment is gzip-compressed and
//! written to any `object_store::ObjectStore` under
//! `<prefix>/<segment_id>.db.gz`. Keys are deterministic, so re-uploading a
//! segment after a restart overwrites the same object with the same bytes.

use super::segment::SegmentId;
use crate::error::{Result, TurboError};
use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::StreamExt;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

const ARCHIVE_SUFFIX: &str = ".db.gz";

/// Confirmation that an archived object exists with the expected size
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveReceipt {
    pub key: String,
    pub original_bytes: u64,
    pub compressed_bytes: u64,
}

#[derive(Clone)]
pub struct SegmentArchive {
    store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl std::fmt::Debug for SegmentArchive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentArchive")
            .field("store", &self.store.to_string())
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl SegmentArchive {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into().trim_matches('/').to_string(),
        }
    }

    pub fn in_memory(prefix: impl Into<String>) -> Self {
        Self::new(Arc::new(InMemory::new()), prefix)
    }

    /// Archive rooted at a local directory, created if missing
    pub fn local(root: &Path, prefix: impl Into<String>) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        let store = LocalFileSystem::new_with_prefix(root)?;
        Ok(Self::new(Arc::new(store), prefix))
    }

    pub fn key_for(&self, id: &SegmentId) -> String {
        format!("{}/{}{ARCHIVE_SUFFIX}", self.prefix, id)
    }

    /// Compress and upload the segment database at `db_path`, then confirm
    /// the stored object's size before returning.
    pub async fn upload(&self, id: &SegmentId, db_path: &Path) -> Result<ArchiveReceipt> {
        let raw = tokio::fs::read(db_path).await?;
        let original_bytes = raw.len() as u64;
        let compressed = tokio::task::spawn_blocking(move || compress(&raw))
            .await
            .map_err(|e| TurboError::Internal(format!("compression task failed: {e}")))??;
        let compressed_bytes = compressed.len() as u64;

        let key = self.key_for(id);
        let location = ObjectPath::from(key.as_str());
        self.store
            .put(&location, PutPayload::from_bytes(compressed))
            .await
            .map_err(|e| TurboError::archival_upload(id, e.to_string()))?;

        let meta = self
            .store
            .head(&location)
            .await
            .map_err(|e| TurboError::archival_upload(id, format!("upload not confirmed: {e}")))?;
        if meta.size as u64 != compressed_bytes {
            return Err(TurboError::archival_upload(
                id,
                format!("size mismatch: stored {} expected {compressed_bytes}", meta.size),
            ));
        }

        debug!(segment_id = %id, key = %key, original_bytes, compressed_bytes, "Segment uploaded");
        Ok(ArchiveReceipt {
            key,
            original_bytes,
            compressed_bytes,
        })
    }

    pub async fn exists(&self, id: &SegmentId) -> Result<bool> {
        match self.store.head(&ObjectPath::from(self.key_for(id).as_str())).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Download and decompress a segment into `dest`, returning bytes written.
    pub async fn restore(&self, id: &SegmentId, dest: &Path) -> Result<u64> {
        let location = ObjectPath::from(self.key_for(id).as_str());
        let compressed = self.store.get(&location).await?.bytes().await?;
        let raw = tokio::task::spawn_blocking(move || decompress(&compressed))
            .await
            .map_err(|e| TurboError::Internal(format!("decompression task failed: {e}")))??;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, &raw).await?;
        info!(segment_id = %id, dest = %dest.display(), bytes = raw.len(), "Segment restored from archive");
        Ok(raw.len() as u64)
    }

    /// Archived segment ids, sorted
    pub async fn list(&self) -> Result<Vec<SegmentId>> {
        let prefix = ObjectPath::from(self.prefix.as_str());
        let mut listing = self.store.list(Some(&prefix));
        let mut ids = Vec::new();
        while let Some(meta) = listing.next().await {
            let meta = meta?;
            if let Some(name) = meta.location.filename() {
                if let Some(id) = name.strip_suffix(ARCHIVE_SUFFIX) {
                    ids.push(SegmentId::from(id));
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

fn compress(raw: &[u8]) -> Result<Bytes> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(raw.len() / 2), Compression::default());
    encoder.write_all(raw)?;
    Ok(Bytes::from(encoder.finish()?))
}

fn decompress(compressed: &[u8]) -> Result<Vec<u8>> {
    let mut raw = Vec::new();
    GzDecoder::new(compressed).read_to_end(&mut raw)?;
    Ok(raw)
}
