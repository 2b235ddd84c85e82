use super::enriched::EnrichedRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub Uuid);

impl BatchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Flush unit handed to storage. Records keep arrival order; a record's
/// identity in the durable store is `(id, index)`.
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: BatchId,
    /// Position in the flush order of this process
    pub sequence: u64,
    pub records: Vec<EnrichedRecord>,
    pub opened_at: DateTime<Utc>,
    pub sealed_at: DateTime<Utc>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn cursors(&self) -> Vec<u64> {
        self.records.iter().map(EnrichedRecord::cursor).collect()
    }
}
