use crate::models::{Batch, BatchId, EnrichedRecord};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::Instant;

/// Active batch under construction. Full at `max_records`, expired once
/// `max_age` has passed since its first record was submitted.
#[derive(Debug)]
pub struct RecordBuffer {
    records: Vec<EnrichedRecord>,
    max_records: usize,
    max_age: Duration,
    opened_at: Option<Instant>,
    opened_wall: Option<DateTime<Utc>>,
    next_sequence: u64,
}

impl RecordBuffer {
    pub fn new(max_records: usize, max_age: Duration) -> Self {
        let max_records = max_records.max(1);
        Self {
            records: Vec::with_capacity(max_records),
            max_records,
            max_age,
            opened_at: None,
            opened_wall: None,
            next_sequence: 0,
        }
    }

    /// Append a record submitted at `submitted_at`. Returns true when the
    /// batch is full and must be flushed before the next push.
    pub fn push(&mut self, record: EnrichedRecord, submitted_at: Instant) -> bool {
        if self.records.is_empty() {
            self.opened_at = Some(submitted_at);
            self.opened_wall = Some(Utc::now());
        }
        self.records.push(record);
        self.is_full()
    }

    pub fn is_full(&self) -> bool {
        self.records.len() >= self.max_records
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Instant at which the current batch must be flushed, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.opened_at.map(|opened| opened + self.max_age)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline().is_some_and(|deadline| now >= deadline)
    }

    /// Seal the active batch and start an empty one
    pub fn take(&mut self) -> Option<Batch> {
        if self.records.is_empty() {
            return None;
        }
        let records = std::mem::replace(&mut self.records, Vec::with_capacity(self.max_records));
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let opened_at = self.opened_wall.take().unwrap_or_else(Utc::now);
        self.opened_at = None;
        Some(Batch {
            id: BatchId::new(),
            sequence,
            records,
            opened_at,
            sealed_at: Utc::now(),
        })
    }
}
