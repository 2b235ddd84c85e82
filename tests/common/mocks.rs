//! Test doubles for the pipeline's collaborators.

use async_trait::async_trait;
use dashmap::DashMap;
use firehose_turbo::hydration::{FetchFailure, FetchResults, ReferenceFetcher};
use firehose_turbo::ingest::EventSource;
use firehose_turbo::models::{Batch, RawEvent, ReferenceKey};
use firehose_turbo::storage::{DurableSink, StreamEntry, StreamSink};
use firehose_turbo::{Result, TurboError};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Fetcher that resolves every key to `{"key": "<key>"}` after `delay`.
///
/// The first `fail_first` calls for each key fail transiently; keys in
/// `always_fail` never resolve and keys in `not_found` report `NotFound`.
#[derive(Default)]
pub struct ScriptedFetcher {
    pub delay: Duration,
    pub fail_first: u32,
    pub always_fail: HashSet<ReferenceKey>,
    pub not_found: HashSet<ReferenceKey>,
    calls: AtomicUsize,
    per_key: DashMap<ReferenceKey, u32>,
}

impl ScriptedFetcher {
    pub fn instant() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn delayed(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Self::default()
        })
    }

    pub fn failing_first(fail_first: u32) -> Arc<Self> {
        Arc::new(Self {
            fail_first,
            ..Self::default()
        })
    }

    pub fn failing_keys(keys: impl IntoIterator<Item = ReferenceKey>) -> Arc<Self> {
        Arc::new(Self {
            always_fail: keys.into_iter().collect(),
            ..Self::default()
        })
    }

    /// Number of `fetch_batch` calls
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of times `key` was included in a fetch
    pub fn calls_for(&self, key: &ReferenceKey) -> u32 {
        self.per_key.get(key).map_or(0, |count| *count)
    }
}

#[async_trait]
impl ReferenceFetcher for ScriptedFetcher {
    async fn fetch_batch(&self, keys: &[ReferenceKey]) -> Result<FetchResults> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let mut results = FetchResults::new();
        for key in keys {
            let attempt = {
                let mut count = self.per_key.entry(key.clone()).or_insert(0);
                *count += 1;
                *count
            };
            let outcome = if self.not_found.contains(key) {
                Err(FetchFailure::NotFound)
            } else if self.always_fail.contains(key) || attempt <= self.fail_first {
                Err(FetchFailure::Transient("upstream 503".to_string()))
            } else {
                Ok(Arc::new(serde_json::json!({ "key": key.to_string() })))
            };
            results.insert(key.clone(), outcome);
        }
        Ok(results)
    }
}

/// Event source over a fixed script, counting how many times it was polled
/// for an item.
pub struct VecSource {
    items: VecDeque<Result<RawEvent>>,
    pulled: Arc<AtomicUsize>,
    /// Stay pending instead of ending once the script is exhausted
    hold_open: bool,
    /// Delay before each item, like a live feed
    pace: Duration,
}

impl VecSource {
    pub fn new(events: impl IntoIterator<Item = RawEvent>) -> Self {
        Self::from_results(events.into_iter().map(Ok))
    }

    pub fn from_results(items: impl IntoIterator<Item = Result<RawEvent>>) -> Self {
        Self {
            items: items.into_iter().collect(),
            pulled: Arc::new(AtomicUsize::new(0)),
            hold_open: false,
            pace: Duration::ZERO,
        }
    }

    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    pub fn paced(mut self, pace: Duration) -> Self {
        self.pace = pace;
        self
    }

    pub fn pulled(&self) -> Arc<AtomicUsize> {
        self.pulled.clone()
    }

    pub fn remaining(&self) -> usize {
        self.items.len()
    }
}

#[async_trait]
impl EventSource for VecSource {
    async fn next(&mut self) -> Result<Option<RawEvent>> {
        if !self.pace.is_zero() && !self.items.is_empty() {
            tokio::time::sleep(self.pace).await;
        }
        match self.items.pop_front() {
            Some(item) => {
                self.pulled.fetch_add(1, Ordering::SeqCst);
                item.map(Some)
            }
            None if self.hold_open => std::future::pending().await,
            None => Ok(None),
        }
    }
}

/// Durable sink whose every write fails
#[derive(Default)]
pub struct FailingDurable {
    pub calls: AtomicUsize,
}

#[async_trait]
impl DurableSink for FailingDurable {
    async fn append_batch(&self, _batch: &Batch) -> Result<u64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(TurboError::Io("no space left on device".to_string()))
    }
}

/// Stream sink that refuses every publish
#[derive(Default)]
pub struct DownStream {
    pub attempts: AtomicUsize,
}

#[async_trait]
impl StreamSink for DownStream {
    async fn append_batch(&self, _entries: &[StreamEntry]) -> Result<Vec<String>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(TurboError::Io("connection refused".to_string()))
    }

    async fn trim(&self, _max_len: usize) -> Result<u64> {
        Ok(0)
    }

    async fn len(&self) -> Result<u64> {
        Ok(0)
    }

    fn name(&self) -> &str {
        "down"
    }
}
