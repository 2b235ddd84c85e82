//! # Storage Fan-out
//!
//! Writes each flushed batch to the durable store and the streaming sink.
//! Each sink has its own retry budget and timeout:
//!
//! | Sink      | On exhaustion                          |
//! |-----------|----------------------------------------|
//! | durable   | `DurableWrite`, fatal, halts ingest    |
//! | streaming | logged, counted, kept in the ledger    |
//!
//! [`StorageFanout::write`] runs both sinks concurrently and waits for
//! both. Once a stream publisher is started, the coordinator's path
//! ([`BatchSink::write_batch`]) waits for the durable commit only and hands
//! the batch to a bounded publisher queue; a full queue sends the batch
//! straight to the ledger, so a slow or down stream never holds up ingest.
//!
//! Archival is not per batch; sealed segments go through the rotation
//! manager. Any sink that failed is recorded in a bounded [`FailureLedger`]
//! keyed by batch id so only that sink is retried later.

use super::durable::DurableSink;
use super::stream::{StreamEntry, StreamSink};
use crate::config::StorageConfig;
use crate::error::{Result, TurboError};
use crate::metrics::{names, SharedMetrics};
use crate::models::{Batch, BatchId};
use crate::turbocharger::BatchSink;
use crate::utils::backoff::BackoffPolicy;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub enum SinkOutcome {
    Written,
    Failed(TurboError),
}

impl SinkOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, Self::Written)
    }
}

#[derive(Debug, Clone)]
pub struct BatchWriteReport {
    pub batch_id: BatchId,
    pub durable: SinkOutcome,
    pub stream: SinkOutcome,
}

impl BatchWriteReport {
    pub fn fully_written(&self) -> bool {
        self.durable.is_written() && self.stream.is_written()
    }
}

/// A batch with at least one sink still owed a write
#[derive(Debug, Clone)]
pub struct FailedBatch {
    pub batch: Batch,
    pub durable_failed: bool,
    pub stream_failed: bool,
    pub attempts: u32,
    pub last_error: String,
}

#[derive(Debug, Clone, Copy)]
pub struct SinkPolicy {
    pub retries: u32,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

/// Bounded record of partially written batches
#[derive(Debug)]
pub struct FailureLedger {
    capacity: usize,
    entries: Mutex<VecDeque<FailedBatch>>,
}

impl FailureLedger {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Record or merge a failure. Returns the entry dropped to stay within
    /// capacity, if any.
    pub fn record(&self, failed: FailedBatch) -> Option<FailedBatch> {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.iter_mut().find(|e| e.batch.id == failed.batch.id) {
            existing.durable_failed = failed.durable_failed;
            existing.stream_failed = failed.stream_failed;
            existing.attempts += failed.attempts;
            existing.last_error = failed.last_error;
            return None;
        }
        entries.push_back(failed);
        if entries.len() > self.capacity {
            entries.pop_front()
        } else {
            None
        }
    }

    pub fn pop_front(&self) -> Option<FailedBatch> {
        self.entries.lock().pop_front()
    }

    pub fn snapshot(&self) -> Vec<FailedBatch> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ledger writes shared by the fan-out and its publisher task
#[derive(Clone)]
struct LedgerRecorder {
    ledger: Arc<FailureLedger>,
    metrics: SharedMetrics,
}

impl LedgerRecorder {
    fn record(&self, batch: &Batch, report: &BatchWriteReport, attempts: u32) {
        if report.fully_written() {
            return;
        }
        let last_error = [&report.durable, &report.stream]
            .into_iter()
            .find_map(|outcome| match outcome {
                SinkOutcome::Failed(e) => Some(e.to_string()),
                SinkOutcome::Written => None,
            })
            .unwrap_or_default();
        let dropped = self.ledger.record(FailedBatch {
            batch: batch.clone(),
            durable_failed: !report.durable.is_written(),
            stream_failed: !report.stream.is_written(),
            attempts,
            last_error,
        });
        if let Some(dropped) = dropped {
            self.metrics.increment_counter(names::FAILED_BATCHES_DROPPED, 1);
            error!(
                batch_id = %dropped.batch.id,
                records = dropped.batch.len(),
                durable_failed = dropped.durable_failed,
                stream_failed = dropped.stream_failed,
                last_error = %dropped.last_error,
                "🔴 STORAGE: Failure ledger full, dropping oldest failed batch"
            );
        }
    }
}

/// Stream publication with its retry policy and trimming
struct StreamWriter {
    stream: Arc<dyn StreamSink>,
    policy: SinkPolicy,
    max_len: Option<usize>,
    metrics: SharedMetrics,
}

impl StreamWriter {
    async fn publish(&self, batch: &Batch) -> SinkOutcome {
        let entries = match StreamEntry::from_batch(batch) {
            Ok(entries) => entries,
            Err(e) => return SinkOutcome::Failed(e),
        };
        let (stream, entries, max_len) = (&self.stream, &entries, self.max_len);
        let outcome = with_retries(
            "stream",
            batch.id,
            self.policy,
            |id, e| TurboError::streaming_write(id, e),
            move || async move {
                let ids = stream.append_batch(entries).await?;
                if let Some(max_len) = max_len {
                    stream.trim(max_len).await?;
                }
                Ok(ids)
            },
        )
        .await;
        match outcome {
            Ok(ids) => {
                debug!(batch_id = %batch.id, published = ids.len(), stream = self.stream.name(), "Stream write complete");
                SinkOutcome::Written
            }
            Err(e) => {
                self.metrics.increment_counter(names::STREAM_WRITE_FAILURES, 1);
                warn!(batch_id = %batch.id, error = %e, "Stream write failed, continuing without it");
                SinkOutcome::Failed(e)
            }
        }
    }
}

struct StreamPublisher {
    tx: mpsc::Sender<Batch>,
    task: JoinHandle<()>,
}

pub struct StorageFanout {
    durable: Arc<dyn DurableSink>,
    durable_policy: SinkPolicy,
    stream: Arc<StreamWriter>,
    recorder: LedgerRecorder,
    publisher: Mutex<Option<StreamPublisher>>,
    metrics: SharedMetrics,
}

impl StorageFanout {
    pub fn new(
        config: &StorageConfig,
        durable: Arc<dyn DurableSink>,
        stream: Arc<dyn StreamSink>,
        metrics: SharedMetrics,
    ) -> Self {
        let backoff = BackoffPolicy::new(Duration::from_millis(50), Duration::from_secs(2));
        Self {
            durable,
            durable_policy: SinkPolicy {
                retries: config.durable_write_retries,
                timeout: config.durable_write_timeout(),
                backoff,
            },
            stream: Arc::new(StreamWriter {
                stream,
                policy: SinkPolicy {
                    retries: config.stream_write_retries,
                    timeout: config.stream_write_timeout(),
                    backoff,
                },
                max_len: config.stream_max_len,
                metrics: metrics.clone(),
            }),
            recorder: LedgerRecorder {
                ledger: Arc::new(FailureLedger::new(config.failed_batch_capacity)),
                metrics: metrics.clone(),
            },
            publisher: Mutex::new(None),
            metrics,
        }
    }

    /// Replace both sink policies. Call before starting the publisher.
    pub fn with_policies(mut self, durable: SinkPolicy, stream: SinkPolicy) -> Self {
        self.durable_policy = durable;
        self.stream = Arc::new(StreamWriter {
            stream: self.stream.stream.clone(),
            policy: stream,
            max_len: self.stream.max_len,
            metrics: self.metrics.clone(),
        });
        self
    }

    /// Publish batches handed over by [`BatchSink::write_batch`] from a
    /// background task with a queue of `queue_bound` batches. Must be
    /// called from within a tokio runtime.
    pub fn start_stream_publisher(&self, queue_bound: usize) {
        let mut publisher = self.publisher.lock();
        if publisher.is_some() {
            return;
        }
        let (tx, mut rx) = mpsc::channel::<Batch>(queue_bound.max(1));
        let stream = self.stream.clone();
        let recorder = self.recorder.clone();
        let task = tokio::spawn(async move {
            while let Some(batch) = rx.recv().await {
                let outcome = stream.publish(&batch).await;
                let report = BatchWriteReport {
                    batch_id: batch.id,
                    durable: SinkOutcome::Written,
                    stream: outcome,
                };
                recorder.record(&batch, &report, 1);
            }
            debug!("Stream publisher stopped");
        });
        *publisher = Some(StreamPublisher { tx, task });
        info!(queue_bound, stream = self.stream.stream.name(), "📡 STORAGE: Stream publisher started");
    }

    /// Publish everything still queued, then stop the publisher task.
    pub async fn stop_stream_publisher(&self) {
        let publisher = self.publisher.lock().take();
        if let Some(StreamPublisher { tx, task }) = publisher {
            drop(tx);
            if let Err(e) = task.await {
                warn!(error = %e, "Stream publisher ended abnormally");
            }
        }
    }

    /// Write `batch` to both sinks concurrently and report each outcome.
    /// Failed sinks are recorded in the ledger.
    pub async fn write(&self, batch: &Batch) -> BatchWriteReport {
        let (durable, stream) = tokio::join!(self.write_durable(batch), self.stream.publish(batch));
        let report = BatchWriteReport {
            batch_id: batch.id,
            durable,
            stream,
        };
        self.recorder.record(batch, &report, 1);
        report
    }

    /// Re-attempt only the failed sinks of ledger entries, oldest first.
    /// The pass ends at the first entry that still fails, so an unavailable
    /// sink costs one retry budget per pass. Returns how many entries were
    /// fully written.
    pub async fn retry_failed(&self) -> usize {
        let pending = self.recorder.ledger.len();
        let mut recovered = 0;
        for _ in 0..pending {
            let Some(failed) = self.recorder.ledger.pop_front() else {
                break;
            };
            let durable = if failed.durable_failed {
                self.write_durable(&failed.batch).await
            } else {
                SinkOutcome::Written
            };
            let stream = if failed.stream_failed {
                self.stream.publish(&failed.batch).await
            } else {
                SinkOutcome::Written
            };
            let report = BatchWriteReport {
                batch_id: failed.batch.id,
                durable,
                stream,
            };
            if !report.fully_written() {
                self.recorder.record(&failed.batch, &report, failed.attempts + 1);
                debug!(batch_id = %failed.batch.id, recovered, "Sink still failing, ending retry pass");
                break;
            }
            recovered += 1;
            debug!(batch_id = %failed.batch.id, attempts = failed.attempts + 1, "Failed batch recovered");
        }
        recovered
    }

    /// Retry the ledger every `interval` until `shutdown` flips to `true`.
    /// A pass in progress is finished before stopping.
    pub async fn run_ledger_retries(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.reset();
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                _ = ticker.tick() => {}
            }
            if self.recorder.ledger.is_empty() {
                continue;
            }
            let recovered = self.retry_failed().await;
            if recovered > 0 {
                info!(recovered, remaining = self.recorder.ledger.len(), "Failed batches re-written");
            }
        }
        debug!("Ledger retry task stopped");
    }

    pub fn failed_batches(&self) -> Vec<FailedBatch> {
        self.recorder.ledger.snapshot()
    }

    async fn write_durable(&self, batch: &Batch) -> SinkOutcome {
        let durable = &self.durable;
        let outcome = with_retries(
            "durable",
            batch.id,
            self.durable_policy,
            |id, e| TurboError::durable_write(id, e),
            move || durable.append_batch(batch),
        )
        .await;
        match outcome {
            Ok(inserted) => {
                debug!(batch_id = %batch.id, inserted, "Durable write complete");
                SinkOutcome::Written
            }
            Err(e) => {
                self.metrics.increment_counter(names::DURABLE_WRITE_FAILURES, 1);
                error!(batch_id = %batch.id, error = %e, "Durable write failed after retries");
                SinkOutcome::Failed(e)
            }
        }
    }

    /// Hand a durably written batch to the publisher without waiting.
    fn enqueue_stream(&self, tx: &mpsc::Sender<Batch>, batch: Batch) {
        let (batch, reason) = match tx.try_send(batch) {
            Ok(()) => return,
            Err(TrySendError::Full(batch)) => (batch, "publisher queue full"),
            Err(TrySendError::Closed(batch)) => (batch, "publisher stopped"),
        };
        self.metrics.increment_counter(names::STREAM_WRITE_FAILURES, 1);
        warn!(batch_id = %batch.id, reason, "Stream publish deferred to the failure ledger");
        let report = BatchWriteReport {
            batch_id: batch.id,
            durable: SinkOutcome::Written,
            stream: SinkOutcome::Failed(TurboError::streaming_write(batch.id, reason)),
        };
        self.recorder.record(&batch, &report, 0);
    }
}

/// Run `attempt` up to `1 + policy.retries` times, each under
/// `policy.timeout`, sleeping with backoff between failures.
async fn with_retries<T, F, Fut>(
    sink: &'static str,
    batch_id: BatchId,
    policy: SinkPolicy,
    exhausted: fn(BatchId, String) -> TurboError,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut failures = 0;
    loop {
        let error = match tokio::time::timeout(policy.timeout, attempt()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {}ms", policy.timeout.as_millis()),
        };
        failures += 1;
        if failures > policy.retries {
            return Err(exhausted(batch_id, error));
        }
        let delay = policy.backoff.delay_for(failures);
        debug!(sink, batch_id = %batch_id, attempt = failures, delay_ms = delay.as_millis() as u64, error = %error, "Sink write failed, retrying");
        tokio::time::sleep(delay).await;
    }
}

#[async_trait]
impl BatchSink for StorageFanout {
    /// Only a durable failure is returned; it halts the coordinator. With a
    /// publisher running, the stream write happens after the durable commit
    /// and is not waited for.
    async fn write_batch(&self, batch: Batch) -> Result<()> {
        let publisher = self.publisher.lock().as_ref().map(|p| p.tx.clone());
        let Some(tx) = publisher else {
            let report = self.write(&batch).await;
            return match report.durable {
                SinkOutcome::Written => Ok(()),
                SinkOutcome::Failed(e) => Err(e),
            };
        };

        match self.write_durable(&batch).await {
            SinkOutcome::Written => {
                self.enqueue_stream(&tx, batch);
                Ok(())
            }
            SinkOutcome::Failed(e) => {
                let report = BatchWriteReport {
                    batch_id: batch.id,
                    durable: SinkOutcome::Failed(e.clone()),
                    stream: SinkOutcome::Failed(TurboError::streaming_write(batch.id, "durable write failed")),
                };
                self.recorder.record(&batch, &report, 1);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::InMemoryMetrics;
    use crate::models::{EnrichedRecord, EventKind, RawEvent};
    use crate::storage::stream::MemoryStream;
    use chrono::Utc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FlakyDurable {
        fail: AtomicBool,
        calls: AtomicUsize,
        written: Mutex<Vec<BatchId>>,
    }

    #[async_trait]
    impl DurableSink for FlakyDurable {
        async fn append_batch(&self, batch: &Batch) -> Result<u64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(TurboError::Io("disk unavailable".to_string()));
            }
            self.written.lock().push(batch.id);
            Ok(batch.len() as u64)
        }
    }

    struct BrokenStream {
        broken: AtomicBool,
        attempts: AtomicUsize,
        inner: MemoryStream,
    }

    #[async_trait]
    impl StreamSink for BrokenStream {
        async fn append_batch(&self, entries: &[StreamEntry]) -> Result<Vec<String>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.broken.load(Ordering::SeqCst) {
                return Err(TurboError::Io("connection refused".to_string()));
            }
            self.inner.append_batch(entries).await
        }
        async fn trim(&self, max_len: usize) -> Result<u64> {
            self.inner.trim(max_len).await
        }
        async fn len(&self) -> Result<u64> {
            self.inner.len().await
        }
        fn name(&self) -> &str {
            "broken"
        }
    }

    fn batch(n: u64) -> Batch {
        Batch {
            id: BatchId::new(),
            sequence: 0,
            records: (0..n)
                .map(|c| EnrichedRecord::skipped(RawEvent::new(c, EventKind::Create, "did:plc:t", "{}")))
                .collect(),
            opened_at: Utc::now(),
            sealed_at: Utc::now(),
        }
    }

    fn fast_policy(retries: u32) -> SinkPolicy {
        SinkPolicy {
            retries,
            timeout: Duration::from_secs(1),
            backoff: BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(2)),
        }
    }

    fn fanout(
        durable: Arc<FlakyDurable>,
        stream: Arc<BrokenStream>,
        capacity: usize,
    ) -> (StorageFanout, Arc<InMemoryMetrics>) {
        let metrics = Arc::new(InMemoryMetrics::new());
        let config = StorageConfig {
            stream_max_len: Some(3),
            failed_batch_capacity: capacity,
            ..StorageConfig::default()
        };
        let fanout = StorageFanout::new(&config, durable, stream, metrics.clone())
            .with_policies(fast_policy(2), fast_policy(1));
        (fanout, metrics)
    }

    fn stream(broken: bool) -> Arc<BrokenStream> {
        Arc::new(BrokenStream {
            broken: AtomicBool::new(broken),
            attempts: AtomicUsize::new(0),
            inner: MemoryStream::new("test"),
        })
    }

    #[tokio::test]
    async fn test_both_sinks_written_and_stream_trimmed() {
        let durable = Arc::new(FlakyDurable::default());
        let stream = stream(false);
        let (fanout, _) = fanout(durable.clone(), stream.clone(), 8);

        let report = fanout.write(&batch(5)).await;
        assert!(report.fully_written());
        assert_eq!(stream.len().await.unwrap(), 3);
        assert!(fanout.failed_batches().is_empty());
    }

    #[tokio::test]
    async fn test_stream_failure_does_not_block_durable() {
        let durable = Arc::new(FlakyDurable::default());
        let stream = stream(true);
        let (fanout, metrics) = fanout(durable.clone(), stream.clone(), 8);

        let batch = batch(2);
        fanout.write_batch(batch.clone()).await.unwrap();
        assert_eq!(*durable.written.lock(), vec![batch.id]);
        assert_eq!(metrics.counter(names::STREAM_WRITE_FAILURES), 1);

        let failed = fanout.failed_batches();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].stream_failed);
        assert!(!failed[0].durable_failed);

        // only the stream is retried
        stream.broken.store(false, Ordering::SeqCst);
        assert_eq!(fanout.retry_failed().await, 1);
        assert_eq!(durable.calls.load(Ordering::SeqCst), 1);
        assert_eq!(stream.len().await.unwrap(), 2);
        assert!(fanout.failed_batches().is_empty());
    }

    #[tokio::test]
    async fn test_durable_failure_is_fatal_after_retries() {
        let durable = Arc::new(FlakyDurable::default());
        durable.fail.store(true, Ordering::SeqCst);
        let (fanout, metrics) = fanout(durable.clone(), stream(false), 8);

        let error = fanout.write_batch(batch(1)).await.unwrap_err();
        assert!(error.is_fatal());
        assert_eq!(durable.calls.load(Ordering::SeqCst), 3);
        assert_eq!(metrics.counter(names::DURABLE_WRITE_FAILURES), 1);
        assert!(fanout.failed_batches()[0].durable_failed);
    }

    #[tokio::test]
    async fn test_ledger_overflow_drops_oldest() {
        let durable = Arc::new(FlakyDurable::default());
        let (fanout, metrics) = fanout(durable, stream(true), 2);
        let batches: Vec<Batch> = (0..3).map(|_| batch(1)).collect();
        for batch in &batches {
            fanout.write(batch).await;
        }
        let kept: Vec<BatchId> = fanout.failed_batches().iter().map(|f| f.batch.id).collect();
        assert_eq!(kept, vec![batches[1].id, batches[2].id]);
        assert_eq!(metrics.counter(names::FAILED_BATCHES_DROPPED), 1);
    }

    /// Never answers; every publish ends in the policy timeout
    struct StalledStream;

    #[async_trait]
    impl StreamSink for StalledStream {
        async fn append_batch(&self, _entries: &[StreamEntry]) -> Result<Vec<String>> {
            std::future::pending().await
        }
        async fn trim(&self, _max_len: usize) -> Result<u64> {
            Ok(0)
        }
        async fn len(&self) -> Result<u64> {
            Ok(0)
        }
        fn name(&self) -> &str {
            "stalled"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_publisher_keeps_stalled_stream_off_the_write_path() {
        let durable = Arc::new(FlakyDurable::default());
        let metrics = Arc::new(InMemoryMetrics::new());
        let stream_policy = SinkPolicy {
            retries: 0,
            timeout: Duration::from_secs(1),
            backoff: BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(2)),
        };
        let fanout = StorageFanout::new(&StorageConfig::default(), durable.clone(), Arc::new(StalledStream), metrics.clone())
            .with_policies(fast_policy(2), stream_policy);
        fanout.start_stream_publisher(1);

        // each write waits for the durable commit only; with the stream
        // inline these would take a second apiece
        let started = tokio::time::Instant::now();
        let batches: Vec<Batch> = (0..5).map(|_| batch(1)).collect();
        for batch in &batches {
            fanout.write_batch(batch.clone()).await.unwrap();
        }
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(durable.written.lock().len(), 5);

        fanout.stop_stream_publisher().await;
        let failed = fanout.failed_batches();
        assert_eq!(failed.len(), 5);
        assert!(failed.iter().all(|f| f.stream_failed && !f.durable_failed));
        assert_eq!(metrics.counter(names::STREAM_WRITE_FAILURES), 5);
    }

    #[tokio::test]
    async fn test_publisher_writes_stream_after_durable_commit() {
        let durable = Arc::new(FlakyDurable::default());
        let stream = stream(false);
        let (fanout, _) = fanout(durable.clone(), stream.clone(), 8);
        fanout.start_stream_publisher(4);

        fanout.write_batch(batch(2)).await.unwrap();
        fanout.stop_stream_publisher().await;
        assert_eq!(durable.written.lock().len(), 1);
        assert_eq!(stream.len().await.unwrap(), 2);
        assert!(fanout.failed_batches().is_empty());
    }

    #[tokio::test]
    async fn test_publisher_skips_stream_when_durable_fails() {
        let durable = Arc::new(FlakyDurable::default());
        durable.fail.store(true, Ordering::SeqCst);
        let stream = stream(false);
        let (fanout, _) = fanout(durable, stream.clone(), 8);
        fanout.start_stream_publisher(4);

        assert!(fanout.write_batch(batch(1)).await.is_err());
        fanout.stop_stream_publisher().await;
        assert_eq!(stream.attempts.load(Ordering::SeqCst), 0);
        let failed = fanout.failed_batches();
        assert!(failed[0].durable_failed && failed[0].stream_failed);
    }

    #[tokio::test]
    async fn test_retry_pass_ends_at_first_failing_entry() {
        let durable = Arc::new(FlakyDurable::default());
        let stream = stream(true);
        let (fanout, _) = fanout(durable, stream.clone(), 8);
        for _ in 0..3 {
            fanout.write(&batch(1)).await;
        }
        // one retry per write with fast_policy(1)
        assert_eq!(stream.attempts.load(Ordering::SeqCst), 6);

        assert_eq!(fanout.retry_failed().await, 0);
        assert_eq!(stream.attempts.load(Ordering::SeqCst), 8);
        assert_eq!(fanout.failed_batches().len(), 3);

        stream.broken.store(false, Ordering::SeqCst);
        assert_eq!(fanout.retry_failed().await, 3);
        assert!(fanout.failed_batches().is_empty());
    }

    #[tokio::test]
    async fn test_retry_pass_rotates_the_failing_entry_to_the_back() {
        let durable = Arc::new(FlakyDurable::default());
        let (fanout, _) = fanout(durable, stream(true), 8);
        let batches: Vec<Batch> = (0..2).map(|_| batch(1)).collect();
        for batch in &batches {
            fanout.write(batch).await;
        }
        fanout.retry_failed().await;
        let order: Vec<BatchId> = fanout.failed_batches().iter().map(|f| f.batch.id).collect();
        assert_eq!(order, vec![batches[1].id, batches[0].id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ledger_retry_task_recovers_and_stops() {
        let durable = Arc::new(FlakyDurable::default());
        let stream = stream(true);
        let (fanout, _) = fanout(durable, stream.clone(), 8);
        let fanout = Arc::new(fanout);
        fanout.write(&batch(2)).await;
        stream.broken.store(false, Ordering::SeqCst);

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(fanout.clone().run_ledger_retries(Duration::from_millis(50), stop_rx));
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(fanout.failed_batches().is_empty());
        assert_eq!(stream.len().await.unwrap(), 2);

        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }

    #[test]
    fn test_ledger_merges_same_batch() {
        let ledger = FailureLedger::new(4);
        let batch = batch(1);
        let entry = FailedBatch {
            batch: batch.clone(),
            durable_failed: false,
            stream_failed: true,
            attempts: 1,
            last_error: "first".to_string(),
        };
        ledger.record(entry.clone());
        ledger.record(FailedBatch {
            last_error: "second".to_string(),
            ..entry
        });
        let snapshot = ledger.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].attempts, 2);
        assert_eq!(snapshot[0].last_error, "second");
    }
}
