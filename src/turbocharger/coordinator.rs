//! # Buffer Coordinator
//!
//! Accepts enriched records through a bounded queue and hands flush-ready
//! batches to a [`BatchSink`] from a single flusher task.
//!
//! ```text
//!   submit() ──► [bounded queue] ──► flusher ──► RecordBuffer
//!      ▲              (full: caller waits)          │ full or aged
//!      │                                            ▼
//!   halt signal ◄──── fatal error ◄──────── sink.write_batch()
//! ```
//!
//! The queue bound is the pipeline's flow control: when storage falls
//! behind, `submit` suspends and so does everything upstream of it.

use super::buffer::RecordBuffer;
use crate::config::BufferConfig;
use crate::error::{Result, TurboError};
use crate::metrics::{names, SharedMetrics};
use crate::models::{Batch, EnrichedRecord};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument};

/// Destination for flushed batches. An `Err` halts the coordinator; sinks
/// return one only for failures that must stop ingest.
#[async_trait]
pub trait BatchSink: Send + Sync + 'static {
    async fn write_batch(&self, batch: Batch) -> Result<()>;
}

enum Command {
    Record(EnrichedRecord, Instant),
    Flush(oneshot::Sender<Result<()>>),
    Shutdown(oneshot::Sender<Result<()>>),
}

pub struct BufferCoordinator {
    tx: mpsc::Sender<Command>,
    halt_rx: watch::Receiver<Option<TurboError>>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl BufferCoordinator {
    pub fn spawn(config: &BufferConfig, sink: Arc<dyn BatchSink>, metrics: SharedMetrics) -> Self {
        Self::spawn_with(
            config.max_batch_records,
            config.max_batch_age(),
            config.backpressure_queue_bound,
            sink,
            metrics,
        )
    }

    pub fn spawn_with(
        max_batch_records: usize,
        max_batch_age: Duration,
        queue_bound: usize,
        sink: Arc<dyn BatchSink>,
        metrics: SharedMetrics,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_bound.max(1));
        let (halt_tx, halt_rx) = watch::channel(None);

        info!(
            max_batch_records,
            max_batch_age_ms = max_batch_age.as_millis() as u64,
            queue_bound,
            "📦 BUFFER: Coordinator started"
        );

        let flusher = Flusher {
            buffer: RecordBuffer::new(max_batch_records, max_batch_age),
            rx,
            sink,
            metrics,
            halt_tx,
        };
        let task = tokio::spawn(flusher.run());

        Self {
            tx,
            halt_rx,
            task: parking_lot::Mutex::new(Some(task)),
        }
    }

    /// Queue a record for the active batch, waiting while the queue is full.
    pub async fn submit(&self, record: EnrichedRecord) -> Result<()> {
        if let Some(e) = self.halt_error() {
            return Err(e);
        }
        self.tx
            .send(Command::Record(record, Instant::now()))
            .await
            .map_err(|_| self.closed_error("submit"))
    }

    /// Flush the active batch now and wait for the sink's acknowledgement.
    pub async fn flush(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(Command::Flush(ack_tx))
            .await
            .map_err(|_| self.closed_error("flush"))?;
        ack_rx.await.map_err(|_| self.closed_error("flush"))?
    }

    /// Flush whatever remains, then stop the flusher.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let result = match self.tx.send(Command::Shutdown(ack_tx)).await {
            Ok(()) => ack_rx.await.unwrap_or_else(|_| Err(self.closed_error("shutdown"))),
            Err(_) => self.halt_error().map_or(Ok(()), Err),
        };

        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "Buffer flusher task ended abnormally");
            }
        }
        result
    }

    /// Resolves with the fatal error once the flusher has halted.
    pub async fn halted(&self) -> TurboError {
        let mut rx = self.halt_rx.clone();
        let outcome = rx.wait_for(Option::is_some).await.map(|error| error.clone());
        match outcome {
            Ok(Some(error)) => error,
            Ok(None) => TurboError::Internal("halt signalled without error".to_string()),
            // Sender gone without a halt: the flusher stopped normally
            Err(_) => std::future::pending().await,
        }
    }

    pub fn halt_error(&self) -> Option<TurboError> {
        self.halt_rx.borrow().clone()
    }

    /// Records waiting in the queue, not yet in the active batch
    pub fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    fn closed_error(&self, operation: &str) -> TurboError {
        self.halt_error()
            .unwrap_or_else(|| TurboError::shutdown_in_progress(format!("buffer {operation}")))
    }
}

impl Drop for BufferCoordinator {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

struct Flusher {
    buffer: RecordBuffer,
    rx: mpsc::Receiver<Command>,
    sink: Arc<dyn BatchSink>,
    metrics: SharedMetrics,
    halt_tx: watch::Sender<Option<TurboError>>,
}

impl Flusher {
    async fn run(mut self) {
        loop {
            let command = match self.buffer.deadline() {
                Some(deadline) => match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                    Ok(command) => command,
                    Err(_) => {
                        if self.flush("age").await.is_err() {
                            break;
                        }
                        continue;
                    }
                },
                None => self.rx.recv().await,
            };

            match command {
                Some(Command::Record(record, submitted_at)) => {
                    // an aged batch must not absorb a record submitted after its deadline
                    if self.buffer.is_expired(submitted_at) && self.flush("age").await.is_err() {
                        break;
                    }
                    if self.buffer.push(record, submitted_at) && self.flush("size").await.is_err() {
                        break;
                    }
                }
                Some(Command::Flush(ack)) => {
                    let result = self.flush("forced").await;
                    let failed = result.is_err();
                    let _ = ack.send(result);
                    if failed {
                        break;
                    }
                }
                Some(Command::Shutdown(ack)) => {
                    let result = self.flush("shutdown").await;
                    let _ = ack.send(result);
                    break;
                }
                None => {
                    let _ = self.flush("closed").await;
                    break;
                }
            }
        }
        debug!(remaining = self.buffer.len(), "Buffer flusher stopped");
    }

    async fn flush(&mut self, trigger: &'static str) -> Result<()> {
        let Some(batch) = self.buffer.take() else {
            return Ok(());
        };
        let batch_id = batch.id;
        let records = batch.len();
        let started = std::time::Instant::now();

        let result = self.sink.write_batch(batch).await;
        let elapsed = started.elapsed();
        self.metrics.observe_latency(names::BATCH_FLUSH_LATENCY, elapsed);

        match result {
            Ok(()) => {
                self.metrics.increment_counter(names::BATCHES_FLUSHED, 1);
                self.metrics.increment_counter(names::RECORDS_FLUSHED, records as u64);
                debug!(
                    batch_id = %batch_id,
                    records,
                    trigger,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Batch flushed"
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    batch_id = %batch_id,
                    records,
                    trigger,
                    error = %e,
                    "🔴 BUFFER: Fatal sink failure, halting flusher"
                );
                self.halt_tx.send_replace(Some(e.clone()));
                Err(e)
            }
        }
    }
}
