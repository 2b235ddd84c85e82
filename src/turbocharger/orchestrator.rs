//! # TurboCharger
//!
//! Owns the pipeline lifecycle:
//!
//! ```text
//! EventSource ──► shard filter ──► Hydrator (N in flight, ordered)
//!                                       │
//!                                       ▼
//!   RotationManager ◄── DurableWriter ◄── StorageFanout ◄── BufferCoordinator
//!          │                                  │
//!          ▼                                  ▼
//!   SegmentArchive                       StreamSink
//! ```
//!
//! `run` pulls events until the source ends, the shutdown future resolves,
//! or the coordinator halts on a durable write failure. Only the last case
//! returns an error.
//!
//! Three background tasks run beside `run`: the stream publisher, the
//! failure ledger retry loop and the rotation manager. None of them sit on
//! the ingest path.

use super::coordinator::BufferCoordinator;
use crate::config::TurboConfig;
use crate::error::Result;
use crate::hydration::{FetchOrchestrator, FetchOrchestratorConfig, HydrationCache, Hydrator, ReferenceFetcher};
use crate::ingest::{EventSource, ShardSpec};
use crate::logging::{log_error, log_pipeline_operation};
use crate::metrics::{names, CompositeMetrics, InMemoryMetrics, SharedMetrics};
use crate::storage::{
    DurableSink, DurableWriter, MemoryStream, RotationManager, SegmentArchive, SharedDurableWriter, StorageFanout,
    StreamSink,
};
use crate::utils::backoff::BackoffPolicy;
use futures::stream::{FuturesOrdered, StreamExt};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

const INGEST_RETRY_BASE: Duration = Duration::from_millis(100);
const INGEST_RETRY_MAX: Duration = Duration::from_secs(5);

/// Point-in-time view of pipeline counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TurboStats {
    pub events_ingested: u64,
    pub events_filtered: u64,
    pub ingest_errors: u64,
    pub records_complete: u64,
    pub records_partial: u64,
    pub records_skipped: u64,
    pub batches_flushed: u64,
    pub records_flushed: u64,
    pub durable_write_failures: u64,
    pub stream_write_failures: u64,
    pub failed_batches: usize,
    pub cache_hit_rate: f64,
    pub cache_size: usize,
    pub pending_fetches: usize,
    pub active_segment: String,
}

pub struct TurboCharger {
    config: TurboConfig,
    shard: ShardSpec,
    stats: Arc<InMemoryMetrics>,
    metrics: SharedMetrics,
    fetcher: Arc<FetchOrchestrator>,
    hydrator: Hydrator,
    coordinator: BufferCoordinator,
    fanout: Arc<StorageFanout>,
    writer: SharedDurableWriter,
    rotation: Arc<RotationManager>,
    background_stop: watch::Sender<bool>,
    background_tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl TurboCharger {
    /// Build the pipeline with sinks derived from configuration: Redis when
    /// `redis_url` is set and the `stream-redis` feature is enabled,
    /// otherwise an in-process stream; the archive lives in `archive_dir`,
    /// or `<data_dir>/archive` when unset.
    pub async fn from_config(
        config: TurboConfig,
        fetcher: Arc<dyn ReferenceFetcher>,
        metrics: SharedMetrics,
    ) -> Result<Self> {
        let stream = stream_from_config(&config).await?;
        let archive = archive_from_config(&config)?;
        Self::start(config, fetcher, stream, archive, metrics).await
    }

    /// Validate configuration, recover segments left by a previous run and
    /// spawn the background tasks.
    pub async fn start(
        config: TurboConfig,
        fetcher: Arc<dyn ReferenceFetcher>,
        stream: Arc<dyn StreamSink>,
        archive: SegmentArchive,
        metrics: SharedMetrics,
    ) -> Result<Self> {
        Self::launch(config, fetcher, stream, archive, None, metrics).await
    }

    /// Like [`start`](Self::start), with `durable` as the fan-out's durable
    /// tier. Segments are still opened, rotated and reported in stats.
    pub async fn start_with_durable(
        config: TurboConfig,
        fetcher: Arc<dyn ReferenceFetcher>,
        stream: Arc<dyn StreamSink>,
        archive: SegmentArchive,
        durable: Arc<dyn DurableSink>,
        metrics: SharedMetrics,
    ) -> Result<Self> {
        Self::launch(config, fetcher, stream, archive, Some(durable), metrics).await
    }

    async fn launch(
        config: TurboConfig,
        fetcher: Arc<dyn ReferenceFetcher>,
        stream: Arc<dyn StreamSink>,
        archive: SegmentArchive,
        durable: Option<Arc<dyn DurableSink>>,
        metrics: SharedMetrics,
    ) -> Result<Self> {
        config.validate()?;

        let stats = Arc::new(InMemoryMetrics::new());
        let metrics: SharedMetrics = Arc::new(CompositeMetrics::new(vec![stats.clone(), metrics]));

        let cache = Arc::new(HydrationCache::new(config.hydration.cache_capacity));
        let orchestrator = Arc::new(FetchOrchestrator::start(
            FetchOrchestratorConfig::from(&config.hydration),
            cache,
            fetcher,
            metrics.clone(),
        ));
        let hydrator = Hydrator::new(orchestrator.clone(), metrics.clone());

        let rotation_due = Arc::new(Notify::new());
        let writer: SharedDurableWriter = Arc::new(Mutex::new(
            DurableWriter::open(&config.storage, rotation_due.clone(), metrics.clone()).await?,
        ));
        let rotation = Arc::new(RotationManager::new(
            &config.storage,
            writer.clone(),
            archive,
            rotation_due,
            metrics.clone(),
        ));
        let recovered = rotation.recover().await?;
        if recovered.sealed + recovered.archived + recovered.reclaimed + recovered.failed > 0 {
            info!(
                sealed = recovered.sealed,
                archived = recovered.archived,
                reclaimed = recovered.reclaimed,
                failed = recovered.failed,
                "🔄 ROTATION: Startup recovery complete"
            );
        }

        let durable: Arc<dyn DurableSink> = match durable {
            Some(durable) => durable,
            None => writer.clone(),
        };
        let fanout = Arc::new(StorageFanout::new(&config.storage, durable, stream, metrics.clone()));
        fanout.start_stream_publisher(config.storage.stream_queue_bound);
        let coordinator = BufferCoordinator::spawn(&config.buffer, fanout.clone(), metrics.clone());

        let (background_stop, stop_rx) = watch::channel(false);
        let background_tasks = vec![
            tokio::spawn(rotation.clone().run(stop_rx.clone())),
            tokio::spawn(
                fanout
                    .clone()
                    .run_ledger_retries(config.storage.ledger_retry_interval(), stop_rx),
            ),
        ];

        info!(
            shard = config.shard.shard,
            modulo = config.shard.modulo,
            hydration_workers = config.hydration.hydration_workers,
            data_dir = %config.storage.data_dir.display(),
            "🚀 TURBOCHARGER: Pipeline started"
        );

        Ok(Self {
            shard: config.shard.spec(),
            config,
            stats,
            metrics,
            fetcher: orchestrator,
            hydrator,
            coordinator,
            fanout,
            writer,
            rotation,
            background_stop,
            background_tasks: parking_lot::Mutex::new(background_tasks),
        })
    }

    /// Pull, hydrate and submit events until the source ends or `shutdown`
    /// resolves, then drain and stop every stage. Returns the fatal error if
    /// the durable store halted the pipeline.
    pub async fn run<S, F>(&self, source: &mut S, shutdown: F) -> Result<()>
    where
        S: EventSource + ?Sized,
        F: Future<Output = ()> + Send,
    {
        let started = Instant::now();
        let workers = self.config.hydration.hydration_workers.max(1);
        let ingest_backoff = BackoffPolicy::new(INGEST_RETRY_BASE, INGEST_RETRY_MAX);
        let mut ingest_failures = 0u32;
        let mut in_flight = FuturesOrdered::new();
        let mut stats_ticker = tokio::time::interval(self.config.stats_interval());
        stats_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        stats_ticker.reset();

        let halted = self.coordinator.halted();
        tokio::pin!(halted);
        tokio::pin!(shutdown);

        let outcome: Result<()> = loop {
            tokio::select! {
                biased;
                error = &mut halted => break Err(error),
                _ = &mut shutdown => {
                    info!(in_flight = in_flight.len(), "🛑 TURBOCHARGER: Shutdown signal received");
                    break Ok(());
                }
                Some(record) = in_flight.next(), if !in_flight.is_empty() => {
                    if let Err(e) = self.coordinator.submit(record).await {
                        break Err(e);
                    }
                }
                _ = stats_ticker.tick() => self.report_stats().await,
                next = source.next(), if in_flight.len() < workers => match next {
                    Ok(Some(event)) => {
                        ingest_failures = 0;
                        self.metrics.increment_counter(names::EVENTS_INGESTED, 1);
                        if !self.shard.accepts(&event.subject) {
                            self.metrics.increment_counter(names::EVENTS_FILTERED, 1);
                            continue;
                        }
                        let hydrator = self.hydrator.clone();
                        in_flight.push_back(async move { hydrator.hydrate(event).await });
                    }
                    Ok(None) => {
                        info!("Event source ended");
                        break Ok(());
                    }
                    Err(e) => {
                        ingest_failures += 1;
                        self.metrics.increment_counter(names::INGEST_ERRORS, 1);
                        let delay = ingest_backoff.delay_for(ingest_failures);
                        warn!(error = %e, attempt = ingest_failures, retry_in_ms = delay.as_millis() as u64, "Ingest error, backing off");
                        tokio::select! {
                            biased;
                            _ = &mut shutdown => {
                                info!(in_flight = in_flight.len(), "🛑 TURBOCHARGER: Shutdown signal received during ingest backoff");
                                break Ok(());
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                },
            }
        };

        let outcome = match outcome {
            Ok(()) => self.drain(&mut in_flight).await,
            Err(e) => Err(e),
        };
        let outcome = self.stop(outcome).await;

        let stats = self.stats().await;
        log_pipeline_operation(
            "turbocharger",
            "run",
            if outcome.is_ok() { "completed" } else { "halted" },
            Some(stats.events_ingested as usize),
            Some(started.elapsed().as_millis() as u64),
            Some(&format!(
                "records_flushed={} batches_flushed={} failed_batches={}",
                stats.records_flushed, stats.batches_flushed, stats.failed_batches
            )),
        );
        outcome
    }

    /// Submit every in-flight hydration in order, then force the final flush.
    async fn drain<Fut>(&self, in_flight: &mut FuturesOrdered<Fut>) -> Result<()>
    where
        Fut: Future<Output = crate::models::EnrichedRecord>,
    {
        while let Some(record) = in_flight.next().await {
            self.coordinator.submit(record).await?;
        }
        self.coordinator.shutdown().await
    }

    async fn stop(&self, outcome: Result<()>) -> Result<()> {
        if let Err(e) = &outcome {
            log_error("turbocharger", "run", &e.to_string(), Some("halting ingest"));
            // flusher has already stopped; joins the task
            let _ = self.coordinator.shutdown().await;
        }
        self.fanout.stop_stream_publisher().await;

        self.background_stop.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = self.background_tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        self.fetcher.shutdown().await;

        if let Err(e) = self.writer.lock().await.checkpoint().await {
            warn!(error = %e, "Final segment checkpoint failed");
        }
        info!("✅ TURBOCHARGER: Pipeline stopped");
        outcome
    }

    pub async fn stats(&self) -> TurboStats {
        let cache = self.fetcher.cache().stats();
        let active_segment = self.writer.lock().await.active_segment().to_string();
        TurboStats {
            events_ingested: self.stats.counter(names::EVENTS_INGESTED),
            events_filtered: self.stats.counter(names::EVENTS_FILTERED),
            ingest_errors: self.stats.counter(names::INGEST_ERRORS),
            records_complete: self.stats.counter(names::RECORDS_COMPLETE),
            records_partial: self.stats.counter(names::RECORDS_PARTIAL),
            records_skipped: self.stats.counter(names::RECORDS_SKIPPED),
            batches_flushed: self.stats.counter(names::BATCHES_FLUSHED),
            records_flushed: self.stats.counter(names::RECORDS_FLUSHED),
            durable_write_failures: self.stats.counter(names::DURABLE_WRITE_FAILURES),
            stream_write_failures: self.stats.counter(names::STREAM_WRITE_FAILURES),
            failed_batches: self.fanout.failed_batches().len(),
            cache_hit_rate: cache.hit_rate(),
            cache_size: cache.size,
            pending_fetches: self.fetcher.pending_count(),
            active_segment,
        }
    }

    async fn report_stats(&self) {
        let stats = self.stats().await;
        self.metrics.set_gauge(names::CACHE_HIT_RATE, stats.cache_hit_rate);
        self.metrics.set_gauge(names::CACHE_SIZE, stats.cache_size as f64);
        info!(
            events_ingested = stats.events_ingested,
            events_filtered = stats.events_filtered,
            records_flushed = stats.records_flushed,
            records_partial = stats.records_partial,
            cache_hit_rate = stats.cache_hit_rate,
            cache_size = stats.cache_size,
            pending_fetches = stats.pending_fetches,
            failed_batches = stats.failed_batches,
            active_segment = %stats.active_segment,
            "📊 TURBOCHARGER: Pipeline stats"
        );
    }

    pub fn rotation(&self) -> &Arc<RotationManager> {
        &self.rotation
    }

    pub fn fanout(&self) -> &Arc<StorageFanout> {
        &self.fanout
    }

    pub fn config(&self) -> &TurboConfig {
        &self.config
    }
}

async fn stream_from_config(config: &TurboConfig) -> Result<Arc<dyn StreamSink>> {
    match &config.storage.redis_url {
        #[cfg(feature = "stream-redis")]
        Some(url) => Ok(Arc::new(
            crate::storage::RedisStream::connect(url, config.storage.stream_name.clone()).await?,
        )),
        #[cfg(not(feature = "stream-redis"))]
        Some(_) => Err(crate::error::TurboError::Configuration(
            "storage.redis_url is set but the stream-redis feature is disabled".to_string(),
        )),
        None => Ok(Arc::new(MemoryStream::new(config.storage.stream_name.clone()))),
    }
}

fn archive_from_config(config: &TurboConfig) -> Result<SegmentArchive> {
    let root = config
        .storage
        .archive_dir
        .clone()
        .unwrap_or_else(|| config.storage.data_dir.join("archive"));
    SegmentArchive::local(&root, config.storage.archive_prefix.clone())
}
