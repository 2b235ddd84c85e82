//! # Fetch Orchestrator
//!
//! Resolves reference keys through the cache, collapsing concurrent misses
//! for the same key into one pending fetch and batching pending keys into
//! external calls.
//!
//! ```text
//!  resolve(k) ──► cache hit? ──yes──► payload
//!                    │ no
//!                    ▼
//!          pending[k] exists? ──yes──► subscribe, wait
//!                    │ no
//!                    ▼
//!     insert PendingFetch, enqueue k ──► [bounded queue] ──► batcher
//!                                                              │
//!             size or deadline reached, semaphore permit ◄─────┘
//!                    │
//!                    ▼
//!       fetch_batch(keys) ──► per key: cache, broadcast, remove
//!                               │ failure
//!                               ▼
//!                   backoff, re-enqueue (or negative cache)
//! ```
//!
//! Completion always populates the cache before the pending entry is
//! removed, and a new pending entry re-checks the cache under the registry
//! shard lock, so no caller can start a second fetch for a key whose result
//! was just published.

use super::cache::{CachedValue, HydrationCache};
use super::fetcher::{FetchFailure, ReferenceFetcher};
use crate::config::HydrationConfig;
use crate::error::{Result, TurboError};
use crate::metrics::{names, SharedMetrics};
use crate::models::{Payload, ReferenceKey};
use crate::utils::backoff::{BackoffPolicy, RetryState};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

type FetchOutcome = Result<Payload>;

/// How a resolve call obtained its result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveSource {
    Cache,
    /// Joined a fetch another caller had already started
    Joined,
    Fetched,
}

#[derive(Debug, Clone)]
pub struct FetchOrchestratorConfig {
    pub max_batch_size: usize,
    pub batch_timeout: Duration,
    pub max_concurrent_fetches: usize,
    /// Retries after the first attempt
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
    pub fetch_timeout: Duration,
    pub cache_ttl: Duration,
    pub negative_cache_ttl: Duration,
    pub queue_bound: usize,
}

impl From<&HydrationConfig> for FetchOrchestratorConfig {
    fn from(config: &HydrationConfig) -> Self {
        Self {
            max_batch_size: config.max_batch_size,
            batch_timeout: config.batch_timeout(),
            max_concurrent_fetches: config.max_concurrent_fetches,
            max_retries: config.max_retries,
            backoff: BackoffPolicy::new(config.retry_base_delay(), config.retry_max_delay()),
            fetch_timeout: config.fetch_timeout(),
            cache_ttl: config.cache_ttl(),
            negative_cache_ttl: config.negative_cache_ttl(),
            queue_bound: config.fetch_queue_bound,
        }
    }
}

impl Default for FetchOrchestratorConfig {
    fn default() -> Self {
        Self::from(&HydrationConfig::default())
    }
}

/// In-flight resolution of one key. Waiters subscribe to `completion`
/// while holding the registry guard, so the broadcast cannot be missed.
#[derive(Debug)]
pub struct PendingFetch {
    completion: watch::Sender<Option<FetchOutcome>>,
    waiters: AtomicUsize,
    retry: parking_lot::Mutex<RetryState>,
}

impl PendingFetch {
    fn new() -> (Self, watch::Receiver<Option<FetchOutcome>>) {
        let (completion, rx) = watch::channel(None);
        let pending = Self {
            completion,
            waiters: AtomicUsize::new(1),
            retry: parking_lot::Mutex::new(RetryState::new()),
        };
        (pending, rx)
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.load(Ordering::Relaxed)
    }

    pub fn attempts(&self) -> u32 {
        self.retry.lock().attempts
    }
}

struct Inner {
    config: FetchOrchestratorConfig,
    cache: Arc<HydrationCache>,
    fetcher: Arc<dyn ReferenceFetcher>,
    metrics: SharedMetrics,
    pending: DashMap<ReferenceKey, Arc<PendingFetch>>,
    queue_tx: mpsc::Sender<ReferenceKey>,
    semaphore: Arc<Semaphore>,
    shutting_down: AtomicBool,
    idle: Notify,
    stop_batcher: Notify,
}

pub struct FetchOrchestrator {
    inner: Arc<Inner>,
    batcher: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl FetchOrchestrator {
    /// Create the orchestrator and spawn its batcher on the current runtime.
    pub fn start(
        config: FetchOrchestratorConfig,
        cache: Arc<HydrationCache>,
        fetcher: Arc<dyn ReferenceFetcher>,
        metrics: SharedMetrics,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_bound.max(1));
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_fetches.max(1)));

        info!(
            max_batch_size = config.max_batch_size,
            batch_timeout_ms = config.batch_timeout.as_millis() as u64,
            max_concurrent_fetches = config.max_concurrent_fetches,
            max_retries = config.max_retries,
            "🔎 FETCH: Orchestrator started"
        );

        let inner = Arc::new(Inner {
            config,
            cache,
            fetcher,
            metrics,
            pending: DashMap::new(),
            queue_tx,
            semaphore,
            shutting_down: AtomicBool::new(false),
            idle: Notify::new(),
            stop_batcher: Notify::new(),
        });

        let batcher = tokio::spawn(Arc::clone(&inner).run_batcher(queue_rx));

        Self {
            inner,
            batcher: parking_lot::Mutex::new(Some(batcher)),
        }
    }

    /// Resolve one key to its payload.
    pub async fn resolve(&self, key: &ReferenceKey) -> Result<Payload> {
        self.resolve_with_source(key).await.1
    }

    /// Resolve one key, also reporting whether the cache answered.
    pub async fn resolve_with_source(&self, key: &ReferenceKey) -> (ResolveSource, Result<Payload>) {
        let inner = &self.inner;
        if inner.shutting_down.load(Ordering::Acquire) {
            return (
                ResolveSource::Fetched,
                Err(TurboError::shutdown_in_progress(format!("resolve {key}"))),
            );
        }

        if let Some(outcome) = inner.cached_outcome(key, true) {
            return (ResolveSource::Cache, outcome);
        }

        let (source, mut rx) = match inner.pending.entry(key.clone()) {
            Entry::Occupied(entry) => {
                entry.get().waiters.fetch_add(1, Ordering::Relaxed);
                inner.metrics.increment_counter(names::FETCH_SINGLE_FLIGHT_JOINS, 1);
                (ResolveSource::Joined, entry.get().completion.subscribe())
            }
            Entry::Vacant(entry) => {
                // A fetch may have completed between the cache check and here
                if let Some(outcome) = inner.cached_outcome(key, false) {
                    return (ResolveSource::Cache, outcome);
                }
                let (pending, rx) = PendingFetch::new();
                entry.insert(Arc::new(pending));
                (ResolveSource::Fetched, rx)
            }
        };

        if source == ResolveSource::Fetched {
            inner
                .metrics
                .set_gauge(names::PENDING_FETCHES, inner.pending.len() as f64);
            if inner.queue_tx.send(key.clone()).await.is_err() {
                inner.complete(key, Err(TurboError::shutdown_in_progress(format!("enqueue {key}"))));
            }
        }

        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(value) => value
                .clone()
                .unwrap_or_else(|| Err(TurboError::Internal(format!("empty completion for {key}")))),
            Err(_) => Err(TurboError::Internal(format!(
                "pending fetch for {key} dropped without completing"
            ))),
        };
        (source, outcome)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn cache(&self) -> &Arc<HydrationCache> {
        &self.inner.cache
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    /// Refuse new resolves, let every pending fetch finish, then stop the
    /// batcher. Anything still registered after the batcher exits is failed
    /// with `ShutdownInProgress`.
    #[instrument(skip(self), fields(pending = self.inner.pending.len()))]
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(pending = inner.pending.len(), "🛑 FETCH: Shutdown initiated, draining pending fetches");

        loop {
            let idle = inner.idle.notified();
            if inner.pending.is_empty() {
                break;
            }
            idle.await;
        }

        inner.stop_batcher.notify_one();
        let batcher = self.batcher.lock().take();
        if let Some(handle) = batcher {
            if let Err(e) = handle.await {
                warn!(error = %e, "Fetch batcher task ended abnormally");
            }
        }

        let stragglers: Vec<ReferenceKey> = inner.pending.iter().map(|e| e.key().clone()).collect();
        for key in stragglers {
            inner.complete(&key, Err(TurboError::shutdown_in_progress(format!("resolve {key}"))));
        }

        info!("✅ FETCH: Orchestrator stopped");
    }
}

impl Drop for FetchOrchestrator {
    fn drop(&mut self) {
        if let Some(handle) = self.batcher.lock().take() {
            handle.abort();
        }
    }
}

impl Inner {
    /// Cached result for `key`. `record` controls whether the lookup counts
    /// towards hit statistics and recency.
    fn cached_outcome(&self, key: &ReferenceKey, record: bool) -> Option<FetchOutcome> {
        let entry = if record {
            self.cache.get(key)
        } else {
            self.cache.peek(key)
        }?;
        Some(match entry.value {
            CachedValue::Resolved(payload) => Ok(payload),
            CachedValue::Failed(message) => Err(TurboError::permanent_fetch(
                key.to_string(),
                0,
                format!("negatively cached: {message}"),
            )),
        })
    }

    async fn run_batcher(self: Arc<Self>, mut queue_rx: mpsc::Receiver<ReferenceKey>) {
        debug!("Fetch batcher running");
        loop {
            let first = tokio::select! {
                biased;
                _ = self.stop_batcher.notified() => break,
                key = queue_rx.recv() => match key {
                    Some(key) => key,
                    None => break,
                },
            };

            let mut keys = vec![first];
            let deadline = Instant::now() + self.config.batch_timeout;
            while keys.len() < self.config.max_batch_size {
                match tokio::time::timeout_at(deadline, queue_rx.recv()).await {
                    Ok(Some(key)) => keys.push(key),
                    Ok(None) | Err(_) => break,
                }
            }

            let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let inner = Arc::clone(&self);
            tokio::spawn(async move {
                inner.execute_batch(keys).await;
                drop(permit);
            });
        }
        debug!("Fetch batcher stopped");
    }

    #[instrument(skip(self, keys), fields(batch_size = keys.len()))]
    async fn execute_batch(self: &Arc<Self>, keys: Vec<ReferenceKey>) {
        let started = std::time::Instant::now();
        let response =
            tokio::time::timeout(self.config.fetch_timeout, self.fetcher.fetch_batch(&keys)).await;
        let elapsed = started.elapsed();

        self.metrics.increment_counter(names::FETCH_BATCHES, 1);
        self.metrics.observe_latency(names::FETCH_LATENCY, elapsed);

        let (mut results, batch_error) = match response {
            Ok(Ok(results)) => (results, None),
            Ok(Err(e)) => (Default::default(), Some(e.to_string())),
            Err(_) => (
                Default::default(),
                Some(format!(
                    "fetch timed out after {}ms",
                    self.config.fetch_timeout.as_millis()
                )),
            ),
        };

        if let Some(error) = &batch_error {
            warn!(batch_size = keys.len(), error = %error, "Fetch batch failed");
        } else {
            debug!(
                batch_size = keys.len(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Fetch batch completed"
            );
        }

        for key in keys {
            match results.remove(&key) {
                Some(Ok(payload)) => {
                    self.cache
                        .put_resolved(key.clone(), Arc::clone(&payload), self.config.cache_ttl);
                    self.complete(&key, Ok(payload));
                }
                Some(Err(FetchFailure::NotFound)) => {
                    let attempts = self.record_attempt(&key);
                    self.fail_permanently(&key, attempts, "not found".to_string());
                }
                Some(Err(FetchFailure::Transient(message))) => self.retry_or_fail(key, message),
                None => {
                    let message = batch_error
                        .clone()
                        .unwrap_or_else(|| "missing from fetch response".to_string());
                    self.retry_or_fail(key, message);
                }
            }
        }
    }

    fn record_attempt(&self, key: &ReferenceKey) -> u32 {
        self.pending
            .get(key)
            .map(|pending| {
                let mut retry = pending.retry.lock();
                retry.attempts += 1;
                retry.attempts
            })
            .unwrap_or(1)
    }

    fn retry_or_fail(self: &Arc<Self>, key: ReferenceKey, message: String) {
        let Some(pending) = self.pending.get(&key).map(|p| Arc::clone(p.value())) else {
            return;
        };

        let (delay, attempts, exhausted) = {
            let mut retry = pending.retry.lock();
            let delay = retry.record_failure(&self.config.backoff, Instant::now(), message.clone());
            (delay, retry.attempts, !retry.can_retry(self.config.max_retries))
        };

        if exhausted {
            self.fail_permanently(&key, attempts, message);
            return;
        }

        self.metrics.increment_counter(names::FETCH_RETRIES, 1);
        debug!(
            key = %key,
            attempt = attempts,
            backoff_ms = delay.as_millis() as u64,
            error = %message,
            "Retrying fetch after backoff"
        );

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if inner.queue_tx.send(key.clone()).await.is_err() {
                inner.complete(&key, Err(TurboError::shutdown_in_progress(format!("retry {key}"))));
            }
        });
    }

    fn fail_permanently(&self, key: &ReferenceKey, attempts: u32, message: String) {
        warn!(key = %key, attempts, error = %message, "Fetch failed permanently");
        self.metrics.increment_counter(names::FETCH_FAILURES, 1);
        self.cache
            .put_failed(key.clone(), message.clone(), self.config.negative_cache_ttl);
        self.complete(key, Err(TurboError::permanent_fetch(key.to_string(), attempts, message)));
    }

    /// Broadcast the outcome to every waiter and retire the pending entry.
    fn complete(&self, key: &ReferenceKey, outcome: FetchOutcome) {
        if let Some((_, pending)) = self.pending.remove(key) {
            pending.completion.send_replace(Some(outcome));
        }
        self.metrics
            .set_gauge(names::PENDING_FETCHES, self.pending.len() as f64);
        if self.pending.is_empty() {
            self.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hydration::fetcher::FetchResults;
    use crate::metrics::InMemoryMetrics;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    /// Resolves every key to `{"key": <key>}` after a delay, failing the
    /// first `failures` calls per key.
    struct ScriptedFetcher {
        delay: Duration,
        failures: u32,
        calls: AtomicU32,
        per_key_calls: DashMap<ReferenceKey, u32>,
    }

    impl ScriptedFetcher {
        fn new(delay: Duration, failures: u32) -> Arc<Self> {
            Arc::new(Self {
                delay,
                failures,
                calls: AtomicU32::new(0),
                per_key_calls: DashMap::new(),
            })
        }
    }

    #[async_trait]
    impl ReferenceFetcher for ScriptedFetcher {
        async fn fetch_batch(&self, keys: &[ReferenceKey]) -> Result<FetchResults> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            let mut results = FetchResults::new();
            for key in keys {
                let mut count = self.per_key_calls.entry(key.clone()).or_insert(0);
                *count += 1;
                if *count <= self.failures {
                    results.insert(key.clone(), Err(FetchFailure::Transient("503".into())));
                } else {
                    results.insert(
                        key.clone(),
                        Ok(Arc::new(serde_json::json!({ "key": key.to_string() }))),
                    );
                }
            }
            Ok(results)
        }
    }

    fn config(max_retries: u32) -> FetchOrchestratorConfig {
        FetchOrchestratorConfig {
            max_batch_size: 10,
            batch_timeout: Duration::from_millis(5),
            max_concurrent_fetches: 2,
            max_retries,
            backoff: BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(4)),
            fetch_timeout: Duration::from_secs(1),
            cache_ttl: Duration::from_secs(60),
            negative_cache_ttl: Duration::from_secs(5),
            queue_bound: 64,
        }
    }

    fn orchestrator(fetcher: Arc<ScriptedFetcher>, max_retries: u32) -> FetchOrchestrator {
        FetchOrchestrator::start(
            config(max_retries),
            Arc::new(HydrationCache::new(100)),
            fetcher,
            Arc::new(InMemoryMetrics::new()),
        )
    }

    #[tokio::test]
    async fn test_concurrent_resolves_share_one_fetch() {
        let fetcher = ScriptedFetcher::new(Duration::from_millis(50), 0);
        let orchestrator = Arc::new(orchestrator(Arc::clone(&fetcher), 3));
        let key = ReferenceKey::post("123");

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let orchestrator = Arc::clone(&orchestrator);
                let key = key.clone();
                tokio::spawn(async move { orchestrator.resolve(&key).await })
            })
            .collect();

        let mut payloads = Vec::new();
        for handle in handles {
            payloads.push(handle.await.unwrap().unwrap());
        }
        assert!(payloads.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(orchestrator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_second_resolve_is_served_from_cache() {
        let fetcher = ScriptedFetcher::new(Duration::ZERO, 0);
        let orchestrator = orchestrator(Arc::clone(&fetcher), 3);
        let key = ReferenceKey::actor("did:plc:a");

        let (source, first) = orchestrator.resolve_with_source(&key).await;
        assert_eq!(source, ResolveSource::Fetched);
        let (source, second) = orchestrator.resolve_with_source(&key).await;
        assert_eq!(source, ResolveSource::Cache);
        assert_eq!(first.unwrap(), second.unwrap());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let fetcher = ScriptedFetcher::new(Duration::ZERO, 2);
        let orchestrator = orchestrator(Arc::clone(&fetcher), 3);

        let payload = orchestrator.resolve(&ReferenceKey::actor("9")).await.unwrap();
        assert_eq!(payload["key"], "actor:9");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_are_cached_negatively() {
        let fetcher = ScriptedFetcher::new(Duration::ZERO, u32::MAX);
        let orchestrator = orchestrator(Arc::clone(&fetcher), 2);
        let key = ReferenceKey::actor("9");

        let err = orchestrator.resolve(&key).await.unwrap_err();
        assert!(matches!(err, TurboError::PermanentFetch { attempts: 3, .. }));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);

        // served from the negative cache without another call
        let err = orchestrator.resolve(&key).await.unwrap_err();
        assert!(matches!(err, TurboError::PermanentFetch { .. }));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_sibling_keys_resolve_independently() {
        struct HalfBroken;

        #[async_trait]
        impl ReferenceFetcher for HalfBroken {
            async fn fetch_batch(&self, keys: &[ReferenceKey]) -> Result<FetchResults> {
                Ok(keys
                    .iter()
                    .map(|key| {
                        let result = if key.id == "bad" {
                            Err(FetchFailure::NotFound)
                        } else {
                            Ok(Arc::new(serde_json::json!(key.id)))
                        };
                        (key.clone(), result)
                    })
                    .collect())
            }
        }

        let orchestrator = FetchOrchestrator::start(
            config(1),
            Arc::new(HydrationCache::new(100)),
            Arc::new(HalfBroken),
            Arc::new(InMemoryMetrics::new()),
        );
        let good = ReferenceKey::post("good");
        let bad = ReferenceKey::post("bad");
        let (good_result, bad_result) =
            tokio::join!(orchestrator.resolve(&good), orchestrator.resolve(&bad));
        assert!(good_result.is_ok());
        assert!(matches!(bad_result, Err(TurboError::PermanentFetch { .. })));
    }

    #[tokio::test]
    async fn test_resolve_after_shutdown_is_rejected() {
        let fetcher = ScriptedFetcher::new(Duration::ZERO, 0);
        let orchestrator = orchestrator(fetcher, 3);
        orchestrator.shutdown().await;

        let err = orchestrator.resolve(&ReferenceKey::post("1")).await.unwrap_err();
        assert!(matches!(err, TurboError::ShutdownInProgress { .. }));
    }

    #[tokio::test]
    async fn test_shutdown_lets_pending_fetches_finish() {
        let fetcher = ScriptedFetcher::new(Duration::from_millis(30), 0);
        let orchestrator = Arc::new(orchestrator(Arc::clone(&fetcher), 3));

        let waiter = {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move { orchestrator.resolve(&ReferenceKey::post("slow")).await })
        };
        // let the resolve register before shutting down
        while orchestrator.pending_count() == 0 {
            tokio::task::yield_now().await;
        }

        orchestrator.shutdown().await;
        assert!(waiter.await.unwrap().is_ok());
        assert_eq!(orchestrator.pending_count(), 0);
    }
}
