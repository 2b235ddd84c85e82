use super::orchestrator::{FetchOrchestrator, ResolveSource};
use crate::metrics::{names, SharedMetrics};
use crate::models::{
    extract_references, EnrichedRecord, HydrationStatus, MissingReference, ProcessingMetrics, RawEvent,
};
use chrono::Utc;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Turns raw events into enriched records. Reference failures become record
/// status, never errors.
#[derive(Clone)]
pub struct Hydrator {
    orchestrator: Arc<FetchOrchestrator>,
    metrics: SharedMetrics,
}

impl Hydrator {
    pub fn new(orchestrator: Arc<FetchOrchestrator>, metrics: SharedMetrics) -> Self {
        Self {
            orchestrator,
            metrics,
        }
    }

    pub async fn hydrate(&self, event: RawEvent) -> EnrichedRecord {
        let keys = extract_references(&event);
        if keys.is_empty() {
            self.metrics.increment_counter(names::RECORDS_SKIPPED, 1);
            return EnrichedRecord::skipped(event);
        }

        let started = Instant::now();
        let outcomes = join_all(keys.iter().map(|key| self.orchestrator.resolve_with_source(key))).await;

        let mut resolved = BTreeMap::new();
        let mut missing = Vec::new();
        let mut metrics = ProcessingMetrics::default();

        for (key, (source, outcome)) in keys.iter().zip(outcomes) {
            if source == ResolveSource::Cache {
                metrics.cache_hits += 1;
            } else {
                metrics.cache_misses += 1;
            }
            match outcome {
                Ok(payload) => {
                    resolved.insert(key.clone(), payload);
                }
                Err(e) => missing.push(MissingReference {
                    key: key.clone(),
                    reason: e.to_string(),
                }),
            }
        }

        let elapsed = started.elapsed();
        metrics.hydration_time_ms = elapsed.as_millis() as u64;
        let status = HydrationStatus::from_counts(keys.len(), missing.len());

        self.metrics.observe_latency(names::HYDRATION_LATENCY, elapsed);
        self.metrics
            .increment_counter(names::CACHE_HITS, u64::from(metrics.cache_hits));
        self.metrics
            .increment_counter(names::CACHE_MISSES, u64::from(metrics.cache_misses));
        let status_counter = match status {
            HydrationStatus::Complete => names::RECORDS_COMPLETE,
            HydrationStatus::Partial => names::RECORDS_PARTIAL,
            HydrationStatus::Skipped => names::RECORDS_SKIPPED,
        };
        self.metrics.increment_counter(status_counter, 1);

        if status == HydrationStatus::Partial {
            debug!(
                cursor = event.cursor,
                subject = %event.subject,
                missing = missing.len(),
                resolved = resolved.len(),
                "Emitting partially hydrated record"
            );
        }

        EnrichedRecord {
            event,
            status,
            resolved,
            missing,
            metrics,
            processed_at: Utc::now(),
        }
    }

    /// Hydrate several events concurrently, preserving input order.
    pub async fn hydrate_batch(&self, events: Vec<RawEvent>) -> Vec<EnrichedRecord> {
        join_all(events.into_iter().map(|event| self.hydrate(event))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::hydration::cache::HydrationCache;
    use crate::hydration::fetcher::{FetchFailure, FetchResults, ReferenceFetcher};
    use crate::hydration::orchestrator::FetchOrchestratorConfig;
    use crate::metrics::InMemoryMetrics;
    use crate::models::{EventKind, ReferenceKey};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    /// Resolves everything except actor keys for `did:plc:gone`
    struct DirectoryFetcher;

    #[async_trait]
    impl ReferenceFetcher for DirectoryFetcher {
        async fn fetch_batch(&self, keys: &[ReferenceKey]) -> Result<FetchResults> {
            Ok(keys
                .iter()
                .map(|key| {
                    let result = if key.id == "did:plc:gone" {
                        Err(FetchFailure::NotFound)
                    } else {
                        Ok(Arc::new(json!({ "id": key.id })))
                    };
                    (key.clone(), result)
                })
                .collect())
        }
    }

    fn hydrator() -> (Hydrator, Arc<InMemoryMetrics>) {
        let metrics = Arc::new(InMemoryMetrics::new());
        let config = FetchOrchestratorConfig {
            batch_timeout: Duration::from_millis(2),
            ..FetchOrchestratorConfig::default()
        };
        let orchestrator = FetchOrchestrator::start(
            config,
            Arc::new(HydrationCache::new(100)),
            Arc::new(DirectoryFetcher),
            metrics.clone(),
        );
        (Hydrator::new(Arc::new(orchestrator), metrics.clone()), metrics)
    }

    fn commit_event(cursor: u64, did: &str, mention: Option<&str>) -> RawEvent {
        let mut record = json!({ "text": "hi" });
        if let Some(mention) = mention {
            record["facets"] = json!([{ "features": [{ "did": mention }] }]);
        }
        let payload = json!({
            "did": did,
            "kind": "commit",
            "commit": { "operation": "create", "collection": "app.bsky.feed.post", "rkey": "r", "record": record }
        });
        RawEvent::new(cursor, EventKind::Create, did, serde_json::to_vec(&payload).unwrap())
    }

    #[tokio::test]
    async fn test_complete_record() {
        let (hydrator, metrics) = hydrator();
        let record = hydrator
            .hydrate(commit_event(1, "did:plc:author", Some("did:plc:friend")))
            .await;
        assert_eq!(record.status, HydrationStatus::Complete);
        assert_eq!(record.resolved.len(), 2);
        assert!(record.missing.is_empty());
        assert_eq!(record.metrics.cache_misses, 2);
        assert_eq!(metrics.counter(names::RECORDS_COMPLETE), 1);
    }

    #[tokio::test]
    async fn test_partial_record_lists_missing() {
        let (hydrator, _) = hydrator();
        let record = hydrator
            .hydrate(commit_event(2, "did:plc:author", Some("did:plc:gone")))
            .await;
        assert_eq!(record.status, HydrationStatus::Partial);
        assert_eq!(record.resolved.len(), 1);
        assert_eq!(record.missing.len(), 1);
        assert_eq!(record.missing[0].key, ReferenceKey::actor("did:plc:gone"));
    }

    #[tokio::test]
    async fn test_event_without_references_is_skipped() {
        let (hydrator, _) = hydrator();
        let event = RawEvent::new(3, EventKind::Delete, "did:plc:author", "{}");
        let record = hydrator.hydrate(event).await;
        assert_eq!(record.status, HydrationStatus::Skipped);
        assert!(record.resolved.is_empty());
    }

    #[tokio::test]
    async fn test_batch_preserves_order_and_uses_cache() {
        let (hydrator, _) = hydrator();
        let events = (1..=4)
            .map(|cursor| commit_event(cursor, "did:plc:author", None))
            .collect();
        let first = hydrator.hydrate_batch(events).await;
        assert_eq!(first.iter().map(|r| r.cursor()).collect::<Vec<_>>(), vec![1, 2, 3, 4]);

        let again = hydrator.hydrate(commit_event(5, "did:plc:author", None)).await;
        assert_eq!(again.metrics.cache_hits, 1);
    }
}
