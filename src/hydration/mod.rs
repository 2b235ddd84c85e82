//! Hydration: the reference cache, the single-flight batched fetch
//! orchestrator, and the hydrator that turns raw events into enriched
//! records.

pub mod cache;
pub mod fetcher;
pub mod hydrator;
pub mod orchestrator;

pub use cache::{CacheEntry, CacheStats, CachedValue, HydrationCache};
pub use fetcher::{FetchFailure, FetchResults, ReferenceFetcher};
pub use hydrator::Hydrator;
pub use orchestrator::{FetchOrchestrator, FetchOrchestratorConfig, PendingFetch, ResolveSource};
