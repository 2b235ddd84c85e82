//! # Pipeline Metrics
//!
//! The pipeline reports through the [`MetricsRecorder`] trait and owns no
//! exporter. [`OtelMetrics`] forwards to the global OpenTelemetry meter
//! provider, [`InMemoryMetrics`] keeps values in process for stats snapshots
//! and tests, [`NoopMetrics`] discards everything.
//!
//! ```rust
//! use firehose_turbo::metrics::{names, InMemoryMetrics, MetricsRecorder};
//!
//! let metrics = InMemoryMetrics::new();
//! metrics.increment_counter(names::EVENTS_INGESTED, 3);
//! assert_eq!(metrics.counter(names::EVENTS_INGESTED), 3);
//! ```

use dashmap::DashMap;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use std::sync::Arc;
use std::time::Duration;

/// Metric names reported by the pipeline
pub mod names {
    pub const EVENTS_INGESTED: &str = "turbo.events.ingested";
    pub const EVENTS_FILTERED: &str = "turbo.events.filtered";
    pub const INGEST_ERRORS: &str = "turbo.ingest.errors";
    pub const RECORDS_COMPLETE: &str = "turbo.records.complete";
    pub const RECORDS_PARTIAL: &str = "turbo.records.partial";
    pub const RECORDS_SKIPPED: &str = "turbo.records.skipped";
    pub const HYDRATION_LATENCY: &str = "turbo.hydration.latency";
    pub const CACHE_HITS: &str = "turbo.cache.hits";
    pub const CACHE_MISSES: &str = "turbo.cache.misses";
    pub const CACHE_HIT_RATE: &str = "turbo.cache.hit_rate";
    pub const CACHE_SIZE: &str = "turbo.cache.size";
    pub const FETCH_BATCHES: &str = "turbo.fetch.batches";
    pub const FETCH_LATENCY: &str = "turbo.fetch.latency";
    pub const FETCH_RETRIES: &str = "turbo.fetch.retries";
    pub const FETCH_FAILURES: &str = "turbo.fetch.failures";
    pub const FETCH_SINGLE_FLIGHT_JOINS: &str = "turbo.fetch.single_flight_joins";
    pub const PENDING_FETCHES: &str = "turbo.fetch.pending";
    pub const BATCHES_FLUSHED: &str = "turbo.batches.flushed";
    pub const RECORDS_FLUSHED: &str = "turbo.records.flushed";
    pub const BATCH_FLUSH_LATENCY: &str = "turbo.batch.flush_latency";
    pub const DURABLE_WRITE_FAILURES: &str = "turbo.sink.durable.failures";
    pub const STREAM_WRITE_FAILURES: &str = "turbo.sink.stream.failures";
    pub const FAILED_BATCHES_DROPPED: &str = "turbo.sink.failed_batches.dropped";
    pub const SEGMENTS_SEALED: &str = "turbo.segments.sealed";
    pub const SEGMENTS_ARCHIVED: &str = "turbo.segments.archived";
    pub const SEGMENTS_RECLAIMED: &str = "turbo.segments.reclaimed";
    pub const ARCHIVE_UPLOAD_FAILURES: &str = "turbo.archive.upload_failures";
}

/// Boundary to whatever metrics backend the embedding process runs.
pub trait MetricsRecorder: Send + Sync {
    fn increment_counter(&self, name: &str, value: u64);
    fn observe_latency(&self, name: &str, duration: Duration);
    fn set_gauge(&self, name: &str, value: f64);
}

pub type SharedMetrics = Arc<dyn MetricsRecorder>;

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsRecorder for NoopMetrics {
    fn increment_counter(&self, _name: &str, _value: u64) {}
    fn observe_latency(&self, _name: &str, _duration: Duration) {}
    fn set_gauge(&self, _name: &str, _value: f64) {}
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct LatencySummary {
    pub count: u64,
    pub total: Duration,
    pub max: Duration,
}

impl LatencySummary {
    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            let nanos = self.total.as_nanos() / u128::from(self.count);
            Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
        }
    }
}

/// Process-local metrics store
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: DashMap<String, u64>,
    gauges: DashMap<String, f64>,
    latencies: DashMap<String, LatencySummary>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).map_or(0, |v| *v)
    }

    pub fn gauge(&self, name: &str) -> Option<f64> {
        self.gauges.get(name).map(|v| *v)
    }

    pub fn latency(&self, name: &str) -> LatencySummary {
        self.latencies.get(name).map(|v| *v).unwrap_or_default()
    }
}

impl MetricsRecorder for InMemoryMetrics {
    fn increment_counter(&self, name: &str, value: u64) {
        *self.counters.entry(name.to_string()).or_insert(0) += value;
    }

    fn observe_latency(&self, name: &str, duration: Duration) {
        let mut summary = self.latencies.entry(name.to_string()).or_default();
        summary.count += 1;
        summary.total += duration;
        summary.max = summary.max.max(duration);
    }

    fn set_gauge(&self, name: &str, value: f64) {
        self.gauges.insert(name.to_string(), value);
    }
}

/// Records into every wrapped recorder, e.g. an exporter plus the
/// in-memory store backing stats snapshots.
#[derive(Clone)]
pub struct CompositeMetrics {
    recorders: Vec<SharedMetrics>,
}

impl CompositeMetrics {
    pub fn new(recorders: Vec<SharedMetrics>) -> Self {
        Self { recorders }
    }
}

impl MetricsRecorder for CompositeMetrics {
    fn increment_counter(&self, name: &str, value: u64) {
        for recorder in &self.recorders {
            recorder.increment_counter(name, value);
        }
    }

    fn observe_latency(&self, name: &str, duration: Duration) {
        for recorder in &self.recorders {
            recorder.observe_latency(name, duration);
        }
    }

    fn set_gauge(&self, name: &str, value: f64) {
        for recorder in &self.recorders {
            recorder.set_gauge(name, value);
        }
    }
}

/// Forwards to the global OpenTelemetry meter provider. Instruments are
/// created on first use and cached by name.
pub struct OtelMetrics {
    meter: Meter,
    counters: DashMap<String, Counter<u64>>,
    histograms: DashMap<String, Histogram<f64>>,
    gauges: DashMap<String, Gauge<f64>>,
}

impl OtelMetrics {
    pub fn new() -> Self {
        Self::with_meter(opentelemetry::global::meter("firehose-turbo"))
    }

    pub fn with_meter(meter: Meter) -> Self {
        Self {
            meter,
            counters: DashMap::new(),
            histograms: DashMap::new(),
            gauges: DashMap::new(),
        }
    }
}

impl Default for OtelMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OtelMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OtelMetrics")
            .field("counters", &self.counters.len())
            .field("histograms", &self.histograms.len())
            .field("gauges", &self.gauges.len())
            .finish()
    }
}

impl MetricsRecorder for OtelMetrics {
    fn increment_counter(&self, name: &str, value: u64) {
        let counter = self
            .counters
            .entry(name.to_string())
            .or_insert_with(|| self.meter.u64_counter(name.to_string()).build());
        counter.add(value, &[]);
    }

    fn observe_latency(&self, name: &str, duration: Duration) {
        let histogram = self.histograms.entry(name.to_string()).or_insert_with(|| {
            self.meter
                .f64_histogram(name.to_string())
                .with_unit("ms")
                .build()
        });
        histogram.record(duration.as_secs_f64() * 1000.0, &[]);
    }

    fn set_gauge(&self, name: &str, value: f64) {
        let gauge = self
            .gauges
            .entry(name.to_string())
            .or_insert_with(|| self.meter.f64_gauge(name.to_string()).build());
        gauge.record(value, &[]);
    }
}
