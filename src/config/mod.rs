//! # Configuration
//!
//! Typed configuration for the pipeline, loaded by [`loader::ConfigManager`]
//! from built-in defaults, an optional file and `TURBO_*` environment
//! variables.
//!
//! Durations are stored as integer `_ms` / `_seconds` fields and exposed as
//! [`Duration`] through accessor methods named after the option itself
//! (`batch_timeout_ms` is read through `batch_timeout()`).
//!
//! ```rust
//! use firehose_turbo::config::TurboConfig;
//!
//! let config = TurboConfig::default();
//! assert_eq!(config.hydration.max_batch_size, 25);
//! assert!(config.validate().is_ok());
//! ```

pub mod error;
pub mod loader;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

use crate::ingest::ShardSpec;
use crate::utils::serde::deserialize_optional_len;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TurboConfig {
    pub hydration: HydrationConfig,
    pub buffer: BufferConfig,
    pub storage: StorageConfig,
    pub shard: ShardConfig,
    pub stats_interval_seconds: u64,
}

impl Default for TurboConfig {
    fn default() -> Self {
        Self {
            hydration: HydrationConfig::default(),
            buffer: BufferConfig::default(),
            storage: StorageConfig::default(),
            shard: ShardConfig::default(),
            stats_interval_seconds: 30,
        }
    }
}

/// Cache and fetch orchestration settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HydrationConfig {
    pub max_batch_size: usize,
    pub batch_timeout_ms: u64,
    pub max_concurrent_fetches: usize,
    /// Retries after the first attempt
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub fetch_timeout_ms: u64,
    pub fetch_queue_bound: usize,
    pub cache_capacity: usize,
    pub cache_ttl_seconds: u64,
    pub negative_cache_ttl_seconds: u64,
    /// Hydrations in flight in the orchestrator loop
    pub hydration_workers: usize,
}

impl Default for HydrationConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 25,
            batch_timeout_ms: 200,
            max_concurrent_fetches: 8,
            max_retries: 3,
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 5_000,
            fetch_timeout_ms: 10_000,
            fetch_queue_bound: 4_096,
            cache_capacity: 20_000,
            cache_ttl_seconds: 3_600,
            negative_cache_ttl_seconds: 30,
            hydration_workers: 64,
        }
    }
}

impl HydrationConfig {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }

    pub fn negative_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.negative_cache_ttl_seconds)
    }
}

/// Output-side micro-batching
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BufferConfig {
    pub max_batch_records: usize,
    pub max_batch_age_ms: u64,
    pub backpressure_queue_bound: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_batch_records: 100,
            max_batch_age_ms: 1_000,
            backpressure_queue_bound: 1_000,
        }
    }
}

impl BufferConfig {
    pub fn max_batch_age(&self) -> Duration {
        Duration::from_millis(self.max_batch_age_ms)
    }
}

/// Durable segments, streaming sink and archival
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub segment_max_size_bytes: u64,
    pub segment_max_age_seconds: u64,
    pub durable_write_retries: u32,
    pub durable_write_timeout_ms: u64,
    pub stream_name: String,
    /// Streaming sink retention; `None` disables trimming
    #[serde(deserialize_with = "deserialize_optional_len")]
    pub stream_max_len: Option<usize>,
    pub stream_write_retries: u32,
    pub stream_write_timeout_ms: u64,
    pub redis_url: Option<String>,
    pub failed_batch_capacity: usize,
    pub archive_prefix: String,
    /// Local directory used as the archive object store when set
    pub archive_dir: Option<PathBuf>,
    pub archive_retry_base_delay_ms: u64,
    pub archive_retry_max_delay_ms: u64,
    pub rotation_check_interval_ms: u64,
    /// How long `reclaimed` markers stay on disk before they are pruned
    pub reclaimed_marker_retention_seconds: u64,
    /// Batches waiting for the stream publisher; overflow goes straight to
    /// the failure ledger
    pub stream_queue_bound: usize,
    pub ledger_retry_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data_store"),
            segment_max_size_bytes: 256 * 1024 * 1024,
            segment_max_age_seconds: 3_600,
            durable_write_retries: 3,
            durable_write_timeout_ms: 5_000,
            stream_name: "hydrated_jetstream".to_string(),
            stream_max_len: Some(100),
            stream_write_retries: 2,
            stream_write_timeout_ms: 2_000,
            redis_url: None,
            failed_batch_capacity: 256,
            archive_prefix: "segments".to_string(),
            archive_dir: None,
            archive_retry_base_delay_ms: 1_000,
            archive_retry_max_delay_ms: 60_000,
            rotation_check_interval_ms: 1_000,
            reclaimed_marker_retention_seconds: 86_400,
            stream_queue_bound: 64,
            ledger_retry_interval_ms: 5_000,
        }
    }
}

impl StorageConfig {
    pub fn segment_max_size(&self) -> u64 {
        self.segment_max_size_bytes
    }

    pub fn segment_max_age(&self) -> Duration {
        Duration::from_secs(self.segment_max_age_seconds)
    }

    pub fn durable_write_timeout(&self) -> Duration {
        Duration::from_millis(self.durable_write_timeout_ms)
    }

    pub fn stream_write_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_write_timeout_ms)
    }

    pub fn archive_retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.archive_retry_base_delay_ms)
    }

    pub fn archive_retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.archive_retry_max_delay_ms)
    }

    pub fn rotation_check_interval(&self) -> Duration {
        Duration::from_millis(self.rotation_check_interval_ms)
    }

    pub fn reclaimed_marker_retention(&self) -> Duration {
        Duration::from_secs(self.reclaimed_marker_retention_seconds)
    }

    pub fn ledger_retry_interval(&self) -> Duration {
        Duration::from_millis(self.ledger_retry_interval_ms)
    }
}

/// Static partitioning of the input stream
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ShardConfig {
    /// Instance count; 0 disables sharding
    pub modulo: u32,
    pub shard: u32,
}

impl ShardConfig {
    pub fn spec(&self) -> ShardSpec {
        ShardSpec::new(self.modulo, self.shard)
    }
}

impl TurboConfig {
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_seconds)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let positive_counts: [(&str, usize); 9] = [
            ("hydration.max_batch_size", self.hydration.max_batch_size),
            (
                "hydration.max_concurrent_fetches",
                self.hydration.max_concurrent_fetches,
            ),
            ("hydration.fetch_queue_bound", self.hydration.fetch_queue_bound),
            ("hydration.cache_capacity", self.hydration.cache_capacity),
            ("hydration.hydration_workers", self.hydration.hydration_workers),
            ("buffer.max_batch_records", self.buffer.max_batch_records),
            (
                "buffer.backpressure_queue_bound",
                self.buffer.backpressure_queue_bound,
            ),
            (
                "storage.failed_batch_capacity",
                self.storage.failed_batch_capacity,
            ),
            ("storage.stream_queue_bound", self.storage.stream_queue_bound),
        ];
        for (field, value) in positive_counts {
            if value == 0 {
                return Err(ConfigurationError::invalid_value(
                    field,
                    value,
                    "must be greater than 0",
                ));
            }
        }

        let positive_durations: [(&str, u64); 7] = [
            ("stats_interval_seconds", self.stats_interval_seconds),
            ("hydration.batch_timeout_ms", self.hydration.batch_timeout_ms),
            ("hydration.fetch_timeout_ms", self.hydration.fetch_timeout_ms),
            ("buffer.max_batch_age_ms", self.buffer.max_batch_age_ms),
            (
                "storage.durable_write_timeout_ms",
                self.storage.durable_write_timeout_ms,
            ),
            (
                "storage.rotation_check_interval_ms",
                self.storage.rotation_check_interval_ms,
            ),
            (
                "storage.ledger_retry_interval_ms",
                self.storage.ledger_retry_interval_ms,
            ),
        ];
        for (field, value) in positive_durations {
            if value == 0 {
                return Err(ConfigurationError::invalid_value(
                    field,
                    value,
                    "duration must be greater than 0",
                ));
            }
        }

        if self.hydration.retry_base_delay_ms > self.hydration.retry_max_delay_ms {
            return Err(ConfigurationError::invalid_value(
                "hydration.retry_base_delay_ms",
                self.hydration.retry_base_delay_ms,
                "must not exceed hydration.retry_max_delay_ms",
            ));
        }

        if self.storage.segment_max_size_bytes == 0 {
            return Err(ConfigurationError::invalid_value(
                "storage.segment_max_size_bytes",
                0,
                "segment size must be greater than 0",
            ));
        }

        if self.storage.stream_name.is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "storage.stream_name",
                "storage configuration",
            ));
        }

        if self.storage.archive_prefix.trim_matches('/').is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "storage.archive_prefix",
                "storage configuration",
            ));
        }

        if self.shard.modulo > 0 && self.shard.shard >= self.shard.modulo {
            return Err(ConfigurationError::invalid_value(
                "shard.shard",
                self.shard.shard,
                format!("must be less than shard.modulo ({})", self.shard.modulo),
            ));
        }

        Ok(())
    }
}
