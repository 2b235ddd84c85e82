#![allow(clippy::doc_markdown)] // Allow technical terms like SQLite, AT-URI in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Firehose Turbo
//!
//! Hydration and fan-out pipeline for a social-graph firehose.
//!
//! ## Overview
//!
//! Raw firehose events reference objects that live elsewhere: the author's
//! profile, the post being replied to, a quoted post, mentioned accounts.
//! This crate resolves those references once, through a shared cache and a
//! batched single-flight fetcher, and writes the enriched result to three
//! storage tiers so downstream consumers never fetch them again.
//!
//! ## Architecture
//!
//! Leaves first:
//!
//! - [`hydration::HydrationCache`] - bounded LRU of resolved references with TTL
//! - [`hydration::FetchOrchestrator`] - single-flight, batched, rate-capped fetching
//! - [`hydration::Hydrator`] - raw event to enriched record
//! - [`turbocharger::BufferCoordinator`] - size-or-age micro-batching with backpressure
//! - [`storage::StorageFanout`] - durable SQLite segment plus streaming sink
//! - [`storage::RotationManager`] - segment sealing, archival and reclamation
//! - [`turbocharger::TurboCharger`] - lifecycle, draining and halting
//!
//! Data flows down this list. Control flows back up only as backpressure: a
//! full coordinator queue suspends the hydrators, which stops ingest.
//!
//! ## Delivery guarantees
//!
//! - Every record is emitted; failed references make it `partial`, never dropped
//! - Durable writes are at-least-once and idempotent per `(batch, index)`
//! - A durable write that exhausts its retries halts ingest
//! - Streaming is best effort; failed batches are kept in a bounded ledger
//! - Local segment files are deleted only after the archive confirms them
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use firehose_turbo::config::ConfigManager;
//! use firehose_turbo::hydration::{FetchResults, ReferenceFetcher};
//! use firehose_turbo::ingest::ChannelSource;
//! use firehose_turbo::metrics::OtelMetrics;
//! use firehose_turbo::models::ReferenceKey;
//! use firehose_turbo::turbocharger::TurboCharger;
//! use std::sync::Arc;
//!
//! struct AppViewFetcher;
//!
//! #[async_trait::async_trait]
//! impl ReferenceFetcher for AppViewFetcher {
//!     async fn fetch_batch(&self, _keys: &[ReferenceKey]) -> firehose_turbo::Result<FetchResults> {
//!         Ok(FetchResults::new())
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! firehose_turbo::logging::init_structured_logging();
//! let manager = ConfigManager::load()?;
//! let turbo = TurboCharger::from_config(
//!     manager.config().clone(),
//!     Arc::new(AppViewFetcher),
//!     Arc::new(OtelMetrics::new()),
//! )
//! .await?;
//!
//! let (_frames, mut source) = ChannelSource::channel(1024);
//! turbo
//!     .run(&mut source, async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod hydration;
pub mod ingest;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod storage;
pub mod turbocharger;
pub mod utils;

pub use config::{ConfigManager, TurboConfig};
pub use error::{Result, TurboError};
pub use turbocharger::{TurboCharger, TurboStats};
