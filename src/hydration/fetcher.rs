//! Boundary with the outbound clients that resolve references.

use crate::error::Result;
use crate::models::{Payload, ReferenceKey};
use async_trait::async_trait;
use std::collections::HashMap;

/// Per-key failure reported by a fetcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchFailure {
    /// Worth retrying: rate limits, timeouts, 5xx
    Transient(String),
    /// The object does not exist; cached negatively without retry
    NotFound,
}

impl std::fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient(message) => write!(f, "{message}"),
            Self::NotFound => write!(f, "not found"),
        }
    }
}

pub type FetchResults = HashMap<ReferenceKey, std::result::Result<Payload, FetchFailure>>;

/// Resolves a batch of references in one external call.
///
/// Keys missing from the returned map are treated as transient failures.
/// An `Err` fails every key in the batch transiently.
#[async_trait]
pub trait ReferenceFetcher: Send + Sync + 'static {
    async fn fetch_batch(&self, keys: &[ReferenceKey]) -> Result<FetchResults>;
}
