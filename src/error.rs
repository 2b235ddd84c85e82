//! # Pipeline Error Types
//!
//! Structured error taxonomy for the hydration and fan-out pipeline. Each
//! variant carries its own propagation policy: fetch errors are absorbed at
//! the hydrator, durable write errors halt ingest, streaming and archival
//! errors stay inside the storage layer.

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum TurboError {
    #[error("Transient fetch error for {key}: {message}")]
    TransientFetch { key: String, message: String },

    #[error("Permanent fetch error for {key} after {attempts} attempts: {message}")]
    PermanentFetch {
        key: String,
        attempts: u32,
        message: String,
    },

    #[error("Durable write error for batch {batch_id}: {message}")]
    DurableWrite { batch_id: String, message: String },

    #[error("Streaming write error for batch {batch_id}: {message}")]
    StreamingWrite { batch_id: String, message: String },

    #[error("Archival upload error for segment {segment_id}: {message}")]
    ArchivalUpload { segment_id: String, message: String },

    #[error("Shutdown in progress: {operation} rejected")]
    ShutdownInProgress { operation: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Ingest error: {0}")]
    Ingest(String),

    #[error("Database error: {operation}: {message}")]
    Database { operation: String, message: String },

    #[error("Object store error: {0}")]
    ObjectStore(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid segment transition for {segment_id}: {from} -> {to}")]
    InvalidTransition {
        segment_id: String,
        from: String,
        to: String,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TurboError {
    pub fn transient_fetch(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientFetch {
            key: key.into(),
            message: message.into(),
        }
    }

    pub fn permanent_fetch(key: impl Into<String>, attempts: u32, message: impl Into<String>) -> Self {
        Self::PermanentFetch {
            key: key.into(),
            attempts,
            message: message.into(),
        }
    }

    pub fn durable_write(batch_id: impl ToString, message: impl Into<String>) -> Self {
        Self::DurableWrite {
            batch_id: batch_id.to_string(),
            message: message.into(),
        }
    }

    pub fn streaming_write(batch_id: impl ToString, message: impl Into<String>) -> Self {
        Self::StreamingWrite {
            batch_id: batch_id.to_string(),
            message: message.into(),
        }
    }

    pub fn archival_upload(segment_id: impl ToString, message: impl Into<String>) -> Self {
        Self::ArchivalUpload {
            segment_id: segment_id.to_string(),
            message: message.into(),
        }
    }

    pub fn shutdown_in_progress(operation: impl Into<String>) -> Self {
        Self::ShutdownInProgress {
            operation: operation.into(),
        }
    }

    pub fn database(operation: impl Into<String>, error: impl std::fmt::Display) -> Self {
        Self::Database {
            operation: operation.into(),
            message: error.to_string(),
        }
    }

    /// Errors that a caller may retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientFetch { .. }
                | Self::ArchivalUpload { .. }
                | Self::StreamingWrite { .. }
                | Self::Database { .. }
                | Self::ObjectStore(_)
                | Self::Io(_)
        )
    }

    /// Errors that must halt ingest. Only an exhausted durable write qualifies.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DurableWrite { .. })
    }
}

impl From<sqlx::Error> for TurboError {
    fn from(err: sqlx::Error) -> Self {
        Self::database("sqlite", err)
    }
}

impl From<object_store::Error> for TurboError {
    fn from(err: object_store::Error) -> Self {
        Self::ObjectStore(err.to_string())
    }
}

impl From<std::io::Error> for TurboError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for TurboError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TurboError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_durable_write_is_fatal() {
        assert!(TurboError::durable_write("b1", "disk full").is_fatal());
        assert!(!TurboError::streaming_write("b1", "timeout").is_fatal());
        assert!(!TurboError::permanent_fetch("actor:9", 3, "404").is_fatal());
        assert!(!TurboError::shutdown_in_progress("resolve").is_fatal());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(TurboError::transient_fetch("post:1", "timeout").is_retryable());
        assert!(TurboError::archival_upload("seg", "503").is_retryable());
        assert!(!TurboError::permanent_fetch("post:1", 2, "gone").is_retryable());
        assert!(!TurboError::shutdown_in_progress("resolve").is_retryable());
        assert!(!TurboError::Configuration("bad".into()).is_retryable());
    }

    #[test]
    fn test_display_includes_context() {
        let err = TurboError::permanent_fetch("actor:9", 3, "not found");
        assert_eq!(
            err.to_string(),
            "Permanent fetch error for actor:9 after 3 attempts: not found"
        );
    }
}
