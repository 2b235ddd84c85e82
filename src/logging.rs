//! # Structured Logging Module
//!
//! Environment-aware structured logging for the pipeline. Production emits
//! JSON lines; every other environment gets human-readable console output.
//! `RUST_LOG` overrides the environment's default level.

use chrono::Utc;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let log_level = get_log_level(&environment);
        let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level));

        let layer = if environment == "production" {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(false)
                .json()
                .with_filter(filter())
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(true)
                .with_filter(filter())
                .boxed()
        };

        // Embedding applications may already own the global subscriber
        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
        }

        tracing::info!(
            pid = std::process::id(),
            environment = %environment,
            level = %log_level,
            "🔧 STRUCTURED LOGGING: Initialized"
        );
    });
}

fn get_environment() -> String {
    std::env::var("TURBO_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

fn get_log_level(environment: &str) -> String {
    match environment {
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}

/// Log structured data for a pipeline stage
pub fn log_pipeline_operation(
    component: &str,
    operation: &str,
    status: &str,
    count: Option<usize>,
    duration_ms: Option<u64>,
    details: Option<&str>,
) {
    tracing::info!(
        component = %component,
        operation = %operation,
        status = %status,
        count = count,
        duration_ms = duration_ms,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "🚀 PIPELINE_OPERATION"
    );
}

/// Log structured data for segment lifecycle changes
pub fn log_segment_operation(
    operation: &str,
    segment_id: &str,
    state: &str,
    size_bytes: Option<u64>,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        segment_id = %segment_id,
        state = %state,
        size_bytes = size_bytes,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "💾 SEGMENT_OPERATION"
    );
}

/// Log error with full context
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context = context,
        timestamp = %Utc::now().to_rfc3339(),
        "❌ ERROR"
    );
}
