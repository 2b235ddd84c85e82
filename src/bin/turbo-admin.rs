//! # Turbo Admin
//!
//! Operator tool for the hydration pipeline: validate configuration, inspect
//! local segment lifecycle markers and restore archived segments.

use anyhow::Context;
use clap::{Parser, Subcommand};
use firehose_turbo::config::ConfigManager;
use firehose_turbo::storage::{SegmentArchive, SegmentId, SegmentMarker, SegmentStore};
use std::path::PathBuf;
use std::process;
use tracing::{error, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "turbo-admin")]
#[command(about = "Inspect and operate a firehose turbo deployment")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Verbose output level (use multiple times for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Load and validate configuration, then print it with secrets redacted
    ValidateConfig {
        /// Configuration file (default: TURBO_CONFIG_PATH or config/turbo.*)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// List segment markers in a data directory
    Segments {
        /// Segment directory (default: storage.data_dir from configuration)
        #[arg(short, long)]
        data_dir: Option<PathBuf>,
    },

    /// List segments present in a local archive
    Archived {
        #[arg(long)]
        archive_dir: PathBuf,

        #[arg(long, default_value = "segments")]
        prefix: String,
    },

    /// Download and decompress an archived segment
    Restore {
        #[arg(long)]
        archive_dir: PathBuf,

        #[arg(long, default_value = "segments")]
        prefix: String,

        /// Segment id, e.g. seg-0001718000000000-1a2b3c4d
        #[arg(short, long)]
        segment: String,

        /// Destination database file
        #[arg(short, long)]
        dest: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let _subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .try_init();

    let result = match cli.command {
        Commands::ValidateConfig { config } => validate_config(config).await,
        Commands::Segments { data_dir } => list_segments(data_dir).await,
        Commands::Archived {
            archive_dir,
            prefix,
        } => list_archived(archive_dir, prefix).await,
        Commands::Restore {
            archive_dir,
            prefix,
            segment,
            dest,
        } => restore(archive_dir, prefix, segment, dest).await,
    };

    if let Err(e) = result {
        error!("{e:#}");
        eprintln!("❌ {e:#}");
        process::exit(1);
    }
}

async fn validate_config(config: Option<PathBuf>) -> anyhow::Result<()> {
    let manager = load_config(config)?;
    println!("✅ Configuration valid (environment: {})", manager.environment());
    println!("{}", serde_json::to_string_pretty(&manager.debug_config())?);
    Ok(())
}

async fn list_segments(data_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let data_dir = match data_dir {
        Some(dir) => dir,
        None => load_config(None)?.config().storage.data_dir.clone(),
    };

    let markers = SegmentMarker::list(&data_dir)
        .await
        .with_context(|| format!("reading markers in {}", data_dir.display()))?;
    if markers.is_empty() {
        println!("No segments in {}", data_dir.display());
        return Ok(());
    }

    println!(
        "{:<36} {:<10} {:>10} {:>12} {:>8}  {}",
        "SEGMENT", "STATE", "RECORDS", "BYTES", "UPLOADS", "LAST ERROR"
    );
    for marker in markers {
        println!(
            "{:<36} {:<10} {:>10} {:>12} {:>8}  {}",
            marker.segment_id,
            marker.state,
            marker.record_count.map_or("-".to_string(), |n| n.to_string()),
            marker.size_bytes.map_or("-".to_string(), |n| n.to_string()),
            marker.upload_attempts,
            marker.last_error.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

async fn list_archived(archive_dir: PathBuf, prefix: String) -> anyhow::Result<()> {
    let archive = SegmentArchive::local(&archive_dir, prefix)?;
    let ids = archive.list().await?;
    println!("{} archived segment(s) in {}", ids.len(), archive_dir.display());
    for id in ids {
        println!("  {id}");
    }
    Ok(())
}

async fn restore(
    archive_dir: PathBuf,
    prefix: String,
    segment: String,
    dest: PathBuf,
) -> anyhow::Result<()> {
    let archive = SegmentArchive::local(&archive_dir, prefix)?;
    let id = SegmentId::from(segment.as_str());
    if !archive.exists(&id).await? {
        anyhow::bail!("segment {id} not found under {}", archive_dir.display());
    }

    let bytes = archive
        .restore(&id, &dest)
        .await
        .with_context(|| format!("restoring {id}"))?;
    let store = SegmentStore::open_existing(&dest)
        .await
        .with_context(|| format!("opening restored segment {}", dest.display()))?;
    let records = store.count_records().await?;
    store.checkpoint_and_close().await?;

    println!("✅ Restored {id} to {} ({bytes} bytes, {records} records)", dest.display());
    Ok(())
}

fn load_config(
    path: Option<PathBuf>,
) -> anyhow::Result<std::sync::Arc<ConfigManager>> {
    let manager = match path {
        Some(path) => ConfigManager::load_from(Some(&path), None),
        None => ConfigManager::load(),
    }
    .context("loading configuration")?;
    Ok(manager)
}
