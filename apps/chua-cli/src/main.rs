//! chua command-line uploader.

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chua_transfer::{
    EventSink, HttpProtocolClient, UploadCoordinator, UploadEvent, normalize_parallel,
    validate_chunk_size,
};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Uploads a file to a chua server in parallel chunks.
#[derive(Parser, Debug, Clone)]
#[command(name = "chua", version, about)]
struct Args {
    /// Server base URL (falls back to the config file).
    #[arg(short, long, env = "CHUA_BASE_URL")]
    base_url: Option<String>,

    /// Number of chunks uploaded concurrently (<= 0 means 1).
    #[arg(short, long, allow_negative_numbers = true)]
    parallel: Option<i64>,

    /// Chunk size in bytes.
    #[arg(short, long, allow_negative_numbers = true)]
    chunk_size: Option<i64>,

    /// Give up after this many seconds.
    #[arg(long)]
    deadline: Option<u64>,

    /// Path to the configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// File to upload.
    #[arg(short, long)]
    file: PathBuf,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    debug!(?args, "arguments parsed");

    let mut config = match &args.config {
        Some(path) => config::Config::load_from(path)?,
        None => config::Config::load()?,
    };
    if let Some(size) = args.chunk_size {
        config.upload.chunk_size = validate_chunk_size(size)?;
    }
    if let Some(parallel) = args.parallel {
        config.upload.parallel = normalize_parallel(parallel);
    }
    let deadline = args.deadline.or(config.deadline_secs);
    let base_url = args
        .base_url
        .clone()
        .or(config.base_url.clone())
        .context("no base URL given (use --base-url or set base_url in the config file)")?;

    let rt = tokio::runtime::Runtime::new()?;
    let session_id = rt.block_on(run(base_url, args.file.clone(), config.upload, deadline))?;

    println!("File {} uploaded (id: {session_id})", args.file.display());
    Ok(())
}

async fn run(
    base_url: String,
    file: PathBuf,
    upload: chua_transfer::UploadConfig,
    deadline: Option<u64>,
) -> anyhow::Result<chua_transfer::Uuid> {
    let client = HttpProtocolClient::new(&base_url, upload.request_timeout())?;
    let (events_tx, events_rx) = mpsc::channel(256);

    let mut coordinator =
        UploadCoordinator::new(Arc::new(client), upload).with_events(EventSink::new(events_tx));
    if let Some(secs) = deadline {
        coordinator = coordinator.with_deadline(Duration::from_secs(secs));
    }

    let cancel = coordinator.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling upload");
            cancel.cancel();
        }
    });
    let reporter = tokio::spawn(report_progress(events_rx));

    info!(file = %file.display(), base_url = %base_url, "starting upload");
    let result = coordinator.upload(&file).await;

    // Closes the event channel so the reporter drains and exits.
    drop(coordinator);
    let _ = reporter.await;

    result.with_context(|| format!("failed to upload {}", file.display()))
}

async fn report_progress(mut events: mpsc::Receiver<UploadEvent>) {
    while let Some(event) = events.recv().await {
        match &event {
            UploadEvent::SessionOpened {
                session_id,
                chunk_count,
                total_bytes,
                duplicated,
            } => info!(
                session = %session_id,
                chunks = chunk_count,
                bytes = total_bytes,
                duplicated,
                "session opened"
            ),
            UploadEvent::ChunkUploaded { index, .. } => {
                let percent = event.progress().unwrap_or_default() * 100.0;
                info!(index, progress = format_args!("{percent:.1}%"), "chunk uploaded");
            }
            UploadEvent::ChunkRetrying {
                index,
                attempt,
                delay,
                error,
            } => warn!(
                index,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying chunk"
            ),
            UploadEvent::ChunkStarted { .. }
            | UploadEvent::Completed { .. }
            | UploadEvent::Aborted { .. } => debug!(?event, "upload event"),
        }
    }
}
