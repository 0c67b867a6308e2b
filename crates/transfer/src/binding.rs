//! Blocking entry point for callers outside any async runtime.
//!
//! The runtime and the HTTP connection pool are process-wide and created on
//! first use. Each call blocks the calling thread until the upload finishes.

use std::sync::{Arc, LazyLock};

use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::HttpProtocolClient;
use crate::config::UploadConfig;
use crate::coordinator::UploadCoordinator;
use crate::planner::{normalize_parallel, validate_chunk_size};
use crate::{UploadError, UploadResult};

static RUNTIME: LazyLock<Result<Runtime, String>> = LazyLock::new(|| {
    debug!("starting upload runtime");
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("chua-upload")
        .build()
        .map_err(|e| e.to_string())
});

static HTTP_CLIENT: LazyLock<Result<reqwest::Client, String>> =
    LazyLock::new(|| reqwest::Client::builder().build().map_err(|e| e.to_string()));

/// Uploads the file at `path` to `base_url` and blocks until done.
///
/// `chunk_size <= 0` is rejected; `parallel <= 0` runs one chunk at a time.
pub fn upload(base_url: &str, path: &str, chunk_size: i64, parallel: i64) -> UploadResult {
    upload_with_cancel(base_url, path, chunk_size, parallel, CancellationToken::new())
}

/// Like [`upload`], cancellable from another thread through `cancel`.
pub fn upload_with_cancel(
    base_url: &str,
    path: &str,
    chunk_size: i64,
    parallel: i64,
    cancel: CancellationToken,
) -> UploadResult {
    let config = UploadConfig {
        chunk_size: validate_chunk_size(chunk_size)?,
        parallel: normalize_parallel(parallel),
        ..UploadConfig::default()
    };
    upload_with_config(base_url, path, config, cancel)
}

/// Blocking upload with full control over tuning.
pub fn upload_with_config(
    base_url: &str,
    path: &str,
    config: UploadConfig,
    cancel: CancellationToken,
) -> UploadResult {
    if tokio::runtime::Handle::try_current().is_ok() {
        return Err(UploadError::InvalidConfiguration(
            "blocking upload called from inside an async runtime".into(),
        ));
    }

    let runtime = RUNTIME
        .as_ref()
        .map_err(|e| UploadError::InvalidConfiguration(format!("upload runtime: {e}")))?;
    let http = HTTP_CLIENT
        .as_ref()
        .map_err(|e| UploadError::InvalidConfiguration(format!("HTTP client: {e}")))?
        .clone();

    let client = HttpProtocolClient::with_client(http, base_url, config.request_timeout())?;
    let coordinator = UploadCoordinator::new(Arc::new(client), config).with_cancel(cancel);
    runtime.block_on(coordinator.upload(path))
}
