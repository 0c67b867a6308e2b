//! Upload tuning knobs.
//!
//! Both structs deserialize from TOML with per-field defaults, so a config
//! file only needs to name what it changes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::DEFAULT_CHUNK_SIZE;

/// Per-chunk retry budget and backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts per chunk, the first one included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Backoff cap, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Multiplier for each subsequent retry.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Spread retries by ±25%.
    #[serde(default = "default_true")]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    250
}

fn default_max_delay_ms() -> u64 {
    15_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
            jitter: default_true(),
        }
    }
}

impl RetryPolicy {
    /// Attempt budget, never below one.
    pub fn budget(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay before retrying after failed attempt number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let ms = self.initial_delay_ms as f64 * self.backoff_factor.max(1.0).powi(exp);
        let capped = ms.min(self.max_delay_ms as f64);
        if !self.jitter {
            return Duration::from_secs_f64(capped / 1000.0);
        }
        let jitter = capped * 0.25;
        let offset = (std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos() as f64
            / u32::MAX as f64)
            * 2.0
            - 1.0; // [-1.0, 1.0)
        let with_jitter = (capped + jitter * offset).max(0.0);
        Duration::from_secs_f64(with_jitter / 1000.0)
    }
}

/// Upload configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Chunk size in bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Maximum concurrent chunk uploads (0 is treated as 1).
    #[serde(default = "default_parallel")]
    pub parallel: usize,

    /// Timeout for each HTTP round trip, in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// How long a cancelled upload waits for in-flight chunks, in seconds.
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,

    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

fn default_parallel() -> usize {
    4
}

fn default_request_timeout_secs() -> u64 {
    chua_protocol::constants::DEFAULT_REQUEST_TIMEOUT.as_secs()
}

fn default_cancel_grace_secs() -> u64 {
    30
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            parallel: default_parallel(),
            request_timeout_secs: default_request_timeout_secs(),
            cancel_grace_secs: default_cancel_grace_secs(),
            retry: RetryPolicy::default(),
        }
    }
}

impl UploadConfig {
    /// Parallelism with `0` normalized to `1`.
    pub fn effective_parallel(&self) -> usize {
        self.parallel.max(1)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }
}
