//! Engine configuration via `livemerge.toml`
//!
//! The engine looks for a `livemerge.toml` in its image directory when
//! opened. A missing file means defaults; a present but invalid file is an
//! error rather than a silent fallback.

use std::path::Path;
use std::time::Duration;

use livemerge_concurrency::{Backoff, WaitOptions};
use livemerge_core::limits::is_valid_block_size;
use livemerge_core::{Error, Result, DEFAULT_BLOCK_SIZE};
use serde::{Deserialize, Serialize};

/// Config file name placed in the image directory.
pub const CONFIG_FILE_NAME: &str = "livemerge.toml";

/// Engine configuration loaded from `livemerge.toml`.
///
/// # Example
///
/// ```toml
/// block_size = 512
/// chunk_blocks = 64
/// default_bandwidth = 0
/// poll_interval_ms = 100
/// poll_timeout_ms = 10000
/// backoff = "fixed"
/// verify_after_job = false
/// retain_finished_jobs = 64
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Allocation granularity in bytes; a power of two.
    pub block_size: u64,
    /// Blocks copied per allocation-lock acquisition.
    pub chunk_blocks: u64,
    /// Bandwidth cap for jobs that do not set one, bytes/sec (0 = unlimited).
    pub default_bandwidth: u64,
    /// Delay between block-job status polls.
    pub poll_interval_ms: u64,
    /// Give up waiting for a block job after this long.
    pub poll_timeout_ms: u64,
    /// Delay growth between polls.
    pub backoff: Backoff,
    /// Validate the relinked chain before committing a job's transition.
    pub verify_after_job: bool,
    /// Finished jobs kept around for polling.
    pub retain_finished_jobs: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            chunk_blocks: 64,
            default_bandwidth: 0,
            poll_interval_ms: 100,
            poll_timeout_ms: 10_000,
            backoff: Backoff::Fixed,
            verify_after_job: false,
            retain_finished_jobs: 64,
        }
    }
}

impl EngineConfig {
    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !is_valid_block_size(self.block_size) {
            return Err(Error::Config(format!(
                "block_size {} must be a power of two between 512 bytes and 2 MiB",
                self.block_size
            )));
        }
        if self.chunk_blocks == 0 {
            return Err(Error::Config("chunk_blocks must be at least 1".to_string()));
        }
        if self.retain_finished_jobs == 0 {
            return Err(Error::Config(
                "retain_finished_jobs must be at least 1".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::Config(
                "poll_interval_ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Wait parameters for `wait_block_job`.
    pub fn wait_options(&self) -> WaitOptions {
        let interval = Duration::from_millis(self.poll_interval_ms);
        WaitOptions {
            interval,
            timeout: Duration::from_millis(self.poll_timeout_ms),
            backoff: self.backoff,
            max_interval: interval.saturating_mul(16),
        }
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# livemerge engine configuration
#
# Allocation granularity in bytes (power of two, 512 B - 2 MiB)
block_size = 512

# Blocks copied per allocation-lock acquisition
chunk_blocks = 64

# Bandwidth cap for jobs that do not set one, bytes/sec (0 = unlimited)
default_bandwidth = 0

# Block-job polling: interval, overall timeout, and "fixed" or "exponential" backoff
poll_interval_ms = 100
poll_timeout_ms = 10000
backoff = "fixed"

# Validate the relinked chain before a job completes (default: false)
verify_after_job = false

# Finished jobs kept for polling before being evicted
retain_finished_jobs = 64
"#
    }

    /// Read and parse config from a file path.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: EngineConfig = toml::from_str(&content).map_err(|e| {
            Error::Config(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load `livemerge.toml` from `dir`, or defaults if there is none.
    pub fn load_or_default(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE_NAME);
        if path.exists() {
            Self::from_file(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                Error::Config(format!(
                    "Failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            Error::Config(format!(
                "Failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }
}
