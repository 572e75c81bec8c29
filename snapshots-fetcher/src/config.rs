//! Serializable configuration of the fetcher components.
//!
//! Every section converts into the runtime options of one component. Durations are given
//! in milliseconds and field names are camel cased, so a section can be embedded as is in
//! a JSON service configuration.
use std::path::PathBuf;

use n0_future::time::Duration;
use serde::{Deserialize, Serialize};

use crate::{
    downloader::DownloadOptions, job_queue::JobQueueOptions, retry::RetryOptions,
    stream::DeploymentStreamOptions,
};

/// Configuration of all fetcher components.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Content downloads.
    #[serde(default)]
    pub download: DownloadConfig,
    /// The job queue network transfers run on.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Deployment streams.
    #[serde(default)]
    pub stream: StreamConfig,
    /// Reconnection of supervised deployment streams.
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Configuration of content downloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadConfig {
    /// Attempts per download.
    ///
    /// Defaults to `10`.
    #[serde(default = "cfg_defaults::request_max_retries")]
    pub request_max_retries: usize,
    /// Wait between two attempts, in milliseconds.
    ///
    /// Defaults to `1000`.
    #[serde(default = "cfg_defaults::request_retry_wait_time")]
    pub request_retry_wait_time: u64,
    /// Folder for partial downloads.
    ///
    /// Defaults to a folder in the system temp directory.
    pub tmp_folder: Option<PathBuf>,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            request_max_retries: cfg_defaults::request_max_retries(),
            request_retry_wait_time: cfg_defaults::request_retry_wait_time(),
            tmp_folder: None,
        }
    }
}

impl DownloadConfig {
    /// The [`DownloadOptions`] described by this section.
    pub fn options(&self) -> DownloadOptions {
        let defaults = DownloadOptions::default();
        DownloadOptions {
            max_retries: self.request_max_retries,
            retry_delay: Duration::from_millis(self.request_retry_wait_time),
            tmp_dir: self.tmp_folder.clone().unwrap_or(defaults.tmp_dir),
        }
    }
}

/// Configuration of the job queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    /// Maximum number of transfers running at the same time.
    ///
    /// Defaults to `10`.
    #[serde(default = "cfg_defaults::concurrency")]
    pub concurrency: usize,
    /// Time after which a single transfer is aborted, in milliseconds.
    ///
    /// Defaults to one minute. `null` disables the timeout.
    #[serde(default = "cfg_defaults::timeout")]
    pub timeout: Option<u64>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: cfg_defaults::concurrency(),
            timeout: cfg_defaults::timeout(),
        }
    }
}

impl QueueConfig {
    /// The [`JobQueueOptions`] described by this section.
    pub fn options(&self) -> JobQueueOptions {
        JobQueueOptions {
            concurrency: self.concurrency,
            timeout: self.timeout.map(Duration::from_millis),
        }
    }
}

/// Configuration of deployment streams.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamConfig {
    /// Timestamp the first connection starts at.
    #[serde(default)]
    pub from_timestamp: u64,
    /// Wait between two polls of the change feed, in milliseconds.
    ///
    /// Defaults to `5000`. `0` polls once and ends the stream.
    #[serde(default = "cfg_defaults::pointer_changes_wait_time")]
    pub pointer_changes_wait_time: u64,
    /// Attempts for the snapshot requests.
    ///
    /// Defaults to `10`.
    #[serde(default = "cfg_defaults::request_max_retries")]
    pub request_max_retries: usize,
    /// Wait between two attempts of the snapshot download, in milliseconds.
    ///
    /// Defaults to `1000`.
    #[serde(default = "cfg_defaults::request_retry_wait_time")]
    pub request_retry_wait_time: u64,
    /// Whether to remove snapshot files once they were read.
    ///
    /// Defaults to `true`.
    #[serde(default = "cfg_defaults::delete_snapshot_after_usage")]
    pub delete_snapshot_after_usage: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            from_timestamp: 0,
            pointer_changes_wait_time: cfg_defaults::pointer_changes_wait_time(),
            request_max_retries: cfg_defaults::request_max_retries(),
            request_retry_wait_time: cfg_defaults::request_retry_wait_time(),
            delete_snapshot_after_usage: cfg_defaults::delete_snapshot_after_usage(),
        }
    }
}

impl StreamConfig {
    /// The [`DeploymentStreamOptions`] described by this section.
    pub fn options(&self) -> DeploymentStreamOptions {
        DeploymentStreamOptions {
            from_timestamp: self.from_timestamp,
            pointer_changes_wait_time: Duration::from_millis(self.pointer_changes_wait_time),
            request_max_retries: self.request_max_retries,
            request_retry_wait_time: Duration::from_millis(self.request_retry_wait_time),
            delete_snapshot_after_usage: self.delete_snapshot_after_usage,
        }
    }
}

/// Configuration of the reconnection backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Delay before reconnecting, in milliseconds. `0` disables reconnecting.
    ///
    /// Defaults to `1000`.
    #[serde(default = "cfg_defaults::reconnect_time")]
    pub reconnect_time: u64,
    /// Factor the delay grows by after each failure.
    ///
    /// Defaults to `1.1`.
    #[serde(default = "cfg_defaults::reconnect_retry_time_exponent")]
    pub reconnect_retry_time_exponent: f32,
    /// Upper bound of the delay, in milliseconds.
    ///
    /// Defaults to one day.
    #[serde(default = "cfg_defaults::max_reconnection_time")]
    pub max_reconnection_time: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            reconnect_time: cfg_defaults::reconnect_time(),
            reconnect_retry_time_exponent: cfg_defaults::reconnect_retry_time_exponent(),
            max_reconnection_time: cfg_defaults::max_reconnection_time(),
        }
    }
}

impl RetryConfig {
    /// The [`RetryOptions`] described by this section.
    pub fn options(&self) -> RetryOptions {
        RetryOptions {
            retry_time: Duration::from_millis(self.reconnect_time),
            exponent: self.reconnect_retry_time_exponent,
            max_interval: Duration::from_millis(self.max_reconnection_time),
        }
    }
}

/// Defaults serde fills in for missing fields.
mod cfg_defaults {
    use crate::retry;

    pub(crate) fn request_max_retries() -> usize {
        10
    }

    pub(crate) fn request_retry_wait_time() -> u64 {
        1000
    }

    pub(crate) fn concurrency() -> usize {
        10
    }

    pub(crate) fn timeout() -> Option<u64> {
        Some(60_000)
    }

    pub(crate) fn pointer_changes_wait_time() -> u64 {
        5000
    }

    pub(crate) fn delete_snapshot_after_usage() -> bool {
        true
    }

    pub(crate) fn reconnect_time() -> u64 {
        1000
    }

    pub(crate) fn reconnect_retry_time_exponent() -> f32 {
        retry::DEFAULT_EXPONENT
    }

    pub(crate) fn max_reconnection_time() -> u64 {
        retry::DEFAULT_MAX_INTERVAL.as_millis() as u64
    }
}
