//! Metrics for content fetching and deployment streams.
//!
//! Metrics are not labelled per remote server; every stream and download runs inside a
//! tracing span carrying the `remote_server` field instead.
use iroh_metrics::{Counter, MetricsGroup};

/// Metrics tracked for downloads and deployment streams.
#[allow(missing_docs)]
#[derive(Debug, Default, MetricsGroup)]
#[metrics(name = "snapshots_fetcher")]
pub struct Metrics {
    /*
     * Content downloads
     */
    #[metrics(help = "Total number of content bytes downloaded.")]
    pub download_bytes_total: Counter,
    #[metrics(help = "Total time in ms spent downloading content.")]
    pub download_time_ms_total: Counter,
    #[metrics(help = "Number of successful content downloads.")]
    pub downloads_success: Counter,
    /// Failed download attempts, hash mismatches included.
    #[metrics(help = "Number of failed download attempts.")]
    pub download_errors: Counter,
    #[metrics(help = "Number of download attempts that failed hash verification.")]
    pub download_hash_errors: Counter,
    /// Retries of downloads that eventually succeeded.
    #[metrics(help = "Number of retries needed by successful downloads.")]
    pub download_job_retries: Counter,

    /*
     * Deployment streams
     */
    #[metrics(help = "Number of deployments handed to a handler.")]
    pub deployments_processed: Counter,
    #[metrics(help = "Number of pointer-changes pages requested.")]
    pub pointer_changes_requests: Counter,
    #[metrics(help = "Number of times a deployment stream was (re)connected.")]
    pub stream_reconnections: Counter,
    #[metrics(help = "Number of deployment stream runs that ended with an error.")]
    pub stream_failures: Counter,
}
