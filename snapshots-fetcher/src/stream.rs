//! The ordered, resumable sequence of deployments of one content server.
//!
//! The sequence fuses two sources. First the server's bulk snapshot, if it holds anything at
//! or after the starting timestamp, then the paginated `/pointer-changes` feed from the
//! greatest timestamp seen so far on. Every valid deployment advances that timestamp, but
//! only those at or after the starting timestamp are yielded.
//!
//! The feed is queried inclusively, so a stream restarted from a previous stream's greatest
//! timestamp may yield the deployments at exactly that timestamp again.
use std::{pin::pin, sync::Arc};

use async_stream::try_stream;
use n0_future::{
    Stream, StreamExt,
    time::{self, Duration},
};
use nested_enum_utils::common_fields;
use snafu::{Backtrace, IntoError, ResultExt, Snafu};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    client::FetchError,
    downloader::{DownloadError, DownloadRequest, Downloader},
    job_queue::QueueError,
    processor::{self, ProcessError},
    storage::ContentStorage,
    types::RemoteDeployment,
};

/// Default wait between two passes over the change feed.
pub const DEFAULT_POINTER_CHANGES_WAIT_TIME: Duration = Duration::from_secs(5);

/// Options for [`deployments_stream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentStreamOptions {
    /// Timestamp to start at, inclusively.
    pub from_timestamp: u64,
    /// Wait between two passes over the change feed. Zero makes a single pass.
    pub pointer_changes_wait_time: Duration,
    /// Attempts for the snapshot requests.
    pub request_max_retries: usize,
    /// Wait between two attempts of the snapshot download.
    pub request_retry_wait_time: Duration,
    /// Whether to remove the snapshot file from storage once it was read.
    pub delete_snapshot_after_usage: bool,
}

impl Default for DeploymentStreamOptions {
    fn default() -> Self {
        Self {
            from_timestamp: 0,
            pointer_changes_wait_time: DEFAULT_POINTER_CHANGES_WAIT_TIME,
            request_max_retries: 10,
            request_retry_wait_time: Duration::from_secs(1),
            delete_snapshot_after_usage: true,
        }
    }
}

#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum StreamError {
    #[snafu(display("Request failed"))]
    Fetch { source: FetchError },
    #[snafu(display("Snapshot download failed"))]
    Download { source: Arc<DownloadError> },
    #[snafu(display("Reading the snapshot failed"))]
    Snapshot { source: ProcessError },
    #[snafu(display("Removing the snapshot failed"))]
    Storage { source: std::io::Error },
    #[snafu(display("Queued request failed"))]
    Queue { source: QueueError },
}

impl From<QueueError> for StreamError {
    fn from(source: QueueError) -> Self {
        QueueSnafu.into_error(source)
    }
}

/// Streams the deployments of `server`, starting at [`DeploymentStreamOptions::from_timestamp`].
///
/// Items are yielded in the order the server sends them, which is ascending by timestamp.
/// The stream is lazy: the next page is only requested once the previous one was consumed.
/// Unless the poll wait is zero the stream never ends; it keeps polling the change feed.
///
/// Request failures end the stream with an error; recovering is up to the caller, which
/// can restart the stream from the greatest timestamp it has seen. Malformed deployments
/// are logged and skipped.
pub fn deployments_stream<S: ContentStorage>(
    downloader: Downloader<S>,
    server: Url,
    options: DeploymentStreamOptions,
) -> impl Stream<Item = Result<RemoteDeployment, StreamError>> + Send + 'static {
    try_stream! {
        let genesis = options.from_timestamp;
        let mut greatest = genesis;
        let client = downloader.client();

        let snapshot = {
            let server = &server;
            downloader
                .queue()
                .schedule_job_with_retries(
                    || async move { client.global_snapshot(server).await.context(FetchSnafu) },
                    options.request_max_retries,
                )
                .await?
        };

        if snapshot.last_included_deployment_timestamp > genesis {
            info!(
                %server,
                hash = %snapshot.hash,
                last_included = snapshot.last_included_deployment_timestamp,
                "processing snapshot"
            );
            // bulk snapshot files are not verified
            let request = DownloadRequest {
                hash: snapshot.hash.clone(),
                target_key: snapshot.hash.clone(),
                servers: vec![server.clone()],
                max_retries: options.request_max_retries,
                retry_delay: options.request_retry_wait_time,
                verify: false,
            };
            downloader
                .download_with_retries(request)
                .await
                .context(DownloadSnafu)?;

            let mut deployments = pin!(processor::process_deployments_in_storage(
                downloader.storage(),
                &snapshot.hash
            ));
            while let Some(deployment) = deployments.next().await {
                let deployment = deployment.context(SnapshotSnafu)?;
                greatest = greatest.max(deployment.local_timestamp);
                if deployment.local_timestamp >= genesis {
                    yield deployment;
                }
            }

            if options.delete_snapshot_after_usage {
                downloader
                    .storage()
                    .delete(&[snapshot.hash.clone()])
                    .await
                    .context(StorageSnafu)?;
            }
        } else {
            debug!(
                %server,
                last_included = snapshot.last_included_deployment_timestamp,
                genesis,
                "snapshot holds nothing new, skipping it"
            );
        }

        loop {
            debug!(%server, from = greatest, "polling pointer changes");
            let mut deltas = pin!(client.pointer_changes(&server, greatest));
            while let Some(delta) = deltas.next().await {
                let delta = delta.context(FetchSnafu)?;
                match RemoteDeployment::from_value(delta) {
                    Ok(deployment) => {
                        greatest = greatest.max(deployment.local_timestamp);
                        if deployment.local_timestamp >= genesis {
                            yield deployment;
                        }
                    }
                    Err(err) => warn!(%server, "skipping invalid deployment: {err:#}"),
                }
            }
            if options.pointer_changes_wait_time.is_zero() {
                break;
            }
            time::sleep(options.pointer_changes_wait_time).await;
        }
    }
}
