//! Deduplicated, verified downloads of content-addressed blobs.
//!
//! A [`Downloader`] fetches a blob from one of several servers that are known to have it,
//! verifies the content against its hash and publishes it into a [`ContentStorage`].
//!
//! All requests for the same target that overlap in time share a single download job, and
//! with it a single network fetch. The job is forgotten the moment it settles: a later
//! request for the same target starts a new job, which returns right away if the blob made
//! it into storage.
use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use futures_util::future::{FutureExt, Shared, try_join_all};
use n0_future::{
    boxed::BoxFuture,
    time::{self, Duration, Instant},
};
use nested_enum_utils::common_fields;
use rand::seq::SliceRandom;
use snafu::{Backtrace, IntoError, OptionExt, ResultExt, Snafu};
use tracing::{Instrument, debug, debug_span, info_span, trace, warn};
use url::Url;

use crate::{
    client::{ContentClient, FetchError},
    hash::{self, HashError},
    job_queue::{JobQueue, QueueError},
    metrics::Metrics,
    storage::ContentStorage,
    types::EntityManifest,
};

/// Default number of attempts per download.
pub const DEFAULT_MAX_RETRIES: usize = 10;

/// Default wait between two attempts of a download.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum DownloadError {
    #[snafu(display("No servers to download from"))]
    NoServers {},
    #[snafu(display("Entity {entity_id} not found"))]
    EntityNotFound { entity_id: String },
    #[snafu(display("Fetching content failed"))]
    Fetch { source: FetchError },
    #[snafu(display("Content verification failed"))]
    Hash { source: HashError },
    #[snafu(display("Queued download failed"))]
    Queue { source: QueueError },
    #[snafu(display("Content storage failed"))]
    Storage { source: std::io::Error },
    #[snafu(display("Temporary file handling failed"))]
    Io { source: std::io::Error },
    #[snafu(display("Download task failed"))]
    TaskFailed { source: tokio::task::JoinError },
}

impl DownloadError {
    /// Whether the content was downloaded but did not match its hash.
    pub fn is_hash_error(&self) -> bool {
        matches!(self, Self::Hash { .. })
    }
}

impl From<QueueError> for DownloadError {
    fn from(source: QueueError) -> Self {
        QueueSnafu.into_error(source)
    }
}

/// Outcome of a download, shared between everyone waiting for it.
pub type DownloadResult = Result<(), Arc<DownloadError>>;

type SharedDownload = Shared<BoxFuture<DownloadResult>>;

/// Options applying to downloads that do not specify their own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOptions {
    /// Total number of attempts of a download, at least one is made.
    pub max_retries: usize,
    /// Wait between two attempts.
    pub retry_delay: Duration,
    /// Directory for partial downloads.
    pub tmp_dir: PathBuf,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            tmp_dir: std::env::temp_dir().join("snapshots-fetcher"),
        }
    }
}

/// A single blob to download.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    /// Content address of the blob.
    pub hash: String,
    /// Storage id to publish the blob under. Requests are deduplicated by this key.
    pub target_key: String,
    /// Servers that have the blob.
    pub servers: Vec<Url>,
    /// Total number of attempts, at least one is made.
    pub max_retries: usize,
    /// Wait between two attempts.
    pub retry_delay: Duration,
    /// Whether to verify the content against `hash`.
    pub verify: bool,
}

impl DownloadRequest {
    /// A verified download of `hash`, stored under the hash itself.
    pub fn new(hash: impl Into<String>, servers: Vec<Url>, options: &DownloadOptions) -> Self {
        let hash = hash.into();
        Self {
            target_key: hash.clone(),
            hash,
            servers,
            max_retries: options.max_retries,
            retry_delay: options.retry_delay,
            verify: true,
        }
    }

    /// Skips hash verification.
    pub fn unverified(mut self) -> Self {
        self.verify = false;
        self
    }
}

/// Downloads content-addressed blobs into a [`ContentStorage`].
///
/// Cloning gives another handle to the same downloader, sharing in-flight downloads.
pub struct Downloader<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for Downloader<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<S> {
    client: ContentClient,
    storage: S,
    queue: JobQueue,
    options: DownloadOptions,
    metrics: Arc<Metrics>,
    in_flight: Mutex<HashMap<String, SharedDownload>>,
}

impl<S: fmt::Debug> fmt::Debug for Downloader<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let in_flight = self.inner.in_flight.lock().expect("poisoned").len();
        f.debug_struct("Downloader")
            .field("storage", &self.inner.storage)
            .field("options", &self.inner.options)
            .field("in_flight", &in_flight)
            .finish_non_exhaustive()
    }
}

impl<S: ContentStorage> Downloader<S> {
    /// Creates a downloader whose network transfers run on `queue`.
    pub fn new(
        client: ContentClient,
        storage: S,
        queue: JobQueue,
        options: DownloadOptions,
    ) -> Self {
        let metrics = client.metrics().clone();
        Self {
            inner: Arc::new(Inner {
                client,
                storage,
                queue,
                options,
                metrics,
                in_flight: Default::default(),
            }),
        }
    }

    /// The client used for all requests.
    pub fn client(&self) -> &ContentClient {
        &self.inner.client
    }

    /// The storage downloads are published to.
    pub fn storage(&self) -> &S {
        &self.inner.storage
    }

    /// The queue network transfers run on.
    pub fn queue(&self) -> &JobQueue {
        &self.inner.queue
    }

    /// The default download options.
    pub fn options(&self) -> &DownloadOptions {
        &self.inner.options
    }

    /// Number of downloads currently in flight.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.lock().expect("poisoned").len()
    }

    /// Downloads and verifies `hash` with the default options.
    pub async fn download_content(&self, hash: &str, servers: &[Url]) -> DownloadResult {
        let request = DownloadRequest::new(hash, servers.to_vec(), &self.inner.options);
        self.download_with_retries(request).await
    }

    /// Makes sure the requested blob is in storage, downloading it if needed.
    ///
    /// If a download for the same target is already in flight, waits for that one instead
    /// of starting another. The download itself runs in its own task and completes even
    /// if every caller stops waiting.
    pub async fn download_with_retries(&self, request: DownloadRequest) -> DownloadResult {
        let download = {
            let mut in_flight = self.inner.in_flight.lock().expect("poisoned");
            match in_flight.get(&request.target_key) {
                Some(download) => {
                    trace!(key = %request.target_key, "joining in-flight download");
                    download.clone()
                }
                None => {
                    let key = request.target_key.clone();
                    let download = self.spawn_job(request);
                    in_flight.insert(key, download.clone());
                    download
                }
            }
        };
        download.await
    }

    /// Must be called with the in-flight lock held, so the job cannot deregister before it
    /// was registered.
    fn spawn_job(&self, request: DownloadRequest) -> SharedDownload {
        let this = self.clone();
        let span = info_span!("download", hash = %request.hash);
        let task = tokio::spawn(
            async move {
                let res = this.run_job(&request).await.map_err(Arc::new);
                this.inner
                    .in_flight
                    .lock()
                    .expect("poisoned")
                    .remove(&request.target_key);
                res
            }
            .instrument(span),
        );
        let fut: BoxFuture<DownloadResult> = Box::pin(async move {
            match task.await {
                Ok(res) => res,
                Err(err) => Err(Arc::new(TaskFailedSnafu.into_error(err))),
            }
        });
        fut.shared()
    }

    async fn run_job(&self, request: &DownloadRequest) -> Result<(), DownloadError> {
        let storage = &self.inner.storage;
        if storage
            .exists(&request.target_key)
            .await
            .context(StorageSnafu)?
        {
            debug!("already in storage");
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.inner.options.tmp_dir)
            .await
            .context(IoSnafu)?;

        let max_attempts = request.max_retries.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            // uniform random choice spreads load across servers without shared state
            let server = request
                .servers
                .choose(&mut rand::thread_rng())
                .context(NoServersSnafu)?
                .clone();
            let span = debug_span!(
                "attempt",
                attempt,
                remote_server = %server.origin().ascii_serialization()
            );
            let res = self
                .inner
                .queue
                .schedule_job(|| self.download_once(&server, request))
                .instrument(span)
                .await;
            match res {
                Ok(()) => {
                    if attempt > 1 {
                        self.inner
                            .metrics
                            .download_job_retries
                            .inc_by(attempt as u64 - 1);
                    }
                    return Ok(());
                }
                Err(err) => {
                    self.inner.metrics.download_errors.inc();
                    if err.is_hash_error() {
                        // mismatches are final, other servers are not tried
                        self.inner.metrics.download_hash_errors.inc();
                        warn!(attempt, %server, "download failed verification: {err:#}");
                        return Err(err);
                    }
                    if attempt >= max_attempts {
                        warn!(attempt, max_attempts, %server, "download failed: {err:#}");
                        return Err(err);
                    }
                    debug!(attempt, max_attempts, %server, "download failed, retrying: {err:#}");
                    time::sleep(request.retry_delay).await;
                }
            }
        }
    }

    async fn download_once(
        &self,
        server: &Url,
        request: &DownloadRequest,
    ) -> Result<(), DownloadError> {
        // another job may have stored it in the meantime
        if self
            .inner
            .storage
            .exists(&request.target_key)
            .await
            .context(StorageSnafu)?
        {
            return Ok(());
        }
        let tmp = self.inner.options.tmp_dir.join(format!(
            "{}.{:016x}.part",
            request.hash,
            rand::random::<u64>()
        ));
        let res = self.fetch_and_publish(server, request, &tmp).await;
        match tokio::fs::remove_file(&tmp).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(tmp = %tmp.display(), "failed to remove temporary file: {err}"),
        }
        res
    }

    async fn fetch_and_publish(
        &self,
        server: &Url,
        request: &DownloadRequest,
        tmp: &Path,
    ) -> Result<(), DownloadError> {
        let start = Instant::now();
        let bytes = self
            .inner
            .client
            .download_content(server, &request.hash, tmp)
            .await
            .context(FetchSnafu)?;
        if request.verify {
            hash::verify_file(&request.hash, tmp)
                .await
                .context(HashSnafu)?;
        }
        let file = tokio::fs::File::open(tmp).await.context(IoSnafu)?;
        self.inner
            .storage
            .store(&request.target_key, file)
            .await
            .context(StorageSnafu)?;

        let metrics = &self.inner.metrics;
        metrics.download_bytes_total.inc_by(bytes);
        metrics
            .download_time_ms_total
            .inc_by(start.elapsed().as_millis() as u64);
        metrics.downloads_success.inc();
        debug!(bytes, elapsed = ?start.elapsed(), "downloaded");
        Ok(())
    }

    /// Downloads an entity file and every content file it references.
    ///
    /// The manifest is resolved from one of `servers`, then the entity file (whose hash is
    /// the entity id) is downloaded, then all content files concurrently. Returns the
    /// manifest once everything is in storage.
    pub async fn download_entity_and_content_files(
        &self,
        entity_id: &str,
        servers: &[Url],
    ) -> Result<EntityManifest, Arc<DownloadError>> {
        let manifest = self
            .entity_manifest(entity_id, servers)
            .await
            .map_err(Arc::new)?;
        self.download_content(entity_id, servers).await?;
        try_join_all(
            manifest
                .content
                .iter()
                .map(|content| self.download_content(&content.hash, servers)),
        )
        .await?;
        debug!(%entity_id, files = manifest.content.len(), "entity downloaded");
        Ok(manifest)
    }

    async fn entity_manifest(
        &self,
        entity_id: &str,
        servers: &[Url],
    ) -> Result<EntityManifest, DownloadError> {
        let server = servers
            .choose(&mut rand::thread_rng())
            .context(NoServersSnafu)?
            .clone();
        self.inner
            .client
            .entity_manifest(&server, entity_id)
            .await
            .context(FetchSnafu)?
            .context(EntityNotFoundSnafu { entity_id })
    }
}
