//! A self-healing deployment subscription for one server.
//!
//! [`DeploymentStream`] runs [`deployments_stream`] inside a [`RetryLoop`] and hands every
//! deployment to a [`DeploymentHandler`]. When the stream or the handler fails, the loop
//! backs off and reconnects from the greatest timestamp handled so far.
use std::{
    error::Error,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use n0_future::StreamExt;
use nested_enum_utils::common_fields;
use snafu::{Backtrace, IntoError, ResultExt, Snafu};
use tokio::sync::watch;
use tracing::{Instrument, debug, info_span, trace};
use url::Url;

use crate::{
    downloader::Downloader,
    job_manager::ManagedJob,
    metrics::Metrics,
    retry::{RetryLoop, RetryOptions},
    storage::ContentStorage,
    stream::{DeploymentStreamOptions, StreamError, deployments_stream},
    types::RemoteDeployment,
};

/// Consumes the deployments of a [`DeploymentStream`].
///
/// Delivery is at-least-once. After a reconnect the deployments at the resumption timestamp
/// are delivered again, so handling must be idempotent.
pub trait DeploymentHandler: Send + Sync + 'static {
    /// The error returned when handling fails. It makes the stream reconnect.
    type Error: Error + Send + Sync + 'static;

    /// Handles one deployment received from `servers`.
    fn handle(
        &self,
        deployment: RemoteDeployment,
        servers: Vec<Url>,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum SupervisedStreamError {
    #[snafu(display("Deployment stream failed"))]
    Stream { source: StreamError },
    #[snafu(display("Handling deployment {entity_id} failed"))]
    Handler {
        entity_id: String,
        source: Box<dyn Error + Send + Sync + 'static>,
    },
}

/// A forever running, checkpointed subscription to the deployments of one server.
#[derive(Debug, Clone)]
pub struct DeploymentStream {
    server: Url,
    retry: RetryLoop,
    watermark: Arc<AtomicU64>,
    stopped: Arc<watch::Sender<bool>>,
}

/// What one run of the retry loop needs.
struct Subscription<S, H> {
    downloader: Downloader<S>,
    server: Url,
    options: DeploymentStreamOptions,
    handler: Arc<H>,
    watermark: Arc<AtomicU64>,
    stopped: Arc<watch::Sender<bool>>,
    metrics: Arc<Metrics>,
}

impl DeploymentStream {
    /// Creates a stopped stream of the deployments of `server`.
    ///
    /// The first connection starts at [`DeploymentStreamOptions::from_timestamp`], every
    /// reconnection at the greatest timestamp handled so far.
    pub fn new<S, H>(
        downloader: Downloader<S>,
        server: Url,
        stream_options: DeploymentStreamOptions,
        retry_options: RetryOptions,
        handler: Arc<H>,
    ) -> Self
    where
        S: ContentStorage,
        H: DeploymentHandler,
    {
        let watermark = Arc::new(AtomicU64::new(stream_options.from_timestamp));
        let stopped = Arc::new(watch::Sender::new(true));
        let metrics = downloader.client().metrics().clone();
        let subscription = Arc::new(Subscription {
            downloader,
            server: server.clone(),
            options: stream_options,
            handler,
            watermark: watermark.clone(),
            stopped: stopped.clone(),
            metrics,
        });
        let retry = RetryLoop::new(retry_options, move || {
            let subscription = subscription.clone();
            let span = info_span!(
                "deployment_stream",
                remote_server = %subscription.server.origin().ascii_serialization()
            );
            async move { subscription.run().await }.instrument(span)
        });
        Self {
            server,
            retry,
            watermark,
            stopped,
        }
    }

    /// The server this stream follows.
    pub fn server(&self) -> &Url {
        &self.server
    }

    /// Runs the subscription until [`DeploymentStream::stop`] is called.
    pub async fn start(&self) {
        self.stopped.send_replace(false);
        self.retry.start().await;
    }

    /// Stops the subscription.
    ///
    /// No further deployment is handed to the handler, but one that is being handled
    /// finishes. A connection waiting for the next deployment is closed right away.
    pub fn stop(&self) {
        self.stopped.send_replace(true);
        self.retry.stop();
    }

    /// Whether the subscription is stopped.
    pub fn is_stopped(&self) -> bool {
        self.retry.is_stopped()
    }

    /// Number of connections made, the first one included.
    pub fn retry_count(&self) -> u64 {
        self.retry.retry_count()
    }

    /// The greatest timestamp of the deployments handled so far.
    pub fn greatest_processed_timestamp(&self) -> u64 {
        self.watermark.load(Ordering::SeqCst)
    }
}

impl ManagedJob for DeploymentStream {
    async fn start(&self) {
        DeploymentStream::start(self).await
    }

    async fn stop(&self) {
        DeploymentStream::stop(self)
    }
}

impl<S: ContentStorage, H: DeploymentHandler> Subscription<S, H> {
    async fn run(&self) -> Result<(), SupervisedStreamError> {
        self.metrics.stream_reconnections.inc();
        let res = self.consume().await;
        if res.is_err() {
            self.metrics.stream_failures.inc();
        }
        res
    }

    async fn consume(&self) -> Result<(), SupervisedStreamError> {
        let options = DeploymentStreamOptions {
            from_timestamp: self.watermark.load(Ordering::SeqCst),
            ..self.options.clone()
        };
        debug!(from = options.from_timestamp, "connecting");
        let mut deployments = std::pin::pin!(deployments_stream(
            self.downloader.clone(),
            self.server.clone(),
            options
        ));
        let mut stopped = self.stopped.subscribe();
        loop {
            let next = tokio::select! {
                biased;
                _ = async { let _ = stopped.wait_for(|stopped| *stopped).await; } => None,
                next = deployments.next() => Some(next),
            };
            let deployment = match next {
                None => {
                    debug!("stopped, disconnecting");
                    return Ok(());
                }
                Some(None) => break,
                Some(Some(deployment)) => deployment.context(StreamSnafu)?,
            };
            let timestamp = deployment.local_timestamp;
            let entity_id = deployment.entity_id.clone();
            if let Err(err) = self
                .handler
                .handle(deployment, vec![self.server.clone()])
                .await
            {
                let source: Box<dyn Error + Send + Sync + 'static> = Box::new(err);
                return Err(HandlerSnafu { entity_id }.into_error(source));
            }
            self.metrics.deployments_processed.inc();
            let previous = self.watermark.fetch_max(timestamp, Ordering::SeqCst);
            trace!(%entity_id, timestamp, previous, "deployment handled");
        }
        debug!("deployment stream ended");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{Mutex, atomic::AtomicBool},
    };

    use axum::{Router, extract::Query, routing::get};
    use n0_future::time::{self, Duration};
    use serde_json::json;
    use tokio::sync::mpsc;
    use tracing_test::traced_test;

    use super::*;
    use crate::{
        client::ContentClient,
        downloader::DownloadOptions,
        job_queue::{JobQueue, JobQueueOptions},
        storage::MemStorage,
        test_utils::{ContentServer, deployment_json},
    };

    /// Records every call, fails once on `fail_at` and signals on `signal_at`.
    #[derive(Debug, Default)]
    struct Recorder {
        calls: Mutex<Vec<u64>>,
        fail_at: Option<u64>,
        failed: AtomicBool,
        signal_at: Option<(u64, mpsc::UnboundedSender<()>)>,
    }

    impl Recorder {
        fn calls(&self) -> Vec<u64> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl DeploymentHandler for Recorder {
        type Error = std::io::Error;

        async fn handle(
            &self,
            deployment: RemoteDeployment,
            servers: Vec<Url>,
        ) -> std::io::Result<()> {
            assert_eq!(servers.len(), 1);
            let ts = deployment.local_timestamp;
            self.calls.lock().unwrap().push(ts);
            if self.fail_at == Some(ts) && !self.failed.swap(true, Ordering::SeqCst) {
                return Err(std::io::Error::other("handler failed"));
            }
            if let Some((at, tx)) = &self.signal_at {
                if *at == ts {
                    tx.send(()).ok();
                    time::sleep(Duration::from_millis(50)).await;
                }
            }
            Ok(())
        }
    }

    /// A server without snapshot whose change feed holds the deployments 1 to 13, served
    /// inclusively from the requested timestamp in pages of 4.
    async fn feed_server() -> ContentServer {
        let app = Router::new()
            .route(
                "/snapshot",
                get(|| async {
                    axum::Json(json!({
                        "hash": "bafkreinone",
                        "lastIncludedDeploymentTimestamp": 0,
                    }))
                }),
            )
            .route(
                "/pointer-changes",
                get(|Query(query): Query<HashMap<String, String>>| async move {
                    let from: u64 = query.get("from").and_then(|f| f.parse().ok()).unwrap_or(0);
                    let page: Vec<_> = (from.max(1)..=13).take(4).collect();
                    let next = match page.last() {
                        Some(last) if *last < 13 => {
                            json!({ "next": format!("?from={}", last + 1) })
                        }
                        _ => json!({}),
                    };
                    axum::Json(json!({
                        "deltas": page.into_iter().map(deployment_json).collect::<Vec<_>>(),
                        "pagination": next,
                    }))
                }),
            );
        ContentServer::spawn(app).await.unwrap()
    }

    fn stream(server: &ContentServer, handler: Arc<Recorder>) -> DeploymentStream {
        let tmp = std::env::temp_dir().join("snapshots-fetcher-supervised-tests");
        let downloader = Downloader::new(
            ContentClient::new(Default::default()).unwrap(),
            MemStorage::new(),
            JobQueue::new(JobQueueOptions::default()),
            DownloadOptions {
                tmp_dir: tmp,
                ..Default::default()
            },
        );
        DeploymentStream::new(
            downloader,
            server.url().clone(),
            DeploymentStreamOptions {
                pointer_changes_wait_time: Duration::from_millis(10),
                ..Default::default()
            },
            RetryOptions::with_retry_time(Duration::from_millis(10)),
            handler,
        )
    }

    async fn wait_for_watermark(stream: &DeploymentStream, watermark: u64) {
        time::timeout(Duration::from_secs(10), async {
            while stream.greatest_processed_timestamp() < watermark {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("watermark not reached");
    }

    #[tokio::test]
    #[traced_test]
    async fn handles_every_deployment_and_tracks_the_watermark() {
        let server = feed_server().await;
        let handler = Arc::new(Recorder::default());
        let stream = stream(&server, handler.clone());
        assert!(stream.is_stopped());

        let task = tokio::spawn({
            let stream = stream.clone();
            async move { stream.start().await }
        });
        wait_for_watermark(&stream, 13).await;
        assert!(!stream.is_stopped());
        stream.stop();
        time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();

        assert!(stream.is_stopped());
        assert_eq!(stream.greatest_processed_timestamp(), 13);
        let calls = handler.calls();
        assert_eq!(calls[..13], (1..=13).collect::<Vec<_>>()[..]);
        // polling again from the watermark only redelivers the boundary deployment
        assert!(calls[13..].iter().all(|ts| *ts == 13), "{calls:?}");
    }

    #[tokio::test]
    #[traced_test]
    async fn reconnects_from_the_watermark_after_handler_errors() {
        let server = feed_server().await;
        let handler = Arc::new(Recorder {
            fail_at: Some(6),
            ..Default::default()
        });
        let stream = stream(&server, handler.clone());

        let task = tokio::spawn({
            let stream = stream.clone();
            async move { stream.start().await }
        });
        wait_for_watermark(&stream, 13).await;
        stream.stop();
        task.await.unwrap();

        let calls = handler.calls();
        let expected: Vec<u64> = (1..=6).chain(5..=13).collect();
        assert_eq!(calls[..expected.len()], expected[..], "{calls:?}");
        assert!(stream.retry_count() >= 2);
    }

    #[tokio::test]
    #[traced_test]
    async fn stop_lets_the_current_deployment_finish() {
        let server = feed_server().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = Arc::new(Recorder {
            signal_at: Some((3, tx)),
            ..Default::default()
        });
        let stream = stream(&server, handler.clone());

        let task = tokio::spawn({
            let stream = stream.clone();
            async move { stream.start().await }
        });
        rx.recv().await.unwrap();
        stream.stop();
        time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(handler.calls(), vec![1, 2, 3]);
        assert_eq!(stream.greatest_processed_timestamp(), 3);
        assert_eq!(stream.retry_count(), 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn stop_closes_an_idle_connection() {
        let app = Router::new()
            .route(
                "/snapshot",
                get(|| async {
                    axum::Json(json!({
                        "hash": "bafkreinone",
                        "lastIncludedDeploymentTimestamp": 0,
                    }))
                }),
            )
            .route(
                "/pointer-changes",
                get(|| async { axum::Json(json!({ "deltas": [] })) }),
            );
        let server = ContentServer::spawn(app).await.unwrap();
        let handler = Arc::new(Recorder::default());
        let stream = stream(&server, handler.clone());

        let task = tokio::spawn({
            let stream = stream.clone();
            async move { stream.start().await }
        });
        time::sleep(Duration::from_millis(200)).await;
        stream.stop();
        time::timeout(Duration::from_secs(3), task)
            .await
            .expect("idle stream did not stop")
            .unwrap();

        assert!(handler.calls().is_empty());
        assert_eq!(stream.retry_count(), 1);
        assert!(stream.is_stopped());
    }
}
