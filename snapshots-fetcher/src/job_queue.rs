//! A FIFO queue executing jobs with bounded concurrency.
use std::{future::Future, sync::Arc};

use n0_future::time::{self, Duration};
use nested_enum_utils::common_fields;
use snafu::{Backtrace, Snafu};
use tokio::sync::{Semaphore, watch};
use tracing::{debug, trace};

/// Options for a [`JobQueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobQueueOptions {
    /// Maximum number of jobs running at the same time. Zero is treated as one.
    pub concurrency: usize,
    /// Time after which a single job is aborted and treated as failed.
    pub timeout: Option<Duration>,
}

impl Default for JobQueueOptions {
    fn default() -> Self {
        Self {
            concurrency: 10,
            timeout: None,
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
pub enum QueueError {
    #[snafu(display("Job timed out after {timeout:?}"))]
    Timeout { timeout: Duration },
    #[snafu(display("At least one retry is required"))]
    NoRetries {},
}

/// Executes jobs with a concurrency cap.
///
/// Jobs beyond the cap wait for a slot in submission order. Cloning gives another handle to
/// the same queue.
#[derive(Debug, Clone)]
pub struct JobQueue {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    slots: Semaphore,
    timeout: Option<Duration>,
    /// Number of jobs queued or running.
    pending: watch::Sender<usize>,
}

impl JobQueue {
    /// Creates an empty queue.
    pub fn new(options: JobQueueOptions) -> Self {
        let (pending, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                slots: Semaphore::new(options.concurrency.max(1)),
                timeout: options.timeout,
                pending,
            }),
        }
    }

    /// Runs `job` once a slot is free and returns its result.
    pub async fn schedule_job<F, Fut, T, E>(&self, job: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<QueueError>,
    {
        let _pending = PendingGuard::new(&self.inner.pending);
        // the semaphore is never closed
        let _slot = self.inner.slots.acquire().await.ok();
        self.run(job()).await
    }

    /// Runs `job`, and on failure queues it again at the tail, up to `retries` more times.
    ///
    /// Other jobs submitted in the meantime run before the next attempt. The error of the
    /// last attempt is returned. Fails right away if `retries` is zero.
    pub async fn schedule_job_with_retries<F, Fut, T, E>(
        &self,
        mut job: F,
        retries: usize,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<QueueError> + std::fmt::Display,
    {
        if retries == 0 {
            return Err(NoRetriesSnafu.build().into());
        }
        let _pending = PendingGuard::new(&self.inner.pending);
        let mut remaining = retries;
        loop {
            let slot = self.inner.slots.acquire().await.ok();
            let res = self.run(job()).await;
            // release before queueing again, so the retry lines up behind waiting jobs
            drop(slot);
            match res {
                Ok(value) => return Ok(value),
                Err(err) if remaining > 0 => {
                    remaining -= 1;
                    debug!(remaining, "job failed, requeueing: {err}");
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn run<Fut, T, E>(&self, job: Fut) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
        E: From<QueueError>,
    {
        match self.inner.timeout {
            Some(timeout) => match time::timeout(timeout, job).await {
                Ok(res) => res,
                Err(_) => {
                    trace!(?timeout, "job timed out");
                    Err(TimeoutSnafu { timeout }.build().into())
                }
            },
            None => job.await,
        }
    }

    /// Number of jobs currently queued or running.
    pub fn pending(&self) -> usize {
        *self.inner.pending.borrow()
    }

    /// Resolves once no job is queued or running.
    pub async fn on_idle(&self) {
        let mut pending = self.inner.pending.subscribe();
        // the sender lives as long as `self`
        pending.wait_for(|n| *n == 0).await.ok();
    }

    /// Waits for all queued and running jobs to finish. Does not cancel anything.
    pub async fn stop(&self) {
        self.on_idle().await;
        debug!("job queue drained");
    }
}

/// Counts a job as pending for as long as it lives, cancellation included.
struct PendingGuard<'a>(&'a watch::Sender<usize>);

impl<'a> PendingGuard<'a> {
    fn new(pending: &'a watch::Sender<usize>) -> Self {
        pending.send_modify(|n| *n += 1);
        Self(pending)
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n -= 1);
    }
}
