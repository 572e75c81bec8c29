//! Runs a long-lived fallible action forever, backing off after failures.
use std::{
    fmt,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use backon::{Backoff, BackoffBuilder, ExponentialBuilder};
use n0_future::{
    boxed::BoxFuture,
    time::{self, Duration},
};
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

/// Default factor the delay grows by after each failure.
pub const DEFAULT_EXPONENT: f32 = 1.1;

/// Default upper bound of the delay between two runs, one day.
pub const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
type Action = Box<dyn Fn() -> BoxFuture<Result<(), BoxError>> + Send + Sync + 'static>;

/// Options for a [`RetryLoop`].
#[derive(Debug, Clone, PartialEq)]
pub struct RetryOptions {
    /// Delay between runs before any failure happened.
    ///
    /// A zero delay disables looping: the action runs exactly once.
    pub retry_time: Duration,
    /// Factor the delay grows by after each failed run.
    pub exponent: f32,
    /// Upper bound of the delay.
    pub max_interval: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            retry_time: Duration::from_secs(1),
            exponent: DEFAULT_EXPONENT,
            max_interval: DEFAULT_MAX_INTERVAL,
        }
    }
}

impl RetryOptions {
    /// Creates options with the given initial delay and default growth.
    pub fn with_retry_time(retry_time: Duration) -> Self {
        Self {
            retry_time,
            ..Default::default()
        }
    }

    /// The delays used after consecutive failures.
    ///
    /// The first failure waits `retry_time`, every further one `exponent` times longer, never
    /// more than `max_interval`.
    pub fn backoff(&self) -> impl Backoff + use<> {
        ExponentialBuilder::new()
            .with_min_delay(self.retry_time)
            .with_max_delay(self.max_interval)
            .with_factor(self.exponent)
            .without_max_times()
            .build()
    }
}

/// Runs an action repeatedly until stopped.
///
/// After every run the loop sleeps before running the action again. The delay starts at
/// [`RetryOptions::retry_time`] and only grows when a run fails; a successful run keeps the
/// delay reached so far. Errors of the action are logged, never returned.
///
/// Stopping is cooperative: a run in progress is never interrupted, the loop returns at the
/// next iteration boundary. A stop issued while the loop sleeps ends the sleep.
#[derive(Clone)]
pub struct RetryLoop {
    inner: Arc<Inner>,
}

struct Inner {
    action: Action,
    options: RetryOptions,
    started: AtomicBool,
    /// Bumped by every `stop`, so a loop from before a stop/start pair exits.
    epoch: AtomicU64,
    retry_count: AtomicU64,
    wake: Notify,
}

impl fmt::Debug for RetryLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryLoop")
            .field("options", &self.inner.options)
            .field("started", &self.inner.started.load(Ordering::Relaxed))
            .field("retry_count", &self.retry_count())
            .finish_non_exhaustive()
    }
}

impl RetryLoop {
    /// Creates a stopped loop running `action`.
    pub fn new<F, Fut, E>(options: RetryOptions, action: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let action: Action = Box::new(move || -> BoxFuture<Result<(), BoxError>> {
            let fut = action();
            Box::pin(async move { fut.await.map_err(Into::into) })
        });
        Self {
            inner: Arc::new(Inner {
                action,
                options,
                started: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                retry_count: AtomicU64::new(0),
                wake: Notify::new(),
            }),
        }
    }

    /// Runs the loop until [`RetryLoop::stop`] is called.
    ///
    /// Returns after the first run if the retry time is zero. Calling this on a loop that
    /// is already running returns immediately.
    pub async fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            debug!("retry loop already running");
            return;
        }
        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        let options = &self.inner.options;
        let mut backoff = options.backoff();
        let mut delay = options.retry_time;

        while self.is_current(epoch) {
            let count = self.inner.retry_count.fetch_add(1, Ordering::SeqCst) + 1;
            match (self.inner.action)().await {
                Ok(()) => trace!(count, "run finished"),
                Err(err) => {
                    delay = backoff.next().unwrap_or(options.max_interval);
                    warn!(count, ?delay, "run failed: {err:#}");
                }
            }

            if options.retry_time.is_zero() {
                break;
            }

            // registered before checking the flag so a concurrent stop is not missed
            let woken = self.inner.wake.notified();
            tokio::pin!(woken);
            woken.as_mut().enable();
            if !self.is_current(epoch) {
                break;
            }
            tokio::select! {
                _ = time::sleep(delay) => {}
                _ = &mut woken => trace!("woken up by stop"),
            }
        }
        debug!("retry loop finished");
    }

    /// Requests the loop to stop at the next iteration boundary.
    ///
    /// Has no effect on a [`RetryLoop::start`] that begins afterwards.
    pub fn stop(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.inner.started.store(false, Ordering::SeqCst);
        self.inner.wake.notify_waiters();
    }

    /// Whether the loop is between a [`RetryLoop::stop`] and the next
    /// [`RetryLoop::start`], or was never started.
    pub fn is_stopped(&self) -> bool {
        !self.inner.started.load(Ordering::SeqCst)
    }

    /// Number of times the action was invoked, the first run included.
    pub fn retry_count(&self) -> u64 {
        self.inner.retry_count.load(Ordering::SeqCst)
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.inner.started.load(Ordering::SeqCst)
            && self.inner.epoch.load(Ordering::SeqCst) == epoch
    }
}
