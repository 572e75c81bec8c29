//! Keeps a set of named long-lived jobs running.
//!
//! A [`JobLifecycleManager`] is told which jobs should run and starts or stops jobs until
//! the running set matches. Typically there is one [`crate::DeploymentStream`] per server.
use std::{
    fmt,
    future::Future,
    sync::Mutex,
};

use futures_util::future::join_all;
use indexmap::IndexMap;
use n0_future::task::{self, AbortOnDropHandle};
use tokio::sync::oneshot;
use tracing::{Instrument, debug, info, info_span, warn};

/// A long-lived job controlled by a [`JobLifecycleManager`].
pub trait ManagedJob: Send + Sync + 'static {
    /// Runs the job. Returns once the job is stopped.
    fn start(&self) -> impl Future<Output = ()> + Send;

    /// Requests the job to stop. The future returned by [`ManagedJob::start`] completes
    /// afterwards.
    ///
    /// The manager only calls this once the future returned by [`ManagedJob::start`] was
    /// polled.
    fn stop(&self) -> impl Future<Output = ()> + Send;
}

type JobFactory<J> = Box<dyn Fn(&str) -> J + Send + Sync + 'static>;

/// Reconciles a desired set of named jobs against the jobs actually running.
pub struct JobLifecycleManager<J> {
    name: String,
    factory: JobFactory<J>,
    state: Mutex<State>,
}

struct State {
    /// Running jobs, in the order they were started.
    running: IndexMap<String, RunningJob>,
    /// Jobs that were asked to stop and may still be finishing.
    stopping: Vec<AbortOnDropHandle<()>>,
}

struct RunningJob {
    /// Dropping the sender stops the job as well.
    stop: oneshot::Sender<()>,
    task: AbortOnDropHandle<()>,
}

impl<J> fmt::Debug for JobLifecycleManager<J> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().expect("poisoned");
        f.debug_struct("JobLifecycleManager")
            .field("name", &self.name)
            .field("running", &state.running.keys().collect::<Vec<_>>())
            .field("stopping", &state.stopping.len())
            .finish_non_exhaustive()
    }
}

impl<J: ManagedJob> JobLifecycleManager<J> {
    /// Creates a manager without jobs. `factory` creates the job for a key.
    pub fn new(
        name: impl Into<String>,
        factory: impl Fn(&str) -> J + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            factory: Box::new(factory),
            state: Mutex::new(State {
                running: IndexMap::new(),
                stopping: Vec::new(),
            }),
        }
    }

    /// Makes the running jobs match `keys`.
    ///
    /// Jobs for new keys are created and started, jobs whose key is missing are stopped.
    /// Jobs whose key is still desired are left alone. Does not wait for stopped jobs to
    /// finish, [`JobLifecycleManager::stop`] does.
    ///
    /// Must be called from within a tokio runtime.
    pub fn set_desired_jobs<I, K>(&self, keys: I)
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let desired: Vec<String> = keys.into_iter().map(Into::into).collect();
        let mut state = self.state.lock().expect("poisoned");

        let obsolete: Vec<String> = state
            .running
            .keys()
            .filter(|key| !desired.contains(key))
            .cloned()
            .collect();
        for key in obsolete {
            let Some(RunningJob { stop, task }) = state.running.shift_remove(&key) else {
                continue;
            };
            info!(manager = %self.name, %key, "stopping job");
            stop.send(()).ok();
            state.stopping.push(task);
        }
        state.stopping.retain(|task| !task.is_finished());

        for key in desired {
            if state.running.contains_key(&key) {
                continue;
            }
            info!(manager = %self.name, %key, "starting job");
            let job = (self.factory)(&key);
            let (stop, stop_rx) = oneshot::channel();
            let task = task::spawn(
                run_job(job, stop_rx).instrument(info_span!("job", manager = %self.name, %key)),
            );
            state.running.insert(
                key,
                RunningJob {
                    stop,
                    task: AbortOnDropHandle::new(task),
                },
            );
        }
    }

    /// Keys of the running jobs, in the order they were started.
    pub fn running_jobs(&self) -> Vec<String> {
        let state = self.state.lock().expect("poisoned");
        state.running.keys().cloned().collect()
    }

    /// Stops every job and waits until all of them finished, including jobs that were
    /// stopped earlier.
    pub async fn stop(&self) {
        let (running, stopping) = {
            let mut state = self.state.lock().expect("poisoned");
            (
                std::mem::take(&mut state.running),
                std::mem::take(&mut state.stopping),
            )
        };
        debug!(manager = %self.name, jobs = running.len(), "stopping all jobs");
        let tasks = running
            .into_values()
            .map(|RunningJob { stop, task }| {
                stop.send(()).ok();
                task
            })
            .chain(stopping)
            .map(|task| async move {
                if let Err(err) = task.await {
                    warn!("job failed: {err}");
                }
            });
        join_all(tasks).await;
        info!(manager = %self.name, "all jobs stopped");
    }
}

/// Runs `job` until a stop is requested through `stop_rx`, then stops it and waits for it.
///
/// The job is stopped from within its own task, so a stop requested right after spawning
/// still reaches a job that has already started.
async fn run_job<J: ManagedJob>(job: J, stop_rx: oneshot::Receiver<()>) {
    let mut start = std::pin::pin!(job.start());
    tokio::select! {
        biased;
        _ = &mut start => {
            debug!("job finished");
            return;
        }
        _ = stop_rx => {}
    }
    job.stop().await;
    start.await;
    debug!("job stopped");
}
