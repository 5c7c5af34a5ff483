//! The worker loop.
//!
//! A [`Worker`] claims jobs for its queues and runs them concurrently, up to
//! its concurrency limit. While idle it sleeps until the store signals new
//! jobs, a running job finishes, or the polling interval elapses, whichever
//! comes first. Stopping is cooperative: once asked to stop, the worker
//! claims nothing new and, depending on its [`ShutdownPolicy`], waits for or
//! aborts the jobs in flight.
//!
//! # Examples
//!
//! ```rust,no_run
//! use laterwork::{App, config::LaterworkConfig, task::{JobContext, Task}};
//!
//! # async fn example() -> laterwork::Result<()> {
//! let app = App::connect(LaterworkConfig::from_env()?)
//!     .await?
//!     .with_task(Task::new("hello", |ctx: JobContext| async move {
//!         println!("hello from job {}", ctx.job.id);
//!         Ok(())
//!     }));
//!
//! let worker = app.worker().with_concurrency(4);
//! let handle = worker.handle();
//! tokio::spawn(async move {
//!     let _ = tokio::signal::ctrl_c().await;
//!     handle.stop();
//! });
//! worker.run().await?;
//! # Ok(())
//! # }
//! ```

use crate::{
    App, LaterworkError, Result,
    job::{Job, JobStatus},
    retry::RetryPolicy,
    store::JobStore,
    task::{JobContext, TaskRegistry},
    utils::{ScopedTask, root_cause},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    sync::{Notify, OwnedSemaphorePermit, Semaphore, watch},
    task::{JoinError, JoinSet},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What happens to running jobs when the worker is asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownPolicy {
    /// Let them finish.
    #[default]
    Graceful,
    /// Cancel them. Their jobs stay in `doing`.
    Abort,
}

/// Stops a running [`Worker`] from another task.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    shutdown: Arc<watch::Sender<bool>>,
}

impl WorkerHandle {
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }
}

/// Everything a dispatched job needs, detached from the worker's lifetime.
#[derive(Clone)]
struct JobRunner {
    worker_name: Arc<str>,
    store: Arc<dyn JobStore>,
    tasks: Arc<TaskRegistry>,
    default_retry: Arc<RetryPolicy>,
}

impl JobRunner {
    async fn run(self, job: Job) -> Result<()> {
        let call = job.call_string();
        let job_id = job.id;
        let start_timestamp = Utc::now();
        let started = Instant::now();
        info!(
            action = "start_job",
            worker = %self.worker_name,
            job_id,
            call = %call,
            "Starting job {}",
            call
        );

        let Some(task) = self.tasks.get(&job.task_name).cloned() else {
            error!(
                action = "task_not_found",
                worker = %self.worker_name,
                job_id,
                task_name = %job.task_name,
                "Task {} is not registered, marking job {} as failed",
                job.task_name,
                job_id
            );
            return self.report(job_id, JobStatus::Failed, None).await;
        };

        let attempts = job.attempts;
        let ctx = JobContext {
            job,
            worker_name: self.worker_name.to_string(),
        };

        // The handler runs in its own scope so a panic fails the job instead
        // of the dispatch, and cancelling the dispatch cancels the handler.
        let mut scope = JoinSet::new();
        scope.spawn(task.run(ctx));
        let outcome = match scope.join_next().await {
            Some(Ok(Ok(()))) => Ok(()),
            Some(Ok(Err(err))) => {
                let root = root_cause(err.as_ref()).to_string();
                Err((err.to_string(), root))
            }
            Some(Err(err)) => {
                let message = join_error_message(err);
                Err((message.clone(), message))
            }
            None => Err(("task was not started".to_string(), String::new())),
        };

        let end_timestamp = Utc::now();
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(()) => {
                self.report(job_id, JobStatus::Succeeded, None).await?;
                info!(
                    action = "job_success",
                    worker = %self.worker_name,
                    job_id,
                    call = %call,
                    start_timestamp = %start_timestamp,
                    end_timestamp = %end_timestamp,
                    duration_ms,
                    "Job {} succeeded in {}ms",
                    call,
                    duration_ms
                );
            }
            Err((message, root)) => {
                let policy = task.retry.as_ref().unwrap_or(&*self.default_retry);
                match policy.retry_at(attempts, end_timestamp) {
                    Some(retry_at) => {
                        self.report(job_id, JobStatus::Todo, Some(retry_at)).await?;
                        warn!(
                            action = "job_retry",
                            worker = %self.worker_name,
                            job_id,
                            call = %call,
                            attempts = attempts + 1,
                            retry_at = %retry_at,
                            error = %message,
                            root_cause = %root,
                            duration_ms,
                            "Job {} failed, retrying at {}",
                            call,
                            retry_at
                        );
                    }
                    None => {
                        self.report(job_id, JobStatus::Failed, None).await?;
                        error!(
                            action = "job_error",
                            worker = %self.worker_name,
                            job_id,
                            call = %call,
                            start_timestamp = %start_timestamp,
                            end_timestamp = %end_timestamp,
                            error = %message,
                            root_cause = %root,
                            duration_ms,
                            "Job {} failed: {}",
                            call,
                            message
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// A failure here leaves the job's state unknown: it is reported as a
    /// worker fault, never as a task failure.
    async fn report(
        &self,
        job_id: i64,
        status: JobStatus,
        retry_at: Option<chrono::DateTime<Utc>>,
    ) -> Result<()> {
        self.store
            .finish_job(job_id, status, retry_at)
            .await
            .map_err(|err| LaterworkError::Worker {
                message: format!("could not mark job {} as {}: {}", job_id, status, err),
            })
    }
}

fn join_error_message(err: JoinError) -> String {
    if err.is_panic() {
        let panic = err.into_panic();
        let detail = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        format!("task panicked: {}", detail)
    } else {
        "task was cancelled".to_string()
    }
}

/// Claims and runs jobs. Build one with [`App::worker`].
pub struct Worker {
    name: String,
    queues: Option<Vec<String>>,
    concurrency: usize,
    polling_interval: Duration,
    listen_notify: bool,
    shutdown_policy: ShutdownPolicy,
    runner: JobRunner,
    notify: Arc<Notify>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Worker {
    pub fn new(app: App) -> Self {
        let config = app.config().worker.clone();
        let name = config
            .name
            .unwrap_or_else(|| format!("worker-{}", Uuid::new_v4()));
        let (shutdown, _) = watch::channel(false);

        Self {
            queues: config.queues,
            concurrency: config.concurrency.max(1),
            polling_interval: config.polling_interval,
            listen_notify: config.listen_notify,
            shutdown_policy: config.shutdown_policy,
            runner: JobRunner {
                worker_name: Arc::from(name.as_str()),
                store: app.store().clone(),
                tasks: Arc::new(app.tasks().clone()),
                default_retry: Arc::new(config.default_retry),
            },
            name,
            notify: Arc::new(Notify::new()),
            shutdown: Arc::new(shutdown),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self.runner.worker_name = Arc::from(self.name.as_str());
        self
    }

    /// Consume only these queues. An empty list means all queues.
    pub fn with_queues(mut self, queues: Vec<String>) -> Self {
        self.queues = if queues.is_empty() { None } else { Some(queues) };
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    pub fn with_listen_notify(mut self, enabled: bool) -> Self {
        self.listen_notify = enabled;
        self
    }

    pub fn with_shutdown_policy(mut self, policy: ShutdownPolicy) -> Self {
        self.shutdown_policy = policy;
        self
    }

    pub fn with_default_retry(mut self, policy: RetryPolicy) -> Self {
        self.runner.default_retry = Arc::new(policy);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queues(&self) -> Option<&[String]> {
        self.queues.as_deref()
    }

    /// `"a, b"`, or `"all queues"`.
    pub fn queues_display(&self) -> String {
        match &self.queues {
            Some(queues) => queues.join(", "),
            None => "all queues".to_string(),
        }
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            shutdown: self.shutdown.clone(),
        }
    }

    /// Shortcut for `handle().stop()`.
    pub fn stop(&self) {
        self.handle().stop();
    }

    /// Run until stopped.
    pub async fn run(&self) -> Result<()> {
        self.run_loop(false).await
    }

    /// Run every eligible job, including jobs unlocked by the ones it runs,
    /// then return.
    pub async fn run_until_empty(&self) -> Result<()> {
        self.run_loop(true).await
    }

    async fn run_loop(&self, until_empty: bool) -> Result<()> {
        info!(
            action = "start_worker",
            worker = %self.name,
            queues = %self.queues_display(),
            concurrency = self.concurrency,
            "Starting worker on {}",
            self.queues_display()
        );

        let _listener = (self.listen_notify && !until_empty).then(|| {
            let store = self.runner.store.clone();
            let queues = self.queues.clone();
            let notify = self.notify.clone();
            ScopedTask::spawn("listener", async move {
                store.listen_for_jobs(queues.as_deref(), notify).await
            })
        });

        let mut running = JoinSet::new();
        let result = self.dispatch(&mut running, until_empty).await;
        let drained = self.drain(&mut running).await;

        info!(action = "stop_worker", worker = %self.name, "Stopped worker on {}", self.queues_display());
        result.and(drained)
    }

    async fn dispatch(&self, running: &mut JoinSet<Result<()>>, until_empty: bool) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut shutdown = self.shutdown.subscribe();

        loop {
            while let Some(joined) = running.try_join_next() {
                joined_outcome(joined)?;
            }
            if *shutdown.borrow() {
                return Ok(());
            }

            let permit: OwnedSemaphorePermit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return Ok(()),
                },
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    joined_outcome(joined)?;
                    continue;
                }
                _ = shutdown.changed() => continue,
            };

            if let Some(job) = self.runner.store.fetch_job(self.queues.as_deref()).await? {
                let runner = self.runner.clone();
                running.spawn(async move {
                    let _permit = permit;
                    runner.run(job).await
                });
                continue;
            }
            drop(permit);

            if until_empty {
                match running.join_next().await {
                    Some(joined) => {
                        joined_outcome(joined)?;
                        continue;
                    }
                    None => return Ok(()),
                }
            }

            debug!(action = "wait_for_job", worker = %self.name, "Waiting for new jobs");
            tokio::select! {
                _ = self.notify.notified() => {
                    debug!(action = "worker_woken", worker = %self.name, "New job notification");
                }
                _ = tokio::time::sleep(self.polling_interval) => {}
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    joined_outcome(joined)?;
                }
                _ = shutdown.changed() => {}
            }
        }
    }

    async fn drain(&self, running: &mut JoinSet<Result<()>>) -> Result<()> {
        if running.is_empty() {
            return Ok(());
        }

        match self.shutdown_policy {
            ShutdownPolicy::Graceful => {
                info!(
                    action = "stopping_worker",
                    worker = %self.name,
                    running = running.len(),
                    "Waiting for {} running job(s) to finish",
                    running.len()
                );
            }
            ShutdownPolicy::Abort => {
                info!(
                    action = "stopping_worker",
                    worker = %self.name,
                    running = running.len(),
                    "Aborting {} running job(s)",
                    running.len()
                );
                running.abort_all();
            }
        }

        let mut first_error = None;
        while let Some(joined) = running.join_next().await {
            if let Err(err) = joined_outcome(joined) {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Turn a finished dispatch into the worker's result. Reporting faults
/// propagate; cancellations and panics of the dispatch itself are logged.
fn joined_outcome(joined: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    match joined {
        Ok(result) => result,
        Err(err) if err.is_cancelled() => {
            debug!(action = "job_execution_stop", "Stopped job execution");
            Ok(())
        }
        Err(err) => {
            error!(action = "job_execution_error", error = %err, "Job execution error");
            Ok(())
        }
    }
}
