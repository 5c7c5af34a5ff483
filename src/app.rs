//! The application context: a job store, the registered tasks and the
//! configuration, built once and handed to whatever defers or runs jobs.

use crate::{
    LaterworkError, Result,
    config::LaterworkConfig,
    job::{DEFAULT_QUEUE, JobArgs, JobId, NewJob, describe_call},
    store::{JobStore, PostgresJobStore},
    task::{Task, TaskRegistry},
    worker::Worker,
};
use chrono::{DateTime, Utc};
use std::{sync::Arc, time::Duration};
use tracing::info;

/// Per-deferral overrides of a task's defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobOptions {
    pub queue: Option<String>,
    pub lock: Option<String>,
    /// Run no earlier than this instant.
    pub schedule_at: Option<DateTime<Utc>>,
    /// Run no earlier than this long after configuration.
    pub schedule_in: Option<Duration>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn lock(mut self, lock: impl Into<String>) -> Self {
        self.lock = Some(lock.into());
        self
    }

    pub fn schedule_at(mut self, at: DateTime<Utc>) -> Self {
        self.schedule_at = Some(at);
        self
    }

    pub fn schedule_in(mut self, delay: Duration) -> Self {
        self.schedule_in = Some(delay);
        self
    }

    fn scheduled_at(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        match (self.schedule_at, self.schedule_in) {
            (Some(_), Some(_)) => Err(LaterworkError::InvalidSchedule {
                message: "cannot set both schedule_at and schedule_in".to_string(),
            }),
            (Some(at), None) => Ok(Some(at)),
            (None, Some(delay)) => {
                let delay = chrono::Duration::from_std(delay).map_err(|_| LaterworkError::InvalidSchedule {
                    message: format!("delay out of range: {:?}", delay),
                })?;
                now.checked_add_signed(delay)
                    .map(Some)
                    .ok_or_else(|| LaterworkError::InvalidSchedule {
                        message: "scheduled time out of range".to_string(),
                    })
            }
            (None, None) => Ok(None),
        }
    }
}

/// Parse task arguments given as JSON text. `None` means no arguments;
/// anything but a JSON object is rejected.
pub fn parse_json_args(raw: Option<&str>) -> Result<JobArgs> {
    let Some(raw) = raw else {
        return Ok(JobArgs::new());
    };
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Object(args)) => Ok(args),
        Ok(other) => Err(LaterworkError::InvalidArguments {
            message: format!("expected a JSON object, got {}", other),
        }),
        Err(err) => Err(LaterworkError::InvalidArguments {
            message: format!("could not parse {:?} as JSON: {}", raw, err),
        }),
    }
}

/// Defers jobs for one configured task. Obtained from
/// [`App::configure_task`].
#[derive(Clone)]
pub struct JobDeferrer {
    store: Arc<dyn JobStore>,
    template: NewJob,
}

impl JobDeferrer {
    /// The job that [`JobDeferrer::defer`] will insert, without arguments.
    pub fn job(&self) -> &NewJob {
        &self.template
    }

    pub async fn defer(&self, args: JobArgs) -> Result<JobId> {
        let job = self.template.clone().with_args(args);
        let call = describe_call(&job.task_name, &job.args);
        let queue_name = job.queue_name.clone();

        let job_id = self.store.defer_job(job).await?;
        info!(
            action = "defer_job",
            job_id,
            queue = %queue_name,
            call = %call,
            "Deferred job {}",
            call
        );
        Ok(job_id)
    }
}

/// Store, tasks and configuration.
///
/// # Examples
///
/// ```rust
/// use laterwork::{App, JobOptions, InMemoryJobStore, Task};
/// use laterwork::task::JobContext;
/// use std::sync::Arc;
///
/// # async fn example() -> laterwork::Result<()> {
/// let app = App::new(Arc::new(InMemoryJobStore::new()))
///     .with_task(Task::new("hello", |_ctx: JobContext| async { Ok(()) }));
///
/// let job_id = app
///     .configure_task("hello", JobOptions::new().lock("sherlock"), false)?
///     .defer(laterwork::app::parse_json_args(Some(r#"{"a": 1}"#))?)
///     .await?;
///
/// app.worker().run_until_empty().await?;
/// # let _ = job_id;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct App {
    store: Arc<dyn JobStore>,
    tasks: TaskRegistry,
    config: LaterworkConfig,
}

impl App {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            tasks: TaskRegistry::new(),
            config: LaterworkConfig::default(),
        }
    }

    /// Connect to PostgreSQL as configured.
    pub async fn connect(config: LaterworkConfig) -> Result<Self> {
        let store = PostgresJobStore::connect(&config.database).await?;
        Ok(Self::new(Arc::new(store)).with_config(config))
    }

    pub fn with_config(mut self, config: LaterworkConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_task(mut self, task: Task) -> Self {
        self.tasks.register(task);
        self
    }

    /// Replace the registered tasks with `tasks`.
    pub fn with_tasks(mut self, tasks: TaskRegistry) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn register(&mut self, task: Task) -> &mut Self {
        self.tasks.register(task);
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn tasks(&self) -> &TaskRegistry {
        &self.tasks
    }

    pub fn config(&self) -> &LaterworkConfig {
        &self.config
    }

    /// Prepare deferral of `task_name`.
    ///
    /// Registered tasks provide the default queue and lock. An unregistered
    /// name is a `TaskNotFound` error unless `allow_unknown` is set, in which
    /// case the job goes to the `"default"` queue.
    pub fn configure_task(
        &self,
        task_name: &str,
        options: JobOptions,
        allow_unknown: bool,
    ) -> Result<JobDeferrer> {
        let (default_queue, default_lock) = match self.tasks.get(task_name) {
            Some(task) => (task.queue.clone(), task.lock.clone()),
            None if allow_unknown => (DEFAULT_QUEUE.to_string(), None),
            None => {
                return Err(LaterworkError::TaskNotFound {
                    name: task_name.to_string(),
                });
            }
        };

        let scheduled_at = options.scheduled_at(Utc::now())?;
        let mut job = NewJob::new(task_name).on_queue(options.queue.unwrap_or(default_queue));
        job.lock = options.lock.or(default_lock);
        job.scheduled_at = scheduled_at;

        Ok(JobDeferrer {
            store: self.store.clone(),
            template: job,
        })
    }

    /// A worker using this app's configuration.
    pub fn worker(&self) -> Worker {
        Worker::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{store::InMemoryJobStore, task::JobContext};

    fn app() -> App {
        App::new(Arc::new(InMemoryJobStore::new()))
            .with_task(Task::new("hello", |_ctx: JobContext| async { Ok(()) }))
            .with_task(
                Task::new("mail", |_ctx: JobContext| async { Ok(()) })
                    .on_queue("emails")
                    .with_lock("smtp"),
            )
    }

    #[test]
    fn test_parse_json_args() {
        assert!(parse_json_args(None).unwrap().is_empty());
        assert_eq!(parse_json_args(Some(r#"{"a": 1}"#)).unwrap()["a"], 1);
        for bad in ["", "{", "[1, 2]", "3", "null"] {
            assert!(matches!(
                parse_json_args(Some(bad)),
                Err(LaterworkError::InvalidArguments { .. })
            ));
        }
    }

    #[test]
    fn test_configure_task_defaults() {
        let app = app();

        let deferrer = app.configure_task("mail", JobOptions::new(), false).unwrap();
        assert_eq!(deferrer.job().queue_name, "emails");
        assert_eq!(deferrer.job().lock.as_deref(), Some("smtp"));

        let deferrer = app
            .configure_task("mail", JobOptions::new().queue("urgent").lock("other"), false)
            .unwrap();
        assert_eq!(deferrer.job().queue_name, "urgent");
        assert_eq!(deferrer.job().lock.as_deref(), Some("other"));
    }

    #[test]
    fn test_configure_unknown_task() {
        let app = app();

        let err = app.configure_task("nope", JobOptions::new(), false).err().unwrap();
        assert!(matches!(err, LaterworkError::TaskNotFound { ref name } if name == "nope"));
        assert!(err.is_user_error());

        let deferrer = app.configure_task("nope", JobOptions::new(), true).unwrap();
        assert_eq!(deferrer.job().queue_name, "default");
        assert!(deferrer.job().lock.is_none());
    }

    #[test]
    fn test_schedule_options() {
        let app = app();
        let at = Utc::now() + chrono::Duration::hours(1);

        let deferrer = app
            .configure_task("hello", JobOptions::new().schedule_at(at), false)
            .unwrap();
        assert_eq!(deferrer.job().scheduled_at, Some(at));

        let before = Utc::now();
        let deferrer = app
            .configure_task("hello", JobOptions::new().schedule_in(Duration::from_secs(60)), false)
            .unwrap();
        let scheduled = deferrer.job().scheduled_at.unwrap();
        assert!(scheduled >= before + chrono::Duration::seconds(60));
        assert!(scheduled <= Utc::now() + chrono::Duration::seconds(60));

        let err = app
            .configure_task(
                "hello",
                JobOptions::new().schedule_at(at).schedule_in(Duration::from_secs(1)),
                false,
            )
            .err()
            .unwrap();
        assert!(matches!(err, LaterworkError::InvalidSchedule { .. }));
    }

    #[tokio::test]
    async fn test_defer() {
        let app = app();
        let mut args = JobArgs::new();
        args.insert("a".to_string(), serde_json::json!(1));

        let job_id = app
            .configure_task("hello", JobOptions::new().lock("sherlock"), false)
            .unwrap()
            .defer(args.clone())
            .await
            .unwrap();

        let job = app.store().get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.id, 1);
        assert_eq!(job.task_name, "hello");
        assert_eq!(job.queue_name, "default");
        assert_eq!(job.lock.as_deref(), Some("sherlock"));
        assert_eq!(job.args, args);
        assert_eq!(job.attempts, 0);
        assert!(job.scheduled_at.is_none());
        assert!(job.started_at.is_none());
    }
}
