//! Tasks and the registry workers resolve them from.
//!
//! Tasks are registered explicitly at startup: a name, a handler and
//! defaults for the jobs deferred through it.
//!
//! # Examples
//!
//! ```rust
//! use laterwork::task::{JobContext, Task, TaskRegistry};
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct Greeting {
//!     name: String,
//! }
//!
//! let mut registry = TaskRegistry::new();
//! registry.register(
//!     Task::new("greet", |ctx: JobContext| async move {
//!         let greeting: Greeting = ctx.parse_args()?;
//!         println!("Hello {}", greeting.name);
//!         Ok(())
//!     })
//!     .on_queue("greetings"),
//! );
//!
//! assert!(registry.get("greet").is_some());
//! ```

use crate::{
    LaterworkError, Result,
    job::{DEFAULT_QUEUE, Job, JobArgs},
    retry::RetryPolicy,
};
use serde::de::DeserializeOwned;
use std::{collections::HashMap, fmt, future::Future, pin::Pin, sync::Arc};

/// Whatever a task fails with.
pub type TaskError = Box<dyn std::error::Error + Send + Sync>;

pub type TaskResult = std::result::Result<(), TaskError>;

pub type TaskFuture = Pin<Box<dyn Future<Output = TaskResult> + Send>>;

pub type TaskHandler = Arc<dyn Fn(JobContext) -> TaskFuture + Send + Sync>;

/// What a task receives when its job runs.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job: Job,
    pub worker_name: String,
}

impl JobContext {
    pub fn args(&self) -> &JobArgs {
        &self.job.args
    }

    /// Deserialize the whole argument object into `T`.
    pub fn parse_args<T: DeserializeOwned>(&self) -> std::result::Result<T, serde_json::Error> {
        serde_json::from_value(serde_json::Value::Object(self.job.args.clone()))
    }
}

#[derive(Clone)]
pub struct Task {
    pub name: String,
    /// Queue used when deferring without an explicit one.
    pub queue: String,
    pub lock: Option<String>,
    /// `None` falls back to the worker's default policy.
    pub retry: Option<RetryPolicy>,
    handler: TaskHandler,
}

impl Task {
    pub fn new<F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        Self {
            name: name.into(),
            queue: DEFAULT_QUEUE.to_string(),
            lock: None,
            retry: None,
            handler: Arc::new(move |ctx| Box::pin(handler(ctx))),
        }
    }

    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_lock(mut self, lock: impl Into<String>) -> Self {
        self.lock = Some(lock.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn run(&self, ctx: JobContext) -> TaskFuture {
        (self.handler)(ctx)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("queue", &self.queue)
            .field("lock", &self.lock)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, Task>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `task`, replacing any task of the same name.
    pub fn register(&mut self, task: Task) -> &mut Self {
        self.tasks.insert(task.name.clone(), task);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Task> {
        self.tasks.get(name)
    }

    /// Like [`TaskRegistry::get`], failing with `TaskNotFound`.
    pub fn resolve(&self, name: &str) -> Result<&Task> {
        self.get(name).ok_or_else(|| LaterworkError::TaskNotFound {
            name: name.to_string(),
        })
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tasks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
