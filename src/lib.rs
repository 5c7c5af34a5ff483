//! # Laterwork
//!
//! A PostgreSQL-backed job queue. Jobs are deferred onto named queues and
//! claimed by workers with `FOR UPDATE SKIP LOCKED`, so any number of worker
//! processes can share one database without ever running a job twice.
//!
//! ## Features
//!
//! - **Job locks**: jobs sharing a lock string never run at the same time,
//!   across every worker of every process
//! - **Scheduling**: defer a job to run at, or after, a given time
//! - **LISTEN/NOTIFY wake-up**: idle workers react to new jobs immediately and
//!   poll as a fallback
//! - **Connection-loss resilience**: queries are retried on a fresh connection
//!   when the server drops them, up to the pool size plus one
//! - **Retry policies**: pluggable backoff for failed jobs
//! - **Blocking facade**: synchronous twins of the store operations
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use laterwork::{App, JobOptions, LaterworkConfig, Task, app::parse_json_args, task::JobContext};
//!
//! #[tokio::main]
//! async fn main() -> laterwork::Result<()> {
//!     let config = LaterworkConfig::new().with_database_url("postgresql://localhost/laterwork");
//!     let app = App::connect(config)
//!         .await?
//!         .with_task(Task::new("send_email", |ctx: JobContext| async move {
//!             println!("sending {:?}", ctx.args());
//!             Ok(())
//!         }));
//!
//!     app.configure_task("send_email", JobOptions::new().lock("smtp"), false)?
//!         .defer(parse_json_args(Some(r#"{"to": "someone@example.com"}"#))?)
//!         .await?;
//!
//!     app.worker().with_concurrency(4).run_until_empty().await
//! }
//! ```

pub mod app;
pub mod blocking;
pub mod config;
pub mod connector;
pub mod error;
pub mod job;
pub mod retry;
pub mod store;
pub mod task;
pub mod utils;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use app::{App, JobDeferrer, JobOptions};
pub use config::LaterworkConfig;
pub use connector::{ConnectorError, PgConnector};
pub use error::LaterworkError;
pub use job::{Job, JobArgs, JobId, JobStatus, NewJob};
pub use retry::{RetryPolicy, RetryStrategy};
pub use store::{InMemoryJobStore, JobFilter, JobStore, MockClock, PostgresJobStore};
pub use task::{JobContext, Task, TaskRegistry};
pub use worker::{ShutdownPolicy, Worker, WorkerHandle};

/// Convenient type alias for Results with [`LaterworkError`] as the error type.
pub type Result<T> = std::result::Result<T, LaterworkError>;
