//! Synchronous twins of the asynchronous entry points, for callers that
//! cannot `.await`.
//!
//! Every twin drives the asynchronous method to completion on a runtime
//! shared by the wrappers it hands out, so a pool created by one of them
//! keeps working in the others. Calls go through the same `dyn JobStore`,
//! [`JobDeferrer`] or [`Worker`] the async callers use, so a store that
//! overrides an operation gets the override from both sides.
//!
//! | async | blocking |
//! |---|---|
//! | [`JobStore`] | [`BlockingJobStore`] |
//! | [`PostgresJobStore`] | [`BlockingPostgresJobStore`] |
//! | [`PgConnector`] | [`BlockingConnector`] |
//! | [`App`] | [`BlockingApp`] |
//! | [`JobDeferrer`] | [`BlockingJobDeferrer`] |
//! | [`Worker`] | [`BlockingWorker`] |
//!
//! Do not call these from inside an async context: blocking a runtime
//! thread on another runtime panics.
//!
//! # Examples
//!
//! ```rust
//! use laterwork::{App, InMemoryJobStore, JobOptions, Task, blocking::BlockingApp, task::JobContext};
//! use std::sync::Arc;
//!
//! let app = App::new(Arc::new(InMemoryJobStore::new()))
//!     .with_task(Task::new("hello", |_ctx: JobContext| async { Ok(()) }));
//! let app = BlockingApp::new(app).unwrap();
//!
//! let id = app
//!     .configure_task("hello", JobOptions::new().lock("sherlock"), false)
//!     .unwrap()
//!     .defer(Default::default())
//!     .unwrap();
//! app.worker().run_until_empty().unwrap();
//! assert!(app.store().get_job(id).unwrap().is_some());
//! ```

use crate::{
    App, Result,
    app::{JobDeferrer, JobOptions},
    config::{DatabaseConfig, LaterworkConfig},
    connector::PgConnector,
    job::{Job, JobArgs, JobId, JobStatus, NewJob},
    store::{JobFilter, JobStore, PostgresJobStore},
    worker::{Worker, WorkerHandle},
};
use chrono::{DateTime, Utc};
use sqlx::{
    FromRow, Postgres,
    postgres::{PgArguments, PgRow},
    query::{Query, QueryAs},
};
use std::sync::Arc;
use tokio::{
    runtime::{Builder, Runtime},
    sync::Notify,
};

/// Generates `pub fn name(&self, ..) -> Ret` blocking on `self.<field>.name(..)`.
macro_rules! blocking_twins {
    ($field:ident => $( $(#[$meta:meta])* fn $name:ident(&self $(, $arg:ident: $ty:ty)*) -> $ret:ty; )*) => {
        $(
            $(#[$meta])*
            pub fn $name(&self $(, $arg: $ty)*) -> $ret {
                self.runtime.block_on(self.$field.$name($($arg),*))
            }
        )*
    };
}

fn build_runtime() -> Result<Runtime> {
    Ok(Builder::new_current_thread().enable_all().build()?)
}

/// A [`JobStore`] driven synchronously.
#[derive(Clone)]
pub struct BlockingJobStore {
    runtime: Arc<Runtime>,
    store: Arc<dyn JobStore>,
}

impl BlockingJobStore {
    pub fn new(store: Arc<dyn JobStore>) -> Result<Self> {
        Ok(Self::with_runtime(Arc::new(build_runtime()?), store))
    }

    pub fn with_runtime(runtime: Arc<Runtime>, store: Arc<dyn JobStore>) -> Self {
        Self { runtime, store }
    }

    /// Twin of [`PostgresJobStore::connect`]. The pool lives on this
    /// store's runtime.
    pub fn connect(config: &DatabaseConfig) -> Result<Self> {
        Ok(BlockingPostgresJobStore::connect(config)?.job_store())
    }

    /// Twin of [`PostgresJobStore::schema_sql`].
    pub fn schema_sql() -> &'static str {
        PostgresJobStore::schema_sql()
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    blocking_twins! { store =>
        /// Twin of [`JobStore::defer_job`].
        fn defer_job(&self, job: NewJob) -> Result<JobId>;
        /// Twin of [`JobStore::fetch_job`].
        fn fetch_job(&self, queues: Option<&[String]>) -> Result<Option<Job>>;
        /// Twin of [`JobStore::finish_job`].
        fn finish_job(&self, job_id: JobId, status: JobStatus, retry_at: Option<DateTime<Utc>>) -> Result<()>;
        /// Twin of [`JobStore::get_job`].
        fn get_job(&self, job_id: JobId) -> Result<Option<Job>>;
        /// Twin of [`JobStore::list_jobs`].
        fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>>;
        /// Twin of [`JobStore::listen_for_jobs`]. Blocks until the listener fails.
        fn listen_for_jobs(&self, queues: Option<&[String]>, notify: Arc<Notify>) -> Result<()>;
        /// Twin of [`JobStore::close`].
        fn close(&self) -> Result<()>;
    }
}

/// The PostgreSQL specific operations of a [`PostgresJobStore`].
#[derive(Clone)]
pub struct BlockingPostgresJobStore {
    runtime: Arc<Runtime>,
    store: PostgresJobStore,
}

impl BlockingPostgresJobStore {
    pub fn with_runtime(runtime: Arc<Runtime>, store: PostgresJobStore) -> Self {
        Self { runtime, store }
    }

    /// Twin of [`PostgresJobStore::connect`].
    pub fn connect(config: &DatabaseConfig) -> Result<Self> {
        let runtime = build_runtime()?;
        let store = runtime.block_on(PostgresJobStore::connect(config))?;
        Ok(Self::with_runtime(Arc::new(runtime), store))
    }

    /// Twin of [`PostgresJobStore::schema_sql`].
    pub fn schema_sql() -> &'static str {
        PostgresJobStore::schema_sql()
    }

    /// Twin of [`PostgresJobStore::connector`].
    pub fn connector(&self) -> BlockingConnector {
        BlockingConnector::with_runtime(self.runtime.clone(), self.store.connector().clone())
    }

    /// The [`JobStore`] operations of this store.
    pub fn job_store(&self) -> BlockingJobStore {
        BlockingJobStore::with_runtime(self.runtime.clone(), Arc::new(self.store.clone()))
    }

    blocking_twins! { store =>
        /// Twin of [`PostgresJobStore::apply_schema`].
        fn apply_schema(&self) -> Result<()>;
    }
}

/// A [`PgConnector`] driven synchronously.
#[derive(Clone)]
pub struct BlockingConnector {
    runtime: Arc<Runtime>,
    connector: Arc<PgConnector>,
}

impl BlockingConnector {
    /// Wrap a connector. A pool it already holds must not be bound to
    /// another runtime.
    pub fn new(connector: Arc<PgConnector>) -> Result<Self> {
        Ok(Self::with_runtime(Arc::new(build_runtime()?), connector))
    }

    pub fn with_runtime(runtime: Arc<Runtime>, connector: Arc<PgConnector>) -> Self {
        Self { runtime, connector }
    }

    /// Twin of [`PgConnector::connect`].
    pub fn connect(config: &DatabaseConfig) -> Result<Self> {
        let runtime = build_runtime()?;
        let connector = runtime.block_on(PgConnector::connect(config))?;
        Ok(Self::with_runtime(Arc::new(runtime), Arc::new(connector)))
    }

    pub fn connector(&self) -> &Arc<PgConnector> {
        &self.connector
    }

    /// Twin of [`PgConnector::execute_query`].
    pub fn execute_query<'q, F>(&self, query: F) -> Result<u64>
    where
        F: Fn() -> Query<'q, Postgres, PgArguments>,
    {
        self.runtime.block_on(self.connector.execute_query(query))
    }

    /// Twin of [`PgConnector::execute_query_one`].
    pub fn execute_query_one<'q, O, F>(&self, query: F) -> Result<O>
    where
        F: Fn() -> QueryAs<'q, Postgres, O, PgArguments>,
        O: Send + Unpin + for<'r> FromRow<'r, PgRow>,
    {
        self.runtime.block_on(self.connector.execute_query_one(query))
    }

    /// Twin of [`PgConnector::execute_query_optional`].
    pub fn execute_query_optional<'q, O, F>(&self, query: F) -> Result<Option<O>>
    where
        F: Fn() -> QueryAs<'q, Postgres, O, PgArguments>,
        O: Send + Unpin + for<'r> FromRow<'r, PgRow>,
    {
        self.runtime.block_on(self.connector.execute_query_optional(query))
    }

    /// Twin of [`PgConnector::execute_query_all`].
    pub fn execute_query_all<'q, O, F>(&self, query: F) -> Result<Vec<O>>
    where
        F: Fn() -> QueryAs<'q, Postgres, O, PgArguments>,
        O: Send + Unpin + for<'r> FromRow<'r, PgRow>,
    {
        self.runtime.block_on(self.connector.execute_query_all(query))
    }

    blocking_twins! { connector =>
        /// Twin of [`PgConnector::execute_script`].
        fn execute_script(&self, script: &str) -> Result<()>;
        /// Twin of [`PgConnector::listen_notify`].
        fn listen_notify(&self, channels: &[String], notify: Arc<Notify>) -> Result<()>;
        /// Twin of [`PgConnector::close`].
        fn close(&self) -> Result<()>;
    }
}

/// An [`App`] whose deferrers and workers block.
#[derive(Clone)]
pub struct BlockingApp {
    runtime: Arc<Runtime>,
    app: App,
}

impl BlockingApp {
    pub fn new(app: App) -> Result<Self> {
        Ok(Self::with_runtime(Arc::new(build_runtime()?), app))
    }

    pub fn with_runtime(runtime: Arc<Runtime>, app: App) -> Self {
        Self { runtime, app }
    }

    /// Twin of [`App::connect`].
    pub fn connect(config: LaterworkConfig) -> Result<Self> {
        let runtime = build_runtime()?;
        let app = runtime.block_on(App::connect(config))?;
        Ok(Self::with_runtime(Arc::new(runtime), app))
    }

    pub fn app(&self) -> &App {
        &self.app
    }

    /// Shared by every wrapper this app hands out.
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// [`App::configure_task`], returning a blocking deferrer.
    pub fn configure_task(
        &self,
        task_name: &str,
        options: JobOptions,
        allow_unknown: bool,
    ) -> Result<BlockingJobDeferrer> {
        let deferrer = self.app.configure_task(task_name, options, allow_unknown)?;
        Ok(BlockingJobDeferrer {
            runtime: self.runtime.clone(),
            deferrer,
        })
    }

    /// [`App::worker`], run synchronously. Configure it further with
    /// [`BlockingWorker::with_runtime`] and [`BlockingApp::runtime`].
    pub fn worker(&self) -> BlockingWorker {
        BlockingWorker::with_runtime(self.runtime.clone(), self.app.worker())
    }

    pub fn store(&self) -> BlockingJobStore {
        BlockingJobStore::with_runtime(self.runtime.clone(), self.app.store().clone())
    }
}

/// A [`JobDeferrer`] driven synchronously.
#[derive(Clone)]
pub struct BlockingJobDeferrer {
    runtime: Arc<Runtime>,
    deferrer: JobDeferrer,
}

impl BlockingJobDeferrer {
    pub fn with_runtime(runtime: Arc<Runtime>, deferrer: JobDeferrer) -> Self {
        Self { runtime, deferrer }
    }

    /// Twin of [`JobDeferrer::job`].
    pub fn job(&self) -> &NewJob {
        self.deferrer.job()
    }

    blocking_twins! { deferrer =>
        /// Twin of [`JobDeferrer::defer`].
        fn defer(&self, args: JobArgs) -> Result<JobId>;
    }
}

/// A [`Worker`] driven synchronously. Stop it from another thread with
/// [`BlockingWorker::handle`].
pub struct BlockingWorker {
    runtime: Arc<Runtime>,
    worker: Worker,
}

impl BlockingWorker {
    pub fn new(worker: Worker) -> Result<Self> {
        Ok(Self::with_runtime(Arc::new(build_runtime()?), worker))
    }

    pub fn with_runtime(runtime: Arc<Runtime>, worker: Worker) -> Self {
        Self { runtime, worker }
    }

    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    pub fn handle(&self) -> WorkerHandle {
        self.worker.handle()
    }

    blocking_twins! { worker =>
        /// Twin of [`Worker::run`].
        fn run(&self) -> Result<()>;
        /// Twin of [`Worker::run_until_empty`].
        fn run_until_empty(&self) -> Result<()>;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        LaterworkError,
        app::parse_json_args,
        store::InMemoryJobStore,
        task::{JobContext, Task},
    };
    use async_trait::async_trait;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    /// Refuses to hand out jobs from the `paused` queue.
    #[derive(Default)]
    struct PausingStore {
        inner: InMemoryJobStore,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl JobStore for PausingStore {
        async fn defer_job(&self, job: NewJob) -> Result<JobId> {
            self.inner.defer_job(job).await
        }

        async fn fetch_job(&self, queues: Option<&[String]>) -> Result<Option<Job>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let job = self.inner.fetch_job(queues).await?;
            Ok(job.filter(|job| job.queue_name != "paused"))
        }

        async fn finish_job(
            &self,
            job_id: JobId,
            status: JobStatus,
            retry_at: Option<DateTime<Utc>>,
        ) -> Result<()> {
            self.inner.finish_job(job_id, status, retry_at).await
        }

        async fn get_job(&self, job_id: JobId) -> Result<Option<Job>> {
            self.inner.get_job(job_id).await
        }

        async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
            self.inner.list_jobs(filter).await
        }

        async fn listen_for_jobs(&self, queues: Option<&[String]>, notify: Arc<Notify>) -> Result<()> {
            self.inner.listen_for_jobs(queues, notify).await
        }
    }

    fn runtime() -> Runtime {
        build_runtime().unwrap()
    }

    #[test]
    fn test_twins_match_async_results() {
        let async_store = InMemoryJobStore::new();
        let blocking = BlockingJobStore::new(Arc::new(InMemoryJobStore::new())).unwrap();
        let rt = runtime();

        let job = NewJob::new("hello").with_lock("sherlock");
        let async_id = rt.block_on(async_store.defer_job(job.clone())).unwrap();
        let blocking_id = blocking.defer_job(job).unwrap();
        assert_eq!(async_id, blocking_id);

        let fetched_async = rt.block_on(async_store.fetch_job(None)).unwrap().unwrap();
        let fetched_blocking = blocking.fetch_job(None).unwrap().unwrap();
        assert_eq!(fetched_async.id, fetched_blocking.id);
        assert_eq!(fetched_async.status, fetched_blocking.status);
        assert_eq!(fetched_async.lock, fetched_blocking.lock);

        blocking.finish_job(blocking_id, JobStatus::Succeeded, None).unwrap();
        let err = blocking
            .finish_job(blocking_id, JobStatus::Failed, None)
            .unwrap_err();
        let async_err = rt
            .block_on(async {
                async_store.finish_job(async_id, JobStatus::Succeeded, None).await?;
                async_store.finish_job(async_id, JobStatus::Failed, None).await
            })
            .unwrap_err();
        assert_eq!(err.to_string(), async_err.to_string());
        assert!(matches!(err, LaterworkError::JobNotInDoing { .. }));

        let listed = blocking
            .list_jobs(&JobFilter {
                status: Some(JobStatus::Succeeded),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert!(blocking.get_job(42).unwrap().is_none());
        blocking.close().unwrap();
    }

    #[test]
    fn test_twins_dispatch_to_overrides() {
        let store = Arc::new(PausingStore::default());
        let blocking = BlockingJobStore::new(store.clone()).unwrap();

        blocking.defer_job(NewJob::new("hello").on_queue("paused")).unwrap();
        assert!(blocking.fetch_job(None).unwrap().is_none());
        assert_eq!(store.fetches.load(Ordering::SeqCst), 1);

        let rt = runtime();
        assert!(rt.block_on(store.fetch_job(None)).unwrap().is_none());
        assert_eq!(store.fetches.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_type_level_twin() {
        assert_eq!(BlockingJobStore::schema_sql(), PostgresJobStore::schema_sql());
        assert_eq!(BlockingPostgresJobStore::schema_sql(), PostgresJobStore::schema_sql());
    }

    fn app() -> App {
        App::new(Arc::new(InMemoryJobStore::new()))
            .with_task(Task::new("ok", |_ctx: JobContext| async { Ok(()) }).on_queue("greetings"))
            .with_task(Task::new("boom", |_ctx: JobContext| async { Err("boom".into()) }))
    }

    fn statuses(jobs: Vec<Job>) -> Vec<(JobId, JobStatus)> {
        jobs.into_iter().map(|job| (job.id, job.status)).collect()
    }

    #[test]
    fn test_deferrer_twin_matches_async() {
        let rt = runtime();
        let async_app = app();
        let blocking = BlockingApp::new(app()).unwrap();
        let args = parse_json_args(Some(r#"{"a": 1}"#)).unwrap();

        let async_id = rt
            .block_on(
                async_app
                    .configure_task("ok", JobOptions::new().lock("sherlock"), false)
                    .unwrap()
                    .defer(args.clone()),
            )
            .unwrap();
        let deferrer = blocking
            .configure_task("ok", JobOptions::new().lock("sherlock"), false)
            .unwrap();
        assert_eq!(deferrer.job().queue_name, "greetings");
        let blocking_id = deferrer.defer(args).unwrap();
        assert_eq!(async_id, blocking_id);

        let deferred = rt.block_on(async_app.store().get_job(async_id)).unwrap().unwrap();
        let blocking_deferred = blocking.store().get_job(blocking_id).unwrap().unwrap();
        assert_eq!(deferred.queue_name, blocking_deferred.queue_name);
        assert_eq!(deferred.lock, blocking_deferred.lock);
        assert_eq!(deferred.args, blocking_deferred.args);
        assert_eq!(deferred.status, blocking_deferred.status);

        let err = blocking
            .configure_task("missing", JobOptions::new(), false)
            .err()
            .unwrap();
        let async_err = async_app
            .configure_task("missing", JobOptions::new(), false)
            .err()
            .unwrap();
        assert_eq!(err.to_string(), async_err.to_string());
    }

    #[test]
    fn test_worker_twin_matches_async() {
        let rt = runtime();
        let async_app = app();
        let blocking = BlockingApp::new(app()).unwrap();

        for task in ["ok", "boom"] {
            rt.block_on(
                async_app
                    .configure_task(task, JobOptions::new(), false)
                    .unwrap()
                    .defer(JobArgs::new()),
            )
            .unwrap();
            blocking
                .configure_task(task, JobOptions::new(), false)
                .unwrap()
                .defer(JobArgs::new())
                .unwrap();
        }

        rt.block_on(async_app.worker().run_until_empty()).unwrap();
        blocking.worker().run_until_empty().unwrap();

        let expected = vec![(1, JobStatus::Succeeded), (2, JobStatus::Failed)];
        let filter = JobFilter::default();
        assert_eq!(
            statuses(rt.block_on(async_app.store().list_jobs(&filter)).unwrap()),
            expected
        );
        assert_eq!(statuses(blocking.store().list_jobs(&filter).unwrap()), expected);
    }

    #[test]
    fn test_worker_twin_stops_from_another_thread() {
        let app = App::new(Arc::new(InMemoryJobStore::new()))
            .with_config(LaterworkConfig::new().with_polling_interval(Duration::from_millis(20)));
        let worker = BlockingApp::new(app).unwrap().worker();
        let handle = worker.handle();

        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            handle.stop();
        });
        worker.run().unwrap();
        stopper.join().unwrap();
    }

    #[test]
    fn test_connector_twins_match_async() {
        let rt = runtime();
        let connector = Arc::new(PgConnector::new());
        let blocking = BlockingConnector::new(connector.clone()).unwrap();

        let err = blocking.execute_script("SELECT 1").unwrap_err();
        let async_err = rt.block_on(connector.execute_script("SELECT 1")).unwrap_err();
        assert!(matches!(err, LaterworkError::PoolNotSet));
        assert_eq!(err.to_string(), async_err.to_string());

        let err = blocking
            .execute_query_one(|| sqlx::query_as::<_, (i32,)>("SELECT 1"))
            .unwrap_err();
        assert!(matches!(err, LaterworkError::PoolNotSet));
        let err = blocking
            .execute_query(|| sqlx::query("DELETE FROM laterwork_jobs"))
            .unwrap_err();
        assert!(matches!(err, LaterworkError::PoolNotSet));

        blocking.close().unwrap();
        rt.block_on(connector.close()).unwrap();
    }
}
