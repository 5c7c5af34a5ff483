//! Tests against a live PostgreSQL. Run with
//! `DATABASE_URL=postgres://... cargo test -- --ignored`.


use laterwork::{
    App, JobFilter, JobStatus, JobStore, LaterworkError, NewJob, PgConnector, Task,
    blocking::BlockingPostgresJobStore, task::JobContext,
};
use sqlx::postgres::PgPoolOptions;
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use test_utils::{database_config, setup_postgres_store, unique_queue};
use tokio::{sync::Notify, task::JoinSet};

#[tokio::test]
#[ignore]
async fn test_defer_and_fetch() {
    let store = setup_postgres_store().await;
    let queue = unique_queue("defer");
    let mut args = laterwork::JobArgs::new();
    args.insert("a".to_string(), serde_json::json!(1));

    let id = store
        .defer_job(
            NewJob::new("hello")
                .on_queue(&queue)
                .with_lock(format!("{}_sherlock", queue))
                .with_args(args.clone()),
        )
        .await
        .unwrap();

    let job = store.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Todo);
    assert_eq!(job.attempts, 0);
    assert_eq!(job.args, args);
    assert!(job.scheduled_at.is_none());
    assert!(job.started_at.is_none());

    let fetched = store.fetch_job(Some(&[queue.clone()])).await.unwrap().unwrap();
    assert_eq!(fetched.id, id);
    assert_eq!(fetched.status, JobStatus::Doing);
    assert_eq!(fetched.attempts, 0);
    assert!(fetched.started_at.is_some());

    assert!(store.fetch_job(Some(&[queue])).await.unwrap().is_none());
}

#[tokio::test]
#[ignore]
async fn test_fetch_order_and_schedule() {
    let store = setup_postgres_store().await;
    let queue = unique_queue("order");
    let later = chrono::Utc::now() + chrono::Duration::hours(1);

    let scheduled = store
        .defer_job(NewJob::new("hello").on_queue(&queue).scheduled_at(later))
        .await
        .unwrap();
    let first = store.defer_job(NewJob::new("hello").on_queue(&queue)).await.unwrap();
    let second = store.defer_job(NewJob::new("hello").on_queue(&queue)).await.unwrap();

    let queues = [queue];
    assert_eq!(store.fetch_job(Some(&queues)).await.unwrap().unwrap().id, first);
    assert_eq!(store.fetch_job(Some(&queues)).await.unwrap().unwrap().id, second);
    assert!(store.fetch_job(Some(&queues)).await.unwrap().is_none());
    assert_eq!(
        store.get_job(scheduled).await.unwrap().unwrap().status,
        JobStatus::Todo
    );
}

#[tokio::test]
#[ignore]
async fn test_lock_exclusion_under_concurrent_fetches() {
    let store = Arc::new(setup_postgres_store().await);
    let queue = unique_queue("lock");
    let lock = format!("{}_lock", queue);
    for _ in 0..5 {
        store
            .defer_job(NewJob::new("hello").on_queue(&queue).with_lock(&lock))
            .await
            .unwrap();
    }

    let mut fetchers = JoinSet::new();
    for _ in 0..8 {
        let store = store.clone();
        let queue = queue.clone();
        fetchers.spawn(async move { store.fetch_job(Some(&[queue])).await });
    }

    let mut claimed = 0;
    while let Some(result) = fetchers.join_next().await {
        if result.unwrap().unwrap().is_some() {
            claimed += 1;
        }
    }
    assert_eq!(claimed, 1);

    let doing = store
        .list_jobs(&JobFilter {
            lock: Some(lock),
            status: Some(JobStatus::Doing),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(doing.len(), 1);
}

#[tokio::test]
#[ignore]
async fn test_finish_and_retry() {
    let store = setup_postgres_store().await;
    let queue = unique_queue("finish");
    let id = store.defer_job(NewJob::new("hello").on_queue(&queue)).await.unwrap();
    let queues = [queue];

    store.fetch_job(Some(&queues)).await.unwrap().unwrap();
    let retry_at = chrono::Utc::now() - chrono::Duration::seconds(1);
    store.finish_job(id, JobStatus::Todo, Some(retry_at)).await.unwrap();
    let job = store.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Todo);
    assert_eq!(job.attempts, 1);

    store.fetch_job(Some(&queues)).await.unwrap().unwrap();
    store.finish_job(id, JobStatus::Succeeded, None).await.unwrap();

    let err = store.finish_job(id, JobStatus::Failed, None).await.unwrap_err();
    assert!(matches!(err, LaterworkError::JobNotInDoing { ref status, .. } if status == "succeeded"));
    let err = store.finish_job(-1, JobStatus::Failed, None).await.unwrap_err();
    assert!(matches!(err, LaterworkError::JobNotFound { id: -1 }));
}

#[tokio::test]
#[ignore]
async fn test_worker_runs_jobs() {
    let store = setup_postgres_store().await;
    let queue = unique_queue("worker");
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();
    let app = App::new(Arc::new(store)).with_task(
        Task::new("count", move |_ctx: JobContext| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .on_queue(&queue),
    );

    for _ in 0..3 {
        app.configure_task("count", Default::default(), false)
            .unwrap()
            .defer(Default::default())
            .await
            .unwrap();
    }

    app.worker()
        .with_queues(vec![queue])
        .with_concurrency(2)
        .run_until_empty()
        .await
        .unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 3);
}

#[tokio::test]
#[ignore]
async fn test_listen_notify_wakes_on_insert() {
    let store = Arc::new(setup_postgres_store().await);
    let queue = unique_queue("notify");
    let notify = Arc::new(Notify::new());

    let listener = {
        let store = store.clone();
        let queue = queue.clone();
        let notify = notify.clone();
        tokio::spawn(async move { store.listen_for_jobs(Some(&[queue]), notify).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    store.defer_job(NewJob::new("hello").on_queue(&queue)).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), notify.notified())
        .await
        .expect("no notification received");
    listener.abort();
}

#[tokio::test]
#[ignore]
async fn test_query_retried_after_backend_terminated() {
    let config = database_config();
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .test_before_acquire(false)
        .connect(&config.url)
        .await
        .unwrap();
    let (pid,): (i32,) = sqlx::query_as("SELECT pg_backend_pid()")
        .fetch_one(&pool)
        .await
        .unwrap();

    let admin = PgConnector::connect(&config).await.unwrap();
    let (terminated,) = admin
        .execute_query_one(|| sqlx::query_as::<_, (bool,)>("SELECT pg_terminate_backend($1)").bind(pid))
        .await
        .unwrap();
    assert!(terminated);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let connector = PgConnector::new();
    connector.set_pool(pool).unwrap();
    assert_eq!(connector.max_tries().unwrap(), 3);

    let tries = AtomicUsize::new(0);
    let (value,) = connector
        .execute_query_one(|| {
            tries.fetch_add(1, Ordering::SeqCst);
            sqlx::query_as::<_, (i32,)>("SELECT 41 + 1")
        })
        .await
        .unwrap();

    assert_eq!(value, 42);
    assert_eq!(tries.load(Ordering::SeqCst), 2);
    admin.close().await.unwrap();
    connector.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_fetch_claims_again_after_losing_a_lock_race() {
    let store = setup_postgres_store().await;
    let queue = unique_queue("race");
    let lock = format!("{}_lock", queue);
    let first = store
        .defer_job(NewJob::new("hello").on_queue(&queue).with_lock(&lock))
        .await
        .unwrap();
    let second = store
        .defer_job(NewJob::new("hello").on_queue(&queue).with_lock(&lock))
        .await
        .unwrap();
    let free = store.defer_job(NewJob::new("hello").on_queue(&queue)).await.unwrap();

    // Another worker claims `first` and commits while the fetch below runs.
    let mut tx = store.connector().pool().unwrap().begin().await.unwrap();
    sqlx::query("UPDATE laterwork_jobs SET status = 'doing', started_at = NOW() WHERE id = $1")
        .bind(first)
        .execute(&mut *tx)
        .await
        .unwrap();
    let committer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        tx.commit().await
    });

    let fetched = store.fetch_job(Some(&[queue])).await.unwrap();
    committer.await.unwrap().unwrap();

    assert_eq!(fetched.map(|job| job.id), Some(free));
    assert_eq!(
        store.get_job(second).await.unwrap().unwrap().status,
        JobStatus::Todo
    );
    assert_eq!(
        store.get_job(first).await.unwrap().unwrap().status,
        JobStatus::Doing
    );
}

#[test]
#[ignore]
fn test_blocking_postgres_twins() {
    let store = BlockingPostgresJobStore::connect(&database_config()).unwrap();
    store.apply_schema().unwrap();
    let queue = unique_queue("blocking");
    let jobs = store.job_store();

    let id = jobs.defer_job(NewJob::new("hello").on_queue(&queue)).unwrap();
    let fetched = jobs.fetch_job(Some(&[queue])).unwrap().unwrap();
    assert_eq!(fetched.id, id);
    assert_eq!(fetched.status, JobStatus::Doing);

    let (doing,) = store
        .connector()
        .execute_query_one(|| {
            sqlx::query_as::<_, (i64,)>(
                "SELECT COUNT(*) FROM laterwork_jobs WHERE id = $1 AND status = 'doing'",
            )
            .bind(id)
        })
        .unwrap();
    assert_eq!(doing, 1);
    jobs.close().unwrap();
}
