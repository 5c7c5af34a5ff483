//! PostgreSQL job store.
//!
//! Claiming relies on `FOR UPDATE SKIP LOCKED`: concurrent fetchers never
//! wait on each other's candidate rows and never claim the same job. Lock
//! exclusion is checked in the claim query itself and backed by a unique
//! partial index on `lock` for `doing` jobs, so two fetchers racing on the
//! same lock cannot both win. The loser simply claims again.

use super::{JobFilter, JobStore, channels_for};
use crate::{
    LaterworkError, Result,
    config::DatabaseConfig,
    connector::PgConnector,
    job::{Job, JobArgs, JobId, JobStatus, NewJob},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, types::Json};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, warn};

const SCHEMA_SQL: &str = include_str!("schema.sql");

/// SQLSTATE for unique_violation.
const UNIQUE_VIOLATION: &str = "23505";

/// Claims tried by one `fetch_job` call when each loses a lock race.
const MAX_CLAIM_ATTEMPTS: u32 = 16;

const JOB_COLUMNS: &str =
    "id, queue_name, task_name, lock, args, status, attempts, queued_at, scheduled_at, started_at";

const DEFER_JOB_SQL: &str = r#"
    INSERT INTO laterwork_jobs (queue_name, task_name, lock, args, scheduled_at)
    VALUES ($1, $2, $3, $4, $5)
    RETURNING id
"#;

const FETCH_JOB_SQL: &str = r#"
    UPDATE laterwork_jobs
    SET status = 'doing', started_at = NOW()
    WHERE id = (
        SELECT candidate.id
        FROM laterwork_jobs AS candidate
        WHERE candidate.status = 'todo'
          AND (candidate.scheduled_at IS NULL OR candidate.scheduled_at <= NOW())
          AND ($1::TEXT[] IS NULL OR candidate.queue_name = ANY($1))
          AND (
              candidate.lock IS NULL
              OR NOT EXISTS (
                  SELECT 1
                  FROM laterwork_jobs AS running
                  WHERE running.lock = candidate.lock
                    AND running.status = 'doing'
              )
          )
        ORDER BY candidate.scheduled_at ASC NULLS FIRST, candidate.queued_at ASC, candidate.id ASC
        FOR UPDATE SKIP LOCKED
        LIMIT 1
    )
    RETURNING id, queue_name, task_name, lock, args, status, attempts, queued_at, scheduled_at, started_at
"#;

const RETRY_JOB_SQL: &str = r#"
    UPDATE laterwork_jobs
    SET status = 'todo', attempts = attempts + 1, scheduled_at = $2
    WHERE id = $1 AND status = 'doing'
"#;

const FINISH_JOB_SQL: &str = r#"
    UPDATE laterwork_jobs
    SET status = $2
    WHERE id = $1 AND status = 'doing'
"#;

const JOB_STATUS_SQL: &str = "SELECT status FROM laterwork_jobs WHERE id = $1";

#[derive(FromRow)]
pub(crate) struct JobRow {
    pub id: i64,
    pub queue_name: String,
    pub task_name: String,
    pub lock: Option<String>,
    pub args: Json<JobArgs>,
    pub status: String,
    pub attempts: i32,
    pub queued_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
}

impl JobRow {
    pub fn into_job(self) -> Result<Job> {
        let status = JobStatus::parse(&self.status)
            .ok_or_else(|| decode_error(format!("unknown job status {:?}", self.status)))?;
        Ok(Job {
            id: self.id,
            queue_name: self.queue_name,
            task_name: self.task_name,
            lock: self.lock,
            args: self.args.0,
            status,
            attempts: self.attempts,
            queued_at: self.queued_at,
            scheduled_at: self.scheduled_at,
            started_at: self.started_at,
        })
    }
}

fn decode_error(message: String) -> LaterworkError {
    sqlx::Error::Decode(message.into()).into()
}

/// Whether `err` is the lock index refusing a second `doing` job.
fn is_lock_conflict(err: &LaterworkError) -> bool {
    match err {
        LaterworkError::Connector(err) => matches!(
            err.driver_error(),
            Some(sqlx::Error::Database(db)) if db.code().as_deref() == Some(UNIQUE_VIOLATION)
        ),
        _ => false,
    }
}

/// [`JobStore`] backed by the `laterwork_jobs` table.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    connector: Arc<PgConnector>,
}

impl PostgresJobStore {
    pub fn new(connector: Arc<PgConnector>) -> Self {
        Self { connector }
    }

    /// Create the pool from `config` and wrap it in a store.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        Ok(Self::new(Arc::new(PgConnector::connect(config).await?)))
    }

    pub fn connector(&self) -> &Arc<PgConnector> {
        &self.connector
    }

    /// The DDL the store expects.
    pub fn schema_sql() -> &'static str {
        SCHEMA_SQL
    }

    /// Create the table, indexes and notification trigger if missing.
    pub async fn apply_schema(&self) -> Result<()> {
        self.connector.execute_script(SCHEMA_SQL).await
    }

    async fn current_status(&self, job_id: JobId) -> Result<Option<String>> {
        let row = self
            .connector
            .execute_query_optional(|| sqlx::query_as::<_, (String,)>(JOB_STATUS_SQL).bind(job_id))
            .await?;
        Ok(row.map(|(status,)| status))
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn defer_job(&self, job: NewJob) -> Result<JobId> {
        let (id,) = self
            .connector
            .execute_query_one(|| {
                sqlx::query_as::<_, (i64,)>(DEFER_JOB_SQL)
                    .bind(&job.queue_name)
                    .bind(&job.task_name)
                    .bind(&job.lock)
                    .bind(Json(&job.args))
                    .bind(job.scheduled_at)
            })
            .await?;
        Ok(id)
    }

    async fn fetch_job(&self, queues: Option<&[String]>) -> Result<Option<Job>> {
        let queues: Option<Vec<String>> = queues.map(<[String]>::to_vec);

        // Losing a race on a lock means another claim committed a `doing`
        // job with that lock; the next attempt no longer sees it as a
        // candidate.
        for attempt in 1..=MAX_CLAIM_ATTEMPTS {
            let row = self
                .connector
                .execute_query_optional(|| sqlx::query_as::<_, JobRow>(FETCH_JOB_SQL).bind(&queues))
                .await;

            match row {
                Ok(Some(row)) => {
                    let job = row.into_job()?;
                    debug!(action = "fetch_job", job_id = job.id, queue = %job.queue_name, "Claimed job");
                    return Ok(Some(job));
                }
                Ok(None) => return Ok(None),
                Err(err) if is_lock_conflict(&err) => {
                    debug!(
                        action = "fetch_job_lock_conflict",
                        attempt,
                        "Lost a race on a job lock, claiming again"
                    );
                }
                Err(err) => return Err(err),
            }
        }

        warn!(
            action = "fetch_job_contended",
            attempts = MAX_CLAIM_ATTEMPTS,
            "Every claim attempt lost a race on a job lock"
        );
        Ok(None)
    }

    async fn finish_job(
        &self,
        job_id: JobId,
        status: JobStatus,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let affected = match retry_at {
            Some(retry_at) => {
                self.connector
                    .execute_query(|| sqlx::query(RETRY_JOB_SQL).bind(job_id).bind(retry_at))
                    .await?
            }
            None => {
                if !status.is_terminal() {
                    return Err(LaterworkError::InvalidArguments {
                        message: format!("cannot finish job {} as {}", job_id, status),
                    });
                }
                self.connector
                    .execute_query(|| sqlx::query(FINISH_JOB_SQL).bind(job_id).bind(status.as_str()))
                    .await?
            }
        };

        if affected == 0 {
            return Err(match self.current_status(job_id).await? {
                Some(status) => LaterworkError::JobNotInDoing { id: job_id, status },
                None => LaterworkError::JobNotFound { id: job_id },
            });
        }

        let new_status = if retry_at.is_some() { JobStatus::Todo } else { status };
        debug!(action = "finish_job", job_id, status = %new_status, "Finished job");
        Ok(())
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>> {
        let sql = format!("SELECT {} FROM laterwork_jobs WHERE id = $1", JOB_COLUMNS);
        self.connector
            .execute_query_optional(|| sqlx::query_as::<_, JobRow>(&sql).bind(job_id))
            .await?
            .map(JobRow::into_job)
            .transpose()
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {} FROM laterwork_jobs \
             WHERE ($1::TEXT IS NULL OR queue_name = $1) \
               AND ($2::TEXT IS NULL OR status = $2) \
               AND ($3::TEXT IS NULL OR lock = $3) \
               AND ($4::TEXT IS NULL OR task_name = $4) \
             ORDER BY id",
            JOB_COLUMNS
        );
        let status = filter.status.map(|status| status.as_str());
        self.connector
            .execute_query_all(|| {
                sqlx::query_as::<_, JobRow>(&sql)
                    .bind(&filter.queue_name)
                    .bind(status)
                    .bind(&filter.lock)
                    .bind(&filter.task_name)
            })
            .await?
            .into_iter()
            .map(JobRow::into_job)
            .collect()
    }

    async fn listen_for_jobs(&self, queues: Option<&[String]>, notify: Arc<Notify>) -> Result<()> {
        self.connector
            .listen_notify(&channels_for(queues), notify)
            .await
    }

    async fn close(&self) -> Result<()> {
        self.connector.close().await
    }
}
