//! Job lifecycle storage.
//!
//! The [`JobStore`] trait is the only way jobs change state. Workers and the
//! [`App`](crate::App) request transitions, stores perform them atomically.
//! [`PostgresJobStore`] is the production backend; [`InMemoryJobStore`]
//! implements the same contract in process, for tests and embedding.

use crate::{
    Result,
    job::{Job, JobId, JobStatus, NewJob},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Notify;

pub mod memory;
pub mod postgres;

pub use memory::{InMemoryJobStore, MockClock};
pub use postgres::PostgresJobStore;

/// Channel notified on every insert, whatever the queue.
pub const ANY_QUEUE_CHANNEL: &str = "laterwork_any_queue";

/// Channel notified on inserts into `queue_name`.
pub fn queue_channel(queue_name: &str) -> String {
    format!("laterwork_queue#{}", queue_name)
}

/// Channels a worker consuming `queues` (`None` for all) must listen to.
pub fn channels_for(queues: Option<&[String]>) -> Vec<String> {
    match queues {
        Some(queues) => queues.iter().map(|queue| queue_channel(queue)).collect(),
        None => vec![ANY_QUEUE_CHANNEL.to_string()],
    }
}

/// Filter for [`JobStore::list_jobs`]. Empty means every job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobFilter {
    pub queue_name: Option<String>,
    pub status: Option<JobStatus>,
    pub lock: Option<String>,
    pub task_name: Option<String>,
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        self.queue_name.as_ref().is_none_or(|queue| *queue == job.queue_name)
            && self.status.is_none_or(|status| status == job.status)
            && self
                .lock
                .as_ref()
                .is_none_or(|lock| job.lock.as_ref() == Some(lock))
            && self.task_name.as_ref().is_none_or(|task| *task == job.task_name)
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a `todo` job with no attempts and return its id. Never looks
    /// at lock occupancy.
    async fn defer_job(&self, job: NewJob) -> Result<JobId>;

    /// Atomically claim the next eligible job of `queues` (`None` for every
    /// queue) whose lock is free, moving it to `doing`.
    ///
    /// Jobs are claimed by `scheduled_at` (unscheduled first), then
    /// `queued_at`, then `id`.
    async fn fetch_job(&self, queues: Option<&[String]>) -> Result<Option<Job>>;

    /// Retire a `doing` job.
    ///
    /// With `retry_at`, the job goes back to `todo`, scheduled at `retry_at`,
    /// with one more attempt, and `status` is ignored. Without it, `status`
    /// must be terminal. A job that is not `doing` is left untouched and
    /// [`LaterworkError::JobNotInDoing`](crate::LaterworkError::JobNotInDoing)
    /// is returned.
    async fn finish_job(
        &self,
        job_id: JobId,
        status: JobStatus,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>>;

    /// Jobs matching `filter`, by id.
    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>>;

    /// Call `notify.notify_one()` whenever a job may have been deferred on
    /// one of `queues`. Runs until dropped; may return early when the backend
    /// cannot listen, leaving the caller to poll.
    async fn listen_for_jobs(&self, queues: Option<&[String]>, notify: Arc<Notify>) -> Result<()>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channels() {
        assert_eq!(queue_channel("emails"), "laterwork_queue#emails");
        assert_eq!(channels_for(None), vec!["laterwork_any_queue".to_string()]);
        assert_eq!(
            channels_for(Some(&["a".to_string(), "b".to_string()])),
            vec!["laterwork_queue#a".to_string(), "laterwork_queue#b".to_string()]
        );
    }
}
