//! In-process job store.
//!
//! Same contract as the PostgreSQL store, with a single mutex standing in for
//! row locks. Time comes from the system clock, or from a [`MockClock`] when
//! tests need to move it by hand.

use super::{JobFilter, JobStore};
use crate::{
    LaterworkError, Result,
    job::{Job, JobId, JobStatus, NewJob},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::sync::Notify;

/// Manually driven clock.
#[derive(Debug, Clone)]
pub struct MockClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl MockClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(later) = chrono::Duration::from_std(by)
            .ok()
            .and_then(|by| now.checked_add_signed(by))
        {
            *now = later;
        }
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

struct Listener {
    id: u64,
    queues: Option<Vec<String>>,
    notify: Arc<Notify>,
}

impl Listener {
    fn wants(&self, queue_name: &str) -> bool {
        self.queues
            .as_ref()
            .is_none_or(|queues| queues.iter().any(|queue| queue == queue_name))
    }
}

#[derive(Default)]
struct State {
    next_id: JobId,
    next_listener: u64,
    jobs: BTreeMap<JobId, Job>,
    listeners: Vec<Listener>,
}

/// [`JobStore`] keeping jobs in memory.
#[derive(Default)]
pub struct InMemoryJobStore {
    state: Mutex<State>,
    clock: Option<MockClock>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(clock: MockClock) -> Self {
        Self {
            state: Mutex::default(),
            clock: Some(clock),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.as_ref().map_or_else(Utc::now, MockClock::now)
    }

    /// Every job, by id.
    pub fn jobs(&self) -> Vec<Job> {
        self.state().jobs.values().cloned().collect()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes a listener when its `listen_for_jobs` future is dropped.
struct Registration<'a> {
    store: &'a InMemoryJobStore,
    id: u64,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.store.state().listeners.retain(|listener| listener.id != self.id);
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn defer_job(&self, job: NewJob) -> Result<JobId> {
        let now = self.now();
        let mut state = self.state();
        state.next_id += 1;
        let id = state.next_id;

        state.jobs.insert(
            id,
            Job {
                id,
                queue_name: job.queue_name,
                task_name: job.task_name,
                lock: job.lock,
                args: job.args,
                status: JobStatus::Todo,
                attempts: 0,
                queued_at: now,
                scheduled_at: job.scheduled_at,
                started_at: None,
            },
        );

        let queue_name = &state.jobs[&id].queue_name;
        for listener in state.listeners.iter().filter(|listener| listener.wants(queue_name)) {
            listener.notify.notify_one();
        }
        Ok(id)
    }

    async fn fetch_job(&self, queues: Option<&[String]>) -> Result<Option<Job>> {
        let now = self.now();
        let mut state = self.state();

        let candidate = state
            .jobs
            .values()
            .filter(|job| job.is_eligible(now))
            .filter(|job| queues.is_none_or(|queues| queues.contains(&job.queue_name)))
            .filter(|job| {
                job.lock.as_ref().is_none_or(|lock| {
                    !state
                        .jobs
                        .values()
                        .any(|other| other.status == JobStatus::Doing && other.lock.as_ref() == Some(lock))
                })
            })
            .min_by_key(|job| (job.scheduled_at, job.queued_at, job.id))
            .map(|job| job.id);

        Ok(candidate.and_then(|id| {
            let job = state.jobs.get_mut(&id)?;
            job.status = JobStatus::Doing;
            job.started_at = Some(now);
            Some(job.clone())
        }))
    }

    async fn finish_job(
        &self,
        job_id: JobId,
        status: JobStatus,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        if retry_at.is_none() && !status.is_terminal() {
            return Err(LaterworkError::InvalidArguments {
                message: format!("cannot finish job {} as {}", job_id, status),
            });
        }

        let mut state = self.state();
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(LaterworkError::JobNotFound { id: job_id })?;
        if job.status != JobStatus::Doing {
            return Err(LaterworkError::JobNotInDoing {
                id: job_id,
                status: job.status.to_string(),
            });
        }

        match retry_at {
            Some(retry_at) => {
                job.status = JobStatus::Todo;
                job.attempts += 1;
                job.scheduled_at = Some(retry_at);
            }
            None => job.status = status,
        }
        Ok(())
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>> {
        Ok(self.state().jobs.get(&job_id).cloned())
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        Ok(self
            .state()
            .jobs
            .values()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect())
    }

    async fn listen_for_jobs(&self, queues: Option<&[String]>, notify: Arc<Notify>) -> Result<()> {
        let id = {
            let mut state = self.state();
            state.next_listener += 1;
            let id = state.next_listener;
            state.listeners.push(Listener {
                id,
                queues: queues.map(<[String]>::to_vec),
                notify,
            });
            id
        };
        let _registration = Registration { store: self, id };

        std::future::pending::<Result<()>>().await
    }
}
