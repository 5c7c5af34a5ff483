use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type JobId = i64;

/// Arguments handed to a task. Always a JSON object.
pub type JobArgs = serde_json::Map<String, serde_json::Value>;

pub const DEFAULT_QUEUE: &str = "default";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Todo,
    Doing,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Todo => "todo",
            JobStatus::Doing => "doing",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "todo" => Some(JobStatus::Todo),
            "doing" => Some(JobStatus::Doing),
            "succeeded" => Some(JobStatus::Succeeded),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job as stored and exposed for inspection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub queue_name: String,
    pub task_name: String,
    pub lock: Option<String>,
    pub args: JobArgs,
    pub status: JobStatus,
    pub attempts: i32,
    pub queued_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Whether the job may be claimed at `now`, ignoring lock occupancy.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Todo && self.scheduled_at.is_none_or(|at| at <= now)
    }

    /// `task_name(a=1, b="x")`, used in logs and CLI output.
    pub fn call_string(&self) -> String {
        describe_call(&self.task_name, &self.args)
    }
}

pub fn describe_call(task_name: &str, args: &JobArgs) -> String {
    let rendered = args
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join(", ");
    format!("{}({})", task_name, rendered)
}

/// Everything needed to insert a job. The store assigns id, status and
/// timestamps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewJob {
    pub queue_name: String,
    pub task_name: String,
    pub lock: Option<String>,
    pub args: JobArgs,
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn new(task_name: impl Into<String>) -> Self {
        Self {
            queue_name: DEFAULT_QUEUE.to_string(),
            task_name: task_name.into(),
            lock: None,
            args: JobArgs::new(),
            scheduled_at: None,
        }
    }

    pub fn on_queue(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = queue_name.into();
        self
    }

    pub fn with_lock(mut self, lock: impl Into<String>) -> Self {
        self.lock = Some(lock.into());
        self
    }

    pub fn with_args(mut self, args: JobArgs) -> Self {
        self.args = args;
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }
}
