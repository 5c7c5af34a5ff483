use chrono::{DateTime, Utc};
use comfy_table::Table;
use laterwork::Job;
use std::fmt;

fn timestamp(at: Option<DateTime<Utc>>) -> String {
    at.map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

pub struct JobTable {
    table: Table,
    rows: usize,
}

impl Default for JobTable {
    fn default() -> Self {
        Self::new()
    }
}

impl JobTable {
    pub fn new() -> Self {
        let mut table = Table::new();
        table.set_header(vec![
            "ID",
            "Queue",
            "Call",
            "Lock",
            "Status",
            "Attempts",
            "Scheduled At",
            "Started At",
        ]);
        Self { table, rows: 0 }
    }

    pub fn add_job(&mut self, job: &Job) {
        self.table.add_row(vec![
            job.id.to_string(),
            job.queue_name.clone(),
            job.call_string(),
            job.lock.clone().unwrap_or_else(|| "-".to_string()),
            job.status.to_string(),
            job.attempts.to_string(),
            timestamp(job.scheduled_at),
            timestamp(job.started_at),
        ]);
        self.rows += 1;
    }

    pub fn len(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for JobTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.table)
    }
}

/// Every field of one job, one per row.
pub fn job_details(job: &Job) -> Table {
    let mut table = Table::new();
    table.set_header(vec!["Field", "Value"]);
    table.add_row(vec!["id".to_string(), job.id.to_string()]);
    table.add_row(vec!["task_name".to_string(), job.task_name.clone()]);
    table.add_row(vec!["queue_name".to_string(), job.queue_name.clone()]);
    table.add_row(vec![
        "lock".to_string(),
        job.lock.clone().unwrap_or_else(|| "-".to_string()),
    ]);
    table.add_row(vec![
        "args".to_string(),
        serde_json::Value::Object(job.args.clone()).to_string(),
    ]);
    table.add_row(vec!["status".to_string(), job.status.to_string()]);
    table.add_row(vec!["attempts".to_string(), job.attempts.to_string()]);
    table.add_row(vec!["queued_at".to_string(), timestamp(Some(job.queued_at))]);
    table.add_row(vec!["scheduled_at".to_string(), timestamp(job.scheduled_at)]);
    table.add_row(vec!["started_at".to_string(), timestamp(job.started_at)]);
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use laterwork::JobStatus;

    fn job() -> Job {
        let mut args = laterwork::JobArgs::new();
        args.insert("a".to_string(), serde_json::json!(1));
        Job {
            id: 7,
            queue_name: "emails".to_string(),
            task_name: "send".to_string(),
            lock: Some("smtp".to_string()),
            args,
            status: JobStatus::Failed,
            attempts: 2,
            queued_at: Utc::now(),
            scheduled_at: None,
            started_at: None,
        }
    }

    #[test]
    fn test_job_table() {
        let mut table = JobTable::new();
        assert!(table.is_empty());
        table.add_job(&job());

        let rendered = table.to_string();
        assert_eq!(table.len(), 1);
        assert!(rendered.contains("send(a=1)"));
        assert!(rendered.contains("failed"));
        assert!(rendered.contains("smtp"));
    }

    #[test]
    fn test_job_details() {
        let rendered = job_details(&job()).to_string();
        assert!(rendered.contains("{\"a\":1}"));
        assert!(rendered.contains("emails"));
    }
}
