use anyhow::Result;
use clap::Subcommand;
use laterwork::{App, JobFilter, JobId, JobStatus, JobStore, LaterworkError};

use crate::utils::{
    args::parse_status,
    display::{JobTable, job_details},
};

#[derive(Subcommand, Debug)]
pub enum JobCommand {
    #[command(about = "Show every field of a job")]
    Show {
        #[arg(help = "Job ID")]
        id: JobId,
    },
    #[command(about = "List jobs")]
    List {
        #[arg(short = 'q', long, help = "Queue name to filter by")]
        queue: Option<String>,
        #[arg(short = 's', long, value_parser = parse_status, help = "Job status to filter by")]
        status: Option<JobStatus>,
        #[arg(short = 'l', long, help = "Lock to filter by")]
        lock: Option<String>,
        #[arg(short = 't', long, help = "Task name to filter by")]
        task: Option<String>,
    },
}

impl JobCommand {
    pub async fn execute(&self, app: &App) -> Result<()> {
        match self {
            JobCommand::Show { id } => {
                let job = app
                    .store()
                    .get_job(*id)
                    .await?
                    .ok_or(LaterworkError::JobNotFound { id: *id })?;
                println!("{}", job_details(&job));
            }
            JobCommand::List { .. } => {
                let table = self.list(app).await?;
                if table.is_empty() {
                    println!("No jobs found");
                } else {
                    println!("{}", table);
                }
            }
        }
        Ok(())
    }

    fn filter(&self) -> JobFilter {
        match self {
            JobCommand::List {
                queue,
                status,
                lock,
                task,
            } => JobFilter {
                queue_name: queue.clone(),
                status: *status,
                lock: lock.clone(),
                task_name: task.clone(),
            },
            JobCommand::Show { .. } => JobFilter::default(),
        }
    }

    async fn list(&self, app: &App) -> Result<JobTable> {
        let mut table = JobTable::new();
        for job in app.store().list_jobs(&self.filter()).await? {
            table.add_job(&job);
        }
        Ok(table)
    }
}
