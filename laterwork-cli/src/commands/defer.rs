use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::Args;
use laterwork::{App, JobId, JobOptions, app::parse_json_args, job::describe_call};
use std::time::Duration;

use crate::utils::args::parse_schedule;

#[derive(Args, Debug)]
pub struct DeferArgs {
    #[arg(help = "Name of the task")]
    pub task: String,

    #[arg(help = "Task arguments as a JSON object")]
    pub json_args: Option<String>,

    #[arg(short = 'q', long, help = "Queue, instead of the task's default")]
    pub queue: Option<String>,

    #[arg(short = 'l', long, help = "Lock, instead of the task's default")]
    pub lock: Option<String>,

    #[arg(long, value_parser = parse_schedule, conflicts_with = "in_seconds", help = "Run no earlier than this time (UTC unless an offset is given)")]
    pub at: Option<DateTime<Utc>>,

    #[arg(long = "in", value_name = "SECONDS", help = "Run no earlier than this many seconds from now")]
    pub in_seconds: Option<u64>,

    #[arg(long, help = "Defer even if the task is not registered")]
    pub unknown: bool,
}

impl DeferArgs {
    pub fn options(&self) -> JobOptions {
        let mut options = JobOptions::new();
        options.queue = self.queue.clone();
        options.lock = self.lock.clone();
        options.schedule_at = self.at;
        options.schedule_in = self.in_seconds.map(Duration::from_secs);
        options
    }

    pub async fn execute(&self, app: &App) -> Result<JobId> {
        let args = parse_json_args(self.json_args.as_deref())?;
        let deferrer = app.configure_task(&self.task, self.options(), self.unknown)?;

        println!("Launching a job: {}", describe_call(&self.task, &args));
        Ok(deferrer.defer(args).await?)
    }
}
