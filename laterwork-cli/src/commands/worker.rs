use anyhow::Result;
use clap::Args;
use laterwork::{App, ShutdownPolicy, Worker};
use std::time::Duration;
use tracing::info;

#[derive(Args, Debug)]
pub struct WorkerArgs {
    #[arg(help = "Queues to consume, all queues when omitted")]
    pub queues: Vec<String>,

    #[arg(short = 'c', long, help = "Maximum number of jobs running at once")]
    pub concurrency: Option<usize>,

    #[arg(short = 'n', long, help = "Worker name used in logs")]
    pub name: Option<String>,

    #[arg(long, help = "Seconds to wait between polls when no notification arrives")]
    pub polling_interval: Option<u64>,

    #[arg(long, help = "Run the eligible jobs, then exit")]
    pub once: bool,

    #[arg(long, help = "Cancel running jobs on Ctrl-C instead of waiting for them")]
    pub abort_on_stop: bool,
}

impl WorkerArgs {
    /// Command-line values override the app configuration.
    pub fn build(&self, app: &App) -> Worker {
        let mut worker = app.worker();
        if !self.queues.is_empty() {
            worker = worker.with_queues(self.queues.clone());
        }
        if let Some(concurrency) = self.concurrency {
            worker = worker.with_concurrency(concurrency);
        }
        if let Some(name) = &self.name {
            worker = worker.with_name(name.clone());
        }
        if let Some(seconds) = self.polling_interval {
            worker = worker.with_polling_interval(Duration::from_secs(seconds));
        }
        if self.abort_on_stop {
            worker = worker.with_shutdown_policy(ShutdownPolicy::Abort);
        }
        worker
    }

    pub async fn execute(&self, app: &App) -> Result<()> {
        let worker = self.build(app);
        println!("Launching a worker on {}", worker.queues_display());

        if self.once {
            worker.run_until_empty().await?;
            return Ok(());
        }

        let handle = worker.handle();
        let signals = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!(action = "stop_signal", "Received Ctrl-C, stopping worker");
                handle.stop();
            }
        });

        let result = worker.run().await;
        signals.abort();
        Ok(result?)
    }
}
