//! # Laterwork CLI
//!
//! Command-line front end for laterwork job queues.
//!
//! ```bash
//! # Create the table, indexes and notification trigger
//! laterwork schema
//!
//! # Defer a job
//! laterwork defer --lock sherlock --unknown hello '{"a": 1}'
//!
//! # Run a worker on two queues
//! laterwork worker emails reports --concurrency 4
//!
//! # Inspect jobs
//! laterwork job list --status failed
//! laterwork job show 42
//! ```
//!
//! The `laterwork` binary has no tasks of its own, so it can defer jobs
//! (with `--unknown`) but every job its workers pick up fails as unknown.
//! Applications ship their own binary instead and hand their tasks to
//! [`run`]:
//!
//! ```rust,no_run
//! use laterwork::{Task, TaskRegistry, task::JobContext};
//!
//! #[tokio::main]
//! async fn main() -> std::process::ExitCode {
//!     let mut tasks = TaskRegistry::new();
//!     tasks.register(Task::new("hello", |_ctx: JobContext| async { Ok(()) }));
//!     laterwork_cli::run(tasks).await
//! }
//! ```
//!
//! ## Configuration
//!
//! Settings come from `--config <file>` (TOML) or from the `LATERWORK_*`
//! environment variables. `--database-url` overrides both.

pub mod commands;
pub mod utils;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use laterwork::{App, ConnectorError, LaterworkConfig, LaterworkError, TaskRegistry};
use std::{path::PathBuf, process::ExitCode};
use tracing::debug;
use tracing_subscriber::{EnvFilter, filter::Directive};

use crate::commands::{DeferArgs, JobCommand, SchemaArgs, WorkerArgs};

#[derive(Parser, Debug)]
#[command(name = "laterwork")]
#[command(about = "Defer and run laterwork jobs")]
#[command(version, propagate_version = true)]
pub struct Cli {
    #[arg(short, long, global = true, action = ArgAction::Count, help = "Increase verbosity (-v for debug logs)")]
    pub verbose: u8,

    #[arg(long, global = true, help = "Path to a TOML configuration file")]
    pub config: Option<PathBuf>,

    #[arg(
        short = 'u',
        long,
        global = true,
        env = "LATERWORK_DATABASE_URL",
        help = "Database connection URL"
    )]
    pub database_url: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    #[command(about = "Create a job")]
    Defer(DeferArgs),

    #[command(about = "Run a worker")]
    Worker(WorkerArgs),

    #[command(about = "Apply or print the database schema")]
    Schema(SchemaArgs),

    #[command(about = "Inspect jobs")]
    Job {
        #[command(subcommand)]
        command: JobCommand,
    },
}

impl Cli {
    pub fn load_config(&self) -> laterwork::Result<LaterworkConfig> {
        let config = match &self.config {
            Some(path) => LaterworkConfig::from_file(&path.to_string_lossy())?,
            None => LaterworkConfig::from_env()?,
        };
        Ok(match &self.database_url {
            Some(url) => config.with_database_url(url),
            None => config,
        })
    }

    /// `-v` forces debug logs, otherwise the configured level applies.
    pub fn log_level<'a>(&self, config: &'a LaterworkConfig) -> &'a str {
        if self.verbose >= 1 {
            "debug"
        } else {
            config.logging.level.as_str()
        }
    }
}

pub fn setup_logging(level: &str) -> Result<()> {
    let directive = |target: &str| {
        format!("{}={}", target, level)
            .parse::<Directive>()
            .map_err(|err| LaterworkError::Config(format!("Invalid log level {:?}: {}", level, err)))
    };
    let env_filter = EnvFilter::from_default_env()
        .add_directive(directive("laterwork")?)
        .add_directive(directive("laterwork_cli")?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_level(true)
        .init();

    debug!(action = "set_log_level", level, "Log level set to {}", level);
    Ok(())
}

/// Parse the process arguments and run the command with `tasks` registered.
///
/// See [`exit_code`] for how failures are reported.
pub async fn run(tasks: TaskRegistry) -> ExitCode {
    let cli = Cli::parse();
    exit_code(execute(cli, tasks).await)
}

/// Whether laterwork itself reported `err`, as opposed to a bug escaping
/// from somewhere else.
pub fn is_laterwork_error(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.is::<LaterworkError>() || cause.is::<ConnectorError>())
}

/// Laterwork errors are printed as `Error: ...` and turn into exit status 1.
/// Anything else panics with its full report.
pub fn exit_code(result: Result<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) if is_laterwork_error(&err) => {
            eprintln!("Error: {:#}", err);
            ExitCode::from(1)
        }
        Err(err) => panic!("unexpected failure: {:?}", err),
    }
}

pub async fn execute(cli: Cli, tasks: TaskRegistry) -> Result<()> {
    let config = cli.load_config()?;
    setup_logging(cli.log_level(&config))?;

    match &cli.command {
        Command::Schema(args) => args.execute(&config.database).await,
        Command::Defer(args) => {
            args.execute(&connect(config, tasks).await?).await?;
            Ok(())
        }
        Command::Worker(args) => args.execute(&connect(config, tasks).await?).await,
        Command::Job { command } => command.execute(&connect(config, tasks).await?).await,
    }
}

async fn connect(config: LaterworkConfig, tasks: TaskRegistry) -> Result<App> {
    Ok(App::connect(config).await?.with_tasks(tasks))
}
