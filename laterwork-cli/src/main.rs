use laterwork::TaskRegistry;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    laterwork_cli::run(TaskRegistry::new()).await
}
