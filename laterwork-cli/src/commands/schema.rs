use anyhow::Result;
use clap::Args;
use laterwork::{PostgresJobStore, config::DatabaseConfig};

#[derive(Args, Debug)]
pub struct SchemaArgs {
    #[arg(long, help = "Print the schema instead of applying it")]
    pub text: bool,
}

impl SchemaArgs {
    pub async fn execute(&self, config: &DatabaseConfig) -> Result<()> {
        if self.text {
            println!("{}", PostgresJobStore::schema_sql());
            return Ok(());
        }

        println!("Launching migrations");
        let store = PostgresJobStore::connect(config).await?;
        store.apply_schema().await?;
        store.connector().close().await?;
        println!("Done");
        Ok(())
    }
}
