pub mod defer;
pub mod job;
pub mod schema;
pub mod worker;

pub use defer::DeferArgs;
pub use job::JobCommand;
pub use schema::SchemaArgs;
pub use worker::WorkerArgs;
