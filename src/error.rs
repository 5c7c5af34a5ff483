use crate::{connector::ConnectorError, job::JobId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LaterworkError {
    #[error(transparent)]
    Connector(#[from] ConnectorError),

    #[error("Pool is already set on this connector")]
    PoolAlreadySet,

    #[error("No pool bound to this connector, call set_pool first")]
    PoolNotSet,

    #[error("Job not found: {id}")]
    JobNotFound { id: JobId },

    #[error("Job {id} was not in doing status (found {status})")]
    JobNotInDoing { id: JobId, status: String },

    #[error("Task not found: {name}")]
    TaskNotFound { name: String },

    #[error("Invalid job arguments: {message}")]
    InvalidArguments { message: String },

    #[error("Invalid schedule: {message}")]
    InvalidSchedule { message: String },

    #[error("Worker error: {message}")]
    Worker { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl LaterworkError {
    /// Errors caused by what the caller asked for, as opposed to the
    /// database or the worker misbehaving.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            LaterworkError::TaskNotFound { .. }
                | LaterworkError::InvalidArguments { .. }
                | LaterworkError::InvalidSchedule { .. }
                | LaterworkError::Config(_)
        )
    }
}

impl From<sqlx::Error> for LaterworkError {
    fn from(err: sqlx::Error) -> Self {
        LaterworkError::Connector(ConnectorError::wrap(err))
    }
}

impl From<toml::de::Error> for LaterworkError {
    fn from(err: toml::de::Error) -> Self {
        LaterworkError::Config(format!("TOML deserialization error: {}", err))
    }
}

impl From<toml::ser::Error> for LaterworkError {
    fn from(err: toml::ser::Error) -> Self {
        LaterworkError::Config(format!("TOML serialization error: {}", err))
    }
}
