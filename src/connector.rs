//! The single point of contact with PostgreSQL.
//!
//! A [`PgConnector`] owns exactly one connection pool, bound once through
//! [`PgConnector::set_pool`]. Every driver failure leaving the connector is a
//! [`ConnectorError`], and queries that die because the server dropped the
//! connection are transparently replayed on a fresh connection, up to
//! `pool capacity + 1` times. After a database restart every pooled
//! connection may be stale; one extra try guarantees a freshly opened
//! connection gets its turn.
//!
//! # Examples
//!
//! ```rust,no_run
//! use laterwork::{config::DatabaseConfig, connector::PgConnector};
//!
//! # async fn example() -> laterwork::Result<()> {
//! let connector = PgConnector::connect(&DatabaseConfig::default()).await?;
//!
//! let affected = connector
//!     .execute_query(|| sqlx::query("DELETE FROM laterwork_jobs WHERE status = 'succeeded'"))
//!     .await?;
//! println!("Removed {} finished jobs", affected);
//! # Ok(())
//! # }
//! ```

use crate::{LaterworkError, Result, config::DatabaseConfig};
use sqlx::{
    FromRow, Postgres,
    postgres::{PgArguments, PgListener, PgPool, PgPoolOptions, PgRow},
    query::{Query, QueryAs},
};
use std::{
    future::Future,
    io::ErrorKind,
    sync::{Arc, OnceLock},
};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, error, warn};

/// Substring PostgreSQL (and libpq-compatible proxies) use when the server
/// went away under an open connection.
const SERVER_CLOSED_MESSAGE: &str = "server closed the connection unexpectedly";

/// A driver failure, normalized.
///
/// The original `sqlx::Error`, when there is one, stays reachable through
/// [`std::error::Error::source`].
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ConnectorError {
    message: String,
    #[source]
    source: Option<sqlx::Error>,
}

impl ConnectorError {
    /// Generic wrapping: keep the driver's message and chain the driver error.
    pub fn wrap(err: sqlx::Error) -> Self {
        Self {
            message: err.to_string(),
            source: Some(err),
        }
    }

    pub(crate) fn exhausted(tries: usize, last: sqlx::Error) -> Self {
        Self {
            message: format!("Could not get a valid connection after {} tries", tries),
            source: Some(last),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn driver_error(&self) -> Option<&sqlx::Error> {
        self.source.as_ref()
    }

    pub fn is_transient(&self) -> bool {
        self.source.as_ref().is_some_and(is_transient)
    }
}

/// Whether `err` means the connection itself died, so replaying the same
/// statement on another connection may succeed.
pub fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(io) => {
            matches!(
                io.kind(),
                ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
                    | ErrorKind::UnexpectedEof
                    | ErrorKind::NotConnected
            ) || mentions_closed_connection(&io.to_string())
        }
        sqlx::Error::Database(db) => {
            // Class 08 is "connection exception", 57P01..57P03 are the
            // shutdown/crash codes a restarting server sends.
            db.code().is_some_and(|code| {
                code.starts_with("08") || matches!(code.as_ref(), "57P01" | "57P02" | "57P03")
            }) || mentions_closed_connection(db.message())
        }
        sqlx::Error::Protocol(message) => mentions_closed_connection(message),
        _ => false,
    }
}

fn mentions_closed_connection(message: &str) -> bool {
    message.contains(SERVER_CLOSED_MESSAGE)
}

/// Run `attempt` until it succeeds, fails with a non-transient error, or
/// `max_tries` transient failures happened.
///
/// `attempt` must build a brand new query each time: the pool hands out
/// another connection on every call, and broken ones are dropped on the way.
pub async fn retry_query<T, F, Fut>(max_tries: usize, mut attempt: F) -> std::result::Result<T, ConnectorError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let max_tries = max_tries.max(1);
    let mut tries = 0;

    loop {
        tries += 1;
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(err) if is_transient(&err) => {
                if tries >= max_tries {
                    error!(
                        action = "query_giveup",
                        tries,
                        error = %err,
                        "Could not get a valid connection after {} tries",
                        tries
                    );
                    return Err(ConnectorError::exhausted(tries, err));
                }
                warn!(
                    action = "query_retry",
                    attempt = tries,
                    max_tries,
                    error = %err,
                    "Connection lost while running a query, retrying on another connection"
                );
            }
            Err(err) => return Err(ConnectorError::wrap(err)),
        }
    }
}

/// Owns the connection pool and runs every query of the crate.
#[derive(Debug, Default)]
pub struct PgConnector {
    pool: OnceLock<PgPool>,
}

impl PgConnector {
    /// A connector with no pool yet. Bind one with [`PgConnector::set_pool`].
    pub fn new() -> Self {
        Self::default()
    }

    /// A connector bound to `pool`.
    pub fn with_pool(pool: PgPool) -> Self {
        let connector = Self::new();
        // A fresh OnceLock cannot be set already.
        let _ = connector.pool.set(pool);
        connector
    }

    /// Build a pool from configuration. This is the only place the crate
    /// creates a pool.
    pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool> {
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(config.connection_timeout)
            .connect(&config.url)
            .await
            .map_err(ConnectorError::wrap)?;
        Ok(pool)
    }

    /// Create a pool from `config` and bind it to a new connector.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = Self::create_pool(config).await?;
        Ok(Self::with_pool(pool))
    }

    /// Bind the pool. Works once per connector; later calls fail with
    /// [`LaterworkError::PoolAlreadySet`] and keep the first pool.
    pub fn set_pool(&self, pool: PgPool) -> Result<()> {
        self.pool
            .set(pool)
            .map_err(|_| LaterworkError::PoolAlreadySet)
    }

    pub fn pool(&self) -> Result<&PgPool> {
        self.pool.get().ok_or(LaterworkError::PoolNotSet)
    }

    /// Maximum number of connections the bound pool may open.
    pub fn capacity(&self) -> Result<u32> {
        Ok(self.pool()?.options().get_max_connections())
    }

    /// Query attempts allowed before giving up on transient failures.
    pub fn max_tries(&self) -> Result<usize> {
        Ok(self.capacity()? as usize + 1)
    }

    /// Run a statement and return the number of affected rows.
    pub async fn execute_query<'q, F>(&self, query: F) -> Result<u64>
    where
        F: Fn() -> Query<'q, Postgres, PgArguments>,
    {
        let pool = self.pool()?;
        let result = retry_query(self.max_tries()?, || query().execute(pool)).await?;
        Ok(result.rows_affected())
    }

    /// Run a query that must return exactly one row.
    pub async fn execute_query_one<'q, O, F>(&self, query: F) -> Result<O>
    where
        F: Fn() -> QueryAs<'q, Postgres, O, PgArguments>,
        O: Send + Unpin + for<'r> FromRow<'r, PgRow>,
    {
        let pool = self.pool()?;
        Ok(retry_query(self.max_tries()?, || query().fetch_one(pool)).await?)
    }

    /// Run a query returning at most one row.
    pub async fn execute_query_optional<'q, O, F>(&self, query: F) -> Result<Option<O>>
    where
        F: Fn() -> QueryAs<'q, Postgres, O, PgArguments>,
        O: Send + Unpin + for<'r> FromRow<'r, PgRow>,
    {
        let pool = self.pool()?;
        Ok(retry_query(self.max_tries()?, || query().fetch_optional(pool)).await?)
    }

    /// Run a query and collect every row.
    pub async fn execute_query_all<'q, O, F>(&self, query: F) -> Result<Vec<O>>
    where
        F: Fn() -> QueryAs<'q, Postgres, O, PgArguments>,
        O: Send + Unpin + for<'r> FromRow<'r, PgRow>,
    {
        let pool = self.pool()?;
        Ok(retry_query(self.max_tries()?, || query().fetch_all(pool)).await?)
    }

    /// Run a multi-statement script without bind parameters.
    pub async fn execute_script(&self, script: &str) -> Result<()> {
        let pool = self.pool()?;
        retry_query(self.max_tries()?, || sqlx::raw_sql(script).execute(pool)).await?;
        Ok(())
    }

    /// Subscribe to `channels` and call `notify.notify_one()` on every
    /// notification, until the future is dropped.
    ///
    /// The listener holds a pool connection for its whole life. With a pool
    /// of capacity one that would starve every other query, so in that case
    /// the method logs `listen_notify_disabled` and returns at once, leaving
    /// workers on polling alone.
    pub async fn listen_notify(&self, channels: &[String], notify: Arc<Notify>) -> Result<()> {
        let pool = self.pool()?;
        if pool.options().get_max_connections() <= 1 {
            warn!(
                action = "listen_notify_disabled",
                "Pool has a single connection, listen/notify is disabled and workers will only poll"
            );
            return Ok(());
        }

        let mut listener = PgListener::connect_with(pool)
            .await
            .map_err(ConnectorError::wrap)?;
        listener
            .listen_all(channels.iter().map(String::as_str))
            .await
            .map_err(ConnectorError::wrap)?;
        debug!(action = "listen_notify_start", channels = ?channels, "Listening for new jobs");

        loop {
            let notification = listener.recv().await.map_err(ConnectorError::wrap)?;
            debug!(
                action = "listen_notify_received",
                channel = notification.channel(),
                payload = notification.payload(),
                "Received job notification"
            );
            notify.notify_one();
        }
    }

    /// Close the pool, waiting for checked out connections to come back.
    pub async fn close(&self) -> Result<()> {
        if let Some(pool) = self.pool.get() {
            pool.close().await;
        }
        Ok(())
    }
}
