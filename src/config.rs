//! Configuration for laterwork.
//!
//! Everything can be built in code with the `with_*` setters, loaded from a
//! TOML file, or read from `LATERWORK_*` environment variables. Durations are
//! written as human-readable strings such as `"500ms"`, `"5s"`, `"2m"` or
//! `"1h"`.

use crate::{retry::RetryPolicy, worker::ShutdownPolicy};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Serde helpers for `std::time::Duration` as human-readable strings.
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_duration(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(D::Error::custom)
    }

    pub fn format_duration(duration: Duration) -> String {
        if duration.subsec_nanos() != 0 {
            return format!("{}ms", duration.as_millis());
        }
        let secs = duration.as_secs();
        if secs == 0 {
            "0s".to_string()
        } else if secs % 86400 == 0 {
            format!("{}d", secs / 86400)
        } else if secs % 3600 == 0 {
            format!("{}h", secs / 3600)
        } else if secs % 60 == 0 {
            format!("{}m", secs / 60)
        } else {
            format!("{}s", secs)
        }
    }

    /// Parse `"250ms"`, `"30s"`, `"5m"`, `"1h"`, `"2d"` or a bare number of
    /// seconds.
    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();

        if let Ok(secs) = s.parse::<u64>() {
            return Ok(Duration::from_secs(secs));
        }

        let (number, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
            Some(0) | None => return Err(format!("Invalid duration format: {}", s)),
            Some(index) => s.split_at(index),
        };
        let number: u64 = number
            .parse()
            .map_err(|_| format!("Invalid number in duration: {}", number))?;

        let seconds_per_unit = match unit {
            "ms" => return Ok(Duration::from_millis(number)),
            "s" => 1,
            "m" => 60,
            "h" => 3600,
            "d" => 86400,
            _ => {
                return Err(format!(
                    "Invalid duration suffix: {}. Use ms, s, m, h, or d",
                    unit
                ));
            }
        };
        number
            .checked_mul(seconds_per_unit)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("Invalid number in duration: {}", number))
    }

    /// Same format, for `Option<Duration>` fields.
    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(duration) => super::serialize(duration, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            use serde::de::Error;

            Option::<String>::deserialize(deserializer)?
                .map(|s| super::parse_duration(&s).map_err(D::Error::custom))
                .transpose()
        }
    }
}

/// Top-level configuration.
///
/// # Examples
///
/// ```rust
/// use laterwork::config::LaterworkConfig;
/// use std::time::Duration;
///
/// let config = LaterworkConfig::new()
///     .with_database_url("postgresql://localhost/laterwork")
///     .with_queues(vec!["emails".to_string()])
///     .with_concurrency(4)
///     .with_polling_interval(Duration::from_secs(2));
///
/// assert_eq!(config.worker.concurrency, 4);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LaterworkConfig {
    pub database: DatabaseConfig,
    pub worker: WorkerConfig,
    pub logging: LoggingConfig,
}

impl LaterworkConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_database_url(mut self, url: &str) -> Self {
        self.database.url = url.to_string();
        self
    }

    pub fn with_pool_size(mut self, size: u32) -> Self {
        self.database.pool_size = size;
        self
    }

    /// Restrict workers to these queues. An empty list means all queues.
    pub fn with_queues(mut self, queues: Vec<String>) -> Self {
        self.worker.queues = if queues.is_empty() { None } else { Some(queues) };
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.worker.concurrency = concurrency;
        self
    }

    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.worker.polling_interval = interval;
        self
    }

    /// Load configuration from a TOML file. Missing keys keep their defaults.
    pub fn from_file(path: &str) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: &str) -> crate::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Defaults overridden by `LATERWORK_*` environment variables.
    ///
    /// Unlike unset variables, a variable holding a value that does not
    /// parse is a configuration error.
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("LATERWORK_DATABASE_URL") {
            config.database.url = url;
        }
        if let Ok(pool_size) = std::env::var("LATERWORK_POOL_SIZE") {
            config.database.pool_size = parse_env("LATERWORK_POOL_SIZE", &pool_size)?;
        }
        if let Ok(concurrency) = std::env::var("LATERWORK_WORKER_CONCURRENCY") {
            config.worker.concurrency = parse_env("LATERWORK_WORKER_CONCURRENCY", &concurrency)?;
        }
        if let Ok(interval) = std::env::var("LATERWORK_POLLING_INTERVAL") {
            config.worker.polling_interval = duration_secs::parse_duration(&interval)
                .map_err(|e| crate::LaterworkError::Config(format!("LATERWORK_POLLING_INTERVAL: {}", e)))?;
        }
        if let Ok(queues) = std::env::var("LATERWORK_QUEUES") {
            let queues = queues
                .split(',')
                .map(str::trim)
                .filter(|queue| !queue.is_empty())
                .map(String::from)
                .collect();
            config = config.with_queues(queues);
        }
        if let Ok(level) = std::env::var("LATERWORK_LOG_LEVEL") {
            config.logging.level = level;
        }

        Ok(config)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> crate::Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| crate::LaterworkError::Config(format!("{} has an invalid value: {}", name, value)))
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,

    /// Maximum number of pooled connections. Also sets the query retry
    /// ceiling (`pool_size + 1`) and, when 1, disables listen/notify.
    pub pool_size: u32,

    /// How long to wait for a pooled connection.
    #[serde(with = "duration_secs")]
    pub connection_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/laterwork".to_string(),
            pool_size: 10,
            connection_timeout: Duration::from_secs(30),
        }
    }
}

/// Worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker name used in logs. Generated when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Queues to consume. `None` means every queue.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queues: Option<Vec<String>>,

    /// Maximum number of jobs running at once.
    pub concurrency: usize,

    /// How long an idle worker sleeps before polling again when no
    /// notification arrives.
    #[serde(with = "duration_secs")]
    pub polling_interval: Duration,

    pub listen_notify: bool,

    pub shutdown_policy: ShutdownPolicy,

    /// Retry policy for tasks registered without their own.
    pub default_retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: None,
            queues: None,
            concurrency: 1,
            polling_interval: Duration::from_secs(5),
            listen_notify: true,
            shutdown_policy: ShutdownPolicy::Graceful,
            default_retry: RetryPolicy::none(),
        }
    }
}

/// Logging configuration, consumed by the CLI when installing a subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
