//! Small helpers shared by the connector, the worker and the CLI.

use crate::{LaterworkError, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use std::{error::Error, fmt::Display, future::Future};
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Iterate over `err` and every error in its `source()` chain.
pub fn causes<'a>(err: &'a (dyn Error + 'static)) -> impl Iterator<Item = &'a (dyn Error + 'static)> {
    std::iter::successors(Some(err), |err: &&'a (dyn Error + 'static)| (*err).source())
}

/// The last error of the `source()` chain.
pub fn root_cause<'a>(err: &'a (dyn Error + 'static)) -> &'a (dyn Error + 'static) {
    causes(err).last().unwrap_or(err)
}

/// Parse an RFC 3339 timestamp, or a naive `YYYY-MM-DD[ T]HH:MM[:SS[.f]]`
/// or `YYYY-MM-DD` taken as UTC.
pub fn parse_datetime(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(naive.and_utc());
        }
    }
    if let Some(midnight) = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
    {
        return Ok(midnight.and_utc());
    }

    Err(LaterworkError::InvalidSchedule {
        message: format!("cannot parse datetime {:?}", raw),
    })
}

/// `"listener"` -> `"Listener"`, `"job_execution"` -> `"Job Execution"`.
fn nice_name(name: &str) -> String {
    name.split('_')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Wrap `future` so it logs `{name}_start` when polled first and
/// `{name}_error` if it resolves to an error. The error is consumed.
pub async fn logged<F, E>(name: String, future: F)
where
    F: Future<Output = std::result::Result<(), E>>,
    E: Display,
{
    debug!(action = %format!("{}_start", name), "Started {}", nice_name(&name));
    if let Err(err) = future.await {
        error!(
            action = %format!("{}_error", name),
            error = %err,
            "{} error",
            nice_name(&name)
        );
    }
}

/// A background task tied to the lifetime of this handle.
///
/// The future runs on the tokio runtime as soon as the handle is created.
/// When the handle is dropped, on whatever path the owning scope exits, a
/// still-running task is aborted and `{name}_stop` is logged.
#[derive(Debug)]
pub struct ScopedTask {
    name: String,
    handle: Option<JoinHandle<()>>,
}

impl ScopedTask {
    pub fn spawn<F, E>(name: impl Into<String>, future: F) -> Self
    where
        F: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let name = name.into();
        let handle = tokio::spawn(logged(name.clone(), future));
        Self {
            name,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if !handle.is_finished() {
                handle.abort();
                debug!(
                    action = %format!("{}_stop", self.name),
                    "Stopped {}",
                    nice_name(&self.name)
                );
            }
        }
    }
}

impl Drop for ScopedTask {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ActionRecorder;
    use chrono::TimeZone;
    use std::{fmt, time::Duration};

    #[derive(Debug)]
    struct Wrapped {
        message: &'static str,
        source: Option<Box<Wrapped>>,
    }

    impl fmt::Display for Wrapped {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.message)
        }
    }

    impl Error for Wrapped {
        fn source(&self) -> Option<&(dyn Error + 'static)> {
            self.source.as_deref().map(|err| err as &(dyn Error + 'static))
        }
    }

    #[test]
    fn test_causes() {
        let err = Wrapped {
            message: "top",
            source: Some(Box::new(Wrapped {
                message: "middle",
                source: Some(Box::new(Wrapped {
                    message: "root",
                    source: None,
                })),
            })),
        };

        let messages: Vec<String> = causes(&err).map(|e| e.to_string()).collect();
        assert_eq!(messages, vec!["top", "middle", "root"]);
        assert_eq!(root_cause(&err).to_string(), "root");

        let alone = Wrapped {
            message: "alone",
            source: None,
        };
        assert_eq!(root_cause(&alone).to_string(), "alone");
    }

    #[test]
    fn test_parse_datetime() {
        let expected = Utc.with_ymd_and_hms(2050, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(parse_datetime("2050-01-02T03:04:05Z").unwrap(), expected);
        assert_eq!(parse_datetime("2050-01-02T05:04:05+02:00").unwrap(), expected);
        assert_eq!(parse_datetime("2050-01-02 03:04:05").unwrap(), expected);
        assert_eq!(parse_datetime("2050-01-02T03:04:05").unwrap(), expected);
        assert_eq!(
            parse_datetime("2050-01-02").unwrap(),
            Utc.with_ymd_and_hms(2050, 1, 2, 0, 0, 0).unwrap()
        );
        assert!(matches!(
            parse_datetime("tomorrow"),
            Err(LaterworkError::InvalidSchedule { .. })
        ));
    }

    #[test]
    fn test_nice_name() {
        assert_eq!(nice_name("listener"), "Listener");
        assert_eq!(nice_name("job_execution"), "Job Execution");
    }

    #[tokio::test]
    async fn test_scoped_task_logs_error() {
        let recorder = ActionRecorder::default();
        let _guard = recorder.install();

        logged("listener".to_string(), async { Err::<(), _>("boom") }).await;

        assert_eq!(recorder.actions(), vec!["listener_start", "listener_error"]);
    }

    #[tokio::test]
    async fn test_scoped_task_cancelled_on_drop() {
        let recorder = ActionRecorder::default();
        let _guard = recorder.install();

        {
            let task = ScopedTask::spawn("listener", async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok::<(), String>(())
            });
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert!(!task.is_finished());
        }

        assert_eq!(recorder.actions(), vec!["listener_start", "listener_stop"]);
    }

    #[tokio::test]
    async fn test_scoped_task_finished_normally() {
        let recorder = ActionRecorder::default();
        let _guard = recorder.install();

        let task = ScopedTask::spawn("listener", async { Ok::<(), String>(()) });
        tokio::time::timeout(Duration::from_secs(1), async {
            while !task.is_finished() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        drop(task);

        assert_eq!(recorder.actions(), vec!["listener_start"]);
    }
}
