//! Parsers for command-line values.

use chrono::{DateTime, Utc};
use laterwork::{JobStatus, utils::parse_datetime};

pub fn parse_status(raw: &str) -> Result<JobStatus, String> {
    JobStatus::parse(raw).ok_or_else(|| {
        format!(
            "unknown status {:?}, expected one of todo, doing, succeeded, failed, cancelled",
            raw
        )
    })
}

/// `2024-01-01T12:00:00Z`, `2024-01-01 12:00:00` (UTC) or `2024-01-01`.
pub fn parse_schedule(raw: &str) -> Result<DateTime<Utc>, String> {
    parse_datetime(raw).map_err(|err| err.to_string())
}
