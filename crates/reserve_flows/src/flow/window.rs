//! Half-open reporting window `[start, end)`.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

#[derive(Error, Debug)]
pub enum WindowError {
    #[error("invalid time: {0}")]
    InvalidTime(String),
    #[error("window end {end} precedes start {start}")]
    Inverted { start: i64, end: i64 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,
}

impl Window {
    pub fn new(start: OffsetDateTime, end: OffsetDateTime) -> Result<Self, WindowError> {
        if end < start {
            return Err(WindowError::Inverted {
                start: start.unix_timestamp(),
                end: end.unix_timestamp(),
            });
        }
        Ok(Self { start, end })
    }

    /// Parse both bounds from RFC3339 strings.
    pub fn parse_rfc3339(start: &str, end: &str) -> Result<Self, WindowError> {
        let parse = |s: &str| {
            OffsetDateTime::parse(s.trim(), &Rfc3339)
                .map_err(|e| WindowError::InvalidTime(format!("{s}: {e}")))
        };
        Self::new(parse(start)?, parse(end)?)
    }

    pub fn start_unix(&self) -> i64 {
        self.start.unix_timestamp()
    }

    pub fn end_unix(&self) -> i64 {
        self.end.unix_timestamp()
    }

    pub fn start_millis(&self) -> i64 {
        (self.start.unix_timestamp_nanos() / 1_000_000) as i64
    }

    pub fn end_millis(&self) -> i64 {
        (self.end.unix_timestamp_nanos() / 1_000_000) as i64
    }

    /// True iff `start <= ts < end`, `ts` in unix seconds.
    pub fn contains_unix(&self, ts: i64) -> bool {
        let ns = i128::from(ts) * 1_000_000_000;
        self.start.unix_timestamp_nanos() <= ns && ns < self.end.unix_timestamp_nanos()
    }

    /// True iff `start <= ts < end`, `ts` in unix milliseconds.
    pub fn contains_millis(&self, ts_ms: i64) -> bool {
        let ns = i128::from(ts_ms) * 1_000_000;
        self.start.unix_timestamp_nanos() <= ns && ns < self.end.unix_timestamp_nanos()
    }

    /// True when `ts` (unix seconds) falls before the window start.
    pub fn is_before_unix(&self, ts: i64) -> bool {
        i128::from(ts) * 1_000_000_000 < self.start.unix_timestamp_nanos()
    }

    pub fn is_before_millis(&self, ts_ms: i64) -> bool {
        i128::from(ts_ms) * 1_000_000 < self.start.unix_timestamp_nanos()
    }
}
