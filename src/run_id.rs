//! Run identity
//!
//! Every message produced by this process carries the same `RunId`.
//! Consumers compare it against their own to skip messages left on a
//! shared subscription by earlier runs. It is a whole-run filter, not a
//! per-message dedup key: two runs started within the same second (or
//! twelve hours apart to the second) produce the same id.

use std::fmt;

use chrono::{DateTime, Local, TimeZone};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Derive the id from the current local wall-clock time.
    pub fn start() -> Self {
        Self::from_clock(&Local::now())
    }

    /// Derive the id from a given instant as `hhmmss` on a 12-hour clock.
    pub fn from_clock<Tz: TimeZone>(at: &DateTime<Tz>) -> Self
    where
        Tz::Offset: fmt::Display,
    {
        Self(at.format("%I%M%S").to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether a payload's run tag belongs to this run.
    pub fn owns(&self, run_tag: &str) -> bool {
        self.0 == run_tag
    }
}

impl From<&str> for RunId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
