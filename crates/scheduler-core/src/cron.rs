//! Cron Planner (spec.md §4.4): parses 5-field cron expressions and yields
//! the next firing instant after a reference time. Deterministic, pure,
//! no I/O.

use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;

use crate::error::{SchedulerError, Result};

/// A parsed cron expression.
pub struct CronPlanner {
    schedule: Schedule,
}

impl CronPlanner {
    /// Parse a 5-field cron expression (minute hour day-of-month month
    /// day-of-week). The `cron` crate's native format is 6-field (seconds
    /// first); a leading `0` seconds field is prepended transparently so
    /// callers only ever see the standard 5-field form.
    pub fn parse(expression: &str) -> Result<Self> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(SchedulerError::Validation(format!(
                "cron expression {expression:?} must have 5 fields (minute hour dom month dow), got {}",
                fields.len()
            )));
        }
        let six_field = format!("0 {expression}");
        let schedule = Schedule::from_str(&six_field)
            .map_err(|e| SchedulerError::Validation(format!("invalid cron expression {expression:?}: {e}")))?;
        Ok(Self { schedule })
    }

    /// The smallest instant strictly greater than `t` matching the
    /// expression, in UTC.
    pub fn next_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&t).next()
    }
}
