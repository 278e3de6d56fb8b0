// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Five-field cron expressions and "next occurrence" search (§4.H,
//! §6). No external cron crate: the distilled grammar is small enough
//! that a direct field-matcher plus a bounded minute-by-minute search
//! is both simpler and easier to test than a general cron library.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Timelike};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CronError {
    WrongFieldCount(usize),
    OutOfRange { field: &'static str, value: u32, min: u32, max: u32 },
    NotANumber { field: &'static str, text: String },
}

impl fmt::Display for CronError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CronError::WrongFieldCount(n) => write!(f, "expected 5 fields (minute hour day month weekday), got {n}"),
            CronError::OutOfRange { field, value, min, max } => {
                write!(f, "{field} value {value} out of range [{min}, {max}]")
            }
            CronError::NotANumber { field, text } => write!(f, "{field} field {text:?} is not `*` or a number"),
        }
    }
}

impl std::error::Error for CronError {}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Field {
    Any,
    One(u32),
}

impl Field {
    fn matches(&self, value: u32) -> bool {
        match self {
            Field::Any => true,
            Field::One(v) => *v == value,
        }
    }

    fn parse(text: &str, name: &'static str, min: u32, max: u32) -> Result<Self, CronError> {
        if text == "*" {
            return Ok(Field::Any);
        }
        let value: u32 = text.parse().map_err(|_| CronError::NotANumber { field: name, text: text.to_string() })?;
        if value < min || value > max {
            return Err(CronError::OutOfRange { field: name, value, min, max });
        }
        Ok(Field::One(value))
    }
}

/// A parsed 5-field cron expression: `minute hour day month weekday`.
/// Weekday `7` is folded onto `0` (both mean Sunday) at parse time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minute: Field,
    hour: Field,
    day: Field,
    month: Field,
    weekday: Field,
}

/// Upper bound on how far into the future `next_occurrence` will search
/// before giving up on an expression that can never match (e.g. day 31
/// of a month that never has 31 days combined with a weekday it never
/// falls on).
const MAX_SEARCH_MINUTES: i64 = 4 * 366 * 24 * 60;

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::WrongFieldCount(fields.len()));
        }
        let minute = Field::parse(fields[0], "minute", 0, 59)?;
        let hour = Field::parse(fields[1], "hour", 0, 23)?;
        let day = Field::parse(fields[2], "day", 1, 31)?;
        let month = Field::parse(fields[3], "month", 1, 12)?;
        let mut weekday = Field::parse(fields[4], "weekday", 0, 7)?;
        if weekday == Field::One(7) {
            weekday = Field::One(0);
        }
        Ok(Self { minute, hour, day, month, weekday })
    }

    fn matches<Tz: TimeZone>(&self, at: &DateTime<Tz>) -> bool {
        let weekday_num = at.weekday().num_days_from_sunday();
        self.minute.matches(at.minute())
            && self.hour.matches(at.hour())
            && self.day.matches(at.day())
            && self.month.matches(at.month())
            && self.weekday.matches(weekday_num)
    }

    /// The least instant strictly after `after` that matches this
    /// expression, in `after`'s timezone. `None` if no match is found
    /// within the search horizon (an unsatisfiable expression).
    pub fn next_occurrence<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        let mut candidate = after.clone() + ChronoDuration::minutes(1);
        candidate = candidate
            .with_second(0)
            .unwrap_or_else(|| candidate.clone())
            .with_nanosecond(0)
            .unwrap_or_else(|| candidate.clone());

        for _ in 0..MAX_SEARCH_MINUTES {
            if self.matches(&candidate) {
                return Some(candidate);
            }
            candidate += ChronoDuration::minutes(1);
        }
        None
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let field = |field: &Field| match field {
            Field::Any => "*".to_string(),
            Field::One(v) => v.to_string(),
        };
        write!(f, "{} {} {} {} {}", field(&self.minute), field(&self.hour), field(&self.day), field(&self.month), field(&self.weekday))
    }
}

#[cfg(test)]
#[path = "cron_tests.rs"]
mod tests;
