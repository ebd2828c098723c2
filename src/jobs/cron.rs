//! Cron expression evaluation in a record's timezone.
//!
//! Five-field expressions use classic crontab semantics (`0` and `7` are
//! Sunday) and get a `0` seconds field prepended. Six and seven field
//! expressions and `@`-shortcuts are passed to the `cron` crate unchanged.

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;

use crate::jobs::error::{JobError, JobResult};

const DOW_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: cron::Schedule,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> JobResult<Self> {
        let invalid = |reason: String| JobError::InvalidCron {
            expression: expression.to_string(),
            reason,
        };
        let normalized = normalize(expression).map_err(invalid)?;
        let schedule =
            cron::Schedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))?;

        Ok(Self {
            expression: expression.to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First tick strictly after `at`.
    pub fn next_after(&self, at: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&at.with_timezone(&tz))
            .next()
            .map(|t| t.with_timezone(&Utc))
    }

    /// First tick at or after `at`.
    pub fn next_at_or_after(&self, at: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        let before = (at - Duration::seconds(1)).with_timezone(&tz);
        self.schedule
            .after(&before)
            .map(|t| t.with_timezone(&Utc))
            .find(|t| *t >= at)
    }

    /// Next run for a record evaluated at `now`.
    ///
    /// The base is `max(now, started_at)`. A future `started_at` that lies on
    /// the grid is itself returned; otherwise the first tick after the base.
    /// Nothing is returned when that tick is at or after `finished_at`.
    pub fn next_execute_at(
        &self,
        tz: Tz,
        now: DateTime<Utc>,
        started_at: Option<DateTime<Utc>>,
        finished_at: Option<DateTime<Utc>>,
    ) -> Option<DateTime<Utc>> {
        let next = match started_at {
            Some(start) if start > now => self.next_at_or_after(start, tz),
            _ => self.next_after(now, tz),
        }?;

        match finished_at {
            Some(finish) if next >= finish => None,
            _ => Some(next),
        }
    }
}

/// Resolve an optional IANA name; `None` and empty strings mean UTC.
pub fn parse_timezone(name: Option<&str>) -> JobResult<Tz> {
    match name.map(str::trim) {
        None | Some("") => Ok(Tz::UTC),
        Some(name) => name
            .parse::<Tz>()
            .map_err(|_| JobError::InvalidTimezone(name.to_string())),
    }
}

fn normalize(expression: &str) -> Result<String, String> {
    let trimmed = expression.trim();
    if trimmed.starts_with('@') {
        return Ok(trimmed.to_string());
    }

    let fields: Vec<&str> = trimmed.split_whitespace().collect();
    if fields.len() != 5 {
        return Ok(fields.join(" "));
    }

    let dow = normalize_day_of_week(fields[4])?;

    Ok(format!(
        "0 {} {} {} {} {}",
        fields[0], fields[1], fields[2], fields[3], dow
    ))
}

/// Rewrite numeric day-of-week items as explicit name lists.
///
/// The `cron` crate counts days from `1 = SUN` and rejects ranges that wrap,
/// so `5-7` cannot be passed through as `FRI-SUN`. Items that are not purely
/// numeric are left for the `cron` crate to judge.
fn normalize_day_of_week(field: &str) -> Result<String, String> {
    let mut items = Vec::new();
    for item in field.split(',') {
        match crontab_days(item)? {
            Some(days) => items.extend(days.into_iter().map(|d| DOW_NAMES[d].to_string())),
            None => items.push(item.to_string()),
        }
    }
    Ok(items.join(","))
}

/// Days `0..=6` selected by one numeric crontab item such as `5-7`, `*/2`
/// or `1/3`; `None` for anything else.
fn crontab_days(item: &str) -> Result<Option<BTreeSet<usize>>, String> {
    let (range, step) = match item.split_once('/') {
        Some((range, step)) => match step.parse::<usize>() {
            Ok(step) if step > 0 => (range, step),
            _ => return Ok(None),
        },
        None => (item, 1),
    };

    let number = |s: &str| s.parse::<usize>().ok();
    let (start, end) = if range == "*" {
        if step == 1 {
            return Ok(None);
        }
        (0, 6)
    } else if let Some((a, b)) = range.split_once('-') {
        match (number(a), number(b)) {
            (Some(a), Some(b)) => (a, b),
            _ => return Ok(None),
        }
    } else {
        match number(range) {
            Some(day) if step > 1 => (day, 7),
            Some(day) => (day, day),
            None => return Ok(None),
        }
    };

    if end > 7 {
        return Err(format!("day of week {end} is out of range 0-7"));
    }
    if start > end {
        return Err(format!("day of week range {start}-{end} is reversed"));
    }
    Ok(Some((start..=end).step_by(step).map(|d| d % 7).collect()))
}
