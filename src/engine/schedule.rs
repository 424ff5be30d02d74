use std::str::FromStr;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use cron::Schedule;

/// Parse a five-field cron expression (minute, hour, day-of-month, month,
/// day-of-week). The underlying parser wants a seconds field, so one is
/// prepended; user-facing expressions never carry seconds.
pub fn parse(expr: &str) -> Result<Schedule> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        bail!(
            "schedule '{}' must have exactly five fields, got {}",
            expr,
            fields.len()
        );
    }
    let with_seconds = format!("0 {}", fields.join(" "));
    Schedule::from_str(&with_seconds)
        .map_err(|e| anyhow::anyhow!("invalid schedule '{}': {}", expr, e))
}

/// The first fire time strictly after `after`, if the expression has one.
pub fn next_fire(schedule: &Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}
