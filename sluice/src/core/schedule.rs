//! Cron and interval arithmetic for flow schedules.
//!
//! Accepts standard 5-field Unix cron expressions (minute, hour,
//! day-of-month, month, day-of-week) and converts them to the 6-field form
//! (with seconds) the `cron` crate expects.

use super::error::{CoreError, Result};
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;
use std::time::Duration;

fn normalize_cron_expr(cron_expr: &str) -> String {
    let fields = cron_expr.split_whitespace().count();
    if fields == 5 {
        format!("0 {}", cron_expr.trim())
    } else {
        cron_expr.trim().to_string()
    }
}

fn parse_cron(cron_expr: &str) -> Result<Schedule> {
    Schedule::from_str(&normalize_cron_expr(cron_expr))
        .map_err(|e| CoreError::InvalidSchedule(format!("cron '{}': {}", cron_expr, e)))
}

/// Next occurrence of `cron_expr` strictly after `after`.
pub fn next_cron_run(cron_expr: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    parse_cron(cron_expr)?
        .after(&after)
        .next()
        .ok_or_else(|| CoreError::InvalidSchedule(format!("cron '{}' has no upcoming run", cron_expr)))
}

/// `last_run_at + interval`, or `now` for a flow that never ran.
///
/// A next run that is already in the past is pulled forward to `now` so a
/// flow that missed several ticks runs once rather than once per missed tick.
pub fn next_interval_run(
    interval: Duration,
    last_run_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    let Some(last) = last_run_at else {
        return Ok(now);
    };
    let step = chrono::Duration::from_std(interval)
        .map_err(|e| CoreError::InvalidSchedule(format!("interval {:?}: {}", interval, e)))?;
    let next = last
        .checked_add_signed(step)
        .ok_or_else(|| CoreError::InvalidSchedule(format!("interval {:?} overflows", interval)))?;
    Ok(next.max(now))
}

/// Validates a cron expression without computing anything.
pub fn validate_cron(cron_expr: &str) -> Result<()> {
    parse_cron(cron_expr).map(|_| ())
}
