//! Scheduled idle-capacity policy.
//!
//! A policy is an ordered list of windows, each a cron expression evaluated
//! in its own time zone. The first window whose expression fired within the
//! last [`ACTIVE_TOLERANCE_SECS`] seconds is active. With no active window
//! nothing is kept idle and the oldest machines go first.
//!
//! Expressions use the six-field form `sec min hour day-of-month month
//! day-of-week`; a five-field expression gets `0` seconds prepended.
//! Numeric weekdays count from Sunday = 0 (7 is Sunday as well), so
//! `1-5` is Monday to Friday. They are rewritten to names before the
//! expression is handed to the `cron` crate, which counts from Sunday = 1.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use fleet_events::{EvictionStrategy, ScaleDownWindow};

use crate::ReconcileError;

/// How far back a firing still counts as "now".
pub const ACTIVE_TOLERANCE_SECS: i64 = 5;

/// The idle budget and eviction order in force at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveWindow {
    pub idle_count: u32,
    pub strategy: EvictionStrategy,
}

impl Default for ActiveWindow {
    fn default() -> Self {
        Self {
            idle_count: 0,
            strategy: EvictionStrategy::OldestFirst,
        }
    }
}

#[derive(Debug, Clone)]
struct CompiledWindow {
    expression: String,
    schedule: Schedule,
    time_zone: Tz,
    window: ActiveWindow,
}

impl CompiledWindow {
    fn is_active(&self, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&self.time_zone);
        let since = local - Duration::seconds(ACTIVE_TOLERANCE_SECS);
        self.schedule
            .after(&since)
            .next()
            .is_some_and(|fire| fire <= local)
    }
}

/// A compiled, validated eviction policy.
#[derive(Debug, Clone, Default)]
pub struct EvictionPolicy {
    windows: Vec<CompiledWindow>,
}

impl EvictionPolicy {
    /// Compiles the configured windows, failing on the first bad expression
    /// or time zone.
    pub fn compile(windows: &[ScaleDownWindow]) -> Result<Self, ReconcileError> {
        let windows = windows
            .iter()
            .map(|w| {
                let expression = normalize_expression(&w.cron);
                let schedule =
                    Schedule::from_str(&expression).map_err(|e| ReconcileError::InvalidCron {
                        expression: w.cron.clone(),
                        reason: e.to_string(),
                    })?;
                let time_zone = w
                    .time_zone
                    .parse::<Tz>()
                    .map_err(|_| ReconcileError::InvalidTimeZone(w.time_zone.clone()))?;

                Ok(CompiledWindow {
                    expression: w.cron.clone(),
                    schedule,
                    time_zone,
                    window: ActiveWindow {
                        idle_count: w.idle_count,
                        strategy: w.eviction_strategy.unwrap_or_default(),
                    },
                })
            })
            .collect::<Result<Vec<_>, ReconcileError>>()?;

        Ok(Self { windows })
    }

    /// Returns the first active window, or the zero-idle default.
    pub fn active_window(&self, now: DateTime<Utc>) -> ActiveWindow {
        self.windows
            .iter()
            .find(|w| w.is_active(now))
            .map(|w| w.window)
            .unwrap_or_default()
    }

    /// Expression of the first active window, for logging.
    pub fn active_expression(&self, now: DateTime<Utc>) -> Option<&str> {
        self.windows
            .iter()
            .find(|w| w.is_active(now))
            .map(|w| w.expression.as_str())
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

const WEEKDAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// Position of the day-of-week field in the six-field form.
const DAY_OF_WEEK_FIELD: usize = 5;

fn normalize_expression(expression: &str) -> String {
    let mut fields: Vec<String> = expression.split_whitespace().map(str::to_string).collect();
    if fields.len() == 5 {
        fields.insert(0, "0".to_string());
    }
    if let Some(day_of_week) = fields.get_mut(DAY_OF_WEEK_FIELD) {
        *day_of_week = normalize_day_of_week(day_of_week);
    }
    fields.join(" ")
}

/// Rewrites numeric weekdays (Sunday = 0 or 7) as names. Wildcards, names
/// and anything out of range are left for the cron parser to judge.
fn normalize_day_of_week(field: &str) -> String {
    field
        .split(',')
        .map(normalize_day_of_week_item)
        .collect::<Vec<_>>()
        .join(",")
}

fn normalize_day_of_week_item(item: &str) -> String {
    let (range, step) = match item.split_once('/') {
        Some((range, step)) => (range, Some(step)),
        None => (item, None),
    };
    let with_step = |range: String| match step {
        Some(step) => format!("{}/{}", range, step),
        None => range,
    };

    let (start, end) = match range.split_once('-') {
        Some((start, end)) => (start, Some(end)),
        None => (range, None),
    };
    let Some(first) = weekday_number(start) else {
        return item.to_string();
    };

    let Some(end) = end else {
        return with_step(WEEKDAYS[first % 7].to_string());
    };
    let Some(last) = weekday_number(end) else {
        return item.to_string();
    };
    if last < 7 {
        return with_step(format!("{}-{}", WEEKDAYS[first % 7], WEEKDAYS[last]));
    }
    if first == 0 {
        return with_step(format!("{}-{}", WEEKDAYS[0], WEEKDAYS[6]));
    }

    // A range ending on Sunday = 7 would wrap in the parser's numbering.
    // Split it into `first-Sat` plus Sunday when the step lands on 7.
    let step_size = step.and_then(|s| s.parse::<usize>().ok()).unwrap_or(1).max(1);
    let mut rewritten = if first == 7 {
        WEEKDAYS[0].to_string()
    } else {
        with_step(format!("{}-{}", WEEKDAYS[first], WEEKDAYS[6]))
    };
    if first < 7 && (7 - first) % step_size == 0 {
        rewritten.push(',');
        rewritten.push_str(WEEKDAYS[0]);
    }
    rewritten
}

fn weekday_number(token: &str) -> Option<usize> {
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    token.parse::<usize>().ok().filter(|n| *n <= 7)
}
