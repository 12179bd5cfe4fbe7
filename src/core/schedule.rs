//! Schedule trigger contract and the bundled schedule kinds.
//!
//! A [`Schedule`] answers one question for a task driver: given when the task
//! last fired, how long until it fires next, and does it fire at all. Drivers
//! call [`Schedule::wait`] once per firing.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::error::ScheduleError;

/// Whether a schedule will fire again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleState {
    /// More firings remain.
    Active,
    /// No further firings.
    Ended,
}

/// Answer from [`Schedule::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleResponse {
    /// Whether the schedule fires again.
    pub state: ScheduleState,
    /// Time to sleep before the next firing. Zero when `Ended`.
    pub wait: Duration,
    /// Firings skipped since the last one because it overran.
    pub missed: u64,
}

impl ScheduleResponse {
    const fn active(wait: Duration, missed: u64) -> Self {
        Self {
            state: ScheduleState::Active,
            wait,
            missed,
        }
    }

    const fn ended() -> Self {
        Self {
            state: ScheduleState::Ended,
            wait: Duration::ZERO,
            missed: 0,
        }
    }
}

/// Trigger policy for a task.
pub trait Schedule: Send + Sync + fmt::Debug {
    /// Check the schedule is well formed.
    ///
    /// # Errors
    ///
    /// The first [`ScheduleError`] found.
    fn validate(&self) -> Result<(), ScheduleError>;

    /// Compute the next firing relative to `now`.
    ///
    /// `last_fire` is `None` before the first firing.
    fn wait(&self, last_fire: Option<DateTime<Utc>>, now: DateTime<Utc>) -> ScheduleResponse;
}

fn to_std(delta: chrono::Duration) -> Duration {
    delta.to_std().unwrap_or(Duration::ZERO)
}

fn shift(from: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|delta| from.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Next interval boundary strictly after `now`, counting skipped boundaries.
fn next_boundary(
    last: DateTime<Utc>,
    interval: Duration,
    now: DateTime<Utc>,
) -> (DateTime<Utc>, u64) {
    let interval_ns = interval.as_nanos().max(1);
    let elapsed_ns = to_std(now - last).as_nanos();
    let steps = elapsed_ns / interval_ns + 1;
    let offset = Duration::from_nanos(u64::try_from(steps * interval_ns).unwrap_or(u64::MAX));
    (shift(last, offset), u64::try_from(steps - 1).unwrap_or(u64::MAX))
}

/// Fires every `interval`, starting one interval after arming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimpleSchedule {
    interval: Duration,
}

impl SimpleSchedule {
    /// Fire every `interval`.
    #[must_use]
    pub const fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Configured interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }
}

impl Schedule for SimpleSchedule {
    fn validate(&self) -> Result<(), ScheduleError> {
        if self.interval.is_zero() {
            return Err(ScheduleError::ZeroInterval);
        }
        Ok(())
    }

    fn wait(&self, last_fire: Option<DateTime<Utc>>, now: DateTime<Utc>) -> ScheduleResponse {
        let Some(last) = last_fire else {
            return ScheduleResponse::active(self.interval, 0);
        };
        let (next, missed) = next_boundary(last, self.interval, now);
        ScheduleResponse::active(to_std(next - now), missed)
    }
}

/// Fires every `interval` inside an optional `[start, stop]` window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowedSchedule {
    interval: Duration,
    start: Option<DateTime<Utc>>,
    stop: Option<DateTime<Utc>>,
}

impl WindowedSchedule {
    /// Fire every `interval` between `start` and `stop`.
    #[must_use]
    pub const fn new(
        interval: Duration,
        start: Option<DateTime<Utc>>,
        stop: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            interval,
            start,
            stop,
        }
    }
}

impl Schedule for WindowedSchedule {
    fn validate(&self) -> Result<(), ScheduleError> {
        if self.interval.is_zero() {
            return Err(ScheduleError::ZeroInterval);
        }
        if let Some(stop) = self.stop {
            if stop < Utc::now() {
                return Err(ScheduleError::StopInPast);
            }
            if let Some(start) = self.start {
                if stop <= start {
                    return Err(ScheduleError::StopBeforeStart);
                }
            }
        }
        Ok(())
    }

    fn wait(&self, last_fire: Option<DateTime<Utc>>, now: DateTime<Utc>) -> ScheduleResponse {
        let (next, missed) = match (last_fire, self.start) {
            (None, Some(start)) if start > now => (start, 0),
            (None, _) => (shift(now, self.interval), 0),
            (Some(last), _) => next_boundary(last, self.interval, now),
        };
        if self.stop.is_some_and(|stop| next > stop) {
            return ScheduleResponse::ended();
        }
        ScheduleResponse::active(to_std(next - now), missed)
    }
}

/// Fires on a cron expression.
///
/// Accepts the standard 5-field form (`min hour dom month dow`) as well as the
/// 6- and 7-field forms with seconds and year.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    parsed: Result<cron::Schedule, String>,
}

impl CronSchedule {
    /// Parse `expression`. Parse failures surface from [`Schedule::validate`].
    #[must_use]
    pub fn new(expression: &str) -> Self {
        let normalized = normalize_cron(expression);
        let parsed = cron::Schedule::from_str(&normalized).map_err(|e| e.to_string());
        Self {
            expression: expression.to_string(),
            parsed,
        }
    }

    /// Expression as supplied.
    #[must_use]
    pub fn expression(&self) -> &str {
        &self.expression
    }
}

/// Prepend a seconds field to 5-field expressions.
fn normalize_cron(expression: &str) -> String {
    let trimmed = expression.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    }
}

impl Schedule for CronSchedule {
    fn validate(&self) -> Result<(), ScheduleError> {
        self.parsed
            .as_ref()
            .map(|_| ())
            .map_err(|reason| ScheduleError::InvalidCron {
                expression: self.expression.clone(),
                reason: reason.clone(),
            })
    }

    fn wait(&self, last_fire: Option<DateTime<Utc>>, now: DateTime<Utc>) -> ScheduleResponse {
        let Ok(schedule) = &self.parsed else {
            return ScheduleResponse::ended();
        };
        let Some(next) = schedule.after(&now).next() else {
            return ScheduleResponse::ended();
        };
        // Occurrences that passed while the last firing ran were skipped.
        let missed = last_fire.map_or(0, |last| {
            schedule.after(&last).take_while(|t| *t <= now).count()
        });
        ScheduleResponse::active(
            to_std(next - now),
            u64::try_from(missed).unwrap_or(u64::MAX),
        )
    }
}
