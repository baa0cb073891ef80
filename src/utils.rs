use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use std::time::Duration;

/// Civil timezone used for progress timestamps.
pub const LOG_TIMEZONE: Tz = chrono_tz::America::Los_Angeles;

/// Format whole seconds as `H:MM:SS`, or `N day(s), H:MM:SS` past one day.
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let days = total / 86_400;
    let rem = total % 86_400;
    let clock = format!("{}:{:02}:{:02}", rem / 3600, (rem % 3600) / 60, rem % 60);
    match days {
        0 => clock,
        1 => format!("1 day, {clock}"),
        n => format!("{n} days, {clock}"),
    }
}

/// Format an instant in `tz`, second precision with UTC offset.
pub fn format_timestamp<T: TimeZone>(now: DateTime<Utc>, tz: &T) -> String
where
    T::Offset: std::fmt::Display,
{
    now.with_timezone(tz).format("%Y-%m-%d %H:%M:%S%:z").to_string()
}

/// Current wall-clock time in [`LOG_TIMEZONE`].
pub fn wall_clock() -> String {
    format_timestamp(Utc::now(), &LOG_TIMEZONE)
}

/// Estimated time left in an epoch from the mean iteration time.
pub fn eta(mean_iteration_secs: f64, remaining_iterations: usize) -> Duration {
    let secs = mean_iteration_secs * remaining_iterations as f64;
    if secs.is_finite() && secs > 0.0 {
        Duration::from_secs(secs as u64)
    } else {
        Duration::ZERO
    }
}
