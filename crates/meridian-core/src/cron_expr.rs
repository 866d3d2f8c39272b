//! Cron expression parsing shared by [`crate::model::ScheduleDefinition`] and
//! the scheduler's timer arithmetic.
//!
//! The `cron` crate requires a leading seconds field (6 or 7 fields); the
//! wire format documented in the repository contract is POSIX 5/6-field
//! cron with `@`-macros. We normalize 5-field expressions by prepending a
//! `0` seconds field so both forms are accepted uniformly.

use chrono::{DateTime, TimeZone};
use cron::Schedule;

use crate::error::CoreError;

pub fn parse(expression: &str) -> Result<Schedule, CoreError> {
    let normalized = normalize(expression);
    normalized
        .parse::<Schedule>()
        .map_err(|e| CoreError::validation(format!("invalid cron expression '{expression}': {e}")))
}

fn normalize(expression: &str) -> String {
    if expression.trim_start().starts_with('@') {
        return expression.to_string();
    }
    let fields = expression.split_whitespace().count();
    if fields == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    }
}

/// Next firing strictly after `after`, in `tz`. Never returns a timestamp
/// that is not strictly greater than `after`, even across a DST boundary.
pub fn next_after<Tz: TimeZone>(
    schedule: &Schedule,
    after: DateTime<Tz>,
) -> Option<DateTime<chrono::Utc>>
where
    Tz::Offset: std::fmt::Display,
{
    schedule
        .after(&after.with_timezone(&chrono::Utc))
        .next()
        .map(|dt| dt.with_timezone(&chrono::Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn normalizes_five_field_to_six() {
        assert_eq!(normalize("*/5 * * * *"), "0 */5 * * * *");
    }

    #[test]
    fn leaves_macros_untouched() {
        assert_eq!(normalize("@hourly"), "@hourly");
    }

    #[test]
    fn parses_five_field_expression() {
        assert!(parse("*/5 * * * *").is_ok());
    }

    #[test]
    fn next_after_is_strictly_increasing() {
        let schedule = parse("*/5 * * * *").unwrap();
        let now = Utc::now();
        let next = next_after(&schedule, now).unwrap();
        assert!(next > now);
    }
}
