//! Next-run computation for cron and interval patterns

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};

use super::ScheduleError;

/// Least instant strictly greater than `after` matching a 5-field cron
/// expression (minute, hour, day-of-month, month, day-of-week)
///
/// Evaluation is UTC-only; wall-clock DST shifts are not compensated.
pub fn next_cron_run(
    pattern: &str,
    after: DateTime<Utc>,
) -> Result<DateTime<Utc>, ScheduleError> {
    let fields = pattern.split_whitespace().count();
    if fields != 5 {
        return Err(ScheduleError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: format!("expected 5 fields, got {fields}"),
        });
    }

    // The cron crate wants a seconds field; pin it to zero
    let expression = format!("0 {pattern}");
    let schedule =
        cron::Schedule::from_str(&expression).map_err(|e| ScheduleError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;

    schedule
        .after(&after)
        .find(|t| *t > after)
        .ok_or_else(|| ScheduleError::NoUpcomingRun(pattern.to_string()))
}

/// Parse an interval pattern: the interval in milliseconds as a decimal string
pub fn parse_interval(pattern: &str) -> Result<Duration, ScheduleError> {
    let ms: i64 = pattern
        .trim()
        .parse()
        .map_err(|_| ScheduleError::InvalidInterval(pattern.to_string()))?;
    if ms <= 0 {
        return Err(ScheduleError::InvalidInterval(pattern.to_string()));
    }
    Ok(Duration::milliseconds(ms))
}

/// Next fire time for an interval pattern
pub fn next_interval_run(
    pattern: &str,
    after: DateTime<Utc>,
) -> Result<DateTime<Utc>, ScheduleError> {
    Ok(after + parse_interval(pattern)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_every_five_minutes() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 10, 2, 30).unwrap();
        let next = next_cron_run("*/5 * * * *", now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 3, 1, 10, 5, 0).unwrap());
    }

    #[test]
    fn test_strictly_greater_than_now() {
        // Exactly on a match boundary: the next run is the following match
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 10, 5, 0).unwrap();
        let next = next_cron_run("*/5 * * * *", now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 3, 1, 10, 10, 0).unwrap());
    }

    #[test]
    fn test_daily_at_time() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let next = next_cron_run("30 9 * * *", now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 3, 2, 9, 30, 0).unwrap());
    }

    #[test]
    fn test_ranges_and_lists() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 10, 16, 0).unwrap();
        let next = next_cron_run("0,15,45 10-11 * * *", now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 3, 1, 10, 45, 0).unwrap());
    }

    #[test]
    fn test_wrong_field_count_rejected() {
        let now = Utc::now();
        assert!(matches!(
            next_cron_run("* * * *", now),
            Err(ScheduleError::InvalidPattern { .. })
        ));
        assert!(matches!(
            next_cron_run("0 * * * * *", now),
            Err(ScheduleError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_garbage_pattern_rejected() {
        assert!(matches!(
            next_cron_run("not a cron", Utc::now()),
            Err(ScheduleError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_interval_parsing() {
        assert_eq!(parse_interval("1000").unwrap(), Duration::milliseconds(1000));
        assert_eq!(parse_interval(" 250 ").unwrap(), Duration::milliseconds(250));
        assert!(parse_interval("0").is_err());
        assert!(parse_interval("-5").is_err());
        assert!(parse_interval("5s").is_err());
    }

    #[test]
    fn test_next_interval_run() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        let next = next_interval_run("60000", now).unwrap();
        assert_eq!(next, now + Duration::seconds(60));
    }
}
