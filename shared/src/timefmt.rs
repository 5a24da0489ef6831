//! Parsing and display helpers for the facility API's timestamp strings.
//!
//! The API serves zone-naive local times (`2024-01-01T12:00:00`), but
//! offset-qualified values (`2024-01-01T12:00:00-0500`) appear in request
//! windows and older stored snapshots, so both forms are accepted
//! everywhere. Comparisons always happen in UTC: naive values are
//! interpreted in the pipeline's configured zone first.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Parse an entry timestamp into an absolute instant.
pub fn parse_entry_time(s: &str, tz: Tz) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Ok(dt.with_timezone(&Utc));
    }
    let naive = parse_naive(s)?;
    // For wall-clock times that repeat across a DST fold, take the first
    // occurrence; times inside a DST gap do not exist and are rejected.
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| anyhow!("timestamp {s} does not exist in {tz}"))
}

/// Render a session's time span the way the notification channels show it:
/// `Mon Jan 01 12:00PM - 01:00PM` when both ends fall on the same date,
/// `Mon Jan 01 12:00PM - Tue Jan 02 01:00PM` otherwise.
///
/// Times keep the wall clock they were written with; an unparseable input
/// falls back to the raw strings rather than suppressing the notification.
pub fn pretty_time_range(start: &str, end: &str) -> String {
    match (parse_wall_clock(start), parse_wall_clock(end)) {
        (Ok(s), Ok(e)) if s.date() == e.date() => {
            format!("{} - {}", s.format("%a %b %d %I:%M%p"), e.format("%I:%M%p"))
        }
        (Ok(s), Ok(e)) => format!(
            "{} - {}",
            s.format("%a %b %d %I:%M%p"),
            e.format("%a %b %d %I:%M%p")
        ),
        _ => format!("{start} - {end}"),
    }
}

/// Start-of-day bound for a fetch window, `YYYY-MM-DDT00:00:00±HHMM`.
pub fn start_of_day(t: &DateTime<Tz>) -> String {
    t.format("%Y-%m-%dT00:00:00%z").to_string()
}

/// End-of-day bound for a fetch window, `YYYY-MM-DDT23:59:59±HHMM`.
pub fn end_of_day(t: &DateTime<Tz>) -> String {
    t.format("%Y-%m-%dT23:59:59%z").to_string()
}

/// Wall-clock view of a timestamp: any offset is dropped after parsing so
/// entries display exactly as the facility lists them.
fn parse_wall_clock(s: &str) -> Result<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Ok(dt.naive_local());
    }
    parse_naive(s)
}

fn parse_naive(s: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .with_context(|| format!("unrecognized timestamp: {s}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::US::Eastern;

    #[test]
    fn renders_same_day_range() {
        assert_eq!(
            pretty_time_range("2024-01-01T12:00:00-0500", "2024-01-01T13:00:00-0500"),
            "Mon Jan 01 12:00PM - 01:00PM"
        );
    }

    #[test]
    fn renders_cross_day_range() {
        assert_eq!(
            pretty_time_range("2024-01-01T12:00:00-0500", "2024-01-02T13:00:00-0500"),
            "Mon Jan 01 12:00PM - Tue Jan 02 01:00PM"
        );
    }

    #[test]
    fn renders_naive_timestamps() {
        assert_eq!(
            pretty_time_range("2024-01-01T09:30:00", "2024-01-01T11:00:00"),
            "Mon Jan 01 09:30AM - 11:00AM"
        );
    }

    #[test]
    fn falls_back_to_raw_strings() {
        assert_eq!(pretty_time_range("soon", "later"), "soon - later");
    }

    #[test]
    fn naive_and_offset_forms_agree() {
        // EST is UTC-5 in January, so these are the same instant.
        let offset = parse_entry_time("2024-01-01T12:00:00-0500", Eastern).unwrap();
        let naive = parse_entry_time("2024-01-01T12:00:00", Eastern).unwrap();
        assert_eq!(offset, naive);
        assert_eq!(offset, Utc.with_ymd_and_hms(2024, 1, 1, 17, 0, 0).unwrap());
    }

    #[test]
    fn parses_colon_offsets_and_fractions() {
        let a = parse_entry_time("2024-06-01T12:00:00-04:00", Eastern).unwrap();
        let b = parse_entry_time("2024-06-01T12:00:00.000-0400", Eastern).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_entry_time("next tuesday", Eastern).is_err());
    }

    #[test]
    fn window_bounds_carry_the_local_offset() {
        let t = Eastern.with_ymd_and_hms(2024, 1, 1, 15, 30, 0).unwrap();
        assert_eq!(start_of_day(&t), "2024-01-01T00:00:00-0500");
        assert_eq!(end_of_day(&t), "2024-01-01T23:59:59-0500");

        // Daylight saving time shifts the offset with the date.
        let summer = Eastern.with_ymd_and_hms(2024, 7, 1, 9, 0, 0).unwrap();
        assert_eq!(start_of_day(&summer), "2024-07-01T00:00:00-0400");
    }
}
