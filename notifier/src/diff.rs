use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use shared::models::{CalendarEntry, EventChanges, EventConfig, TimeRange};
use shared::timefmt::parse_entry_time;

/// Compare the stored snapshot against the freshly fetched one and collect
/// sessions that appeared or disappeared.
///
/// Membership is structural equality over whole entries, so a reschedule
/// shows up as one cancellation plus one addition. Only sessions starting
/// strictly after `now` are reported; past ones are not news. Both inputs
/// must already be filtered by `config`'s rule, and the output lists keep
/// the order of their source snapshot.
pub fn detect_changes(
    config: &EventConfig,
    previous: &[CalendarEntry],
    current: &[CalendarEntry],
    now: DateTime<Utc>,
    tz: Tz,
) -> EventChanges {
    let cancelled = upcoming(previous.iter().filter(|e| !current.contains(e)), now, tz);
    let new = upcoming(current.iter().filter(|e| !previous.contains(e)), now, tz);

    EventChanges {
        config: config.clone(),
        new,
        cancelled,
    }
}

fn upcoming<'a>(
    entries: impl Iterator<Item = &'a CalendarEntry>,
    now: DateTime<Utc>,
    tz: Tz,
) -> Vec<TimeRange> {
    entries
        .filter(|e| match parse_entry_time(&e.start, tz) {
            Ok(start) => start > now,
            Err(err) => {
                // An entry we cannot place in time can never be upcoming.
                tracing::warn!("Skipping entry with unparseable start '{}': {}", e.start, err);
                false
            }
        })
        .map(TimeRange::of)
        .collect()
}
