use std::fmt;

use serde::{Deserialize, Serialize};

/// Configuration for one tracked event type at a facility.
///
/// Each config is diffed and notified independently; `event_name` doubles
/// as the display label and as part of the snapshot storage key, so the
/// `(facility_id, event_name)` pair must be unique across the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventConfig {
    pub facility_id: String,
    pub facility_name: String,
    pub lookahead_days: u32,
    pub event_name: String,
    pub filter: FilterRule,
}

/// Membership predicate over raw calendar entries.
///
/// A closed set of rule kinds instead of arbitrary code, so configurations
/// stay serializable. Matching is case-insensitive over the entry title.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FilterRule {
    /// The entry title contains the needle.
    Contains { needle: String },
    /// Every sub-rule matches.
    All { rules: Vec<FilterRule> },
    /// At least one sub-rule matches.
    Any { rules: Vec<FilterRule> },
    /// The sub-rule does not match.
    Not { rule: Box<FilterRule> },
}

impl FilterRule {
    pub fn matches(&self, entry: &CalendarEntry) -> bool {
        match self {
            FilterRule::Contains { needle } => entry
                .title
                .to_lowercase()
                .contains(&needle.to_lowercase()),
            FilterRule::All { rules } => rules.iter().all(|r| r.matches(entry)),
            FilterRule::Any { rules } => rules.iter().any(|r| r.matches(entry)),
            FilterRule::Not { rule } => !rule.matches(entry),
        }
    }
}

/// Parameters for one calendar API request.
///
/// Configs that resolve to the same facility and window share a single
/// fetch, so equality and hashing cover all three fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReqParam {
    pub facility_id: String,
    pub start: String,
    pub end: String,
}

/// Raw calendar entry as returned by the facility API.
///
/// Fields beyond title/start/end are kept in `extra` so that equality is
/// structural over the whole record; the diff relies on that.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarEntry {
    pub title: String,
    pub start: String,
    pub end: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// The kind of change detected for a tracked event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChangeType {
    New,
    Cancelled,
}

impl ChangeType {
    /// Rendering order for notifications: additions before cancellations.
    pub const ALL: [ChangeType; 2] = [ChangeType::New, ChangeType::Cancelled];
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeType::New => write!(f, "New"),
            ChangeType::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Start/end strings of one session, carried from an entry for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: String,
    pub end: String,
}

impl TimeRange {
    pub fn of(entry: &CalendarEntry) -> Self {
        TimeRange {
            start: entry.start.clone(),
            end: entry.end.clone(),
        }
    }
}

/// Changes detected for one event configuration.
///
/// Both sequences are always present; an empty one means no change of
/// that type, which is distinct from the config not having been diffed.
#[derive(Debug, Clone, PartialEq)]
pub struct EventChanges {
    pub config: EventConfig,
    pub new: Vec<TimeRange>,
    pub cancelled: Vec<TimeRange>,
}

impl EventChanges {
    pub fn none(config: EventConfig) -> Self {
        EventChanges {
            config,
            new: Vec::new(),
            cancelled: Vec::new(),
        }
    }

    pub fn get(&self, kind: ChangeType) -> &[TimeRange] {
        match kind {
            ChangeType::New => &self.new,
            ChangeType::Cancelled => &self.cancelled,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.cancelled.is_empty()
    }
}
