pub mod models;
pub mod timefmt;

pub use models::{
    CalendarEntry, ChangeType, EventChanges, EventConfig, FilterRule, ReqParam, TimeRange,
};
