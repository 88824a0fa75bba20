use chrono::{DateTime, NaiveDate, Utc};

use crate::{AppError, AppResult};

/// 2000-01-01T00:00:00Z
pub const MIN_SCHEDULE_MS: i64 = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_SCHEDULE_MS: i64 = 7_258_118_400_000;

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// `None` when the timestamp is outside what chrono can represent.
pub fn to_date(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
}

/// Calendar day (UTC) containing the given millisecond timestamp.
pub fn utc_day(ms: i64) -> Option<NaiveDate> {
    to_date(ms).map(|date| date.date_naive())
}

/// Reject schedule timestamps outside 2000..2200.
pub fn ensure_schedulable(field: &str, ms: i64) -> AppResult<()> {
    if (MIN_SCHEDULE_MS..MAX_SCHEDULE_MS).contains(&ms) {
        Ok(())
    } else {
        Err(AppError::validation(field, "Dates must fall between the years 2000 and 2200.")
            .with_context(field, ms.to_string()))
    }
}
