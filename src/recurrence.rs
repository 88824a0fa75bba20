//! Due-date calculation for recurring chores.
//!
//! Frequencies are expanded through `rrule` in UTC. Monthly chores anchored on
//! the 29th to 31st clamp to the last day of shorter months.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Utc};
use rrule::{RRule, RRuleSet, Tz, Unvalidated};
use serde::{Deserialize, Serialize};

use crate::{
    time::{ensure_schedulable, to_date},
    AppError, AppResult,
};

pub const MAX_CUSTOM_INTERVAL_DAYS: i64 = 365;
const RECURRENCE_INVALID: &str = "RECURRENCE/INVALID";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    #[default]
    Once,
    Daily,
    Weekly,
    Biweekly,
    Monthly,
    Custom,
}

impl Frequency {
    pub fn as_str(self) -> &'static str {
        match self {
            Frequency::Once => "once",
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
            Frequency::Biweekly => "biweekly",
            Frequency::Monthly => "monthly",
            Frequency::Custom => "custom",
        }
    }

    pub fn is_recurring(self) -> bool {
        self != Frequency::Once
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Frequency {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "once" => Ok(Frequency::Once),
            "daily" => Ok(Frequency::Daily),
            "weekly" => Ok(Frequency::Weekly),
            "biweekly" => Ok(Frequency::Biweekly),
            "monthly" => Ok(Frequency::Monthly),
            "custom" => Ok(Frequency::Custom),
            other => Err(AppError::validation("frequency", "Unknown task frequency.")
                .with_context("frequency", other.to_string())),
        }
    }
}

/// Check that `interval_days` is present exactly when the frequency needs it.
pub fn validate(frequency: Frequency, interval_days: Option<i64>) -> AppResult<()> {
    match (frequency, interval_days) {
        (Frequency::Custom, Some(days)) if (1..=MAX_CUSTOM_INTERVAL_DAYS).contains(&days) => Ok(()),
        (Frequency::Custom, _) => Err(AppError::validation(
            "intervalDays",
            "Custom frequencies need an interval between 1 and 365 days.",
        )),
        (_, None) => Ok(()),
        (_, Some(_)) => Err(AppError::validation(
            "intervalDays",
            "Only custom frequencies take an interval.",
        )),
    }
}

fn rule_for(frequency: Frequency, interval_days: Option<i64>, anchor: &DateTime<Utc>) -> Option<String> {
    match frequency {
        Frequency::Once => None,
        Frequency::Daily => Some("FREQ=DAILY".to_string()),
        Frequency::Weekly => Some("FREQ=WEEKLY".to_string()),
        Frequency::Biweekly => Some("FREQ=WEEKLY;INTERVAL=2".to_string()),
        Frequency::Monthly => {
            let day = anchor.day();
            if day <= 28 {
                Some(format!("FREQ=MONTHLY;BYMONTHDAY={day}"))
            } else {
                // Last existing day among 28..=day of each month.
                let days: Vec<String> = (28..=day).map(|d| d.to_string()).collect();
                Some(format!(
                    "FREQ=MONTHLY;BYMONTHDAY={};BYSETPOS=-1",
                    days.join(",")
                ))
            }
        }
        Frequency::Custom => Some(format!("FREQ=DAILY;INTERVAL={}", interval_days.unwrap_or(1))),
    }
}

fn date_in_window(ms: i64) -> AppResult<DateTime<Utc>> {
    to_date(ms).ok_or_else(|| {
        AppError::new(RECURRENCE_INVALID, "Timestamp out of range.").with_context("ms", ms.to_string())
    })
}

/// The next `count` occurrences strictly after `after_ms`, for a series
/// anchored at `anchor_ms`. Non-recurring chores have no occurrences.
pub fn occurrences_after(
    frequency: Frequency,
    interval_days: Option<i64>,
    anchor_ms: i64,
    after_ms: i64,
    count: usize,
) -> AppResult<Vec<i64>> {
    validate(frequency, interval_days)?;
    if count == 0 {
        return Ok(Vec::new());
    }
    ensure_schedulable("anchor", anchor_ms)?;
    ensure_schedulable("after", after_ms)?;
    // rrule works at second precision.
    let anchor = date_in_window(anchor_ms - anchor_ms.rem_euclid(1000))?;
    let Some(rule) = rule_for(frequency, interval_days, &anchor) else {
        return Ok(Vec::new());
    };

    let start = anchor.with_timezone(&Tz::UTC);
    let unvalidated: RRule<Unvalidated> = rule.parse().map_err(|err: rrule::RRuleError| {
        AppError::new(RECURRENCE_INVALID, err.to_string()).with_context("rule", rule.clone())
    })?;
    let validated = unvalidated.validate(start).map_err(|err| {
        AppError::new(RECURRENCE_INVALID, err.to_string()).with_context("rule", rule.clone())
    })?;

    // Widened by a second; the strict bound is applied by the filter below.
    let window_start = date_in_window(after_ms.max(anchor_ms) - 1000)?.with_timezone(&Tz::UTC);
    let limit = u16::try_from(count + 1).unwrap_or(u16::MAX);
    let result = RRuleSet::new(start)
        .rrule(validated)
        .after(window_start)
        .all(limit);

    Ok(result
        .dates
        .into_iter()
        .map(|date| date.with_timezone(&Utc).timestamp_millis())
        .filter(|ms| *ms > after_ms)
        .take(count)
        .collect())
}

/// First occurrence strictly after `after_ms`, or `None` for one-off chores.
pub fn next_due(
    frequency: Frequency,
    interval_days: Option<i64>,
    anchor_ms: i64,
    after_ms: i64,
) -> AppResult<Option<i64>> {
    Ok(occurrences_after(frequency, interval_days, anchor_ms, after_ms, 1)?
        .into_iter()
        .next())
}
