//! Pure recurrence expansion: rule + anchor window → concrete occurrences.
//!
//! No I/O, deterministic, capped at [`MAX_OCCURRENCES`] regardless of the
//! rule's end condition. The occurrence duration always equals the anchor
//! window's duration.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};

use crate::db::models::{RecurrenceEndType, RecurrenceFrequency};
use crate::errors::EngineError;

/// Hard bound on series length, regardless of end type.
pub const MAX_OCCURRENCES: usize = 100;

/// A recurrence rule as submitted with a series request.
#[derive(Debug, Clone)]
pub struct RecurrenceRule {
    pub frequency: RecurrenceFrequency,
    pub interval: u32,
    /// Weekday numbers, 0 = Monday .. 6 = Sunday. Weekly rules only.
    pub days_of_week: Vec<u8>,
    pub end_type: RecurrenceEndType,
    pub end_date: Option<DateTime<Utc>>,
    pub occurrence_count: Option<u32>,
}

impl RecurrenceRule {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.interval < 1 {
            return Err(EngineError::Validation("interval must be at least 1".into()));
        }
        if !self.days_of_week.is_empty() && self.frequency != RecurrenceFrequency::Weekly {
            return Err(EngineError::Validation(
                "days_of_week only applies to weekly rules".into(),
            ));
        }
        if self.days_of_week.iter().any(|&d| d > 6) {
            return Err(EngineError::Validation(
                "days_of_week values must be 0 (Monday) through 6 (Sunday)".into(),
            ));
        }
        match self.end_type {
            RecurrenceEndType::OnDate => {
                if self.end_date.is_none() {
                    return Err(EngineError::Validation(
                        "end_date is required when end_type is on_date".into(),
                    ));
                }
                if self.occurrence_count.is_some() {
                    return Err(EngineError::Validation(
                        "occurrence_count does not apply to on_date rules".into(),
                    ));
                }
            }
            RecurrenceEndType::AfterCount => {
                match self.occurrence_count {
                    Some(1..=100) => {}
                    Some(_) => {
                        return Err(EngineError::Validation(
                            "occurrence_count must be between 1 and 100".into(),
                        ))
                    }
                    None => {
                        return Err(EngineError::Validation(
                            "occurrence_count is required when end_type is after_count".into(),
                        ))
                    }
                }
                if self.end_date.is_some() {
                    return Err(EngineError::Validation(
                        "end_date does not apply to after_count rules".into(),
                    ));
                }
            }
            RecurrenceEndType::Never => {
                if self.end_date.is_some() || self.occurrence_count.is_some() {
                    return Err(EngineError::Validation(
                        "end_date and occurrence_count do not apply to never-ending rules".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

fn days_in_month(year: i32, month: u32) -> u32 {
    const DAYS: [u32; 12] = [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];
    if month == 2 && (year % 4 == 0 && (year % 100 != 0 || year % 400 == 0)) {
        29
    } else {
        DAYS[(month - 1) as usize]
    }
}

/// Add calendar months, clamping the day-of-month to the last valid day of
/// the target month (Jan 31 + 1 month → Feb 28/29).
pub fn add_months(dt: DateTime<Utc>, months: u32) -> DateTime<Utc> {
    let total = dt.month0() as i64 + months as i64;
    let year = dt.year() + (total / 12) as i32;
    let month = (total % 12) as u32 + 1;
    let day = dt.day().min(days_in_month(year, month));
    let date = NaiveDate::from_ymd_opt(year, month, day).expect("clamped day is valid for month");
    date.and_time(dt.time()).and_utc()
}

/// Expand `rule` anchored at `[start, end)` into concrete occurrences.
/// An empty expansion is an error.
pub fn expand(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    rule: &RecurrenceRule,
) -> Result<Vec<(DateTime<Utc>, DateTime<Utc>)>, EngineError> {
    rule.validate()?;
    if end <= start {
        return Err(EngineError::Validation(
            "end time must be after start time".into(),
        ));
    }

    let duration = end - start;
    let should_continue = |next_start: DateTime<Utc>, count: usize| -> bool {
        if count >= MAX_OCCURRENCES {
            return false;
        }
        match rule.end_type {
            RecurrenceEndType::AfterCount => count < rule.occurrence_count.unwrap_or(0) as usize,
            RecurrenceEndType::OnDate => match rule.end_date {
                Some(cap) => next_start <= cap,
                None => false,
            },
            RecurrenceEndType::Never => count < MAX_OCCURRENCES,
        }
    };

    let mut occurrences: Vec<(DateTime<Utc>, DateTime<Utc>)> = Vec::new();
    match rule.frequency {
        RecurrenceFrequency::Daily => {
            let mut current = start;
            while should_continue(current, occurrences.len()) {
                occurrences.push((current, current + duration));
                current += Duration::days(rule.interval as i64);
            }
        }
        RecurrenceFrequency::Weekly => {
            let mut days: Vec<i64> = if rule.days_of_week.is_empty() {
                vec![start.weekday().num_days_from_monday() as i64]
            } else {
                rule.days_of_week.iter().map(|&d| d as i64).collect()
            };
            days.sort_unstable();
            days.dedup();

            let mut current_week = start;
            'weeks: while should_continue(current_week, occurrences.len()) {
                for &day in &days {
                    let occurrence = current_week
                        + Duration::days(
                            day - current_week.weekday().num_days_from_monday() as i64,
                        );
                    // Weekdays earlier in the anchor week fall before start.
                    if occurrence < start {
                        continue;
                    }
                    if !should_continue(occurrence, occurrences.len()) {
                        break 'weeks;
                    }
                    occurrences.push((occurrence, occurrence + duration));
                }
                current_week += Duration::weeks(rule.interval as i64);
            }
        }
        RecurrenceFrequency::Monthly => {
            let mut current = start;
            while should_continue(current, occurrences.len()) {
                occurrences.push((current, current + duration));
                current = add_months(current, rule.interval);
            }
        }
    }

    if rule.end_type == RecurrenceEndType::OnDate {
        if let Some(cap) = rule.end_date {
            occurrences.retain(|(s, _)| *s <= cap);
        }
    }
    if rule.end_type == RecurrenceEndType::AfterCount {
        if let Some(count) = rule.occurrence_count {
            occurrences.truncate(count as usize);
        }
    }
    occurrences.truncate(MAX_OCCURRENCES);

    if occurrences.is_empty() {
        return Err(EngineError::Validation(
            "no occurrences generated for the given rule".into(),
        ));
    }
    Ok(occurrences)
}
