//! Cron expression parsing

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

/// Schedule-related errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    /// Wrong number of fields
    #[error("cron expression {expression:?} has {fields} fields, expected 5, 6 or 7")]
    FieldCount { expression: String, fields: usize },

    /// Expression rejected by the parser
    #[error("invalid cron expression {expression:?}: {reason}")]
    Invalid { expression: String, reason: String },

    /// Valid expression that never fires again (e.g. a past year)
    #[error("cron expression {expression:?} has no upcoming firing")]
    Exhausted { expression: String },
}

/// A parsed cron expression
///
/// Accepts the classic 5-field form (minute precision) as well as the 6 and
/// 7 field forms with a leading seconds field and optional trailing year.
///
/// Day-of-week numbers follow the form: 5-field expressions use the classic
/// `0-7` numbering (0 and 7 are Sunday, 1 is Monday), while 6 and 7 field
/// expressions use the `cron` crate's `1-7` numbering (1 is Sunday).
///
/// # Example
///
/// ```
/// use laneq::CronSchedule;
///
/// let schedule = CronSchedule::parse("*/5 * * * *").unwrap();
/// assert_eq!(schedule.expression(), "*/5 * * * *");
/// ```
#[derive(Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: cron::Schedule,
}

impl CronSchedule {
    /// Parse a cron expression
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let trimmed = expression.trim();
        let fields = trimmed.split_whitespace().count();

        let normalized = match fields {
            5 => {
                let mut parts: Vec<&str> = trimmed.split_whitespace().collect();
                let day_of_week = crate_day_of_week(parts[4]).map_err(|reason| {
                    ScheduleError::Invalid {
                        expression: expression.to_string(),
                        reason,
                    }
                })?;
                parts[4] = &day_of_week;
                format!("0 {}", parts.join(" "))
            }
            6 | 7 => trimmed.to_string(),
            _ => {
                return Err(ScheduleError::FieldCount {
                    expression: expression.to_string(),
                    fields,
                })
            }
        };

        let schedule =
            cron::Schedule::from_str(&normalized).map_err(|e| ScheduleError::Invalid {
                expression: expression.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            expression: trimmed.to_string(),
            schedule,
        })
    }

    /// The expression as given (trimmed)
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First firing strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// Like [`next_after`](Self::next_after), failing for exhausted schedules
    pub fn upcoming(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        self.next_after(after).ok_or_else(|| ScheduleError::Exhausted {
            expression: self.expression.clone(),
        })
    }
}

/// Translate a classic day-of-week field (Sunday = 0 or 7) to the `cron`
/// crate's numbering (Sunday = 1)
///
/// Numeric ranges and steps are expanded to a list so that ranges ending on
/// Sunday (`5-7`) stay contiguous. Day names pass through untouched.
fn crate_day_of_week(field: &str) -> Result<String, String> {
    let mut items = Vec::new();
    for item in field.split(',') {
        if item.chars().any(|c| c.is_ascii_alphabetic()) {
            items.push(item.to_string());
            continue;
        }

        let (base, step) = match item.split_once('/') {
            Some((base, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid day-of-week step {step:?}"))?;
                if step == 0 {
                    return Err("day-of-week step must be positive".to_string());
                }
                (base, Some(step))
            }
            None => (item, None),
        };

        let (start, end) = match base {
            "*" | "?" if step.is_none() => {
                items.push(base.to_string());
                continue;
            }
            "*" | "?" => (0, 6),
            _ => match base.split_once('-') {
                Some((start, end)) => (parse_day(start)?, parse_day(end)?),
                None if step.is_some() => {
                    let day = parse_day(base)?;
                    (day, day.max(6))
                }
                None => {
                    let day = parse_day(base)?;
                    (day, day)
                }
            },
        };
        if start > end {
            return Err(format!("day-of-week range {base:?} runs backwards"));
        }

        let mut days: Vec<u32> = (start..=end)
            .step_by(step.unwrap_or(1) as usize)
            .map(|day| day % 7 + 1)
            .collect();
        days.sort_unstable();
        days.dedup();
        items.extend(days.into_iter().map(|day| day.to_string()));
    }
    Ok(items.join(","))
}

fn parse_day(value: &str) -> Result<u32, String> {
    match value.parse::<u32>() {
        Ok(day) if day <= 7 => Ok(day),
        _ => Err(format!("invalid day of week {value:?}")),
    }
}

impl fmt::Debug for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CronSchedule")
            .field(&self.expression)
            .finish()
    }
}

impl PartialEq for CronSchedule {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression
    }
}

impl FromStr for CronSchedule {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
