// dbvault/src/scheduler/cron.rs
//! Five-field cron expressions evaluated in UTC.
//!
//! Fields: minute, hour, day-of-month, month, day-of-week. Each accepts `*`,
//! values, comma lists, `a-b` ranges and `/n` steps; months and weekdays also
//! accept three-letter names. Day-of-week 7 is Sunday. When both day fields
//! are restricted, a day matches if either does.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use std::fmt;
use std::str::FromStr;

use crate::errors::{AppError, Result};

/// How far ahead `next_after` looks before giving up.
const SEARCH_HORIZON_DAYS: i64 = 366 * 5;

struct FieldKind {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
}

const MINUTE: FieldKind = FieldKind { name: "minute", min: 0, max: 59, names: &[] };
const HOUR: FieldKind = FieldKind { name: "hour", min: 0, max: 23, names: &[] };
const DAY_OF_MONTH: FieldKind = FieldKind { name: "day-of-month", min: 1, max: 31, names: &[] };
const MONTH: FieldKind = FieldKind {
    name: "month",
    min: 1,
    max: 12,
    names: &["jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec"],
};
const DAY_OF_WEEK: FieldKind = FieldKind {
    name: "day-of-week",
    min: 0,
    max: 7,
    names: &["sun", "mon", "tue", "wed", "thu", "fri", "sat"],
};

/// The set of values one field allows, as a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CronField {
    mask: u64,
    restricted: bool,
}

impl CronField {
    pub fn contains(&self, value: u32) -> bool {
        value < 64 && self.mask & (1u64 << value) != 0
    }

    /// `false` when the field was written starting with `*`.
    pub fn is_restricted(&self) -> bool {
        self.restricted
    }

    fn parse(spec: &str, kind: &FieldKind) -> Result<Self> {
        let invalid = |detail: &str| {
            AppError::Configuration(format!(
                "invalid cron {} field '{}': {}",
                kind.name, spec, detail
            ))
        };
        if spec.is_empty() {
            return Err(invalid("empty field"));
        }

        let mut mask = 0u64;
        for item in spec.split(',') {
            let (range, step) = match item.split_once('/') {
                Some((range, step)) => {
                    let step: u32 = step.parse().map_err(|_| invalid("step is not a number"))?;
                    if step == 0 {
                        return Err(invalid("step must be at least 1"));
                    }
                    (range, Some(step))
                }
                None => (item, None),
            };

            let (start, end) = if range == "*" {
                (kind.min, kind.max)
            } else if let Some((a, b)) = range.split_once('-') {
                let start = parse_value(a, kind).ok_or_else(|| invalid("bad range start"))?;
                let end = parse_value(b, kind).ok_or_else(|| invalid("bad range end"))?;
                (start, end)
            } else {
                let value = parse_value(range, kind).ok_or_else(|| invalid("bad value"))?;
                match step {
                    Some(_) => (value, kind.max),
                    None => (value, value),
                }
            };
            if start > end {
                return Err(invalid("range start is after range end"));
            }

            let step = step.unwrap_or(1) as usize;
            for value in (start..=end).step_by(step) {
                mask |= 1u64 << value;
            }
        }

        // Sunday is both 0 and 7.
        if kind.name == DAY_OF_WEEK.name && mask & (1u64 << 7) != 0 {
            mask = (mask & !(1u64 << 7)) | 1;
        }

        Ok(Self {
            mask,
            restricted: !spec.starts_with('*'),
        })
    }
}

fn parse_value(token: &str, kind: &FieldKind) -> Option<u32> {
    let value = match token.parse::<u32>() {
        Ok(value) => value,
        Err(_) => {
            let lowered = token.to_ascii_lowercase();
            let index = kind.names.iter().position(|n| *n == lowered)? as u32;
            // jan = 1, sun = 0
            index + kind.min
        }
    };
    (kind.min..=kind.max).contains(&value).then_some(value)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    source: String,
    minutes: CronField,
    hours: CronField,
    days_of_month: CronField,
    months: CronField,
    days_of_week: CronField,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self> {
        let trimmed = expr.trim();
        let expanded = match trimmed.to_ascii_lowercase().as_str() {
            "@yearly" | "@annually" => "0 0 1 1 *",
            "@monthly" => "0 0 1 * *",
            "@weekly" => "0 0 * * 0",
            "@daily" | "@midnight" => "0 0 * * *",
            "@hourly" => "0 * * * *",
            _ => trimmed,
        };
        let fields: Vec<&str> = expanded.split_whitespace().collect();
        let [minute, hour, dom, month, dow] = fields.as_slice() else {
            return Err(AppError::Configuration(format!(
                "invalid cron expression '{}': expected 5 fields, found {}",
                expr,
                fields.len()
            )));
        };

        Ok(Self {
            source: trimmed.to_string(),
            minutes: CronField::parse(minute, &MINUTE)?,
            hours: CronField::parse(hour, &HOUR)?,
            days_of_month: CronField::parse(dom, &DAY_OF_MONTH)?,
            months: CronField::parse(month, &MONTH)?,
            days_of_week: CronField::parse(dow, &DAY_OF_WEEK)?,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.days_of_month.contains(date.day());
        let dow = self.days_of_week.contains(date.weekday().num_days_from_sunday());
        match (self.days_of_month.is_restricted(), self.days_of_week.is_restricted()) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    /// First firing instant strictly after `after`, or `None` if there is none
    /// within the search horizon.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let horizon = after + Duration::days(SEARCH_HORIZON_DAYS);
        let mut t = after.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);

        while t <= horizon {
            if !self.months.contains(t.month()) {
                let (year, month) = if t.month() == 12 {
                    (t.year() + 1, 1)
                } else {
                    (t.year(), t.month() + 1)
                };
                t = Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()?;
                continue;
            }
            if !self.day_matches(t.date_naive()) {
                let next_day = t.date_naive().succ_opt()?;
                t = Utc.from_utc_datetime(&next_day.and_hms_opt(0, 0, 0)?);
                continue;
            }
            if !self.hours.contains(t.hour()) {
                t = t.with_minute(0)? + Duration::hours(1);
                continue;
            }
            if !self.minutes.contains(t.minute()) {
                t += Duration::minutes(1);
                continue;
            }
            return Some(t);
        }
        None
    }
}

impl FromStr for CronExpr {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
