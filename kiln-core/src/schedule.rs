//! Cron schedules
//!
//! Five-field cron expressions (`minute hour day-of-month month day-of-week`)
//! evaluated in UTC. Each field accepts `*`, single values, ranges (`a-b`),
//! lists (`a,b`) and steps (`*/n`, `a-b/n`, `a/n`). Months and weekdays also
//! accept three-letter names, and weekday `7` is Sunday.
//!
//! When both day-of-month and day-of-week are restricted, a date matches if
//! either of them matches.

use chrono::{DateTime, Datelike, NaiveDate, TimeDelta, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// How far `next_after`/`latest_at_or_before` search before giving up.
/// Nine years always contains a February 29th.
const SEARCH_HORIZON_DAYS: u32 = 366 * 9;

const MONTH_NAMES: &[&str] = &[
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const WEEKDAY_NAMES: &[&str] = &["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

struct Field {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
    /// Value of the first entry in `names`
    names_base: u32,
}

const MINUTE: Field = Field {
    name: "minute",
    min: 0,
    max: 59,
    names: &[],
    names_base: 0,
};
const HOUR: Field = Field {
    name: "hour",
    min: 0,
    max: 23,
    names: &[],
    names_base: 0,
};
const DAY_OF_MONTH: Field = Field {
    name: "day-of-month",
    min: 1,
    max: 31,
    names: &[],
    names_base: 0,
};
const MONTH: Field = Field {
    name: "month",
    min: 1,
    max: 12,
    names: MONTH_NAMES,
    names_base: 1,
};
const DAY_OF_WEEK: Field = Field {
    name: "day-of-week",
    min: 0,
    max: 7,
    names: WEEKDAY_NAMES,
    names_base: 0,
};

impl Field {
    fn value(&self, token: &str) -> Result<u32, String> {
        let value = match token.parse::<u32>() {
            Ok(v) => v,
            Err(_) => self
                .names
                .iter()
                .position(|n| n.eq_ignore_ascii_case(token))
                .map(|idx| idx as u32 + self.names_base)
                .ok_or_else(|| format!("invalid {} value '{}'", self.name, token))?,
        };

        if value < self.min || value > self.max {
            return Err(format!(
                "{} value {} out of range {}-{}",
                self.name, value, self.min, self.max
            ));
        }

        Ok(value)
    }

    /// Parses one field into a bitmask of allowed values
    fn parse(&self, field: &str) -> Result<u64, String> {
        let mut mask = 0u64;

        for item in field.split(',') {
            if item.is_empty() {
                return Err(format!("empty list item in {} field", self.name));
            }

            let (range, step) = match item.split_once('/') {
                Some((range, step)) => {
                    let step: u32 = step
                        .parse()
                        .map_err(|_| format!("invalid step '{}' in {} field", step, self.name))?;
                    if step == 0 {
                        return Err(format!("step must be positive in {} field", self.name));
                    }
                    (range, step)
                }
                None => (item, 1),
            };

            let (start, end) = if range == "*" {
                (self.min, self.max)
            } else if let Some((a, b)) = range.split_once('-') {
                (self.value(a)?, self.value(b)?)
            } else {
                let v = self.value(range)?;
                if item.contains('/') { (v, self.max) } else { (v, v) }
            };

            if start > end {
                return Err(format!(
                    "range {}-{} is reversed in {} field",
                    start, end, self.name
                ));
            }

            let mut v = start;
            while v <= end {
                mask |= 1 << v;
                match v.checked_add(step) {
                    Some(next) => v = next,
                    None => break,
                }
            }
        }

        Ok(mask)
    }
}

/// A parsed cron expression
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CronSchedule {
    expression: String,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    day_of_month_restricted: bool,
    day_of_week_restricted: bool,
}

impl CronSchedule {
    /// Parses a cron expression, rejecting expressions that can never fire
    pub fn parse(expression: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidSchedule {
            expression: expression.to_string(),
            reason,
        };

        let trimmed = expression.trim();
        let expanded = expand_macro(trimmed).unwrap_or(trimmed);
        let fields: Vec<&str> = expanded.split_whitespace().collect();

        if fields.len() != 5 {
            return Err(invalid(format!(
                "expected 5 fields, found {}",
                fields.len()
            )));
        }

        let minutes = MINUTE.parse(fields[0]).map_err(invalid)?;
        let hours = HOUR.parse(fields[1]).map_err(invalid)?;
        let days_of_month = DAY_OF_MONTH.parse(fields[2]).map_err(invalid)?;
        let months = MONTH.parse(fields[3]).map_err(invalid)?;
        let mut days_of_week = DAY_OF_WEEK.parse(fields[4]).map_err(invalid)?;

        // Sunday is both 0 and 7
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week | 1) & !(1 << 7);
        }

        let schedule = Self {
            expression: trimmed.to_string(),
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            day_of_month_restricted: !fields[2].starts_with('*'),
            day_of_week_restricted: !fields[4].starts_with('*'),
        };

        if !schedule.can_fire() {
            return Err(invalid("expression never fires".to_string()));
        }

        Ok(schedule)
    }

    /// The expression as written
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Returns true if `at` (truncated to the minute) is a firing time
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        self.matches_date(at.date_naive())
            && bit(self.hours, at.hour())
            && bit(self.minutes, at.minute())
    }

    /// First firing time strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = floor_to_minute(after)? + TimeDelta::minutes(1);
        let first_day = start.date_naive();
        let mut day = first_day;

        for _ in 0..SEARCH_HORIZON_DAYS {
            if self.matches_date(day) {
                let (hour, minute) = if day == first_day {
                    (start.hour(), start.minute())
                } else {
                    (0, 0)
                };
                if let Some((h, m)) = self.first_time_from(hour, minute) {
                    return at_time(day, h, m);
                }
            }
            day = day.succ_opt()?;
        }

        None
    }

    /// Latest firing time at or before `at`
    pub fn latest_at_or_before(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let end = floor_to_minute(at)?;
        let last_day = end.date_naive();
        let mut day = last_day;

        for _ in 0..SEARCH_HORIZON_DAYS {
            if self.matches_date(day) {
                let (hour, minute) = if day == last_day {
                    (end.hour(), end.minute())
                } else {
                    (23, 59)
                };
                if let Some((h, m)) = self.last_time_until(hour, minute) {
                    return at_time(day, h, m);
                }
            }
            day = day.pred_opt()?;
        }

        None
    }

    fn matches_date(&self, day: NaiveDate) -> bool {
        if !bit(self.months, day.month()) {
            return false;
        }

        let dom = bit(self.days_of_month, day.day());
        let dow = bit(self.days_of_week, day.weekday().num_days_from_sunday());

        match (self.day_of_month_restricted, self.day_of_week_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    fn first_time_from(&self, hour: u32, minute: u32) -> Option<(u32, u32)> {
        for h in hour..24 {
            if !bit(self.hours, h) {
                continue;
            }
            let from = if h == hour { minute } else { 0 };
            if let Some(m) = (from..60).find(|m| bit(self.minutes, *m)) {
                return Some((h, m));
            }
        }
        None
    }

    fn last_time_until(&self, hour: u32, minute: u32) -> Option<(u32, u32)> {
        for h in (0..=hour).rev() {
            if !bit(self.hours, h) {
                continue;
            }
            let until = if h == hour { minute } else { 59 };
            if let Some(m) = (0..=until).rev().find(|m| bit(self.minutes, *m)) {
                return Some((h, m));
            }
        }
        None
    }

    /// A day-of-month restriction alone can name days no month has (Feb 30)
    fn can_fire(&self) -> bool {
        if !self.day_of_month_restricted || self.day_of_week_restricted {
            return true;
        }

        (1..=12u32)
            .filter(|m| bit(self.months, *m))
            .any(|m| (1..=max_days_in_month(m)).any(|d| bit(self.days_of_month, d)))
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expression)
    }
}

impl FromStr for CronSchedule {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for CronSchedule {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<CronSchedule> for String {
    fn from(schedule: CronSchedule) -> Self {
        schedule.expression
    }
}

fn expand_macro(expression: &str) -> Option<&'static str> {
    match expression.to_ascii_lowercase().as_str() {
        "@yearly" | "@annually" => Some("0 0 1 1 *"),
        "@monthly" => Some("0 0 1 * *"),
        "@weekly" => Some("0 0 * * 0"),
        "@daily" | "@midnight" => Some("0 0 * * *"),
        "@hourly" => Some("0 * * * *"),
        _ => None,
    }
}

fn bit(mask: u64, value: u32) -> bool {
    mask & (1 << value) != 0
}

fn max_days_in_month(month: u32) -> u32 {
    match month {
        2 => 29,
        4 | 6 | 9 | 11 => 30,
        _ => 31,
    }
}

fn floor_to_minute(at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let secs = at.timestamp();
    Utc.timestamp_opt(secs - secs.rem_euclid(60), 0).single()
}

fn at_time(day: NaiveDate, hour: u32, minute: u32) -> Option<DateTime<Utc>> {
    day.and_hms_opt(hour, minute, 0)
        .map(|naive| Utc.from_utc_datetime(&naive))
}
