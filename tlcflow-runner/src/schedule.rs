//! Monthly schedule.
//!
//! Only the monthly cron form `M H D * *` is accepted. A run's logical date is
//! the fire time that opens its interval; the run becomes due once the next
//! fire time has passed.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use tlcflow_core::ConfigError;

/// Day-of-month is capped so every month has a fire time.
pub const MAX_DAY: u32 = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonthlySchedule {
    minute: u32,
    hour: u32,
    day: u32,
}

fn next_month(year: i32, month: u32) -> (i32, u32) {
    if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    }
}

impl MonthlySchedule {
    pub fn new(minute: u32, hour: u32, day: u32) -> Result<Self, ConfigError> {
        let spec = format!("{minute} {hour} {day} * *");
        let invalid = |reason: &str| ConfigError::InvalidSchedule {
            schedule: spec.clone(),
            reason: reason.to_string(),
        };
        if minute > 59 {
            return Err(invalid("minute must be 0-59"));
        }
        if hour > 23 {
            return Err(invalid("hour must be 0-23"));
        }
        if !(1..=MAX_DAY).contains(&day) {
            return Err(invalid("day of month must be 1-28"));
        }
        Ok(Self { minute, hour, day })
    }

    pub fn parse(expr: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidSchedule {
            schedule: expr.to_string(),
            reason: reason.to_string(),
        };
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(invalid("expected five fields"));
        }
        if fields[3..].iter().any(|f| *f != "*") {
            return Err(invalid("only monthly schedules (`M H D * *`) are supported"));
        }
        let number = |field: &str, name: &str| {
            field
                .parse::<u32>()
                .map_err(|_| invalid(&format!("{name} must be a number, got '{field}'")))
        };
        let minute = number(fields[0], "minute")?;
        let hour = number(fields[1], "hour")?;
        let day = number(fields[2], "day of month")?;
        Self::new(minute, hour, day).map_err(|e| match e {
            ConfigError::InvalidSchedule { reason, .. } => invalid(&reason),
            other => other,
        })
    }

    pub fn cron(&self) -> String {
        format!("{} {} {} * *", self.minute, self.hour, self.day)
    }

    /// Fire time in a given month.
    pub fn fire_time(&self, year: i32, month: u32) -> Option<DateTime<Utc>> {
        NaiveDate::from_ymd_opt(year, month, self.day)
            .and_then(|d| d.and_hms_opt(self.hour, self.minute, 0))
            .map(|dt| dt.and_utc())
    }

    /// First fire time strictly after `t`.
    pub fn next_fire_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let this_month = self.fire_time(t.year(), t.month())?;
        if this_month > t {
            return Some(this_month);
        }
        let (y, m) = next_month(t.year(), t.month());
        self.fire_time(y, m)
    }

    pub fn first_fire_at_or_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let this_month = self.fire_time(t.year(), t.month())?;
        if this_month >= t {
            Some(this_month)
        } else {
            self.next_fire_after(t)
        }
    }

    /// Logical dates whose interval has closed by `now`, oldest first.
    pub fn due_logical_dates(&self, start: NaiveDate, now: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        let mut due = Vec::new();
        let Some(start) = start.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc()) else {
            return due;
        };
        let mut current = self.first_fire_at_or_after(start);
        while let Some(logical) = current {
            match self.next_fire_after(logical) {
                Some(next) if next <= now => {
                    due.push(logical);
                    current = Some(next);
                }
                _ => break,
            }
        }
        due
    }

    /// Logical date of the interval that carries `date`'s calendar month.
    pub fn logical_date_for(&self, date: NaiveDate) -> Option<DateTime<Utc>> {
        self.fire_time(date.year(), date.month())
    }

    /// One logical date per calendar month from `from` through `to`, inclusive.
    pub fn logical_dates_between(&self, from: NaiveDate, to: NaiveDate) -> Vec<DateTime<Utc>> {
        let mut dates = Vec::new();
        let (mut y, mut m) = (from.year(), from.month());
        let end = (to.year(), to.month());
        while (y, m) <= end {
            if let Some(dt) = self.fire_time(y, m) {
                dates.push(dt);
            }
            (y, m) = next_month(y, m);
        }
        dates
    }

    /// The next `count` logical dates whose intervals have not opened by `now`.
    pub fn upcoming(&self, now: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        let mut dates = Vec::with_capacity(count);
        let mut current = self.next_fire_after(now);
        while let Some(dt) = current {
            if dates.len() >= count {
                break;
            }
            dates.push(dt);
            current = self.next_fire_after(dt);
        }
        dates
    }
}
