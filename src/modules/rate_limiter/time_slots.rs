//! Time-of-day windows ("HH:MM-HH:MM") used to restrict request categories.

use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, NaiveTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const MINUTES_PER_DAY: u16 = 24 * 60;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid time range '{input}': {reason}")]
pub struct TimeRangeError {
    pub input: String,
    pub reason: &'static str,
}

/// Inclusive minute-of-day range. `end < start` wraps past midnight and
/// `24:00` denotes the end of the day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeRange {
    start: u16,
    end: u16,
}

impl TimeRange {
    pub fn new(start: u16, end: u16) -> Result<Self, TimeRangeError> {
        if start > MINUTES_PER_DAY || end > MINUTES_PER_DAY {
            return Err(TimeRangeError {
                input: format!("{start}-{end}"),
                reason: "minute of day out of range",
            });
        }
        Ok(Self { start, end })
    }

    pub fn start_minute(&self) -> u16 {
        self.start
    }

    pub fn end_minute(&self) -> u16 {
        self.end
    }

    pub fn contains(&self, minute_of_day: u16) -> bool {
        if self.end > self.start {
            minute_of_day >= self.start && minute_of_day <= self.end
        } else {
            minute_of_day >= self.start || minute_of_day <= self.end
        }
    }
}

fn parse_clock(raw: &str, input: &str) -> Result<u16, TimeRangeError> {
    let err = |reason| TimeRangeError {
        input: input.to_string(),
        reason,
    };
    let (hours, minutes) = raw.trim().split_once(':').ok_or_else(|| err("expected HH:MM"))?;
    let hours: u16 = hours.parse().map_err(|_| err("hour is not a number"))?;
    let minutes: u16 = minutes.parse().map_err(|_| err("minute is not a number"))?;
    if minutes >= 60 || hours > 24 || (hours == 24 && minutes != 0) {
        return Err(err("clock value out of range"));
    }
    Ok(hours * 60 + minutes)
}

impl FromStr for TimeRange {
    type Err = TimeRangeError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let (start, end) = input.split_once('-').ok_or_else(|| TimeRangeError {
            input: input.to_string(),
            reason: "expected HH:MM-HH:MM",
        })?;
        Ok(Self {
            start: parse_clock(start, input)?,
            end: parse_clock(end, input)?,
        })
    }
}

impl TryFrom<String> for TimeRange {
    type Error = TimeRangeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TimeRange> for String {
    fn from(range: TimeRange) -> Self {
        range.to_string()
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}:{:02}-{:02}:{:02}",
            self.start / 60,
            self.start % 60,
            self.end / 60,
            self.end % 60
        )
    }
}

pub(crate) fn minute_of_day(now: DateTime<Utc>, offset: FixedOffset) -> u16 {
    let local = now.with_timezone(&offset);
    (local.hour() * 60 + local.minute()) as u16
}

/// Whether `now` falls inside any of `slots`.
pub fn within_slots(slots: &[TimeRange], now: DateTime<Utc>, offset: FixedOffset) -> bool {
    let minute = minute_of_day(now, offset);
    slots.iter().any(|slot| slot.contains(minute))
}

/// Next instant at which one of `slots` opens: the earliest start later
/// today, otherwise the earliest start tomorrow.
pub fn next_slot_start(
    slots: &[TimeRange],
    now: DateTime<Utc>,
    offset: FixedOffset,
) -> Option<DateTime<Utc>> {
    let local = now.with_timezone(&offset);
    let today = local.date_naive();

    let start_on = |day: chrono::NaiveDate, minute: u16| {
        let time = NaiveTime::from_hms_opt((minute / 60) as u32 % 24, (minute % 60) as u32, 0)?;
        let mut naive = day.and_time(time);
        if minute >= MINUTES_PER_DAY {
            naive += ChronoDuration::days(1);
        }
        offset
            .from_local_datetime(&naive)
            .single()
            .map(|dt| dt.with_timezone(&Utc))
    };

    let later_today = slots
        .iter()
        .filter_map(|slot| start_on(today, slot.start))
        .filter(|start| *start > now)
        .min();
    if later_today.is_some() {
        return later_today;
    }

    let tomorrow = today.succ_opt()?;
    slots
        .iter()
        .filter_map(|slot| start_on(tomorrow, slot.start))
        .min()
}
