use chrono::{DateTime, Datelike, Local, Timelike, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

// --- Default power-on windows ---
// (from_hour, to_hour), both inclusive, local wall clock.

const WEEKDAY_INTERVALS: &[PowerOnInterval] = &[
    PowerOnInterval::new(6, 8),   // Breakfast
    PowerOnInterval::new(11, 13), // Lunch
    PowerOnInterval::new(14, 15), // Afternoon coffee
];

const WEEKEND_INTERVALS: &[PowerOnInterval] = &[
    PowerOnInterval::new(7, 9),
    PowerOnInterval::new(11, 13),
    PowerOnInterval::new(14, 15),
];

const WEEKDAYS: [Weekday; 5] = [Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri];
const WEEKEND: [Weekday; 2] = [Weekday::Sat, Weekday::Sun];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("hour {hour} on {day} is outside 0..=23")]
    HourOutOfRange { day: Weekday, hour: u32 },
    #[error("interval {from_hour}..{to_hour} on {day} ends before it starts")]
    Reversed {
        day: Weekday,
        from_hour: u32,
        to_hour: u32,
    },
}

/// Whole-hour window during which the machine should be powered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PowerOnInterval {
    pub from_hour: u32,
    pub to_hour: u32,
}

impl PowerOnInterval {
    pub const fn new(from_hour: u32, to_hour: u32) -> Self {
        Self { from_hour, to_hour }
    }

    /// Both bounds inclusive: `{6, 8}` covers 06:00 through 08:59.
    pub fn contains(&self, hour: u32) -> bool {
        self.from_hour <= hour && hour <= self.to_hour
    }
}

/// Power-on windows per weekday. Serialized as a map keyed by weekday name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PowerSchedule {
    frames: HashMap<Weekday, Vec<PowerOnInterval>>,
}

impl PowerSchedule {
    /// A schedule with no windows; the machine only runs on demand.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_day(mut self, day: Weekday, intervals: impl Into<Vec<PowerOnInterval>>) -> Self {
        self.set_day(day, intervals);
        self
    }

    pub fn set_day(&mut self, day: Weekday, intervals: impl Into<Vec<PowerOnInterval>>) {
        self.frames.insert(day, intervals.into());
    }

    pub fn intervals(&self, day: Weekday) -> &[PowerOnInterval] {
        self.frames.get(&day).map(Vec::as_slice).unwrap_or(&[])
    }

    /// First window of `now`'s weekday containing `now`'s hour.
    pub fn matching(&self, now: DateTime<Local>) -> Option<PowerOnInterval> {
        let hour = now.hour();
        self.intervals(now.weekday())
            .iter()
            .find(|interval| interval.contains(hour))
            .copied()
    }

    pub fn validate(&self) -> Result<(), ScheduleError> {
        for (&day, intervals) in &self.frames {
            for interval in intervals {
                for hour in [interval.from_hour, interval.to_hour] {
                    if hour > 23 {
                        return Err(ScheduleError::HourOutOfRange { day, hour });
                    }
                }
                if interval.from_hour > interval.to_hour {
                    return Err(ScheduleError::Reversed {
                        day,
                        from_hour: interval.from_hour,
                        to_hour: interval.to_hour,
                    });
                }
            }
        }
        Ok(())
    }

    /// Breakfast, lunch and afternoon windows, an hour later on weekends.
    pub fn standard() -> Self {
        let mut schedule = Self::empty();
        for day in WEEKDAYS {
            schedule.set_day(day, WEEKDAY_INTERVALS);
        }
        for day in WEEKEND {
            schedule.set_day(day, WEEKEND_INTERVALS);
        }
        schedule
    }
}
