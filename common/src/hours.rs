use chrono::{DateTime, Datelike, FixedOffset, Timelike, Weekday};
use serde::{Deserialize, Serialize};

pub const DAYS_PER_WEEK: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DayOfWeek {
    Sun,
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
}

impl DayOfWeek {
    /// Sunday-based index, matching the order of the stored `hours` array.
    pub fn index(self) -> usize {
        match self {
            Self::Sun => 0,
            Self::Mon => 1,
            Self::Tue => 2,
            Self::Wed => 3,
            Self::Thu => 4,
            Self::Fri => 5,
            Self::Sat => 6,
        }
    }

    pub fn from_chrono(weekday: Weekday) -> Self {
        match weekday {
            Weekday::Sun => Self::Sun,
            Weekday::Mon => Self::Mon,
            Weekday::Tue => Self::Tue,
            Weekday::Wed => Self::Wed,
            Weekday::Thu => Self::Thu,
            Weekday::Fri => Self::Fri,
            Weekday::Sat => Self::Sat,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayWindow {
    #[serde(default = "midnight")]
    pub start: String,
    #[serde(default = "midnight")]
    pub end: String,
}

fn midnight() -> String {
    "00:00".to_string()
}

impl DayWindow {
    pub fn new(start: &str, end: &str) -> Self {
        Self {
            start: start.to_string(),
            end: end.to_string(),
        }
    }

    /// Inclusive `(start, end)` in minutes since midnight, `None` if either bound is malformed.
    pub fn bounds(&self) -> Option<(u16, u16)> {
        Some((parse_hhmm(&self.start)?, parse_hhmm(&self.end)?))
    }

    pub fn contains(&self, minutes: u16) -> bool {
        self.bounds()
            .map(|(start, end)| (start..=end).contains(&minutes))
            .unwrap_or(false)
    }
}

impl Default for DayWindow {
    fn default() -> Self {
        Self::new("00:00", "00:00")
    }
}

/// Weekly open-hours table, one window per weekday starting with Sunday.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpenHours {
    days: Vec<DayWindow>,
}

impl Default for OpenHours {
    fn default() -> Self {
        let days = (0..DAYS_PER_WEEK)
            .map(|index| {
                if index == DayOfWeek::Sun.index() || index == DayOfWeek::Sat.index() {
                    DayWindow::new("00:00", "00:00")
                } else {
                    DayWindow::new("08:00", "16:00")
                }
            })
            .collect();
        Self { days }
    }
}

impl OpenHours {
    pub fn from_days(days: Vec<DayWindow>) -> Self {
        let mut hours = Self { days };
        hours.normalize();
        hours
    }

    /// Pads or truncates to exactly seven days; missing days are closed all day except 00:00.
    pub fn normalize(&mut self) {
        self.days.truncate(DAYS_PER_WEEK);
        while self.days.len() < DAYS_PER_WEEK {
            self.days.push(DayWindow::default());
        }
    }

    pub fn day(&self, day: DayOfWeek) -> Option<&DayWindow> {
        self.days.get(day.index())
    }

    pub fn days(&self) -> &[DayWindow] {
        &self.days
    }

    pub fn is_open(&self, now: DateTime<FixedOffset>) -> bool {
        let day = DayOfWeek::from_chrono(now.weekday());
        let minutes = now.hour() as u16 * 60 + now.minute() as u16;

        self.day(day)
            .map(|window| window.contains(minutes))
            .unwrap_or(false)
    }
}

/// Parses a strict `HH:MM` (00-23 / 00-59) into minutes since midnight.
pub fn parse_hhmm(value: &str) -> Option<u16> {
    let bytes = value.as_bytes();
    if bytes.len() != 5 || bytes[2] != b':' {
        return None;
    }
    if !bytes[..2].iter().chain(&bytes[3..]).all(u8::is_ascii_digit) {
        return None;
    }

    let hour: u16 = value[..2].parse().ok()?;
    let minute: u16 = value[3..].parse().ok()?;
    if hour > 23 || minute > 59 {
        return None;
    }
    Some(hour * 60 + minute)
}
