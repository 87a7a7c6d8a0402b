use chrono::{Datelike, NaiveDate, Weekday};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ScheduleError {
    #[error("unknown day of week: {0}")]
    UnknownDay(String),
    #[error("semester must be one of: First, Second, Summer")]
    UnknownSemester(String),
    #[error("schoolYear must be four digits (YYYY)")]
    BadSchoolYear(String),
    #[error("time must be HH:MM: {0}")]
    BadTime(String),
    #[error("end time must be after start time")]
    EmptyRange,
    #[error("month must be YYYY-MM: {0}")]
    BadMonth(String),
}

impl ScheduleError {
    pub fn code(&self) -> &'static str {
        "bad_params"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DayOfWeek {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl DayOfWeek {
    pub const ALL: [DayOfWeek; 7] = [
        DayOfWeek::Monday,
        DayOfWeek::Tuesday,
        DayOfWeek::Wednesday,
        DayOfWeek::Thursday,
        DayOfWeek::Friday,
        DayOfWeek::Saturday,
        DayOfWeek::Sunday,
    ];

    /// Full names, three-letter abbreviations and the registrar short codes
    /// (`M T W TH F SA SU`).
    pub fn parse(raw: &str) -> Result<Self, ScheduleError> {
        let day = match raw.trim().to_ascii_lowercase().as_str() {
            "monday" | "mon" | "m" => Self::Monday,
            "tuesday" | "tue" | "tues" | "t" => Self::Tuesday,
            "wednesday" | "wed" | "w" => Self::Wednesday,
            "thursday" | "thu" | "thurs" | "th" => Self::Thursday,
            "friday" | "fri" | "f" => Self::Friday,
            "saturday" | "sat" | "sa" => Self::Saturday,
            "sunday" | "sun" | "su" => Self::Sunday,
            _ => return Err(ScheduleError::UnknownDay(raw.to_string())),
        };
        Ok(day)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Monday => "Monday",
            Self::Tuesday => "Tuesday",
            Self::Wednesday => "Wednesday",
            Self::Thursday => "Thursday",
            Self::Friday => "Friday",
            Self::Saturday => "Saturday",
            Self::Sunday => "Sunday",
        }
    }

    pub fn from_weekday(w: Weekday) -> Self {
        Self::ALL[w.num_days_from_monday() as usize]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Semester {
    First,
    Second,
    Summer,
}

impl Semester {
    pub fn parse(raw: &str) -> Result<Self, ScheduleError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "first" | "1" | "1st" => Ok(Self::First),
            "second" | "2" | "2nd" => Ok(Self::Second),
            "summer" => Ok(Self::Summer),
            _ => Err(ScheduleError::UnknownSemester(raw.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::First => "First",
            Self::Second => "Second",
            Self::Summer => "Summer",
        }
    }
}

pub fn parse_school_year(raw: &str) -> Result<String, ScheduleError> {
    let t = raw.trim();
    if t.len() == 4 && t.chars().all(|c| c.is_ascii_digit()) {
        Ok(t.to_string())
    } else {
        Err(ScheduleError::BadSchoolYear(raw.to_string()))
    }
}

/// Minutes since midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeOfDay(u16);

impl TimeOfDay {
    pub fn parse(raw: &str) -> Result<Self, ScheduleError> {
        let bad = || ScheduleError::BadTime(raw.to_string());
        let parts: Vec<&str> = raw.trim().split(':').collect();
        if parts.len() != 2 && parts.len() != 3 {
            return Err(bad());
        }
        let h: u16 = parts[0].parse().map_err(|_| bad())?;
        let m: u16 = parts[1].parse().map_err(|_| bad())?;
        if parts[1].len() != 2 || h > 23 || m > 59 {
            return Err(bad());
        }
        if let Some(sec) = parts.get(2) {
            let s: u16 = sec.parse().map_err(|_| bad())?;
            if s > 59 {
                return Err(bad());
            }
        }
        Ok(Self(h * 60 + m))
    }

    pub fn minutes(self) -> u16 {
        self.0
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: TimeOfDay,
    pub end: TimeOfDay,
}

impl TimeRange {
    pub fn new(start: TimeOfDay, end: TimeOfDay) -> Result<Self, ScheduleError> {
        if end <= start {
            return Err(ScheduleError::EmptyRange);
        }
        Ok(Self { start, end })
    }

    pub fn parse(start: &str, end: &str) -> Result<Self, ScheduleError> {
        Self::new(TimeOfDay::parse(start)?, TimeOfDay::parse(end)?)
    }

    /// Half-open overlap: a class ending at 09:00 does not collide with one
    /// starting at 09:00.
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn duration_minutes(&self) -> u16 {
        self.end.minutes() - self.start.minutes()
    }
}

pub fn parse_month_key(raw: &str) -> Result<(i32, u32), ScheduleError> {
    let bad = || ScheduleError::BadMonth(raw.to_string());
    let (y, m) = raw.trim().split_once('-').ok_or_else(bad)?;
    let year: i32 = y.parse().map_err(|_| bad())?;
    let month: u32 = m.parse().map_err(|_| bad())?;
    if !(1..=12).contains(&month) || y.len() != 4 {
        return Err(bad());
    }
    Ok((year, month))
}

pub fn month_days(year: i32, month: u32) -> Vec<NaiveDate> {
    let mut out = Vec::new();
    let mut day = NaiveDate::from_ymd_opt(year, month, 1);
    while let Some(d) = day {
        if d.month() != month {
            break;
        }
        out.push(d);
        day = d.succ_opt();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn day_codes_normalise_to_full_names() {
        assert_eq!(DayOfWeek::parse("TH"), Ok(DayOfWeek::Thursday));
        assert_eq!(DayOfWeek::parse("t"), Ok(DayOfWeek::Tuesday));
        assert_eq!(DayOfWeek::parse(" wednesday "), Ok(DayOfWeek::Wednesday));
        assert_eq!(DayOfWeek::parse("SU").map(|d| d.as_str()), Ok("Sunday"));
        assert!(DayOfWeek::parse("S").is_err());
        assert_eq!(DayOfWeek::from_weekday(Weekday::Mon), DayOfWeek::Monday);
        assert_eq!(DayOfWeek::from_weekday(Weekday::Sun), DayOfWeek::Sunday);
    }

    #[test]
    fn time_parsing_accepts_seconds_and_rejects_garbage() {
        assert_eq!(TimeOfDay::parse("08:30").map(|t| t.minutes()), Ok(510));
        assert_eq!(TimeOfDay::parse("8:30:00").map(|t| t.to_string()), Ok("08:30".to_string()));
        assert!(TimeOfDay::parse("24:00").is_err());
        assert!(TimeOfDay::parse("08:5").is_err());
        assert!(TimeOfDay::parse("0830").is_err());
    }

    #[test]
    fn ranges_must_be_non_empty() {
        assert_eq!(TimeRange::parse("09:00", "09:00"), Err(ScheduleError::EmptyRange));
        assert_eq!(TimeRange::parse("10:00", "09:00"), Err(ScheduleError::EmptyRange));
        assert_eq!(
            TimeRange::parse("09:00", "10:30").map(|r| r.duration_minutes()),
            Ok(90)
        );
    }

    #[test]
    fn touching_ranges_do_not_overlap() {
        let a = TimeRange::parse("08:00", "09:00").expect("a");
        let b = TimeRange::parse("09:00", "10:00").expect("b");
        let c = TimeRange::parse("08:30", "08:45").expect("c");
        let d = TimeRange::parse("07:00", "12:00").expect("d");
        assert!(!a.overlaps(&b));
        assert!(!b.overlaps(&a));
        assert!(a.overlaps(&c));
        assert!(c.overlaps(&a));
        assert!(d.overlaps(&b));
    }

    #[test]
    fn semester_and_year_validation() {
        assert_eq!(Semester::parse("summer"), Ok(Semester::Summer));
        assert_eq!(Semester::parse("2nd"), Ok(Semester::Second));
        assert!(Semester::parse("Fall").is_err());
        assert_eq!(parse_school_year(" 2025 "), Ok("2025".to_string()));
        assert!(parse_school_year("25").is_err());
        assert!(parse_school_year("2025-2026").is_err());
    }

    #[test]
    fn month_expansion_handles_leap_years() {
        assert_eq!(month_days(2024, 2).len(), 29);
        assert_eq!(month_days(2025, 2).len(), 28);
        assert_eq!(month_days(2025, 12).len(), 31);
        assert_eq!(parse_month_key("2025-01"), Ok((2025, 1)));
        assert!(parse_month_key("2025-13").is_err());
        assert!(parse_month_key("01").is_err());
    }
}
