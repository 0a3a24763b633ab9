//! Window rule definitions shared by configuration and the resolver.
//!
//! Rules are evaluated against wall-clock fields (hour, minute, weekday) of
//! the timetable's local time; converting from UTC is the resolver's job.

use serde::{Deserialize, Serialize};

/// Half-open hour range `[start, end)`.
///
/// When `start > end` the range wraps midnight, so `22..6` covers 22:00
/// through 05:59.  `0..24` is the whole day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourRange {
    pub start: u8,
    pub end: u8,
}

impl HourRange {
    pub const ALL_DAY: HourRange = HourRange { start: 0, end: 24 };

    pub const fn new(start: u8, end: u8) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, hour: u32) -> bool {
        let (start, end) = (self.start as u32, self.end as u32);
        if start <= end {
            hour >= start && hour < end
        } else {
            hour >= start || hour < end
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.start > 23 || self.end > 24 {
            return Err(format!(
                "hour range {}..{} out of bounds (start 0-23, end 0-24)",
                self.start, self.end
            ));
        }
        if self.start == self.end {
            return Err(format!("hour range {}..{} is empty", self.start, self.end));
        }
        Ok(())
    }
}

impl Default for HourRange {
    fn default() -> Self {
        Self::ALL_DAY
    }
}

/// When a job class is due.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WindowRule {
    /// `minute % every == 0` while the hour is inside `hours`.
    EveryMinutes {
        every: u32,
        #[serde(default)]
        hours: HourRange,
    },

    /// Minute is one of `minutes` while the hour is inside `hours`.
    AtMinutes {
        minutes: Vec<u32>,
        #[serde(default)]
        hours: HourRange,
    },

    /// Once a week. `weekday` uses 0 = Monday … 6 = Sunday.
    Weekly { weekday: u8, hour: u8, minute: u8 },
}

impl WindowRule {
    /// True when the clock fields fall on a firing minute of this rule.
    pub fn matches(&self, weekday_from_monday: u32, hour: u32, minute: u32) -> bool {
        match self {
            WindowRule::EveryMinutes { every, hours } => {
                *every > 0 && minute % every == 0 && hours.contains(hour)
            }
            WindowRule::AtMinutes { minutes, hours } => {
                minutes.contains(&minute) && hours.contains(hour)
            }
            WindowRule::Weekly {
                weekday,
                hour: h,
                minute: m,
            } => weekday_from_monday == *weekday as u32 && hour == *h as u32 && minute == *m as u32,
        }
    }

    /// True when the clock lies inside the rule's active span, regardless of
    /// whether this exact minute fires.
    pub fn covers(&self, weekday_from_monday: u32, hour: u32) -> bool {
        match self {
            WindowRule::EveryMinutes { hours, .. } | WindowRule::AtMinutes { hours, .. } => {
                hours.contains(hour)
            }
            WindowRule::Weekly {
                weekday, hour: h, ..
            } => weekday_from_monday == *weekday as u32 && hour == *h as u32,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            WindowRule::EveryMinutes { every, hours } => {
                if *every == 0 || *every > 60 {
                    return Err(format!("every_minutes.every must be 1-60, got {every}"));
                }
                hours.validate()
            }
            WindowRule::AtMinutes { minutes, hours } => {
                if minutes.is_empty() {
                    return Err("at_minutes.minutes must not be empty".to_string());
                }
                if let Some(bad) = minutes.iter().find(|m| **m > 59) {
                    return Err(format!("at_minutes minute {bad} out of range 0-59"));
                }
                hours.validate()
            }
            WindowRule::Weekly {
                weekday,
                hour,
                minute,
            } => {
                if *weekday > 6 {
                    return Err(format!("weekly.weekday must be 0-6, got {weekday}"));
                }
                if *hour > 23 || *minute > 59 {
                    return Err(format!("weekly time {hour:02}:{minute:02} is not a valid time"));
                }
                Ok(())
            }
        }
    }
}
