//! Window resolution: which job classes are due at a given instant.
//!
//! Rules are evaluated on the timetable's local clock, a fixed offset from
//! UTC.  Resolution is minute granular and pure: the same instant always
//! yields the same set.

use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, Duration, FixedOffset, Timelike, Utc};
use rhythm_core::{JobClass, ScheduledClass, WindowRule};

use crate::error::{Result, SchedulerError};

/// Search horizon for `next_due`: one week plus a day covers every rule kind.
const NEXT_DUE_HORIZON_MINUTES: i64 = 8 * 24 * 60;

/// A class bound to the rule that decides when it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleWindow {
    pub class: JobClass,
    pub rule: WindowRule,
}

impl ScheduleWindow {
    fn is_due_local(&self, local: &DateTime<FixedOffset>) -> bool {
        self.rule.matches(
            local.weekday().num_days_from_monday(),
            local.hour(),
            local.minute(),
        )
    }

    fn covers_local(&self, local: &DateTime<FixedOffset>) -> bool {
        self.rule
            .covers(local.weekday().num_days_from_monday(), local.hour())
    }
}

#[derive(Debug, Clone)]
pub struct WindowResolver {
    windows: Vec<ScheduleWindow>,
    offset: FixedOffset,
}

impl WindowResolver {
    pub fn new(windows: Vec<ScheduleWindow>, utc_offset_minutes: i32) -> Result<Self> {
        let offset = FixedOffset::east_opt(utc_offset_minutes.saturating_mul(60)).ok_or_else(
            || SchedulerError::InvalidSchedule(format!("utc offset {utc_offset_minutes}m")),
        )?;
        for w in &windows {
            w.rule
                .validate()
                .map_err(|e| SchedulerError::InvalidSchedule(format!("{}: {e}", w.class)))?;
        }
        Ok(Self { windows, offset })
    }

    pub fn from_classes(classes: &[ScheduledClass], utc_offset_minutes: i32) -> Result<Self> {
        let windows = classes
            .iter()
            .map(|c| ScheduleWindow {
                class: c.spec.class,
                rule: c.window.clone(),
            })
            .collect();
        Self::new(windows, utc_offset_minutes)
    }

    fn local(&self, t: DateTime<Utc>) -> DateTime<FixedOffset> {
        t.with_timezone(&self.offset)
    }

    /// Classes whose window fires at `t`.  Overlapping windows all count.
    pub fn due_classes(&self, t: DateTime<Utc>) -> BTreeSet<JobClass> {
        let local = self.local(t);
        self.windows
            .iter()
            .filter(|w| w.is_due_local(&local))
            .map(|w| w.class)
            .collect()
    }

    /// Classes whose active span contains `t`, firing minute or not.
    pub fn covering(&self, t: DateTime<Utc>) -> BTreeSet<JobClass> {
        let local = self.local(t);
        self.windows
            .iter()
            .filter(|w| w.covers_local(&local))
            .map(|w| w.class)
            .collect()
    }

    /// Minute slot of `t`.  Ticks inside one slot resolve to the same set.
    pub fn slot(t: DateTime<Utc>) -> i64 {
        t.timestamp().div_euclid(60)
    }

    /// First firing minute of `class` strictly after `from`.
    pub fn next_due(&self, class: JobClass, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let window = self.windows.iter().find(|w| w.class == class)?;
        let start = DateTime::from_timestamp((Self::slot(from) + 1) * 60, 0)?;
        (0..NEXT_DUE_HORIZON_MINUTES)
            .map(|m| start + Duration::minutes(m))
            .find(|t| window.is_due_local(&self.local(*t)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rhythm_core::RhythmConfig;

    fn resolver() -> WindowResolver {
        WindowResolver::from_classes(&RhythmConfig::default().classes(), 0).unwrap()
    }

    // 2026-03-01 is a Sunday.
    fn at(day: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, h, m, 0).unwrap()
    }

    fn set(classes: &[JobClass]) -> BTreeSet<JobClass> {
        classes.iter().copied().collect()
    }

    #[test]
    fn resolution_is_idempotent() {
        let r = resolver();
        for m in 0..(48 * 60) {
            let t = at(2, 0, 0) + Duration::minutes(m);
            assert_eq!(r.due_classes(t), r.due_classes(t));
        }
    }

    #[test]
    fn rem_window_spans_midnight() {
        let r = resolver();
        assert!(r.covering(at(2, 23, 59)).contains(&JobClass::Rem));
        assert!(r.covering(at(3, 0, 1)).contains(&JobClass::Rem));
        assert!(!r.covering(at(3, 6, 1)).contains(&JobClass::Rem));

        assert!(r.due_classes(at(2, 23, 30)).contains(&JobClass::Rem));
        assert!(r.due_classes(at(3, 0, 0)).contains(&JobClass::Rem));
        assert!(r.due_classes(at(3, 5, 30)).contains(&JobClass::Rem));
        assert!(!r.due_classes(at(3, 6, 0)).contains(&JobClass::Rem));
    }

    #[test]
    fn overlapping_windows_all_due() {
        let r = resolver();
        // Monday 02:00: short-term (every 15), REM (:00) and deep (:00, 02-04).
        assert_eq!(
            r.due_classes(at(2, 2, 0)),
            set(&[JobClass::ShortTerm, JobClass::Rem, JobClass::DeepConsolidation])
        );
        // Monday 12:15: working memory (every 5) and short-term.
        assert_eq!(
            r.due_classes(at(2, 12, 15)),
            set(&[JobClass::WorkingMemory, JobClass::ShortTerm])
        );
        assert!(r.due_classes(at(2, 12, 7)).is_empty());
    }

    #[test]
    fn homeostasis_only_on_sunday() {
        let r = resolver();
        assert!(r.due_classes(at(1, 3, 0)).contains(&JobClass::Homeostasis));
        assert!(!r.due_classes(at(2, 3, 0)).contains(&JobClass::Homeostasis));
        assert!(!r.due_classes(at(1, 3, 1)).contains(&JobClass::Homeostasis));
    }

    #[test]
    fn seconds_inside_a_minute_share_the_slot() {
        let r = resolver();
        let base = at(2, 12, 15);
        for s in 0..60 {
            let t = base + Duration::seconds(s);
            assert_eq!(WindowResolver::slot(t), WindowResolver::slot(base));
            assert_eq!(r.due_classes(t), r.due_classes(base));
        }
    }

    #[test]
    fn utc_offset_shifts_local_clock() {
        // UTC+02:00: 21:30 UTC is 23:30 local, inside the REM window.
        let r = WindowResolver::from_classes(&RhythmConfig::default().classes(), 120).unwrap();
        assert!(r.due_classes(at(2, 21, 30)).contains(&JobClass::Rem));
        assert!(!resolver().due_classes(at(2, 21, 30)).contains(&JobClass::Rem));
    }

    #[test]
    fn next_due_finds_following_fire() {
        let r = resolver();
        assert_eq!(
            r.next_due(JobClass::Rem, at(2, 12, 0)),
            Some(at(2, 22, 0))
        );
        assert_eq!(
            r.next_due(JobClass::Homeostasis, at(1, 3, 0)),
            Some(at(8, 3, 0))
        );
        assert_eq!(
            r.next_due(JobClass::WorkingMemory, at(2, 12, 3) + Duration::seconds(20)),
            Some(at(2, 12, 5))
        );
    }

    #[test]
    fn invalid_rule_rejected() {
        let err = WindowResolver::new(
            vec![ScheduleWindow {
                class: JobClass::Rem,
                rule: WindowRule::EveryMinutes {
                    every: 0,
                    hours: rhythm_core::HourRange::ALL_DAY,
                },
            }],
            0,
        );
        assert!(matches!(err, Err(SchedulerError::InvalidSchedule(_))));
    }
}
