//! Nightly audit scheduling
//!
//! The priority tick only samples problem records; once a day, at the
//! configured local hour, every record is audited. The audit is idempotent
//! and safe to interrupt: it enforces the same per-record convergence
//! rules as a tick.

use chrono::{DateTime, Datelike, Local, NaiveDate, Timelike};

/// Tracks whether today's audit has run yet
pub struct AuditSchedule {
    hour: u32,
    last_run: Option<NaiveDate>,
}

impl AuditSchedule {
    /// Schedule an audit at the given local hour
    #[must_use]
    pub fn new(hour: u32) -> Self {
        Self {
            hour: hour % 24,
            last_run: None,
        }
    }

    /// Whether an audit is due at `now`; marks it run when due
    pub fn due(&mut self, now: DateTime<Local>) -> bool {
        let today = NaiveDate::from_ymd_opt(now.year(), now.month(), now.day())
            .unwrap_or_default();
        if now.hour() == self.hour && self.last_run != Some(today) {
            self.last_run = Some(today);
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32, minute: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 8, 2, hour, minute, 0).unwrap()
    }

    #[test]
    fn test_due_only_in_the_audit_hour() {
        let mut schedule = AuditSchedule::new(3);
        assert!(!schedule.due(at(2, 59)));
        assert!(schedule.due(at(3, 0)));
        assert!(!schedule.due(at(4, 0)));
    }

    #[test]
    fn test_runs_once_per_day() {
        let mut schedule = AuditSchedule::new(3);
        assert!(schedule.due(at(3, 0)));
        // Later in the same hour, same day: already done
        assert!(!schedule.due(at(3, 30)));

        let next_day = Local.with_ymd_and_hms(2026, 8, 3, 3, 5, 0).unwrap();
        assert!(schedule.due(next_day));
    }
}
