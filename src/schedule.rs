// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Daily backup schedule for daemon mode (times are UTC, `HH:MM`)

use chrono::{DateTime, NaiveDate, Utc};

#[derive(Debug, Clone)]
pub struct DailySchedule {
    time: String,
    last_run: Option<NaiveDate>,
}

impl DailySchedule {
    pub fn new(time: impl Into<String>) -> Self {
        Self { time: time.into(), last_run: None }
    }

    /// True at most once per calendar day, during the configured minute.
    /// Marks the day as taken when it returns true.
    pub fn take_due(&mut self, now: DateTime<Utc>) -> bool {
        if now.format("%H:%M").to_string() != self.time {
            return false;
        }
        let today = now.date_naive();
        if self.last_run == Some(today) {
            return false;
        }
        self.last_run = Some(today);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_fires_once_in_its_minute() {
        let mut schedule = DailySchedule::new("03:00");
        let at = |h, m, s| Utc.with_ymd_and_hms(2024, 6, 1, h, m, s).unwrap();

        assert!(!schedule.take_due(at(2, 59, 30)));
        assert!(schedule.take_due(at(3, 0, 5)));
        assert!(!schedule.take_due(at(3, 0, 55)));
        assert!(!schedule.take_due(at(3, 1, 0)));
    }

    #[test]
    fn test_fires_again_next_day() {
        let mut schedule = DailySchedule::new("23:45");
        assert!(schedule.take_due(Utc.with_ymd_and_hms(2024, 6, 1, 23, 45, 0).unwrap()));
        assert!(schedule.take_due(Utc.with_ymd_and_hms(2024, 6, 2, 23, 45, 10).unwrap()));
    }
}
