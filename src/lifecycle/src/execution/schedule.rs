//! Execution scheduling gates
//!
//! The executor only dispatches work while its gate reports the window as
//! open. Closing the window pauses new dispatches; entries already running
//! finish normally.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use common::config::ScheduleConfig;

use crate::error::{LifecycleError, Result};

#[cfg_attr(test, mockall::automock)]
pub trait ScheduleGate: Send + Sync {
    fn is_window_open(&self, now: DateTime<Utc>) -> bool;
}

/// Gate that never closes
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOpen;

impl ScheduleGate for AlwaysOpen {
    fn is_window_open(&self, _now: DateTime<Utc>) -> bool {
        true
    }
}

/// Daily window in a given timezone, optionally restricted to weekdays.
/// A window whose end hour is before its start hour spans midnight and
/// belongs to the weekday on which it opened.
#[derive(Debug, Clone)]
pub struct MaintenanceWindow {
    timezone: Tz,
    start_hour: u32,
    end_hour: u32,
    weekdays: Vec<Weekday>,
}

impl MaintenanceWindow {
    pub fn new(timezone: Tz, start_hour: u32, end_hour: u32, weekdays: Vec<Weekday>) -> Self {
        Self {
            timezone,
            start_hour,
            end_hour,
            weekdays,
        }
    }

    pub fn from_config(config: &ScheduleConfig) -> Result<Self> {
        let timezone = config
            .parsed_timezone()
            .map_err(|e| LifecycleError::Configuration(e.to_string()))?;
        let weekdays = config
            .parsed_weekdays()
            .map_err(|e| LifecycleError::Configuration(e.to_string()))?;
        Ok(Self::new(
            timezone,
            config.start_hour,
            config.end_hour,
            weekdays,
        ))
    }

    fn day_allowed(&self, day: Weekday) -> bool {
        self.weekdays.is_empty() || self.weekdays.contains(&day)
    }
}

impl ScheduleGate for MaintenanceWindow {
    fn is_window_open(&self, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&self.timezone);
        let hour = local.hour();
        let today = local.weekday();

        if self.start_hour == self.end_hour {
            return self.day_allowed(today);
        }
        if self.start_hour < self.end_hour {
            return hour >= self.start_hour && hour < self.end_hour && self.day_allowed(today);
        }
        if hour >= self.start_hour {
            self.day_allowed(today)
        } else if hour < self.end_hour {
            self.day_allowed(today.pred())
        } else {
            false
        }
    }
}

/// Gate described by the schedule configuration.
pub fn gate_from_config(config: &ScheduleConfig) -> Result<Arc<dyn ScheduleGate>> {
    if config.enabled {
        Ok(Arc::new(MaintenanceWindow::from_config(config)?))
    } else {
        Ok(Arc::new(AlwaysOpen))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    #[test]
    fn test_window_spanning_midnight() {
        let window = MaintenanceWindow::new(Tz::UTC, 22, 6, vec![]);
        assert!(window.is_window_open(at(2024, 5, 1, 23)));
        assert!(window.is_window_open(at(2024, 5, 2, 3)));
        assert!(!window.is_window_open(at(2024, 5, 2, 6)));
        assert!(!window.is_window_open(at(2024, 5, 2, 12)));
        assert!(window.is_window_open(at(2024, 5, 2, 22)));
    }

    #[test]
    fn test_same_day_window_with_timezone() {
        // 01:00-05:00 in Berlin, UTC+2 in May
        let window = MaintenanceWindow::new(chrono_tz::Europe::Berlin, 1, 5, vec![]);
        assert!(window.is_window_open(at(2024, 5, 1, 0)));
        assert!(!window.is_window_open(at(2024, 5, 1, 4)));
    }

    #[test]
    fn test_weekday_restriction_follows_window_start() {
        // 2024-05-04 is a Saturday
        let window = MaintenanceWindow::new(Tz::UTC, 22, 6, vec![Weekday::Sat]);
        assert!(window.is_window_open(at(2024, 5, 4, 23)));
        assert!(window.is_window_open(at(2024, 5, 5, 2)));
        assert!(!window.is_window_open(at(2024, 5, 5, 23)));
        assert!(!window.is_window_open(at(2024, 5, 3, 23)));
    }

    #[test]
    fn test_gate_from_config() {
        let disabled = ScheduleConfig::default();
        assert!(gate_from_config(&disabled).unwrap().is_window_open(at(2024, 5, 1, 12)));

        let enabled = ScheduleConfig {
            enabled: true,
            ..ScheduleConfig::default()
        };
        let gate = gate_from_config(&enabled).unwrap();
        assert!(!gate.is_window_open(at(2024, 5, 1, 12)));
        assert!(gate.is_window_open(at(2024, 5, 1, 23)));

        let bad = ScheduleConfig {
            enabled: true,
            timezone: "Mars/Olympus".to_string(),
            ..ScheduleConfig::default()
        };
        assert!(matches!(
            gate_from_config(&bad),
            Err(LifecycleError::Configuration(_))
        ));
    }

    #[test]
    fn test_mock_gate() {
        let mut gate = MockScheduleGate::new();
        gate.expect_is_window_open().times(2).returning(|_| false);
        assert!(!gate.is_window_open(Utc::now()));
        assert!(!gate.is_window_open(Utc::now()));
    }
}
