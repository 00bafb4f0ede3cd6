//! Active-window gating for `watch` mode.

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};

use crate::config::ScheduleConfig;

/// Whether a pass may run at `now`.
///
/// Hours are UTC and half-open: `start_hour <= hour < end_hour`. A window
/// with `start_hour > end_hour` wraps past midnight; equal bounds mean
/// all day.
pub fn within_window(now: DateTime<Utc>, cfg: &ScheduleConfig) -> bool {
    if cfg.weekdays_only && matches!(now.weekday(), Weekday::Sat | Weekday::Sun) {
        return false;
    }

    let hour = now.hour();
    match cfg.start_hour.cmp(&cfg.end_hour) {
        std::cmp::Ordering::Less => hour >= cfg.start_hour && hour < cfg.end_hour,
        std::cmp::Ordering::Greater => hour >= cfg.start_hour || hour < cfg.end_hour,
        std::cmp::Ordering::Equal => true,
    }
}
