//! Injectable clocks and UTC formatting (no chrono dependency).
//!
//! Facts and cycle records carry Unix-second timestamps. The agent reads
//! them through a [`Clock`] so tests can pin time and replay histories.

use std::time::{SystemTime, UNIX_EPOCH};

/// Source of Unix-second timestamps.
pub trait Clock: Send {
    fn now_unix_secs(&self) -> u64;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix_secs(&self) -> u64 {
        now_unix_secs()
    }
}

/// Fixed clock that advances one second per read.
#[derive(Debug, Clone)]
pub struct ManualClock {
    next: std::cell::Cell<u64>,
}

impl ManualClock {
    pub fn starting_at(secs: u64) -> Self {
        Self {
            next: std::cell::Cell::new(secs),
        }
    }
}

impl Clock for ManualClock {
    fn now_unix_secs(&self) -> u64 {
        let t = self.next.get();
        self.next.set(t + 1);
        t
    }
}

/// Current UTC time as Unix seconds.
pub fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Convert Unix seconds to an ISO-8601 UTC string.
pub fn unix_to_iso8601(secs: u64) -> String {
    let days = (secs / 86400) as i64;
    let time_of_day = secs % 86400;
    let (y, m, d) = civil_from_days(days);
    format!(
        "{y:04}-{m:02}-{d:02}T{:02}:{:02}:{:02}Z",
        time_of_day / 3600,
        (time_of_day % 3600) / 60,
        time_of_day % 60
    )
}

/// Howard Hinnant's civil_from_days: Unix epoch days → (year, month, day).
fn civil_from_days(days: i64) -> (i64, u64, u64) {
    let z = days + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = (z - era * 146097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = yoe as i64 + era * 400 + if m <= 2 { 1 } else { 0 };
    (y, m, d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_epoch() {
        assert_eq!(unix_to_iso8601(0), "1970-01-01T00:00:00Z");
    }

    #[test]
    fn test_leap_day() {
        // 2024-02-29T12:30:05Z
        assert_eq!(unix_to_iso8601(1709209805), "2024-02-29T12:30:05Z");
    }

    #[test]
    fn test_manual_clock_ticks() {
        let clock = ManualClock::starting_at(100);
        assert_eq!(clock.now_unix_secs(), 100);
        assert_eq!(clock.now_unix_secs(), 101);
    }

    #[test]
    fn test_system_clock_is_recent() {
        assert!(SystemClock.now_unix_secs() > 1_700_000_000);
    }
}
