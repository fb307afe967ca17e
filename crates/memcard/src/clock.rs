use std::cell::Cell;

use chrono::{NaiveDate, NaiveDateTime, TimeDelta, Utc};

/// Bus clock rate used for format time stamps.
pub const TICKS_PER_SEC: u64 = 162_000_000 / 4;

/// Start of card time: 2000-01-01 00:00:00.
pub fn epoch() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2000, 1, 1)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .unwrap_or_default()
}

/// Converts a directory time stamp for display.
pub fn to_datetime(seconds: u32) -> NaiveDateTime {
    epoch() + TimeDelta::seconds(i64::from(seconds))
}

/// Source of the time stamps written to the directory and the id block.
pub trait Clock {
    /// Whole seconds since 2000-01-01.
    fn seconds(&self) -> u32;

    /// Bus ticks since 2000-01-01, used to seed the id signature.
    fn ticks(&self) -> u64 {
        u64::from(self.seconds()) * TICKS_PER_SEC
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn seconds(&self) -> u32 {
        let elapsed = Utc::now().naive_utc() - epoch();
        elapsed.num_seconds().clamp(0, i64::from(u32::MAX)) as u32
    }

    fn ticks(&self) -> u64 {
        let elapsed = Utc::now().naive_utc() - epoch();
        let seconds = elapsed.num_seconds().max(0) as u64;
        let nanos = u64::from(elapsed.subsec_nanos().max(0) as u32);
        seconds * TICKS_PER_SEC + nanos * TICKS_PER_SEC / 1_000_000_000
    }
}

/// Clock that advances one second every time it is read.
#[derive(Debug, Default)]
pub struct StepClock {
    now: Cell<u32>,
}

impl StepClock {
    pub fn new(start: u32) -> Self {
        Self {
            now: Cell::new(start),
        }
    }

    /// Last value handed out.
    pub fn current(&self) -> u32 {
        self.now.get()
    }
}

impl Clock for StepClock {
    fn seconds(&self) -> u32 {
        let next = self.now.get().wrapping_add(1);
        self.now.set(next);
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn card_time_starts_in_2000() {
        let stamp = to_datetime(86_400 + 3_600);
        assert_eq!(stamp.to_string(), "2000-01-02 01:00:00");
    }

    #[test]
    fn step_clock_ticks_per_read() {
        let clock = StepClock::new(10);
        assert_eq!(clock.seconds(), 11);
        assert_eq!(clock.ticks(), 12 * TICKS_PER_SEC);
        assert_eq!(clock.current(), 12);
    }
}
