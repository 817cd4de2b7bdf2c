//! Wall-clock access and the local "today" window.
//!
//! The `today*` counters bucket cases by the half-open local-day range
//! `[start, end)`. Sessions read time through `Clock` so tests can pin it.

use std::sync::Mutex;

use chrono::{DateTime, Duration, FixedOffset, Offset, TimeZone, Utc};

pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests and replays.
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut guard) = self.now.lock() {
            *guard = now;
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut guard) = self.now.lock() {
            *guard += by;
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|guard| *guard).unwrap_or_else(|_| Utc::now())
    }
}

/// Half-open local-day range expressed in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TodayWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TodayWindow {
    /// The local day containing `now`, for a zone `utc_offset_minutes` east of UTC.
    pub fn containing(now: DateTime<Utc>, utc_offset_minutes: i32) -> Self {
        let offset = FixedOffset::east_opt(utc_offset_minutes * 60)
            .unwrap_or_else(|| Utc.fix());
        let local = now.with_timezone(&offset);
        let midnight = local.date_naive().and_hms_opt(0, 0, 0).unwrap_or_default();
        let start = match offset.from_local_datetime(&midnight).single() {
            Some(dt) => dt.with_timezone(&Utc),
            None => now,
        };
        Self {
            start,
            end: start + Duration::days(1),
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }
}
