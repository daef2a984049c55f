use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{FixedOffset, TimeZone, Utc};

pub const MINUTE_MS: i64 = 60_000;

/// IST offset (+05:30). All displayed timestamps use this zone; the minute
/// arithmetic below stays in epoch millis because the offset is a whole
/// number of minutes.
const IST_OFFSET_SECS: i32 = 5 * 3600 + 30 * 60;

/// Source of "now". The engine never reads the wall clock directly so that
/// minute-boundary behaviour is testable.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Production clock.
pub struct WallClock;

impl Clock for WallClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Manually advanced clock for tests.
#[derive(Default)]
pub struct ManualClock {
    ms: AtomicI64,
}

impl ManualClock {
    pub fn new(ms: i64) -> Self {
        Self { ms: AtomicI64::new(ms) }
    }

    pub fn set(&self, ms: i64) {
        self.ms.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by_ms: i64) {
        self.ms.fetch_add(by_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.ms.load(Ordering::SeqCst)
    }
}

/// Index of the wall-clock minute containing `ms`.
pub fn minute_index(ms: i64) -> i64 {
    ms.div_euclid(MINUTE_MS)
}

/// Second within the minute (0..=59).
pub fn second_of_minute(ms: i64) -> i64 {
    ms.div_euclid(1000).rem_euclid(60)
}

/// Epoch millis of the first instant of the next minute.
pub fn next_minute_start(ms: i64) -> i64 {
    (minute_index(ms) + 1) * MINUTE_MS
}

/// Human-readable IST timestamp for rows and logs.
pub fn ist_time(ms: i64) -> String {
    let ist = FixedOffset::east_opt(IST_OFFSET_SECS).expect("valid IST offset");
    match ist.timestamp_millis_opt(ms).single() {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => ms.to_string(),
    }
}

/// Millis until the next occurrence of `HH:MM` IST, from `now_ms`.
pub fn ms_until_ist_hhmm(now_ms: i64, hh: u32, mm: u32) -> i64 {
    let day_ms: i64 = 86_400_000;
    let ist_now = now_ms + i64::from(IST_OFFSET_SECS) * 1000;
    let since_midnight = ist_now.rem_euclid(day_ms);
    let target = (i64::from(hh) * 3600 + i64::from(mm) * 60) * 1000;
    let mut delta = target - since_midnight;
    if delta <= 0 {
        delta += day_ms;
    }
    delta
}
