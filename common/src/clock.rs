use std::{
    ops::Add,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
        Mutex,
    },
    time::{Duration, Instant},
};

use chrono::Utc;

/// Wall-clock readings before 2020-01-01 mean the clock has never been synchronized.
pub const MIN_VALID_EPOCH_MS: i64 = 1_577_836_800_000;

/// Monotonic millisecond instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Tick(u64);

impl Tick {
    pub const ZERO: Tick = Tick(0);

    pub const fn from_millis(ms: u64) -> Self {
        Self(ms)
    }

    pub const fn as_millis(self) -> u64 {
        self.0
    }

    /// Time elapsed from `earlier` to `self`, zero if `earlier` is in the future.
    pub fn saturating_since(self, earlier: Tick) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for Tick {
    type Output = Tick;

    fn add(self, rhs: Duration) -> Tick {
        let ms = u64::try_from(rhs.as_millis()).unwrap_or(u64::MAX);
        Tick(self.0.saturating_add(ms))
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> Tick;

    /// Epoch milliseconds, `None` until external time synchronization has happened.
    fn wall_clock_ms(&self) -> Option<i64>;

    /// Tick and wall-clock read back to back.
    fn paired(&self) -> (Tick, Option<i64>) {
        (self.now(), self.wall_clock_ms())
    }

    fn is_synced(&self) -> bool {
        self.wall_clock_ms().is_some()
    }
}

pub struct SystemClock {
    start: Instant,
    hold_unsynced: AtomicBool,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            hold_unsynced: AtomicBool::new(false),
        }
    }

    /// A clock that reports no wall time until [`SystemClock::release_sync`] is called.
    pub fn held_unsynced() -> Self {
        Self {
            start: Instant::now(),
            hold_unsynced: AtomicBool::new(true),
        }
    }

    pub fn release_sync(&self) {
        self.hold_unsynced.store(false, Ordering::Release);
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Tick {
        let ms = u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX);
        Tick(ms)
    }

    fn wall_clock_ms(&self) -> Option<i64> {
        if self.hold_unsynced.load(Ordering::Acquire) {
            return None;
        }
        let ms = Utc::now().timestamp_millis();
        (ms >= MIN_VALID_EPOCH_MS).then_some(ms)
    }

    fn paired(&self) -> (Tick, Option<i64>) {
        if self.hold_unsynced.load(Ordering::Acquire) {
            return (self.now(), None);
        }
        let tick = self.now();
        let ms = Utc::now().timestamp_millis();
        (tick, (ms >= MIN_VALID_EPOCH_MS).then_some(ms))
    }
}

/// Settable clock. Both domains advance together through [`ManualClock::advance`].
#[derive(Default)]
pub struct ManualClock {
    tick_ms: AtomicU64,
    wall_ms: AtomicI64,
    synced: AtomicBool,
    // Applied to the wall reading only, to model drift between the two domains.
    skew_ms: Mutex<i64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_tick(&self, ms: u64) {
        self.tick_ms.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        let ms = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        self.tick_ms.fetch_add(ms, Ordering::SeqCst);
        self.wall_ms
            .fetch_add(i64::try_from(ms).unwrap_or(i64::MAX), Ordering::SeqCst);
    }

    pub fn sync_to_epoch_ms(&self, epoch_ms: i64) {
        self.wall_ms.store(epoch_ms, Ordering::SeqCst);
        self.synced.store(true, Ordering::SeqCst);
    }

    pub fn unsync(&self) {
        self.synced.store(false, Ordering::SeqCst);
    }

    pub fn set_skew_ms(&self, skew: i64) {
        if let Ok(mut guard) = self.skew_ms.lock() {
            *guard = skew;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Tick {
        Tick(self.tick_ms.load(Ordering::SeqCst))
    }

    fn wall_clock_ms(&self) -> Option<i64> {
        if !self.synced.load(Ordering::SeqCst) {
            return None;
        }
        let skew = self.skew_ms.lock().map(|guard| *guard).unwrap_or(0);
        Some(self.wall_ms.load(Ordering::SeqCst) + skew)
    }
}
