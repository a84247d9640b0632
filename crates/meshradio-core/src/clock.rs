use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// A point on the monotonic clock, in seconds since the clock epoch.
///
/// The monotonic clock is the time base shared by the MAC, the PHY, and the
/// radio driver; slot deadlines, packet deadlines, and sample timestamps are
/// all expressed on it.
#[derive(Clone, Copy, Debug, Default, PartialEq, PartialOrd)]
pub struct MonoTime(pub f64);

/// A point on the wall clock, in seconds.
///
/// Wall time is derived from the monotonic clock through a lock-free offset
/// and is used for packet birth times and log timestamps.
#[derive(Clone, Copy, Debug, Default, PartialEq, PartialOrd)]
pub struct WallTime(pub f64);

impl MonoTime {
    pub fn secs(self) -> f64 {
        self.0
    }
}

impl WallTime {
    pub fn secs(self) -> f64 {
        self.0
    }
}

impl std::ops::Add<f64> for MonoTime {
    type Output = MonoTime;

    fn add(self, secs: f64) -> MonoTime {
        MonoTime(self.0 + secs)
    }
}

impl std::ops::Sub<f64> for MonoTime {
    type Output = MonoTime;

    fn sub(self, secs: f64) -> MonoTime {
        MonoTime(self.0 - secs)
    }
}

impl std::ops::Sub<MonoTime> for MonoTime {
    type Output = f64;

    fn sub(self, other: MonoTime) -> f64 {
        self.0 - other.0
    }
}

impl std::ops::Add<f64> for WallTime {
    type Output = WallTime;

    fn add(self, secs: f64) -> WallTime {
        WallTime(self.0 + secs)
    }
}

impl std::ops::Sub<f64> for WallTime {
    type Output = WallTime;

    fn sub(self, secs: f64) -> WallTime {
        WallTime(self.0 - secs)
    }
}

impl std::ops::Sub<WallTime> for WallTime {
    type Output = f64;

    fn sub(self, other: WallTime) -> f64 {
        self.0 - other.0
    }
}

static MONO_EPOCH: OnceLock<Instant> = OnceLock::new();

/// Offset from the monotonic clock to the wall clock, in nanoseconds.
static WALL_OFFSET_NS: AtomicI64 = AtomicI64::new(0);

fn mono_epoch() -> Instant {
    *MONO_EPOCH.get_or_init(Instant::now)
}

/// The monotonic clock.
///
/// Backed by the host steady clock. A radio driver whose hardware clock is
/// authoritative may adjust via [MonoClock::set_radio_offset], which shifts
/// all subsequent readings without affecting already-taken time points.
pub struct MonoClock;

static RADIO_OFFSET_NS: AtomicI64 = AtomicI64::new(0);

impl MonoClock {
    pub fn now() -> MonoTime {
        let elapsed = mono_epoch().elapsed().as_secs_f64();
        let off = RADIO_OFFSET_NS.load(Ordering::Acquire) as f64 * 1e-9;

        MonoTime(elapsed + off)
    }

    /// Shift the monotonic clock to track the radio's hardware clock
    pub fn set_radio_offset(secs: f64) {
        RADIO_OFFSET_NS.store((secs * 1e9) as i64, Ordering::Release);
    }

    pub fn radio_offset() -> f64 {
        RADIO_OFFSET_NS.load(Ordering::Acquire) as f64 * 1e-9
    }

    /// Sleep until the given monotonic time
    pub fn sleep_until(t: MonoTime) {
        let now = Self::now();

        if t > now {
            std::thread::sleep(Duration::from_secs_f64(t - now));
        }
    }

    /// Sleep for the given number of seconds. Negative durations return
    /// immediately.
    pub fn sleep_for(secs: f64) {
        if secs > 0.0 {
            std::thread::sleep(Duration::from_secs_f64(secs));
        }
    }
}

/// The wall clock, derived from [MonoClock] by a lock-free offset.
pub struct WallClock;

impl WallClock {
    pub fn now() -> WallTime {
        Self::to_wall_time(MonoClock::now())
    }

    /// Set the offset between the monotonic clock and the wall clock
    pub fn set_offset(secs: f64) {
        WALL_OFFSET_NS.store((secs * 1e9) as i64, Ordering::Release);
    }

    pub fn offset() -> f64 {
        WALL_OFFSET_NS.load(Ordering::Acquire) as f64 * 1e-9
    }

    pub fn to_wall_time(t: MonoTime) -> WallTime {
        WallTime(t.0 + Self::offset())
    }

    pub fn to_mono_time(t: WallTime) -> MonoTime {
        MonoTime(t.0 - Self::offset())
    }
}
