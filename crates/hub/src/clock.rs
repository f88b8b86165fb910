//! Time sources for the engine. Nothing in the control path calls
//! `OffsetDateTime::now_utc()` or `Instant::now()` directly; both come through
//! a [`Clock`] so cycle positions, override expiry and budget days can be
//! driven deterministically in tests.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use time::{OffsetDateTime, UtcOffset};

pub trait Clock: Send + Sync {
    /// Wall-clock time in the site's local offset.
    fn now(&self) -> OffsetDateTime;

    /// Monotonic instant, used for run timers and override deadlines.
    fn monotonic(&self) -> Instant;
}

// ---------------------------------------------------------------------------
// System clock
// ---------------------------------------------------------------------------

/// Real time, shifted into a fixed site offset.
///
/// The offset comes from config rather than the OS: `time` refuses to read
/// the local offset once the process has more than one thread.
pub struct SystemClock {
    offset: UtcOffset,
}

impl SystemClock {
    pub fn new(offset: UtcOffset) -> Self {
        Self { offset }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc().to_offset(self.offset)
    }

    fn monotonic(&self) -> Instant {
        Instant::now()
    }
}

// ---------------------------------------------------------------------------
// Manual clock
// ---------------------------------------------------------------------------

/// A clock that only moves when told to. Advancing moves wall and monotonic
/// time together; `set` jumps the wall clock and only moves monotonic time
/// forward.
pub struct ManualClock {
    inner: Mutex<ManualInner>,
}

struct ManualInner {
    wall: OffsetDateTime,
    base: Instant,
    elapsed: Duration,
}

impl ManualClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            inner: Mutex::new(ManualInner {
                wall: start,
                base: Instant::now(),
                elapsed: Duration::ZERO,
            }),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.wall += by;
        inner.elapsed += by;
    }

    pub fn set(&self, wall: OffsetDateTime) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        // Negative deltas fail the conversion; monotonic time never rewinds.
        if let Ok(delta) = Duration::try_from(wall - inner.wall) {
            inner.elapsed += delta;
        }
        inner.wall = wall;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).wall
    }

    fn monotonic(&self) -> Instant {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.base + inner.elapsed
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn manual_clock_advance_moves_both_sources() {
        let clock = ManualClock::new(datetime!(2024-05-01 07:00:00 UTC));
        let before = clock.monotonic();
        clock.advance(Duration::from_secs(31));
        assert_eq!(clock.now(), datetime!(2024-05-01 07:00:31 UTC));
        assert_eq!(clock.monotonic() - before, Duration::from_secs(31));
    }

    #[test]
    fn manual_clock_backwards_jump_keeps_monotonic() {
        let clock = ManualClock::new(datetime!(2024-05-01 07:00:00 UTC));
        let before = clock.monotonic();
        clock.set(datetime!(2024-05-01 06:00:00 UTC));
        assert_eq!(clock.now(), datetime!(2024-05-01 06:00:00 UTC));
        assert_eq!(clock.monotonic(), before);
    }

    #[test]
    fn system_clock_reports_configured_offset() {
        let offset = UtcOffset::from_hms(2, 0, 0).unwrap();
        let clock = SystemClock::new(offset);
        assert_eq!(clock.now().offset(), offset);
    }
}
