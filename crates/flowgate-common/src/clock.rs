//! Worker cycle clock
//!
//! All rate and throttle arithmetic in the scheduler is done in clock units
//! ("cycles"). The production clock reads the CPU timestamp counter; tests
//! use a manually advanced clock so rate-limit behavior is deterministic.

use std::cell::Cell;
use std::rc::Rc;

/// A monotonic cycle counter.
///
/// Implementations must be cheap to read; `now` is called at least once per
/// scheduler iteration.
pub trait Clock {
    /// Current time in clock units.
    fn now(&self) -> u64;
}

/// The CPU timestamp counter.
///
/// On x86_64 this is `rdtsc`; elsewhere it falls back to monotonic
/// nanoseconds, which preserves every property the scheduler relies on
/// (monotonicity, uniform units).
#[derive(Debug, Clone, Copy, Default)]
pub struct TscClock;

impl Clock for TscClock {
    #[inline(always)]
    fn now(&self) -> u64 {
        #[cfg(target_arch = "x86_64")]
        unsafe {
            core::arch::x86_64::_rdtsc()
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            use std::time::Instant;
            use std::sync::OnceLock;
            static EPOCH: OnceLock<Instant> = OnceLock::new();
            EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
        }
    }
}

/// A test clock advanced by hand.
///
/// Clones share the same underlying counter, so a test can keep a handle
/// while the scheduler owns another.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    ticks: Rc<Cell<u64>>,
}

impl ManualClock {
    /// New clock starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the clock by `cycles`.
    pub fn advance(&self, cycles: u64) {
        self.ticks.set(self.ticks.get() + cycles);
    }

    /// Set the clock to an absolute value.
    pub fn set(&self, cycles: u64) {
        self.ticks.set(cycles);
    }
}

impl Clock for ManualClock {
    #[inline(always)]
    fn now(&self) -> u64 {
        self.ticks.get()
    }
}
