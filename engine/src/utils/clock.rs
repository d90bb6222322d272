//! Monotonic clocks for transform budgets.
//!
//! Transforms are timed through the [`Clock`] trait so tests can drive
//! elapsed time deterministically.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Source of monotonic microsecond readings.
pub trait Clock: Send + Sync + Debug {
    /// Microseconds elapsed since an arbitrary, fixed origin.
    fn now_micros(&self) -> u64;
}

/// Clock backed by `Instant::now()`.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_micros(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_micros()).unwrap_or(u64::MAX)
    }
}

/// Clock that advances by a fixed step on every reading.
///
/// Each start/stop pair around a transform therefore measures exactly `step`
/// microseconds, regardless of how long the transform really took.
#[derive(Debug)]
pub struct SteppingClock {
    current: AtomicU64,
    step: u64,
}

impl SteppingClock {
    pub fn new(step_micros: u64) -> Self {
        Self {
            current: AtomicU64::new(0),
            step: step_micros,
        }
    }
}

impl Clock for SteppingClock {
    fn now_micros(&self) -> u64 {
        self.current.fetch_add(self.step, Ordering::Relaxed)
    }
}
