//! Time source seam for the engine.
//!
//! The dispatch loop never calls `Instant::now()` directly; it reads the
//! injected [`TimeSource`]. Production engines use [`MonotonicClock`]. Tests
//! use [`ManualClock`], whose reading only moves when `advance` is called —
//! the registered wake hooks let the dispatch loop re-evaluate its deadline
//! immediately after a jump instead of sleeping out the old interval.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Hook invoked whenever a clock's reading jumps.
pub type AdvanceHook = Box<dyn Fn() + Send + Sync>;

pub trait TimeSource: Send + Sync {
    /// Current reading of this clock. Monotonic: never moves backwards.
    fn now(&self) -> Instant;

    /// Registers a hook fired after the clock's reading jumps forward.
    ///
    /// Clocks that only advance with real time (the default) never jump, so
    /// the default implementation discards the hook.
    fn on_advance(&self, hook: AdvanceHook) {
        drop(hook);
    }
}

/// Production clock backed by [`Instant::now`].
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl TimeSource for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Virtual clock for tests: a frozen epoch plus an explicitly advanced
/// nanosecond offset.
pub struct ManualClock {
    epoch: Instant,
    offset_nanos: AtomicU64,
    hooks: Mutex<Vec<AdvanceHook>>,
}

impl ManualClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            offset_nanos: AtomicU64::new(0),
            hooks: Mutex::new(Vec::new()),
        }
    }

    /// Moves the clock forward and fires every registered wake hook.
    pub fn advance(&self, by: Duration) {
        self.offset_nanos
            .fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
        for hook in self.hooks.lock().iter() {
            hook();
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for ManualClock {
    fn now(&self) -> Instant {
        self.epoch + Duration::from_nanos(self.offset_nanos.load(Ordering::SeqCst))
    }

    fn on_advance(&self, hook: AdvanceHook) {
        self.hooks.lock().push(hook);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn manual_clock_starts_frozen() {
        let clock = ManualClock::new();
        let first = clock.now();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(clock.now(), first);
    }

    #[test]
    fn manual_clock_advances_by_exact_amount() {
        let clock = ManualClock::new();
        let start = clock.now();
        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now() - start, Duration::from_millis(250));
    }

    #[test]
    fn advance_fires_registered_hooks() {
        let clock = ManualClock::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let count = Arc::clone(&fired);
        clock.on_advance(Box::new(move || {
            count.fetch_add(1, Ordering::SeqCst);
        }));

        clock.advance(Duration::from_millis(1));
        clock.advance(Duration::from_millis(1));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn monotonic_clock_tracks_real_time() {
        let clock = MonotonicClock;
        let first = clock.now();
        std::thread::sleep(Duration::from_millis(2));
        assert!(clock.now() > first);
    }
}
