//! Heap-backed timeout scheduling engine.
//!
//! Callers register "fire this callback at absolute time T" requests against a
//! [`TimeoutEngine`] and get back a [`TimeoutHandle`] they can cancel. All
//! three operations (schedule, cancel, fire) run in `O(log n)` for `n`
//! outstanding timeouts, backed by a 1-indexed array binary min-heap with
//! position tracking and a bounded free list of recycled nodes.
//!
//! A single background dispatch thread sleeps until the soonest deadline and
//! hands each due node to a fresh fire thread, so a slow callback never blocks
//! scheduling or cancellation of other timeouts. Cancelling a timeout whose
//! callback is already running blocks the canceller until that callback has
//! fully returned, so after `cancel()` the callback either never started or
//! has finished.
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use timerheap::{TimeoutCallback, TimeoutEngine, TimeoutHandle};
//!
//! struct Ping;
//!
//! impl TimeoutCallback for Ping {
//!     fn timed_out(&self, _timeout: &TimeoutHandle) {
//!         println!("ping");
//!     }
//! }
//!
//! let engine = TimeoutEngine::new();
//! let handle = engine
//!     .schedule_in(Duration::from_millis(10), Arc::new(Ping))
//!     .unwrap();
//! handle.cancel();
//! ```

use std::any::Any;
use std::fmt;
use std::io;

pub mod clock;
mod comparisons;
mod engine;
mod node;
pub mod queue;

pub use clock::{ManualClock, MonotonicClock, TimeSource};
pub use engine::{EngineConfig, ScheduleError, TimeoutEngine};
pub use node::{CancelOutcome, Node, TimeoutHandle};
pub use queue::TimeoutQueue;

/// Contract implemented by callers to receive a fire notification.
///
/// Invoked at most once per schedule call, on a dedicated fire thread,
/// outside every engine lock. A panic raised here is caught and forwarded to
/// the engine's [`FailureSink`]; it is never retried.
pub trait TimeoutCallback: Send + Sync {
    fn timed_out(&self, timeout: &TimeoutHandle);
}

/// Receives failures the engine cannot surface to any caller: callback
/// panics and fire-thread spawn errors.
pub trait FailureSink: Send + Sync {
    fn callback_panicked(&self, timeout: &TimeoutHandle, message: PanicMessage);
    fn fire_spawn_failed(&self, timeout: &TimeoutHandle, error: io::Error);
}

/// Stringified payload of a caught callback panic.
#[derive(Debug, Clone)]
pub struct PanicMessage(String);

impl PanicMessage {
    pub(crate) fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let text = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self(text)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PanicMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Default [`FailureSink`] that reports through `tracing::error!`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl FailureSink for TracingSink {
    fn callback_panicked(&self, timeout: &TimeoutHandle, message: PanicMessage) {
        tracing::error!(id = timeout.id(), %message, "timeout callback panicked");
    }

    fn fire_spawn_failed(&self, timeout: &TimeoutHandle, error: io::Error) {
        tracing::error!(id = timeout.id(), %error, "failed to spawn fire thread");
    }
}
