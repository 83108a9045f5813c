//! The timeout engine: configuration, the dispatch thread, and the per-fire
//! execution context.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::clock::{MonotonicClock, TimeSource};
use crate::node::{Node, NodeState, TimeoutHandle};
use crate::queue::{DEFAULT_FREE_LIST_CAP, DEFAULT_INITIAL_CAPACITY, TimeoutQueue};
use crate::{FailureSink, PanicMessage, TimeoutCallback, TracingSink};

/// Synchronous usage errors from [`TimeoutEngine::schedule`]. Nothing is
/// mutated when one is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    /// The engine has been shut down and accepts no new timeouts.
    #[error("engine is shut down")]
    Shutdown,
    /// The deadline lies beyond the configured maximum timeout.
    #[error("deadline exceeds the maximum timeout of {max:?}")]
    TooFar { max: Duration },
}

/// Configuration for a [`TimeoutEngine`].
#[derive(Clone)]
pub struct EngineConfig {
    initial_capacity: usize,
    free_list_cap: usize,
    max_timeout: Option<Duration>,
    thread_name_prefix: String,
    time_source: Arc<dyn TimeSource>,
    failure_sink: Arc<dyn FailureSink>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            initial_capacity: DEFAULT_INITIAL_CAPACITY,
            free_list_cap: DEFAULT_FREE_LIST_CAP,
            max_timeout: None,
            thread_name_prefix: "timerheap".to_string(),
            time_source: Arc::new(MonotonicClock),
            failure_sink: Arc::new(TracingSink),
        }
    }
}

impl EngineConfig {
    /// Initial heap array capacity; the array doubles when full.
    #[must_use]
    pub fn initial_capacity(mut self, capacity: usize) -> Self {
        self.initial_capacity = capacity;
        self
    }

    /// Maximum number of recycled nodes retained for reuse.
    #[must_use]
    pub fn free_list_cap(mut self, cap: usize) -> Self {
        self.free_list_cap = cap;
        self
    }

    /// Rejects deadlines further than this beyond `now` with
    /// [`ScheduleError::TooFar`].
    #[must_use]
    pub fn max_timeout(mut self, max: Duration) -> Self {
        self.max_timeout = Some(max);
        self
    }

    /// Prefix for the dispatch and fire thread names.
    #[must_use]
    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Clock the dispatch loop reads; inject a
    /// [`ManualClock`](crate::ManualClock) for virtual-time tests.
    #[must_use]
    pub fn time_source(mut self, time_source: Arc<dyn TimeSource>) -> Self {
        self.time_source = time_source;
        self
    }

    /// Sink receiving callback panics and fire-spawn failures.
    #[must_use]
    pub fn failure_sink(mut self, failure_sink: Arc<dyn FailureSink>) -> Self {
        self.failure_sink = failure_sink;
        self
    }
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("initial_capacity", &self.initial_capacity)
            .field("free_list_cap", &self.free_list_cap)
            .field("max_timeout", &self.max_timeout)
            .field("thread_name_prefix", &self.thread_name_prefix)
            .finish()
    }
}

pub(crate) struct EngineState {
    pub(crate) queue: TimeoutQueue,
    shutdown: bool,
    dispatch_exited: bool,
}

/// State shared between the engine facade, its handles, the dispatch thread,
/// and fire threads.
///
/// Lock order: engine lock first, then any node lock. A node lock is never
/// held while acquiring the engine lock.
pub(crate) struct Shared {
    pub(crate) state: Mutex<EngineState>,
    dispatch_cv: Condvar,
    exit_cv: Condvar,
    clock: Arc<dyn TimeSource>,
    sink: Arc<dyn FailureSink>,
    thread_name_prefix: String,
    max_timeout: Option<Duration>,
    next_node_id: AtomicU64,
}

/// Timeout scheduling engine with an explicit lifecycle.
///
/// Construction spawns the dispatch thread; [`shutdown`] (or `Drop`) stops
/// it. Independent engines are fully isolated, so tests can create as many
/// as they need.
///
/// [`shutdown`]: TimeoutEngine::shutdown
pub struct TimeoutEngine {
    shared: Arc<Shared>,
    dispatch: Mutex<Option<thread::JoinHandle<()>>>,
}

impl TimeoutEngine {
    /// Creates an engine with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Creates an engine with a custom configuration.
    #[must_use]
    pub fn with_config(config: EngineConfig) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(EngineState {
                queue: TimeoutQueue::with_capacity(config.initial_capacity, config.free_list_cap),
                shutdown: false,
                dispatch_exited: false,
            }),
            dispatch_cv: Condvar::new(),
            exit_cv: Condvar::new(),
            clock: Arc::clone(&config.time_source),
            sink: Arc::clone(&config.failure_sink),
            thread_name_prefix: config.thread_name_prefix.clone(),
            max_timeout: config.max_timeout,
            next_node_id: AtomicU64::new(1),
        });

        // A clock whose reading can jump (ManualClock) must wake the
        // dispatch loop after each jump; Weak keeps the hook from pinning
        // the engine alive through the clock.
        let weak = Arc::downgrade(&shared);
        shared.clock.on_advance(Box::new(move || {
            if let Some(shared) = weak.upgrade() {
                let _state = shared.state.lock();
                shared.dispatch_cv.notify_all();
            }
        }));

        let loop_shared = Arc::clone(&shared);
        let dispatch = thread::Builder::new()
            .name(format!("{}-dispatch", shared.thread_name_prefix))
            .spawn(move || dispatch_loop(&loop_shared))
            .expect("failed to spawn dispatch thread");

        debug!(prefix = %shared.thread_name_prefix, "timeout engine started");

        Self {
            shared,
            dispatch: Mutex::new(Some(dispatch)),
        }
    }

    /// Schedules `callback` to fire at the absolute time `deadline`.
    ///
    /// A deadline at or before now is accepted and fires on the next
    /// dispatch pass. `O(log n)`.
    pub fn schedule(
        &self,
        deadline: Instant,
        callback: Arc<dyn TimeoutCallback>,
    ) -> Result<TimeoutHandle, ScheduleError> {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        if state.shutdown {
            return Err(ScheduleError::Shutdown);
        }
        if let Some(max) = shared.max_timeout {
            if deadline > shared.clock.now() + max {
                return Err(ScheduleError::TooFar { max });
            }
        }

        let (node, generation) = state.queue.obtain(deadline, callback, || {
            shared.next_node_id.fetch_add(1, Ordering::Relaxed)
        });
        let index = state.queue.insert(Arc::clone(&node));
        if index == 1 {
            shared.dispatch_cv.notify_one();
        }
        trace!(id = node.id(), "scheduled timeout");
        Ok(TimeoutHandle::from_parts(
            node,
            generation,
            deadline,
            Arc::clone(shared),
        ))
    }

    /// Schedules `callback` to fire `delay` from now on the engine's clock.
    pub fn schedule_in(
        &self,
        delay: Duration,
        callback: Arc<dyn TimeoutCallback>,
    ) -> Result<TimeoutHandle, ScheduleError> {
        self.schedule(self.shared.clock.now() + delay, callback)
    }

    /// Number of outstanding timeouts.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending() == 0
    }

    /// Stops accepting timeouts and drops every pending one without firing
    /// it. In-flight fires run to completion, so cancellers blocked on them
    /// are still woken. Idempotent.
    pub fn shutdown(&self) {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return;
        }
        state.shutdown = true;
        let dropped = state.queue.clear_pending();
        drop(state);
        self.shared.dispatch_cv.notify_all();
        debug!(dropped, "timeout engine shut down");
    }

    /// [`shutdown`](TimeoutEngine::shutdown), then waits up to `timeout` for
    /// the dispatch thread to exit. Returns `true` if it exited in time.
    pub fn shutdown_and_wait(&self, timeout: Duration) -> bool {
        self.shutdown();

        let deadline = Instant::now() + timeout;
        {
            let mut state = self.shared.state.lock();
            while !state.dispatch_exited {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return false;
                }
                self.shared.exit_cv.wait_for(&mut state, remaining);
            }
        }

        if let Some(handle) = self.dispatch.lock().take() {
            let _ = handle.join();
        }
        true
    }
}

impl Default for TimeoutEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TimeoutEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("TimeoutEngine")
            .field("pending", &state.queue.len())
            .field("shutdown", &state.shutdown)
            .finish()
    }
}

impl Drop for TimeoutEngine {
    fn drop(&mut self) {
        let _ = self.shutdown_and_wait(Duration::from_secs(1));
    }
}

/// Single background loop: sleep until the soonest deadline, pop due nodes,
/// hand each to a fire thread. Never runs a callback itself, so its critical
/// section stays short and schedule/cancel never queue behind a callback.
fn dispatch_loop(shared: &Arc<Shared>) {
    debug!("dispatch loop running");
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            break;
        }
        let Some(deadline) = state.queue.peek_deadline() else {
            shared.dispatch_cv.wait(&mut state);
            continue;
        };
        let now = shared.clock.now();
        if deadline > now {
            // A wake from schedule/shutdown/clock-advance re-evaluates
            // rather than fires.
            shared.dispatch_cv.wait_for(&mut state, deadline - now);
            continue;
        }
        let Some(node) = state.queue.pop_root() else {
            continue;
        };
        drop(state);
        spawn_fire(shared, node);
        state = shared.state.lock();
    }
    state.dispatch_exited = true;
    drop(state);
    shared.exit_cv.notify_all();
    debug!("dispatch loop exited");
}

/// One-shot execution context: a freshly spawned named thread that invokes
/// the callback outside every lock and then completes the node's lifecycle.
fn spawn_fire(shared: &Arc<Shared>, node: Arc<Node>) {
    let thread_shared = Arc::clone(shared);
    let thread_node = Arc::clone(&node);
    let spawned = thread::Builder::new()
        .name(format!("{}-fire-{}", shared.thread_name_prefix, node.id()))
        .spawn(move || {
            let (callback, generation) = thread_node.begin_fire();
            let handle = TimeoutHandle::from_parts(
                Arc::clone(&thread_node),
                generation,
                thread_node.deadline(),
                Arc::clone(&thread_shared),
            );
            if let Some(callback) = callback {
                trace!(id = handle.id(), "firing timeout");
                let result =
                    panic::catch_unwind(AssertUnwindSafe(|| callback.timed_out(&handle)));
                if let Err(payload) = result {
                    thread_shared
                        .sink
                        .callback_panicked(&handle, PanicMessage::from_payload(payload));
                }
            }
            complete_fire(&thread_shared, &thread_node);
        });

    if let Err(error) = spawned {
        // The callback is not invoked; the engine completes the lifecycle
        // itself so cancellers and the free list still make progress.
        let (_callback, generation) = node.begin_fire();
        let handle = TimeoutHandle::from_parts(
            Arc::clone(&node),
            generation,
            node.deadline(),
            Arc::clone(shared),
        );
        shared.sink.fire_spawn_failed(&handle, error);
        complete_fire(shared, &node);
    }
}

/// After the callback returns (or the fire failed to start): transition the
/// node to done, wake blocked cancellers, and recycle the node.
fn complete_fire(shared: &Shared, node: &Arc<Node>) {
    {
        let mut body = node.body.lock();
        if body.state == NodeState::CancelPending {
            body.state = NodeState::Done;
            node.completed.notify_all();
        } else {
            body.state = NodeState::Done;
        }
    }
    let mut state = shared.state.lock();
    state.queue.release(Arc::clone(node));
}
