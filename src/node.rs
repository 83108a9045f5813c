use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::TimeoutCallback;
use crate::engine::Shared;

/// Lifecycle state of a [`Node`].
///
/// While queued, the payload of `Queued` is the node's 1-based slot index in
/// the heap array. Keeping it in sync with the node's true position on every
/// heap mutation is what makes cancellation `O(log n)` instead of an `O(n)`
/// search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeState {
    /// Live in the heap at the given slot index.
    Queued(usize),
    /// Popped from the heap; callback executing or about to execute.
    Firing,
    /// Firing, with at least one canceller blocked on completion.
    CancelPending,
    /// Lifecycle complete; eligible for the free list.
    Done,
}

/// One outstanding or recycled timeout request.
///
/// Shared as `Arc<Node>` between the heap, the handle(s) minted for it, and
/// the fire thread. The per-node mutex and condvar carry the cancellation
/// race: a canceller that loses the race to the dispatch loop parks on
/// `completed` until the in-flight callback finishes, without contending with
/// cancellers of unrelated nodes.
pub struct Node {
    id: u64,
    pub(crate) body: Mutex<NodeBody>,
    pub(crate) completed: Condvar,
}

pub(crate) struct NodeBody {
    /// Absolute fire time, immutable for the current activation.
    pub(crate) deadline: Instant,
    /// Cleared when the node returns to the free list.
    pub(crate) callback: Option<Arc<dyn TimeoutCallback>>,
    pub(crate) state: NodeState,
    /// Bumped on every activation; handles minted with an older generation
    /// are stale and all their operations are no-ops.
    pub(crate) generation: u64,
    /// Intrusive free-list link, meaningful only while pooled.
    pub(crate) next_free: Option<Arc<Node>>,
}

impl Node {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            body: Mutex::new(NodeBody {
                deadline: Instant::now(),
                callback: None,
                state: NodeState::Done,
                generation: 0,
                next_free: None,
            }),
            completed: Condvar::new(),
        }
    }

    /// Engine-unique id, stable across activations. Used for logging and
    /// failure reporting.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Deadline of the current activation.
    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.body.lock().deadline
    }

    /// Stamps the node for a new activation and returns the new generation.
    pub(crate) fn activate(&self, deadline: Instant, callback: Arc<dyn TimeoutCallback>) -> u64 {
        let mut body = self.body.lock();
        debug_assert_eq!(body.state, NodeState::Done);
        body.deadline = deadline;
        body.callback = Some(callback);
        body.generation += 1;
        body.generation
    }

    pub(crate) fn set_queued(&self, index: usize) {
        self.body.lock().state = NodeState::Queued(index);
    }

    pub(crate) fn set_firing(&self) {
        self.body.lock().state = NodeState::Firing;
    }

    /// Takes the callback for invocation and reads the activation generation.
    pub(crate) fn begin_fire(&self) -> (Option<Arc<dyn TimeoutCallback>>, u64) {
        let mut body = self.body.lock();
        (body.callback.take(), body.generation)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = self.body.lock();
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("state", &body.state)
            .field("generation", &body.generation)
            .finish()
    }
}

/// Outcome of [`TimeoutHandle::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The node was still queued; it was removed and its callback will never
    /// run.
    Prevented,
    /// The callback was already executing; the call blocked until it
    /// finished.
    AwaitedFire,
    /// The activation had already completed (fired, been cancelled, or the
    /// node was recycled). Nothing to do.
    AlreadyDone,
}

/// Token returned by [`schedule`](crate::TimeoutEngine::schedule).
///
/// Carries the generation it was minted with, so a handle kept past its
/// activation goes inert once the node is recycled: it can never cancel a
/// later activation that happens to reuse the same node.
#[derive(Clone)]
pub struct TimeoutHandle {
    node: Arc<Node>,
    generation: u64,
    deadline: Instant,
    shared: Arc<Shared>,
}

impl TimeoutHandle {
    pub(crate) fn from_parts(
        node: Arc<Node>,
        generation: u64,
        deadline: Instant,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            node,
            generation,
            deadline,
            shared,
        }
    }

    /// Id of the underlying node.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.node.id()
    }

    /// Deadline this handle was scheduled for.
    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Whether this activation has completed (fired or cancelled).
    #[must_use]
    pub fn is_done(&self) -> bool {
        let body = self.node.body.lock();
        body.generation != self.generation || body.state == NodeState::Done
    }

    /// Cancels this timeout. Idempotent, defined for every reachable state.
    ///
    /// If the node is still queued it is removed from the heap and returned
    /// to the free list without blocking. If its callback is already
    /// executing, the call blocks until that callback has fully returned —
    /// after `cancel` returns, the callback for this activation will never
    /// start or has already finished. There is no timeout on that wait, so
    /// callers should keep callbacks short.
    pub fn cancel(&self) -> CancelOutcome {
        let mut state = self.shared.state.lock();
        let mut body = self.node.body.lock();
        if body.generation != self.generation {
            return CancelOutcome::AlreadyDone;
        }
        match body.state {
            NodeState::Queued(_) => {
                drop(body);
                let removed = state.queue.cancel(&self.node);
                debug_assert!(removed);
                trace!(id = self.node.id(), "cancelled queued timeout");
                CancelOutcome::Prevented
            }
            NodeState::Firing | NodeState::CancelPending => {
                body.state = NodeState::CancelPending;
                drop(state);
                trace!(id = self.node.id(), "cancel awaiting in-flight fire");
                while body.generation == self.generation && body.state != NodeState::Done {
                    self.node.completed.wait(&mut body);
                }
                CancelOutcome::AwaitedFire
            }
            NodeState::Done => CancelOutcome::AlreadyDone,
        }
    }
}

impl fmt::Debug for TimeoutHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutHandle")
            .field("id", &self.id())
            .field("generation", &self.generation)
            .field("done", &self.is_done())
            .finish()
    }
}
