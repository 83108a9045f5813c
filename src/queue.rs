//! Array-backed binary min-heap over deadlines, plus the bounded free list
//! of recycled nodes.
//!
//! The queue is a plain data structure with no locking of its own: the engine
//! operates on it under its single engine-wide mutex, exactly as callers take
//! `&mut self`. Slot 0 of the backing array is unused; for every live node at
//! slot `i` (with children at `2i` and `2i+1`), `deadline(i) <=
//! deadline(child)`, and the node's own state is `Queued(i)`. Both halves of
//! that invariant are maintained as a side effect of every insert, swap, and
//! remove-last-swap.

use std::sync::Arc;
use std::time::Instant;

use crate::TimeoutCallback;
use crate::node::{Node, NodeState};

pub const DEFAULT_INITIAL_CAPACITY: usize = 16;
pub const DEFAULT_FREE_LIST_CAP: usize = 1024;

pub struct TimeoutQueue {
    /// 1-indexed heap slots; index 0 stays `None`.
    slots: Vec<Option<Arc<Node>>>,
    len: usize,
    free_head: Option<Arc<Node>>,
    free_len: usize,
    free_cap: usize,
}

impl TimeoutQueue {
    #[must_use]
    pub fn with_capacity(initial_capacity: usize, free_list_cap: usize) -> Self {
        let capacity = initial_capacity.max(1);
        Self {
            slots: vec![None; capacity + 1],
            len: 0,
            free_head: None,
            free_len: 0,
            free_cap: free_list_cap,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of nodes currently pooled for reuse.
    #[must_use]
    pub fn free_len(&self) -> usize {
        self.free_len
    }

    /// Deadline of the next node to fire, if any.
    #[must_use]
    pub fn peek_deadline(&self) -> Option<Instant> {
        if self.len == 0 {
            return None;
        }
        Some(self.node(1).deadline())
    }

    /// Obtains a node for a new activation, reusing the free list when
    /// possible. `new_id` is only invoked when a fresh node must be
    /// allocated. Returns the node and its activation generation.
    pub fn obtain(
        &mut self,
        deadline: Instant,
        callback: Arc<dyn TimeoutCallback>,
        new_id: impl FnOnce() -> u64,
    ) -> (Arc<Node>, u64) {
        let node = match self.take_free() {
            Some(node) => node,
            None => Arc::new(Node::new(new_id())),
        };
        let generation = node.activate(deadline, callback);
        (node, generation)
    }

    /// Places the node at the next free slot and sifts it up. Returns the
    /// final slot index; index 1 means the soonest deadline changed and the
    /// dispatch loop should be woken. `O(log n)`.
    pub fn insert(&mut self, node: Arc<Node>) -> usize {
        if self.len + 1 >= self.slots.len() {
            self.slots.resize(self.slots.len() * 2, None);
        }
        let index = self.len + 1;
        node.set_queued(index);
        self.slots[index] = Some(node);
        self.len += 1;
        self.sift_up(index)
    }

    /// Removes a queued node and returns it to the free list. Returns
    /// `false` if the node is not currently queued. `O(log n)`.
    pub fn cancel(&mut self, node: &Arc<Node>) -> bool {
        let index = match node.body.lock().state {
            NodeState::Queued(index) => index,
            _ => return false,
        };
        let removed = self.remove(index);
        debug_assert!(Arc::ptr_eq(&removed, node));
        self.release(removed);
        true
    }

    /// Pops the root (soonest deadline) and marks it firing. The caller owns
    /// the rest of the node's lifecycle and must eventually [`release`] it.
    ///
    /// [`release`]: TimeoutQueue::release
    pub fn pop_root(&mut self) -> Option<Arc<Node>> {
        if self.len == 0 {
            return None;
        }
        let node = self.remove(1);
        node.set_firing();
        Some(node)
    }

    /// Completes a node's lifecycle: clears its callback, marks it done, and
    /// pools it for reuse unless the free list is at capacity, in which case
    /// the node is dropped.
    pub fn release(&mut self, node: Arc<Node>) {
        let retain = self.free_len < self.free_cap;
        {
            let mut body = node.body.lock();
            body.callback = None;
            body.state = NodeState::Done;
            if retain {
                body.next_free = self.free_head.take();
            }
        }
        if retain {
            self.free_head = Some(node);
            self.free_len += 1;
        }
    }

    /// Removes every queued node, marking each done without firing it.
    /// Returns how many were dropped.
    pub fn clear_pending(&mut self) -> usize {
        let dropped = self.len;
        for slot in self.slots.iter_mut().skip(1) {
            if let Some(node) = slot.take() {
                node.body.lock().state = NodeState::Done;
            }
        }
        self.len = 0;
        dropped
    }

    /// Remove-at-index: swap the target with the last slot, shrink, then
    /// restore the invariant from the vacated index (sift up first; if that
    /// made no move, sift down).
    fn remove(&mut self, index: usize) -> Arc<Node> {
        debug_assert!(index >= 1 && index <= self.len);
        let last = self.len;
        self.slots.swap(index, last);
        let node = match self.slots[last].take() {
            Some(node) => node,
            None => unreachable!("heap slot {last} empty with len {}", self.len),
        };
        self.len -= 1;
        if index <= self.len {
            self.node(index).set_queued(index);
            if self.sift_up(index) == index {
                self.sift_down(index);
            }
        }
        node
    }

    fn sift_up(&mut self, mut index: usize) -> usize {
        while index > 1 {
            let parent = index / 2;
            if self.deadline_at(index) < self.deadline_at(parent) {
                self.swap(index, parent);
                index = parent;
            } else {
                break;
            }
        }
        index
    }

    fn sift_down(&mut self, mut index: usize) {
        loop {
            let left = 2 * index;
            let right = left + 1;
            let mut smallest = index;

            if left <= self.len && self.deadline_at(left) < self.deadline_at(smallest) {
                smallest = left;
            }
            if right <= self.len && self.deadline_at(right) < self.deadline_at(smallest) {
                smallest = right;
            }
            if smallest == index {
                break;
            }
            self.swap(index, smallest);
            index = smallest;
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.slots.swap(a, b);
        self.node(a).set_queued(a);
        self.node(b).set_queued(b);
    }

    fn node(&self, index: usize) -> &Arc<Node> {
        match self.slots[index].as_ref() {
            Some(node) => node,
            None => unreachable!("heap slot {index} empty with len {}", self.len),
        }
    }

    fn deadline_at(&self, index: usize) -> Instant {
        self.node(index).deadline()
    }

    fn take_free(&mut self) -> Option<Arc<Node>> {
        let node = self.free_head.take()?;
        self.free_head = node.body.lock().next_free.take();
        self.free_len -= 1;
        Some(node)
    }

    /// Exhaustively checks the heap invariant and position coherence.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        for index in 1..=self.len {
            let node = self.node(index);
            assert_eq!(
                node.body.lock().state,
                NodeState::Queued(index),
                "node {} position out of sync at slot {index}",
                node.id(),
            );
            let parent = index / 2;
            if parent >= 1 {
                assert!(
                    self.deadline_at(parent) <= self.deadline_at(index),
                    "heap order violated between slots {parent} and {index}",
                );
            }
        }
        for (index, slot) in self.slots.iter().enumerate() {
            if index > self.len {
                assert!(slot.is_none(), "stale node beyond len at slot {index}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TimeoutHandle;
    use proptest::prelude::*;
    use std::time::Duration;

    struct NoopCallback;

    impl TimeoutCallback for NoopCallback {
        fn timed_out(&self, _timeout: &TimeoutHandle) {}
    }

    fn callback() -> Arc<dyn TimeoutCallback> {
        Arc::new(NoopCallback)
    }

    fn obtain(queue: &mut TimeoutQueue, epoch: Instant, delay_ms: u64) -> Arc<Node> {
        static NEXT_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);
        let (node, _generation) = queue.obtain(
            epoch + Duration::from_millis(delay_ms),
            callback(),
            || NEXT_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
        );
        node
    }

    #[test]
    fn new_queue_is_empty() {
        let queue = TimeoutQueue::with_capacity(4, 4);
        assert!(queue.is_empty());
        assert_eq!(queue.len(), 0);
        assert!(queue.peek_deadline().is_none());
    }

    #[test]
    fn peek_returns_earliest_deadline() {
        let mut queue = TimeoutQueue::with_capacity(4, 4);
        let epoch = Instant::now();

        for delay in [300, 100, 200] {
            let node = obtain(&mut queue, epoch, delay);
            queue.insert(node);
        }

        assert_eq!(
            queue.peek_deadline(),
            Some(epoch + Duration::from_millis(100))
        );
        queue.check_invariants();
    }

    #[test]
    fn insert_reports_new_root() {
        let mut queue = TimeoutQueue::with_capacity(4, 4);
        let epoch = Instant::now();

        let node = obtain(&mut queue, epoch, 200);
        assert_eq!(queue.insert(node), 1);

        let node = obtain(&mut queue, epoch, 300);
        assert_ne!(queue.insert(node), 1);

        let node = obtain(&mut queue, epoch, 100);
        assert_eq!(queue.insert(node), 1);
    }

    #[test]
    fn pop_root_drains_in_deadline_order() {
        let mut queue = TimeoutQueue::with_capacity(4, 16);
        let epoch = Instant::now();

        for delay in [70, 10, 50, 90, 30, 20, 80, 40, 60] {
            let node = obtain(&mut queue, epoch, delay);
            queue.insert(node);
        }
        queue.check_invariants();

        let mut last = None;
        while let Some(node) = queue.pop_root() {
            let deadline = node.deadline();
            if let Some(previous) = last {
                assert!(deadline >= previous);
            }
            last = Some(deadline);
            queue.release(node);
            queue.check_invariants();
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn cancel_removes_middle_node() {
        let mut queue = TimeoutQueue::with_capacity(8, 8);
        let epoch = Instant::now();

        let first = obtain(&mut queue, epoch, 100);
        queue.insert(first);
        let target = obtain(&mut queue, epoch, 50);
        queue.insert(Arc::clone(&target));
        for delay in [150, 75] {
            let node = obtain(&mut queue, epoch, delay);
            queue.insert(node);
        }

        assert!(queue.cancel(&target));
        queue.check_invariants();
        assert_eq!(
            queue.peek_deadline(),
            Some(epoch + Duration::from_millis(75))
        );
    }

    #[test]
    fn cancel_is_a_noop_for_unqueued_nodes() {
        let mut queue = TimeoutQueue::with_capacity(4, 4);
        let epoch = Instant::now();

        let node = obtain(&mut queue, epoch, 100);
        queue.insert(Arc::clone(&node));

        assert!(queue.cancel(&node));
        assert!(!queue.cancel(&node));
    }

    #[test]
    fn backing_array_doubles_when_full() {
        let mut queue = TimeoutQueue::with_capacity(2, 0);
        let epoch = Instant::now();

        for delay in 0..64 {
            let node = obtain(&mut queue, epoch, delay);
            queue.insert(node);
        }
        assert_eq!(queue.len(), 64);
        queue.check_invariants();
    }

    #[test]
    fn free_list_reuses_released_nodes() {
        let mut queue = TimeoutQueue::with_capacity(4, 4);
        let epoch = Instant::now();

        let node = obtain(&mut queue, epoch, 100);
        let id = node.id();
        queue.insert(Arc::clone(&node));
        assert!(queue.cancel(&node));
        assert_eq!(queue.free_len(), 1);

        let reused = obtain(&mut queue, epoch, 200);
        assert_eq!(reused.id(), id);
        assert_eq!(queue.free_len(), 0);
    }

    #[test]
    fn free_list_never_exceeds_cap() {
        let mut queue = TimeoutQueue::with_capacity(16, 2);
        let epoch = Instant::now();

        let mut nodes = Vec::new();
        for delay in 0..5 {
            let node = obtain(&mut queue, epoch, delay);
            queue.insert(Arc::clone(&node));
            nodes.push(node);
        }
        for node in &nodes {
            assert!(queue.cancel(node));
        }
        assert_eq!(queue.free_len(), 2);
    }

    #[test]
    fn clear_pending_drops_everything() {
        let mut queue = TimeoutQueue::with_capacity(8, 8);
        let epoch = Instant::now();

        for delay in 0..6 {
            let node = obtain(&mut queue, epoch, delay);
            queue.insert(node);
        }
        assert_eq!(queue.clear_pending(), 6);
        assert!(queue.is_empty());
        assert!(queue.peek_deadline().is_none());
    }

    proptest! {
        // Random schedule/cancel interleavings must preserve both halves of
        // the heap invariant after every operation.
        #[test]
        fn random_interleaving_preserves_invariants(
            ops in proptest::collection::vec((any::<bool>(), 0u64..10_000), 1..200)
        ) {
            let mut queue = TimeoutQueue::with_capacity(4, 32);
            let epoch = Instant::now();
            let mut live: Vec<Arc<Node>> = Vec::new();

            for (do_cancel, value) in ops {
                if do_cancel && !live.is_empty() {
                    let node = live.swap_remove(value as usize % live.len());
                    prop_assert!(queue.cancel(&node));
                } else {
                    let node = obtain(&mut queue, epoch, value);
                    queue.insert(Arc::clone(&node));
                    live.push(node);
                }
                queue.check_invariants();
                prop_assert_eq!(queue.len(), live.len());
            }

            while let Some(node) = queue.pop_root() {
                queue.release(node);
                queue.check_invariants();
            }
        }
    }
}
