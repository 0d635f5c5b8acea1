//! Wake scheduler: a binary-heap timer queue for the task loops.
//!
//! Entries are ordered by `(due_ms, seq)` so that wakes sharing a deadline
//! fire in the order they were scheduled. Cancellation is by handle; a
//! cancelled entry is skipped lazily when it surfaces.

use std::cmp::Reverse;
use std::collections::BTreeSet;
use std::collections::BinaryHeap;

use contracts::scheduling::{TaskRef, WakeReason};

/// Handle to a scheduled wake, used for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimerHandle(u64);

/// A due wake popped from the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wake {
    pub task: TaskRef,
    pub reason: WakeReason,
    pub due_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TimerEntry {
    due_ms: u64,
    seq: u64,
    task: TaskRef,
    reason: WakeReason,
}

/// Ordering: (due_ms ASC, seq ASC) via `Reverse` in the max-heap.
#[derive(Debug, Clone, PartialEq, Eq)]
struct OrderedEntry(TimerEntry);

impl PartialOrd for OrderedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0
            .due_ms
            .cmp(&other.0.due_ms)
            .then_with(|| self.0.seq.cmp(&other.0.seq))
    }
}

#[derive(Debug, Default)]
pub struct WakeScheduler {
    queue: BinaryHeap<Reverse<OrderedEntry>>,
    cancelled: BTreeSet<u64>,
    next_seq: u64,
}

impl WakeScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, due_ms: u64, task: TaskRef, reason: WakeReason) -> TimerHandle {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.saturating_add(1);
        self.queue.push(Reverse(OrderedEntry(TimerEntry {
            due_ms,
            seq,
            task,
            reason,
        })));
        TimerHandle(seq)
    }

    pub fn cancel(&mut self, handle: TimerHandle) {
        // Only pending entries are recorded; cancelling an already-fired
        // handle is a no-op and keeps the cancelled set bounded.
        if self.queue.iter().any(|entry| entry.0 .0.seq == handle.0) {
            self.cancelled.insert(handle.0);
        }
    }

    /// Cancel every pending wake for a task. Used by loop teardown, which
    /// clears timers but cannot interrupt an in-flight ui action.
    pub fn cancel_task(&mut self, task: &TaskRef) {
        let handles: Vec<u64> = self
            .queue
            .iter()
            .filter(|entry| entry.0 .0.task == *task && !self.cancelled.contains(&entry.0 .0.seq))
            .map(|entry| entry.0 .0.seq)
            .collect();
        self.cancelled.extend(handles);
    }

    /// Earliest pending deadline, skipping cancelled entries.
    pub fn next_due(&mut self) -> Option<u64> {
        self.drop_cancelled_head();
        self.queue.peek().map(|entry| entry.0 .0.due_ms)
    }

    /// Earliest pending deadline for one task. Linear scan; the queue is
    /// small (one or two entries per loop).
    pub fn next_due_for(&self, task: &TaskRef) -> Option<u64> {
        self.queue
            .iter()
            .filter(|entry| entry.0 .0.task == *task && !self.cancelled.contains(&entry.0 .0.seq))
            .map(|entry| entry.0 .0.due_ms)
            .min()
    }

    /// Pop the next wake due at or before `now_ms`.
    pub fn pop_due(&mut self, now_ms: u64) -> Option<Wake> {
        loop {
            self.drop_cancelled_head();
            let head = self.queue.peek()?;
            if head.0 .0.due_ms > now_ms {
                return None;
            }
            let entry = self.queue.pop().map(|e| e.0 .0)?;
            return Some(Wake {
                task: entry.task,
                reason: entry.reason,
                due_ms: entry.due_ms,
            });
        }
    }

    pub fn pending_len(&self) -> usize {
        self.queue
            .iter()
            .filter(|entry| !self.cancelled.contains(&entry.0 .0.seq))
            .count()
    }

    fn drop_cancelled_head(&mut self) {
        while let Some(head) = self.queue.peek() {
            if self.cancelled.remove(&head.0 .0.seq) {
                self.queue.pop();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(settlement: &str) -> TaskRef {
        TaskRef::Building {
            settlement: settlement.to_string(),
        }
    }

    #[test]
    fn pops_in_deadline_order() {
        let mut sched = WakeScheduler::new();
        sched.schedule(50, task("b"), WakeReason::Timer);
        sched.schedule(10, task("a"), WakeReason::Timer);
        sched.schedule(30, task("c"), WakeReason::Timer);

        let order: Vec<u64> = std::iter::from_fn(|| sched.pop_due(100))
            .map(|wake| wake.due_ms)
            .collect();
        assert_eq!(order, vec![10, 30, 50]);
    }

    #[test]
    fn equal_deadlines_fire_in_schedule_order() {
        let mut sched = WakeScheduler::new();
        sched.schedule(10, task("first"), WakeReason::Timer);
        sched.schedule(10, task("second"), WakeReason::Timer);

        assert_eq!(sched.pop_due(10).map(|w| w.task), Some(task("first")));
        assert_eq!(sched.pop_due(10).map(|w| w.task), Some(task("second")));
    }

    #[test]
    fn not_due_yet_is_not_popped() {
        let mut sched = WakeScheduler::new();
        sched.schedule(100, task("a"), WakeReason::Timer);
        assert_eq!(sched.pop_due(99), None);
        assert_eq!(sched.next_due(), Some(100));
        assert!(sched.pop_due(100).is_some());
    }

    #[test]
    fn cancelled_entries_are_skipped() {
        let mut sched = WakeScheduler::new();
        let first = sched.schedule(10, task("a"), WakeReason::Timer);
        sched.schedule(20, task("b"), WakeReason::Timer);
        sched.cancel(first);

        assert_eq!(sched.next_due(), Some(20));
        assert_eq!(sched.pop_due(100).map(|w| w.task), Some(task("b")));
        assert_eq!(sched.pop_due(100), None);
    }

    #[test]
    fn cancel_task_clears_all_of_its_wakes() {
        let mut sched = WakeScheduler::new();
        sched.schedule(10, task("a"), WakeReason::Timer);
        sched.schedule(20, task("a"), WakeReason::Poll);
        sched.schedule(15, task("b"), WakeReason::Timer);

        sched.cancel_task(&task("a"));
        assert_eq!(sched.pending_len(), 1);
        assert_eq!(sched.next_due_for(&task("a")), None);
        assert_eq!(sched.next_due_for(&task("b")), Some(15));
    }

    #[test]
    fn cancelling_twice_is_idempotent() {
        let mut sched = WakeScheduler::new();
        let handle = sched.schedule(10, task("a"), WakeReason::Timer);
        sched.cancel(handle);
        sched.cancel(handle);
        assert_eq!(sched.next_due(), None);
        assert_eq!(sched.pending_len(), 0);
    }
}
