//! Cooperative mutual-exclusion lock for the shared ui context.
//!
//! Exactly one task may manipulate the active-settlement view at a time.
//! Waiters are granted ownership in strict arrival order, and a handoff to
//! the next waiter never clears `held` in between, so a newcomer cannot
//! jump the queue. A watchdog force-releases a lock held past the staleness
//! threshold; liveness over correctness-under-bug.

use std::collections::VecDeque;

use contracts::{LockStatus, TaskRef, LOCK_STALE_AFTER_MS};
use tracing::warn;

/// Outcome of an acquire attempt. `Queued` callers are resumed with a
/// lock-granted wake once ownership arrives; acquisition itself never fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    Granted,
    Queued,
}

#[derive(Debug, Clone)]
struct Waiter {
    task: TaskRef,
    label: String,
}

#[derive(Debug)]
pub struct UiLock {
    held: bool,
    owner: Option<TaskRef>,
    holder_label: Option<String>,
    acquired_at_ms: Option<u64>,
    waiters: VecDeque<Waiter>,
    stale_after_ms: u64,
}

impl UiLock {
    pub fn new() -> Self {
        Self::with_staleness(LOCK_STALE_AFTER_MS)
    }

    pub fn with_staleness(stale_after_ms: u64) -> Self {
        Self {
            held: false,
            owner: None,
            holder_label: None,
            acquired_at_ms: None,
            waiters: VecDeque::new(),
            stale_after_ms,
        }
    }

    /// Request ownership. Grants immediately when free, otherwise appends the
    /// caller to the FIFO waiter queue. Re-acquiring while already holding
    /// queues the caller behind itself and therefore deadlocks; that is an
    /// accepted constraint, flagged with a warning.
    pub fn acquire(&mut self, task: TaskRef, label: &str, now_ms: u64) -> Acquire {
        if !self.held {
            self.held = true;
            self.owner = Some(task);
            self.holder_label = Some(label.to_string());
            self.acquired_at_ms = Some(now_ms);
            return Acquire::Granted;
        }

        if self.owner.as_ref() == Some(&task) {
            warn!(%task, "task re-acquired the ui lock it already holds; this will deadlock");
        }
        self.waiters.push_back(Waiter {
            task,
            label: label.to_string(),
        });
        Acquire::Queued
    }

    /// Release ownership. Hands the lock to the earliest waiter (returned so
    /// the caller can wake it) without ever observing a not-held state in
    /// between; with no waiters the lock becomes free. A release by a task
    /// that is not the current owner is ignored — cleanup paths may race the
    /// watchdog and must stay safe.
    pub fn release(&mut self, task: &TaskRef, now_ms: u64) -> Option<TaskRef> {
        if self.owner.as_ref() != Some(task) {
            warn!(%task, "ignoring ui lock release by a non-owner");
            return None;
        }
        self.hand_off(now_ms)
    }

    /// Watchdog pass: force-release when held past the staleness threshold.
    /// Returns the next owner to wake, if a waiter was promoted.
    pub fn force_release_if_stale(&mut self, now_ms: u64) -> Option<TaskRef> {
        let acquired_at = self.acquired_at_ms?;
        if !self.held || now_ms.saturating_sub(acquired_at) < self.stale_after_ms {
            return None;
        }
        warn!(
            holder = self.holder_label.as_deref().unwrap_or("?"),
            held_for_ms = now_ms.saturating_sub(acquired_at),
            "force-releasing stale ui lock"
        );
        self.hand_off(now_ms)
    }

    fn hand_off(&mut self, now_ms: u64) -> Option<TaskRef> {
        match self.waiters.pop_front() {
            Some(next) => {
                self.owner = Some(next.task.clone());
                self.holder_label = Some(next.label);
                self.acquired_at_ms = Some(now_ms);
                Some(next.task)
            }
            None => {
                self.held = false;
                self.owner = None;
                self.holder_label = None;
                self.acquired_at_ms = None;
                None
            }
        }
    }

    /// Diagnostic only; no guarantee against races.
    pub fn is_held(&self) -> bool {
        self.held
    }

    pub fn owner(&self) -> Option<&TaskRef> {
        self.owner.as_ref()
    }

    pub fn owned_by(&self, task: &TaskRef) -> bool {
        self.owner.as_ref() == Some(task)
    }

    pub fn status(&self, now_ms: u64) -> LockStatus {
        LockStatus {
            held: self.held,
            holder: self.holder_label.clone(),
            held_for_ms: self
                .acquired_at_ms
                .map(|acquired| now_ms.saturating_sub(acquired)),
            waiters: self.waiters.len(),
        }
    }
}

impl Default for UiLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn farming(settlement: &str) -> TaskRef {
        TaskRef::Farming {
            settlement: settlement.to_string(),
        }
    }

    #[test]
    fn grants_immediately_when_free() {
        let mut lock = UiLock::new();
        assert_eq!(lock.acquire(farming("a"), "farm a", 0), Acquire::Granted);
        assert!(lock.is_held());
        assert!(lock.owned_by(&farming("a")));
    }

    #[test]
    fn waiters_are_granted_in_fifo_order() {
        let mut lock = UiLock::new();
        assert_eq!(lock.acquire(farming("a"), "a", 0), Acquire::Granted);
        assert_eq!(lock.acquire(farming("b"), "b", 1), Acquire::Queued);
        assert_eq!(lock.acquire(farming("c"), "c", 2), Acquire::Queued);

        assert_eq!(lock.release(&farming("a"), 3), Some(farming("b")));
        assert!(lock.owned_by(&farming("b")));
        assert_eq!(lock.release(&farming("b"), 4), Some(farming("c")));
        assert_eq!(lock.release(&farming("c"), 5), None);
        assert!(!lock.is_held());
    }

    #[test]
    fn handoff_never_passes_through_a_free_state() {
        let mut lock = UiLock::new();
        lock.acquire(farming("a"), "a", 0);
        lock.acquire(farming("b"), "b", 1);

        let next = lock.release(&farming("a"), 2);
        assert_eq!(next, Some(farming("b")));
        // The lock stayed held across the handoff.
        assert!(lock.is_held());
        assert_eq!(lock.status(2).holder.as_deref(), Some("b"));
    }

    #[test]
    fn release_by_non_owner_is_ignored() {
        let mut lock = UiLock::new();
        lock.acquire(farming("a"), "a", 0);
        assert_eq!(lock.release(&farming("b"), 1), None);
        assert!(lock.is_held());
        assert!(lock.owned_by(&farming("a")));
    }

    #[test]
    fn watchdog_frees_a_stale_lock() {
        let mut lock = UiLock::with_staleness(1000);
        lock.acquire(farming("a"), "a", 0);
        lock.acquire(farming("b"), "b", 1);

        assert_eq!(lock.force_release_if_stale(500), None);
        assert!(lock.owned_by(&farming("a")));

        assert_eq!(lock.force_release_if_stale(1000), Some(farming("b")));
        assert!(lock.owned_by(&farming("b")));
    }

    #[test]
    fn watchdog_clears_a_stale_lock_with_no_waiters() {
        let mut lock = UiLock::with_staleness(1000);
        lock.acquire(farming("a"), "a", 0);
        assert_eq!(lock.force_release_if_stale(5000), None);
        assert!(!lock.is_held());
    }

    #[test]
    fn stale_owner_release_after_force_release_is_safe() {
        let mut lock = UiLock::with_staleness(1000);
        lock.acquire(farming("a"), "a", 0);
        lock.acquire(farming("b"), "b", 1);
        lock.force_release_if_stale(2000);

        // The wedged task eventually reaches its cleanup path.
        assert_eq!(lock.release(&farming("a"), 3000), None);
        assert!(lock.owned_by(&farming("b")));
    }

    #[test]
    fn status_reports_hold_duration_and_waiters() {
        let mut lock = UiLock::new();
        lock.acquire(farming("a"), "farm a", 100);
        lock.acquire(farming("b"), "farm b", 150);

        let status = lock.status(400);
        assert!(status.held);
        assert_eq!(status.holder.as_deref(), Some("farm a"));
        assert_eq!(status.held_for_ms, Some(300));
        assert_eq!(status.waiters, 1);
    }
}
