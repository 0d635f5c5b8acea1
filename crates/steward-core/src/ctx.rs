//! Shared dispatch context handed to a task loop for one wake.
//!
//! The runtime owns every collaborator; a `LoopCtx` borrows them together so
//! a loop can probe the ui, take and hand back the lock, schedule its next
//! wake, and persist its queue, all within a single dispatch.

use contracts::{AgentConfig, GameCatalog, TaskRef, WakeReason};

use crate::clock::{humanize_jitter_ms, HUMANIZE_JITTER_MAX_MS};
use crate::driver::UiDriver;
use crate::lock::{Acquire, UiLock};
use crate::scheduler::{TimerHandle, WakeScheduler};
use crate::stacking::ResourceStacker;
use crate::store::StateStore;

pub struct LoopCtx<'a> {
    pub now_ms: u64,
    pub config: &'a AgentConfig,
    pub catalog: &'a GameCatalog,
    pub driver: &'a mut dyn UiDriver,
    pub lock: &'a mut UiLock,
    pub scheduler: &'a mut WakeScheduler,
    pub store: &'a mut dyn StateStore,
    pub stacker: &'a mut dyn ResourceStacker,
}

impl LoopCtx<'_> {
    /// Try to take the ui lock. `false` means the caller was queued and will
    /// receive a lock-granted wake later.
    pub fn acquire_lock(&mut self, task: &TaskRef, label: &str) -> bool {
        matches!(
            self.lock.acquire(task.clone(), label, self.now_ms),
            Acquire::Granted
        )
    }

    /// Hand the lock back, waking the next waiter immediately if there is
    /// one.
    pub fn release_lock(&mut self, task: &TaskRef) {
        if let Some(next) = self.lock.release(task, self.now_ms) {
            self.scheduler
                .schedule(self.now_ms, next, WakeReason::LockGranted);
        }
    }

    /// Schedule a pass-level wake, applying humanized jitter when the config
    /// asks for it. Short ui polls bypass this and go through the scheduler
    /// directly so they stay tight.
    pub fn schedule_pass(
        &mut self,
        delay_ms: u64,
        task: TaskRef,
        reason: WakeReason,
    ) -> TimerHandle {
        let mut due = self.now_ms.saturating_add(delay_ms);
        if self.config.humanize {
            due = due.saturating_add(humanize_jitter_ms(
                self.config.seed,
                due,
                HUMANIZE_JITTER_MAX_MS,
            ));
        }
        self.scheduler.schedule(due, task, reason)
    }

    /// Schedule an exact (un-jittered) wake.
    pub fn schedule_poll(&mut self, delay_ms: u64, task: TaskRef, reason: WakeReason) -> TimerHandle {
        self.scheduler
            .schedule(self.now_ms.saturating_add(delay_ms), task, reason)
    }
}
