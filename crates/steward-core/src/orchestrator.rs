//! Orchestrator state: user intent per manager, plus the private set of
//! loops paused around a planned one-off action.
//!
//! Pausing and resuming act only on this snapshot, never on the user flags,
//! so a resume cannot re-enable a loop the user switched off in the interim,
//! and repeating either operation is idempotent.

use std::collections::BTreeMap;

use contracts::{ManagerFlags, ManagerKind, TaskRef};

use crate::scheduler::WakeScheduler;

#[derive(Debug)]
pub struct Orchestrator {
    flags: ManagerFlags,
    /// Loops paused by us, with the wake deadline they lost.
    paused: BTreeMap<TaskRef, u64>,
}

impl Orchestrator {
    pub fn new(flags: ManagerFlags) -> Self {
        Self {
            flags,
            paused: BTreeMap::new(),
        }
    }

    pub fn flags(&self) -> ManagerFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: ManagerFlags) {
        self.flags = flags;
        // A manager the user just disabled must not be resumed later.
        self.paused.retain(|task, _| {
            task.manager()
                .map(|manager| flags.enabled(manager))
                .unwrap_or(false)
        });
    }

    pub fn is_enabled(&self, manager: ManagerKind) -> bool {
        self.flags.enabled(manager)
    }

    pub fn is_paused(&self, task: &TaskRef) -> bool {
        self.paused.contains_key(task)
    }

    /// Select the loops whose next wake collides with a planned action and
    /// record them as paused by us. Already-paused loops are skipped, so the
    /// selection is idempotent. Returns the tasks whose timers the caller
    /// must cancel.
    pub fn plan_pauses<'a>(
        &mut self,
        scheduler: &WakeScheduler,
        tasks: impl Iterator<Item = &'a TaskRef>,
        fire_at_ms: u64,
        window_ms: u64,
    ) -> Vec<TaskRef> {
        let mut to_pause = Vec::new();
        for task in tasks {
            if task.manager().is_none() || self.paused.contains_key(task) {
                continue;
            }
            let Some(due) = scheduler.next_due_for(task) else {
                continue;
            };
            let collides = due >= fire_at_ms.saturating_sub(window_ms)
                && due <= fire_at_ms.saturating_add(window_ms);
            if collides {
                self.paused.insert(task.clone(), due);
                to_pause.push(task.clone());
            }
        }
        to_pause
    }

    /// Take the paused snapshot for resuming. Loops whose manager the user
    /// disabled meanwhile were already evicted by `set_flags`.
    pub fn drain_paused(&mut self) -> Vec<(TaskRef, u64)> {
        std::mem::take(&mut self.paused).into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::WakeReason;

    fn farming(settlement: &str) -> TaskRef {
        TaskRef::Farming {
            settlement: settlement.to_string(),
        }
    }

    fn recruiting(settlement: &str) -> TaskRef {
        TaskRef::Recruiting {
            settlement: settlement.to_string(),
        }
    }

    #[test]
    fn pauses_only_colliding_loops() {
        let mut scheduler = WakeScheduler::new();
        scheduler.schedule(100_000, farming("north"), WakeReason::Timer);
        scheduler.schedule(500_000, recruiting("north"), WakeReason::Timer);

        let mut orch = Orchestrator::new(ManagerFlags {
            farming: true,
            building: true,
            recruiting: true,
        });
        let tasks = [farming("north"), recruiting("north")];
        let paused = orch.plan_pauses(&scheduler, tasks.iter(), 110_000, 25_000);

        assert_eq!(paused, vec![farming("north")]);
        assert!(orch.is_paused(&farming("north")));
        assert!(!orch.is_paused(&recruiting("north")));
    }

    #[test]
    fn planning_pauses_twice_is_idempotent() {
        let mut scheduler = WakeScheduler::new();
        scheduler.schedule(100_000, farming("north"), WakeReason::Timer);

        let mut orch = Orchestrator::new(ManagerFlags::default());
        let tasks = [farming("north")];
        let first = orch.plan_pauses(&scheduler, tasks.iter(), 100_000, 25_000);
        let second = orch.plan_pauses(&scheduler, tasks.iter(), 100_000, 25_000);

        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
    }

    #[test]
    fn user_disable_evicts_the_paused_snapshot() {
        let mut scheduler = WakeScheduler::new();
        scheduler.schedule(100_000, farming("north"), WakeReason::Timer);

        let mut orch = Orchestrator::new(ManagerFlags::default());
        let tasks = [farming("north")];
        orch.plan_pauses(&scheduler, tasks.iter(), 100_000, 25_000);

        orch.set_flags(ManagerFlags {
            farming: false,
            building: true,
            recruiting: false,
        });
        assert!(orch.drain_paused().is_empty());
    }

    #[test]
    fn drain_returns_the_lost_deadlines() {
        let mut scheduler = WakeScheduler::new();
        scheduler.schedule(90_000, farming("north"), WakeReason::Timer);

        let mut orch = Orchestrator::new(ManagerFlags::default());
        let tasks = [farming("north")];
        orch.plan_pauses(&scheduler, tasks.iter(), 100_000, 25_000);

        let drained = orch.drain_paused();
        assert_eq!(drained, vec![(farming("north"), 90_000)]);
        // A second drain is empty: resuming twice is harmless.
        assert!(orch.drain_paused().is_empty());
    }
}
