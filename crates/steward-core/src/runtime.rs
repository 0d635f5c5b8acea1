//! Composition root and event pump.
//!
//! Owns every collaborator (driver, lock, scheduler, store, stacker) and the
//! task loops, and drives the whole system from a single timer queue: pop
//! the next due wake, hand the loop a [`LoopCtx`], repeat. The live pump
//! sleeps between deadlines; tests advance a virtual clock instead.

use std::collections::BTreeMap;

use contracts::{
    AgentConfig, BuildOrder, GameCatalog, LoopStatus, ManagerKind, PlannedAction, RecruitOrder,
    RuntimeStatus, Settlement, TaskRef, WakeReason, LOCK_STALE_AFTER_MS, SCHEMA_VERSION_V1,
};
use tracing::{info, warn};

use crate::building::{build_queue_key, BuildingLoop};
use crate::ctx::LoopCtx;
use crate::driver::UiDriver;
use crate::error::{FatalError, StructuralError};
use crate::farming::FarmingLoop;
use crate::lock::{Acquire, UiLock};
use crate::orchestrator::Orchestrator;
use crate::queue::{BuildQueue, RecruitQueue};
use crate::recruiting::{recruit_queue_key, RecruitingLoop};
use crate::scheduler::{Wake, WakeScheduler};
use crate::stacking::ResourceStacker;
use crate::store::StateStore;

/// Stagger between the initial wakes of freshly started loops, so startup
/// does not pile every loop onto the lock queue at the same instant.
const START_STAGGER_MS: u64 = 700;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActionState {
    Scheduled,
    AwaitingLock,
}

#[derive(Debug)]
struct ActionEntry {
    action: PlannedAction,
    state: ActionState,
}

macro_rules! loop_ctx {
    ($self:ident, $now:expr) => {
        LoopCtx {
            now_ms: $now,
            config: &$self.config,
            catalog: &$self.catalog,
            driver: $self.driver.as_mut(),
            lock: &mut $self.lock,
            scheduler: &mut $self.scheduler,
            store: $self.store.as_mut(),
            stacker: $self.stacker.as_mut(),
        }
    };
}

pub struct AgentRuntime {
    config: AgentConfig,
    catalog: GameCatalog,
    driver: Box<dyn UiDriver + Send>,
    store: Box<dyn StateStore + Send>,
    stacker: Box<dyn ResourceStacker + Send>,
    lock: UiLock,
    scheduler: WakeScheduler,
    farming: BTreeMap<String, FarmingLoop>,
    building: BTreeMap<String, BuildingLoop>,
    recruiting: BTreeMap<String, RecruitingLoop>,
    orchestrator: Orchestrator,
    actions: BTreeMap<String, ActionEntry>,
    settlements: Vec<Settlement>,
}

impl AgentRuntime {
    /// Build the whole system: enumerate settlements (fatal when the driver
    /// finds none), restore persisted queues, register the lock watchdog,
    /// and schedule the initial wakes of every enabled loop.
    pub fn new(
        config: AgentConfig,
        catalog: GameCatalog,
        driver: Box<dyn UiDriver + Send>,
        store: Box<dyn StateStore + Send>,
        stacker: Box<dyn ResourceStacker + Send>,
        now_ms: u64,
    ) -> Result<Self, FatalError> {
        let settlements = driver.list();
        if settlements.is_empty() {
            return Err(FatalError::NoSettlements);
        }

        // One farming loop per cluster, run through the first settlement of
        // the cluster in registry order. Unclustered settlements represent
        // themselves.
        let mut farming: BTreeMap<String, FarmingLoop> = BTreeMap::new();
        let mut representative_of: BTreeMap<String, String> = BTreeMap::new();
        for settlement in &settlements {
            match &settlement.cluster {
                Some(cluster) => {
                    if let Some(representative) = representative_of.get(cluster) {
                        if let Some(task_loop) = farming.get_mut(representative) {
                            task_loop.push_covered(settlement.name.clone());
                        }
                    } else {
                        representative_of.insert(cluster.clone(), settlement.name.clone());
                        farming.insert(
                            settlement.name.clone(),
                            FarmingLoop::new(settlement.name.clone(), vec![settlement.name.clone()]),
                        );
                    }
                }
                None => {
                    farming.insert(
                        settlement.name.clone(),
                        FarmingLoop::new(settlement.name.clone(), vec![settlement.name.clone()]),
                    );
                }
            }
        }

        let mut building = BTreeMap::new();
        let mut recruiting = BTreeMap::new();
        for settlement in &settlements {
            let name = settlement.name.clone();
            let build_queue = store
                .load(&build_queue_key(&name))
                .map(|value| BuildQueue::from_value(&name, value, &catalog))
                .unwrap_or_default();
            let recruit_queue = store
                .load(&recruit_queue_key(&name))
                .map(|value| RecruitQueue::from_value(&name, value, &catalog))
                .unwrap_or_default();
            building.insert(name.clone(), BuildingLoop::new(name.clone(), build_queue));
            recruiting.insert(name.clone(), RecruitingLoop::new(name, recruit_queue));
        }

        let orchestrator = Orchestrator::new(config.managers);
        let mut runtime = Self {
            config,
            catalog,
            driver,
            store,
            stacker,
            lock: UiLock::new(),
            scheduler: WakeScheduler::new(),
            farming,
            building,
            recruiting,
            orchestrator,
            actions: BTreeMap::new(),
            settlements,
        };

        runtime.scheduler.schedule(
            now_ms + LOCK_STALE_AFTER_MS,
            TaskRef::LockWatchdog,
            WakeReason::Watchdog,
        );
        for kind in ManagerKind::ALL {
            if runtime.orchestrator.is_enabled(kind) {
                runtime.start_manager(kind, now_ms);
            }
        }
        info!(
            settlements = runtime.settlements.len(),
            farming_loops = runtime.farming.len(),
            "steward runtime initialized"
        );
        Ok(runtime)
    }

    // -- pump -----------------------------------------------------------

    /// Earliest pending deadline across every loop and system task.
    pub fn next_due(&mut self) -> Option<u64> {
        self.scheduler.next_due()
    }

    /// Dispatch every wake due at or before `now_ms`. Wakes scheduled during
    /// dispatch (lock grants) are processed in the same call when already
    /// due.
    pub fn run_due(&mut self, now_ms: u64) -> usize {
        let mut dispatched = 0;
        while let Some(wake) = self.scheduler.pop_due(now_ms) {
            self.dispatch(wake, now_ms);
            dispatched += 1;
        }
        dispatched
    }

    fn dispatch(&mut self, wake: Wake, now_ms: u64) {
        match wake.task {
            TaskRef::Farming { settlement } => {
                if !self.orchestrator.is_enabled(ManagerKind::Farming) {
                    return;
                }
                let mut ctx = loop_ctx!(self, now_ms);
                if let Some(task_loop) = self.farming.get_mut(&settlement) {
                    task_loop.on_wake(&mut ctx, wake.reason);
                }
            }
            TaskRef::Building { settlement } => {
                if !self.orchestrator.is_enabled(ManagerKind::Building) {
                    return;
                }
                let mut ctx = loop_ctx!(self, now_ms);
                if let Some(task_loop) = self.building.get_mut(&settlement) {
                    task_loop.on_wake(&mut ctx, wake.reason);
                }
            }
            TaskRef::Recruiting { settlement } => {
                if !self.orchestrator.is_enabled(ManagerKind::Recruiting) {
                    return;
                }
                let mut ctx = loop_ctx!(self, now_ms);
                if let Some(task_loop) = self.recruiting.get_mut(&settlement) {
                    task_loop.on_wake(&mut ctx, wake.reason);
                }
            }
            TaskRef::LockWatchdog => {
                if let Some(next) = self.lock.force_release_if_stale(now_ms) {
                    self.scheduler
                        .schedule(now_ms, next, WakeReason::LockGranted);
                }
                self.scheduler.schedule(
                    now_ms + LOCK_STALE_AFTER_MS,
                    TaskRef::LockWatchdog,
                    WakeReason::Watchdog,
                );
            }
            TaskRef::PlannedAction { action_id } => {
                self.handle_action_wake(&action_id, wake.reason, now_ms);
            }
        }
    }

    // -- planned one-off actions ----------------------------------------

    /// Register a future one-time action. Loops whose next wake falls within
    /// the collision window around its fire time are paused until it is done.
    pub fn register_action(
        &mut self,
        action: PlannedAction,
        now_ms: u64,
    ) -> Result<(), StructuralError> {
        if !self
            .settlements
            .iter()
            .any(|settlement| settlement.name == action.settlement)
        {
            return Err(StructuralError::UnknownSettlement {
                name: action.settlement.clone(),
            });
        }
        if self.actions.contains_key(&action.action_id) {
            return Err(StructuralError::DuplicateActionId {
                action_id: action.action_id.clone(),
            });
        }

        self.scheduler.schedule(
            action.fire_at_ms.max(now_ms),
            TaskRef::PlannedAction {
                action_id: action.action_id.clone(),
            },
            WakeReason::ActionDue,
        );

        // A loop that currently owns the lock is mid-pass; its pending wake
        // is a short ui poll, and cancelling that would wedge both the loop
        // and the lock. Only between-pass loops are pausable.
        let tasks: Vec<TaskRef> = self
            .manager_tasks()
            .into_iter()
            .filter(|task| !self.lock.owned_by(task))
            .collect();
        let to_pause = self.orchestrator.plan_pauses(
            &self.scheduler,
            tasks.iter(),
            action.fire_at_ms,
            self.config.collision_window_ms,
        );
        for task in &to_pause {
            info!(%task, action = %action.action_id, "pausing loop around planned action");
            self.scheduler.cancel_task(task);
        }

        self.actions.insert(
            action.action_id.clone(),
            ActionEntry {
                action,
                state: ActionState::Scheduled,
            },
        );
        Ok(())
    }

    pub fn cancel_action(&mut self, action_id: &str, now_ms: u64) -> bool {
        let existed = self.actions.remove(action_id).is_some();
        if existed {
            self.scheduler.cancel_task(&TaskRef::PlannedAction {
                action_id: action_id.to_string(),
            });
            self.resume_paused(now_ms);
        }
        existed
    }

    pub fn planned_actions(&self) -> Vec<PlannedAction> {
        self.actions
            .values()
            .map(|entry| entry.action.clone())
            .collect()
    }

    fn handle_action_wake(&mut self, action_id: &str, reason: WakeReason, now_ms: u64) {
        if !self.actions.contains_key(action_id) {
            return;
        }
        let task = TaskRef::PlannedAction {
            action_id: action_id.to_string(),
        };
        match reason {
            WakeReason::ActionDue => {
                match self
                    .lock
                    .acquire(task, &format!("action {action_id}"), now_ms)
                {
                    Acquire::Granted => self.execute_action(action_id, now_ms),
                    Acquire::Queued => {
                        if let Some(entry) = self.actions.get_mut(action_id) {
                            entry.state = ActionState::AwaitingLock;
                        }
                    }
                }
            }
            WakeReason::LockGranted => {
                let awaiting = self
                    .actions
                    .get(action_id)
                    .map(|entry| entry.state == ActionState::AwaitingLock)
                    .unwrap_or(false);
                if awaiting {
                    self.execute_action(action_id, now_ms);
                }
            }
            _ => {}
        }
    }

    fn execute_action(&mut self, action_id: &str, now_ms: u64) {
        let task = TaskRef::PlannedAction {
            action_id: action_id.to_string(),
        };
        let Some(entry) = self.actions.remove(action_id) else {
            return;
        };
        let action = entry.action;
        let result = self
            .driver
            .switch_to(&action.settlement)
            .and_then(|_| self.driver.execute_action(&action));
        if let Err(err) = result {
            // One-shot best effort; the user sees the warning and re-plans.
            warn!(action = %action.action_id, %err, "planned action failed");
        } else {
            info!(action = %action.action_id, target = %action.target, "planned action executed");
        }
        if let Some(next) = self.lock.release(&task, now_ms) {
            self.scheduler
                .schedule(now_ms, next, WakeReason::LockGranted);
        }
        self.resume_paused(now_ms);
    }

    /// Resume exactly the loops the orchestrator paused, at their original
    /// deadline or now, whichever is later. User-disabled managers were
    /// already evicted from the snapshot.
    fn resume_paused(&mut self, now_ms: u64) {
        for (task, due) in self.orchestrator.drain_paused() {
            info!(%task, "resuming loop after planned action");
            self.scheduler
                .schedule(due.max(now_ms), task, WakeReason::Timer);
        }
    }

    // -- manager toggles -------------------------------------------------

    /// Apply the popup panel's "managers changed" notification.
    pub fn set_manager_flags(&mut self, flags: contracts::ManagerFlags, now_ms: u64) {
        let previous = self.orchestrator.flags();
        self.orchestrator.set_flags(flags);
        for kind in ManagerKind::ALL {
            match (previous.enabled(kind), flags.enabled(kind)) {
                (true, false) => self.stop_manager(kind, now_ms),
                (false, true) => self.start_manager(kind, now_ms),
                _ => {}
            }
        }
        self.config.managers = flags;
    }

    fn start_manager(&mut self, kind: ManagerKind, now_ms: u64) {
        let tasks: Vec<TaskRef> = match kind {
            ManagerKind::Farming => self
                .farming
                .values()
                .map(|task_loop| task_loop.task().clone())
                .collect(),
            ManagerKind::Building => self
                .building
                .values()
                .map(|task_loop| task_loop.task().clone())
                .collect(),
            ManagerKind::Recruiting => self
                .recruiting
                .values()
                .map(|task_loop| task_loop.task().clone())
                .collect(),
        };
        for (index, task) in tasks.into_iter().enumerate() {
            self.scheduler.schedule(
                now_ms + START_STAGGER_MS * (index as u64 + 1),
                task,
                WakeReason::Timer,
            );
        }
    }

    fn stop_manager(&mut self, kind: ManagerKind, now_ms: u64) {
        match kind {
            ManagerKind::Farming => {
                let keys: Vec<String> = self.farming.keys().cloned().collect();
                for key in keys {
                    let mut ctx = loop_ctx!(self, now_ms);
                    if let Some(task_loop) = self.farming.get_mut(&key) {
                        task_loop.stop(&mut ctx);
                    }
                }
            }
            ManagerKind::Building => {
                let keys: Vec<String> = self.building.keys().cloned().collect();
                for key in keys {
                    let mut ctx = loop_ctx!(self, now_ms);
                    if let Some(task_loop) = self.building.get_mut(&key) {
                        task_loop.stop(&mut ctx);
                    }
                }
            }
            ManagerKind::Recruiting => {
                let keys: Vec<String> = self.recruiting.keys().cloned().collect();
                for key in keys {
                    let mut ctx = loop_ctx!(self, now_ms);
                    if let Some(task_loop) = self.recruiting.get_mut(&key) {
                        task_loop.stop(&mut ctx);
                    }
                }
            }
        }
    }

    // -- queue edits (ui-driven; no lock needed) -------------------------

    pub fn queue_build(
        &mut self,
        settlement: &str,
        order: BuildOrder,
        now_ms: u64,
    ) -> Result<(), StructuralError> {
        if self.catalog.structure(&order.structure).is_none() {
            return Err(StructuralError::UnknownStructure {
                key: order.structure.clone(),
            });
        }
        let Some(task_loop) = self.building.get_mut(settlement) else {
            return Err(StructuralError::UnknownSettlement {
                name: settlement.to_string(),
            });
        };
        task_loop.enqueue(order, self.store.as_mut());
        if self.orchestrator.is_enabled(ManagerKind::Building) && task_loop.is_idle() {
            self.scheduler
                .schedule(now_ms, task_loop.task().clone(), WakeReason::Timer);
        }
        Ok(())
    }

    pub fn remove_build(
        &mut self,
        settlement: &str,
        index: usize,
    ) -> Result<Option<BuildOrder>, StructuralError> {
        let Some(task_loop) = self.building.get_mut(settlement) else {
            return Err(StructuralError::UnknownSettlement {
                name: settlement.to_string(),
            });
        };
        Ok(task_loop.remove_order(index, self.store.as_mut()))
    }

    pub fn queue_recruit(
        &mut self,
        settlement: &str,
        order: RecruitOrder,
        now_ms: u64,
    ) -> Result<(), StructuralError> {
        if self.catalog.unit(&order.unit).is_none() {
            return Err(StructuralError::UnknownUnit {
                key: order.unit.clone(),
            });
        }
        let Some(task_loop) = self.recruiting.get_mut(settlement) else {
            return Err(StructuralError::UnknownSettlement {
                name: settlement.to_string(),
            });
        };
        task_loop.enqueue(order, self.store.as_mut());
        if self.orchestrator.is_enabled(ManagerKind::Recruiting) && task_loop.is_idle() {
            self.scheduler
                .schedule(now_ms, task_loop.task().clone(), WakeReason::Timer);
        }
        Ok(())
    }

    pub fn remove_recruit(
        &mut self,
        settlement: &str,
        index: usize,
    ) -> Result<Option<RecruitOrder>, StructuralError> {
        let Some(task_loop) = self.recruiting.get_mut(settlement) else {
            return Err(StructuralError::UnknownSettlement {
                name: settlement.to_string(),
            });
        };
        Ok(task_loop.remove_order(index, self.store.as_mut()))
    }

    // -- introspection ---------------------------------------------------

    pub fn settlements(&self) -> &[Settlement] {
        &self.settlements
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn catalog(&self) -> &GameCatalog {
        &self.catalog
    }

    pub fn build_queue(&self, settlement: &str) -> Option<&BuildQueue> {
        self.building.get(settlement).map(BuildingLoop::queue)
    }

    pub fn recruit_queue(&self, settlement: &str) -> Option<&RecruitQueue> {
        self.recruiting.get(settlement).map(RecruitingLoop::queue)
    }

    pub fn status(&self, now_ms: u64) -> RuntimeStatus {
        let mut loops = Vec::new();
        for task_loop in self.farming.values() {
            loops.push(LoopStatus {
                task: task_loop.task().clone(),
                phase: task_loop.phase_label().to_string(),
                enabled: self.orchestrator.is_enabled(ManagerKind::Farming),
                paused_by_orchestrator: self.orchestrator.is_paused(task_loop.task()),
                next_wake_ms: self.scheduler.next_due_for(task_loop.task()),
                queue_depth: task_loop.covers().len(),
            });
        }
        for task_loop in self.building.values() {
            loops.push(LoopStatus {
                task: task_loop.task().clone(),
                phase: task_loop.phase_label().to_string(),
                enabled: self.orchestrator.is_enabled(ManagerKind::Building),
                paused_by_orchestrator: self.orchestrator.is_paused(task_loop.task()),
                next_wake_ms: self.scheduler.next_due_for(task_loop.task()),
                queue_depth: task_loop.queue().len(),
            });
        }
        for task_loop in self.recruiting.values() {
            loops.push(LoopStatus {
                task: task_loop.task().clone(),
                phase: task_loop.phase_label().to_string(),
                enabled: self.orchestrator.is_enabled(ManagerKind::Recruiting),
                paused_by_orchestrator: self.orchestrator.is_paused(task_loop.task()),
                next_wake_ms: self.scheduler.next_due_for(task_loop.task()),
                queue_depth: task_loop.queue().len(),
            });
        }
        RuntimeStatus {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            now_ms,
            lock: self.lock.status(now_ms),
            loops,
            planned_actions: self.actions.len(),
        }
    }

    fn manager_tasks(&self) -> Vec<TaskRef> {
        self.farming
            .values()
            .map(|task_loop| task_loop.task().clone())
            .chain(self.building.values().map(|task_loop| task_loop.task().clone()))
            .chain(
                self.recruiting
                    .values()
                    .map(|task_loop| task_loop.task().clone()),
            )
            .collect()
    }
}
