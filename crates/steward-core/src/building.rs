//! Building task loop: drive a settlement's construction queue to
//! completion, auto-inserting storage/population upgrades when a build is
//! blocked on capacity rather than on accumulation.
//!
//! The head order is classified twice: what the ui offers (`CanBuild`) and,
//! when the action is present but disabled, why the popup cost cannot be
//! paid (`Stackability`). Both feed [`decide`], which is the whole decision
//! table as a pure function.

use contracts::{BuildOrder, ResourceCost, ResourceLevels, TaskRef, WakeReason};
use tracing::{debug, warn};

use crate::clock::parse_countdown_ms;
use crate::ctx::LoopCtx;
use crate::driver::CanBuild;
use crate::error::FlowError;
use crate::queue::BuildQueue;
use crate::scheduler::TimerHandle;

const SLOT_POLL_MS: u64 = 800;
const SLOT_POLL_LIMIT: u32 = 6;
const SPEED_UP_CHECK_MS: u64 = 5 * 60 * 1000;
const FAILURE_BACKOFF_MS: u64 = 30_000;
const MAX_CONSECUTIVE_FAILURES: u32 = 6;

/// Why the head order cannot be paid for right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stackability {
    /// Nothing is missing. Reaching the decision table with this means the
    /// action was disabled for some other transient reason (full slots).
    Enough,
    /// Missing stock that the store can hold; plain accumulation will cover it.
    NeedStacking,
    /// Missing population capacity.
    NeedPopulation,
    /// The cost exceeds what the store can usefully hold; accumulation can
    /// never cover it.
    NeedStorage,
    /// A resource shipment towards this settlement is already underway.
    AlreadyInTransit,
    /// The popup yielded no readable cost.
    InsufficientInfo,
}

/// Classify a blocked order against current levels. The store counts as
/// exhausted at the almost-full threshold; filling it to the literal brim is
/// not a plan.
pub fn classify_stackability(
    cost: Option<&ResourceCost>,
    levels: &ResourceLevels,
    store_almost_full_permille: u32,
    incoming_shipment: bool,
) -> Stackability {
    let Some(cost) = cost else {
        return Stackability::InsufficientInfo;
    };
    let missing = cost.missing_from(levels);
    if missing.is_zero() {
        return Stackability::Enough;
    }
    let usable_capacity =
        levels.store_capacity * i64::from(store_almost_full_permille) / 1000;
    if cost.max_stock_component() > usable_capacity {
        return Stackability::NeedStorage;
    }
    if missing.population > 0 {
        return Stackability::NeedPopulation;
    }
    if incoming_shipment {
        return Stackability::AlreadyInTransit;
    }
    Stackability::NeedStacking
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CriticalKind {
    Storage,
    Population,
}

/// What to do with the head order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildDecision {
    /// Order the construction and await slot confirmation.
    Order,
    /// Done with this order (maxed); advance the queue.
    PopHead,
    /// A forced critical re-check hit a maxed critical order: drop the
    /// second queued order to break the cycle.
    DropSecond,
    /// Nothing will ever make this order valid; drop it.
    DropHead,
    /// Wait for resources (or for something else in the queue to finish).
    ResourceWait,
    /// Wait for the next speed-up opportunity.
    SpeedUpWait,
    /// Unshift a critical capacity order ahead of the blocked one.
    InsertCritical(CriticalKind),
}

/// The §-table: ui classification x stackability x queue shape.
pub fn decide(
    can_build: CanBuild,
    stackability: Stackability,
    queue_len: usize,
    forced_critical: bool,
    allow_critical: bool,
) -> BuildDecision {
    match can_build {
        CanBuild::Buildable => BuildDecision::Order,
        CanBuild::Maxed => {
            if forced_critical {
                BuildDecision::DropSecond
            } else {
                BuildDecision::PopHead
            }
        }
        // Absent target: transient while other orders might change the ui,
        // hopeless when it is the only order left.
        CanBuild::Absent => {
            if queue_len > 1 {
                BuildDecision::ResourceWait
            } else {
                BuildDecision::DropHead
            }
        }
        CanBuild::NotNow => match stackability {
            Stackability::NeedStorage if allow_critical => {
                BuildDecision::InsertCritical(CriticalKind::Storage)
            }
            Stackability::NeedPopulation if allow_critical => {
                BuildDecision::InsertCritical(CriticalKind::Population)
            }
            Stackability::NeedStacking => BuildDecision::ResourceWait,
            Stackability::AlreadyInTransit => BuildDecision::SpeedUpWait,
            Stackability::Enough => BuildDecision::SpeedUpWait,
            Stackability::NeedStorage
            | Stackability::NeedPopulation
            | Stackability::InsufficientInfo => BuildDecision::DropHead,
        },
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum BuildPhase {
    Idle,
    AcquiringLock,
    SwitchingContext,
    Deciding {
        forced_critical: bool,
    },
    AwaitingSlot {
        baseline_free: u32,
        attempts: u32,
    },
    ResourceWait,
    SpeedUpWait,
}

enum StepFlow {
    Continue,
    Sleep { delay_ms: u64 },
    PassEnded,
}

#[derive(Debug)]
pub struct BuildingLoop {
    task: TaskRef,
    settlement: String,
    queue: BuildQueue,
    phase: BuildPhase,
    timer: Option<TimerHandle>,
    /// What started the current pass; a speed-up wake tries the speed-up
    /// action before deciding.
    entry_reason: WakeReason,
    consecutive_failures: u32,
}

impl BuildingLoop {
    pub fn new(settlement: String, queue: BuildQueue) -> Self {
        let task = TaskRef::Building {
            settlement: settlement.clone(),
        };
        Self {
            task,
            settlement,
            queue,
            phase: BuildPhase::Idle,
            timer: None,
            entry_reason: WakeReason::Timer,
            consecutive_failures: 0,
        }
    }

    pub fn task(&self) -> &TaskRef {
        &self.task
    }

    pub fn queue(&self) -> &BuildQueue {
        &self.queue
    }

    pub fn is_idle(&self) -> bool {
        self.phase == BuildPhase::Idle
    }

    pub fn phase_label(&self) -> &'static str {
        match self.phase {
            BuildPhase::Idle => "idle",
            BuildPhase::AcquiringLock => "acquiring-lock",
            BuildPhase::SwitchingContext => "switching-context",
            BuildPhase::Deciding { .. } => "deciding",
            BuildPhase::AwaitingSlot { .. } => "awaiting-slot",
            BuildPhase::ResourceWait => "resource-wait",
            BuildPhase::SpeedUpWait => "speed-up-wait",
        }
    }

    /// User-facing queue edit: append an order. A pure list edit plus
    /// persistence; no lock needed.
    pub fn enqueue(&mut self, order: BuildOrder, store: &mut dyn crate::store::StateStore) {
        self.queue.push(order);
        self.persist_to(store);
    }

    /// User-facing queue edit: cancel the order at `index`, reindexing later
    /// same-structure targets.
    pub fn remove_order(
        &mut self,
        index: usize,
        store: &mut dyn crate::store::StateStore,
    ) -> Option<BuildOrder> {
        let removed = self.queue.remove_at(index);
        if removed.is_some() {
            self.persist_to(store);
        }
        removed
    }

    pub fn on_wake(&mut self, ctx: &mut LoopCtx<'_>, reason: WakeReason) {
        match (&self.phase, reason) {
            (
                BuildPhase::Idle | BuildPhase::ResourceWait | BuildPhase::SpeedUpWait,
                WakeReason::Timer
                | WakeReason::RetryPass
                | WakeReason::ResourceCheck
                | WakeReason::SpeedUpCheck,
            ) => {
                if let Some(timer) = self.timer.take() {
                    ctx.scheduler.cancel(timer);
                }
                self.entry_reason = reason;
                self.phase = BuildPhase::AcquiringLock;
                if ctx.acquire_lock(&self.task, &format!("building {}", self.settlement)) {
                    self.run(ctx);
                }
            }
            (BuildPhase::AcquiringLock, WakeReason::LockGranted) => self.run(ctx),
            (BuildPhase::AwaitingSlot { .. }, WakeReason::Poll) => self.run(ctx),
            (phase, reason) => {
                debug!(task = %self.task, ?phase, ?reason, "ignoring stale building wake");
            }
        }
    }

    pub fn stop(&mut self, ctx: &mut LoopCtx<'_>) {
        if let Some(timer) = self.timer.take() {
            ctx.scheduler.cancel(timer);
        }
        ctx.scheduler.cancel_task(&self.task);
        if ctx.lock.owned_by(&self.task) {
            ctx.release_lock(&self.task);
        }
        self.phase = BuildPhase::Idle;
    }

    fn run(&mut self, ctx: &mut LoopCtx<'_>) {
        loop {
            match self.step(ctx) {
                Ok(StepFlow::Continue) => continue,
                Ok(StepFlow::Sleep { delay_ms }) => {
                    self.timer =
                        Some(ctx.schedule_poll(delay_ms, self.task.clone(), WakeReason::Poll));
                    return;
                }
                Ok(StepFlow::PassEnded) => return,
                Err(err) => {
                    self.fail_pass(ctx, err);
                    return;
                }
            }
        }
    }

    fn step(&mut self, ctx: &mut LoopCtx<'_>) -> Result<StepFlow, FlowError> {
        match self.phase.clone() {
            BuildPhase::AcquiringLock => {
                self.phase = BuildPhase::SwitchingContext;
                Ok(StepFlow::Continue)
            }
            BuildPhase::SwitchingContext => {
                ctx.driver
                    .switch_to(&self.settlement)
                    .map_err(|_| FlowError::SwitchFailed {
                        settlement: self.settlement.clone(),
                    })?;
                if self.entry_reason == WakeReason::SpeedUpCheck
                    && ctx.driver.free_speed_up_available()?
                {
                    ctx.driver.apply_speed_up()?;
                }
                self.phase = BuildPhase::Deciding {
                    forced_critical: false,
                };
                Ok(StepFlow::Continue)
            }
            BuildPhase::Deciding { forced_critical } => {
                self.decide_head(ctx, forced_critical)
            }
            BuildPhase::AwaitingSlot {
                baseline_free,
                attempts,
            } => {
                let free = ctx.driver.free_construction_slots()?;
                if free < baseline_free {
                    // Order accepted; the level is genuinely rising, so the
                    // queue advances without reindexing.
                    self.queue.complete_head();
                    self.persist(ctx);
                    self.phase = BuildPhase::Deciding {
                        forced_critical: false,
                    };
                    return Ok(StepFlow::Continue);
                }
                let attempts = attempts + 1;
                if attempts >= SLOT_POLL_LIMIT {
                    let structure = self
                        .queue
                        .head()
                        .map(|order| order.structure.clone())
                        .unwrap_or_default();
                    return Err(FlowError::BuildNotConfirmed { structure });
                }
                self.phase = BuildPhase::AwaitingSlot {
                    baseline_free,
                    attempts,
                };
                Ok(StepFlow::Sleep {
                    delay_ms: SLOT_POLL_MS,
                })
            }
            BuildPhase::Idle | BuildPhase::ResourceWait | BuildPhase::SpeedUpWait => {
                Ok(StepFlow::PassEnded)
            }
        }
    }

    fn decide_head(
        &mut self,
        ctx: &mut LoopCtx<'_>,
        forced_critical: bool,
    ) -> Result<StepFlow, FlowError> {
        let Some(head) = self.queue.head().cloned() else {
            return self.finish_queue(ctx);
        };

        let can_build = ctx.driver.classify_build(&head.structure)?;
        let stackability = if can_build == CanBuild::NotNow {
            let cost = ctx.driver.build_cost(&head.structure)?;
            let levels = ctx.driver.current_levels()?;
            let incoming = ctx.driver.has_incoming_shipment()?;
            classify_stackability(
                cost.as_ref(),
                &levels,
                ctx.config.store_almost_full_permille,
                incoming,
            )
        } else {
            Stackability::Enough
        };

        let decision = decide(
            can_build,
            stackability,
            self.queue.len(),
            forced_critical,
            ctx.config.allow_critical_builds,
        );
        debug!(task = %self.task, order = %head, ?can_build, ?stackability, ?decision, "build decision");

        match decision {
            BuildDecision::Order => {
                let baseline_free = ctx.driver.free_construction_slots()?;
                ctx.driver.order_build(&head.structure)?;
                self.phase = BuildPhase::AwaitingSlot {
                    baseline_free,
                    attempts: 0,
                };
                Ok(StepFlow::Continue)
            }
            BuildDecision::PopHead => {
                self.queue.pop_head();
                self.persist(ctx);
                self.phase = BuildPhase::Deciding {
                    forced_critical: false,
                };
                Ok(StepFlow::Continue)
            }
            BuildDecision::DropSecond => {
                if let Some(dropped) = self.queue.drop_second() {
                    warn!(task = %self.task, order = %dropped, "dropping blocked order behind a maxed critical insert");
                }
                self.persist(ctx);
                self.phase = BuildPhase::Deciding {
                    forced_critical: false,
                };
                Ok(StepFlow::Continue)
            }
            BuildDecision::DropHead => {
                warn!(task = %self.task, order = %head, "dropping unsatisfiable build order");
                self.queue.pop_head();
                self.persist(ctx);
                self.phase = BuildPhase::Deciding {
                    forced_critical: false,
                };
                Ok(StepFlow::Continue)
            }
            BuildDecision::InsertCritical(kind) => {
                let structure = match kind {
                    CriticalKind::Storage => ctx.catalog.storage_structure.clone(),
                    CriticalKind::Population => ctx.catalog.population_structure.clone(),
                };
                let level = ctx.driver.building_level(&structure)?;
                let critical = BuildOrder::new(structure, level + 1);
                debug!(task = %self.task, order = %critical, "unshifting critical capacity order");
                self.queue.push_front(critical);
                self.persist(ctx);
                self.phase = BuildPhase::Deciding {
                    forced_critical: true,
                };
                Ok(StepFlow::Continue)
            }
            BuildDecision::ResourceWait => {
                let retry_ms = ctx.config.build_retry_interval_ms;
                self.enter_wait(ctx, BuildPhase::ResourceWait, WakeReason::ResourceCheck, retry_ms)
            }
            BuildDecision::SpeedUpWait => {
                if can_build == CanBuild::NotNow && stackability == Stackability::Enough {
                    warn!(task = %self.task, order = %head, "order blocked with resources covered");
                }
                self.enter_wait(
                    ctx,
                    BuildPhase::SpeedUpWait,
                    WakeReason::SpeedUpCheck,
                    SPEED_UP_CHECK_MS,
                )
            }
        }
    }

    /// Queue drained: keep nudging the construction pipeline while anything
    /// is still running, otherwise go fully idle until the user queues work.
    fn finish_queue(&mut self, ctx: &mut LoopCtx<'_>) -> Result<StepFlow, FlowError> {
        self.consecutive_failures = 0;
        let running = ctx.driver.construction_countdown_text()?;
        if running.is_some() {
            return self.enter_wait(
                ctx,
                BuildPhase::SpeedUpWait,
                WakeReason::SpeedUpCheck,
                SPEED_UP_CHECK_MS,
            );
        }
        ctx.release_lock(&self.task);
        self.phase = BuildPhase::Idle;
        Ok(StepFlow::PassEnded)
    }

    /// Release the lock and schedule the next re-evaluation. A countdown
    /// read from the ui that is shorter than the fixed interval governs; the
    /// wake always falls through to a full re-evaluation either way.
    fn enter_wait(
        &mut self,
        ctx: &mut LoopCtx<'_>,
        phase: BuildPhase,
        reason: WakeReason,
        cap_ms: u64,
    ) -> Result<StepFlow, FlowError> {
        let countdown = ctx
            .driver
            .construction_countdown_text()?
            .as_deref()
            .and_then(parse_countdown_ms);
        let delay_ms = countdown.filter(|ms| *ms < cap_ms).unwrap_or(cap_ms);

        ctx.release_lock(&self.task);
        self.consecutive_failures = 0;
        self.timer = Some(ctx.schedule_pass(delay_ms, self.task.clone(), reason));
        self.phase = phase;
        Ok(StepFlow::PassEnded)
    }

    fn fail_pass(&mut self, ctx: &mut LoopCtx<'_>, err: FlowError) {
        warn!(task = %self.task, %err, "building pass failed; rescheduling");
        if ctx.lock.owned_by(&self.task) {
            ctx.release_lock(&self.task);
        }
        self.consecutive_failures += 1;
        if self.consecutive_failures > MAX_CONSECUTIVE_FAILURES {
            warn!(task = %self.task, "building loop giving up until restarted");
            self.phase = BuildPhase::Idle;
            return;
        }
        let backoff = FAILURE_BACKOFF_MS * u64::from(self.consecutive_failures);
        self.timer = Some(ctx.schedule_poll(backoff, self.task.clone(), WakeReason::RetryPass));
        self.phase = BuildPhase::ResourceWait;
    }

    fn persist(&self, ctx: &mut LoopCtx<'_>) {
        ctx.store.save(
            &build_queue_key(&self.settlement),
            &self.queue.to_value(),
        );
    }

    fn persist_to(&self, store: &mut dyn crate::store::StateStore) {
        store.save(&build_queue_key(&self.settlement), &self.queue.to_value());
    }
}

pub fn build_queue_key(settlement: &str) -> String {
    format!("build_queue:{settlement}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn levels(wood: i64, stone: i64, iron: i64, population: i64, capacity: i64) -> ResourceLevels {
        ResourceLevels {
            wood,
            stone,
            iron,
            population,
            store_capacity: capacity,
        }
    }

    #[test]
    fn covered_cost_classifies_as_enough() {
        let cost = ResourceCost {
            wood: 100,
            stone: 100,
            iron: 100,
            population: 2,
        };
        assert_eq!(
            classify_stackability(Some(&cost), &levels(200, 200, 200, 10, 1000), 900, false),
            Stackability::Enough
        );
    }

    #[test]
    fn cost_beyond_usable_capacity_needs_storage() {
        let cost = ResourceCost {
            wood: 950,
            stone: 100,
            iron: 100,
            population: 2,
        };
        // 950 exceeds 90% of the 1000-capacity store.
        assert_eq!(
            classify_stackability(Some(&cost), &levels(0, 0, 0, 10, 1000), 900, false),
            Stackability::NeedStorage
        );
    }

    #[test]
    fn population_shortfall_needs_population() {
        let cost = ResourceCost {
            wood: 100,
            stone: 100,
            iron: 100,
            population: 20,
        };
        assert_eq!(
            classify_stackability(Some(&cost), &levels(200, 200, 200, 5, 1000), 900, false),
            Stackability::NeedPopulation
        );
    }

    #[test]
    fn plain_shortfall_needs_stacking_unless_in_transit() {
        let cost = ResourceCost {
            wood: 500,
            stone: 100,
            iron: 100,
            population: 2,
        };
        let lvl = levels(100, 200, 200, 10, 1000);
        assert_eq!(
            classify_stackability(Some(&cost), &lvl, 900, false),
            Stackability::NeedStacking
        );
        assert_eq!(
            classify_stackability(Some(&cost), &lvl, 900, true),
            Stackability::AlreadyInTransit
        );
    }

    #[test]
    fn missing_cost_is_insufficient_info() {
        assert_eq!(
            classify_stackability(None, &levels(0, 0, 0, 0, 1000), 900, false),
            Stackability::InsufficientInfo
        );
    }

    // -- decision table -----------------------------------------------------

    #[test]
    fn buildable_orders_immediately() {
        assert_eq!(
            decide(CanBuild::Buildable, Stackability::Enough, 1, false, true),
            BuildDecision::Order
        );
    }

    #[test]
    fn maxed_pops_unless_forced_critical() {
        assert_eq!(
            decide(CanBuild::Maxed, Stackability::Enough, 2, false, true),
            BuildDecision::PopHead
        );
        assert_eq!(
            decide(CanBuild::Maxed, Stackability::Enough, 2, true, true),
            BuildDecision::DropSecond
        );
    }

    #[test]
    fn absent_target_drops_only_when_queue_is_otherwise_empty() {
        assert_eq!(
            decide(CanBuild::Absent, Stackability::Enough, 1, false, true),
            BuildDecision::DropHead
        );
        assert_eq!(
            decide(CanBuild::Absent, Stackability::Enough, 3, false, true),
            BuildDecision::ResourceWait
        );
    }

    #[test]
    fn capacity_shortfalls_insert_criticals_when_permitted() {
        assert_eq!(
            decide(CanBuild::NotNow, Stackability::NeedStorage, 1, false, true),
            BuildDecision::InsertCritical(CriticalKind::Storage)
        );
        assert_eq!(
            decide(CanBuild::NotNow, Stackability::NeedPopulation, 1, false, true),
            BuildDecision::InsertCritical(CriticalKind::Population)
        );
        assert_eq!(
            decide(CanBuild::NotNow, Stackability::NeedStorage, 1, false, false),
            BuildDecision::DropHead
        );
        assert_eq!(
            decide(CanBuild::NotNow, Stackability::NeedPopulation, 1, false, false),
            BuildDecision::DropHead
        );
    }

    #[test]
    fn generic_shortfall_waits_for_resources() {
        assert_eq!(
            decide(CanBuild::NotNow, Stackability::NeedStacking, 1, false, true),
            BuildDecision::ResourceWait
        );
    }

    #[test]
    fn in_transit_waits_for_a_speed_up() {
        assert_eq!(
            decide(CanBuild::NotNow, Stackability::AlreadyInTransit, 2, false, true),
            BuildDecision::SpeedUpWait
        );
    }

    #[test]
    fn unreadable_cost_drops_the_order() {
        assert_eq!(
            decide(CanBuild::NotNow, Stackability::InsufficientInfo, 2, false, true),
            BuildDecision::DropHead
        );
    }
}
