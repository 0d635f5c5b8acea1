//! Recruiting task loop: fill production slots with storage-bounded unit
//! batches, stacking resources from supplier settlements when short.
//!
//! An in-flight guard on the loop prevents re-entrant submission: `confirm`
//! while a cycle is pending (including its resource waits) is a no-op.

use contracts::{RecruitAmount, RecruitOrder, ResourceCost, TaskRef, WakeReason};
use tracing::{debug, warn};

use crate::ctx::LoopCtx;
use crate::error::FlowError;
use crate::queue::RecruitQueue;
use crate::scheduler::TimerHandle;
use crate::stacking::StackReport;

const FAILURE_BACKOFF_MS: u64 = 30_000;
const MAX_CONSECUTIVE_FAILURES: u32 = 6;

/// Largest unit batch one production slot can be filled with before the
/// store caps further stock, never below one unit.
pub fn units_per_batch(unit_cost: &ResourceCost, store_capacity: i64) -> i64 {
    let bound = unit_cost.max_stock_component();
    if bound <= 0 {
        return 1;
    }
    (store_capacity / bound).max(1)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RecruitPhase {
    Idle,
    AcquiringLock,
    Working,
    ResourceWait,
}

enum StepFlow {
    Continue,
    PassEnded,
}

#[derive(Debug)]
pub struct RecruitingLoop {
    task: TaskRef,
    settlement: String,
    queue: RecruitQueue,
    phase: RecruitPhase,
    timer: Option<TimerHandle>,
    /// A cycle (including its scheduled resource waits) is pending.
    in_flight: bool,
    /// At most one stacking request per pass; a second shortfall in the same
    /// dispatch falls back to a plain retry wait.
    stacked_this_pass: bool,
    consecutive_failures: u32,
}

impl RecruitingLoop {
    pub fn new(settlement: String, queue: RecruitQueue) -> Self {
        let task = TaskRef::Recruiting {
            settlement: settlement.clone(),
        };
        Self {
            task,
            settlement,
            queue,
            phase: RecruitPhase::Idle,
            timer: None,
            in_flight: false,
            stacked_this_pass: false,
            consecutive_failures: 0,
        }
    }

    pub fn task(&self) -> &TaskRef {
        &self.task
    }

    pub fn queue(&self) -> &RecruitQueue {
        &self.queue
    }

    pub fn is_idle(&self) -> bool {
        self.phase == RecruitPhase::Idle
    }

    pub fn phase_label(&self) -> &'static str {
        match self.phase {
            RecruitPhase::Idle => "idle",
            RecruitPhase::AcquiringLock => "acquiring-lock",
            RecruitPhase::Working => "working",
            RecruitPhase::ResourceWait => "resource-wait",
        }
    }

    pub fn enqueue(&mut self, order: RecruitOrder, store: &mut dyn crate::store::StateStore) {
        self.queue.push(order);
        self.persist_to(store);
    }

    pub fn remove_order(
        &mut self,
        index: usize,
        store: &mut dyn crate::store::StateStore,
    ) -> Option<RecruitOrder> {
        let removed = self.queue.remove_at(index);
        if removed.is_some() {
            self.persist_to(store);
        }
        removed
    }

    /// Start a recruitment cycle. No-op while one is already in flight.
    pub fn confirm(&mut self, ctx: &mut LoopCtx<'_>) {
        if self.in_flight {
            debug!(task = %self.task, "recruit cycle already in flight; confirm is a no-op");
            return;
        }
        if self.queue.is_empty() {
            return;
        }
        self.begin_pass(ctx);
    }

    pub fn on_wake(&mut self, ctx: &mut LoopCtx<'_>, reason: WakeReason) {
        match (&self.phase, reason) {
            (RecruitPhase::Idle, WakeReason::Timer) => self.confirm(ctx),
            (
                RecruitPhase::ResourceWait,
                WakeReason::ResourceCheck | WakeReason::Timer | WakeReason::RetryPass,
            ) => {
                if let Some(timer) = self.timer.take() {
                    ctx.scheduler.cancel(timer);
                }
                self.phase = RecruitPhase::AcquiringLock;
                if ctx.acquire_lock(&self.task, &format!("recruiting {}", self.settlement)) {
                    self.run(ctx);
                }
            }
            (RecruitPhase::AcquiringLock, WakeReason::LockGranted) => self.run(ctx),
            (phase, reason) => {
                debug!(task = %self.task, ?phase, ?reason, "ignoring stale recruiting wake");
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
        self.phase = RecruitPhase::Idle;
        self.in_flight = false;
    }

    fn begin_pass(&mut self, ctx: &mut LoopCtx<'_>) {
        self.in_flight = true;
        self.stacked_this_pass = false;
        if let Some(timer) = self.timer.take() {
            ctx.scheduler.cancel(timer);
        }
        self.phase = RecruitPhase::AcquiringLock;
        if ctx.acquire_lock(&self.task, &format!("recruiting {}", self.settlement)) {
            self.run(ctx);
        }
    }

    fn run(&mut self, ctx: &mut LoopCtx<'_>) {
        self.phase = RecruitPhase::Working;
        if let Err(err) = self.switch_context(ctx) {
            self.fail_pass(ctx, err);
            return;
        }
        loop {
            match self.step(ctx) {
                Ok(StepFlow::Continue) => continue,
                Ok(StepFlow::PassEnded) => return,
                Err(err) => {
                    self.fail_pass(ctx, err);
                    return;
                }
            }
        }
    }

    fn switch_context(&mut self, ctx: &mut LoopCtx<'_>) -> Result<(), FlowError> {
        ctx.driver
            .switch_to(&self.settlement)
            .map_err(|_| FlowError::SwitchFailed {
                settlement: self.settlement.clone(),
            })
    }

    fn step(&mut self, ctx: &mut LoopCtx<'_>) -> Result<StepFlow, FlowError> {
        let Some(head) = self.queue.head().cloned() else {
            return Ok(self.end_cycle(ctx));
        };

        let RecruitAmount::Slots { count: slots_left } = head.amount else {
            // Acknowledged extension point, surfaced explicitly and left in
            // the queue untouched.
            warn!(task = %self.task, order = %head, "{}", FlowError::UnitsAmountUnsupported {
                unit: head.unit.clone(),
            });
            return Ok(self.end_cycle(ctx));
        };
        debug_assert!(slots_left > 0, "exhausted orders are popped on decrement");

        let unit_cost = ctx.driver.unit_cost(&head.unit)?;
        let levels = ctx.driver.current_levels()?;
        let batch = units_per_batch(&unit_cost, levels.store_capacity);
        let requirement = unit_cost.scaled(batch);

        // Population shortfall is fatal for the cycle; nothing here can free
        // population.
        if levels.population < requirement.population + ctx.config.min_population_buffer {
            warn!(
                task = %self.task,
                need = requirement.population,
                free = levels.population,
                "population too short to recruit; aborting cycle"
            );
            return Ok(self.end_cycle(ctx));
        }

        // Under 90% of the batch requirement the cycle aborts outright; the
        // scheduled re-check keeps it self-healing.
        if levels.wood * 10 < requirement.wood * 9
            || levels.stone * 10 < requirement.stone * 9
            || levels.iron * 10 < requirement.iron * 9
        {
            warn!(task = %self.task, %requirement, "resources far short of a batch; aborting cycle");
            let retry_ms = ctx.config.build_retry_interval_ms;
            return Ok(self.wait(ctx, retry_ms));
        }

        let missing = requirement.missing_from(&levels);
        if missing.wood > 0 || missing.stone > 0 || missing.iron > 0 {
            if self.stacked_this_pass {
                let retry_ms = ctx.config.build_retry_interval_ms;
                return Ok(self.wait(ctx, retry_ms));
            }
            self.stacked_this_pass = true;
            let suppliers = ctx
                .config
                .suppliers
                .get(&self.settlement)
                .cloned()
                .unwrap_or_default();
            match ctx.stacker.stack(&missing, &self.settlement, &suppliers) {
                StackReport::FullyStacked => return Ok(StepFlow::Continue),
                StackReport::NextShipmentMs(delay_ms) => return Ok(self.wait(ctx, delay_ms)),
            }
        }

        let free_slots = ctx.driver.free_recruit_slots()?;
        if free_slots == 0 {
            let retry_ms = ctx.config.build_retry_interval_ms;
            return Ok(self.wait(ctx, retry_ms));
        }

        ctx.driver.order_recruits(&head.unit, batch as u32)?;
        debug!(task = %self.task, unit = %head.unit, batch, slots_left, "recruited one slot batch");
        self.queue.decrement_head();
        self.persist(ctx);
        Ok(StepFlow::Continue)
    }

    /// Park the cycle until a resource re-check; the in-flight guard stays up.
    fn wait(&mut self, ctx: &mut LoopCtx<'_>, delay_ms: u64) -> StepFlow {
        if ctx.lock.owned_by(&self.task) {
            ctx.release_lock(&self.task);
        }
        self.consecutive_failures = 0;
        self.timer = Some(ctx.schedule_pass(delay_ms, self.task.clone(), WakeReason::ResourceCheck));
        self.phase = RecruitPhase::ResourceWait;
        StepFlow::PassEnded
    }

    fn end_cycle(&mut self, ctx: &mut LoopCtx<'_>) -> StepFlow {
        if ctx.lock.owned_by(&self.task) {
            ctx.release_lock(&self.task);
        }
        self.consecutive_failures = 0;
        self.in_flight = false;
        self.phase = RecruitPhase::Idle;
        StepFlow::PassEnded
    }

    fn fail_pass(&mut self, ctx: &mut LoopCtx<'_>, err: FlowError) {
        warn!(task = %self.task, %err, "recruiting pass failed; rescheduling");
        if ctx.lock.owned_by(&self.task) {
            ctx.release_lock(&self.task);
        }
        self.consecutive_failures += 1;
        if self.consecutive_failures > MAX_CONSECUTIVE_FAILURES {
            warn!(task = %self.task, "recruiting loop giving up until restarted");
            self.phase = RecruitPhase::Idle;
            self.in_flight = false;
            return;
        }
        let backoff = FAILURE_BACKOFF_MS * u64::from(self.consecutive_failures);
        self.timer = Some(ctx.schedule_poll(backoff, self.task.clone(), WakeReason::RetryPass));
        self.phase = RecruitPhase::ResourceWait;
    }

    fn persist(&self, ctx: &mut LoopCtx<'_>) {
        ctx.store
            .save(&recruit_queue_key(&self.settlement), &self.queue.to_value());
    }

    fn persist_to(&self, store: &mut dyn crate::store::StateStore) {
        store.save(&recruit_queue_key(&self.settlement), &self.queue.to_value());
    }
}

pub fn recruit_queue_key(settlement: &str) -> String {
    format!("recruit_queue:{settlement}")
}
