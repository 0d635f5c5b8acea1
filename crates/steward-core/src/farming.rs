//! Farming task loop: harvest nearby weak settlements, then reschedule from
//! the cooldown the game reports.
//!
//! One loop instance runs per cluster representative; the other settlements
//! in the cluster are covered by it and get no loop of their own. A pass
//! holds the ui lock from context switch to the last dialog close.

use contracts::{FarmInterval, TaskRef, WakeReason};
use tracing::{debug, warn};

use crate::clock::parse_countdown_ms;
use crate::ctx::LoopCtx;
use crate::driver::FarmTarget;
use crate::error::FlowError;
use crate::scheduler::TimerHandle;

const DIALOG_ATTEMPT_LIMIT: u32 = 5;
const DIALOG_POLL_MS: u64 = 700;
const COOLDOWN_ATTEMPT_LIMIT: u32 = 6;
const COOLDOWN_POLL_MS: u64 = 500;
const FAILURE_BACKOFF_MS: u64 = 15_000;
const MAX_CONSECUTIVE_FAILURES: u32 = 6;

/// Map the configured cadence tier onto the dialog's available option count.
/// The game offers either the full eight tiers or a collapsed set of four;
/// a collapsed set maps each tier to the closest faster option. The result
/// is always within `[0, option_count)`.
pub fn option_index_for(interval: FarmInterval, option_count: usize) -> usize {
    if option_count == 0 {
        return 0;
    }
    let scaled = interval.tier_index() * option_count / FarmInterval::ALL.len();
    scaled.min(option_count - 1)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FarmPhase {
    Idle,
    AcquiringLock,
    SwitchingContext,
    EnumeratingTargets,
    OpeningDialog { target_index: usize, attempts: u32 },
    SelectingOption { target_index: usize },
    AwaitingCooldown { target_index: usize, attempts: u32 },
    ComputingDelay,
    Scheduled,
}

enum StepFlow {
    Continue,
    Sleep { delay_ms: u64 },
    PassEnded,
}

#[derive(Debug)]
pub struct FarmingLoop {
    task: TaskRef,
    settlement: String,
    /// Cluster members this representative covers (itself included).
    covers: Vec<String>,
    phase: FarmPhase,
    targets: Vec<FarmTarget>,
    timer: Option<TimerHandle>,
    consecutive_failures: u32,
}

impl FarmingLoop {
    pub fn new(settlement: String, covers: Vec<String>) -> Self {
        let task = TaskRef::Farming {
            settlement: settlement.clone(),
        };
        Self {
            task,
            settlement,
            covers,
            phase: FarmPhase::Idle,
            targets: Vec::new(),
            timer: None,
            consecutive_failures: 0,
        }
    }

    pub fn task(&self) -> &TaskRef {
        &self.task
    }

    pub fn covers(&self) -> &[String] {
        &self.covers
    }

    /// Record another cluster member this representative farms for.
    pub fn push_covered(&mut self, settlement: String) {
        if !self.covers.contains(&settlement) {
            self.covers.push(settlement);
        }
    }

    pub fn phase_label(&self) -> &'static str {
        match self.phase {
            FarmPhase::Idle => "idle",
            FarmPhase::AcquiringLock => "acquiring-lock",
            FarmPhase::SwitchingContext => "switching-context",
            FarmPhase::EnumeratingTargets => "enumerating-targets",
            FarmPhase::OpeningDialog { .. } => "opening-dialog",
            FarmPhase::SelectingOption { .. } => "selecting-option",
            FarmPhase::AwaitingCooldown { .. } => "awaiting-cooldown",
            FarmPhase::ComputingDelay => "computing-delay",
            FarmPhase::Scheduled => "scheduled",
        }
    }

    pub fn is_idle(&self) -> bool {
        self.phase == FarmPhase::Idle
    }

    pub fn on_wake(&mut self, ctx: &mut LoopCtx<'_>, reason: WakeReason) {
        match (&self.phase, reason) {
            (
                FarmPhase::Idle | FarmPhase::Scheduled,
                WakeReason::Timer | WakeReason::RetryPass,
            ) => {
                if let Some(timer) = self.timer.take() {
                    ctx.scheduler.cancel(timer);
                }
                self.phase = FarmPhase::AcquiringLock;
                if ctx.acquire_lock(&self.task, &format!("farming {}", self.settlement)) {
                    self.run(ctx);
                }
            }
            (FarmPhase::AcquiringLock, WakeReason::LockGranted) => self.run(ctx),
            (
                FarmPhase::OpeningDialog { .. } | FarmPhase::AwaitingCooldown { .. },
                WakeReason::Poll,
            ) => self.run(ctx),
            (phase, reason) => {
                debug!(task = %self.task, ?phase, ?reason, "ignoring stale farming wake");
            }
        }
    }

    /// Stop the loop: clear pending timers and, if a pass is mid-flight,
    /// hand the lock back. Idempotent; an in-flight awaited ui action past
    /// its wait point cannot be interrupted.
    pub fn stop(&mut self, ctx: &mut LoopCtx<'_>) {
        if let Some(timer) = self.timer.take() {
            ctx.scheduler.cancel(timer);
        }
        ctx.scheduler.cancel_task(&self.task);
        if ctx.lock.owned_by(&self.task) {
            let _ = ctx.driver.close_farm_dialog();
            ctx.release_lock(&self.task);
        }
        self.phase = FarmPhase::Idle;
        self.targets.clear();
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
            FarmPhase::AcquiringLock => {
                self.phase = FarmPhase::SwitchingContext;
                Ok(StepFlow::Continue)
            }
            FarmPhase::SwitchingContext => {
                ctx.driver
                    .switch_to(&self.settlement)
                    .map_err(|_| FlowError::SwitchFailed {
                        settlement: self.settlement.clone(),
                    })?;
                self.phase = FarmPhase::EnumeratingTargets;
                Ok(StepFlow::Continue)
            }
            FarmPhase::EnumeratingTargets => {
                self.targets = ctx.driver.farm_targets()?;
                if self.targets.is_empty() {
                    // Nothing reachable: idle until externally restarted.
                    ctx.release_lock(&self.task);
                    self.phase = FarmPhase::Idle;
                    self.consecutive_failures = 0;
                    return Ok(StepFlow::PassEnded);
                }
                self.phase = FarmPhase::OpeningDialog {
                    target_index: 0,
                    attempts: 0,
                };
                Ok(StepFlow::Continue)
            }
            FarmPhase::OpeningDialog {
                target_index,
                attempts,
            } => {
                let target = self.targets[target_index].target_id.clone();
                if ctx.driver.open_farm_dialog(&target)? {
                    self.phase = FarmPhase::SelectingOption { target_index };
                    return Ok(StepFlow::Continue);
                }
                let attempts = attempts + 1;
                if attempts >= DIALOG_ATTEMPT_LIMIT {
                    return Err(FlowError::DialogNeverAppeared { target, attempts });
                }
                self.phase = FarmPhase::OpeningDialog {
                    target_index,
                    attempts,
                };
                Ok(StepFlow::Sleep {
                    delay_ms: DIALOG_POLL_MS,
                })
            }
            FarmPhase::SelectingOption { target_index } => {
                let option_count = ctx.driver.farm_option_count()?;
                let index = option_index_for(ctx.config.farm_interval, option_count);
                ctx.driver.choose_farm_option(index)?;
                self.phase = FarmPhase::AwaitingCooldown {
                    target_index,
                    attempts: 0,
                };
                Ok(StepFlow::Continue)
            }
            FarmPhase::AwaitingCooldown {
                target_index,
                attempts,
            } => {
                let target = self.targets[target_index].target_id.clone();
                if ctx.driver.cooldown_text(&target)?.is_some() {
                    ctx.driver.close_farm_dialog()?;
                    self.phase = if target_index + 1 < self.targets.len() {
                        FarmPhase::OpeningDialog {
                            target_index: target_index + 1,
                            attempts: 0,
                        }
                    } else {
                        FarmPhase::ComputingDelay
                    };
                    return Ok(StepFlow::Continue);
                }
                let attempts = attempts + 1;
                if attempts >= COOLDOWN_ATTEMPT_LIMIT {
                    return Err(FlowError::CooldownNeverAppeared { target });
                }
                self.phase = FarmPhase::AwaitingCooldown {
                    target_index,
                    attempts,
                };
                Ok(StepFlow::Sleep {
                    delay_ms: COOLDOWN_POLL_MS,
                })
            }
            FarmPhase::ComputingDelay => {
                let last = self
                    .targets
                    .last()
                    .map(|target| target.target_id.clone())
                    .unwrap_or_default();
                let delay_ms = ctx
                    .driver
                    .cooldown_text(&last)?
                    .as_deref()
                    .and_then(parse_countdown_ms)
                    .unwrap_or_else(|| ctx.config.farm_interval.default_delay_ms());

                ctx.release_lock(&self.task);
                self.consecutive_failures = 0;
                self.timer = Some(ctx.schedule_pass(delay_ms, self.task.clone(), WakeReason::Timer));
                self.phase = FarmPhase::Scheduled;
                Ok(StepFlow::PassEnded)
            }
            FarmPhase::Idle | FarmPhase::Scheduled => Ok(StepFlow::PassEnded),
        }
    }

    /// A pass died mid-flight: hand the lock back, close whatever is open,
    /// and retry the whole flow. Backoff grows with consecutive failures so
    /// a persistently broken ui cannot produce a tight loop.
    fn fail_pass(&mut self, ctx: &mut LoopCtx<'_>, err: FlowError) {
        warn!(task = %self.task, %err, "farming pass failed; retrying from the top");
        let _ = ctx.driver.close_farm_dialog();
        if ctx.lock.owned_by(&self.task) {
            ctx.release_lock(&self.task);
        }
        self.targets.clear();
        self.consecutive_failures += 1;
        if self.consecutive_failures > MAX_CONSECUTIVE_FAILURES {
            warn!(task = %self.task, "farming loop giving up until restarted");
            self.phase = FarmPhase::Idle;
            return;
        }
        let backoff = FAILURE_BACKOFF_MS * u64::from(self.consecutive_failures);
        self.timer = Some(ctx.schedule_poll(backoff, self.task.clone(), WakeReason::RetryPass));
        self.phase = FarmPhase::Scheduled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_option_set_maps_tier_index_directly() {
        for tier in FarmInterval::ALL {
            assert_eq!(option_index_for(tier, 8), tier.tier_index());
        }
    }

    #[test]
    fn collapsed_option_set_picks_the_closest_faster_tier() {
        assert_eq!(option_index_for(FarmInterval::FiveMinutes, 4), 0);
        assert_eq!(option_index_for(FarmInterval::TenMinutes, 4), 0);
        assert_eq!(option_index_for(FarmInterval::FifteenMinutes, 4), 1);
        assert_eq!(option_index_for(FarmInterval::ThirtyMinutes, 4), 1);
        assert_eq!(option_index_for(FarmInterval::OneHour, 4), 2);
        assert_eq!(option_index_for(FarmInterval::EightHours, 4), 3);
    }

    #[test]
    fn every_tier_maps_in_range_for_both_option_counts() {
        for tier in FarmInterval::ALL {
            for count in [4usize, 8] {
                let index = option_index_for(tier, count);
                assert!(index < count, "tier {tier:?} count {count} -> {index}");
            }
        }
    }
}
