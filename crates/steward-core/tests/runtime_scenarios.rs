//! End-to-end scenarios: a full runtime against the simulated game surface,
//! pumped on a virtual clock.

use contracts::{
    ActionPayload, AgentConfig, BuildOrder, FarmInterval, ManagerFlags, ManagerKind,
    PlannedAction, RecruitAmount, RecruitOrder, ResourceLevels, TaskRef,
};
use steward_core::runtime::AgentRuntime;
use steward_core::sim::{SimHandle, SimSettlement, SimWorld, SimulatedDriver};
use steward_core::stacking::NoopStacker;
use steward_core::store::MemoryStore;

const MINUTE: u64 = 60_000;

fn test_config(managers: ManagerFlags) -> AgentConfig {
    AgentConfig {
        seed: 7,
        humanize: false,
        farm_interval: FarmInterval::TenMinutes,
        managers,
        ..AgentConfig::default()
    }
}

fn runtime_with(settlements: Vec<SimSettlement>, config: AgentConfig) -> (AgentRuntime, SimHandle) {
    let (driver, handle) = SimulatedDriver::new(SimWorld::new(settlements));
    let retry = config.build_retry_interval_ms;
    let runtime = AgentRuntime::new(
        config,
        contracts::GameCatalog::default_catalog(),
        Box::new(driver),
        Box::new(MemoryStore::new()),
        Box::new(NoopStacker::new(retry)),
        0,
    )
    .expect("runtime should initialize");
    (runtime, handle)
}

fn sim_set_now(handle: &SimHandle, now_ms: u64) {
    handle
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .set_now(now_ms);
}

fn journal_count(handle: &SimHandle, needle: &str) -> usize {
    handle
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .journal()
        .iter()
        .filter(|entry| entry.contains(needle))
        .count()
}

/// Pump the runtime to `target_ms`, keeping the simulated clock in step with
/// each dispatched deadline.
fn pump_to(runtime: &mut AgentRuntime, handle: &SimHandle, target_ms: u64) {
    while let Some(due) = runtime.next_due() {
        if due > target_ms {
            break;
        }
        sim_set_now(handle, due);
        runtime.run_due(due);
    }
    sim_set_now(handle, target_ms);
}

fn farming_only() -> ManagerFlags {
    ManagerFlags {
        farming: true,
        building: false,
        recruiting: false,
    }
}

fn building_only() -> ManagerFlags {
    ManagerFlags {
        farming: false,
        building: true,
        recruiting: false,
    }
}

fn recruiting_only() -> ManagerFlags {
    ManagerFlags {
        farming: false,
        building: false,
        recruiting: true,
    }
}

// -- scenario 1: cluster dedup ---------------------------------------------

#[test]
fn clustered_settlements_are_farmed_through_one_representative() {
    let settlements = vec![
        SimSettlement::new("north")
            .with_cluster("isle")
            .with_farm_targets(&["ruin_a", "ruin_b"]),
        SimSettlement::new("south")
            .with_cluster("isle")
            .with_farm_targets(&["ruin_c"]),
    ];
    let (mut runtime, handle) = runtime_with(settlements, test_config(farming_only()));

    pump_to(&mut runtime, &handle, 2 * MINUTE);

    // Only the representative was processed.
    assert!(journal_count(&handle, "switch:north") >= 1);
    assert_eq!(journal_count(&handle, "switch:south"), 0);
    assert!(journal_count(&handle, "farm:ruin_a") >= 1);
    assert!(journal_count(&handle, "farm:ruin_b") >= 1);

    // Exactly one farming loop exists, covering both settlements, and only
    // it has a schedule entry.
    let status = runtime.status(2 * MINUTE);
    let farming: Vec<_> = status
        .loops
        .iter()
        .filter(|entry| matches!(entry.task, TaskRef::Farming { .. }))
        .collect();
    assert_eq!(farming.len(), 1);
    assert_eq!(farming[0].queue_depth, 2);
    assert!(farming[0].next_wake_ms.is_some());
}

#[test]
fn farming_reschedules_from_the_reported_cooldown() {
    let settlements = vec![SimSettlement::new("north").with_farm_targets(&["ruin_a"])];
    let (mut runtime, handle) = runtime_with(settlements, test_config(farming_only()));

    pump_to(&mut runtime, &handle, 2 * MINUTE);
    assert_eq!(journal_count(&handle, "farm:ruin_a"), 1);

    // The sim reports a 10 minute cooldown; the next pass lands after it.
    pump_to(&mut runtime, &handle, 13 * MINUTE);
    assert_eq!(journal_count(&handle, "farm:ruin_a"), 2);
}

#[test]
fn farm_dialog_retries_survive_a_slow_dialog() {
    let mut north = SimSettlement::new("north").with_farm_targets(&["ruin_a"]);
    north.dialog_delay_attempts.insert("ruin_a".to_string(), 2);
    let (mut runtime, handle) = runtime_with(vec![north], test_config(farming_only()));

    pump_to(&mut runtime, &handle, 2 * MINUTE);
    assert_eq!(journal_count(&handle, "farm:ruin_a"), 1);
}

#[test]
fn farming_pass_fails_and_heals_when_the_dialog_never_opens() {
    let mut north = SimSettlement::new("north").with_farm_targets(&["ruin_a"]);
    // Enough refusals to kill the first pass entirely, then recover.
    north.dialog_delay_attempts.insert("ruin_a".to_string(), 7);
    let (mut runtime, handle) = runtime_with(vec![north], test_config(farming_only()));

    pump_to(&mut runtime, &handle, 5 * MINUTE);
    assert_eq!(journal_count(&handle, "farm:ruin_a"), 1);
}

// -- scenario 2: critical storage insert ------------------------------------

#[test]
fn storage_blocked_build_unshifts_a_storage_order() {
    let north = SimSettlement::new("north").with_levels(ResourceLevels {
        wood: 150,
        stone: 150,
        iron: 150,
        population: 50,
        store_capacity: 200,
    });
    let (mut runtime, handle) = runtime_with(vec![north], test_config(building_only()));

    // Barracks level 2 costs far more than the store can hold.
    runtime
        .queue_build("north", BuildOrder::new("barracks", 2), 0)
        .expect("queue build");
    runtime.run_due(0);

    let queue = runtime.build_queue("north").expect("queue exists");
    assert_eq!(
        queue.orders(),
        &[
            BuildOrder::new("storehouse", 3),
            BuildOrder::new("barracks", 2)
        ]
    );
    let _ = handle;
}

#[test]
fn buildable_order_is_built_and_popped() {
    let (mut runtime, handle) = runtime_with(
        vec![SimSettlement::new("north")],
        test_config(building_only()),
    );

    runtime
        .queue_build("north", BuildOrder::new("timber_camp", 3), 0)
        .expect("queue build");
    runtime.run_due(0);

    assert_eq!(journal_count(&handle, "build:north:timber_camp:3"), 1);
    assert!(runtime.build_queue("north").expect("queue").is_empty());
}

#[test]
fn speed_up_wait_applies_a_free_speed_up() {
    let (mut runtime, handle) = runtime_with(
        vec![SimSettlement::new("north")],
        test_config(building_only()),
    );
    runtime
        .queue_build("north", BuildOrder::new("timber_camp", 3), 0)
        .expect("queue build");
    runtime.run_due(0);
    assert_eq!(journal_count(&handle, "build:north:timber_camp:3"), 1);

    // A free speed-up appears while the loop sits in its speed-up wait.
    handle
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .settlement_mut("north")
        .expect("settlement")
        .speed_up_available = true;

    pump_to(&mut runtime, &handle, 10 * MINUTE);
    assert_eq!(journal_count(&handle, "speed_up:north"), 1);
}

#[test]
fn critical_insert_is_disabled_by_config() {
    let north = SimSettlement::new("north").with_levels(ResourceLevels {
        wood: 150,
        stone: 150,
        iron: 150,
        population: 50,
        store_capacity: 200,
    });
    let mut config = test_config(building_only());
    config.allow_critical_builds = false;
    let (mut runtime, _handle) = runtime_with(vec![north], config);

    runtime
        .queue_build("north", BuildOrder::new("barracks", 2), 0)
        .expect("queue build");
    runtime.run_due(0);

    // Without the critical remedy the unsatisfiable order is dropped.
    assert!(runtime.build_queue("north").expect("queue").is_empty());
}

// -- scenario 3: slot-based recruiting --------------------------------------

#[test]
fn fill_five_slots_recruits_five_batches_then_pops() {
    let mut north = SimSettlement::new("north").with_levels(ResourceLevels {
        wood: 500,
        stone: 500,
        iron: 400,
        population: 100,
        store_capacity: 500,
    });
    north.free_recruit_slots = 5;
    let (mut runtime, handle) = runtime_with(vec![north], test_config(recruiting_only()));

    runtime
        .queue_recruit("north", RecruitOrder::slots("spearman", 5), 0)
        .expect("queue recruit");
    pump_to(&mut runtime, &handle, 70 * MINUTE);

    // One storage-bounded batch per slot: 500 capacity / 50 wood = 10 units.
    assert_eq!(journal_count(&handle, "recruit:north:spearman:10"), 5);
    assert!(runtime.recruit_queue("north").expect("queue").is_empty());
}

#[test]
fn unit_count_orders_surface_as_unsupported_and_stay_queued() {
    let (mut runtime, _handle) = runtime_with(
        vec![SimSettlement::new("north")],
        test_config(recruiting_only()),
    );

    runtime
        .queue_recruit(
            "north",
            RecruitOrder {
                unit: "spearman".to_string(),
                amount: RecruitAmount::Units { count: 30 },
            },
            0,
        )
        .expect("queue recruit");
    runtime.run_due(0);

    let queue = runtime.recruit_queue("north").expect("queue");
    assert_eq!(queue.len(), 1);
    let status = runtime.status(0);
    let recruiting = status
        .loops
        .iter()
        .find(|entry| matches!(entry.task, TaskRef::Recruiting { .. }))
        .expect("recruiting loop");
    assert_eq!(recruiting.phase, "idle");
}

#[test]
fn population_shortfall_aborts_the_recruit_cycle() {
    let mut north = SimSettlement::new("north").with_levels(ResourceLevels {
        wood: 500,
        stone: 500,
        iron: 400,
        population: 5,
        store_capacity: 500,
    });
    north.free_recruit_slots = 5;
    let (mut runtime, handle) = runtime_with(vec![north], test_config(recruiting_only()));

    runtime
        .queue_recruit("north", RecruitOrder::slots("spearman", 5), 0)
        .expect("queue recruit");
    pump_to(&mut runtime, &handle, 30 * MINUTE);

    assert_eq!(journal_count(&handle, "recruit:"), 0);
    assert_eq!(runtime.recruit_queue("north").expect("queue").len(), 1);
}

// -- orchestrator and planned actions ---------------------------------------

#[test]
fn planned_action_pauses_colliding_loops_and_resumes_them() {
    let settlements = vec![SimSettlement::new("north").with_farm_targets(&["ruin_a"])];
    let (mut runtime, handle) = runtime_with(settlements, test_config(farming_only()));

    // Let the first farming pass run; the next one is scheduled ~10 minutes
    // out (cooldown).
    pump_to(&mut runtime, &handle, 2 * MINUTE);
    let status = runtime.status(2 * MINUTE);
    let farm_wake = status.loops[0].next_wake_ms.expect("farming scheduled");

    let action = PlannedAction {
        action_id: "strike-1".to_string(),
        settlement: "north".to_string(),
        target: "enemy_keep".to_string(),
        fire_at_ms: farm_wake + 10_000,
        payload: ActionPayload::Attack,
    };
    runtime
        .register_action(action, 2 * MINUTE)
        .expect("register action");

    let status = runtime.status(2 * MINUTE);
    assert!(status.loops[0].paused_by_orchestrator);
    assert_eq!(status.loops[0].next_wake_ms, None);
    assert_eq!(status.planned_actions, 1);

    // The action fires, executes through the driver, and the loop resumes.
    pump_to(&mut runtime, &handle, farm_wake + 60_000);
    assert_eq!(journal_count(&handle, "action:strike-1"), 1);
    let status = runtime.status(farm_wake + 60_000);
    assert!(!status.loops[0].paused_by_orchestrator);
    assert_eq!(status.planned_actions, 0);
    assert!(status.loops[0].next_wake_ms.is_some());

    // The resumed loop eventually farms again.
    pump_to(&mut runtime, &handle, farm_wake + 15 * MINUTE);
    assert!(journal_count(&handle, "farm:ruin_a") >= 2);
}

#[test]
fn user_disable_wins_over_orchestrator_resume() {
    let settlements = vec![SimSettlement::new("north").with_farm_targets(&["ruin_a"])];
    let (mut runtime, handle) = runtime_with(settlements, test_config(farming_only()));

    pump_to(&mut runtime, &handle, 2 * MINUTE);
    let farm_wake = runtime.status(2 * MINUTE).loops[0]
        .next_wake_ms
        .expect("farming scheduled");

    runtime
        .register_action(
            PlannedAction {
                action_id: "strike-2".to_string(),
                settlement: "north".to_string(),
                target: "enemy_keep".to_string(),
                fire_at_ms: farm_wake,
                payload: ActionPayload::Support,
            },
            2 * MINUTE,
        )
        .expect("register action");

    // The user disables farming while it is paused around the action.
    runtime.set_manager_flags(
        ManagerFlags {
            farming: false,
            building: false,
            recruiting: false,
        },
        3 * MINUTE,
    );

    pump_to(&mut runtime, &handle, farm_wake + 30 * MINUTE);
    assert_eq!(journal_count(&handle, "action:strike-2"), 1);
    // Farming was not resumed behind the user's back.
    let status = runtime.status(farm_wake + 30 * MINUTE);
    assert!(!status.loops[0].enabled);
    assert_eq!(status.loops[0].next_wake_ms, None);
    assert_eq!(journal_count(&handle, "farm:ruin_a"), 1);
}

#[test]
fn cancelled_action_resumes_paused_loops_without_firing() {
    let settlements = vec![SimSettlement::new("north").with_farm_targets(&["ruin_a"])];
    let (mut runtime, handle) = runtime_with(settlements, test_config(farming_only()));

    pump_to(&mut runtime, &handle, 2 * MINUTE);
    let farm_wake = runtime.status(2 * MINUTE).loops[0]
        .next_wake_ms
        .expect("farming scheduled");

    runtime
        .register_action(
            PlannedAction {
                action_id: "strike-3".to_string(),
                settlement: "north".to_string(),
                target: "enemy_keep".to_string(),
                fire_at_ms: farm_wake,
                payload: ActionPayload::Attack,
            },
            2 * MINUTE,
        )
        .expect("register action");
    assert!(runtime.cancel_action("strike-3", 3 * MINUTE));

    pump_to(&mut runtime, &handle, farm_wake + 15 * MINUTE);
    assert_eq!(journal_count(&handle, "action:strike-3"), 0);
    // The loop got its schedule back and farmed again.
    assert!(journal_count(&handle, "farm:ruin_a") >= 2);
}

#[test]
fn duplicate_action_ids_are_rejected() {
    let (mut runtime, _handle) = runtime_with(
        vec![SimSettlement::new("north")],
        test_config(farming_only()),
    );
    let action = PlannedAction {
        action_id: "strike-4".to_string(),
        settlement: "north".to_string(),
        target: "enemy_keep".to_string(),
        fire_at_ms: MINUTE,
        payload: ActionPayload::Attack,
    };
    runtime
        .register_action(action.clone(), 0)
        .expect("first registration");
    assert!(runtime.register_action(action, 0).is_err());
}

// -- lifecycle ---------------------------------------------------------------

#[test]
fn disabling_a_manager_twice_leaves_the_same_state() {
    let settlements = vec![SimSettlement::new("north").with_farm_targets(&["ruin_a"])];
    let (mut runtime, handle) = runtime_with(settlements, test_config(farming_only()));
    pump_to(&mut runtime, &handle, 2 * MINUTE);

    let off = ManagerFlags {
        farming: false,
        building: false,
        recruiting: false,
    };
    runtime.set_manager_flags(off, 2 * MINUTE);
    let first = runtime.status(2 * MINUTE);
    runtime.set_manager_flags(off, 2 * MINUTE);
    let second = runtime.status(2 * MINUTE);

    assert_eq!(first, second);
    assert_eq!(first.loops[0].next_wake_ms, None);
    assert_eq!(first.loops[0].phase, "idle");
}

#[test]
fn startup_with_no_settlements_is_fatal() {
    let (driver, _handle) = SimulatedDriver::new(SimWorld::new(Vec::new()));
    let config = test_config(farming_only());
    let retry = config.build_retry_interval_ms;
    let result = AgentRuntime::new(
        config,
        contracts::GameCatalog::default_catalog(),
        Box::new(driver),
        Box::new(MemoryStore::new()),
        Box::new(NoopStacker::new(retry)),
        0,
    );
    assert!(result.is_err());
}

#[test]
fn persisted_queues_are_reloaded_and_unknown_ids_dropped() {
    use steward_core::store::{SqliteStateStore, StateStore};

    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("time should be monotonic")
        .as_nanos();
    let path = std::env::temp_dir().join(format!("steward_reload_{nanos}.sqlite"));

    {
        let mut store = SqliteStateStore::open(&path).expect("open store");
        store.save(
            "build_queue:north",
            &serde_json::json!([
                {"structure": "farm", "target_level": 4},
                {"structure": "ziggurat", "target_level": 2}
            ]),
        );
        let (driver, _handle) = SimulatedDriver::new(SimWorld::new(vec![SimSettlement::new(
            "north",
        )]));
        let config = test_config(ManagerFlags {
            farming: false,
            building: false,
            recruiting: false,
        });
        let retry = config.build_retry_interval_ms;
        let runtime = AgentRuntime::new(
            config,
            contracts::GameCatalog::default_catalog(),
            Box::new(driver),
            Box::new(store),
            Box::new(NoopStacker::new(retry)),
            0,
        )
        .expect("runtime");

        let queue = runtime.build_queue("north").expect("queue");
        assert_eq!(queue.orders(), &[BuildOrder::new("farm", 4)]);
    }

    let _ = std::fs::remove_file(&path);
    let _ = std::fs::remove_file(path.with_extension("sqlite-wal"));
    let _ = std::fs::remove_file(path.with_extension("sqlite-shm"));
}

#[test]
fn manager_enablement_is_reflected_in_status() {
    let (runtime, _handle) = runtime_with(
        vec![SimSettlement::new("north")],
        test_config(building_only()),
    );
    let status = runtime.status(0);
    for entry in &status.loops {
        let expected = entry.task.manager() == Some(ManagerKind::Building);
        assert_eq!(entry.enabled, expected, "task {}", entry.task);
    }
}
