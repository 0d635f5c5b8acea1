//! v1 cross-boundary contracts for the steward runtime, control api, and persistence.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub mod orders;
pub mod scheduling;

pub const SCHEMA_VERSION_V1: &str = "1.0";

/// Default delay between resource-sufficiency rechecks while a build order
/// waits for resources to accumulate.
pub const DEFAULT_BUILD_RETRY_MS: u64 = 10 * 60 * 1000;

/// Default half-width of the window around a planned action inside which
/// colliding task loops are paused.
pub const DEFAULT_COLLISION_WINDOW_MS: u64 = 25_000;

/// A lock held longer than this is considered wedged and force-released.
pub const LOCK_STALE_AFTER_MS: u64 = 5 * 60 * 1000;

// ---------------------------------------------------------------------------
// Settlements and resources
// ---------------------------------------------------------------------------

/// A player-owned settlement as enumerated from the game at startup. The set
/// is immutable for the lifetime of the runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settlement {
    /// Unique, stable display name; doubles as the settlement id.
    pub name: String,
    /// Reachability group. Settlements sharing a cluster are farmed through a
    /// single representative.
    #[serde(default)]
    pub cluster: Option<String>,
}

impl Settlement {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cluster: None,
        }
    }

}

/// Current stock and capacity as read from the game's resource bar.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceLevels {
    pub wood: i64,
    pub stone: i64,
    pub iron: i64,
    /// Free population capacity.
    pub population: i64,
    pub store_capacity: i64,
}

/// Cost of a single order as read from its confirmation popup.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceCost {
    pub wood: i64,
    pub stone: i64,
    pub iron: i64,
    pub population: i64,
}

impl ResourceCost {
    /// Largest single stockpiled-resource component (population excluded,
    /// since it is capacity rather than stock).
    pub fn max_stock_component(&self) -> i64 {
        self.wood.max(self.stone).max(self.iron)
    }

    pub fn scaled(&self, factor: i64) -> Self {
        Self {
            wood: self.wood.saturating_mul(factor),
            stone: self.stone.saturating_mul(factor),
            iron: self.iron.saturating_mul(factor),
            population: self.population.saturating_mul(factor),
        }
    }

    /// What is still missing from `levels` to cover this cost. All-zero when
    /// the cost is covered.
    pub fn missing_from(&self, levels: &ResourceLevels) -> ResourceCost {
        ResourceCost {
            wood: (self.wood - levels.wood).max(0),
            stone: (self.stone - levels.stone).max(0),
            iron: (self.iron - levels.iron).max(0),
            population: (self.population - levels.population).max(0),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.wood == 0 && self.stone == 0 && self.iron == 0 && self.population == 0
    }
}

impl fmt::Display for ResourceCost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "wood={} stone={} iron={} pop={}",
            self.wood, self.stone, self.iron, self.population
        )
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Enumerated farming cadence tiers selectable from the popup panel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum FarmInterval {
    FiveMinutes,
    TenMinutes,
    FifteenMinutes,
    ThirtyMinutes,
    OneHour,
    TwoHours,
    FourHours,
    EightHours,
}

impl FarmInterval {
    pub const ALL: [FarmInterval; 8] = [
        FarmInterval::FiveMinutes,
        FarmInterval::TenMinutes,
        FarmInterval::FifteenMinutes,
        FarmInterval::ThirtyMinutes,
        FarmInterval::OneHour,
        FarmInterval::TwoHours,
        FarmInterval::FourHours,
        FarmInterval::EightHours,
    ];

    /// Position of this tier within [`FarmInterval::ALL`].
    pub fn tier_index(self) -> usize {
        Self::ALL.iter().position(|tier| *tier == self).unwrap_or(0)
    }

    /// Fallback delay used when no cooldown can be read from the game.
    pub fn default_delay_ms(self) -> u64 {
        let minutes = match self {
            FarmInterval::FiveMinutes => 5,
            FarmInterval::TenMinutes => 10,
            FarmInterval::FifteenMinutes => 15,
            FarmInterval::ThirtyMinutes => 30,
            FarmInterval::OneHour => 60,
            FarmInterval::TwoHours => 120,
            FarmInterval::FourHours => 240,
            FarmInterval::EightHours => 480,
        };
        minutes * 60 * 1000
    }
}

/// Which task loops the user has switched on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManagerFlags {
    pub farming: bool,
    pub building: bool,
    pub recruiting: bool,
}

impl Default for ManagerFlags {
    fn default() -> Self {
        Self {
            farming: true,
            building: true,
            recruiting: false,
        }
    }
}

impl ManagerFlags {
    pub fn enabled(&self, manager: ManagerKind) -> bool {
        match manager {
            ManagerKind::Farming => self.farming,
            ManagerKind::Building => self.building,
            ManagerKind::Recruiting => self.recruiting,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ManagerKind {
    Farming,
    Building,
    Recruiting,
}

impl ManagerKind {
    pub const ALL: [ManagerKind; 3] = [
        ManagerKind::Farming,
        ManagerKind::Building,
        ManagerKind::Recruiting,
    ];
}

/// Read-only configuration snapshot consumed by the runtime. Mutated only
/// through the control api, which re-applies it as a whole.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    pub schema_version: String,
    pub seed: u64,
    pub farm_interval: FarmInterval,
    /// Add a small deterministic jitter to scheduled delays so cadence does
    /// not look machine-regular.
    pub humanize: bool,
    pub managers: ManagerFlags,
    /// Free population that must remain after a recruit batch.
    pub min_population_buffer: i64,
    /// Store fill fraction (per mille) above which the store counts as
    /// almost full.
    pub store_almost_full_permille: u32,
    /// Whether the building loop may auto-insert storage/population orders to
    /// unblock a stalled build.
    pub allow_critical_builds: bool,
    pub build_retry_interval_ms: u64,
    pub collision_window_ms: u64,
    /// Settlements allowed to ship resources to the keyed settlement when the
    /// recruiting loop runs short.
    #[serde(default)]
    pub suppliers: BTreeMap<String, Vec<String>>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            seed: 1337,
            farm_interval: FarmInterval::TenMinutes,
            humanize: true,
            managers: ManagerFlags::default(),
            min_population_buffer: 10,
            store_almost_full_permille: 900,
            allow_critical_builds: true,
            build_retry_interval_ms: DEFAULT_BUILD_RETRY_MS,
            collision_window_ms: DEFAULT_COLLISION_WINDOW_MS,
            suppliers: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Game catalog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StructureDef {
    pub key: String,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnitDef {
    pub key: String,
    pub label: String,
}

/// Identity tables for the structures and units the loops may be asked to
/// manage. Costs are never tabulated here; they are always read from the
/// live confirmation popup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GameCatalog {
    pub structures: Vec<StructureDef>,
    pub units: Vec<UnitDef>,
    /// Structure whose upgrade raises store capacity.
    pub storage_structure: String,
    /// Structure whose upgrade raises population capacity.
    pub population_structure: String,
}

impl GameCatalog {
    pub fn structure(&self, key: &str) -> Option<&StructureDef> {
        self.structures.iter().find(|def| def.key == key)
    }

    pub fn unit(&self, key: &str) -> Option<&UnitDef> {
        self.units.iter().find(|def| def.key == key)
    }

    pub fn default_catalog() -> Self {
        let structure = |key: &str, label: &str| StructureDef {
            key: key.to_string(),
            label: label.to_string(),
        };
        let unit = |key: &str, label: &str| UnitDef {
            key: key.to_string(),
            label: label.to_string(),
        };

        Self {
            structures: vec![
                structure("headquarters", "Headquarters"),
                structure("timber_camp", "Timber Camp"),
                structure("clay_pit", "Clay Pit"),
                structure("iron_mine", "Iron Mine"),
                structure("storehouse", "Storehouse"),
                structure("farm", "Farm"),
                structure("barracks", "Barracks"),
                structure("wall", "Wall"),
                structure("market", "Market"),
            ],
            units: vec![
                unit("spearman", "Spearman"),
                unit("swordsman", "Swordsman"),
                unit("archer", "Archer"),
                unit("scout", "Scout"),
            ],
            storage_structure: "storehouse".to_string(),
            population_structure: "farm".to_string(),
        }
    }
}

impl Default for GameCatalog {
    fn default() -> Self {
        Self::default_catalog()
    }
}

// ---------------------------------------------------------------------------
// Queue orders
// ---------------------------------------------------------------------------

/// One construction order: raise `structure` to `target_level`. Levels are
/// always queued as current + n, so removing an earlier order of the same
/// structure shifts every later target down by one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildOrder {
    pub structure: String,
    pub target_level: i64,
}

impl BuildOrder {
    pub fn new(structure: impl Into<String>, target_level: i64) -> Self {
        Self {
            structure: structure.into(),
            target_level,
        }
    }

    /// Derived identity; regenerated whenever the target level is reindexed.
    pub fn order_id(&self) -> String {
        format!("{}:{}", self.structure, self.target_level)
    }
}

impl fmt::Display for BuildOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> level {}", self.structure, self.target_level)
    }
}

/// How a recruit order sizes its batches.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecruitAmount {
    /// Fill n free production slots, one storage-bounded batch per slot.
    Slots { count: u32 },
    /// Recruit a fixed headcount. Acknowledged extension point; the loop
    /// surfaces a typed not-yet-supported error for this variant.
    Units { count: u32 },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecruitOrder {
    pub unit: String,
    pub amount: RecruitAmount,
}

impl RecruitOrder {
    pub fn slots(unit: impl Into<String>, count: u32) -> Self {
        Self {
            unit: unit.into(),
            amount: RecruitAmount::Slots { count },
        }
    }
}

impl fmt::Display for RecruitOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.amount {
            RecruitAmount::Slots { count } => write!(f, "{} x {} slots", self.unit, count),
            RecruitAmount::Units { count } => write!(f, "{} x {} units", self.unit, count),
        }
    }
}

// ---------------------------------------------------------------------------
// Planned one-off actions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionPayload {
    Attack,
    Support,
    Shipment { wood: i64, stone: i64, iron: i64 },
}

/// A user-registered one-time action at a fixed wall-clock time. Consumed by
/// the orchestrator to pause colliding loops; destroyed after firing or
/// cancellation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlannedAction {
    pub action_id: String,
    pub settlement: String,
    pub target: String,
    pub fire_at_ms: u64,
    pub payload: ActionPayload,
}

// ---------------------------------------------------------------------------
// Scheduling surface
// ---------------------------------------------------------------------------

/// Identity of a schedulable task inside the runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum TaskRef {
    Farming { settlement: String },
    Building { settlement: String },
    Recruiting { settlement: String },
    PlannedAction { action_id: String },
    LockWatchdog,
}

impl TaskRef {
    pub fn manager(&self) -> Option<ManagerKind> {
        match self {
            TaskRef::Farming { .. } => Some(ManagerKind::Farming),
            TaskRef::Building { .. } => Some(ManagerKind::Building),
            TaskRef::Recruiting { .. } => Some(ManagerKind::Recruiting),
            TaskRef::PlannedAction { .. } | TaskRef::LockWatchdog => None,
        }
    }
}

impl fmt::Display for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskRef::Farming { settlement } => write!(f, "farming:{settlement}"),
            TaskRef::Building { settlement } => write!(f, "building:{settlement}"),
            TaskRef::Recruiting { settlement } => write!(f, "recruiting:{settlement}"),
            TaskRef::PlannedAction { action_id } => write!(f, "action:{action_id}"),
            TaskRef::LockWatchdog => write!(f, "lock-watchdog"),
        }
    }
}

/// Why a task was woken.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WakeReason {
    /// A previously computed delay elapsed.
    Timer,
    /// The ui lock was handed to this task.
    LockGranted,
    /// A failed pass is being retried from the top.
    RetryPass,
    /// Bounded poll for a ui condition (dialog, cooldown, slot count).
    Poll,
    /// Re-evaluate resource sufficiency.
    ResourceCheck,
    /// Check whether a speed-up or free slot opened.
    SpeedUpCheck,
    /// Periodic stale-lock check.
    Watchdog,
    /// A planned one-off action reached its fire time.
    ActionDue,
}

// ---------------------------------------------------------------------------
// Status snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockStatus {
    pub held: bool,
    pub holder: Option<String>,
    pub held_for_ms: Option<u64>,
    pub waiters: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoopStatus {
    pub task: TaskRef,
    pub phase: String,
    pub enabled: bool,
    pub paused_by_orchestrator: bool,
    pub next_wake_ms: Option<u64>,
    pub queue_depth: usize,
}

/// Operator-facing snapshot of the whole runtime, served by the control api.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeStatus {
    pub schema_version: String,
    pub now_ms: u64,
    pub lock: LockStatus,
    pub loops: Vec<LoopStatus>,
    pub planned_actions: usize,
}

impl fmt::Display for RuntimeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "now={} lock_held={} loops={} planned_actions={}",
            self.now_ms,
            self.lock.held,
            self.loops.len(),
            self.planned_actions
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn farm_interval_tier_indexes_are_dense() {
        for (expected, tier) in FarmInterval::ALL.iter().enumerate() {
            assert_eq!(tier.tier_index(), expected);
        }
    }

    #[test]
    fn build_order_id_tracks_target_level() {
        let mut order = BuildOrder::new("farm", 7);
        assert_eq!(order.order_id(), "farm:7");
        order.target_level -= 1;
        assert_eq!(order.order_id(), "farm:6");
    }

    #[test]
    fn recruit_amount_round_trips_through_json() {
        let order = RecruitOrder::slots("spearman", 5);
        let raw = serde_json::to_string(&order).expect("serialize");
        let decoded: RecruitOrder = serde_json::from_str(&raw).expect("deserialize");
        assert_eq!(order, decoded);
    }

    #[test]
    fn default_catalog_names_its_critical_structures() {
        let catalog = GameCatalog::default_catalog();
        assert!(catalog.structure(&catalog.storage_structure).is_some());
        assert!(catalog.structure(&catalog.population_structure).is_some());
    }

    #[test]
    fn missing_from_is_zero_when_covered() {
        let cost = ResourceCost {
            wood: 100,
            stone: 50,
            iron: 25,
            population: 4,
        };
        let levels = ResourceLevels {
            wood: 200,
            stone: 50,
            iron: 30,
            population: 10,
            store_capacity: 1000,
        };
        assert!(cost.missing_from(&levels).is_zero());

        let short = ResourceLevels { wood: 90, ..levels };
        let missing = cost.missing_from(&short);
        assert_eq!(missing.wood, 10);
        assert_eq!(missing.stone, 0);
    }
}
