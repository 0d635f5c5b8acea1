//! Deterministic in-memory rendition of the game surface.
//!
//! Backs the integration tests and the cli `simulate` command. Resources
//! accrue linearly with time, construction orders complete instantly but
//! leave a countdown text behind, and every performed operation lands in a
//! journal the tests assert against.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use contracts::{PlannedAction, ResourceCost, ResourceLevels, Settlement};

use crate::clock::{MS_PER_MINUTE, MS_PER_SECOND};
use crate::driver::{
    CanBuild, DriverError, FarmTarget, GameSurface, ResourceOracle, SettlementRegistry,
};

const SIM_MAX_LEVEL: i64 = 30;

fn wall_now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

fn format_countdown(ms: u64) -> String {
    let total_seconds = ms / MS_PER_SECOND;
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes}:{seconds:02}")
    }
}

#[derive(Debug, Clone)]
pub struct SimSettlement {
    pub settlement: Settlement,
    pub levels: ResourceLevels,
    /// Wood/stone/iron accrued per minute; the population field is unused.
    pub production_per_minute: ResourceCost,
    pub buildings: BTreeMap<String, i64>,
    pub free_construction_slots: u32,
    pub construction_countdown: Option<String>,
    pub speed_up_available: bool,
    pub farm_targets: Vec<FarmTarget>,
    pub free_recruit_slots: u32,
    pub incoming_shipment: bool,
    /// Per farm target: how many dialog-open attempts report "not yet".
    pub dialog_delay_attempts: BTreeMap<String, u32>,
    cooldown_until: BTreeMap<String, u64>,
}

impl SimSettlement {
    pub fn new(name: impl Into<String>) -> Self {
        let buildings = [
            ("headquarters", 3),
            ("timber_camp", 2),
            ("clay_pit", 2),
            ("iron_mine", 2),
            ("storehouse", 2),
            ("farm", 2),
            ("barracks", 1),
            ("market", 1),
        ]
        .into_iter()
        .map(|(key, level)| (key.to_string(), level))
        .collect();

        Self {
            settlement: Settlement::new(name),
            levels: ResourceLevels {
                wood: 500,
                stone: 500,
                iron: 400,
                population: 50,
                store_capacity: 2000,
            },
            production_per_minute: ResourceCost {
                wood: 60,
                stone: 60,
                iron: 40,
                population: 0,
            },
            buildings,
            free_construction_slots: 2,
            construction_countdown: None,
            speed_up_available: false,
            farm_targets: Vec::new(),
            free_recruit_slots: 2,
            incoming_shipment: false,
            dialog_delay_attempts: BTreeMap::new(),
            cooldown_until: BTreeMap::new(),
        }
    }

    pub fn with_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.settlement.cluster = Some(cluster.into());
        self
    }

    pub fn with_farm_targets(mut self, names: &[&str]) -> Self {
        self.farm_targets = names
            .iter()
            .map(|name| FarmTarget {
                target_id: name.to_string(),
                name: name.to_string(),
            })
            .collect();
        self
    }

    pub fn with_levels(mut self, levels: ResourceLevels) -> Self {
        self.levels = levels;
        self
    }

}

#[derive(Debug)]
pub struct SimWorld {
    now_ms: u64,
    last_accrual_ms: u64,
    settlements: Vec<SimSettlement>,
    active: Option<String>,
    open_dialog: Option<String>,
    pub farm_option_count: usize,
    pub farm_cooldown_ms: u64,
    unit_costs: BTreeMap<String, ResourceCost>,
    build_cost_base: BTreeMap<String, ResourceCost>,
    journal: Vec<String>,
    wall_clock: bool,
}

impl SimWorld {
    pub fn new(settlements: Vec<SimSettlement>) -> Self {
        let unit_costs = [
            ("spearman", ResourceCost { wood: 50, stone: 30, iron: 10, population: 1 }),
            ("swordsman", ResourceCost { wood: 30, stone: 30, iron: 70, population: 1 }),
            ("archer", ResourceCost { wood: 60, stone: 30, iron: 40, population: 1 }),
            ("scout", ResourceCost { wood: 50, stone: 50, iron: 20, population: 2 }),
        ]
        .into_iter()
        .map(|(key, cost)| (key.to_string(), cost))
        .collect();

        let build_cost_base = [
            ("headquarters", ResourceCost { wood: 90, stone: 80, iron: 70, population: 3 }),
            ("timber_camp", ResourceCost { wood: 50, stone: 60, iron: 40, population: 2 }),
            ("clay_pit", ResourceCost { wood: 65, stone: 50, iron: 40, population: 2 }),
            ("iron_mine", ResourceCost { wood: 75, stone: 65, iron: 70, population: 2 }),
            ("storehouse", ResourceCost { wood: 60, stone: 50, iron: 40, population: 1 }),
            ("farm", ResourceCost { wood: 45, stone: 40, iron: 30, population: 0 }),
            ("barracks", ResourceCost { wood: 200, stone: 170, iron: 90, population: 4 }),
            ("wall", ResourceCost { wood: 50, stone: 100, iron: 20, population: 1 }),
            ("market", ResourceCost { wood: 100, stone: 100, iron: 100, population: 3 }),
        ]
        .into_iter()
        .map(|(key, cost)| (key.to_string(), cost))
        .collect();

        Self {
            now_ms: 0,
            last_accrual_ms: 0,
            settlements,
            active: None,
            open_dialog: None,
            farm_option_count: 8,
            farm_cooldown_ms: 10 * MS_PER_MINUTE,
            unit_costs,
            build_cost_base,
            journal: Vec::new(),
            wall_clock: false,
        }
    }

    /// Follow the host clock instead of an externally driven one; used by
    /// the live serve mode. Snaps the accrual baseline to now.
    pub fn enable_wall_clock(&mut self) {
        self.wall_clock = true;
        let now = wall_now_ms();
        self.now_ms = now;
        self.last_accrual_ms = now;
    }

    fn sync_wall_clock(&mut self) {
        if self.wall_clock {
            self.set_now(wall_now_ms());
        }
    }

    /// Advance sim time, accruing production for the elapsed interval.
    pub fn set_now(&mut self, now_ms: u64) {
        if now_ms <= self.last_accrual_ms {
            self.now_ms = self.now_ms.max(now_ms);
            return;
        }
        let delta = now_ms - self.last_accrual_ms;
        for settlement in &mut self.settlements {
            let cap = settlement.levels.store_capacity;
            let produced = |per_minute: i64| per_minute.saturating_mul(delta as i64) / 60_000;
            settlement.levels.wood =
                (settlement.levels.wood + produced(settlement.production_per_minute.wood)).min(cap);
            settlement.levels.stone = (settlement.levels.stone
                + produced(settlement.production_per_minute.stone))
            .min(cap);
            settlement.levels.iron =
                (settlement.levels.iron + produced(settlement.production_per_minute.iron)).min(cap);
        }
        self.last_accrual_ms = now_ms;
        self.now_ms = now_ms;
    }

    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    pub fn journal(&self) -> &[String] {
        &self.journal
    }

    pub fn journal_contains(&self, needle: &str) -> bool {
        self.journal.iter().any(|entry| entry.contains(needle))
    }

    pub fn settlement(&self, name: &str) -> Option<&SimSettlement> {
        self.settlements
            .iter()
            .find(|entry| entry.settlement.name == name)
    }

    pub fn settlement_mut(&mut self, name: &str) -> Option<&mut SimSettlement> {
        self.settlements
            .iter_mut()
            .find(|entry| entry.settlement.name == name)
    }

    fn build_cost_for(&self, structure: &str, next_level: i64) -> ResourceCost {
        self.build_cost_base
            .get(structure)
            .map(|base| base.scaled(next_level.max(1)))
            .unwrap_or_default()
    }

    fn active_mut(&mut self) -> Result<&mut SimSettlement, DriverError> {
        let name = self.active.clone().ok_or(DriverError::ElementMissing {
            what: "active settlement".to_string(),
        })?;
        self.settlements
            .iter_mut()
            .find(|entry| entry.settlement.name == name)
            .ok_or(DriverError::SurfaceLost)
    }
}

pub type SimHandle = Arc<Mutex<SimWorld>>;

/// Driver facade over a shared [`SimWorld`]. Tests keep the handle to
/// advance time, tweak the world mid-run, and read the journal.
#[derive(Debug, Clone)]
pub struct SimulatedDriver {
    world: SimHandle,
}

impl SimulatedDriver {
    pub fn new(world: SimWorld) -> (Self, SimHandle) {
        let handle: SimHandle = Arc::new(Mutex::new(world));
        (
            Self {
                world: Arc::clone(&handle),
            },
            handle,
        )
    }

    fn world(&self) -> MutexGuard<'_, SimWorld> {
        let mut guard = self
            .world
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.sync_wall_clock();
        guard
    }
}

impl SettlementRegistry for SimulatedDriver {
    fn list(&self) -> Vec<Settlement> {
        self.world()
            .settlements
            .iter()
            .map(|entry| entry.settlement.clone())
            .collect()
    }

    fn current(&self) -> Option<String> {
        self.world().active.clone()
    }

    fn switch_to(&mut self, settlement: &str) -> Result<(), DriverError> {
        let mut world = self.world();
        if world.settlement(settlement).is_none() {
            return Err(DriverError::Navigation {
                settlement: settlement.to_string(),
            });
        }
        world.active = Some(settlement.to_string());
        world.journal.push(format!("switch:{settlement}"));
        Ok(())
    }
}

impl ResourceOracle for SimulatedDriver {
    fn current_levels(&mut self) -> Result<ResourceLevels, DriverError> {
        Ok(self.world().active_mut()?.levels)
    }
}

impl GameSurface for SimulatedDriver {
    fn farm_targets(&mut self) -> Result<Vec<FarmTarget>, DriverError> {
        Ok(self.world().active_mut()?.farm_targets.clone())
    }

    fn open_farm_dialog(&mut self, target: &str) -> Result<bool, DriverError> {
        let mut world = self.world();
        let active = world.active_mut()?;
        if !active.farm_targets.iter().any(|t| t.target_id == target) {
            return Err(DriverError::ElementMissing {
                what: format!("farm target {target}"),
            });
        }
        if let Some(remaining) = active.dialog_delay_attempts.get_mut(target) {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(false);
            }
        }
        world.open_dialog = Some(target.to_string());
        world.journal.push(format!("dialog:{target}"));
        Ok(true)
    }

    fn farm_option_count(&mut self) -> Result<usize, DriverError> {
        let world = self.world();
        if world.open_dialog.is_none() {
            return Err(DriverError::ElementMissing {
                what: "farm dialog".to_string(),
            });
        }
        Ok(world.farm_option_count)
    }

    fn choose_farm_option(&mut self, index: usize) -> Result<(), DriverError> {
        let mut world = self.world();
        let target = world.open_dialog.clone().ok_or(DriverError::ElementMissing {
            what: "farm dialog".to_string(),
        })?;
        if index >= world.farm_option_count {
            return Err(DriverError::ElementMissing {
                what: format!("farm option {index}"),
            });
        }
        let now = world.now_ms;
        let cooldown = world.farm_cooldown_ms;
        world
            .active_mut()?
            .cooldown_until
            .insert(target.clone(), now + cooldown);
        world.journal.push(format!("farm:{target}:option{index}"));
        Ok(())
    }

    fn cooldown_text(&mut self, target: &str) -> Result<Option<String>, DriverError> {
        let mut world = self.world();
        let now = world.now_ms;
        let until = world.active_mut()?.cooldown_until.get(target).copied();
        Ok(until
            .filter(|until| *until > now)
            .map(|until| format_countdown(until - now)))
    }

    fn close_farm_dialog(&mut self) -> Result<(), DriverError> {
        self.world().open_dialog = None;
        Ok(())
    }

    fn building_level(&mut self, structure: &str) -> Result<i64, DriverError> {
        let mut world = self.world();
        Ok(world
            .active_mut()?
            .buildings
            .get(structure)
            .copied()
            .unwrap_or(0))
    }

    fn classify_build(&mut self, structure: &str) -> Result<CanBuild, DriverError> {
        let mut world = self.world();
        let active = world.active_mut()?;
        let Some(level) = active.buildings.get(structure).copied() else {
            return Ok(CanBuild::Absent);
        };
        if level >= SIM_MAX_LEVEL {
            return Ok(CanBuild::Maxed);
        }
        let slots = active.free_construction_slots;
        let levels = active.levels;
        let cost = world.build_cost_for(structure, level + 1);
        if slots == 0 || !cost.missing_from(&levels).is_zero() {
            return Ok(CanBuild::NotNow);
        }
        Ok(CanBuild::Buildable)
    }

    fn build_cost(&mut self, structure: &str) -> Result<Option<ResourceCost>, DriverError> {
        let mut world = self.world();
        let level = world
            .active_mut()?
            .buildings
            .get(structure)
            .copied()
            .unwrap_or(0);
        Ok(Some(world.build_cost_for(structure, level + 1)))
    }

    fn order_build(&mut self, structure: &str) -> Result<(), DriverError> {
        let mut world = self.world();
        let name = world.active.clone().unwrap_or_default();
        let level = world
            .active_mut()?
            .buildings
            .get(structure)
            .copied()
            .unwrap_or(0);
        let cost = world.build_cost_for(structure, level + 1);
        let active = world.active_mut()?;
        if active.free_construction_slots == 0 || !cost.missing_from(&active.levels).is_zero() {
            return Err(DriverError::ElementMissing {
                what: format!("enabled build action for {structure}"),
            });
        }
        active.levels.wood -= cost.wood;
        active.levels.stone -= cost.stone;
        active.levels.iron -= cost.iron;
        active.levels.population -= cost.population;
        active.free_construction_slots -= 1;
        active.construction_countdown = Some("5:00".to_string());
        let new_level = level + 1;
        active.buildings.insert(structure.to_string(), new_level);
        world
            .journal
            .push(format!("build:{name}:{structure}:{new_level}"));
        Ok(())
    }

    fn free_construction_slots(&mut self) -> Result<u32, DriverError> {
        Ok(self.world().active_mut()?.free_construction_slots)
    }

    fn construction_countdown_text(&mut self) -> Result<Option<String>, DriverError> {
        Ok(self.world().active_mut()?.construction_countdown.clone())
    }

    fn free_speed_up_available(&mut self) -> Result<bool, DriverError> {
        Ok(self.world().active_mut()?.speed_up_available)
    }

    fn apply_speed_up(&mut self) -> Result<(), DriverError> {
        let mut world = self.world();
        let name = world.active.clone().unwrap_or_default();
        let active = world.active_mut()?;
        if !active.speed_up_available {
            return Err(DriverError::ElementMissing {
                what: "speed-up action".to_string(),
            });
        }
        active.speed_up_available = false;
        active.free_construction_slots += 1;
        active.construction_countdown = None;
        world.journal.push(format!("speed_up:{name}"));
        Ok(())
    }

    fn has_incoming_shipment(&mut self) -> Result<bool, DriverError> {
        Ok(self.world().active_mut()?.incoming_shipment)
    }

    fn unit_cost(&mut self, unit: &str) -> Result<ResourceCost, DriverError> {
        self.world()
            .unit_costs
            .get(unit)
            .copied()
            .ok_or(DriverError::ElementMissing {
                what: format!("unit {unit}"),
            })
    }

    fn free_recruit_slots(&mut self) -> Result<u32, DriverError> {
        Ok(self.world().active_mut()?.free_recruit_slots)
    }

    fn order_recruits(&mut self, unit: &str, count: u32) -> Result<(), DriverError> {
        let mut world = self.world();
        let name = world.active.clone().unwrap_or_default();
        let cost = world
            .unit_costs
            .get(unit)
            .copied()
            .ok_or(DriverError::ElementMissing {
                what: format!("unit {unit}"),
            })?
            .scaled(i64::from(count));
        let active = world.active_mut()?;
        if !cost.missing_from(&active.levels).is_zero() {
            return Err(DriverError::ElementMissing {
                what: format!("enabled recruit action for {unit}"),
            });
        }
        active.levels.wood -= cost.wood;
        active.levels.stone -= cost.stone;
        active.levels.iron -= cost.iron;
        active.levels.population -= cost.population;
        active.free_recruit_slots = active.free_recruit_slots.saturating_sub(1);
        world.journal.push(format!("recruit:{name}:{unit}:{count}"));
        Ok(())
    }

    fn execute_action(&mut self, action: &PlannedAction) -> Result<(), DriverError> {
        self.world().journal.push(format!(
            "action:{}:{}:{}",
            action.action_id, action.settlement, action.target
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn production_accrues_with_time_and_caps_at_capacity() {
        let mut world = SimWorld::new(vec![SimSettlement::new("north")]);
        world.set_now(10 * MS_PER_MINUTE);
        let levels = world.settlement("north").map(|s| s.levels).unwrap_or_default();
        assert_eq!(levels.wood, 500 + 600);
        assert_eq!(levels.iron, 400 + 400);

        world.set_now(120 * MS_PER_MINUTE);
        let levels = world.settlement("north").map(|s| s.levels).unwrap_or_default();
        assert_eq!(levels.wood, 2000);
    }

    #[test]
    fn harvest_sets_a_readable_cooldown() {
        let world = SimWorld::new(vec![
            SimSettlement::new("north").with_farm_targets(&["ruin_a"])
        ]);
        let (mut driver, handle) = SimulatedDriver::new(world);

        driver.switch_to("north").expect("switch");
        assert!(driver.open_farm_dialog("ruin_a").expect("open"));
        driver.choose_farm_option(1).expect("choose");
        let text = driver.cooldown_text("ruin_a").expect("read");
        assert_eq!(text.as_deref(), Some("10:00"));

        handle
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .set_now(11 * MS_PER_MINUTE);
        assert_eq!(driver.cooldown_text("ruin_a").expect("read"), None);
    }

    #[test]
    fn ordering_a_build_consumes_a_slot_and_resources() {
        let world = SimWorld::new(vec![SimSettlement::new("north")]);
        let (mut driver, handle) = SimulatedDriver::new(world);
        driver.switch_to("north").expect("switch");

        assert_eq!(driver.classify_build("farm").expect("classify"), CanBuild::Buildable);
        let before = driver.free_construction_slots().expect("slots");
        driver.order_build("farm").expect("order");
        assert_eq!(driver.free_construction_slots().expect("slots"), before - 1);
        assert_eq!(driver.building_level("farm").expect("level"), 3);
        assert!(handle
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .journal_contains("build:north:farm:3"));
    }

    #[test]
    fn unknown_structure_is_absent() {
        let world = SimWorld::new(vec![SimSettlement::new("north")]);
        let (mut driver, _handle) = SimulatedDriver::new(world);
        driver.switch_to("north").expect("switch");
        assert_eq!(
            driver.classify_build("ziggurat").expect("classify"),
            CanBuild::Absent
        );
    }
}
