//! The swappable ui-automation boundary.
//!
//! The loops only ever talk to the game through these traits: a settlement
//! registry, a resource oracle, and the game surface proper. A concrete
//! driver wraps whatever automation layer reaches the real game; the
//! [`crate::sim::SimulatedDriver`] backs tests and offline runs.
//!
//! Every operation is a single synchronous probe or action that either
//! succeeds, reports "not there yet" (`bool`/`Option` returns), or fails
//! with a [`DriverError`]. Waiting is not the driver's job — the loops
//! schedule their own bounded re-polls.

use std::fmt;

use contracts::{PlannedAction, ResourceCost, ResourceLevels, Settlement};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// A required element is not present in the ui at all.
    ElementMissing { what: String },
    /// Switching the active settlement did not complete.
    Navigation { settlement: String },
    /// The game surface itself is gone (page navigated away, session ended).
    SurfaceLost,
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ElementMissing { what } => write!(f, "ui element missing: {what}"),
            Self::Navigation { settlement } => {
                write!(f, "navigation to {settlement} did not complete")
            }
            Self::SurfaceLost => write!(f, "game surface lost"),
        }
    }
}

impl std::error::Error for DriverError {}

/// A weaker settlement reachable for harvesting from the active settlement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FarmTarget {
    pub target_id: String,
    pub name: String,
}

/// What the ui offers for a structure's next upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanBuild {
    /// Upgrade action present and enabled.
    Buildable,
    /// No further level purchasable.
    Maxed,
    /// The structure's row/element is absent entirely.
    Absent,
    /// Present but currently disabled (resources, slots); evaluate the
    /// popup cost to find out why.
    NotNow,
}

/// Enumerates the player's settlements and switches the active ui context.
/// The settlement set is read once at startup and never changes.
pub trait SettlementRegistry {
    fn list(&self) -> Vec<Settlement>;
    fn current(&self) -> Option<String>;
    fn switch_to(&mut self, settlement: &str) -> Result<(), DriverError>;
}

/// Reads the resource bar of the active settlement. May race with concurrent
/// ui changes; callers re-validate after waits.
pub trait ResourceOracle {
    fn current_levels(&mut self) -> Result<ResourceLevels, DriverError>;
}

/// Game-surface operations against the active settlement.
pub trait GameSurface {
    // -- farming --------------------------------------------------------

    /// Reachable weak settlements in the active settlement's vicinity, in
    /// fixed ui order.
    fn farm_targets(&mut self) -> Result<Vec<FarmTarget>, DriverError>;
    /// Try to open the harvest dialog. `false` means it has not appeared
    /// yet; the caller re-polls under its own retry cap.
    fn open_farm_dialog(&mut self, target: &str) -> Result<bool, DriverError>;
    /// Number of harvest-duration options the open dialog offers.
    fn farm_option_count(&mut self) -> Result<usize, DriverError>;
    fn choose_farm_option(&mut self, index: usize) -> Result<(), DriverError>;
    /// Countdown text of the target's cooldown indicator, if visible.
    fn cooldown_text(&mut self, target: &str) -> Result<Option<String>, DriverError>;
    fn close_farm_dialog(&mut self) -> Result<(), DriverError>;

    // -- building -------------------------------------------------------

    fn building_level(&mut self, structure: &str) -> Result<i64, DriverError>;
    fn classify_build(&mut self, structure: &str) -> Result<CanBuild, DriverError>;
    /// Cost popup for the structure's next level; `None` when the popup
    /// yields nothing readable.
    fn build_cost(&mut self, structure: &str) -> Result<Option<ResourceCost>, DriverError>;
    fn order_build(&mut self, structure: &str) -> Result<(), DriverError>;
    fn free_construction_slots(&mut self) -> Result<u32, DriverError>;
    /// Countdown text of the first running construction order, if any.
    fn construction_countdown_text(&mut self) -> Result<Option<String>, DriverError>;
    fn free_speed_up_available(&mut self) -> Result<bool, DriverError>;
    fn apply_speed_up(&mut self) -> Result<(), DriverError>;
    /// Whether a resource shipment towards the active settlement is already
    /// underway.
    fn has_incoming_shipment(&mut self) -> Result<bool, DriverError>;

    // -- recruiting -----------------------------------------------------

    fn unit_cost(&mut self, unit: &str) -> Result<ResourceCost, DriverError>;
    fn free_recruit_slots(&mut self) -> Result<u32, DriverError>;
    fn order_recruits(&mut self, unit: &str, count: u32) -> Result<(), DriverError>;

    // -- planned actions ------------------------------------------------

    fn execute_action(&mut self, action: &PlannedAction) -> Result<(), DriverError>;
}

/// The full driver the runtime is constructed with.
pub trait UiDriver: SettlementRegistry + ResourceOracle + GameSurface {}

impl<T: SettlementRegistry + ResourceOracle + GameSurface> UiDriver for T {}
