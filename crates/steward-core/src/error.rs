//! Error taxonomy shared by the task loops.
//!
//! Transient ui-timing failures are retried at the point of use; what
//! escapes a retry cap becomes a [`FlowError`], caught at the loop's top
//! level (release the lock, warn, retry the cycle). [`StructuralError`]
//! marks broken invariants and is never retried. [`FatalError`] aborts
//! runtime construction.

use std::fmt;

use crate::driver::DriverError;

/// A recoverable per-cycle failure. The owning loop releases the lock and
/// retries or advances its queue; it is never silently swallowed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowError {
    DialogNeverAppeared { target: String, attempts: u32 },
    CooldownNeverAppeared { target: String },
    BuildNotConfirmed { structure: String },
    SwitchFailed { settlement: String },
    UnitsAmountUnsupported { unit: String },
    Driver(DriverError),
}

impl fmt::Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DialogNeverAppeared { target, attempts } => {
                write!(f, "farm dialog for {target} never appeared after {attempts} attempts")
            }
            Self::CooldownNeverAppeared { target } => {
                write!(f, "cooldown indicator for {target} never appeared")
            }
            Self::BuildNotConfirmed { structure } => {
                write!(f, "construction order for {structure} was not confirmed by the slot count")
            }
            Self::SwitchFailed { settlement } => {
                write!(f, "could not switch the active context to {settlement}")
            }
            Self::UnitsAmountUnsupported { unit } => {
                write!(f, "unit-count recruit orders are not supported yet ({unit})")
            }
            Self::Driver(err) => write!(f, "driver: {err}"),
        }
    }
}

impl std::error::Error for FlowError {}

impl From<DriverError> for FlowError {
    fn from(value: DriverError) -> Self {
        Self::Driver(value)
    }
}

/// A broken invariant. Surfaced distinctly so tests can assert these are
/// never hit in normal operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StructuralError {
    UnknownSettlement { name: String },
    UnknownStructure { key: String },
    UnknownUnit { key: String },
    DuplicateActionId { action_id: String },
}

impl fmt::Display for StructuralError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownSettlement { name } => write!(f, "unknown settlement: {name}"),
            Self::UnknownStructure { key } => write!(f, "unknown structure: {key}"),
            Self::UnknownUnit { key } => write!(f, "unknown unit: {key}"),
            Self::DuplicateActionId { action_id } => {
                write!(f, "planned action id already registered: {action_id}")
            }
        }
    }
}

impl std::error::Error for StructuralError {}

/// Startup failure. There is no recovery; the agent fails to initialize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FatalError {
    /// The driver could not find the game surface (no settlements listed).
    NoSettlements,
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSettlements => write!(f, "game surface exposes no settlements"),
        }
    }
}

impl std::error::Error for FatalError {}
