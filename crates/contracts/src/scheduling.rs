//! Scheduling-focused contract re-exports.

pub use crate::{LockStatus, LoopStatus, RuntimeStatus, TaskRef, WakeReason};
