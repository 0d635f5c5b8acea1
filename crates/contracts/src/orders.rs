//! Queue-order-focused contract re-exports.

pub use crate::{BuildOrder, PlannedAction, RecruitAmount, RecruitOrder};
