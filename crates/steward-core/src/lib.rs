//! Scheduling and mutual-exclusion core for the steward automation agent.
//!
//! Three autonomous task loops (farming, building, recruiting) share one
//! stateful ui surface — the active settlement view — arbitrated by a FIFO
//! cooperative lock. Each loop is an explicit state machine driven by a
//! single timer queue; waits on the external ui become scheduled re-polls,
//! so the whole system runs against a virtual clock in tests and against a
//! sleeping pump in production.

pub mod building;
pub mod clock;
pub mod ctx;
pub mod driver;
pub mod error;
pub mod farming;
pub mod lock;
pub mod orchestrator;
pub mod queue;
pub mod recruiting;
pub mod runtime;
pub mod scheduler;
pub mod sim;
pub mod stacking;
pub mod store;

pub use ctx::LoopCtx;
pub use driver::{CanBuild, DriverError, FarmTarget, UiDriver};
pub use error::{FatalError, FlowError, StructuralError};
pub use lock::{Acquire, UiLock};
pub use runtime::AgentRuntime;
pub use scheduler::{TimerHandle, Wake, WakeScheduler};
pub use stacking::{NoopStacker, ResourceStacker, StackReport};
pub use store::{MemoryStore, SqliteStateStore, StateStore, StoreError};
