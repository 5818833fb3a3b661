//! Daemon: the long-running process hosting the scheduler loop, the API
//! surface, the reconciler, and the rescore cadence.

pub mod runtime;
pub mod tick;

pub use runtime::{Daemon, scheduler_tick};
pub use tick::{TickConfig, TickState};
