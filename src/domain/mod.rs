//! Domain types for Spinq
//!
//! This module contains the core entities:
//! - Request: the central record with identity, lifecycle state, priority
//!   inputs, and provider bookkeeping
//! - RequestState: the closed lifecycle enum with the single authoritative
//!   transition guard
//! - User: submitter identity, tier, reputation, rate-limit counters
//! - Channel: a queue partition with its own priority weights

pub mod channel;
pub mod request;
pub mod user;

pub use channel::{Channel, PriorityWeights};
pub use request::{Request, RequestState};
pub use user::{Tier, User};
