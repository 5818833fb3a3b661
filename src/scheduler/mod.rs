//! Scheduler module: request prioritization, admission, and selection.
//!
//! This module provides:
//! - **Priority engine**: the pure scoring function (base, reputation,
//!   votes, tier, wait, fairness) plus the periodic rescore batch.
//! - **Admission**: the per-user rate-limit gate applied at submission.
//! - **Selection**: per-tick top-K pick with diversity exclusions and
//!   jittered tie-breaking.
//!
//! The tick loop itself lives in `daemon`; everything here is pure or
//! store-backed and unit-testable without the runtime.

pub mod admission;
pub mod priority;
pub mod select;

pub use admission::{AdmissionConfig, AdmissionDecision, DenialReason, admit};
pub use priority::{fairness_boost, rescore_all, rescore_channel, score, wait_bonus};
pub use select::{SelectionConfig, eligible_candidates, pick_with_jitter, select_candidate};
