//! Spinq - request queue scheduler and generation orchestrator
//!
//! Spinq takes listener prompts for an external generative-audio provider,
//! moderates them, schedules them fairly across users and channels, drives
//! the provider's asynchronous job to completion despite unreliable
//! callbacks, and hands each finished artifact to the broadcast pipeline
//! exactly once.

pub mod config;
pub mod daemon;
pub mod domain;
pub mod error;
pub mod http;
pub mod id;
pub mod moderation;
pub mod orchestrator;
pub mod provider;
pub mod reconciler;
pub mod resilience;
pub mod scheduler;
pub mod store;
pub mod submission;

pub use error::{Result, SpinqError};
