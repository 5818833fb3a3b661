//! HTTP surface: submission intake, moderation verdicts, vote events,
//! broadcast acknowledgements, and the provider webhook.
//!
//! Everything user-facing beyond these endpoints (chat, dashboards,
//! players) lives in other services; this is the machine-to-machine edge
//! of the core.

pub mod intake;
pub mod webhook;

use std::sync::{Arc, Mutex};

use axum::Router;
use axum::routing::{get, post};

use crate::moderation::ModerationGate;
use crate::orchestrator::GenerationOrchestrator;
use crate::scheduler::AdmissionConfig;
use crate::store::Store;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<Mutex<Store>>,
    pub gate: Arc<ModerationGate>,
    pub orchestrator: Arc<GenerationOrchestrator>,
    pub admission: AdmissionConfig,
    pub reputation_min: i32,
    pub reputation_max: i32,
    pub webhook_secret: String,
}

/// Build the API router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(intake::health))
        .route("/requests", post(intake::submit))
        .route("/requests/{id}", get(intake::get_request))
        .route("/requests/{id}/verdict", post(intake::verdict))
        .route("/requests/{id}/vote", post(intake::vote))
        .route("/requests/{id}/cancel", post(intake::cancel))
        .route("/requests/{id}/broadcast", post(intake::broadcast_started))
        .route("/requests/{id}/played", post(intake::played))
        .route("/webhooks/generation", post(webhook::receive))
        .with_state(state)
}
