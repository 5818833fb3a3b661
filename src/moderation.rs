//! Moderation gate.
//!
//! Records the external classifier's verdict against a request and either
//! unblocks it (approved -> queued, with its initial priority stamped) or
//! terminates it (rejected). `needs_review` holds the request in
//! moderating for a human, who later resolves it with one of the same two
//! outcomes. A classifier transport failure maps to `needs_review` —
//! never a silent approve, never a silent reject. No retries happen here.

use std::sync::{Arc, Mutex};

use eyre::Result;
use serde::{Deserialize, Serialize};

use crate::domain::RequestState;
use crate::error::SpinqError;
use crate::id::{now_ms, today};
use crate::scheduler::priority;
use crate::store::Store;

/// A moderation verdict.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approved,
    Rejected,
    NeedsReview,
}

impl Verdict {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Approved => "approved",
            Verdict::Rejected => "rejected",
            Verdict::NeedsReview => "needs_review",
        }
    }

    /// Parse from the string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "approved" => Some(Verdict::Approved),
            "rejected" => Some(Verdict::Rejected),
            "needs_review" => Some(Verdict::NeedsReview),
            _ => None,
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Moderation state holder.
pub struct ModerationGate {
    store: Arc<Mutex<Store>>,
}

impl ModerationGate {
    /// Create a gate over the shared store.
    pub fn new(store: Arc<Mutex<Store>>) -> Self {
        Self { store }
    }

    /// Move a freshly admitted request into moderation.
    pub fn begin(&self, request_id: &str) -> Result<()> {
        let mut store = self.store.lock().unwrap();
        let mut request = store
            .get_request(request_id)?
            .ok_or_else(|| SpinqError::RequestNotFound(request_id.to_string()))?;

        request.transition(RequestState::Moderating)?;
        store.save_request(&request)?;

        tracing::debug!(request.id = %request_id, "Request entered moderation");
        Ok(())
    }

    /// Apply a verdict to a request in moderation.
    ///
    /// Returns the resulting lifecycle state.
    pub fn resolve(&self, request_id: &str, verdict: Verdict, reason: Option<&str>) -> Result<RequestState> {
        let mut store = self.store.lock().unwrap();
        let mut request = store
            .get_request(request_id)?
            .ok_or_else(|| SpinqError::RequestNotFound(request_id.to_string()))?;

        match verdict {
            Verdict::Approved => {
                let user = store.get_or_create_user(&request.user_id)?;
                let channel = store
                    .get_channel(&request.channel_id)?
                    .ok_or_else(|| SpinqError::ChannelNotFound(request.channel_id.clone()))?;

                request.transition(RequestState::Queued)?;
                request.held_for_review = false;
                request.calculated_priority = priority::score(&request, &user, &channel.weights, now_ms(), &today());
                store.save_request(&request)?;

                tracing::info!(
                    request.id = %request_id,
                    score = request.calculated_priority,
                    "Request approved and queued"
                );
            }
            Verdict::Rejected => {
                request.transition(RequestState::Rejected)?;
                request.failure_reason = reason.map(|r| r.to_string());
                store.save_request(&request)?;

                tracing::info!(
                    request.id = %request_id,
                    reason = reason.unwrap_or("unspecified"),
                    "Request rejected by moderation"
                );
            }
            Verdict::NeedsReview => {
                if request.state != RequestState::Moderating {
                    return Err(SpinqError::InvalidTransition {
                        from: request.state,
                        to: RequestState::Moderating,
                    }
                    .into());
                }
                request.held_for_review = true;
                request.touch();
                store.save_request(&request)?;

                tracing::info!(request.id = %request_id, "Request held for human review");
            }
        }

        Ok(request.state)
    }

    /// Resolve from a classifier call outcome. A classifier error is
    /// treated as `needs_review`.
    pub fn resolve_classifier_outcome<E: std::fmt::Display>(
        &self,
        request_id: &str,
        outcome: std::result::Result<(Verdict, Option<String>), E>,
    ) -> Result<RequestState> {
        match outcome {
            Ok((verdict, reason)) => self.resolve(request_id, verdict, reason.as_deref()),
            Err(err) => {
                tracing::warn!(
                    request.id = %request_id,
                    error = %err,
                    "Moderation classifier failed, holding for review"
                );
                self.resolve(request_id, Verdict::NeedsReview, None)
            }
        }
    }
}
