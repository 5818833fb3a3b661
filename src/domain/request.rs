//! Request record and lifecycle state machine
//!
//! The Request is the central entity in Spinq: one listener prompt headed
//! for the external generation provider. It moves strictly forward through
//! the lifecycle below; the single backward edge (generating -> queued) is
//! reserved for the reconciler's stuck-reset.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SpinqError};
use crate::id::{generate_request_id, now_ms};

/// A single generation request and its lifecycle state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    //=== Identity (immutable after creation) ===
    /// Unique identifier ("req-1738300800123-a1b2")
    pub id: String,

    /// Submitting user
    pub user_id: String,

    /// Destination channel (a Request belongs to exactly one)
    pub channel_id: String,

    /// The generation prompt
    pub prompt: String,

    /// Unix timestamp in milliseconds
    pub created_at: i64,

    //=== Lifecycle ===
    /// Current lifecycle state
    pub state: RequestState,

    /// Base priority assigned at submission
    pub base_priority: i32,

    /// Upvote count, saturating, never decremented
    pub votes: u32,

    /// Derived score, stamped by the rescore batch. Advisory only between
    /// recomputations.
    pub calculated_priority: f64,

    /// Provider task id; set once, immutable thereafter
    pub external_task_id: Option<String>,

    /// Durable artifact handle; set exactly once on success
    pub artifact_handle: Option<String>,

    /// Artifact duration reported by the provider, if any
    pub duration_seconds: Option<f64>,

    /// Terminal failure reason, if failed or rejected
    pub failure_reason: Option<String>,

    /// Times the reconciler has requeued this request
    pub retry_count: u32,

    /// Held in moderating for a human decision
    pub held_for_review: bool,

    //=== Claim bookkeeping ===
    /// Worker currently driving generation, if claimed
    pub claimed_by: Option<String>,

    /// When the claim was taken (milliseconds)
    pub claimed_at: Option<i64>,

    /// Unix timestamp in milliseconds
    pub updated_at: i64,
}

/// Lifecycle states for a Request.
///
/// Forward path: submitted -> moderating -> queued -> generating -> ready
/// -> broadcasting -> completed. Terminal branches: rejected (from
/// moderating), failed (from generating), cancelled (user/admin initiated).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RequestState {
    /// Accepted by admission, not yet moderated
    Submitted,
    /// Awaiting a moderation verdict
    Moderating,
    /// Approved and waiting to be scheduled
    Queued,
    /// Claimed by a worker, provider job in flight
    Generating,
    /// Artifact recorded, handed to broadcast
    Ready,
    /// Broadcast collaborator has picked it up
    Broadcasting,
    /// Played out; end of the line
    Completed,
    /// Moderation rejected it
    Rejected,
    /// Generation failed terminally
    Failed,
    /// User or admin cancelled it
    Cancelled,
}

impl RequestState {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestState::Submitted => "submitted",
            RequestState::Moderating => "moderating",
            RequestState::Queued => "queued",
            RequestState::Generating => "generating",
            RequestState::Ready => "ready",
            RequestState::Broadcasting => "broadcasting",
            RequestState::Completed => "completed",
            RequestState::Rejected => "rejected",
            RequestState::Failed => "failed",
            RequestState::Cancelled => "cancelled",
        }
    }

    /// Parse from the string representation (inverse of `as_str`).
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "submitted" => Some(RequestState::Submitted),
            "moderating" => Some(RequestState::Moderating),
            "queued" => Some(RequestState::Queued),
            "generating" => Some(RequestState::Generating),
            "ready" => Some(RequestState::Ready),
            "broadcasting" => Some(RequestState::Broadcasting),
            "completed" => Some(RequestState::Completed),
            "rejected" => Some(RequestState::Rejected),
            "failed" => Some(RequestState::Failed),
            "cancelled" => Some(RequestState::Cancelled),
            _ => None,
        }
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestState::Completed | RequestState::Rejected | RequestState::Failed | RequestState::Cancelled
        )
    }

    /// Check if the request has been resolved by generation (successfully
    /// or not). Used by the idempotent completion entry point.
    pub fn is_resolved(&self) -> bool {
        matches!(
            self,
            RequestState::Ready | RequestState::Broadcasting | RequestState::Completed
        ) || self.is_terminal()
    }

    /// Check if a user/admin cancel is still allowed from this state.
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            RequestState::Submitted | RequestState::Moderating | RequestState::Queued | RequestState::Generating
        )
    }

    /// The single authoritative transition guard.
    ///
    /// Every edge not listed here is illegal. The one backward edge,
    /// generating -> queued, exists only for the reconciler's stuck-reset
    /// and the breaker-open claim release.
    pub fn can_transition_to(&self, next: RequestState) -> bool {
        use RequestState::*;
        matches!(
            (*self, next),
            (Submitted, Moderating)
                | (Moderating, Queued)
                | (Moderating, Rejected)
                | (Queued, Generating)
                | (Generating, Ready)
                | (Generating, Failed)
                | (Generating, Queued)
                | (Ready, Broadcasting)
                | (Broadcasting, Completed)
        ) || (next == Cancelled && self.is_cancellable())
    }
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Request {
    /// Create a new request in the `submitted` state.
    pub fn new(user_id: &str, channel_id: &str, prompt: &str, base_priority: i32) -> Self {
        let now = now_ms();
        Self {
            id: generate_request_id(),
            user_id: user_id.to_string(),
            channel_id: channel_id.to_string(),
            prompt: prompt.to_string(),
            created_at: now,
            state: RequestState::Submitted,
            base_priority,
            votes: 0,
            calculated_priority: 0.0,
            external_task_id: None,
            artifact_handle: None,
            duration_seconds: None,
            failure_reason: None,
            retry_count: 0,
            held_for_review: false,
            claimed_by: None,
            claimed_at: None,
            updated_at: now,
        }
    }

    /// Apply a lifecycle transition, rejecting illegal edges.
    pub fn transition(&mut self, next: RequestState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(SpinqError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.touch();
        Ok(())
    }

    /// Record the provider task id. A second assignment is a bug or a race
    /// and is rejected.
    pub fn set_external_task_id(&mut self, task_id: &str) -> Result<()> {
        if self.external_task_id.is_some() {
            return Err(SpinqError::TaskIdAssigned(self.id.clone()));
        }
        self.external_task_id = Some(task_id.to_string());
        self.touch();
        Ok(())
    }

    /// Record the durable artifact handle. Set exactly once.
    pub fn set_artifact_handle(&mut self, handle: &str) -> Result<()> {
        if self.artifact_handle.is_some() {
            return Err(SpinqError::ArtifactAssigned(self.id.clone()));
        }
        self.artifact_handle = Some(handle.to_string());
        self.touch();
        Ok(())
    }

    /// Add upvotes. Votes are monotonic: negative deltas are ignored here
    /// (they still apply to reputation).
    pub fn add_votes(&mut self, delta: i32) {
        if delta > 0 {
            self.votes = self.votes.saturating_add(delta as u32);
            self.touch();
        }
    }

    /// Age of this request in fractional hours at `now` (milliseconds).
    pub fn age_hours(&self, now: i64) -> f64 {
        ((now - self.created_at).max(0)) as f64 / 3_600_000.0
    }

    /// Update the timestamp
    pub fn touch(&mut self) {
        self.updated_at = now_ms();
    }
}
