//! Generation provider client types and trait definitions.
//!
//! The provider runs asynchronous generation jobs: submit returns a task
//! id, completion arrives via webhook or polling. Everything here is
//! transport-agnostic; `http` holds the real client and `mock` the
//! scripted one used in tests.

pub mod artifacts;
pub mod http;
pub mod mock;

pub use artifacts::{ArtifactStore, HttpArtifactRelay, PassthroughArtifactStore};
pub use http::{HttpProviderClient, ProviderHttpConfig};
pub use mock::{MockArtifactStore, MockProviderClient, PollScript, SubmitScript};

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::resilience::RetryVerdict;

/// A freshly submitted provider job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedJob {
    /// The provider's task id; unique per job on their side.
    pub external_task_id: String,
}

/// Provider-side job state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Processing,
    Complete,
    Failed,
}

impl JobState {
    /// Parse from the provider's status string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobState::Pending),
            "processing" => Some(JobState::Processing),
            "complete" => Some(JobState::Complete),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }

    /// Has the provider finished with this job, one way or the other?
    pub fn is_settled(&self) -> bool {
        matches!(self, JobState::Complete | JobState::Failed)
    }
}

/// One poll of a provider job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobStatus {
    pub state: JobState,
    pub artifact_url: Option<String>,
    pub error_message: Option<String>,
    pub duration_seconds: Option<f64>,
}

/// Errors from provider calls.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("provider returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("circuit open")]
    CircuitOpen,
}

impl ProviderError {
    /// Transient errors worth retrying: throttles, timeouts, transport
    /// failures, and 5xx. Client errors (4xx) are terminal — retrying a
    /// malformed request cannot change the outcome.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::RateLimited { .. } => true,
            ProviderError::Api { status, .. } => *status >= 500,
            ProviderError::Network(_) => true,
            ProviderError::Timeout(_) => true,
            ProviderError::InvalidResponse(_) => false,
            ProviderError::Json(_) => false,
            ProviderError::Config(_) => false,
            ProviderError::CircuitOpen => false,
        }
    }

    /// Should this failure count toward tripping the circuit breaker?
    ///
    /// A 4xx proves the provider is up and answering, so it resets the
    /// failure streak instead of extending it.
    pub fn counts_as_breaker_failure(&self) -> bool {
        match self {
            ProviderError::RateLimited { .. } => true,
            ProviderError::Api { status, .. } => *status >= 500,
            ProviderError::Network(_) => true,
            ProviderError::Timeout(_) => true,
            _ => false,
        }
    }

    /// Classification for the retry envelope.
    pub fn retry_verdict(&self) -> RetryVerdict {
        match self {
            ProviderError::RateLimited { retry_after: Some(d) } => RetryVerdict::RetryAfter(*d),
            _ if self.is_retryable() => RetryVerdict::Retry,
            _ => RetryVerdict::Terminal,
        }
    }
}

/// Async generation provider.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Submit a generation job; returns the provider task id.
    async fn submit(&self, prompt: &str, callback_url: &str) -> Result<SubmittedJob, ProviderError>;

    /// Poll a job by task id.
    async fn poll(&self, external_task_id: &str) -> Result<JobStatus, ProviderError>;
}
