//! Error types for Spinq
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

use crate::domain::RequestState;
use crate::provider::ProviderError;

/// All error types that can occur in Spinq
#[derive(Debug, Error)]
pub enum SpinqError {
    /// Request not found in storage
    #[error("Request not found: {0}")]
    RequestNotFound(String),

    /// User not found in storage
    #[error("User not found: {0}")]
    UserNotFound(String),

    /// Channel not found in storage
    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    /// Illegal lifecycle transition
    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition { from: RequestState, to: RequestState },

    /// External task id was already assigned for this request
    #[error("External task id already assigned for request {0}")]
    TaskIdAssigned(String),

    /// Artifact handle was already recorded for this request
    #[error("Artifact already recorded for request {0}")]
    ArtifactAssigned(String),

    /// Submission rejected at the admission gate
    #[error("Admission denied: {0}")]
    AdmissionDenied(String),

    /// Storage/persistence error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Generation provider error
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for Spinq operations
pub type Result<T> = std::result::Result<T, SpinqError>;
