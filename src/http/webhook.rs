//! Provider webhook receiver.
//!
//! The provider calls back with `{external_task_id, status, artifact_url?,
//! error_message?}` signed with a shared secret. Verification happens over
//! the raw body before parsing; the handler is idempotent by task id —
//! redelivery of a settled job is acknowledged with 200 and changes
//! nothing.

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;

use crate::orchestrator::{CompletionOutcome, CompletionSignal};

use super::ApiState;

/// Header carrying the hex HMAC-SHA256 of the raw body.
pub const SIGNATURE_HEADER: &str = "x-spinq-signature";

type HmacSha256 = Hmac<Sha256>;

/// Compute the hex signature for a body (used by tests and any client).
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a hex signature against the raw body. Constant-time comparison
/// via the HMAC verifier.
pub fn verify_signature(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature).is_ok()
}

#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    pub external_task_id: String,
    pub status: String,
    pub artifact_url: Option<String>,
    pub error_message: Option<String>,
    pub duration_seconds: Option<f64>,
}

/// POST /webhooks/generation
pub async fn receive(State(state): State<ApiState>, headers: HeaderMap, body: Bytes) -> Response {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if !verify_signature(&state.webhook_secret, &body, signature) {
        tracing::warn!("Webhook rejected: bad signature");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid signature" })),
        )
            .into_response();
    }

    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("invalid payload: {}", e) })),
            )
                .into_response();
        }
    };

    let signal = match payload.status.as_str() {
        "complete" => match payload.artifact_url {
            Some(artifact_url) => CompletionSignal::Succeeded {
                artifact_url,
                duration_seconds: payload.duration_seconds,
            },
            None => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": "complete status requires artifact_url" })),
                )
                    .into_response();
            }
        },
        "failed" => CompletionSignal::Failed {
            error: payload
                .error_message
                .unwrap_or_else(|| "provider reported failure".to_string()),
        },
        other => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("unknown status: {}", other) })),
            )
                .into_response();
        }
    };

    let request_id = {
        let store = state.store.lock().unwrap();
        match store.get_request_by_task_id(&payload.external_task_id) {
            Ok(Some(request)) => request.id,
            Ok(None) => {
                tracing::warn!(task.id = %payload.external_task_id, "Webhook for unknown task id");
                return (
                    StatusCode::NOT_FOUND,
                    Json(json!({ "error": "unknown task id" })),
                )
                    .into_response();
            }
            Err(e) => {
                tracing::error!(error = %e, "Webhook lookup failed");
                return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "lookup failed" }))).into_response();
            }
        }
    };

    match state.orchestrator.complete(&request_id, signal).await {
        Ok(outcome) => {
            let outcome_str = match outcome {
                CompletionOutcome::Applied => "applied",
                CompletionOutcome::Duplicate => "duplicate",
                CompletionOutcome::ConflictIgnored => "ignored",
            };
            (
                StatusCode::OK,
                Json(json!({ "request_id": request_id, "outcome": outcome_str })),
            )
                .into_response()
        }
        Err(e) => {
            tracing::error!(request.id = %request_id, error = %e, "Webhook completion failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "completion failed" })),
            )
                .into_response()
        }
    }
}
