//! Intake handlers: submissions, verdicts, votes, cancels, broadcast acks.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::domain::RequestState;
use crate::error::SpinqError;
use crate::id::now_ms;
use crate::moderation::Verdict;
use crate::submission::{self, SubmissionOutcome, SubmitParams};

use super::ApiState;

/// Map an internal error to an HTTP response.
fn error_response(err: eyre::Report) -> Response {
    let status = match err.downcast_ref::<SpinqError>() {
        Some(SpinqError::RequestNotFound(_))
        | Some(SpinqError::UserNotFound(_))
        | Some(SpinqError::ChannelNotFound(_)) => StatusCode::NOT_FOUND,
        Some(SpinqError::InvalidTransition { .. }) => StatusCode::CONFLICT,
        Some(SpinqError::AdmissionDenied(_)) => StatusCode::FORBIDDEN,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(error = %err, "Request handler failed");
    }

    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

/// GET /health
pub async fn health() -> impl IntoResponse {
    Json(json!({
        "name": "spinq",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// POST /requests — submission intake.
pub async fn submit(State(state): State<ApiState>, Json(params): Json<SubmitParams>) -> Response {
    match submission::submit_request(&state.store, &state.gate, &state.admission, params) {
        Ok(SubmissionOutcome::Accepted(receipt)) => (StatusCode::OK, Json(receipt)).into_response(),
        Ok(SubmissionOutcome::Denied {
            reason,
            retry_after_secs,
        }) => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "error": "admission_denied",
                "reason": reason.as_str(),
                "retry_after_secs": retry_after_secs,
            })),
        )
            .into_response(),
        Err(err) => error_response(err),
    }
}

/// GET /requests/{id}
pub async fn get_request(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    let result = {
        let store = state.store.lock().unwrap();
        store.get_request(&id)
    };

    match result {
        Ok(Some(request)) => (StatusCode::OK, Json(request)).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("Request not found: {}", id) })),
        )
            .into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, serde::Deserialize)]
pub struct VerdictBody {
    pub verdict: String,
    pub reason: Option<String>,
}

/// POST /requests/{id}/verdict — moderation verdict intake.
pub async fn verdict(State(state): State<ApiState>, Path(id): Path<String>, Json(body): Json<VerdictBody>) -> Response {
    let Some(verdict) = Verdict::parse(&body.verdict) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": format!("unknown verdict: {}", body.verdict) })),
        )
            .into_response();
    };

    match state.gate.resolve(&id, verdict, body.reason.as_deref()) {
        Ok(request_state) => (
            StatusCode::OK,
            Json(json!({ "request_id": id, "state": request_state.as_str() })),
        )
            .into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, serde::Deserialize)]
pub struct VoteBody {
    pub delta: i32,
}

/// POST /requests/{id}/vote — vote/reputation events.
pub async fn vote(State(state): State<ApiState>, Path(id): Path<String>, Json(body): Json<VoteBody>) -> Response {
    let result = {
        let mut store = state.store.lock().unwrap();
        store.apply_vote(&id, body.delta, state.reputation_min, state.reputation_max, now_ms())
    };

    match result {
        Ok(true) => (StatusCode::OK, Json(json!({ "request_id": id }))).into_response(),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("Request not found: {}", id) })),
        )
            .into_response(),
        Err(err) => error_response(err),
    }
}

/// POST /requests/{id}/cancel — user/admin cancellation.
pub async fn cancel(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.cancel(&id) {
        Ok(request_state) => (
            StatusCode::OK,
            Json(json!({ "request_id": id, "state": request_state.as_str() })),
        )
            .into_response(),
        Err(err) => error_response(err),
    }
}

/// POST /requests/{id}/broadcast — broadcast collaborator picked it up.
pub async fn broadcast_started(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    transition_ack(&state, &id, RequestState::Broadcasting)
}

/// POST /requests/{id}/played — broadcast finished playing it out.
pub async fn played(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    transition_ack(&state, &id, RequestState::Completed)
}

/// Apply a broadcast-driven transition.
fn transition_ack(state: &ApiState, id: &str, next: RequestState) -> Response {
    let result = (|| -> eyre::Result<RequestState> {
        let mut store = state.store.lock().unwrap();
        let mut request = store
            .get_request(id)?
            .ok_or_else(|| SpinqError::RequestNotFound(id.to_string()))?;
        request.transition(next)?;
        store.save_request(&request)?;
        Ok(request.state)
    })();

    match result {
        Ok(request_state) => (
            StatusCode::OK,
            Json(json!({ "request_id": id, "state": request_state.as_str() })),
        )
            .into_response(),
        Err(err) => error_response(err),
    }
}
