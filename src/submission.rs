//! Submission intake glue: admission check, request creation, moderation
//! handoff. Shared by the HTTP intake and the CLI.

use std::sync::{Arc, Mutex};

use eyre::Result;
use serde::{Deserialize, Serialize};

use crate::error::SpinqError;
use crate::id::{now_ms, today};
use crate::moderation::ModerationGate;
use crate::scheduler::admission::{self, AdmissionConfig, AdmissionDecision, DenialReason};
use crate::store::Store;

/// A submission from the upstream collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitParams {
    pub user_id: String,
    pub channel_id: String,
    pub prompt: String,
    #[serde(default = "default_base_priority")]
    pub base_priority: i32,
}

fn default_base_priority() -> i32 {
    50
}

/// Acknowledgement for an accepted submission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmitReceipt {
    pub request_id: String,
    pub estimated_position: usize,
}

/// Outcome of a submission attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmissionOutcome {
    Accepted(SubmitReceipt),
    Denied {
        reason: DenialReason,
        retry_after_secs: u64,
    },
}

/// Run a submission through admission and into moderation.
///
/// Denials are synchronous and leave no trace in the queue. On admission
/// the user's daily counter is bumped atomically before the request record
/// exists, so racing submissions cannot both slip under the limit.
pub fn submit_request(
    store: &Arc<Mutex<Store>>,
    gate: &ModerationGate,
    config: &AdmissionConfig,
    params: SubmitParams,
) -> Result<SubmissionOutcome> {
    let now = now_ms();
    let day = today();

    let receipt = {
        let mut store = store.lock().unwrap();

        let channel = store
            .get_channel(&params.channel_id)?
            .ok_or_else(|| SpinqError::ChannelNotFound(params.channel_id.clone()))?;

        let user = store.get_or_create_user(&params.user_id)?;
        if user.disabled {
            return Err(SpinqError::AdmissionDenied("user is disabled".to_string()).into());
        }

        let queued_depth = store.count_queued(&channel.id)?;
        let decision = admission::admit(&user, queued_depth, channel.max_queue_size, config, now, &day);

        if let AdmissionDecision::Denied {
            reason,
            retry_after_secs,
        } = decision
        {
            tracing::debug!(
                user.id = %params.user_id,
                channel.id = %params.channel_id,
                reason = %reason,
                "Submission denied"
            );
            return Ok(SubmissionOutcome::Denied {
                reason,
                retry_after_secs,
            });
        }

        store.record_admission(&params.user_id, &day, now)?;

        let request = crate::domain::Request::new(
            &params.user_id,
            &params.channel_id,
            &params.prompt,
            params.base_priority,
        );
        store.save_request(&request)?;

        SubmitReceipt {
            estimated_position: store.estimated_position(&channel.id)?,
            request_id: request.id,
        }
    };

    gate.begin(&receipt.request_id)?;

    tracing::info!(
        request.id = %receipt.request_id,
        user.id = %params.user_id,
        channel.id = %params.channel_id,
        position = receipt.estimated_position,
        "Submission accepted"
    );

    Ok(SubmissionOutcome::Accepted(receipt))
}
