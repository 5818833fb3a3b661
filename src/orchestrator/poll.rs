//! Polling fallback for generation completion.
//!
//! The webhook is the primary completion path. Each submitted job also
//! gets a poller task that wakes after a grace period and checks the
//! provider until the request resolves, the hard ceiling passes, or the
//! request leaves `generating` (cancel, reconciler requeue, webhook win).
//! Both paths converge on `GenerationOrchestrator::complete`, so a
//! webhook/poll race settles on whichever arrives first.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use crate::domain::RequestState;
use crate::provider::JobState;

use super::{CompletionSignal, GenerationOrchestrator};

/// Spawn the polling fallback for a submitted job.
pub fn spawn_poller(
    orchestrator: Arc<GenerationOrchestrator>,
    request_id: String,
    external_task_id: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        run_poller(orchestrator, request_id, external_task_id).await;
    })
}

/// Poll until the request resolves or the ceiling passes.
async fn run_poller(orchestrator: Arc<GenerationOrchestrator>, request_id: String, external_task_id: String) {
    let grace = Duration::from_secs(orchestrator.config.poll_grace_secs);
    let interval = Duration::from_secs(orchestrator.config.poll_interval_secs.max(1));
    let deadline = Instant::now() + Duration::from_secs(orchestrator.config.poll_ceiling_secs);

    tokio::time::sleep(grace).await;

    loop {
        // Stop as soon as the request is no longer generating
        let still_generating = {
            let store = orchestrator.store.lock().unwrap();
            match store.get_request(&request_id) {
                Ok(Some(request)) => request.state == RequestState::Generating,
                _ => false,
            }
        };
        if !still_generating {
            tracing::debug!(request.id = %request_id, "Poller done, request resolved elsewhere");
            return;
        }

        // The breaker guards polls too; a refused slot just skips a cycle
        let allowed = orchestrator.breaker.lock().unwrap().try_acquire();
        if allowed {
            match orchestrator.provider.poll(&external_task_id).await {
                Ok(status) => {
                    orchestrator.breaker.lock().unwrap().record_success();

                    match status.state {
                        JobState::Complete => {
                            match status.artifact_url {
                                Some(artifact_url) => {
                                    let signal = CompletionSignal::Succeeded {
                                        artifact_url,
                                        duration_seconds: status.duration_seconds,
                                    };
                                    if let Err(e) = orchestrator.complete(&request_id, signal).await {
                                        tracing::error!(
                                            request.id = %request_id,
                                            error = %e,
                                            "Poll completion failed"
                                        );
                                    }
                                }
                                None => {
                                    tracing::warn!(
                                        request.id = %request_id,
                                        task.id = %external_task_id,
                                        "Provider reported complete without an artifact URL"
                                    );
                                }
                            }
                            return;
                        }
                        JobState::Failed => {
                            let signal = CompletionSignal::Failed {
                                error: status
                                    .error_message
                                    .unwrap_or_else(|| "provider reported failure".to_string()),
                            };
                            if let Err(e) = orchestrator.complete(&request_id, signal).await {
                                tracing::error!(request.id = %request_id, error = %e, "Poll completion failed");
                            }
                            return;
                        }
                        JobState::Pending | JobState::Processing => {}
                    }
                }
                Err(e) => {
                    let mut breaker = orchestrator.breaker.lock().unwrap();
                    if e.counts_as_breaker_failure() {
                        breaker.record_failure();
                    } else {
                        breaker.record_success();
                    }
                    drop(breaker);
                    tracing::debug!(task.id = %external_task_id, error = %e, "Poll attempt failed");
                }
            }
        }

        if Instant::now() >= deadline {
            // The reconciler owns timed-out requests
            tracing::debug!(request.id = %request_id, "Poller hit the ceiling, leaving recovery to the sweeper");
            return;
        }

        tokio::time::sleep(interval).await;
    }
}
