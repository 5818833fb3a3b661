//! Generation orchestrator.
//!
//! Owns the provider call lifecycle for a claimed request: submit the job
//! through the circuit breaker and retry envelope, persist the external
//! task id before anything else can observe success, then wait for
//! completion via whichever of the webhook or the polling fallback lands
//! first.
//!
//! Both completion paths funnel into the single idempotent `complete`
//! entry point: the first signal wins, a duplicate is acknowledged as a
//! no-op, and a conflicting second signal is logged as an anomaly and
//! ignored. The artifact handoff to the broadcast collaborator is emitted
//! exactly once, on the ready transition.
//!
//! Overall generation timeouts are NOT enforced here — a silent provider
//! leaves the request in `generating` for the reconciler to recover.

pub mod poll;

pub use poll::spawn_poller;

use std::sync::{Arc, Mutex};

use eyre::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::domain::RequestState;
use crate::error::SpinqError;
use crate::id::now_ms;
use crate::provider::{ArtifactStore, ProviderClient, ProviderError};
use crate::resilience::{CircuitBreaker, RetryPolicy, retry_with_backoff};
use crate::store::Store;

/// Artifact handoff message for the broadcast collaborator, emitted
/// exactly once per request on the ready transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactHandoff {
    pub request_id: String,
    pub artifact_handle: String,
    pub duration_seconds: Option<f64>,
}

/// A completion signal from either the webhook or the polling path.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionSignal {
    Succeeded {
        artifact_url: String,
        duration_seconds: Option<f64>,
    },
    Failed {
        error: String,
    },
}

/// What the idempotent completion entry point did with a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// First arrival: the request transitioned.
    Applied,
    /// The request was already resolved the same way; acknowledged no-op.
    Duplicate,
    /// The second signal disagreed with the first; logged and ignored.
    ConflictIgnored,
}

/// Result of driving a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    /// Job submitted; task id persisted, awaiting completion.
    Submitted { external_task_id: String },
    /// The breaker was open; the claim was released without penalty.
    Requeued,
    /// Terminal submission failure; the request is failed.
    Failed,
    /// The request was no longer in `generating` (cancelled or recovered).
    Skipped,
}

/// Orchestrator tuning.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Webhook URL handed to the provider at submission.
    pub callback_url: String,
    /// Polls start only after this grace period, so the common case
    /// resolves via webhook without wasted polls.
    pub poll_grace_secs: u64,
    /// Interval between polls.
    pub poll_interval_secs: u64,
    /// Hard ceiling on the await; past it the poller stops and the
    /// reconciler owns the request.
    pub poll_ceiling_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            callback_url: "http://127.0.0.1:8750/webhooks/generation".to_string(),
            poll_grace_secs: 30,
            poll_interval_secs: 10,
            poll_ceiling_secs: 600,
        }
    }
}

/// Drives claimed requests through the external provider.
pub struct GenerationOrchestrator {
    pub(crate) store: Arc<Mutex<Store>>,
    pub(crate) provider: Arc<dyn ProviderClient>,
    pub(crate) artifacts: Arc<dyn ArtifactStore>,
    pub(crate) breaker: Arc<Mutex<CircuitBreaker>>,
    retry: RetryPolicy,
    handoff_tx: mpsc::Sender<ArtifactHandoff>,
    pub(crate) config: OrchestratorConfig,
}

impl GenerationOrchestrator {
    /// Create an orchestrator over the shared store and collaborators.
    pub fn new(
        store: Arc<Mutex<Store>>,
        provider: Arc<dyn ProviderClient>,
        artifacts: Arc<dyn ArtifactStore>,
        breaker: Arc<Mutex<CircuitBreaker>>,
        retry: RetryPolicy,
        handoff_tx: mpsc::Sender<ArtifactHandoff>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            provider,
            artifacts,
            breaker,
            retry,
            handoff_tx,
            config,
        }
    }

    /// Submit the provider job for a claimed request.
    ///
    /// On success the external task id is persisted before returning, so a
    /// crash after submission is still reconcilable, and the polling
    /// fallback is spawned. A tripped breaker releases the claim back to
    /// queued without penalty — provider unavailability is never
    /// attributed to the request.
    pub async fn generate(self: Arc<Self>, request_id: &str) -> Result<GenerationOutcome> {
        let request = {
            let store = self.store.lock().unwrap();
            store
                .get_request(request_id)?
                .ok_or_else(|| SpinqError::RequestNotFound(request_id.to_string()))?
        };

        if request.state != RequestState::Generating {
            tracing::debug!(request.id = %request_id, state = %request.state, "Not claimed, skipping");
            return Ok(GenerationOutcome::Skipped);
        }

        let submit_result = retry_with_backoff(
            &self.retry,
            |e: &ProviderError| e.retry_verdict(),
            |_attempt| {
                let provider = self.provider.clone();
                let breaker = self.breaker.clone();
                let prompt = request.prompt.clone();
                let callback_url = self.config.callback_url.clone();
                async move {
                    {
                        let mut breaker = breaker.lock().unwrap();
                        if !breaker.try_acquire() {
                            return Err(ProviderError::CircuitOpen);
                        }
                    }

                    let result = provider.submit(&prompt, &callback_url).await;

                    let mut breaker = breaker.lock().unwrap();
                    match &result {
                        Ok(_) => breaker.record_success(),
                        Err(e) if e.counts_as_breaker_failure() => breaker.record_failure(),
                        // The provider answered (4xx): not an availability failure
                        Err(ProviderError::CircuitOpen) => {}
                        Err(_) => breaker.record_success(),
                    }
                    result
                }
            },
        )
        .await;

        match submit_result {
            Ok(job) => {
                let assigned = {
                    let mut store = self.store.lock().unwrap();
                    store.set_external_task_id(request_id, &job.external_task_id, now_ms())?
                };
                if !assigned {
                    tracing::warn!(
                        request.id = %request_id,
                        task.id = %job.external_task_id,
                        "Task id already assigned, keeping the first"
                    );
                }

                spawn_poller(self.clone(), request_id.to_string(), job.external_task_id.clone());

                Ok(GenerationOutcome::Submitted {
                    external_task_id: job.external_task_id,
                })
            }
            Err(ProviderError::CircuitOpen) => {
                let released = {
                    let mut store = self.store.lock().unwrap();
                    store.release_claim(request_id, now_ms())?
                };
                tracing::warn!(request.id = %request_id, released, "Circuit open, request returned to queue");
                Ok(GenerationOutcome::Requeued)
            }
            Err(e) => {
                let reason = e.to_string();
                {
                    let mut store = self.store.lock().unwrap();
                    store.fail_generating(request_id, &reason, now_ms())?;
                }
                tracing::error!(request.id = %request_id, error = %reason, "Submission failed terminally");
                Ok(GenerationOutcome::Failed)
            }
        }
    }

    /// The single idempotent completion entry point, shared by the webhook
    /// handler and the polling fallback.
    pub async fn complete(&self, request_id: &str, signal: CompletionSignal) -> Result<CompletionOutcome> {
        let request = {
            let store = self.store.lock().unwrap();
            store
                .get_request(request_id)?
                .ok_or_else(|| SpinqError::RequestNotFound(request_id.to_string()))?
        };

        if request.state != RequestState::Generating {
            return Ok(self.second_signal_outcome(request_id, request.state, &signal));
        }

        match signal {
            CompletionSignal::Failed { error } => {
                let changed = {
                    let mut store = self.store.lock().unwrap();
                    store.fail_generating(request_id, &error, now_ms())?
                };
                if changed {
                    tracing::info!(request.id = %request_id, error = %error, "Generation failed");
                    Ok(CompletionOutcome::Applied)
                } else {
                    // Someone resolved it while we looked
                    let state = self
                        .store
                        .lock()
                        .unwrap()
                        .get_request(request_id)?
                        .map(|r| r.state)
                        .unwrap_or(RequestState::Failed);
                    Ok(self.second_signal_outcome(request_id, state, &CompletionSignal::Failed { error }))
                }
            }
            CompletionSignal::Succeeded {
                artifact_url,
                duration_seconds,
            } => {
                // A handle already present short-circuits the fetch
                let handle = match &request.artifact_handle {
                    Some(handle) => handle.clone(),
                    None => self.artifacts.store(request_id, &artifact_url).await?,
                };

                let handoff = {
                    let mut store = self.store.lock().unwrap();
                    let mut request = store
                        .get_request(request_id)?
                        .ok_or_else(|| SpinqError::RequestNotFound(request_id.to_string()))?;

                    // Re-check under the lock: the other path may have won
                    // while the artifact was being stored
                    if request.state != RequestState::Generating {
                        let signal = CompletionSignal::Succeeded {
                            artifact_url,
                            duration_seconds,
                        };
                        return Ok(self.second_signal_outcome(request_id, request.state, &signal));
                    }

                    request.transition(RequestState::Ready)?;
                    if request.artifact_handle.is_none() {
                        request.set_artifact_handle(&handle)?;
                    }
                    request.duration_seconds = duration_seconds;
                    store.save_request(&request)?;
                    store.increment_lifetime_plays(&request.user_id)?;

                    ArtifactHandoff {
                        request_id: request.id.clone(),
                        artifact_handle: handle,
                        duration_seconds,
                    }
                };

                tracing::info!(
                    request.id = %request_id,
                    artifact = %handoff.artifact_handle,
                    "Generation complete, artifact handed to broadcast"
                );

                if self.handoff_tx.send(handoff).await.is_err() {
                    tracing::warn!(request.id = %request_id, "Handoff receiver dropped");
                }

                Ok(CompletionOutcome::Applied)
            }
        }
    }

    /// Cancel a request. Valid from any pre-ready state; in-flight pollers
    /// notice the state change and stop on their own.
    pub fn cancel(&self, request_id: &str) -> Result<RequestState> {
        let mut store = self.store.lock().unwrap();
        let mut request = store
            .get_request(request_id)?
            .ok_or_else(|| SpinqError::RequestNotFound(request_id.to_string()))?;

        request.transition(RequestState::Cancelled)?;
        store.save_request(&request)?;

        tracing::info!(request.id = %request_id, "Request cancelled");
        Ok(request.state)
    }

    /// Classify a signal that arrived after the request was resolved.
    fn second_signal_outcome(
        &self,
        request_id: &str,
        state: RequestState,
        signal: &CompletionSignal,
    ) -> CompletionOutcome {
        let agrees = match state {
            RequestState::Ready | RequestState::Broadcasting | RequestState::Completed => {
                matches!(signal, CompletionSignal::Succeeded { .. })
            }
            RequestState::Failed => matches!(signal, CompletionSignal::Failed { .. }),
            // Cancelled, requeued, or never generating: nothing to confirm
            _ => false,
        };

        if agrees {
            tracing::debug!(request.id = %request_id, state = %state, "Duplicate completion signal, no-op");
            CompletionOutcome::Duplicate
        } else {
            tracing::warn!(
                request.id = %request_id,
                state = %state,
                "Conflicting completion signal ignored"
            );
            CompletionOutcome::ConflictIgnored
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Channel, Request};
    use crate::provider::{MockArtifactStore, MockProviderClient, SubmitScript};
    use crate::resilience::BreakerConfig;
    use tempfile::TempDir;

    struct Harness {
        orchestrator: Arc<GenerationOrchestrator>,
        store: Arc<Mutex<Store>>,
        provider: Arc<MockProviderClient>,
        artifacts: Arc<MockArtifactStore>,
        handoff_rx: mpsc::Receiver<ArtifactHandoff>,
        _temp: TempDir,
    }

    fn harness() -> Harness {
        let temp = TempDir::new().unwrap();
        let mut store = Store::open_at(temp.path()).unwrap();
        store.save_channel(&Channel::new("chan-1", "Lofi")).unwrap();
        let store = Arc::new(Mutex::new(store));

        let provider = Arc::new(MockProviderClient::new());
        let artifacts = Arc::new(MockArtifactStore::new());
        let breaker = Arc::new(Mutex::new(CircuitBreaker::new(BreakerConfig::default())));
        let (handoff_tx, handoff_rx) = mpsc::channel(16);

        let retry = RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 0,
            max_delay_ms: 0,
            jitter: 0.0,
        };

        let config = OrchestratorConfig {
            poll_grace_secs: 0,
            poll_interval_secs: 0,
            poll_ceiling_secs: 1,
            ..Default::default()
        };

        let orchestrator = Arc::new(GenerationOrchestrator::new(
            store.clone(),
            provider.clone(),
            artifacts.clone(),
            breaker,
            retry,
            handoff_tx,
            config,
        ));

        Harness {
            orchestrator,
            store,
            provider,
            artifacts,
            handoff_rx,
            _temp: temp,
        }
    }

    fn claimed_request(store: &Arc<Mutex<Store>>) -> Request {
        let mut store = store.lock().unwrap();
        store.get_or_create_user("user-1").unwrap();
        let mut request = Request::new("user-1", "chan-1", "ambient dusk", 50);
        request.state = RequestState::Queued;
        store.save_request(&request).unwrap();
        store.claim_request(&request.id, "worker-t", now_ms()).unwrap();
        store.get_request(&request.id).unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_generate_submits_and_persists_task_id() {
        let h = harness();
        let request = claimed_request(&h.store);

        let outcome = h.orchestrator.clone().generate(&request.id).await.unwrap();
        let task_id = match outcome {
            GenerationOutcome::Submitted { external_task_id } => external_task_id,
            other => panic!("unexpected outcome: {:?}", other),
        };

        let loaded = h.store.lock().unwrap().get_request(&request.id).unwrap().unwrap();
        assert_eq!(loaded.external_task_id.as_deref(), Some(task_id.as_str()));
        assert_eq!(loaded.state, RequestState::Generating);
        assert_eq!(h.provider.submit_calls(), 1);
    }

    #[tokio::test]
    async fn test_generate_skips_unclaimed() {
        let h = harness();
        let request = Request::new("user-1", "chan-1", "x", 50);
        h.store.lock().unwrap().save_request(&request).unwrap();

        let outcome = h.orchestrator.clone().generate(&request.id).await.unwrap();
        assert_eq!(outcome, GenerationOutcome::Skipped);
        assert_eq!(h.provider.submit_calls(), 0);
    }

    #[tokio::test]
    async fn test_client_error_fails_without_retry() {
        let h = harness();
        let request = claimed_request(&h.store);

        h.provider
            .script_submit(SubmitScript::Api(422, "unprocessable prompt".to_string()));

        let outcome = h.orchestrator.clone().generate(&request.id).await.unwrap();
        assert_eq!(outcome, GenerationOutcome::Failed);
        // Exactly one attempt: 4xx is never retried
        assert_eq!(h.provider.submit_calls(), 1);

        let loaded = h.store.lock().unwrap().get_request(&request.id).unwrap().unwrap();
        assert_eq!(loaded.state, RequestState::Failed);
        assert!(loaded.failure_reason.unwrap().contains("422"));
    }

    #[tokio::test]
    async fn test_transient_errors_retry_then_succeed() {
        let h = harness();
        let request = claimed_request(&h.store);

        h.provider.script_submit(SubmitScript::Timeout);
        h.provider.script_submit(SubmitScript::Api(503, "busy".to_string()));
        h.provider.script_submit(SubmitScript::OkWithId("task-win".to_string()));

        let outcome = h.orchestrator.clone().generate(&request.id).await.unwrap();
        assert_eq!(
            outcome,
            GenerationOutcome::Submitted {
                external_task_id: "task-win".to_string()
            }
        );
        assert_eq!(h.provider.submit_calls(), 3);
    }

    #[tokio::test]
    async fn test_transient_exhaustion_fails_terminally() {
        let h = harness();
        let request = claimed_request(&h.store);

        for _ in 0..3 {
            h.provider.script_submit(SubmitScript::Timeout);
        }

        let outcome = h.orchestrator.clone().generate(&request.id).await.unwrap();
        assert_eq!(outcome, GenerationOutcome::Failed);
        assert_eq!(h.provider.submit_calls(), 3);

        let loaded = h.store.lock().unwrap().get_request(&request.id).unwrap().unwrap();
        assert_eq!(loaded.state, RequestState::Failed);
    }

    #[tokio::test]
    async fn test_open_breaker_requeues_without_penalty() {
        let h = harness();
        let request = claimed_request(&h.store);

        // Trip the breaker
        {
            let mut breaker = h.orchestrator.breaker.lock().unwrap();
            for _ in 0..BreakerConfig::default().failure_threshold {
                breaker.record_failure();
            }
        }

        let outcome = h.orchestrator.clone().generate(&request.id).await.unwrap();
        assert_eq!(outcome, GenerationOutcome::Requeued);
        // Short-circuited: no network call observed
        assert_eq!(h.provider.submit_calls(), 0);

        let loaded = h.store.lock().unwrap().get_request(&request.id).unwrap().unwrap();
        assert_eq!(loaded.state, RequestState::Queued);
        assert_eq!(loaded.retry_count, 0);
    }

    #[tokio::test]
    async fn test_complete_success_transitions_to_ready() {
        let mut h = harness();
        let request = claimed_request(&h.store);

        let outcome = h
            .orchestrator
            .complete(
                &request.id,
                CompletionSignal::Succeeded {
                    artifact_url: "https://cdn.example/a.ogg".to_string(),
                    duration_seconds: Some(180.0),
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome, CompletionOutcome::Applied);

        let loaded = h.store.lock().unwrap().get_request(&request.id).unwrap().unwrap();
        assert_eq!(loaded.state, RequestState::Ready);
        assert_eq!(loaded.artifact_handle.as_deref(), Some(format!("artifact://{}", request.id).as_str()));
        assert_eq!(loaded.duration_seconds, Some(180.0));

        // Exactly one handoff emitted
        let handoff = h.handoff_rx.try_recv().unwrap();
        assert_eq!(handoff.request_id, request.id);
        assert!(h.handoff_rx.try_recv().is_err());

        // Lifetime plays bumped for fairness accounting
        let user = h.store.lock().unwrap().get_user("user-1").unwrap().unwrap();
        assert_eq!(user.lifetime_plays, 1);
    }

    #[tokio::test]
    async fn test_complete_is_idempotent() {
        let mut h = harness();
        let request = claimed_request(&h.store);

        let signal = CompletionSignal::Succeeded {
            artifact_url: "https://cdn.example/a.ogg".to_string(),
            duration_seconds: None,
        };

        let first = h.orchestrator.complete(&request.id, signal.clone()).await.unwrap();
        let second = h.orchestrator.complete(&request.id, signal).await.unwrap();

        assert_eq!(first, CompletionOutcome::Applied);
        assert_eq!(second, CompletionOutcome::Duplicate);

        // No duplicate artifact fetch, no duplicate handoff
        assert_eq!(h.artifacts.store_calls(), 1);
        assert!(h.handoff_rx.try_recv().is_ok());
        assert!(h.handoff_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_conflicting_second_signal_ignored() {
        let h = harness();
        let request = claimed_request(&h.store);

        h.orchestrator
            .complete(
                &request.id,
                CompletionSignal::Succeeded {
                    artifact_url: "https://cdn.example/a.ogg".to_string(),
                    duration_seconds: None,
                },
            )
            .await
            .unwrap();

        let outcome = h
            .orchestrator
            .complete(
                &request.id,
                CompletionSignal::Failed {
                    error: "late failure report".to_string(),
                },
            )
            .await
            .unwrap();

        assert_eq!(outcome, CompletionOutcome::ConflictIgnored);
        let loaded = h.store.lock().unwrap().get_request(&request.id).unwrap().unwrap();
        assert_eq!(loaded.state, RequestState::Ready);
    }

    #[tokio::test]
    async fn test_complete_failure_signal() {
        let h = harness();
        let request = claimed_request(&h.store);

        let outcome = h
            .orchestrator
            .complete(
                &request.id,
                CompletionSignal::Failed {
                    error: "model collapsed".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome, CompletionOutcome::Applied);

        let loaded = h.store.lock().unwrap().get_request(&request.id).unwrap().unwrap();
        assert_eq!(loaded.state, RequestState::Failed);
        assert_eq!(loaded.failure_reason.as_deref(), Some("model collapsed"));

        // Duplicate failure is a no-op
        let again = h
            .orchestrator
            .complete(
                &request.id,
                CompletionSignal::Failed {
                    error: "model collapsed".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(again, CompletionOutcome::Duplicate);
    }

    #[tokio::test]
    async fn test_late_signal_after_requeue_is_ignored() {
        let h = harness();
        let request = claimed_request(&h.store);

        // Reconciler took it back while the provider dawdled
        h.store.lock().unwrap().requeue_stuck(&request.id, now_ms()).unwrap();

        let outcome = h
            .orchestrator
            .complete(
                &request.id,
                CompletionSignal::Succeeded {
                    artifact_url: "https://cdn.example/late.ogg".to_string(),
                    duration_seconds: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(outcome, CompletionOutcome::ConflictIgnored);
        let loaded = h.store.lock().unwrap().get_request(&request.id).unwrap().unwrap();
        assert_eq!(loaded.state, RequestState::Queued);
    }

    #[tokio::test]
    async fn test_cancel_releases_request() {
        let h = harness();
        let request = claimed_request(&h.store);

        let state = h.orchestrator.cancel(&request.id).unwrap();
        assert_eq!(state, RequestState::Cancelled);

        // Completion signals after cancel are ignored, not errors
        let outcome = h
            .orchestrator
            .complete(
                &request.id,
                CompletionSignal::Succeeded {
                    artifact_url: "https://cdn.example/a.ogg".to_string(),
                    duration_seconds: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome, CompletionOutcome::ConflictIgnored);
    }

    #[tokio::test]
    async fn test_cancel_after_ready_is_error() {
        let h = harness();
        let request = claimed_request(&h.store);

        h.orchestrator
            .complete(
                &request.id,
                CompletionSignal::Succeeded {
                    artifact_url: "https://cdn.example/a.ogg".to_string(),
                    duration_seconds: None,
                },
            )
            .await
            .unwrap();

        assert!(h.orchestrator.cancel(&request.id).is_err());
    }
}
