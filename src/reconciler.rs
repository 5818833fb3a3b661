//! Reconciler: recovers requests stuck mid-generation.
//!
//! A request can sit in `generating` forever if the provider never calls
//! back, the poller dies, or a worker crashes after claiming. The sweeper
//! runs on an interval, independent of the scheduler loop:
//! - stuck past the generation timeout and under the retry budget: back to
//!   `queued` with `retry_count + 1`, eligible for a fresh claim
//! - retry budget exhausted: terminal `failed`
//!
//! One sweep also runs at daemon startup so claims orphaned by a crash
//! recover immediately rather than after the first interval.

use std::sync::{Arc, Mutex};

use eyre::Result;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::id::now_ms;
use crate::store::Store;

/// Reconciler tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Seconds between sweeps.
    pub sweep_interval_secs: u64,
    /// A request generating longer than this is considered stuck.
    pub generation_timeout_secs: u64,
    /// Requeues allowed before the request fails terminally.
    pub max_retries: u32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 60,
            generation_timeout_secs: 600,
            max_retries: 3,
        }
    }
}

/// What the sweeper did with one stuck request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Returned to the queue for another attempt.
    Requeued { request_id: String, retry_count: u32 },
    /// Retry budget exhausted; failed terminally.
    Failed { request_id: String },
    /// The request resolved between the scan and the update.
    Skipped { request_id: String },
}

/// Sweep once: requeue or fail every request stuck in `generating`.
pub fn sweep(store: &Arc<Mutex<Store>>, config: &ReconcilerConfig, now: i64) -> Result<Vec<ReconcileAction>> {
    let cutoff = now - (config.generation_timeout_secs as i64) * 1000;

    let mut store = store.lock().unwrap();
    let stuck = store.list_stuck_generating(cutoff)?;

    let mut actions = Vec::new();
    for request in stuck {
        if request.retry_count < config.max_retries {
            if store.requeue_stuck(&request.id, now)? {
                info!(
                    "Requeued stuck request {} (retry {}/{})",
                    request.id,
                    request.retry_count + 1,
                    config.max_retries
                );
                actions.push(ReconcileAction::Requeued {
                    request_id: request.id,
                    retry_count: request.retry_count + 1,
                });
            } else {
                actions.push(ReconcileAction::Skipped { request_id: request.id });
            }
        } else {
            let reason = format!(
                "generation timed out after {} retries",
                request.retry_count
            );
            if store.fail_generating(&request.id, &reason, now)? {
                warn!("Failed stuck request {} ({})", request.id, reason);
                actions.push(ReconcileAction::Failed { request_id: request.id });
            } else {
                actions.push(ReconcileAction::Skipped { request_id: request.id });
            }
        }
    }

    Ok(actions)
}

/// Background sweep task. Runs one sweep immediately (crash recovery),
/// then on the configured interval, indefinitely.
pub async fn run_reconciler(store: Arc<Mutex<Store>>, config: ReconcilerConfig) {
    let interval = std::time::Duration::from_secs(config.sweep_interval_secs.max(1));

    loop {
        match sweep(&store, &config, now_ms()) {
            Ok(actions) if !actions.is_empty() => {
                info!("Reconciler sweep recovered {} requests", actions.len());
            }
            Err(e) => {
                warn!("Reconciler sweep failed: {}", e);
            }
            _ => {}
        }

        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Request, RequestState};
    use tempfile::TempDir;

    fn create_temp_store() -> (Arc<Mutex<Store>>, TempDir) {
        let temp = TempDir::new().unwrap();
        let store = Store::open_at(temp.path()).unwrap();
        (Arc::new(Mutex::new(store)), temp)
    }

    fn claimed_at(store: &Arc<Mutex<Store>>, claimed_at: i64, retry_count: u32) -> Request {
        let mut store = store.lock().unwrap();
        let mut request = Request::new("user-1", "chan-1", "prompt", 50);
        request.state = RequestState::Queued;
        request.retry_count = retry_count;
        store.save_request(&request).unwrap();
        store.claim_request(&request.id, "worker-a", claimed_at).unwrap();
        store.get_request(&request.id).unwrap().unwrap()
    }

    #[test]
    fn test_reconciler_config_default() {
        let config = ReconcilerConfig::default();
        assert_eq!(config.sweep_interval_secs, 60);
        assert_eq!(config.generation_timeout_secs, 600);
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_sweep_ignores_fresh_claims() {
        let (store, _temp) = create_temp_store();
        let config = ReconcilerConfig::default();

        let now = 10_000_000;
        claimed_at(&store, now - 1000, 0); // one second old

        let actions = sweep(&store, &config, now).unwrap();
        assert!(actions.is_empty());
    }

    #[test]
    fn test_sweep_requeues_with_retry_bump() {
        // Claimed at T0 with a 10-minute timeout and no resolution by
        // T0+10m: back to queued with retry_count 1.
        let (store, _temp) = create_temp_store();
        let config = ReconcilerConfig {
            generation_timeout_secs: 600,
            ..Default::default()
        };

        let t0 = 1_000_000;
        let request = claimed_at(&store, t0, 0);

        let now = t0 + 600_000;
        let actions = sweep(&store, &config, now).unwrap();

        assert_eq!(
            actions,
            vec![ReconcileAction::Requeued {
                request_id: request.id.clone(),
                retry_count: 1,
            }]
        );

        let loaded = store.lock().unwrap().get_request(&request.id).unwrap().unwrap();
        assert_eq!(loaded.state, RequestState::Queued);
        assert_eq!(loaded.retry_count, 1);
        assert!(loaded.claimed_by.is_none());

        // Eligible for a fresh claim
        assert!(store.lock().unwrap().claim_request(&request.id, "worker-b", now).unwrap());
    }

    #[test]
    fn test_sweep_fails_after_max_retries() {
        let (store, _temp) = create_temp_store();
        let config = ReconcilerConfig {
            max_retries: 3,
            ..Default::default()
        };

        let request = claimed_at(&store, 0, 3);

        let actions = sweep(&store, &config, 10_000_000).unwrap();
        assert_eq!(
            actions,
            vec![ReconcileAction::Failed {
                request_id: request.id.clone()
            }]
        );

        let loaded = store.lock().unwrap().get_request(&request.id).unwrap().unwrap();
        assert_eq!(loaded.state, RequestState::Failed);
        assert!(loaded.failure_reason.unwrap().contains("timed out"));
    }

    #[test]
    fn test_sweep_handles_mixed_batch() {
        let (store, _temp) = create_temp_store();
        let config = ReconcilerConfig {
            max_retries: 2,
            ..Default::default()
        };

        let retryable = claimed_at(&store, 0, 1);
        let exhausted = claimed_at(&store, 0, 2);
        claimed_at(&store, i64::MAX / 2, 0); // fresh, untouched

        let actions = sweep(&store, &config, 10_000_000).unwrap();
        assert_eq!(actions.len(), 2);
        assert!(actions.contains(&ReconcileAction::Requeued {
            request_id: retryable.id,
            retry_count: 2,
        }));
        assert!(actions.contains(&ReconcileAction::Failed {
            request_id: exhausted.id
        }));
    }

    #[test]
    fn test_sweep_counts_each_requeue() {
        // Three sweeps exhaust a budget of two retries, then fail.
        let (store, _temp) = create_temp_store();
        let config = ReconcilerConfig {
            max_retries: 2,
            generation_timeout_secs: 1,
            ..Default::default()
        };

        let request = claimed_at(&store, 0, 0);

        for expected_retry in 1..=2u32 {
            let actions = sweep(&store, &config, 10_000_000).unwrap();
            assert_eq!(
                actions,
                vec![ReconcileAction::Requeued {
                    request_id: request.id.clone(),
                    retry_count: expected_retry,
                }]
            );
            // Re-claim so the next sweep sees it generating again
            store.lock().unwrap().claim_request(&request.id, "worker-a", 0).unwrap();
        }

        let actions = sweep(&store, &config, 10_000_000).unwrap();
        assert_eq!(
            actions,
            vec![ReconcileAction::Failed {
                request_id: request.id.clone()
            }]
        );
    }
}
