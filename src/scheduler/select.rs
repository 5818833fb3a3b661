//! Candidate selection for a scheduling tick.
//!
//! On each tick, for one channel:
//! 1. Take the top-K queued requests by calculated priority, excluding
//!    users who already have a request in flight for the channel and users
//!    behind the last N plays (diversity constraint).
//! 2. Apply a small multiplicative jitter to each candidate's score and
//!    pick the max, so a persistent near-tie does not resolve identically
//!    forever.
//!
//! The winner is then claimed with `Store::claim_request`; a lost race
//! just means the next tick picks someone else.

use std::collections::HashSet;

use eyre::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::domain::Request;
use crate::store::Store;

/// Selection knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SelectionConfig {
    /// Candidate pool size per tick.
    pub top_k: usize,
    /// Exclude the submitters of this many most-recent plays.
    pub diversity_window: usize,
    /// Multiplicative jitter applied to candidate scores (0.10 = ±10%).
    pub jitter_pct: f64,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            top_k: 10,
            diversity_window: 3,
            jitter_pct: 0.10,
        }
    }
}

/// Fetch the eligible candidate pool for a channel.
///
/// Over-fetches from the queue so the exclusions do not starve the pool,
/// then truncates to `top_k`.
pub fn eligible_candidates(store: &Store, channel_id: &str, config: &SelectionConfig) -> Result<Vec<Request>> {
    let active = store.active_users(channel_id)?;
    let recent: HashSet<String> = store
        .recent_played_users(channel_id, config.diversity_window)?
        .into_iter()
        .collect();

    let fetched = store.list_queued(channel_id, config.top_k * 4)?;

    let candidates: Vec<Request> = fetched
        .into_iter()
        .filter(|r| !active.contains(&r.user_id) && !recent.contains(&r.user_id))
        .take(config.top_k)
        .collect();

    Ok(candidates)
}

/// Pick the winner from a candidate pool with jittered scores.
pub fn pick_with_jitter<R: Rng>(candidates: Vec<Request>, jitter_pct: f64, rng: &mut R) -> Option<Request> {
    let mut best: Option<(f64, Request)> = None;

    for candidate in candidates {
        let jitter = if jitter_pct > 0.0 {
            1.0 + rng.random_range(-jitter_pct..=jitter_pct)
        } else {
            1.0
        };
        let jittered = candidate.calculated_priority * jitter;

        let replace = match &best {
            Some((score, _)) => jittered > *score,
            None => true,
        };
        if replace {
            best = Some((jittered, candidate));
        }
    }

    best.map(|(_, request)| request)
}

/// Select the next request to run for a channel, if any.
pub fn select_candidate<R: Rng>(
    store: &Store,
    channel_id: &str,
    config: &SelectionConfig,
    rng: &mut R,
) -> Result<Option<Request>> {
    let candidates = eligible_candidates(store, channel_id, config)?;
    Ok(pick_with_jitter(candidates, config.jitter_pct, rng))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RequestState;
    use crate::id::now_ms;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use tempfile::TempDir;

    fn create_temp_store() -> (Store, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = Store::open_at(temp_dir.path()).unwrap();
        (store, temp_dir)
    }

    fn queued(store: &mut Store, user: &str, score: f64) -> Request {
        let mut request = Request::new(user, "chan-1", "prompt", 50);
        request.state = RequestState::Queued;
        request.calculated_priority = score;
        store.save_request(&request).unwrap();
        request
    }

    #[test]
    fn test_selection_config_default() {
        let config = SelectionConfig::default();
        assert_eq!(config.top_k, 10);
        assert_eq!(config.diversity_window, 3);
        assert!((config.jitter_pct - 0.10).abs() < 1e-9);
    }

    #[test]
    fn test_empty_queue_selects_nothing() {
        let (store, _temp) = create_temp_store();
        let mut rng = StdRng::seed_from_u64(7);

        let picked = select_candidate(&store, "chan-1", &SelectionConfig::default(), &mut rng).unwrap();
        assert!(picked.is_none());
    }

    #[test]
    fn test_highest_priority_wins_without_jitter() {
        let (mut store, _temp) = create_temp_store();
        let mut rng = StdRng::seed_from_u64(7);

        queued(&mut store, "user-1", 10.0);
        let top = queued(&mut store, "user-2", 90.0);
        queued(&mut store, "user-3", 50.0);

        let config = SelectionConfig {
            jitter_pct: 0.0,
            ..Default::default()
        };
        let picked = select_candidate(&store, "chan-1", &config, &mut rng).unwrap().unwrap();
        assert_eq!(picked.id, top.id);
    }

    #[test]
    fn test_jitter_cannot_flip_a_wide_margin() {
        let (mut store, _temp) = create_temp_store();
        let mut rng = StdRng::seed_from_u64(7);

        // 90 vs 10: ±10% jitter cannot close that gap
        queued(&mut store, "user-1", 10.0);
        let top = queued(&mut store, "user-2", 90.0);

        for _ in 0..50 {
            let picked = select_candidate(&store, "chan-1", &SelectionConfig::default(), &mut rng)
                .unwrap()
                .unwrap();
            assert_eq!(picked.id, top.id);
        }
    }

    #[test]
    fn test_jitter_breaks_exact_ties_both_ways() {
        let (mut store, _temp) = create_temp_store();
        let mut rng = StdRng::seed_from_u64(7);

        let a = queued(&mut store, "user-1", 50.0);
        let b = queued(&mut store, "user-2", 50.0);

        let mut winners = HashSet::new();
        for _ in 0..100 {
            let picked = select_candidate(&store, "chan-1", &SelectionConfig::default(), &mut rng)
                .unwrap()
                .unwrap();
            winners.insert(picked.id);
        }

        assert!(winners.contains(&a.id));
        assert!(winners.contains(&b.id));
    }

    #[test]
    fn test_excludes_users_with_inflight_requests() {
        let (mut store, _temp) = create_temp_store();
        let mut rng = StdRng::seed_from_u64(7);

        // user-1 already generating in this channel
        let inflight = queued(&mut store, "user-1", 99.0);
        store.claim_request(&inflight.id, "worker-a", now_ms()).unwrap();

        let blocked = queued(&mut store, "user-1", 95.0);
        let other = queued(&mut store, "user-2", 10.0);

        let picked = select_candidate(&store, "chan-1", &SelectionConfig::default(), &mut rng)
            .unwrap()
            .unwrap();
        assert_eq!(picked.id, other.id);
        assert_ne!(picked.id, blocked.id);
    }

    #[test]
    fn test_excludes_recently_played_users() {
        let (mut store, _temp) = create_temp_store();
        let mut rng = StdRng::seed_from_u64(7);

        // user-1 was just played
        let mut played = Request::new("user-1", "chan-1", "prompt", 50);
        played.state = RequestState::Completed;
        store.save_request(&played).unwrap();

        queued(&mut store, "user-1", 99.0);
        let other = queued(&mut store, "user-2", 10.0);

        let picked = select_candidate(&store, "chan-1", &SelectionConfig::default(), &mut rng)
            .unwrap()
            .unwrap();
        assert_eq!(picked.id, other.id);
    }

    #[test]
    fn test_diversity_window_zero_disables_exclusion() {
        let (mut store, _temp) = create_temp_store();
        let mut rng = StdRng::seed_from_u64(7);

        let mut played = Request::new("user-1", "chan-1", "prompt", 50);
        played.state = RequestState::Completed;
        store.save_request(&played).unwrap();

        let again = queued(&mut store, "user-1", 99.0);

        let config = SelectionConfig {
            diversity_window: 0,
            ..Default::default()
        };
        let picked = select_candidate(&store, "chan-1", &config, &mut rng).unwrap().unwrap();
        assert_eq!(picked.id, again.id);
    }

    #[test]
    fn test_all_candidates_excluded_is_noop() {
        let (mut store, _temp) = create_temp_store();
        let mut rng = StdRng::seed_from_u64(7);

        let mut played = Request::new("user-1", "chan-1", "prompt", 50);
        played.state = RequestState::Completed;
        store.save_request(&played).unwrap();

        queued(&mut store, "user-1", 99.0);

        let picked = select_candidate(&store, "chan-1", &SelectionConfig::default(), &mut rng).unwrap();
        assert!(picked.is_none());
    }

    #[test]
    fn test_pool_truncated_to_top_k() {
        let (mut store, _temp) = create_temp_store();

        for i in 0..30 {
            queued(&mut store, &format!("user-{}", i), i as f64);
        }

        let config = SelectionConfig::default();
        let pool = eligible_candidates(&store, "chan-1", &config).unwrap();
        assert_eq!(pool.len(), config.top_k);
        // The pool is the top of the queue, not the bottom
        assert!(pool.iter().all(|r| r.calculated_priority >= 20.0));
    }
}
