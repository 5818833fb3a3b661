//! Priority calculation for request scheduling.
//!
//! Requests are scored by:
//! - Base priority (weighted), reputation (weighted), votes (weighted)
//! - Premium tier boost
//! - Wait bonus (+per hour queued, capped at a max age)
//! - New-user boost (few requests today)
//! - Fairness boost (decays as lifetime plays accumulate)
//!
//! The wait bonus must be positive so that a request that waits long
//! enough eventually wins: that is the starvation-freedom guarantee. The
//! fairness boost keeps one high-reputation or heavily-upvoted user from
//! monopolizing a channel long-term. The final score is clamped to
//! `[0, score_cap]` to bound vote manipulation.
//!
//! Scores are recomputed by a batch job on a fixed cadence; between runs
//! `calculated_priority` is a hint, not an invariant.

use eyre::Result;

use crate::domain::{Channel, PriorityWeights, Request, RequestState, User};
use crate::store::Store;

/// Wait bonus for a request of the given age, capped at `wait_max_hours`.
///
/// Monotonically non-decreasing in age.
pub fn wait_bonus(age_hours: f64, weights: &PriorityWeights) -> f64 {
    weights.wait_per_hour * age_hours.clamp(0.0, weights.wait_max_hours)
}

/// Fairness boost for a user with the given lifetime play count.
///
/// Maximal at zero plays, halved at `fairness_half_life_plays`, decaying
/// toward zero as plays grow.
pub fn fairness_boost(lifetime_plays: u64, weights: &PriorityWeights) -> f64 {
    weights.fairness_max_boost / (1.0 + lifetime_plays as f64 / weights.fairness_half_life_plays)
}

/// Calculate the effective priority score for a request.
///
/// Pure: all inputs are explicit, nothing is read from storage. The shape
/// is fixed; the weights come from the owning channel.
pub fn score(request: &Request, user: &User, weights: &PriorityWeights, now: i64, today: &str) -> f64 {
    let mut score = weights.w_base * request.base_priority as f64
        + weights.w_reputation * user.reputation_score as f64
        + weights.w_votes * request.votes as f64;

    if user.tier.is_premium() {
        score += weights.premium_boost;
    }

    score += wait_bonus(request.age_hours(now), weights);

    if user.requests_today(today) <= weights.new_user_threshold {
        score += weights.new_user_boost;
    }

    score += fairness_boost(user.lifetime_plays, weights);

    score.clamp(0.0, weights.score_cap)
}

/// Recompute `calculated_priority` for every queued request in a channel.
pub fn rescore_channel(store: &mut Store, channel: &Channel, now: i64, today: &str) -> Result<usize> {
    let queued = store.list_requests(Some(RequestState::Queued), Some(&channel.id))?;
    let mut updated = 0;

    for request in queued {
        let user = store.get_or_create_user(&request.user_id)?;
        let new_score = score(&request, &user, &channel.weights, now, today);
        store.update_calculated_priority(&request.id, new_score, now)?;
        updated += 1;
    }

    Ok(updated)
}

/// Recompute scores across all channels. Returns the number of requests
/// touched.
pub fn rescore_all(store: &mut Store, now: i64, today: &str) -> Result<usize> {
    let channels = store.list_channels()?;
    let mut updated = 0;

    for channel in channels {
        updated += rescore_channel(store, &channel, now, today)?;
    }

    tracing::debug!(requests = updated, "Rescored queued requests");

    Ok(updated)
}
