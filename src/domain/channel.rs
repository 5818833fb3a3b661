//! Channel record: a destination queue partition with its own scheduling
//! knobs and moderation strictness.

use serde::{Deserialize, Serialize};

use crate::id::now_ms;

/// Per-channel priority weights.
///
/// The shape of the scoring formula is fixed; only the weights are
/// channel-tunable. See `scheduler::priority::score`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PriorityWeights {
    /// Weight on the submission-time base priority.
    pub w_base: f64,
    /// Weight on the submitter's reputation score.
    pub w_reputation: f64,
    /// Weight on the request's upvote count.
    pub w_votes: f64,
    /// Flat boost for premium-tier submitters.
    pub premium_boost: f64,
    /// Wait bonus per hour queued. Must be positive: age increases
    /// priority, which is what makes the queue starvation-free.
    pub wait_per_hour: f64,
    /// Wait bonus stops growing past this many hours.
    pub wait_max_hours: f64,
    /// Users at or under this many requests today get the new-user boost.
    pub new_user_threshold: u32,
    /// Flat boost for users under the new-user threshold.
    pub new_user_boost: f64,
    /// Fairness boost at zero lifetime plays; decays toward zero as the
    /// user accumulates plays.
    pub fairness_max_boost: f64,
    /// Lifetime plays at which the fairness boost has halved.
    pub fairness_half_life_plays: f64,
    /// Final scores are clamped to `[0, score_cap]` to bound vote
    /// manipulation.
    pub score_cap: f64,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            w_base: 1.0,
            w_reputation: 0.5,
            w_votes: 2.0,
            premium_boost: 15.0,
            wait_per_hour: 4.0,
            wait_max_hours: 12.0,
            new_user_threshold: 3,
            new_user_boost: 10.0,
            fairness_max_boost: 25.0,
            fairness_half_life_plays: 20.0,
            score_cap: 1000.0,
        }
    }
}

/// A destination channel. Every Request belongs to exactly one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Channel {
    /// Unique identifier
    pub id: String,

    /// Human-readable name
    pub name: String,

    /// Admission refuses new requests once this many are queued
    pub max_queue_size: u32,

    /// Strict moderation: borderline verdicts are held for review
    pub moderation_strict: bool,

    /// Channel-tunable priority weights
    pub weights: PriorityWeights,

    /// Unix timestamp in milliseconds
    pub created_at: i64,
}

impl Channel {
    /// Create a channel with default knobs.
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            max_queue_size: 100,
            moderation_strict: false,
            weights: PriorityWeights::default(),
            created_at: now_ms(),
        }
    }

    /// Set the queue size cap.
    pub fn with_max_queue_size(mut self, size: u32) -> Self {
        self.max_queue_size = size;
        self
    }

    /// Set custom priority weights.
    pub fn with_weights(mut self, weights: PriorityWeights) -> Self {
        self.weights = weights;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_weights_sane() {
        let w = PriorityWeights::default();
        assert!(w.wait_per_hour > 0.0, "age must increase priority");
        assert!(w.wait_max_hours > 0.0);
        assert!(w.fairness_max_boost > 0.0);
        assert!(w.score_cap > 0.0);
    }

    #[test]
    fn test_new_channel_defaults() {
        let chan = Channel::new("chan-1", "Lofi Beats");
        assert_eq!(chan.id, "chan-1");
        assert_eq!(chan.name, "Lofi Beats");
        assert_eq!(chan.max_queue_size, 100);
        assert!(!chan.moderation_strict);
        assert_eq!(chan.weights, PriorityWeights::default());
    }

    #[test]
    fn test_channel_builder() {
        let mut weights = PriorityWeights::default();
        weights.premium_boost = 30.0;

        let chan = Channel::new("chan-1", "Synthwave")
            .with_max_queue_size(25)
            .with_weights(weights.clone());

        assert_eq!(chan.max_queue_size, 25);
        assert_eq!(chan.weights, weights);
    }

    #[test]
    fn test_weights_deserialize_partial() {
        // Unspecified knobs fall back to defaults
        let w: PriorityWeights = serde_json::from_str(r#"{"w_votes": 5.0}"#).unwrap();
        assert_eq!(w.w_votes, 5.0);
        assert_eq!(w.w_base, PriorityWeights::default().w_base);
    }

    #[test]
    fn test_channel_serialization_roundtrip() {
        let chan = Channel::new("chan-1", "Jazz");
        let json = serde_json::to_string(&chan).unwrap();
        let parsed: Channel = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, chan);
    }
}
