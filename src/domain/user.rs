//! User record: identity, tier, reputation, submission counters.
//!
//! Users are never deleted, only soft-disabled. Reputation moves only
//! through defined events and is clamped to the configured bounds.

use serde::{Deserialize, Serialize};

use crate::id::now_ms;

/// Subscription tier, affecting priority and rate limits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Premium,
    Admin,
}

impl Tier {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Premium => "premium",
            Tier::Admin => "admin",
        }
    }

    /// Parse from the string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "free" => Some(Tier::Free),
            "premium" => Some(Tier::Premium),
            "admin" => Some(Tier::Admin),
            _ => None,
        }
    }

    /// Premium and admin tiers share the premium scheduling boost.
    pub fn is_premium(&self) -> bool {
        matches!(self, Tier::Premium | Tier::Admin)
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A submitting user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    /// Unique identifier
    pub id: String,

    /// Bounded reputation score, adjusted only via vote/violation events
    pub reputation_score: i32,

    /// Subscription tier
    pub tier: Tier,

    /// Requests admitted today (resets on date rollover)
    pub daily_request_count: u32,

    /// `YYYY-MM-DD` of the last admitted request
    pub last_request_date: Option<String>,

    /// Timestamp (ms) of the last admitted request, for cooldown spacing
    pub last_request_at: Option<i64>,

    /// Blocks new submissions until this timestamp (ms), if set
    pub timeout_until: Option<i64>,

    /// Total requests of this user ever handed to broadcast
    pub lifetime_plays: u64,

    /// Soft-disable flag; disabled users cannot submit
    pub disabled: bool,

    /// Unix timestamp in milliseconds
    pub created_at: i64,
}

impl User {
    /// Create a new free-tier user with neutral reputation.
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            reputation_score: 0,
            tier: Tier::Free,
            daily_request_count: 0,
            last_request_date: None,
            last_request_at: None,
            timeout_until: None,
            lifetime_plays: 0,
            disabled: false,
            created_at: now_ms(),
        }
    }

    /// Apply a reputation delta, clamped to `[min, max]`.
    pub fn adjust_reputation(&mut self, delta: i32, min: i32, max: i32) {
        self.reputation_score = (self.reputation_score.saturating_add(delta)).clamp(min, max);
    }

    /// Daily count as of `today`, accounting for date rollover.
    pub fn requests_today(&self, today: &str) -> u32 {
        if self.last_request_date.as_deref() == Some(today) {
            self.daily_request_count
        } else {
            0
        }
    }

    /// Check whether a submission timeout is active at `now` (ms).
    pub fn timeout_active(&self, now: i64) -> bool {
        self.timeout_until.map(|until| now < until).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_as_str() {
        assert_eq!(Tier::Free.as_str(), "free");
        assert_eq!(Tier::Premium.as_str(), "premium");
        assert_eq!(Tier::Admin.as_str(), "admin");
    }

    #[test]
    fn test_tier_parse_roundtrip() {
        for tier in [Tier::Free, Tier::Premium, Tier::Admin] {
            assert_eq!(Tier::parse(tier.as_str()), Some(tier));
        }
        assert_eq!(Tier::parse("gold"), None);
    }

    #[test]
    fn test_tier_is_premium() {
        assert!(!Tier::Free.is_premium());
        assert!(Tier::Premium.is_premium());
        assert!(Tier::Admin.is_premium());
    }

    #[test]
    fn test_new_user_defaults() {
        let user = User::new("user-1");
        assert_eq!(user.id, "user-1");
        assert_eq!(user.reputation_score, 0);
        assert_eq!(user.tier, Tier::Free);
        assert_eq!(user.daily_request_count, 0);
        assert_eq!(user.lifetime_plays, 0);
        assert!(!user.disabled);
    }

    #[test]
    fn test_adjust_reputation_clamps() {
        let mut user = User::new("user-1");
        user.adjust_reputation(50, -100, 1000);
        assert_eq!(user.reputation_score, 50);

        user.adjust_reputation(10_000, -100, 1000);
        assert_eq!(user.reputation_score, 1000);

        user.adjust_reputation(-10_000, -100, 1000);
        assert_eq!(user.reputation_score, -100);
    }

    #[test]
    fn test_requests_today_rollover() {
        let mut user = User::new("user-1");
        user.daily_request_count = 7;
        user.last_request_date = Some("2026-08-07".to_string());

        assert_eq!(user.requests_today("2026-08-07"), 7);
        // New day, counter is stale
        assert_eq!(user.requests_today("2026-08-08"), 0);
        // No requests yet at all
        user.last_request_date = None;
        assert_eq!(user.requests_today("2026-08-08"), 0);
    }

    #[test]
    fn test_timeout_active() {
        let mut user = User::new("user-1");
        assert!(!user.timeout_active(1000));

        user.timeout_until = Some(2000);
        assert!(user.timeout_active(1999));
        assert!(!user.timeout_active(2000));
    }

    #[test]
    fn test_user_serialization_roundtrip() {
        let user = User::new("user-1");
        let json = serde_json::to_string(&user).unwrap();
        let parsed: User = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, user);
    }
}
