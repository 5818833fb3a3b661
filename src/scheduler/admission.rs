//! Admission control at submission time.
//!
//! Every submission passes through `admit` before a Request record exists.
//! Denials are synchronous and never enter the queue. The counter side
//! effect (`Store::record_admission`) is a single atomic statement so
//! concurrent checks for the same user cannot sneak past the daily limit.

use serde::{Deserialize, Serialize};

use crate::domain::{Tier, User};

/// Rate limit configuration, tier-dependent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Requests per day for free-tier users.
    pub daily_limit_free: u32,
    /// Requests per day for premium users.
    pub daily_limit_premium: u32,
    /// Minimum spacing between requests for free-tier users (seconds).
    pub cooldown_secs_free: u64,
    /// Minimum spacing for premium users (seconds).
    pub cooldown_secs_premium: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            daily_limit_free: 10,
            daily_limit_premium: 50,
            cooldown_secs_free: 300,
            cooldown_secs_premium: 60,
        }
    }
}

impl AdmissionConfig {
    /// Daily limit for a tier. Admins are uncapped.
    pub fn daily_limit(&self, tier: Tier) -> u32 {
        match tier {
            Tier::Free => self.daily_limit_free,
            Tier::Premium => self.daily_limit_premium,
            Tier::Admin => u32::MAX,
        }
    }

    /// Cooldown for a tier, in seconds. Admins have none.
    pub fn cooldown_secs(&self, tier: Tier) -> u64 {
        match tier {
            Tier::Free => self.cooldown_secs_free,
            Tier::Premium => self.cooldown_secs_premium,
            Tier::Admin => 0,
        }
    }
}

/// Why a submission was refused.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    DailyLimitExceeded,
    TimeoutActive,
    CooldownActive,
    QueueFull,
}

impl DenialReason {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            DenialReason::DailyLimitExceeded => "daily_limit_exceeded",
            DenialReason::TimeoutActive => "timeout_active",
            DenialReason::CooldownActive => "cooldown_active",
            DenialReason::QueueFull => "queue_full",
        }
    }
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionDecision {
    Allowed,
    Denied {
        reason: DenialReason,
        retry_after_secs: u64,
    },
}

impl AdmissionDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AdmissionDecision::Allowed)
    }
}

/// Check whether a user may submit to a channel right now.
///
/// Pure: takes the user snapshot and the channel's queue depth, makes no
/// calls of its own. Callers apply the counter side effect separately
/// (`Store::record_admission`) on an allowed outcome.
pub fn admit(
    user: &User,
    queued_depth: usize,
    max_queue_size: u32,
    config: &AdmissionConfig,
    now: i64,
    today: &str,
) -> AdmissionDecision {
    // Active timeout blocks everything else
    if user.timeout_active(now) {
        let remaining = user.timeout_until.map(|until| until - now).unwrap_or(0);
        return AdmissionDecision::Denied {
            reason: DenialReason::TimeoutActive,
            retry_after_secs: (remaining.max(0) as u64).div_ceil(1000),
        };
    }

    // Daily cap, tier-dependent
    if user.requests_today(today) >= config.daily_limit(user.tier) {
        return AdmissionDecision::Denied {
            reason: DenialReason::DailyLimitExceeded,
            retry_after_secs: secs_until_midnight(now),
        };
    }

    // Minimum inter-request spacing, shorter for premium
    let cooldown_secs = config.cooldown_secs(user.tier);
    if cooldown_secs > 0
        && let Some(last) = user.last_request_at
    {
        let elapsed_secs = ((now - last).max(0) as u64) / 1000;
        if elapsed_secs < cooldown_secs {
            return AdmissionDecision::Denied {
                reason: DenialReason::CooldownActive,
                retry_after_secs: cooldown_secs - elapsed_secs,
            };
        }
    }

    // Channel queue cap
    if queued_depth >= max_queue_size as usize {
        return AdmissionDecision::Denied {
            reason: DenialReason::QueueFull,
            retry_after_secs: 60,
        };
    }

    AdmissionDecision::Allowed
}

/// Seconds remaining until the next UTC midnight.
fn secs_until_midnight(now: i64) -> u64 {
    let secs_today = ((now / 1000) % 86_400).max(0) as u64;
    86_400 - secs_today
}
