//! Generic retry envelope with exponential backoff and jitter.
//!
//! `retry_with_backoff` is parameterized by an error classifier so each
//! outbound call site decides which failures are worth retrying. The delay
//! schedule is `base * 2^attempt` with multiplicative jitter, capped, and
//! a classifier-supplied hint (e.g. a Retry-After header) can lengthen an
//! individual wait.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// What to do with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryVerdict {
    /// Give up now; the error is terminal.
    Terminal,
    /// Back off and try again.
    Retry,
    /// Try again, waiting at least this long.
    RetryAfter(Duration),
}

/// Backoff tuning for one call site.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry (milliseconds).
    pub base_delay_ms: u64,
    /// Delays never exceed this (milliseconds).
    pub max_delay_ms: u64,
    /// Multiplicative jitter fraction (0.25 = ±25%).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Compute the backoff delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay_ms.saturating_mul(1u64 << attempt.min(16));
        let capped = exp.min(self.max_delay_ms);

        let jittered = if self.jitter > 0.0 {
            let factor = 1.0 + rand::rng().random_range(-self.jitter..=self.jitter);
            (capped as f64 * factor).max(0.0) as u64
        } else {
            capped
        };

        Duration::from_millis(jittered.min(self.max_delay_ms))
    }
}

/// Run `op` until it succeeds, the classifier declares the error terminal,
/// or attempts run out. Returns the last error on exhaustion.
pub async fn retry_with_backoff<T, E, Op, Fut, Cls>(policy: &RetryPolicy, classify: Cls, mut op: Op) -> Result<T, E>
where
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    Cls: Fn(&E) -> RetryVerdict,
    E: std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;

                let verdict = classify(&err);
                if verdict == RetryVerdict::Terminal || attempt >= policy.max_attempts {
                    return Err(err);
                }

                let mut delay = policy.delay_for(attempt);
                if let RetryVerdict::RetryAfter(hint) = verdict {
                    delay = delay.max(hint);
                }

                tracing::debug!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying after backoff"
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn instant_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
            jitter: 0.0,
        }
    }

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay_ms, 500);
        assert_eq!(policy.max_delay_ms, 30_000);
    }

    #[test]
    fn test_delay_doubles_per_attempt() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 60_000,
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
    }

    #[test]
    fn test_delay_capped() {
        let policy = RetryPolicy {
            max_attempts: 20,
            base_delay_ms: 1000,
            max_delay_ms: 5000,
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for(10), Duration::from_millis(5000));
    }

    #[test]
    fn test_delay_jitter_stays_in_band() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            jitter: 0.25,
        };

        for _ in 0..50 {
            let delay = policy.delay_for(1).as_millis() as u64;
            // 2000 ± 25%
            assert!((1500..=2500).contains(&delay), "delay={}", delay);
        }
    }

    #[tokio::test]
    async fn test_success_first_try() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let result: Result<u32, String> = retry_with_backoff(
            &instant_policy(3),
            |_| RetryVerdict::Retry,
            move |_| {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(42)
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let result: Result<u32, String> = retry_with_backoff(
            &instant_policy(5),
            |_| RetryVerdict::Retry,
            move |_| {
                let calls = calls2.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < 2 { Err("transient".to_string()) } else { Ok(7) }
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_terminal_error_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let result: Result<u32, String> = retry_with_backoff(
            &instant_policy(5),
            |_| RetryVerdict::Terminal,
            move |_| {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("malformed request".to_string())
                }
            },
        )
        .await;

        assert!(result.is_err());
        // Exactly one attempt, zero retries
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempts_bounded() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let result: Result<u32, String> = retry_with_backoff(
            &instant_policy(3),
            |_| RetryVerdict::Retry,
            move |_| {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("still broken".to_string())
                }
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_after_hint_extends_delay() {
        // With a zero policy the only wait comes from the hint; keep it
        // tiny so the test stays fast but measurable.
        let start = std::time::Instant::now();

        let result: Result<u32, String> = retry_with_backoff(
            &instant_policy(2),
            |_| RetryVerdict::RetryAfter(Duration::from_millis(30)),
            |attempt| async move {
                if attempt == 0 { Err("429".to_string()) } else { Ok(1) }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 1);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
