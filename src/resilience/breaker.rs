//! Circuit breaker for the external generation provider.
//!
//! Closed: calls pass through, consecutive failures are counted. Open:
//! calls are refused without touching the network until the cooldown
//! elapses. Half-open: a bounded number of probe calls go through; any
//! failure reopens immediately, enough successes close the breaker.
//!
//! One breaker instance guards one provider and is injected wherever that
//! provider is called. A refused call is never attributed to the request
//! being scheduled; the request simply stays queued.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Breaker tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker open.
    pub failure_threshold: u32,
    /// How long to refuse calls once open (seconds).
    pub cooldown_secs: u64,
    /// Probe calls allowed through while half-open.
    pub half_open_max_probes: u32,
    /// Probe successes required to close again.
    pub half_open_successes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 30,
            half_open_max_probes: 1,
            half_open_successes: 1,
        }
    }
}

impl BreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// Per-provider circuit breaker state.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: BreakerState,
    consecutive_failures: u32,
    /// Probes issued since entering half-open.
    probes_issued: u32,
    /// Probe successes since entering half-open.
    probe_successes: u32,
    /// When an open breaker next allows a probe.
    next_attempt_at: Option<Instant>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: BreakerState::Closed,
            consecutive_failures: 0,
            probes_issued: 0,
            probe_successes: 0,
            next_attempt_at: None,
        }
    }

    /// Current state, advancing open -> half-open if the cooldown elapsed.
    pub fn state(&mut self) -> BreakerState {
        if self.state == BreakerState::Open
            && let Some(at) = self.next_attempt_at
            && Instant::now() >= at
        {
            self.enter_half_open();
        }
        self.state
    }

    /// Would a call be allowed right now? Does not consume a probe slot.
    pub fn is_callable(&mut self) -> bool {
        match self.state() {
            BreakerState::Closed => true,
            BreakerState::Open => false,
            BreakerState::HalfOpen => self.probes_issued < self.config.half_open_max_probes,
        }
    }

    /// Try to acquire permission for one call. Half-open acquisitions
    /// consume a probe slot.
    pub fn try_acquire(&mut self) -> bool {
        match self.state() {
            BreakerState::Closed => true,
            BreakerState::Open => false,
            BreakerState::HalfOpen => {
                if self.probes_issued < self.config.half_open_max_probes {
                    self.probes_issued += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful provider call.
    pub fn record_success(&mut self) {
        match self.state {
            BreakerState::Closed => {
                self.consecutive_failures = 0;
            }
            BreakerState::HalfOpen => {
                self.probe_successes += 1;
                if self.probe_successes >= self.config.half_open_successes {
                    self.close();
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Record a failed provider call.
    pub fn record_failure(&mut self) {
        match self.state {
            BreakerState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.config.failure_threshold {
                    self.trip();
                }
            }
            // Any half-open failure reopens immediately
            BreakerState::HalfOpen => self.trip(),
            BreakerState::Open => {}
        }
    }

    /// Consecutive failure count (diagnostics).
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    fn trip(&mut self) {
        self.state = BreakerState::Open;
        self.next_attempt_at = Some(Instant::now() + self.config.cooldown());
        self.probes_issued = 0;
        self.probe_successes = 0;

        tracing::warn!(
            consecutive_failures = self.consecutive_failures,
            cooldown_secs = self.config.cooldown_secs,
            "Circuit breaker opened"
        );
    }

    fn enter_half_open(&mut self) {
        self.state = BreakerState::HalfOpen;
        self.probes_issued = 0;
        self.probe_successes = 0;
        tracing::info!("Circuit breaker half-open, allowing probes");
    }

    fn close(&mut self) {
        self.state = BreakerState::Closed;
        self.consecutive_failures = 0;
        self.probes_issued = 0;
        self.probe_successes = 0;
        self.next_attempt_at = None;
        tracing::info!("Circuit breaker closed");
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            cooldown_secs: 0, // sub-second via next_attempt_at, tests sleep past it
            half_open_max_probes: 1,
            half_open_successes: 1,
        }
    }

    #[test]
    fn test_breaker_starts_closed() {
        let mut breaker = CircuitBreaker::default();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.try_acquire());
    }

    #[test]
    fn test_failures_below_threshold_stay_closed() {
        let mut breaker = CircuitBreaker::new(fast_config());
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.try_acquire());
    }

    #[test]
    fn test_threshold_failures_trip_open() {
        let mut breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 3,
            cooldown_secs: 60,
            ..Default::default()
        });

        for _ in 0..3 {
            breaker.record_failure();
        }

        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.try_acquire());
        assert!(!breaker.is_callable());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let mut breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 3,
            ..Default::default()
        });

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.consecutive_failures(), 0);

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_after_cooldown_allows_one_probe() {
        let mut breaker = CircuitBreaker::new(fast_config());

        for _ in 0..3 {
            breaker.record_failure();
        }
        // Cooldown of zero elapses immediately
        thread::sleep(std::time::Duration::from_millis(5));

        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        // Exactly one probe allowed
        assert!(breaker.try_acquire());
        assert!(!breaker.try_acquire());
    }

    #[test]
    fn test_half_open_success_closes() {
        let mut breaker = CircuitBreaker::new(fast_config());

        for _ in 0..3 {
            breaker.record_failure();
        }
        thread::sleep(std::time::Duration::from_millis(5));

        assert!(breaker.try_acquire());
        breaker.record_success();

        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
        assert!(breaker.try_acquire());
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let mut breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 3,
            cooldown_secs: 0,
            half_open_max_probes: 1,
            half_open_successes: 1,
        });

        for _ in 0..3 {
            breaker.record_failure();
        }
        thread::sleep(std::time::Duration::from_millis(5));

        assert!(breaker.try_acquire());
        breaker.record_failure();

        // Back open; the cooldown restarts
        assert!(matches!(breaker.state, BreakerState::Open));
    }

    #[test]
    fn test_half_open_requires_success_threshold() {
        let mut breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 1,
            cooldown_secs: 0,
            half_open_max_probes: 2,
            half_open_successes: 2,
        });

        breaker.record_failure();
        thread::sleep(std::time::Duration::from_millis(5));

        assert!(breaker.try_acquire());
        breaker.record_success();
        // One success is not enough
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        assert!(breaker.try_acquire());
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_is_callable_does_not_consume_probe() {
        let mut breaker = CircuitBreaker::new(fast_config());

        for _ in 0..3 {
            breaker.record_failure();
        }
        thread::sleep(std::time::Duration::from_millis(5));

        assert!(breaker.is_callable());
        assert!(breaker.is_callable());
        // The probe slot is still available
        assert!(breaker.try_acquire());
    }

    #[test]
    fn test_open_stays_open_before_cooldown() {
        let mut breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 1,
            cooldown_secs: 3600,
            ..Default::default()
        });

        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.try_acquire());
        // Redundant signals while open are no-ops
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Open);
    }
}
