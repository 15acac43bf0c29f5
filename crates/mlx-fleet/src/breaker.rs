//! Per-instance circuit breaker with an adaptive failure threshold.
//!
//! Repeated failures open the circuit and remove the instance from the
//! dispatcher's eligible set. After `recovery_timeout` a single probe is
//! admitted (half-open); its outcome decides whether the circuit closes or
//! re-opens. The threshold adapts within [3, 10]: each open-trigger raises
//! it, each recovery lowers it, so a flaky instance has to prove itself for
//! longer while a quickly-recovered one is trusted again sooner.

use std::time::{Duration, Instant};

/// Circuit states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Requests flow normally.
    Closed,
    /// Failures reached the threshold — the instance is vetoed.
    Open,
    /// Recovery timeout elapsed — one attempt is admitted to test the water.
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        }
    }
}

/// Lower bound for the adaptive threshold.
const MIN_THRESHOLD: u32 = 3;
/// Upper bound for the adaptive threshold.
const MAX_THRESHOLD: u32 = 10;

/// Adaptive circuit breaker. One per instance, guarded by the instance lock.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: BreakerState,
    consecutive_failures: u32,
    adaptive_threshold: u32,
    recovery_timeout: Duration,
    last_failure_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            adaptive_threshold: failure_threshold,
            recovery_timeout,
            last_failure_at: None,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn adaptive_threshold(&self) -> u32 {
        self.adaptive_threshold
    }

    /// Record a successful attempt (proxy response or health probe).
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        if self.state == BreakerState::HalfOpen {
            self.state = BreakerState::Closed;
            self.adaptive_threshold = self.adaptive_threshold.saturating_sub(1).max(MIN_THRESHOLD);
        }
    }

    /// Record a failed attempt. Opens the circuit at the adaptive threshold.
    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        self.last_failure_at = Some(Instant::now());

        if self.consecutive_failures >= self.adaptive_threshold {
            self.state = BreakerState::Open;
            self.adaptive_threshold = (self.adaptive_threshold + 1).min(MAX_THRESHOLD);
        }
    }

    /// Whether an attempt may be made right now.
    ///
    /// An open circuit transitions to half-open (and admits the attempt)
    /// once `recovery_timeout` has elapsed since the last failure.
    pub fn can_attempt(&mut self) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let recovered = self
                    .last_failure_at
                    .map(|at| at.elapsed() > self.recovery_timeout)
                    .unwrap_or(true);
                if recovered {
                    self.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => true,
        }
    }
}
