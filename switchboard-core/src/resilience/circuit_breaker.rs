//! Per-provider circuit breaker
//!
//! Closed → Open after `failure_threshold` consecutive failures. An open breaker
//! rejects calls until `timeout_duration_ms` has elapsed, then lets probes through
//! in HalfOpen. `success_threshold` consecutive probe successes close it again; a
//! single probe failure re-opens it and restarts the timer.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// Circuit breaker thresholds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Consecutive half-open successes before closing
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// Time an open breaker waits before allowing probes (milliseconds)
    #[serde(default = "default_timeout_duration")]
    pub timeout_duration_ms: u64,
}

fn default_failure_threshold() -> u32 { 5 }
fn default_success_threshold() -> u32 { 3 }
fn default_timeout_duration() -> u64 { 30_000 }

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            timeout_duration_ms: default_timeout_duration(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_millis(self.timeout_duration_ms)
    }
}

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_transition: Instant,
}

/// Thread-safe circuit breaker
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                last_transition: Instant::now(),
            }),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state; an expired Open breaker reports HalfOpen
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        inner.state
    }

    /// Whether a call may be attempted now
    pub fn can_execute(&self) -> bool {
        self.state() != CircuitState::Open
    }

    pub fn is_open(&self) -> bool {
        !self.can_execute()
    }

    /// Time left before an open breaker admits probes
    pub fn remaining_open(&self) -> Option<Duration> {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        (inner.state == CircuitState::Open).then(|| {
            self.config
                .timeout_duration()
                .saturating_sub(inner.last_transition.elapsed())
        })
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    Self::transition(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    Self::transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => Self::transition(&mut inner, CircuitState::Open),
            // Late failures from calls admitted before opening do not extend the window
            CircuitState::Open => {}
        }
    }

    /// Force the breaker closed
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        Self::transition(&mut inner, CircuitState::Closed);
    }

    fn refresh(&self, inner: &mut BreakerInner) {
        if inner.state == CircuitState::Open
            && inner.last_transition.elapsed() >= self.config.timeout_duration()
        {
            Self::transition(inner, CircuitState::HalfOpen);
        }
    }

    fn transition(inner: &mut BreakerInner, to: CircuitState) {
        if inner.state != to {
            tracing::debug!(from = %inner.state, to = %to, "circuit breaker transition");
        }
        inner.state = to;
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.last_transition = Instant::now();
    }
}
