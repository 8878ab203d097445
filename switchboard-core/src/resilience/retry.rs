//! Retry policy with exponential backoff
//!
//! The delay before retry `n` is `min_timeout × factor^n`, capped at
//! `max_timeout`, with optional symmetric jitter.

use crate::error::{GatewayError, GatewayResult, NetworkErrorKind};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    /// Maximum number of retries (not including the initial attempt)
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Exponential growth factor
    #[serde(default = "default_factor")]
    pub factor: f64,

    /// Delay before the first retry (milliseconds)
    #[serde(default = "default_min_timeout")]
    pub min_timeout_ms: u64,

    /// Maximum delay between retries (milliseconds)
    #[serde(default = "default_max_timeout")]
    pub max_timeout_ms: u64,

    /// Jitter factor (0.0 to 1.0) to randomize delays
    #[serde(default)]
    pub jitter_factor: f64,
}

fn default_retries() -> u32 { 3 }
fn default_factor() -> f64 { 2.0 }
fn default_min_timeout() -> u64 { 1_000 }
fn default_max_timeout() -> u64 { 30_000 }

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            factor: default_factor(),
            min_timeout_ms: default_min_timeout(),
            max_timeout_ms: default_max_timeout(),
            jitter_factor: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with a custom retry budget
    pub fn new(retries: u32) -> Self {
        Self {
            retries,
            ..Default::default()
        }
    }

    /// Create a policy with no retries
    pub fn no_retry() -> Self {
        Self::new(0)
    }

    /// Calculate the delay before retry number `attempt` (0-based)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base_delay = self.min_timeout_ms as f64 * self.factor.powi(exponent);
        let capped_delay = base_delay.min(self.max_timeout_ms as f64);

        let delay_with_jitter = if self.jitter_factor > 0.0 {
            let jitter_range = capped_delay * self.jitter_factor;
            let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
            (capped_delay + jitter).max(0.0)
        } else {
            capped_delay
        };

        Duration::from_millis(delay_with_jitter as u64)
    }
}

/// Whether a failed attempt may be retried
pub fn should_retry(error: &GatewayError) -> bool {
    match error {
        GatewayError::Api { status, .. } => *status >= 500 || *status == 429,
        GatewayError::Network { kind, .. } => matches!(
            kind,
            NetworkErrorKind::Connect | NetworkErrorKind::Timeout | NetworkErrorKind::Dns
        ),
        GatewayError::Configuration(_)
        | GatewayError::CircuitBreaker { .. }
        | GatewayError::Transform { .. }
        | GatewayError::Cancelled => false,
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or the
/// retry budget is spent. The last error is returned.
pub async fn retry_with_backoff<F, Fut, T>(policy: &RetryPolicy, mut operation: F) -> GatewayResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = GatewayResult<T>>,
{
    let mut attempt = 0;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt >= policy.retries || !should_retry(&error) {
                    return Err(error);
                }

                let delay = policy.calculate_delay(attempt);
                tracing::warn!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "retrying after failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use test_case::test_case;

    fn api(status: u16) -> GatewayError {
        GatewayError::Api {
            status,
            provider: "p".into(),
            model: "m".into(),
            message: "boom".into(),
            details: None,
        }
    }

    fn fast(retries: u32) -> RetryPolicy {
        RetryPolicy {
            min_timeout_ms: 1,
            max_timeout_ms: 5,
            ..RetryPolicy::new(retries)
        }
    }

    #[test]
    fn test_exponential_backoff_calculation() {
        let policy = RetryPolicy {
            retries: 5,
            factor: 2.0,
            min_timeout_ms: 100,
            max_timeout_ms: 1_000,
            jitter_factor: 0.0,
        };
        assert_eq!(policy.calculate_delay(0).as_millis(), 100);
        assert_eq!(policy.calculate_delay(1).as_millis(), 200);
        assert_eq!(policy.calculate_delay(3).as_millis(), 800);
        assert_eq!(policy.calculate_delay(4).as_millis(), 1_000);
    }

    #[test_case(api(500), true ; "server error")]
    #[test_case(api(503), true ; "unavailable")]
    #[test_case(api(429), true ; "rate limited")]
    #[test_case(api(400), false ; "bad request")]
    #[test_case(api(401), false ; "unauthorized")]
    #[test_case(GatewayError::Network { kind: NetworkErrorKind::Timeout, message: "t".into() }, true ; "timeout")]
    #[test_case(GatewayError::Network { kind: NetworkErrorKind::Dns, message: "d".into() }, true ; "dns")]
    #[test_case(GatewayError::configuration("x"), false ; "configuration")]
    #[test_case(GatewayError::unavailable("p", "open"), false ; "circuit open")]
    #[test_case(GatewayError::transform("openai", "bad"), false ; "transform")]
    #[test_case(GatewayError::Cancelled, false ; "cancelled")]
    fn test_should_retry(error: GatewayError, expected: bool) {
        assert_eq!(should_retry(&error), expected);
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(&fast(3), |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(api(502))
                } else {
                    Ok("ok")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_surfaces_last_error() {
        let calls = AtomicU32::new(0);
        let result: GatewayResult<()> = retry_with_backoff(&fast(2), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(api(500)) }
        })
        .await;
        assert_eq!(result.unwrap_err().upstream_status(), Some(500));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_stops_immediately() {
        let calls = AtomicU32::new(0);
        let result: GatewayResult<()> = retry_with_backoff(&RetryPolicy::new(5), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(api(400)) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    proptest! {
        #[test]
        fn prop_delay_never_exceeds_cap(attempt in 0u32..64, min in 1u64..5_000, max in 5_000u64..60_000) {
            let policy = RetryPolicy {
                retries: 3,
                factor: 2.0,
                min_timeout_ms: min,
                max_timeout_ms: max,
                jitter_factor: 0.0,
            };
            let delay = policy.calculate_delay(attempt).as_millis() as u64;
            prop_assert!(delay <= max);
            prop_assert!(delay >= min.min(max));
        }
    }
}
