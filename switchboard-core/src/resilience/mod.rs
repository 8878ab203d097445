//! Resilience ledger
//!
//! Per-provider health: a circuit breaker for every provider and a key rotation
//! for providers configured with more than one API key. The dispatcher takes a
//! [`KeyLease`] before each upstream call and reports the outcome against it.

pub mod circuit_breaker;
pub mod key_rotation;
pub mod rate_limit;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use key_rotation::{KeyRotation, KeyRotationConfig};
pub use rate_limit::is_rate_limit_error;
pub use retry::{retry_with_backoff, should_retry, RetryPolicy};

use crate::config::{ProviderProfile, ResilienceConfig, SecretString};
use crate::error::{GatewayError, GatewayResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Key granted for one upstream attempt
#[derive(Debug, Clone)]
pub struct KeyLease {
    pub provider: String,
    pub key_index: usize,
    pub key: SecretString,
}

/// What the ledger did with a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// The key was parked; another attempt may pick a different key
    Rotated,
    /// Rate limited on a provider without rotation
    RateLimited,
    /// Counted against the circuit breaker
    Counted,
    /// Not a provider health signal
    Ignored,
}

#[derive(Debug)]
struct ProviderLedger {
    breaker: CircuitBreaker,
    primary_key: SecretString,
    rotation: Option<Mutex<KeyRotation>>,
}

impl ProviderLedger {
    fn new(profile: &ProviderProfile, config: &ResilienceConfig) -> Self {
        let rotation = (profile.api_keys.len() > 1).then(|| {
            Mutex::new(KeyRotation::new(
                profile.api_keys.clone(),
                config.key_rotation.clone(),
            ))
        });
        Self {
            breaker: CircuitBreaker::new(config.circuit_breaker.clone()),
            primary_key: profile.api_keys.first().cloned().unwrap_or_else(|| SecretString::new("")),
            rotation,
        }
    }
}

/// Shared per-provider resilience state
#[derive(Debug)]
pub struct ResilienceLedger {
    config: ResilienceConfig,
    providers: Mutex<HashMap<String, Arc<ProviderLedger>>>,
}

impl ResilienceLedger {
    pub fn new(config: ResilienceConfig, profiles: &[ProviderProfile]) -> Self {
        let providers = profiles
            .iter()
            .map(|p| (p.name.clone(), Arc::new(ProviderLedger::new(p, &config))))
            .collect();
        Self {
            config,
            providers: Mutex::new(providers),
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.config.retry
    }

    fn entry(&self, provider: &str) -> GatewayResult<Arc<ProviderLedger>> {
        self.providers
            .lock()
            .get(provider)
            .cloned()
            .ok_or_else(|| GatewayError::configuration(format!("Unknown provider '{}'", provider)))
    }

    /// Check eligibility and pick the key for the next attempt
    pub fn acquire(&self, provider: &str) -> GatewayResult<KeyLease> {
        let entry = self.entry(provider)?;

        if let Some(remaining) = entry.breaker.remaining_open() {
            return Err(GatewayError::unavailable(
                provider,
                format!("circuit open, retry in {}ms", remaining.as_millis()),
            ));
        }

        let (key_index, key) = match &entry.rotation {
            None => (0, entry.primary_key.clone()),
            Some(rotation) => rotation.lock().active_key().ok_or_else(|| {
                GatewayError::unavailable(provider, "all API keys are rate limited")
            })?,
        };

        Ok(KeyLease {
            provider: provider.to_string(),
            key_index,
            key,
        })
    }

    pub fn record_success(&self, lease: &KeyLease) {
        let Ok(entry) = self.entry(&lease.provider) else {
            return;
        };
        entry.breaker.record_success();
        if let Some(rotation) = &entry.rotation {
            rotation.lock().record_success(lease.key_index);
        }
    }

    pub fn record_failure(&self, lease: &KeyLease, error: &GatewayError) -> FailureDisposition {
        let Ok(entry) = self.entry(&lease.provider) else {
            return FailureDisposition::Ignored;
        };

        if is_rate_limit_error(error) {
            let Some(rotation) = &entry.rotation else {
                return FailureDisposition::RateLimited;
            };
            let mut rotation = rotation.lock();
            let backoff = rotation.mark_rate_limited(lease.key_index);
            tracing::warn!(
                provider = %lease.provider,
                key = %lease.key.partial_redact(),
                key_index = lease.key_index,
                backoff_ms = backoff.as_millis() as u64,
                available = rotation.available_count(),
                "API key rate limited, rotating"
            );
            return FailureDisposition::Rotated;
        }

        if error.counts_against_provider() {
            entry.breaker.record_failure();
            if entry.breaker.is_open() {
                tracing::error!(provider = %lease.provider, "circuit breaker opened");
            }
            return FailureDisposition::Counted;
        }

        FailureDisposition::Ignored
    }

    pub fn circuit_state(&self, provider: &str) -> Option<CircuitState> {
        self.entry(provider).ok().map(|e| e.breaker.state())
    }

    pub fn is_open(&self, provider: &str) -> bool {
        self.entry(provider).is_ok_and(|e| e.breaker.is_open())
    }

    /// Close the breaker of `provider`
    pub fn reset(&self, provider: &str) {
        if let Ok(entry) = self.entry(provider) {
            entry.breaker.reset();
        }
    }

    /// Rotation pointer of `provider`, if it rotates keys
    pub fn current_key_index(&self, provider: &str) -> Option<usize> {
        let entry = self.entry(provider).ok()?;
        let rotation = entry.rotation.as_ref()?;
        let index = rotation.lock().current_index();
        Some(index)
    }
}
