//! API key rotation for rate-limited providers
//!
//! A key that draws a 429 is parked for `min(base × 2^error_count, max)` and the
//! pointer moves on to the next key that is still usable.

use crate::config::SecretString;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Backoff applied to a rate-limited key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeyRotationConfig {
    /// Base backoff in milliseconds
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    /// Backoff cap in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

fn default_base_delay() -> u64 { 300_000 }
fn default_max_delay() -> u64 { 3_600_000 }

impl Default for KeyRotationConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

impl KeyRotationConfig {
    /// Backoff for a key that has now failed `error_count` times
    pub fn backoff(&self, error_count: u32) -> Duration {
        let multiplier = 2u64.saturating_pow(error_count);
        Duration::from_millis(self.base_delay_ms.saturating_mul(multiplier).min(self.max_delay_ms))
    }
}

#[derive(Debug, Clone, Default)]
struct KeyStatus {
    rate_limited_until: Option<Instant>,
    error_count: u32,
}

impl KeyStatus {
    fn is_available(&self, now: Instant) -> bool {
        self.rate_limited_until.map_or(true, |until| now >= until)
    }
}

/// Rotation state of one provider's keys
#[derive(Debug)]
pub struct KeyRotation {
    keys: Vec<SecretString>,
    status: Vec<KeyStatus>,
    current: usize,
    config: KeyRotationConfig,
}

impl KeyRotation {
    pub fn new(keys: Vec<SecretString>, config: KeyRotationConfig) -> Self {
        let status = vec![KeyStatus::default(); keys.len()];
        Self {
            keys,
            status,
            current: 0,
            config,
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Index the pointer currently rests on
    pub fn current_index(&self) -> usize {
        self.current
    }

    /// Lowest-index usable key; expired limits are cleared on the way
    pub fn active_key(&mut self) -> Option<(usize, SecretString)> {
        let now = Instant::now();
        let index = self.status.iter().position(|s| s.is_available(now))?;
        self.status[index].rate_limited_until = None;
        self.current = index;
        Some((index, self.keys[index].clone()))
    }

    /// Park `index` after a 429; returns the backoff applied
    pub fn mark_rate_limited(&mut self, index: usize) -> Duration {
        let now = Instant::now();
        let Some(status) = self.status.get_mut(index) else {
            return Duration::ZERO;
        };
        status.error_count += 1;
        let backoff = self.config.backoff(status.error_count);
        status.rate_limited_until = Some(now + backoff);

        let len = self.status.len();
        if let Some(next) = (1..len)
            .map(|offset| (index + offset) % len)
            .find(|&i| self.status[i].is_available(now))
        {
            self.current = next;
        }

        backoff
    }

    pub fn record_success(&mut self, index: usize) {
        if let Some(status) = self.status.get_mut(index) {
            status.error_count = status.error_count.saturating_sub(1);
        }
    }

    pub fn error_count(&self, index: usize) -> u32 {
        self.status.get(index).map_or(0, |s| s.error_count)
    }

    pub fn is_rate_limited(&self, index: usize) -> bool {
        let now = Instant::now();
        self.status.get(index).is_some_and(|s| !s.is_available(now))
    }

    pub fn available_count(&self) -> usize {
        let now = Instant::now();
        self.status.iter().filter(|s| s.is_available(now)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn keys(n: usize) -> Vec<SecretString> {
        (0..n).map(|i| SecretString::new(format!("key-{}", i))).collect()
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = KeyRotationConfig::default();
        assert_eq!(config.backoff(1), Duration::from_millis(600_000));
        assert_eq!(config.backoff(2), Duration::from_millis(1_200_000));
        assert_eq!(config.backoff(4), Duration::from_millis(3_600_000));
        assert_eq!(config.backoff(64), Duration::from_millis(3_600_000));
    }

    #[test]
    fn test_rotation_skips_limited_keys() {
        let mut rotation = KeyRotation::new(keys(4), KeyRotationConfig::default());
        assert_eq!(rotation.active_key().unwrap().0, 0);

        rotation.mark_rate_limited(0);
        assert_eq!(rotation.current_index(), 1);
        assert_eq!(rotation.active_key().unwrap().0, 1);

        rotation.mark_rate_limited(1);
        rotation.mark_rate_limited(2);
        assert_eq!(rotation.active_key().unwrap().0, 3);
        assert!(rotation.is_rate_limited(0));

        rotation.mark_rate_limited(3);
        assert!(rotation.active_key().is_none());
        assert_eq!(rotation.available_count(), 0);
    }

    #[test]
    fn test_pointer_wraps() {
        let mut rotation = KeyRotation::new(keys(3), KeyRotationConfig::default());
        rotation.mark_rate_limited(2);
        assert_eq!(rotation.current_index(), 0);
    }

    #[test]
    fn test_key_returns_after_window() {
        let config = KeyRotationConfig {
            base_delay_ms: 10,
            max_delay_ms: 20,
        };
        let mut rotation = KeyRotation::new(keys(2), config);
        rotation.mark_rate_limited(0);
        assert_eq!(rotation.active_key().unwrap().0, 1);

        thread::sleep(Duration::from_millis(40));
        assert_eq!(rotation.active_key().unwrap().0, 0);
    }

    #[test]
    fn test_success_decrements_error_count() {
        let mut rotation = KeyRotation::new(keys(2), KeyRotationConfig::default());
        rotation.mark_rate_limited(0);
        assert_eq!(rotation.error_count(0), 1);
        rotation.record_success(0);
        rotation.record_success(0);
        assert_eq!(rotation.error_count(0), 0);
    }
}
