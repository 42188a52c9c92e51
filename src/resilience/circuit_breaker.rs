use dashmap::DashMap;
use std::time::{Duration, Instant};

use crate::error::EngineError;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen, // Cool-down elapsed, next attempt is a probe
}

#[derive(Debug, Clone, Default)]
struct BreakerEntry {
    consecutive_failures: u32,
    last_failure: Option<Instant>,
}

/// Per-key circuit breakers for external dependencies
///
/// A key opens after `failure_threshold` consecutive failures and stays open
/// until `reset_timeout` passes without new attempts. The first call after the
/// cool-down is let through as a probe: success closes the key, failure
/// re-opens it for another full cool-down.
pub struct CircuitBreakerRegistry {
    entries: DashMap<String, BreakerEntry>,
    failure_threshold: u32,
    reset_timeout: Duration,
}

impl CircuitBreakerRegistry {
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
        }
    }

    pub fn state(&self, key: &str) -> CircuitState {
        let Some(entry) = self.entries.get(key) else {
            return CircuitState::Closed;
        };

        if entry.consecutive_failures < self.failure_threshold {
            return CircuitState::Closed;
        }

        match entry.last_failure {
            Some(at) if at.elapsed() < self.reset_timeout => CircuitState::Open,
            _ => CircuitState::HalfOpen,
        }
    }

    pub fn is_open(&self, key: &str) -> bool {
        self.state(key) == CircuitState::Open
    }

    /// Fail fast with `CircuitOpen` while the key is cooling down
    ///
    /// Once the cool-down has elapsed exactly one caller is admitted as the
    /// probe; admitting it restarts the cool-down for everyone else.
    pub fn check(&self, key: &str) -> Result<()> {
        let Some(mut entry) = self.entries.get_mut(key) else {
            return Ok(());
        };

        if entry.consecutive_failures < self.failure_threshold {
            return Ok(());
        }

        if let Some(at) = entry.last_failure {
            let elapsed = at.elapsed();
            if elapsed < self.reset_timeout {
                return Err(EngineError::CircuitOpen {
                    key: key.to_string(),
                    retry_in: self.reset_timeout - elapsed,
                });
            }
        }

        entry.last_failure = Some(Instant::now());
        tracing::debug!(key, "Circuit cool-down elapsed, allowing probe");
        Ok(())
    }

    pub fn record_success(&self, key: &str) {
        if let Some((_, entry)) = self.entries.remove(key) {
            if entry.consecutive_failures >= self.failure_threshold {
                tracing::info!(key, "Circuit closed - dependency recovered");
            }
        }
    }

    pub fn record_failure(&self, key: &str) {
        let mut entry = self.entries.entry(key.to_string()).or_default();
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        entry.last_failure = Some(Instant::now());

        if entry.consecutive_failures == self.failure_threshold {
            tracing::warn!(
                key,
                failures = entry.consecutive_failures,
                cooldown_ms = self.reset_timeout.as_millis() as u64,
                "Circuit opened"
            );
        } else if entry.consecutive_failures > self.failure_threshold {
            tracing::warn!(key, "Probe failed, circuit re-opened");
        }
    }

    pub fn failure_count(&self, key: &str) -> u32 {
        self.entries
            .get(key)
            .map(|e| e.consecutive_failures)
            .unwrap_or(0)
    }

    pub fn reset(&self, key: &str) {
        self.entries.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_after_threshold() {
        let breakers = CircuitBreakerRegistry::new(3, Duration::from_secs(60));

        breakers.record_failure("jupiter");
        breakers.record_failure("jupiter");
        assert_eq!(breakers.state("jupiter"), CircuitState::Closed);
        assert!(breakers.check("jupiter").is_ok());

        breakers.record_failure("jupiter");
        assert_eq!(breakers.state("jupiter"), CircuitState::Open);

        let err = breakers.check("jupiter").unwrap_err();
        assert!(matches!(err, EngineError::CircuitOpen { ref key, .. } if key == "jupiter"));
    }

    #[test]
    fn test_keys_are_independent() {
        let breakers = CircuitBreakerRegistry::new(1, Duration::from_secs(60));
        breakers.record_failure("jupiter");

        assert!(breakers.is_open("jupiter"));
        assert!(!breakers.is_open("birdeye"));
        assert!(breakers.check("birdeye").is_ok());
    }

    #[test]
    fn test_success_resets_count() {
        let breakers = CircuitBreakerRegistry::new(3, Duration::from_secs(60));
        breakers.record_failure("oracle");
        breakers.record_failure("oracle");
        breakers.record_success("oracle");

        assert_eq!(breakers.failure_count("oracle"), 0);
        breakers.record_failure("oracle");
        assert_eq!(breakers.state("oracle"), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_probe_after_cooldown() {
        let breakers = CircuitBreakerRegistry::new(2, Duration::from_millis(20));
        breakers.record_failure("dexscreener");
        breakers.record_failure("dexscreener");
        assert!(breakers.check("dexscreener").is_err());

        std::thread::sleep(Duration::from_millis(40));

        assert_eq!(breakers.state("dexscreener"), CircuitState::HalfOpen);
        assert!(breakers.check("dexscreener").is_ok());

        // Failed probe re-opens immediately
        breakers.record_failure("dexscreener");
        assert_eq!(breakers.state("dexscreener"), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(40));

        // Successful probe closes
        assert!(breakers.check("dexscreener").is_ok());
        breakers.record_success("dexscreener");
        assert_eq!(breakers.state("dexscreener"), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_admits_single_probe() {
        let breakers = CircuitBreakerRegistry::new(1, Duration::from_millis(20));
        breakers.record_failure("birdeye");

        std::thread::sleep(Duration::from_millis(40));

        assert!(breakers.check("birdeye").is_ok());
        // Probe in flight, everyone else still fails fast
        for _ in 0..5 {
            let err = breakers.check("birdeye").unwrap_err();
            assert!(matches!(err, EngineError::CircuitOpen { .. }));
        }

        breakers.record_success("birdeye");
        assert!(breakers.check("birdeye").is_ok());
    }
}
