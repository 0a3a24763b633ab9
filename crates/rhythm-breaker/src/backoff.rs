//! Exponential backoff with a hard ceiling.
//!
//! `delay(n) = min(base * 2^min(n, max_exponent), max)` where `n` is the
//! breaker's consecutive failure count at the moment it opens.
//!
//! | failures | base 1s, max 60s |
//! |----------|------------------|
//! | 3        | 8s               |
//! | 4        | 16s              |
//! | 5        | 32s              |
//! | 6+       | 60s (capped)     |

use std::time::Duration;

use rhythm_core::config::BreakerConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    /// Used instead of `base` when the failure that opened the breaker was a
    /// timeout, which tends to be transient load rather than a broken job.
    pub timeout_base: Duration,
    pub max: Duration,
    pub max_exponent: u32,
}

impl BackoffPolicy {
    pub fn from_config(cfg: &BreakerConfig) -> Self {
        Self {
            base: Duration::from_millis(cfg.base_backoff_ms),
            timeout_base: Duration::from_millis(cfg.timeout_backoff_ms),
            max: Duration::from_secs(cfg.max_backoff_secs),
            max_exponent: cfg.max_exponent,
        }
    }

    /// Delay before the next half-open probe after `failures` consecutive failures.
    pub fn delay(&self, failures: u32, after_timeout: bool) -> Duration {
        let base = if after_timeout {
            self.timeout_base
        } else {
            self.base
        };
        let exp = failures.min(self.max_exponent).min(63);
        let factor = 1u64 << exp;
        let millis = u64::try_from(base.as_millis())
            .unwrap_or(u64::MAX)
            .saturating_mul(factor);
        Duration::from_millis(millis).min(self.max)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&BreakerConfig::default())
    }
}
