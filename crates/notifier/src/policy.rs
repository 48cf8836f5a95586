//! Retry policy — bounded exponential backoff for failed deliveries.
//!
//! Delay before retry `n` (first retry is `n = 1`) is
//! `base_delay * backoff_multiplier^(n-1)`. With the defaults that is 60s, 120s, 240s,
//! after which the entry is marked failed.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use mailroom_common::config::RetrySettings;

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay before the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(60);

/// Hard ceiling on configured retries.
const MAX_RETRIES_CEILING: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    #[serde(with = "duration_secs")]
    pub base_delay: Duration,
    pub backoff_multiplier: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, backoff_multiplier: u32) -> Self {
        Self {
            max_retries: max_retries.min(MAX_RETRIES_CEILING),
            base_delay,
            backoff_multiplier: backoff_multiplier.max(1),
        }
    }

    /// A policy that never retries; used by the direct path.
    pub fn no_retry() -> Self {
        Self::new(0, Duration::ZERO, 1)
    }

    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self::new(
            settings.max_retries,
            Duration::from_secs(settings.base_delay_secs),
            settings.backoff_multiplier,
        )
    }

    /// Total attempts an entry may receive.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Delay before retry number `retry` (1-based). `None` once the cap is reached.
    pub fn delay_for(&self, retry: u32) -> Option<Duration> {
        if retry == 0 || retry > self.max_retries {
            return None;
        }
        let factor = self.backoff_multiplier.saturating_pow(retry - 1);
        Some(self.base_delay.saturating_mul(factor))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, DEFAULT_BASE_DELAY, 2)
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
