// SPDX-License-Identifier: MIT OR Apache-2.0
//! mech-retry
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Exponential backoff with a delay cap and proportional jitter, plus an
//! async retry driver. Used by the store gateway, the chain gateway, the
//! indexer client, and delivery submission.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Backoff configuration.
///
/// Delay for attempt `n` (1-based) is `base * 2^(n-1)`, capped at `cap`,
/// with `± jitter` applied as a fraction of the computed delay.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Base delay before the first retry.
    #[serde(with = "duration_millis")]
    pub base: Duration,
    /// Upper bound on any single delay.
    #[serde(with = "duration_millis")]
    pub cap: Duration,
    /// Jitter fraction in `[0.0, 1.0]`; `0.25` means ±25 %.
    pub jitter: f64,
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(val: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        (val.as_millis() as u64).serialize(ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(de)?))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::gateway()
    }
}

impl BackoffPolicy {
    /// The content-gateway policy: base 1 s, cap 10 s, ±25 %, 3 retries.
    #[must_use]
    pub fn gateway() -> Self {
        Self {
            max_attempts: 4,
            base: Duration::from_secs(1),
            cap: Duration::from_secs(10),
            jitter: 0.25,
        }
    }

    /// Policy for on-chain submission retries.
    #[must_use]
    pub fn chain() -> Self {
        Self {
            max_attempts: 5,
            base: Duration::from_secs(2),
            cap: Duration::from_secs(30),
            jitter: 0.25,
        }
    }

    /// Raw exponential delay for a 1-based attempt, before jitter.
    #[must_use]
    pub fn raw_delay(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return self.base.min(self.cap);
        }
        let shift = (attempt - 1).min(31);
        let multiplied = self
            .base
            .checked_mul(1u32 << shift)
            .unwrap_or(Duration::MAX);
        multiplied.min(self.cap)
    }

    /// Delay for a 1-based attempt with jitter applied.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let raw = self.raw_delay(attempt);
        if self.jitter <= f64::EPSILON {
            return raw;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        raw.mul_f64(factor.max(0.0))
    }

    /// `true` when another attempt is allowed after `attempt` failures.
    #[must_use]
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Drive `op` until it succeeds, a non-retryable error occurs, or the
/// policy's attempt budget is exhausted.
///
/// `is_retryable` inspects each error; returning `false` propagates it
/// immediately. The last error is returned when attempts run out.
pub async fn retry<T, E, F, Fut, P>(
    policy: &BackoffPolicy,
    what: &str,
    is_retryable: P,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_retryable(&err) && policy.should_retry(attempt) => {
                let delay = policy.delay(attempt);
                debug!(
                    target: "mech.retry",
                    %what,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after transient failure"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
