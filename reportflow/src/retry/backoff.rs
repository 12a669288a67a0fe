//! Backoff and jitter strategies.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// delay = base * 2^attempt
    #[default]
    Exponential,
    /// delay = base * attempt
    Linear,
    /// delay = base
    #[serde(alias = "constant")]
    Static,
}

/// Jitter strategy applied to exponential delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitterStrategy {
    /// No jitter
    None,
    /// Random from 0 to delay
    Full,
    /// Half fixed, half random
    #[default]
    Equal,
}

impl JitterStrategy {
    /// Applies jitter to a delay in milliseconds.
    #[must_use]
    pub fn apply(self, delay_ms: u64) -> u64 {
        match self {
            Self::None => delay_ms,
            Self::Full => {
                if delay_ms == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=delay_ms)
                }
            }
            Self::Equal => {
                let half = delay_ms / 2;
                if half == 0 {
                    delay_ms
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
        }
    }
}

/// Computes the delay before retry number `attempt` (1 for the first retry).
///
/// The result never exceeds `max_ms`. Jitter only applies to exponential
/// backoff; linear and static delays are exact.
#[must_use]
pub fn backoff_delay(
    kind: BackoffKind,
    jitter: JitterStrategy,
    base_ms: u64,
    max_ms: u64,
    attempt: u32,
) -> Duration {
    let delay = match kind {
        BackoffKind::Exponential => {
            let exp_delay = base_ms.saturating_mul(2u64.saturating_pow(attempt));
            jitter.apply(exp_delay.min(max_ms))
        }
        BackoffKind::Linear => base_ms.saturating_mul(u64::from(attempt)).min(max_ms),
        BackoffKind::Static => base_ms.min(max_ms),
    };

    Duration::from_millis(delay)
}
