//! # Reconnect backoff for the control-plane connection.
//!
//! [`BackoffPolicy`] controls how the delay between broker reconnect attempts grows.
//! The delay for retry counter `n` is `first × factor^n`, clamped to `max`, then jitter
//! is applied. The base is derived purely from `n`, so jitter output never feeds back
//! into subsequent delays.
//!
//! The default reproduces the observed reconnect schedule `min(1000 · 2^n, 30000)` ms.
//!
//! # Example
//! ```rust
//! use std::time::Duration;
//! use streamvisor::BackoffPolicy;
//!
//! let backoff = BackoffPolicy::default();
//!
//! assert_eq!(backoff.next(0), Duration::from_secs(1));
//! assert_eq!(backoff.next(1), Duration::from_secs(2));
//! assert_eq!(backoff.next(4), Duration::from_secs(16));
//! // 1s × 2^5 = 32s → capped at 30s
//! assert_eq!(backoff.next(5), Duration::from_secs(30));
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::policies::jitter::JitterPolicy;

/// Reconnect backoff policy.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Delay for retry counter `0`.
    #[serde(rename = "first_ms", with = "millis")]
    pub first: Duration,
    /// Maximum delay cap.
    #[serde(rename = "max_ms", with = "millis")]
    pub max: Duration,
    /// Multiplicative growth factor (`>= 1.0` recommended).
    pub factor: f64,
    /// Jitter policy applied to the clamped delay.
    pub jitter: JitterPolicy,
}

impl Default for BackoffPolicy {
    /// `first = 1s`, `factor = 2.0`, `max = 30s`, no jitter.
    fn default() -> Self {
        Self {
            first: Duration::from_secs(1),
            max: Duration::from_secs(30),
            factor: 2.0,
            jitter: JitterPolicy::None,
        }
    }
}

impl BackoffPolicy {
    /// Computes the delay for the given retry counter.
    ///
    /// Non-finite or negative intermediate values clamp to [`BackoffPolicy::max`].
    pub fn next(&self, retries: u32) -> Duration {
        let max_secs = self.max.as_secs_f64();
        let exp = retries.min(i32::MAX as u32) as i32;
        let unclamped_secs = self.first.as_secs_f64() * self.factor.powi(exp);

        let base =
            if !unclamped_secs.is_finite() || unclamped_secs < 0.0 || unclamped_secs > max_secs {
                self.max
            } else {
                Duration::from_secs_f64(unclamped_secs)
            };

        self.jitter.apply(base)
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expected_ms(n: u32) -> u64 {
        let pow = 2u64.checked_pow(n).unwrap_or(u64::MAX);
        1000u64.saturating_mul(pow).min(30_000)
    }

    #[test]
    fn default_matches_reconnect_schedule() {
        let policy = BackoffPolicy::default();
        for n in 0..64 {
            assert_eq!(
                policy.next(n),
                Duration::from_millis(expected_ms(n)),
                "retry counter {n}"
            );
        }
    }

    #[test]
    fn default_is_monotonic() {
        let policy = BackoffPolicy::default();
        let mut prev = Duration::ZERO;
        for n in 0..100 {
            let d = policy.next(n);
            assert!(d >= prev, "retry counter {n}: {d:?} < {prev:?}");
            prev = d;
        }
    }

    #[test]
    fn first_exceeding_max_is_clamped() {
        let policy = BackoffPolicy {
            first: Duration::from_secs(60),
            ..BackoffPolicy::default()
        };
        assert_eq!(policy.next(0), Duration::from_secs(30));
    }

    #[test]
    fn huge_counter_clamps_to_max() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.next(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn equal_jitter_stays_within_half_and_base() {
        let policy = BackoffPolicy {
            jitter: JitterPolicy::Equal,
            ..BackoffPolicy::default()
        };
        for n in 0..10 {
            let base = Duration::from_millis(expected_ms(n));
            let d = policy.next(n);
            assert!(d >= base / 2 && d <= base, "retry counter {n}: {d:?}");
        }
    }

    #[test]
    fn deserializes_from_millis() {
        let policy: BackoffPolicy =
            toml::from_str("first_ms = 250\nmax_ms = 4000\nfactor = 3.0\njitter = \"full\"")
                .unwrap();
        assert_eq!(policy.first, Duration::from_millis(250));
        assert_eq!(policy.max, Duration::from_secs(4));
        assert_eq!(policy.jitter, JitterPolicy::Full);
    }
}
