// SPDX-License-Identifier: Apache-2.0

//! Pure retry-delay (backoff) strategies, consumed by the resilient
//! execution strategy and the error-handling service's retry loop.
//!
//! `Fixed`/`Linear`/`Exponential`, each with optional jitter, made
//! object-safe via `async-trait` so a `Box<dyn RetryDelay>` can be
//! threaded through the pipeline context. Cancellation uses
//! `tokio_util::sync::CancellationToken` so a sleeping retry wakes
//! immediately when the run is cancelled.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// A pure delay calculator: given the 1-based attempt number, returns how
/// long to wait before the next attempt.
#[async_trait]
pub trait RetryDelay: Send + Sync {
    /// Computes the delay before retry attempt `attempt` (1-based: the
    /// delay before the *second* call is `delay_for(1)`).
    fn delay_for(&self, attempt: u32) -> Duration;

    /// Sleeps for [`RetryDelay::delay_for`], cooperatively cancellable.
    async fn wait(&self, attempt: u32, cancel: &CancellationToken) {
        let delay = self.delay_for(attempt);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => {}
        }
    }
}

/// A constant delay between every retry attempt.
#[derive(Debug, Clone, Copy)]
pub struct Fixed {
    /// The constant delay.
    pub delay: Duration,
}

impl RetryDelay for Fixed {
    fn delay_for(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

/// Delay grows linearly with the attempt number, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct Linear {
    /// Delay before the first retry.
    pub base: Duration,
    /// Additional delay added per subsequent attempt.
    pub increment: Duration,
    /// Upper bound on the computed delay.
    pub max: Duration,
}

impl RetryDelay for Linear {
    fn delay_for(&self, attempt: u32) -> Duration {
        let grown = self.base + self.increment * attempt.saturating_sub(1);
        grown.min(self.max)
    }
}

/// Delay grows exponentially with the attempt number, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct Exponential {
    /// Delay before the first retry.
    pub base: Duration,
    /// Multiplier applied per subsequent attempt.
    pub multiplier: f64,
    /// Upper bound on the computed delay.
    pub max: Duration,
}

impl RetryDelay for Exponential {
    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let scaled_millis = (self.base.as_millis() as f64) * factor;
        let capped = scaled_millis.min(self.max.as_millis() as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

/// Jitter applied on top of a base [`RetryDelay`] strategy.
#[derive(Debug, Clone, Copy)]
pub enum Jitter {
    /// No jitter; the base delay is used as-is.
    None,
    /// Uniform random delay in `[0, base_delay]`.
    Full,
    /// Uniform random delay in `[base_delay / 2, base_delay]`.
    Equal,
    /// Decorrelated jitter: `min(max_delay, random(base_delay, prev * multiplier))`.
    Decorrelated {
        /// Upper bound on the delay.
        max_delay: Duration,
        /// Growth multiplier applied to the previous delay.
        multiplier: f64,
    },
}

/// Wraps a base [`RetryDelay`] strategy with a [`Jitter`] variant.
pub struct Jittered<S> {
    base: S,
    jitter: Jitter,
    prev: Mutex<Duration>,
}

impl<S: RetryDelay> Jittered<S> {
    /// Wraps `base` with the given jitter policy.
    pub fn new(base: S, jitter: Jitter) -> Self {
        Jittered {
            base,
            jitter,
            prev: Mutex::new(Duration::ZERO),
        }
    }

    fn pseudo_random_unit(attempt: u32) -> f64 {
        // A small, dependency-free mixing function (splitmix64). Good
        // enough to decorrelate retries across nodes without pulling in a
        // dedicated RNG crate for a single call site; the jitter only
        // needs to avoid synchronized thundering-herd retries, not pass
        // statistical randomness tests.
        let mut x = (attempt as u64)
            .wrapping_mul(0x9E37_79B9_7F4A_7C15)
            .wrapping_add(0xBF58_476D_1CE4_E5B9);
        x ^= x >> 30;
        x = x.wrapping_mul(0xBF58_476D_1CE4_E5B9);
        x ^= x >> 27;
        x = x.wrapping_mul(0x94D0_49BB_1331_11EB);
        x ^= x >> 31;
        (x % 1_000_000) as f64 / 1_000_000.0
    }
}

#[async_trait]
impl<S: RetryDelay> RetryDelay for Jittered<S> {
    fn delay_for(&self, attempt: u32) -> Duration {
        let base_delay = self.base.delay_for(attempt);
        let unit = Self::pseudo_random_unit(attempt);
        match self.jitter {
            Jitter::None => base_delay,
            Jitter::Full => base_delay.mul_f64(unit),
            Jitter::Equal => {
                let half = base_delay.mul_f64(0.5);
                half + half.mul_f64(unit)
            }
            Jitter::Decorrelated { max_delay, multiplier } => {
                let prev = self.prev.try_lock().map(|g| *g).unwrap_or(base_delay);
                let upper = (prev.mul_f64(multiplier)).max(base_delay);
                let candidate = base_delay + (upper - base_delay).mul_f64(unit);
                let result = candidate.min(max_delay);
                if let Ok(mut guard) = self.prev.try_lock() {
                    *guard = result;
                }
                result
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_delay_is_constant() {
        let d = Fixed {
            delay: Duration::from_millis(50),
        };
        assert_eq!(d.delay_for(1), Duration::from_millis(50));
        assert_eq!(d.delay_for(10), Duration::from_millis(50));
    }

    #[test]
    fn linear_delay_grows_and_caps() {
        let d = Linear {
            base: Duration::from_millis(100),
            increment: Duration::from_millis(100),
            max: Duration::from_millis(250),
        };
        assert_eq!(d.delay_for(1), Duration::from_millis(100));
        assert_eq!(d.delay_for(2), Duration::from_millis(200));
        assert_eq!(d.delay_for(3), Duration::from_millis(250));
    }

    #[test]
    fn exponential_delay_grows_and_caps() {
        let d = Exponential {
            base: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_millis(1000),
        };
        assert_eq!(d.delay_for(1), Duration::from_millis(100));
        assert_eq!(d.delay_for(2), Duration::from_millis(200));
        assert_eq!(d.delay_for(3), Duration::from_millis(400));
        assert_eq!(d.delay_for(5), Duration::from_millis(1000));
    }

    #[test]
    fn full_jitter_never_exceeds_base() {
        let base = Exponential {
            base: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_millis(1000),
        };
        let jittered = Jittered::new(base, Jitter::Full);
        for attempt in 1..10 {
            assert!(jittered.delay_for(attempt) <= Duration::from_millis(1000));
        }
    }

    #[tokio::test]
    async fn wait_returns_early_on_cancel() {
        let delay = Fixed {
            delay: Duration::from_secs(10),
        };
        let token = CancellationToken::new();
        let child = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            child.cancel();
        });
        let start = std::time::Instant::now();
        delay.wait(1, &token).await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
