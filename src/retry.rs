//! Backoff calculation for retries.
//!
//! Both the queue's retry scheduling and the webhook dispatcher use the same
//! bounded exponential backoff, differing only in their base/cap and in the
//! jitter applied on top. Jitter prevents a burst of failing jobs from all
//! retrying at exactly the same instant.

use rand::Rng;
use std::time::Duration;

/// Jitter applied to a computed backoff delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// No jitter; the delay is used as computed.
    None,
    /// Add a uniform random amount in `[0, factor * delay]`.
    ///
    /// Only ever lengthens the delay. Used by the queue's retry scheduling.
    Bounded(f64),
    /// Multiply the delay by a uniform random factor in `[1 - f, 1 + f]`.
    ///
    /// Used by the webhook dispatcher, where retrying slightly early is fine.
    Symmetric(f64),
}

impl Jitter {
    /// Apply this jitter to a delay.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use conveyor::retry::Jitter;
    /// use std::time::Duration;
    ///
    /// let base = Duration::from_millis(2000);
    /// let jittered = Jitter::Bounded(0.1).apply(base);
    /// assert!(jittered >= base);
    /// assert!(jittered <= Duration::from_millis(2200));
    /// ```
    pub fn apply(&self, delay: Duration) -> Duration {
        let mut rng = rand::thread_rng();
        let millis = delay.as_millis() as u64;

        match self {
            Jitter::None => delay,
            Jitter::Bounded(factor) => {
                let bound = (millis as f64 * factor) as u64;
                Duration::from_millis(millis + rng.gen_range(0..=bound))
            }
            Jitter::Symmetric(factor) => {
                let scale = rng.gen_range((1.0 - factor)..=(1.0 + factor));
                Duration::from_millis((millis as f64 * scale) as u64)
            }
        }
    }
}

/// Exponential backoff with an upper bound.
///
/// The delay for attempt `n` is `min(base * 2^n, cap)`. The calculation is
/// pure; callers apply [`Jitter`] separately so tests can pin down the
/// deterministic part.
///
/// # Examples
///
/// ```rust
/// use conveyor::retry::ExponentialBackoff;
/// use std::time::Duration;
///
/// let backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60));
/// assert_eq!(backoff.delay(1), Duration::from_secs(2));
/// assert_eq!(backoff.delay(2), Duration::from_secs(4));
/// assert_eq!(backoff.delay(10), Duration::from_secs(60)); // capped
/// ```
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    base: Duration,
    cap: Duration,
}

impl ExponentialBackoff {
    pub const fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// The deterministic delay for the given attempt number.
    pub fn delay(&self, attempt: u32) -> Duration {
        let multiplier = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
        let millis = (self.base.as_millis() as u64).saturating_mul(multiplier);
        Duration::from_millis(millis).min(self.cap)
    }

    /// The delay for the given attempt with jitter applied.
    pub fn delay_with_jitter(&self, attempt: u32, jitter: Jitter) -> Duration {
        jitter.apply(self.delay(attempt))
    }
}
