//! Exponential retry delays, derived from the `tokio-retry` crate.
//! MIT License
//! Copyright (c) 2017 Sam Rijs
//!

use std::time::Duration;

use rand::Rng;

/// A retry strategy driven by exponential back-off, with optional jitter.
///
/// The power corresponds to the number of past attempts.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    current: u64,
    base: u64,
    factor: u64,
    max_delay: Option<Duration>,
    jitter: bool,
}

impl ExponentialBackoff {
    /// Constructs a new exponential back-off strategy,
    /// given a base duration in milliseconds.
    ///
    /// The resulting duration is calculated by taking the base to the `n`-th
    /// power, where `n` denotes the number of past attempts.
    pub const fn from_millis(base: u64) -> ExponentialBackoff {
        ExponentialBackoff {
            current: base,
            base,
            factor: 1u64,
            max_delay: None,
            jitter: false,
        }
    }

    pub const fn from_secs(base: u64) -> ExponentialBackoff {
        Self::from_millis(base * 1000)
    }

    /// Seed the strategy from a configured retry interval. A zero interval
    /// falls back to one second so the delay still grows.
    pub fn from_interval(interval: Duration) -> ExponentialBackoff {
        let millis = interval.as_millis() as u64;
        Self::from_millis(if millis == 0 { 1000 } else { millis }).factor(2)
    }

    /// A multiplicative factor that will be applied to the retry delay.
    ///
    /// For example, using a factor of `1000` will make each delay in units of
    /// seconds.
    ///
    /// Default factor is `1`.
    pub const fn factor(mut self, factor: u64) -> ExponentialBackoff {
        self.factor = factor;
        self
    }

    /// Apply a maximum delay. No retry delay will be longer than this `Duration`.
    pub const fn max_delay(mut self, duration: Duration) -> ExponentialBackoff {
        self.max_delay = Some(duration);
        self
    }

    /// Scale every delay by a random factor in `[0.5, 1.0]`, so a fleet of
    /// retrying tasks does not thunder in lockstep.
    pub const fn jitter(mut self) -> ExponentialBackoff {
        self.jitter = true;
        self
    }

    /// The next `Duration` to wait for.
    pub fn next(&mut self) -> Duration {
        // set delay duration by applying factor
        let mut duration = if let Some(duration) = self.current.checked_mul(self.factor) {
            Duration::from_millis(duration)
        } else {
            Duration::from_millis(u64::MAX)
        };

        // check if we reached max delay
        if let Some(ref max_delay) = self.max_delay {
            if duration > *max_delay {
                duration = *max_delay;
            }
        }

        if let Some(next) = self.current.checked_mul(self.base) {
            self.current = next;
        } else {
            self.current = u64::MAX;
        }

        if self.jitter {
            duration.mul_f64(rand::rng().random_range(0.5..=1.0))
        } else {
            duration
        }
    }

    pub async fn wait(&mut self) {
        let duration = self.next();
        tokio::time::sleep(duration).await
    }

    pub fn reset(&mut self) {
        self.current = self.base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_some_exponential_base_10() {
        let mut s = ExponentialBackoff::from_millis(10);

        assert_eq!(s.next(), Duration::from_millis(10));
        assert_eq!(s.next(), Duration::from_millis(100));
        assert_eq!(s.next(), Duration::from_millis(1000));
    }

    #[test]
    fn returns_some_exponential_base_2() {
        let mut s = ExponentialBackoff::from_millis(2);

        assert_eq!(s.next(), Duration::from_millis(2));
        assert_eq!(s.next(), Duration::from_millis(4));
        assert_eq!(s.next(), Duration::from_millis(8));
    }

    #[test]
    fn saturates_at_maximum_value() {
        let mut s = ExponentialBackoff::from_millis(u64::MAX - 1);

        assert_eq!(s.next(), Duration::from_millis(u64::MAX - 1));
        assert_eq!(s.next(), Duration::from_millis(u64::MAX));
        assert_eq!(s.next(), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn can_use_factor_to_get_seconds() {
        let factor = 1000;
        let mut s = ExponentialBackoff::from_millis(2).factor(factor);

        assert_eq!(s.next(), Duration::from_secs(2));
        assert_eq!(s.next(), Duration::from_secs(4));
        assert_eq!(s.next(), Duration::from_secs(8));
    }

    #[test]
    fn stops_increasing_at_max_delay() {
        let mut s = ExponentialBackoff::from_millis(2).max_delay(Duration::from_millis(4));

        assert_eq!(s.next(), Duration::from_millis(2));
        assert_eq!(s.next(), Duration::from_millis(4));
        assert_eq!(s.next(), Duration::from_millis(4));
    }

    #[test]
    fn reset() {
        let mut backoff = ExponentialBackoff::from_millis(2).factor(1000);
        assert_eq!(backoff.next(), Duration::from_secs(2));
        assert_eq!(backoff.next(), Duration::from_secs(4));
        backoff.reset();
        assert_eq!(backoff.next(), Duration::from_secs(2));
    }

    #[test]
    fn returns_max_when_max_less_than_base() {
        let mut s = ExponentialBackoff::from_millis(20).max_delay(Duration::from_millis(10));

        assert_eq!(s.next(), Duration::from_millis(10));
        assert_eq!(s.next(), Duration::from_millis(10));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        for _ in 0..32 {
            let mut probe = ExponentialBackoff::from_millis(1000).jitter();
            let delay = probe.next();
            assert!(delay >= Duration::from_millis(500));
            assert!(delay <= Duration::from_millis(1000));
        }
    }

    #[test]
    fn from_interval_never_zero() {
        let mut s = ExponentialBackoff::from_interval(Duration::ZERO);
        assert!(s.next() > Duration::ZERO);
    }
}
