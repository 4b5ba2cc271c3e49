//! Backoff strategies for failed jobs.
//!
//! The delay before a failed job becomes eligible again grows exponentially with the number of
//! attempts made so far, using the `backoff_base` snapshotted onto the job at enqueue time.
//!
//! # Example
//!
//! ```
//! # use queuectl::prelude::*;
//! # use chrono::TimeDelta;
//! let strategy = Exponential::new(2).with_max(TimeDelta::seconds(30));
//!
//! assert_eq!(strategy.backoff(1), TimeDelta::seconds(2));
//! assert_eq!(strategy.backoff(2), TimeDelta::seconds(4));
//! assert_eq!(strategy.backoff(3), TimeDelta::seconds(8));
//! assert_eq!(strategy.backoff(5), TimeDelta::seconds(30));
//! ```

use chrono::TimeDelta;

/// Type that can be used to implement a backoff strategy.
pub trait Strategy {
    /// Given the number of attempts made so far returns the [`TimeDelta`] to wait before the job
    /// should be retried.
    fn backoff(&self, attempts: u32) -> TimeDelta;
}

/// Exponential backoff strategy: `base ^ attempts` seconds.
///
/// The result saturates instead of overflowing and can be clamped with
/// [`Exponential::with_max`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exponential {
    base: u32,
    max: Option<TimeDelta>,
}

impl Exponential {
    pub const fn new(base: u32) -> Self {
        Self { base, max: None }
    }

    /// Clamps the maximum value to be returned by [`Strategy::backoff`] to `max_delay`.
    pub const fn with_max(mut self, max_delay: TimeDelta) -> Self {
        self.max = Some(max_delay);
        self
    }
}

impl Strategy for Exponential {
    fn backoff(&self, attempts: u32) -> TimeDelta {
        // TimeDelta::seconds panics beyond i64::MAX / 1000
        let mut seconds = i64::from(self.base)
            .checked_pow(attempts)
            .unwrap_or(i64::MAX)
            .min(TimeDelta::MAX.num_seconds());
        if let Some(max) = self.max {
            seconds = seconds.min(max.num_seconds());
        }
        TimeDelta::seconds(seconds)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exponential_backoff() {
        let strategy = Exponential::new(2);

        assert_eq!(strategy.backoff(0), TimeDelta::seconds(1));
        assert_eq!(strategy.backoff(1), TimeDelta::seconds(2));
        assert_eq!(strategy.backoff(2), TimeDelta::seconds(4));
        assert_eq!(strategy.backoff(3), TimeDelta::seconds(8));
        assert_eq!(strategy.backoff(10), TimeDelta::seconds(1024));
    }

    #[test]
    fn exponential_backoff_with_max() {
        let max = TimeDelta::minutes(1);
        let strategy = Exponential::new(3).with_max(max);

        assert_eq!(strategy.backoff(3), TimeDelta::seconds(27));
        for i in 4..100 {
            assert_eq!(strategy.backoff(i), max);
        }
    }

    #[test]
    fn exponential_backoff_saturates() {
        let strategy = Exponential::new(10);

        assert_eq!(
            strategy.backoff(u32::MAX),
            TimeDelta::seconds(TimeDelta::MAX.num_seconds())
        );
    }

    #[test]
    fn base_one_never_grows() {
        let strategy = Exponential::new(1);

        for i in 0..50 {
            assert_eq!(strategy.backoff(i), TimeDelta::seconds(1));
        }
    }
}
