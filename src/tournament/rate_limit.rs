//! Minimum spacing between tournament starts

use chrono::{DateTime, Utc};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RateLimiter {
    min_interval: Duration,
    last_start: Option<DateTime<Utc>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration, last_start: Option<DateTime<Utc>>) -> Self {
        Self {
            min_interval,
            last_start,
        }
    }

    pub fn last_start(&self) -> Option<DateTime<Utc>> {
        self.last_start
    }

    /// Time left before another tournament may start, zero if allowed now
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        let Some(last) = self.last_start else {
            return Duration::ZERO;
        };
        let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
        self.min_interval.saturating_sub(elapsed)
    }

    pub fn check(&self, now: DateTime<Utc>) -> Result<(), Duration> {
        match self.remaining(now) {
            d if d.is_zero() => Ok(()),
            d => Err(d),
        }
    }

    pub fn mark_started(&mut self, now: DateTime<Utc>) {
        self.last_start = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_first_start_is_allowed() {
        let limiter = RateLimiter::new(Duration::from_secs(60), None);
        assert!(limiter.check(at(0)).is_ok());
    }

    #[test]
    fn test_interval_enforced_from_last_start() {
        let mut limiter = RateLimiter::new(Duration::from_secs(60), None);
        limiter.mark_started(at(0));

        assert_eq!(limiter.check(at(45)), Err(Duration::from_secs(15)));
        assert!(limiter.check(at(60)).is_ok());
    }

    #[test]
    fn test_clock_going_backwards_blocks_full_interval() {
        let limiter = RateLimiter::new(Duration::from_secs(60), Some(at(100)));
        assert_eq!(limiter.remaining(at(50)), Duration::from_secs(60));
    }
}
