//! Circuit breaker over tournament failures
//!
//! Opens after `failure_threshold` failures within a rolling window and blocks
//! new tournaments until the cooldown expires. The first check after expiry
//! closes it again and forgets the failure history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{info, warn};

/// Persisted part of the breaker
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CircuitState {
    /// Failure timestamps inside the rolling window, oldest first
    pub failures: VecDeque<DateTime<Utc>>,
    /// Set while the circuit is open
    pub open_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    failure_threshold: usize,
    window: chrono::Duration,
    cooldown: chrono::Duration,
    state: CircuitState,
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

impl CircuitBreaker {
    pub fn new(failure_threshold: usize, window: Duration, cooldown: Duration) -> Self {
        Self::with_state(failure_threshold, window, cooldown, CircuitState::default())
    }

    pub fn with_state(
        failure_threshold: usize,
        window: Duration,
        cooldown: Duration,
        state: CircuitState,
    ) -> Self {
        Self {
            failure_threshold,
            window: to_chrono(window),
            cooldown: to_chrono(cooldown),
            state,
        }
    }

    pub fn state(&self) -> &CircuitState {
        &self.state
    }

    /// Read-only: true while the cooldown has not elapsed
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.state.open_until.is_some_and(|until| now < until)
    }

    pub fn open_until(&self) -> Option<DateTime<Utc>> {
        self.state.open_until
    }

    /// Permit a tournament, or report when the circuit reopens
    pub fn check(&mut self, now: DateTime<Utc>) -> Result<(), DateTime<Utc>> {
        match self.state.open_until {
            Some(until) if now < until => Err(until),
            Some(_) => {
                self.state = CircuitState::default();
                info!("Circuit breaker cooldown elapsed, closing");
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Record a failure; returns true if this failure opened the circuit
    pub fn record_failure(&mut self, now: DateTime<Utc>) -> bool {
        let horizon = now - self.window;
        while self.state.failures.front().is_some_and(|t| *t < horizon) {
            self.state.failures.pop_front();
        }
        self.state.failures.push_back(now);

        if self.state.open_until.is_none() && self.state.failures.len() >= self.failure_threshold {
            let until = now + self.cooldown;
            self.state.open_until = Some(until);
            warn!(
                failures = self.state.failures.len(),
                until = %until,
                "Circuit breaker opened"
            );
            return true;
        }
        false
    }

    pub fn record_success(&mut self) {
        self.state.failures.clear();
    }

    /// Manual override: close and forget history
    pub fn reset(&mut self) {
        self.state = CircuitState::default();
        info!("Circuit breaker reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(3, Duration::from_secs(120), Duration::from_secs(600))
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_opens_after_exactly_threshold_failures() {
        let mut cb = breaker();
        assert!(!cb.record_failure(at(0)));
        assert!(!cb.record_failure(at(10)));
        assert!(cb.check(at(11)).is_ok());
        assert!(cb.record_failure(at(20)));

        assert!(cb.is_open(at(21)));
        assert_eq!(cb.check(at(21)), Err(at(620)));
    }

    #[test]
    fn test_failures_outside_window_do_not_count() {
        let mut cb = breaker();
        cb.record_failure(at(0));
        cb.record_failure(at(10));
        // first two have left the 120s window
        assert!(!cb.record_failure(at(200)));
        assert!(!cb.is_open(at(200)));
        assert_eq!(cb.state().failures.len(), 1);
    }

    #[test]
    fn test_cooldown_closes_and_resets_history() {
        let mut cb = breaker();
        for t in [0, 1, 2] {
            cb.record_failure(at(t));
        }
        assert!(cb.check(at(601)).is_err());
        assert!(cb.check(at(602)).is_ok());
        assert!(!cb.is_open(at(602)));
        assert!(cb.state().failures.is_empty());

        // history reset: two new failures do not reopen
        cb.record_failure(at(603));
        assert!(!cb.record_failure(at(604)));
    }

    #[test]
    fn test_success_clears_failures() {
        let mut cb = breaker();
        cb.record_failure(at(0));
        cb.record_failure(at(1));
        cb.record_success();
        assert!(!cb.record_failure(at(2)));
    }

    #[test]
    fn test_manual_reset() {
        let mut cb = breaker();
        for t in [0, 1, 2] {
            cb.record_failure(at(t));
        }
        cb.reset();
        assert!(!cb.is_open(at(3)));
        assert!(cb.check(at(3)).is_ok());
    }
}
