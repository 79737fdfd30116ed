//! Convergence detection per question
//!
//! A question has converged once the population variance of its last `window`
//! champion fitness values is strictly below `threshold`.

use std::collections::{BTreeMap, VecDeque};

#[derive(Debug, Clone)]
pub struct ConvergenceTracker {
    window: usize,
    threshold: f64,
    history: BTreeMap<String, VecDeque<f64>>,
}

impl ConvergenceTracker {
    pub fn new(window: usize, threshold: f64) -> Self {
        Self {
            window: window.max(1),
            threshold,
            history: BTreeMap::new(),
        }
    }

    /// Resume from checkpointed history, trimmed to the window
    pub fn with_history(window: usize, threshold: f64, history: BTreeMap<String, Vec<f64>>) -> Self {
        let mut tracker = Self::new(window, threshold);
        for (question_id, values) in history {
            for value in values {
                tracker.record(&question_id, value);
            }
        }
        tracker
    }

    pub fn record(&mut self, question_id: &str, champion_fitness: f64) {
        let values = self.history.entry(question_id.to_string()).or_default();
        values.push_back(champion_fitness);
        while values.len() > self.window {
            values.pop_front();
        }
    }

    pub fn history(&self, question_id: &str) -> Vec<f64> {
        self.history
            .get(question_id)
            .map(|v| v.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Variance of the last `window` values, `None` until the window is full
    pub fn variance(&self, question_id: &str) -> Option<f64> {
        let values = self.history.get(question_id)?;
        if values.len() < self.window {
            return None;
        }
        Some(population_variance(values.iter().copied()))
    }

    pub fn is_converged(&self, question_id: &str) -> bool {
        self.variance(question_id)
            .is_some_and(|variance| variance < self.threshold)
    }

    pub fn to_map(&self) -> BTreeMap<String, Vec<f64>> {
        self.history
            .iter()
            .map(|(k, v)| (k.clone(), v.iter().copied().collect()))
            .collect()
    }
}

fn population_variance(values: impl Iterator<Item = f64> + Clone) -> f64 {
    let n = values.clone().count();
    if n == 0 {
        return 0.0;
    }
    let mean = values.clone().sum::<f64>() / n as f64;
    values.map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_needs_full_window() {
        let mut tracker = ConvergenceTracker::new(5, 0.02);
        for _ in 0..4 {
            tracker.record("q", 0.5);
        }
        assert!(!tracker.is_converged("q"));
        tracker.record("q", 0.5);
        assert!(tracker.is_converged("q"));
    }

    #[test]
    fn test_only_last_window_counts() {
        let mut tracker = ConvergenceTracker::new(3, 0.02);
        for v in [0.0, 1.0, 0.0, 0.7, 0.7, 0.7] {
            tracker.record("q", v);
        }
        assert_eq!(tracker.history("q"), vec![0.7, 0.7, 0.7]);
        assert!(tracker.is_converged("q"));
        assert!(!tracker.is_converged("other"));
    }

    #[test]
    fn test_threshold_is_strict() {
        // 0.0 / 0.5: variance is exactly 0.0625
        let mut tracker = ConvergenceTracker::new(2, 0.0625);
        tracker.record("q", 0.0);
        tracker.record("q", 0.5);
        assert_eq!(tracker.variance("q"), Some(0.0625));
        assert!(!tracker.is_converged("q"));
    }

    proptest! {
        #[test]
        fn prop_identical_values_converge(value in 0.0f64..1.0, window in 2usize..10) {
            let mut tracker = ConvergenceTracker::new(window, 0.02);
            for _ in 0..window {
                tracker.record("q", value);
            }
            prop_assert!(tracker.is_converged("q"));
        }

        #[test]
        fn prop_alternating_never_converges(window in 2usize..10, extra in 0usize..10) {
            let mut tracker = ConvergenceTracker::new(window, 0.02);
            for i in 0..(window + extra) {
                tracker.record("q", (i % 2) as f64);
                prop_assert!(!tracker.is_converged("q"));
            }
        }
    }
}
