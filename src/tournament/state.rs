//! Scheduler checkpoint
//!
//! Everything the tournament executor must not forget across restarts:
//! bandit statistics, convergence history, circuit state, the rate-limit
//! cursor, the deferred queue and per-question status.

use super::circuit::CircuitState;
use super::InvestigationRequest;
use crate::bandit::CategoryStats;
use crate::error::Result;
use crate::persist;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use tracing::{info, warn};

/// Per-question lifecycle: idle → queued → running → {converged | completed | failed}
///
/// `Exhausted` is terminal like `Converged`: the search space has no unseen
/// genome left.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionStatus {
    #[default]
    Idle,
    Queued,
    Running,
    Converged,
    Completed,
    Failed,
    Exhausted,
}

impl fmt::Display for QuestionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QuestionStatus::Idle => "idle",
            QuestionStatus::Queued => "queued",
            QuestionStatus::Running => "running",
            QuestionStatus::Converged => "converged",
            QuestionStatus::Completed => "completed",
            QuestionStatus::Failed => "failed",
            QuestionStatus::Exhausted => "exhausted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerState {
    pub bandit: BTreeMap<String, CategoryStats>,
    pub convergence: BTreeMap<String, Vec<f64>>,
    pub circuit: CircuitState,
    pub last_start: Option<DateTime<Utc>>,
    pub queue: Vec<InvestigationRequest>,
    pub statuses: BTreeMap<String, QuestionStatus>,
    /// Fraction of promotion decisions that promoted, if any were made
    pub acceptance_rate: Option<f64>,
    pub saved_at: Option<DateTime<Utc>>,
}

impl SchedulerState {
    /// Load a checkpoint; a missing file is a fresh start, a corrupt one is
    /// backed up and replaced by a fresh start
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let mut state = match serde_json::from_str::<SchedulerState>(&contents) {
            Ok(state) => state,
            Err(e) => {
                warn!("Scheduler state {} unreadable: {}", path.display(), e);
                persist::backup_corrupt(path)?;
                return Ok(Self::default());
            }
        };
        state.reconcile();
        info!(
            "Loaded scheduler state ({} categories, {} queued)",
            state.bandit.len(),
            state.queue.len()
        );
        Ok(state)
    }

    /// A question left `running` by a crash goes back to `queued` if it is
    /// still in the queue, otherwise to `idle`
    fn reconcile(&mut self) {
        let queued: Vec<&str> = self.queue.iter().map(|r| r.question_id.as_str()).collect();
        for (question_id, status) in self.statuses.iter_mut() {
            if *status == QuestionStatus::Running {
                *status = if queued.contains(&question_id.as_str()) {
                    QuestionStatus::Queued
                } else {
                    QuestionStatus::Idle
                };
                warn!(question_id = %question_id, status = %status, "Recovered interrupted question");
            }
        }
    }

    pub fn save(&mut self, path: &Path) -> Result<()> {
        self.saved_at = Some(Utc::now());
        persist::write_json_atomic(path, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tournament::search::{ParamSpec, SearchSpace};
    use tempfile::TempDir;

    fn request(id: &str) -> InvestigationRequest {
        InvestigationRequest::new(
            id,
            "h",
            SearchSpace::new().with("x", ParamSpec::Int { min: 0, max: 3 }),
            "stub",
        )
    }

    #[test]
    fn test_missing_file_is_fresh() {
        let temp = TempDir::new().unwrap();
        let state = SchedulerState::load(&temp.path().join("state.json")).unwrap();
        assert!(state.queue.is_empty());
        assert!(state.saved_at.is_none());
    }

    #[test]
    fn test_save_and_reload_reconciles_running() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state.json");

        let mut state = SchedulerState::default();
        state.queue.push(request("q1"));
        state.statuses.insert("q1".to_string(), QuestionStatus::Running);
        state.statuses.insert("q2".to_string(), QuestionStatus::Running);
        state.statuses.insert("q3".to_string(), QuestionStatus::Converged);
        state.convergence.insert("q3".to_string(), vec![0.5; 5]);
        state.save(&path).unwrap();

        let loaded = SchedulerState::load(&path).unwrap();
        assert_eq!(loaded.statuses["q1"], QuestionStatus::Queued);
        assert_eq!(loaded.statuses["q2"], QuestionStatus::Idle);
        assert_eq!(loaded.statuses["q3"], QuestionStatus::Converged);
        assert_eq!(loaded.convergence["q3"].len(), 5);
        assert!(loaded.saved_at.is_some());
    }

    #[test]
    fn test_corrupt_file_is_backed_up() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();

        let state = SchedulerState::load(&path).unwrap();
        assert!(state.statuses.is_empty());
        assert!(!path.exists());
        let backups = std::fs::read_dir(temp.path()).unwrap().count();
        assert_eq!(backups, 1);
    }
}
