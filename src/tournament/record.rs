//! Tournament outputs
//!
//! - winner record: one JSON file per question under `winners/`, atomically
//!   replaced, picked up by a separate deployment process
//! - tournament record: one line per completed tournament in the audit log

use super::search::Params;
use crate::bandit::Regime;
use crate::error::Result;
use crate::fitness::FusedFitness;
use crate::genome::CandidateGenome;
use crate::persist;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestCandidate {
    pub fitness: f64,
    pub params: Params,
    /// Champion candidate name
    pub spica_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TournamentSummary {
    pub champion_idx: usize,
    pub total_candidates: usize,
    /// `[min, max]` of the ranking fitnesses
    pub fitness_range: [f64; 2],
    pub all_fitnesses: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WinnerRecord {
    pub updated_at: DateTime<Utc>,
    pub question_id: String,
    pub hypothesis: String,
    pub best: BestCandidate,
    pub tournament_summary: TournamentSummary,
}

impl WinnerRecord {
    /// `None` when `fitnesses` is empty or `champion_idx` is out of range
    pub fn new(
        question_id: &str,
        hypothesis: &str,
        champion: &CandidateGenome,
        champion_idx: usize,
        fitnesses: &[f64],
        updated_at: DateTime<Utc>,
    ) -> Option<Self> {
        let fitness = *fitnesses.get(champion_idx)?;
        let min = fitnesses.iter().copied().fold(f64::INFINITY, f64::min);
        let max = fitnesses.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Some(Self {
            updated_at,
            question_id: question_id.to_string(),
            hypothesis: hypothesis.to_string(),
            best: BestCandidate {
                fitness,
                params: champion.phenotype().parameters.clone(),
                spica_id: champion.name.clone(),
            },
            tournament_summary: TournamentSummary {
                champion_idx,
                total_candidates: fitnesses.len(),
                fitness_range: [min, max],
                all_fitnesses: fitnesses.to_vec(),
            },
        })
    }

    /// File name for a question id, restricted to `[A-Za-z0-9._-]`
    pub fn file_name(question_id: &str) -> String {
        let safe: String = question_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}.json", safe)
    }

    pub fn path_in(dir: &Path, question_id: &str) -> PathBuf {
        dir.join(Self::file_name(question_id))
    }

    /// Atomically replace this question's winner file
    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        let path = Self::path_in(dir, &self.question_id);
        persist::write_json_atomic(&path, self)?;
        Ok(path)
    }

    pub fn read(dir: &Path, question_id: &str) -> Result<Option<Self>> {
        let path = Self::path_in(dir, question_id);
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }
}

/// Audit entry for one completed tournament
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TournamentRecord {
    pub tournament_id: String,
    pub question_id: String,
    pub hypothesis: String,
    /// Source chamber / bandit category
    pub category: String,
    pub regime: Regime,
    pub candidates: Vec<CandidateGenome>,
    /// Ranking fitness per candidate, same order as `candidates`
    pub fitnesses: Vec<f64>,
    /// Fused view per candidate, same order as `candidates`
    pub fused: Vec<FusedFitness>,
    pub champion: String,
    pub converged: bool,
    pub timestamp: DateTime<Utc>,
}

impl TournamentRecord {
    pub fn append(&self, log_path: &Path) -> Result<()> {
        persist::append_jsonl(log_path, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genome::Phenotype;
    use serde_json::json;
    use tempfile::TempDir;

    fn champion() -> CandidateGenome {
        let mut params = Params::new();
        params.insert("swappiness".to_string(), json!(10));
        CandidateGenome::new("q1-abc-03", "vm", "q1", Phenotype::from_params(params)).unwrap()
    }

    #[test]
    fn test_winner_record_shape() {
        let now = Utc::now();
        let record = WinnerRecord::new("q1", "lower swappiness", &champion(), 1, &[0.2, 0.9, 0.5], now).unwrap();
        let value = serde_json::to_value(&record).unwrap();

        assert_eq!(value["question_id"], "q1");
        assert_eq!(value["best"]["fitness"], 0.9);
        assert_eq!(value["best"]["params"]["swappiness"], 10);
        assert_eq!(value["best"]["spica_id"], "q1-abc-03");
        assert_eq!(value["tournament_summary"]["champion_idx"], 1);
        assert_eq!(value["tournament_summary"]["total_candidates"], 3);
        assert_eq!(value["tournament_summary"]["fitness_range"], json!([0.2, 0.9]));
        assert!(value["updated_at"].is_string());
    }

    #[test]
    fn test_out_of_range_champion() {
        assert!(WinnerRecord::new("q1", "h", &champion(), 3, &[0.1], Utc::now()).is_none());
        assert!(WinnerRecord::new("q1", "h", &champion(), 0, &[], Utc::now()).is_none());
    }

    #[test]
    fn test_write_replaces_and_reads_back() {
        let temp = TempDir::new().unwrap();
        let first = WinnerRecord::new("q/1", "h", &champion(), 0, &[0.3], Utc::now()).unwrap();
        let path = first.write(temp.path()).unwrap();
        assert_eq!(path.file_name().unwrap(), "q_1.json");

        let second = WinnerRecord::new("q/1", "h", &champion(), 0, &[0.8], Utc::now()).unwrap();
        second.write(temp.path()).unwrap();

        let read = WinnerRecord::read(temp.path(), "q/1").unwrap().unwrap();
        assert_eq!(read.best.fitness, 0.8);
        assert!(WinnerRecord::read(temp.path(), "other").unwrap().is_none());
    }
}
