//! Fitness ledgers
//!
//! Two independent, append-only ledgers feed the fusion engine:
//!
//! - **production**: live outcomes, one `{zooid, ok, ttr_ms, ts}` per line
//! - **synthetic**: test-harness scores, one `{candidate, composite_phase_fitness, ts}` per line
//!
//! Records are never mutated. Malformed lines are skipped with a warning.
//!
//! The JSONL backend keeps no index: every read scans the whole file. Batch
//! readers (`*_since_many`) scan once for a set of candidates, which is what
//! the tournament uses when ranking a batch.

use crate::error::{EvolverError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use tracing::warn;

/// Live production outcome for one candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductionObservation {
    #[serde(rename = "zooid", alias = "candidate_id")]
    pub candidate_id: String,
    pub ok: bool,
    /// Time to resolution in milliseconds
    pub ttr_ms: f64,
    /// Epoch seconds
    pub ts: f64,
}

/// Synthetic (test) score for one candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticObservation {
    pub candidate: String,
    /// Composite score in [0, 1]
    pub composite_phase_fitness: f64,
    /// Epoch seconds
    pub ts: f64,
}

/// Read/append access to both ledgers
pub trait FitnessLedger: Send + Sync {
    /// Production observations for `candidate_id` with `ts >= since`
    fn production_since(&self, candidate_id: &str, since: f64) -> Result<Vec<ProductionObservation>>;

    /// Synthetic observations for `candidate_id` with `ts >= since`
    fn synthetic_since(&self, candidate_id: &str, since: f64) -> Result<Vec<SyntheticObservation>>;

    fn record_production(&self, observation: &ProductionObservation) -> Result<()>;

    fn record_synthetic(&self, observation: &SyntheticObservation) -> Result<()>;

    /// Production observations with `ts >= since`, grouped by candidate
    fn production_since_many(
        &self,
        candidate_ids: &[&str],
        since: f64,
    ) -> Result<BTreeMap<String, Vec<ProductionObservation>>> {
        candidate_ids
            .iter()
            .map(|id| Ok((id.to_string(), self.production_since(id, since)?)))
            .collect()
    }

    /// Synthetic observations with `ts >= since`, grouped by candidate
    fn synthetic_since_many(
        &self,
        candidate_ids: &[&str],
        since: f64,
    ) -> Result<BTreeMap<String, Vec<SyntheticObservation>>> {
        candidate_ids
            .iter()
            .map(|id| Ok((id.to_string(), self.synthetic_since(id, since)?)))
            .collect()
    }
}

/// Epoch seconds with millisecond precision
pub fn epoch_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64 / 1000.0
}

/// File-backed ledger pair (JSON lines)
pub struct JsonlLedger {
    production_path: PathBuf,
    synthetic_path: PathBuf,
    append_lock: Mutex<()>,
}

impl JsonlLedger {
    pub fn new(production_path: impl Into<PathBuf>, synthetic_path: impl Into<PathBuf>) -> Self {
        Self {
            production_path: production_path.into(),
            synthetic_path: synthetic_path.into(),
            append_lock: Mutex::new(()),
        }
    }

    pub fn production_path(&self) -> &Path {
        &self.production_path
    }

    pub fn synthetic_path(&self) -> &Path {
        &self.synthetic_path
    }

    fn append<T: Serialize>(&self, path: &Path, record: &T) -> Result<()> {
        let _guard = self
            .append_lock
            .lock()
            .map_err(|_| EvolverError::Other("ledger append lock poisoned".into()))?;
        crate::persist::append_jsonl(path, record)
    }
}

/// Parse every well-formed line of a JSONL file, keeping those `keep` accepts
fn read_lines<T, F>(path: &Path, keep: F) -> Result<Vec<T>>
where
    T: for<'de> Deserialize<'de>,
    F: Fn(&T) -> bool,
{
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!("{}:{}: unreadable line: {}", path.display(), index + 1, e);
                continue;
            }
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(trimmed) {
            Ok(record) if keep(&record) => records.push(record),
            Ok(_) => {}
            Err(e) => warn!("{}:{}: skipping malformed record: {}", path.display(), index + 1, e),
        }
    }

    Ok(records)
}

impl FitnessLedger for JsonlLedger {
    fn production_since(&self, candidate_id: &str, since: f64) -> Result<Vec<ProductionObservation>> {
        read_lines(&self.production_path, |o: &ProductionObservation| {
            o.candidate_id == candidate_id && o.ts >= since
        })
    }

    fn synthetic_since(&self, candidate_id: &str, since: f64) -> Result<Vec<SyntheticObservation>> {
        read_lines(&self.synthetic_path, |o: &SyntheticObservation| {
            o.candidate == candidate_id && o.ts >= since
        })
    }

    fn record_production(&self, observation: &ProductionObservation) -> Result<()> {
        self.append(&self.production_path, observation)
    }

    fn record_synthetic(&self, observation: &SyntheticObservation) -> Result<()> {
        self.append(&self.synthetic_path, observation)
    }

    fn production_since_many(
        &self,
        candidate_ids: &[&str],
        since: f64,
    ) -> Result<BTreeMap<String, Vec<ProductionObservation>>> {
        let wanted: BTreeSet<&str> = candidate_ids.iter().copied().collect();
        let records = read_lines(&self.production_path, |o: &ProductionObservation| {
            o.ts >= since && wanted.contains(o.candidate_id.as_str())
        })?;
        Ok(group_by(candidate_ids, records, |o| o.candidate_id.clone()))
    }

    fn synthetic_since_many(
        &self,
        candidate_ids: &[&str],
        since: f64,
    ) -> Result<BTreeMap<String, Vec<SyntheticObservation>>> {
        let wanted: BTreeSet<&str> = candidate_ids.iter().copied().collect();
        let records = read_lines(&self.synthetic_path, |o: &SyntheticObservation| {
            o.ts >= since && wanted.contains(o.candidate.as_str())
        })?;
        Ok(group_by(candidate_ids, records, |o| o.candidate.clone()))
    }
}

/// Every requested id gets an entry, empty when nothing matched
fn group_by<T>(
    candidate_ids: &[&str],
    records: Vec<T>,
    key: impl Fn(&T) -> String,
) -> BTreeMap<String, Vec<T>> {
    let mut grouped: BTreeMap<String, Vec<T>> = candidate_ids
        .iter()
        .map(|id| (id.to_string(), Vec::new()))
        .collect();
    for record in records {
        grouped.entry(key(&record)).or_default().push(record);
    }
    grouped
}

/// In-process ledger pair
#[derive(Default)]
pub struct MemoryLedger {
    production: RwLock<Vec<ProductionObservation>>,
    synthetic: RwLock<Vec<SyntheticObservation>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> EvolverError {
    EvolverError::Other("ledger lock poisoned".into())
}

impl FitnessLedger for MemoryLedger {
    fn production_since(&self, candidate_id: &str, since: f64) -> Result<Vec<ProductionObservation>> {
        let records = self.production.read().map_err(poisoned)?;
        Ok(records
            .iter()
            .filter(|o| o.candidate_id == candidate_id && o.ts >= since)
            .cloned()
            .collect())
    }

    fn synthetic_since(&self, candidate_id: &str, since: f64) -> Result<Vec<SyntheticObservation>> {
        let records = self.synthetic.read().map_err(poisoned)?;
        Ok(records
            .iter()
            .filter(|o| o.candidate == candidate_id && o.ts >= since)
            .cloned()
            .collect())
    }

    fn record_production(&self, observation: &ProductionObservation) -> Result<()> {
        self.production
            .write()
            .map_err(poisoned)?
            .push(observation.clone());
        Ok(())
    }

    fn record_synthetic(&self, observation: &SyntheticObservation) -> Result<()> {
        self.synthetic
            .write()
            .map_err(poisoned)?
            .push(observation.clone());
        Ok(())
    }
}
