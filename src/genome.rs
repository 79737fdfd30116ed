//! Candidate genomes
//!
//! A genome is an immutable, content-addressed description of one candidate:
//! its phenotype parameters and its lineage. "Mutating" a genome always
//! produces a new genome with a new hash and a lineage pointer to the parent.
//! Only the lifecycle state changes after creation, and only through
//! [`CandidateRegistry::transition`](crate::registry::CandidateRegistry::transition).

use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Lifecycle of a candidate
///
/// Legal edges: pluripotent → differentiated → active ⇄ dormant → pruned,
/// plus active → pruned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Pluripotent,
    Differentiated,
    Active,
    Dormant,
    Pruned,
}

impl LifecycleState {
    pub const ALL: [LifecycleState; 5] = [
        LifecycleState::Pluripotent,
        LifecycleState::Differentiated,
        LifecycleState::Active,
        LifecycleState::Dormant,
        LifecycleState::Pruned,
    ];

    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Pluripotent, Differentiated)
                | (Differentiated, Active)
                | (Active, Dormant)
                | (Dormant, Active)
                | (Dormant, Pruned)
                | (Active, Pruned)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Pluripotent => "pluripotent",
            LifecycleState::Differentiated => "differentiated",
            LifecycleState::Active => "active",
            LifecycleState::Dormant => "dormant",
            LifecycleState::Pruned => "pruned",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        LifecycleState::ALL
            .into_iter()
            .find(|state| state.as_str() == s.trim().to_lowercase())
            .ok_or_else(|| format!("unknown lifecycle state: {}", s))
    }
}

/// Phenotype parameters of a candidate
///
/// The well-known fields are lifted out of the raw parameter map; every
/// parameter is also kept verbatim in `parameters`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Phenotype {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_budget_ms: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throughput_target: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooperation_style: Option<String>,

    #[serde(default)]
    pub communication_patterns: Vec<String>,

    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
}

impl Phenotype {
    pub fn from_params(parameters: BTreeMap<String, Value>) -> Self {
        let communication_patterns = match parameters.get("communication_patterns") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            Some(Value::String(s)) => vec![s.clone()],
            _ => Vec::new(),
        };

        Self {
            latency_budget_ms: parameters.get("latency_budget_ms").and_then(Value::as_f64),
            throughput_target: parameters.get("throughput_target").and_then(Value::as_f64),
            cooperation_style: parameters
                .get("cooperation_style")
                .and_then(Value::as_str)
                .map(str::to_string),
            communication_patterns,
            parameters,
        }
    }
}

#[derive(Serialize)]
struct HashInput<'a> {
    ecosystem: &'a str,
    niche: &'a str,
    phenotype: &'a Phenotype,
    lineage: &'a [String],
}

fn content_hash(
    ecosystem: &str,
    niche: &str,
    phenotype: &Phenotype,
    lineage: &[String],
) -> Result<String> {
    // serde_json maps are BTreeMap-backed, so the encoding is canonical
    let bytes = serde_json::to_vec(&HashInput {
        ecosystem,
        niche,
        phenotype,
        lineage,
    })?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

/// One candidate's identity, phenotype and lineage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateGenome {
    pub name: String,
    pub ecosystem: String,
    pub niche: String,
    genome_hash: String,
    lifecycle_state: LifecycleState,
    /// Ancestor hashes, oldest first
    #[serde(default)]
    lineage: Vec<String>,
    phenotype: Phenotype,
}

impl CandidateGenome {
    /// Create a root genome (no lineage) in the pluripotent state
    pub fn new(
        name: impl Into<String>,
        ecosystem: impl Into<String>,
        niche: impl Into<String>,
        phenotype: Phenotype,
    ) -> Result<Self> {
        let ecosystem = ecosystem.into();
        let niche = niche.into();
        let genome_hash = content_hash(&ecosystem, &niche, &phenotype, &[])?;
        Ok(Self {
            name: name.into(),
            ecosystem,
            niche,
            genome_hash,
            lifecycle_state: LifecycleState::Pluripotent,
            lineage: Vec::new(),
            phenotype,
        })
    }

    /// Derive a child genome carrying this genome's hash in its lineage
    pub fn mutate(&self, name: impl Into<String>, phenotype: Phenotype) -> Result<Self> {
        let mut lineage = self.lineage.clone();
        lineage.push(self.genome_hash.clone());
        let genome_hash = content_hash(&self.ecosystem, &self.niche, &phenotype, &lineage)?;
        Ok(Self {
            name: name.into(),
            ecosystem: self.ecosystem.clone(),
            niche: self.niche.clone(),
            genome_hash,
            lifecycle_state: LifecycleState::Pluripotent,
            lineage,
            phenotype,
        })
    }

    pub fn hash(&self) -> &str {
        &self.genome_hash
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle_state
    }

    pub fn lineage(&self) -> &[String] {
        &self.lineage
    }

    pub fn parent(&self) -> Option<&str> {
        self.lineage.last().map(String::as_str)
    }

    pub fn phenotype(&self) -> &Phenotype {
        &self.phenotype
    }

    /// Recompute the content hash and compare with the stored one
    pub fn verify_hash(&self) -> bool {
        content_hash(&self.ecosystem, &self.niche, &self.phenotype, &self.lineage)
            .map(|h| h == self.genome_hash)
            .unwrap_or(false)
    }

    pub(crate) fn set_state(&mut self, state: LifecycleState) {
        self.lifecycle_state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(latency: f64) -> BTreeMap<String, Value> {
        let mut map = BTreeMap::new();
        map.insert("latency_budget_ms".to_string(), json!(latency));
        map.insert("cooperation_style".to_string(), json!("eager"));
        map.insert("communication_patterns".to_string(), json!(["pubsub", "rpc"]));
        map.insert("swappiness".to_string(), json!(10));
        map
    }

    #[test]
    fn test_lifecycle_edges() {
        use LifecycleState::*;
        assert!(Pluripotent.can_transition_to(Differentiated));
        assert!(Differentiated.can_transition_to(Active));
        assert!(Active.can_transition_to(Dormant));
        assert!(Dormant.can_transition_to(Active));
        assert!(Dormant.can_transition_to(Pruned));
        assert!(Active.can_transition_to(Pruned));

        assert!(!Pluripotent.can_transition_to(Active));
        assert!(!Differentiated.can_transition_to(Pruned));
        assert!(!Pruned.can_transition_to(Active));
        assert!(!Active.can_transition_to(Active));
    }

    #[test]
    fn test_lifecycle_from_str() {
        assert_eq!("Dormant".parse::<LifecycleState>().unwrap(), LifecycleState::Dormant);
        assert!("zombie".parse::<LifecycleState>().is_err());
    }

    #[test]
    fn test_phenotype_lifts_known_keys() {
        let phenotype = Phenotype::from_params(params(250.0));
        assert_eq!(phenotype.latency_budget_ms, Some(250.0));
        assert_eq!(phenotype.cooperation_style.as_deref(), Some("eager"));
        assert_eq!(phenotype.communication_patterns, vec!["pubsub", "rpc"]);
        assert_eq!(phenotype.throughput_target, None);
        assert_eq!(phenotype.parameters["swappiness"], json!(10));
    }

    #[test]
    fn test_hash_is_content_addressed() {
        let a = CandidateGenome::new("a", "kernel", "vm", Phenotype::from_params(params(250.0))).unwrap();
        let b = CandidateGenome::new("b", "kernel", "vm", Phenotype::from_params(params(250.0))).unwrap();
        let c = CandidateGenome::new("c", "kernel", "vm", Phenotype::from_params(params(300.0))).unwrap();
        let d = CandidateGenome::new("d", "kernel", "io", Phenotype::from_params(params(250.0))).unwrap();

        // name is a label, not content
        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.hash(), c.hash());
        assert_ne!(a.hash(), d.hash());
        assert_eq!(a.hash().len(), 64);
        assert!(a.verify_hash());
    }

    #[test]
    fn test_mutation_extends_lineage() {
        let root = CandidateGenome::new("root", "kernel", "vm", Phenotype::default()).unwrap();
        let child = root
            .mutate("child", Phenotype::from_params(params(100.0)))
            .unwrap();
        let grandchild = child.mutate("grandchild", Phenotype::default()).unwrap();

        assert_eq!(child.parent(), Some(root.hash()));
        assert_eq!(grandchild.lineage(), &[root.hash().to_string(), child.hash().to_string()]);
        assert_eq!(child.state(), LifecycleState::Pluripotent);
        // same phenotype as root but different lineage
        assert_ne!(grandchild.hash(), root.hash());
    }

    #[test]
    fn test_tampered_genome_fails_verification() {
        let genome = CandidateGenome::new("a", "kernel", "vm", Phenotype::default()).unwrap();
        let mut value = serde_json::to_value(&genome).unwrap();
        value["niche"] = json!("io");
        let tampered: CandidateGenome = serde_json::from_value(value).unwrap();
        assert!(!tampered.verify_hash());
    }
}
