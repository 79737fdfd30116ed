//! Candidate Registry
//!
//! Persistent store of candidate identity, lifecycle state, and genome-hash
//! deduplication. This is the system's only deduplication guarantee: a genome
//! hash, once registered for a niche, is never registered (or tested) again,
//! even after the candidate has been pruned.
//!
//! # Durability
//!
//! - Before every structural mutation the current document is written as an
//!   immutable, versioned snapshot (`registry-v00000042.json`).
//! - The live file is then replaced via write-temp-then-rename.
//! - If the snapshot cannot be written the mutation is abandoned and both the
//!   in-memory and on-disk state stay untouched.
//! - With a retention count set, only the newest snapshots are kept.

use crate::error::{EvolverError, Result};
use crate::genome::{CandidateGenome, LifecycleState};
use crate::persist;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const SNAPSHOT_PREFIX: &str = "registry-v";
const SNAPSHOT_SUFFIX: &str = ".json";

/// Candidate names in a niche, bucketed by lifecycle state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NicheMembers {
    #[serde(default)]
    pub pluripotent: Vec<String>,
    #[serde(default)]
    pub differentiated: Vec<String>,
    #[serde(default)]
    pub active: Vec<String>,
    #[serde(default)]
    pub dormant: Vec<String>,
    #[serde(default)]
    pub pruned: Vec<String>,
}

impl NicheMembers {
    pub fn bucket(&self, state: LifecycleState) -> &Vec<String> {
        match state {
            LifecycleState::Pluripotent => &self.pluripotent,
            LifecycleState::Differentiated => &self.differentiated,
            LifecycleState::Active => &self.active,
            LifecycleState::Dormant => &self.dormant,
            LifecycleState::Pruned => &self.pruned,
        }
    }

    fn bucket_mut(&mut self, state: LifecycleState) -> &mut Vec<String> {
        match state {
            LifecycleState::Pluripotent => &mut self.pluripotent,
            LifecycleState::Differentiated => &mut self.differentiated,
            LifecycleState::Active => &mut self.active,
            LifecycleState::Dormant => &mut self.dormant,
            LifecycleState::Pruned => &mut self.pruned,
        }
    }

    pub fn len(&self) -> usize {
        LifecycleState::ALL.iter().map(|s| self.bucket(*s).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EcosystemEntry {
    #[serde(default)]
    pub niches: BTreeMap<String, NicheMembers>,
}

/// On-disk registry document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryDocument {
    pub version: u64,
    #[serde(default)]
    pub ecosystems: BTreeMap<String, EcosystemEntry>,
    /// Candidate name -> genome
    #[serde(default)]
    pub zooids: BTreeMap<String, CandidateGenome>,
    /// Genome hash -> candidate name
    #[serde(default)]
    pub genomes: BTreeMap<String, String>,
}

/// Result of [`CandidateRegistry::register`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    Registered,
    /// The hash was already seen; carries the name it was registered under
    Duplicate { existing: String },
}

impl Registration {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Registration::Duplicate { .. })
    }
}

/// Registry statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryStats {
    pub version: u64,
    pub total_candidates: usize,
    pub by_state: BTreeMap<LifecycleState, usize>,
    pub ecosystems: usize,
    pub niches: usize,
}

pub struct CandidateRegistry {
    doc: RegistryDocument,
    live_path: Option<PathBuf>,
    snapshot_dir: Option<PathBuf>,
    /// 0 keeps every snapshot
    snapshot_retention: usize,
}

impl CandidateRegistry {
    /// Create an empty registry that never touches disk
    pub fn new() -> Self {
        Self {
            doc: RegistryDocument::default(),
            live_path: None,
            snapshot_dir: None,
            snapshot_retention: 0,
        }
    }

    /// Load the registry from `live_path`
    ///
    /// A missing file yields an empty registry. A corrupt file is backed up
    /// and the newest readable snapshot is used instead.
    pub fn load(live_path: &Path, snapshot_dir: &Path) -> Result<Self> {
        let mut registry = Self {
            doc: RegistryDocument::default(),
            live_path: Some(live_path.to_path_buf()),
            snapshot_dir: Some(snapshot_dir.to_path_buf()),
            snapshot_retention: 0,
        };

        if !live_path.exists() {
            debug!("No registry at {}, starting empty", live_path.display());
            return Ok(registry);
        }

        match read_document(live_path) {
            Ok(doc) => registry.doc = doc,
            Err(e) => {
                warn!("Registry file {} is unreadable: {}", live_path.display(), e);
                persist::backup_corrupt(live_path)?;
                registry.doc = registry.newest_readable_snapshot()?.unwrap_or_default();
                info!("Recovered registry at version {}", registry.doc.version);
            }
        }

        for genome in registry.doc.zooids.values() {
            if !genome.verify_hash() {
                warn!("Genome {} does not match its recorded hash", genome.name);
            }
        }

        Ok(registry)
    }

    /// Keep only the newest `retention` snapshots after each mutation
    pub fn with_snapshot_retention(mut self, retention: usize) -> Self {
        self.snapshot_retention = retention;
        self
    }

    pub fn version(&self) -> u64 {
        self.doc.version
    }

    pub fn document(&self) -> &RegistryDocument {
        &self.doc
    }

    pub fn get(&self, name: &str) -> Option<&CandidateGenome> {
        self.doc.zooids.get(name)
    }

    pub fn get_by_hash(&self, hash: &str) -> Option<&CandidateGenome> {
        self.doc
            .genomes
            .get(hash)
            .and_then(|name| self.doc.zooids.get(name))
    }

    pub fn contains_hash(&self, hash: &str) -> bool {
        self.doc.genomes.contains_key(hash)
    }

    pub fn niche(&self, ecosystem: &str, niche: &str) -> Option<&NicheMembers> {
        self.doc
            .ecosystems
            .get(ecosystem)
            .and_then(|e| e.niches.get(niche))
    }

    pub fn niche_members(&self, ecosystem: &str, niche: &str, state: LifecycleState) -> Vec<String> {
        self.niche(ecosystem, niche)
            .map(|n| n.bucket(state).clone())
            .unwrap_or_default()
    }

    pub fn candidates(&self) -> impl Iterator<Item = &CandidateGenome> {
        self.doc.zooids.values()
    }

    /// Insert a genome under its hash unless the hash was already seen
    pub fn register(&mut self, genome: CandidateGenome) -> Result<Registration> {
        if let Some(existing) = self.doc.genomes.get(genome.hash()) {
            debug!(
                "Genome {} already registered as {}",
                &genome.hash()[..12],
                existing
            );
            return Ok(Registration::Duplicate {
                existing: existing.clone(),
            });
        }
        if self.doc.zooids.contains_key(&genome.name) {
            return Err(EvolverError::AlreadyExists(format!(
                "candidate name '{}' is bound to a different genome",
                genome.name
            )));
        }

        let mut next = self.doc.clone();
        next.ecosystems
            .entry(genome.ecosystem.clone())
            .or_default()
            .niches
            .entry(genome.niche.clone())
            .or_default()
            .bucket_mut(genome.state())
            .push(genome.name.clone());
        next.genomes
            .insert(genome.hash().to_string(), genome.name.clone());
        let name = genome.name.clone();
        next.zooids.insert(name.clone(), genome);

        self.commit(next)?;
        debug!("Registered candidate {}", name);
        Ok(Registration::Registered)
    }

    /// Move a candidate along the lifecycle state machine
    pub fn transition(&mut self, name: &str, new_state: LifecycleState) -> Result<()> {
        self.transition_through(name, &[new_state])
    }

    /// Walk a candidate through several states as one versioned mutation
    ///
    /// Every edge is checked before anything is written.
    pub fn transition_through(&mut self, name: &str, path: &[LifecycleState]) -> Result<()> {
        let genome = self
            .doc
            .zooids
            .get(name)
            .ok_or_else(|| EvolverError::NotFound(format!("candidate '{}'", name)))?;
        let start = genome.state();
        let mut from = start;
        for &to in path {
            if !from.can_transition_to(to) {
                return Err(EvolverError::InvalidTransition {
                    name: name.to_string(),
                    from,
                    to,
                });
            }
            from = to;
        }
        let Some(&end) = path.last() else {
            return Ok(());
        };
        let (ecosystem, niche) = (genome.ecosystem.clone(), genome.niche.clone());

        let mut next = self.doc.clone();
        let members = next
            .ecosystems
            .entry(ecosystem)
            .or_default()
            .niches
            .entry(niche)
            .or_default();
        members.bucket_mut(start).retain(|n| n != name);
        members.bucket_mut(end).push(name.to_string());
        if let Some(genome) = next.zooids.get_mut(name) {
            genome.set_state(end);
        }

        self.commit(next)?;
        info!("Candidate {} transitioned {} -> {}", name, start, end);
        Ok(())
    }

    /// Register a tournament's candidates with its champion already
    /// differentiated, as one versioned mutation
    ///
    /// Fails without writing if any genome is already known or the champion
    /// is not among the candidates.
    pub fn commit_tournament(&mut self, candidates: &[CandidateGenome], champion: &str) -> Result<()> {
        if !candidates.iter().any(|g| g.name == champion) {
            return Err(EvolverError::NotFound(format!("champion '{}' among candidates", champion)));
        }

        let mut next = self.doc.clone();
        for genome in candidates {
            if let Some(existing) = next.genomes.get(genome.hash()) {
                return Err(EvolverError::AlreadyExists(format!(
                    "genome of '{}' already registered as '{}'",
                    genome.name, existing
                )));
            }
            if next.zooids.contains_key(&genome.name) {
                return Err(EvolverError::AlreadyExists(format!(
                    "candidate name '{}' is bound to a different genome",
                    genome.name
                )));
            }
            let mut genome = genome.clone();
            if genome.name == champion {
                if !genome.state().can_transition_to(LifecycleState::Differentiated) {
                    return Err(EvolverError::InvalidTransition {
                        name: genome.name.clone(),
                        from: genome.state(),
                        to: LifecycleState::Differentiated,
                    });
                }
                genome.set_state(LifecycleState::Differentiated);
            }
            next.ecosystems
                .entry(genome.ecosystem.clone())
                .or_default()
                .niches
                .entry(genome.niche.clone())
                .or_default()
                .bucket_mut(genome.state())
                .push(genome.name.clone());
            next.genomes
                .insert(genome.hash().to_string(), genome.name.clone());
            next.zooids.insert(genome.name.clone(), genome);
        }

        self.commit(next)?;
        info!(
            "Registered {} tournament candidates, champion {} differentiated",
            candidates.len(),
            champion
        );
        Ok(())
    }

    /// Write the current document as an immutable versioned snapshot
    ///
    /// Returns `None` for in-memory registries.
    pub fn snapshot(&self) -> Result<Option<PathBuf>> {
        let Some(dir) = &self.snapshot_dir else {
            return Ok(None);
        };
        let path = snapshot_path(dir, self.doc.version);
        if path.exists() {
            // left behind by a crash between snapshot and replace
            debug!("Snapshot {} already present", path.display());
            return Ok(Some(path));
        }
        persist::write_json_new(&path, &self.doc)
            .map_err(|e| EvolverError::SnapshotFailed(format!("{}: {}", path.display(), e)))?;
        debug!("Wrote registry snapshot {}", path.display());
        Ok(Some(path))
    }

    /// Snapshot versions on disk, oldest first
    pub fn list_snapshots(&self) -> Result<Vec<(u64, PathBuf)>> {
        let Some(dir) = &self.snapshot_dir else {
            return Ok(Vec::new());
        };
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut snapshots = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let version = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix(SNAPSHOT_PREFIX))
                .and_then(|n| n.strip_suffix(SNAPSHOT_SUFFIX))
                .and_then(|v| v.parse::<u64>().ok());
            if let Some(version) = version {
                snapshots.push((version, path));
            }
        }
        snapshots.sort_by_key(|(v, _)| *v);
        Ok(snapshots)
    }

    /// Replace the registry content with a snapshot, under a new version
    pub fn restore(&mut self, version: u64) -> Result<()> {
        let dir = self
            .snapshot_dir
            .as_ref()
            .ok_or_else(|| EvolverError::InvalidInput("registry has no snapshot directory".into()))?;
        let path = snapshot_path(dir, version);
        if !path.exists() {
            return Err(EvolverError::NotFound(format!("registry snapshot v{}", version)));
        }
        let restored = read_document(&path)?;
        self.commit(restored)?;
        info!(
            "Restored registry snapshot v{} as version {}",
            version, self.doc.version
        );
        Ok(())
    }

    pub fn stats(&self) -> RegistryStats {
        let mut by_state = BTreeMap::new();
        for genome in self.doc.zooids.values() {
            *by_state.entry(genome.state()).or_insert(0) += 1;
        }
        RegistryStats {
            version: self.doc.version,
            total_candidates: self.doc.zooids.len(),
            by_state,
            ecosystems: self.doc.ecosystems.len(),
            niches: self.doc.ecosystems.values().map(|e| e.niches.len()).sum(),
        }
    }

    fn commit(&mut self, mut next: RegistryDocument) -> Result<()> {
        self.snapshot()?;
        next.version = self.doc.version + 1;
        if let Some(path) = &self.live_path {
            persist::write_json_atomic(path, &next)?;
        }
        self.doc = next;
        if let Err(e) = self.prune_snapshots() {
            warn!("Failed to prune registry snapshots: {}", e);
        }
        Ok(())
    }

    /// Delete all but the newest `snapshot_retention` snapshots
    fn prune_snapshots(&self) -> Result<usize> {
        if self.snapshot_retention == 0 {
            return Ok(0);
        }
        let snapshots = self.list_snapshots()?;
        let excess = snapshots.len().saturating_sub(self.snapshot_retention);
        for (version, path) in &snapshots[..excess] {
            fs::remove_file(path)?;
            debug!("Pruned registry snapshot v{}", version);
        }
        Ok(excess)
    }

    fn newest_readable_snapshot(&self) -> Result<Option<RegistryDocument>> {
        for (version, path) in self.list_snapshots()?.into_iter().rev() {
            match read_document(&path) {
                Ok(doc) => return Ok(Some(doc)),
                Err(e) => warn!("Skipping unreadable snapshot v{}: {}", version, e),
            }
        }
        Ok(None)
    }
}

impl Default for CandidateRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn snapshot_path(dir: &Path, version: u64) -> PathBuf {
    dir.join(format!("{}{:08}{}", SNAPSHOT_PREFIX, version, SNAPSHOT_SUFFIX))
}

fn read_document(path: &Path) -> Result<RegistryDocument> {
    let contents = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}
