//! Best-model bookkeeping
//!
//! Tracks the best and second-best episode rewards seen during the whole run
//! and keeps the policies that produced them under `best_models/`:
//!
//! ```text
//! best_policy_0.safetensors   best
//! best_policy_1.safetensors   second best
//! best_rewards.json
//! ```
//!
//! The rewards never decrease. A new best pushes the old best into the second
//! slot; ties keep the earlier holder. Policies and the record are written
//! under a temporary name and renamed into place. A crash between two renames
//! can leave a label older than its policy file, never a label without one.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{multi_agent::AgentId, policy::Network};

const BEST_FILE: &str = "best_policy_0.safetensors";
const SECOND_FILE: &str = "best_policy_1.safetensors";
const REWARDS_FILE: &str = "best_rewards.json";
// Written first and renamed into place; the extension selects the tensor format
const PARTIAL_FILE: &str = "best_policy.partial.safetensors";
const PARTIAL_REWARDS_FILE: &str = "best_rewards.json.partial";

/// A recorded reward and the agent that produced it
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BestEntry {
    pub reward: f64,
    pub agent: AgentId,
}

/// What an observation changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BestUpdate {
    Unchanged,
    NewBest,
    NewSecond,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BestRecord {
    best: Option<BestEntry>,
    second: Option<BestEntry>,
}

/// BestModels
#[derive(Debug)]
pub struct BestModels {
    dir: PathBuf,
    record: BestRecord,
}

impl BestModels {
    /// Empty record stored in `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), record: BestRecord::default() }
    }

    /// Reopen a record written by an earlier run, or start empty
    ///
    /// An unreadable record is discarded with a warning, and entries whose
    /// policy file is missing are dropped, so a run interrupted mid-update
    /// can always resume.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let path = dir.join(REWARDS_FILE);
        let record = if path.is_file() {
            let parsed = fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))
                .and_then(|contents| {
                    serde_json::from_str::<BestRecord>(&contents)
                        .with_context(|| format!("parsing {}", path.display()))
                });
            match parsed {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(error = %e, "discarding unreadable best-model record");
                    BestRecord::default()
                }
            }
        } else {
            BestRecord::default()
        };

        let mut best = Self { dir, record };
        best.reconcile()?;
        Ok(best)
    }

    /// Make every recorded entry point at an existing policy file
    fn reconcile(&mut self) -> Result<()> {
        for partial in [self.dir.join(PARTIAL_FILE), self.dir.join(PARTIAL_REWARDS_FILE)] {
            if partial.is_file() {
                fs::remove_file(&partial)?;
            }
        }

        if self.record.best.is_some() && !self.best_path().is_file() {
            tracing::warn!(
                path = %self.best_path().display(),
                "best policy missing, dropping entry"
            );
            self.record.best = None;
        }
        if self.record.second.is_some() && !self.second_path().is_file() {
            tracing::warn!(
                path = %self.second_path().display(),
                "second best policy missing, dropping entry"
            );
            self.record.second = None;
        }
        if self.record.best.is_none() && self.record.second.is_some() {
            fs::rename(self.second_path(), self.best_path())?;
            self.record.best = self.record.second.take();
        }
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn best(&self) -> Option<BestEntry> {
        self.record.best
    }

    pub fn second(&self) -> Option<BestEntry> {
        self.record.second
    }

    pub fn best_path(&self) -> PathBuf {
        self.dir.join(BEST_FILE)
    }

    pub fn second_path(&self) -> PathBuf {
        self.dir.join(SECOND_FILE)
    }

    /// Offer one agent's episode reward together with its current policy
    pub fn observe<N: Network>(
        &mut self,
        agent: AgentId,
        reward: f64,
        policy: &N,
    ) -> Result<BestUpdate> {
        let entry = BestEntry { reward, agent };
        let beats = |slot: Option<BestEntry>| slot.is_none_or(|held| reward > held.reward);

        let update = if beats(self.record.best) {
            fs::create_dir_all(&self.dir)?;
            let partial = self.dir.join(PARTIAL_FILE);
            policy.save(&partial)?;
            let shifted = if self.best_path().is_file() {
                fs::rename(self.best_path(), self.second_path())?;
                self.record.best
            } else {
                None
            };
            fs::rename(&partial, self.best_path())?;
            self.record.best = Some(entry);
            self.record.second = shifted;
            tracing::info!(%agent, reward, "new best reward");
            BestUpdate::NewBest
        } else if beats(self.record.second) {
            fs::create_dir_all(&self.dir)?;
            let partial = self.dir.join(PARTIAL_FILE);
            policy.save(&partial)?;
            fs::rename(&partial, self.second_path())?;
            self.record.second = Some(entry);
            tracing::info!(%agent, reward, "new second best reward");
            BestUpdate::NewSecond
        } else {
            return Ok(BestUpdate::Unchanged);
        };

        self.persist()?;
        Ok(update)
    }

    /// Write the record beside its final name, then swap it in
    fn persist(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.record)?;
        let partial = self.dir.join(PARTIAL_REWARDS_FILE);
        fs::write(&partial, json).with_context(|| format!("writing {}", partial.display()))?;
        fs::rename(&partial, self.dir.join(REWARDS_FILE))?;
        Ok(())
    }
}
