//! Checkpoint persistence
//!
//! A checkpoint holds every agent's policy, target policy and optimizer
//! state, the shared critic pair with its optimizer, and three arrays aligned
//! to population order (ratings, frame counts, eligibility):
//!
//! ```text
//! <root>/checkpoint/
//!   manifest.json            {generation, population_size}
//!   ratings.json frame_counts.json eligible.json
//!   critic.safetensors target_critic.safetensors critic_optimizer.safetensors
//!   agent{i}/policy.safetensors target_policy.safetensors optimizer.safetensors
//! ```
//!
//! Saving writes a complete snapshot into `checkpoint.partial/` and then
//! swaps it in with two renames, so a crash never leaves a half-written
//! `checkpoint/` behind. If the crash falls between the renames, loading
//! picks up `checkpoint.previous/`.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tch::{Device, Tensor, nn};

use crate::{
    error::PbtError,
    multi_agent::{CriticManager, Population, population::is_eligible},
    policy::{Critic, Network, Policy},
    train::Adam,
};

pub mod best;

pub use best::{BestEntry, BestModels, BestUpdate};

const LIVE_DIR: &str = "checkpoint";
const PARTIAL_DIR: &str = "checkpoint.partial";
const PREVIOUS_DIR: &str = "checkpoint.previous";

const MANIFEST_FILE: &str = "manifest.json";
const RATINGS_FILE: &str = "ratings.json";
const FRAME_COUNTS_FILE: &str = "frame_counts.json";
const ELIGIBLE_FILE: &str = "eligible.json";

const CRITIC_FILE: &str = "critic.safetensors";
const TARGET_CRITIC_FILE: &str = "target_critic.safetensors";
const CRITIC_OPTIMIZER_FILE: &str = "critic_optimizer.safetensors";

const POLICY_FILE: &str = "policy.safetensors";
const TARGET_POLICY_FILE: &str = "target_policy.safetensors";
const OPTIMIZER_FILE: &str = "optimizer.safetensors";

/// Snapshot metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Generations completed when the snapshot was taken
    pub generation: usize,
    pub population_size: usize,
}

/// Per-agent scalars, index-aligned to population order
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedState {
    pub ratings: Vec<f64>,
    pub frame_counts: Vec<u64>,
    pub eligible: Vec<bool>,
}

impl IndexedState {
    /// Capture the arrays from a population
    pub fn capture<P>(population: &Population<P>, eligibility_frames: u64) -> Self {
        Self {
            ratings: population.ratings(),
            frame_counts: population.frame_counts(),
            eligible: population.eligibility(eligibility_frames),
        }
    }

    /// Write the three arrays into `dir`
    pub fn save(&self, dir: &Path) -> Result<()> {
        write_json(&dir.join(RATINGS_FILE), &self.ratings)?;
        write_json(&dir.join(FRAME_COUNTS_FILE), &self.frame_counts)?;
        write_json(&dir.join(ELIGIBLE_FILE), &self.eligible)?;
        Ok(())
    }

    /// Read and validate the arrays for a population of `population_size`
    ///
    /// Every array must be present and exactly `population_size` long, and
    /// every rating finite and positive.
    pub fn load(dir: &Path, population_size: usize) -> Result<Self> {
        let ratings: Vec<f64> = read_json(&dir.join(RATINGS_FILE))?;
        let frame_counts: Vec<u64> = read_json(&dir.join(FRAME_COUNTS_FILE))?;
        let eligible: Vec<bool> = read_json(&dir.join(ELIGIBLE_FILE))?;

        check_length(&dir.join(RATINGS_FILE), population_size, ratings.len())?;
        check_length(&dir.join(FRAME_COUNTS_FILE), population_size, frame_counts.len())?;
        check_length(&dir.join(ELIGIBLE_FILE), population_size, eligible.len())?;

        if let Some((index, rating)) =
            ratings.iter().enumerate().find(|(_, r)| !(r.is_finite() && **r > 0.0))
        {
            return Err(PbtError::corruption(
                dir.join(RATINGS_FILE),
                format!("rating {rating} of agent{index} is not a positive number"),
            )
            .into());
        }

        Ok(Self { ratings, frame_counts, eligible })
    }
}

fn check_length(path: &Path, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(PbtError::corruption(
            path,
            format!("expected {expected} entries, found {actual}"),
        )
        .into());
    }
    Ok(())
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = fs::read_to_string(path)
        .map_err(|e| PbtError::corruption(path, format!("cannot read: {e}")))?;
    let value = serde_json::from_str(&contents)
        .map_err(|e| PbtError::corruption(path, format!("cannot parse: {e}")))?;
    Ok(value)
}

/// Check that a network file holds every variable of `vs` with its shape
fn check_network_blob(path: &Path, vs: &nn::VarStore) -> Result<()> {
    let stored: HashMap<String, Tensor> = Tensor::read_safetensors(path)
        .map_err(|e| PbtError::corruption(path, format!("cannot read: {e}")))?
        .into_iter()
        .collect();

    for (name, variable) in vs.variables() {
        match stored.get(&name) {
            Some(tensor) if tensor.size() == variable.size() => {}
            Some(tensor) => {
                return Err(PbtError::corruption(
                    path,
                    format!("{name} has shape {:?}, expected {:?}", tensor.size(), variable.size()),
                )
                .into());
            }
            None => return Err(PbtError::corruption(path, format!("{name} is missing")).into()),
        }
    }
    Ok(())
}

fn read_optimizer(path: &Path, device: Device) -> Result<Adam> {
    let mut optimizer = Adam::new(0.0);
    optimizer
        .load(path, device)
        .map_err(|e| PbtError::corruption(path, format!("cannot read optimizer state: {e}")))?;
    Ok(optimizer)
}

/// Directory of agent `index` inside a snapshot
fn agent_dir(dir: &Path, index: usize) -> PathBuf {
    dir.join(format!("agent{index}"))
}

/// CheckpointManager
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    root: PathBuf,
}

impl CheckpointManager {
    /// Manage checkpoints below `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the live snapshot
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.root.join(LIVE_DIR)
    }

    /// Whether a loadable snapshot exists
    pub fn exists(&self) -> bool {
        self.snapshot_dir().is_ok()
    }

    /// Snapshot to load from: the live one, or the previous one after an
    /// interrupted swap
    fn snapshot_dir(&self) -> Result<PathBuf> {
        let live = self.root.join(LIVE_DIR);
        if live.join(MANIFEST_FILE).is_file() {
            return Ok(live);
        }

        let previous = self.root.join(PREVIOUS_DIR);
        if previous.join(MANIFEST_FILE).is_file() {
            tracing::warn!(
                path = %previous.display(),
                "live checkpoint missing, using previous snapshot"
            );
            return Ok(previous);
        }

        Err(PbtError::CheckpointMissing { path: live }.into())
    }

    /// Persist the full training state after `generation` completed generations
    pub fn save<P: Policy, C: Critic>(
        &self,
        generation: usize,
        population: &Population<P>,
        critics: &CriticManager<C>,
        eligibility_frames: u64,
    ) -> Result<PathBuf> {
        let partial = self.root.join(PARTIAL_DIR);
        if partial.exists() {
            fs::remove_dir_all(&partial)?;
        }
        fs::create_dir_all(&partial)
            .with_context(|| format!("creating {}", partial.display()))?;

        for agent in population.iter() {
            let dir = agent_dir(&partial, agent.id.index());
            fs::create_dir_all(&dir)?;
            agent.policy.save(&dir.join(POLICY_FILE))?;
            agent.target_policy.save(&dir.join(TARGET_POLICY_FILE))?;
            agent.optimizer.save(&dir.join(OPTIMIZER_FILE))?;
        }

        critics.critic.save(&partial.join(CRITIC_FILE))?;
        critics.target_critic.save(&partial.join(TARGET_CRITIC_FILE))?;
        critics.optimizer.save(&partial.join(CRITIC_OPTIMIZER_FILE))?;

        IndexedState::capture(population, eligibility_frames).save(&partial)?;
        // Manifest last: its presence marks a complete snapshot
        write_json(
            &partial.join(MANIFEST_FILE),
            &Manifest { generation, population_size: population.len() },
        )?;

        let live = self.root.join(LIVE_DIR);
        let previous = self.root.join(PREVIOUS_DIR);
        if previous.exists() {
            fs::remove_dir_all(&previous)?;
        }
        if live.exists() {
            fs::rename(&live, &previous)?;
        }
        fs::rename(&partial, &live)?;
        if previous.exists() {
            fs::remove_dir_all(&previous)?;
        }

        tracing::info!(generation, path = %live.display(), "checkpoint saved");
        Ok(live)
    }

    /// Restore the full training state into an already constructed population
    ///
    /// Every file is read and checked against the networks it restores
    /// before anything is overwritten. Stored
    /// eligibility flags are compared with the flags recomputed from frame
    /// counts; disagreements are logged and the recomputed value wins.
    pub fn load<P: Policy, C: Critic>(
        &self,
        population: &mut Population<P>,
        critics: &mut CriticManager<C>,
        eligibility_frames: u64,
    ) -> Result<Manifest> {
        let dir = self.snapshot_dir()?;
        let manifest: Manifest = read_json(&dir.join(MANIFEST_FILE))?;
        if manifest.population_size != population.len() {
            return Err(PbtError::corruption(
                dir.join(MANIFEST_FILE),
                format!(
                    "snapshot holds {} agents, population has {}",
                    manifest.population_size,
                    population.len()
                ),
            )
            .into());
        }

        let state = IndexedState::load(&dir, population.len())?;
        let mut optimizers = Vec::with_capacity(population.len());
        for agent in population.iter() {
            let agent_dir = agent_dir(&dir, agent.id.index());
            check_network_blob(&agent_dir.join(POLICY_FILE), agent.policy.var_store())?;
            let target_store = agent.target_policy.var_store();
            check_network_blob(&agent_dir.join(TARGET_POLICY_FILE), target_store)?;
            let optimizer = read_optimizer(&agent_dir.join(OPTIMIZER_FILE), agent.policy.device())?;
            optimizers.push(optimizer);
        }
        check_network_blob(&dir.join(CRITIC_FILE), critics.critic.var_store())?;
        check_network_blob(&dir.join(TARGET_CRITIC_FILE), critics.target_critic.var_store())?;
        let critic_optimizer = read_optimizer(&dir.join(CRITIC_OPTIMIZER_FILE), critics.device())?;

        for (agent, optimizer) in population.iter_mut().zip(optimizers) {
            let index = agent.id.index();
            let agent_dir = agent_dir(&dir, index);

            agent.policy.load(&agent_dir.join(POLICY_FILE))?;
            agent.target_policy.load(&agent_dir.join(TARGET_POLICY_FILE))?;
            agent.optimizer = optimizer;
            agent.rating = state.ratings[index];
            agent.frames_processed = state.frame_counts[index];

            let recomputed = is_eligible(agent.frames_processed, eligibility_frames);
            if recomputed != state.eligible[index] {
                tracing::warn!(
                    agent = %agent.id,
                    stored = state.eligible[index],
                    recomputed,
                    "stored eligibility disagrees with frame count"
                );
            }
        }

        critics.critic.load(&dir.join(CRITIC_FILE))?;
        critics.target_critic.load(&dir.join(TARGET_CRITIC_FILE))?;
        critics.optimizer = critic_optimizer;

        tracing::info!(
            generation = manifest.generation,
            path = %dir.display(),
            "checkpoint loaded"
        );
        Ok(manifest)
    }
}
