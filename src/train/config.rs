//! Population training configuration and hyperparameters
//!
//! Defines every knob of the generation loop with validation, builder-style
//! setters and JSON persistence.

use std::{fs, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tch::Device;

use crate::{error::PbtError, policy::NetworkConfig};

/// Where networks and update tensors live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceChoice {
    /// CUDA device 0 when available, CPU otherwise
    Auto,
    Cpu,
    Cuda(usize),
}

impl DeviceChoice {
    pub fn resolve(self) -> Device {
        match self {
            Self::Auto => Device::cuda_if_available(),
            Self::Cpu => Device::Cpu,
            Self::Cuda(index) => Device::Cuda(index),
        }
    }
}

/// Population-based training configuration
///
/// Defaults reproduce the 12-agent, 4-car racing setup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PbtConfig {
    /// Number of agents in the population
    pub population_size: usize,

    /// Cars per episode (and per scheduled group)
    pub agents_per_game: usize,

    /// Transitions per update step
    pub batch_size: usize,

    /// Discount factor
    pub gamma: f64,

    /// Polyak blend factor for target networks
    pub tau: f64,

    /// Per-element probability of perturbing a parameter after exploit
    pub mutation_rate: f64,

    /// Standard deviation of the mutation noise
    pub mutation_scale: f64,

    /// Elo rating every agent starts with
    pub initial_rating: f64,

    /// Elo K-factor
    pub k_factor: f64,

    /// Exploit threshold on the agent's expected score against its peer
    pub tselect: f64,

    /// Frames an agent must process before it takes part in exploit/explore
    pub eligibility_frames: u64,

    /// Replay buffer capacity per agent
    pub replay_capacity: usize,

    /// Generations without updates after resuming from a checkpoint
    pub fill_generations: usize,

    /// Learning rate of the shared critic
    pub critic_learning_rate: f64,

    /// Policy learning rate of agent 0
    pub policy_learning_rate_base: f64,

    /// Policy learning rate increment per agent index
    pub policy_learning_rate_step: f64,

    /// Network architecture
    pub network: NetworkConfig,

    pub device: DeviceChoice,

    /// Seed for scheduling, sampling and mutation RNGs (entropy if unset)
    pub seed: Option<u64>,
}

impl Default for PbtConfig {
    fn default() -> Self {
        Self {
            population_size: 12,
            agents_per_game: 4,
            batch_size: 64,
            gamma: 0.99,
            tau: 0.005,
            mutation_rate: 0.1,
            mutation_scale: 0.2,
            initial_rating: 1200.0,
            k_factor: 32.0,
            tselect: 0.35,
            eligibility_frames: 5_000,
            replay_capacity: 5_000,
            fill_generations: 4,
            critic_learning_rate: 2e-4,
            policy_learning_rate_base: 2e-6,
            policy_learning_rate_step: 1e-6,
            network: NetworkConfig::default(),
            device: DeviceChoice::Auto,
            seed: None,
        }
    }
}

impl PbtConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| -> Result<()> { Err(PbtError::InvalidConfig(msg).into()) };

        if self.agents_per_game < 2 || self.agents_per_game % 2 != 0 {
            return invalid(format!(
                "agents_per_game must be even and at least 2, got {}",
                self.agents_per_game
            ));
        }
        if self.population_size == 0 || self.population_size % self.agents_per_game != 0 {
            return invalid(format!(
                "population_size {} must be a positive multiple of agents_per_game {}",
                self.population_size, self.agents_per_game
            ));
        }
        if self.batch_size == 0 {
            return invalid("batch_size must be positive".into());
        }
        if self.replay_capacity < self.batch_size {
            return invalid(format!(
                "replay_capacity {} is smaller than batch_size {}",
                self.replay_capacity, self.batch_size
            ));
        }
        if !(0.0..=1.0).contains(&self.gamma) {
            return invalid("gamma must be in [0, 1]".into());
        }
        if !(0.0..=1.0).contains(&self.tau) {
            return invalid("tau must be in [0, 1]".into());
        }
        if !(0.0..=1.0).contains(&self.mutation_rate) {
            return invalid("mutation_rate must be in [0, 1]".into());
        }
        if self.mutation_scale < 0.0 {
            return invalid("mutation_scale must be non-negative".into());
        }
        if !(self.initial_rating > 0.0 && self.initial_rating.is_finite()) {
            return invalid("initial_rating must be positive".into());
        }
        if self.k_factor <= 0.0 {
            return invalid("k_factor must be positive".into());
        }
        if !(0.0..=1.0).contains(&self.tselect) {
            return invalid("tselect must be in [0, 1]".into());
        }
        if self.critic_learning_rate <= 0.0 || self.policy_learning_rate_base <= 0.0 {
            return invalid("learning rates must be positive".into());
        }
        if self.policy_learning_rate_step < 0.0 {
            return invalid("policy_learning_rate_step must be non-negative".into());
        }
        if self.network.channels <= 0
            || self.network.height <= 0
            || self.network.width <= 0
            || self.network.hidden_dim <= 0
        {
            return invalid("network dimensions must be positive".into());
        }
        Ok(())
    }

    /// Policy learning rate for the agent at `index`
    pub fn policy_learning_rate(&self, index: usize) -> f64 {
        self.policy_learning_rate_base + index as f64 * self.policy_learning_rate_step
    }

    /// Number of groups scheduled per generation
    pub fn groups_per_generation(&self) -> usize {
        self.population_size / self.agents_per_game
    }

    /// Load a configuration from JSON; missing fields take their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = serde_json::from_str(&contents)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Set population size
    pub fn population_size(mut self, size: usize) -> Self {
        self.population_size = size;
        self
    }

    /// Set cars per episode
    pub fn agents_per_game(mut self, agents: usize) -> Self {
        self.agents_per_game = agents;
        self
    }

    /// Set update batch size
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Set replay capacity per agent
    pub fn replay_capacity(mut self, capacity: usize) -> Self {
        self.replay_capacity = capacity;
        self
    }

    /// Set mutation probability and noise scale
    pub fn mutation(mut self, rate: f64, scale: f64) -> Self {
        self.mutation_rate = rate;
        self.mutation_scale = scale;
        self
    }

    /// Set the eligibility threshold in frames
    pub fn eligibility_frames(mut self, frames: u64) -> Self {
        self.eligibility_frames = frames;
        self
    }

    /// Set the post-restore warm-up length
    pub fn fill_generations(mut self, generations: usize) -> Self {
        self.fill_generations = generations;
        self
    }

    /// Set network architecture
    pub fn network(mut self, network: NetworkConfig) -> Self {
        self.network = network;
        self
    }

    /// Set device selection
    pub fn device(mut self, device: DeviceChoice) -> Self {
        self.device = device;
        self
    }

    /// Set RNG seed
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_is_valid() {
        let config = PbtConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.groups_per_generation(), 3);
    }

    #[test]
    fn test_policy_learning_rates_increase_with_index() {
        let config = PbtConfig::default();
        assert!((config.policy_learning_rate(0) - 2e-6).abs() < 1e-12);
        assert!((config.policy_learning_rate(11) - 1.3e-5).abs() < 1e-12);
    }

    #[test]
    fn test_rejects_uneven_partition() {
        let config = PbtConfig::default().population_size(10);
        let err = config.validate().unwrap_err();
        assert!(matches!(err.downcast_ref::<PbtError>(), Some(PbtError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_odd_group() {
        let config = PbtConfig::default().agents_per_game(3).population_size(9);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_capacity_below_batch() {
        let config = PbtConfig::default().batch_size(64).replay_capacity(32);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_roundtrip_with_partial_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        std::fs::write(&path, r#"{ "population_size": 8, "seed": 3 }"#).unwrap();
        let config = PbtConfig::from_json_file(&path).unwrap();
        assert_eq!(config.population_size, 8);
        assert_eq!(config.seed, Some(3));
        assert_eq!(config.agents_per_game, 4);

        config.save_json(&path).unwrap();
        assert_eq!(PbtConfig::from_json_file(&path).unwrap(), config);
    }
}
