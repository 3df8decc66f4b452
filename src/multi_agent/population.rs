//! Population management for multi-agent training
//!
//! Owns the ordered collection of agents. An agent's index is its identity:
//! it never changes during a run and is the key used by checkpoints.

use std::fmt;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

use super::messages::Transition;
use crate::{
    buffer::ReplayBuffer,
    policy::{Network, Policy},
    train::{Adam, PbtConfig},
};

/// Stable identifier of an agent, equal to its position in the population
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub usize);

impl AgentId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agent{}", self.0)
    }
}

/// Whether an agent has processed enough frames to take part in exploit/explore
pub fn is_eligible(frames_processed: u64, threshold: u64) -> bool {
    frames_processed >= threshold
}

/// Individual agent in the population
#[derive(Debug)]
pub struct Agent<P> {
    /// Unique agent identifier
    pub id: AgentId,

    /// Online policy
    pub policy: P,

    /// Slow-moving copy of the policy used for bootstrap targets
    pub target_policy: P,

    /// Optimizer state for `policy`
    pub optimizer: Adam,

    /// Own transitions, most recent last
    pub replay_buffer: ReplayBuffer<Transition>,

    /// Frames seen since creation or the last exploit
    pub frames_processed: u64,

    /// Elo rating
    pub rating: f64,

    /// Cumulative reward of the latest episode
    pub last_episode_reward: f64,
}

impl<P: Policy> Agent<P> {
    /// Create an agent whose target policy starts as a copy of `policy`
    pub fn new(
        id: AgentId,
        policy: P,
        mut target_policy: P,
        learning_rate: f64,
        replay_capacity: usize,
        rating: f64,
    ) -> Result<Self> {
        target_policy.copy_weights_from(&policy)?;

        Ok(Self {
            id,
            policy,
            target_policy,
            optimizer: Adam::new(learning_rate),
            replay_buffer: ReplayBuffer::new(replay_capacity),
            frames_processed: 0,
            rating,
            last_episode_reward: 0.0,
        })
    }
}

impl<P> Agent<P> {
    /// Eligibility is derived from the frame count on every call
    pub fn is_eligible(&self, threshold: u64) -> bool {
        is_eligible(self.frames_processed, threshold)
    }
}

/// Population of agents training together
#[derive(Debug)]
pub struct Population<P> {
    agents: Vec<Agent<P>>,
}

impl<P: Policy> Population<P> {
    /// Create a population with fresh networks from `factory`
    ///
    /// The factory is called twice per agent (policy and target policy).
    /// Agent `i` gets policy learning rate `config.policy_learning_rate(i)`.
    pub fn new(config: &PbtConfig, mut factory: impl FnMut() -> P) -> Result<Self> {
        let agents = (0..config.population_size)
            .map(|index| {
                Agent::new(
                    AgentId(index),
                    factory(),
                    factory(),
                    config.policy_learning_rate(index),
                    config.replay_capacity,
                    config.initial_rating,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { agents })
    }
}

impl<P> Population<P> {
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Get agent by ID
    pub fn get(&self, id: AgentId) -> Option<&Agent<P>> {
        self.agents.get(id.index())
    }

    /// Get mutable agent by ID
    pub fn get_mut(&mut self, id: AgentId) -> Option<&mut Agent<P>> {
        self.agents.get_mut(id.index())
    }

    /// Mutable access to two distinct agents at once
    pub fn pair_mut(&mut self, a: AgentId, b: AgentId) -> Result<(&mut Agent<P>, &mut Agent<P>)> {
        let (i, j) = (a.index(), b.index());
        if i == j {
            return Err(anyhow!("cannot borrow {} twice", a));
        }
        if i.max(j) >= self.agents.len() {
            return Err(anyhow!("{} is outside a population of {}", AgentId(i.max(j)), self.len()));
        }

        if i < j {
            let (left, right) = self.agents.split_at_mut(j);
            Ok((&mut left[i], &mut right[0]))
        } else {
            let (left, right) = self.agents.split_at_mut(i);
            Ok((&mut right[0], &mut left[j]))
        }
    }

    /// Agent identifiers in population order
    pub fn ids(&self) -> impl Iterator<Item = AgentId> + '_ {
        self.agents.iter().map(|a| a.id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Agent<P>> {
        self.agents.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Agent<P>> {
        self.agents.iter_mut()
    }

    /// Ratings in population order
    pub fn ratings(&self) -> Vec<f64> {
        self.agents.iter().map(|a| a.rating).collect()
    }

    /// Frame counts in population order
    pub fn frame_counts(&self) -> Vec<u64> {
        self.agents.iter().map(|a| a.frames_processed).collect()
    }

    /// Eligibility flags in population order
    pub fn eligibility(&self, threshold: u64) -> Vec<bool> {
        self.agents.iter().map(|a| a.is_eligible(threshold)).collect()
    }

    /// Get population statistics
    pub fn stats(&self, eligibility_frames: u64) -> PopulationStats {
        let ratings = self.ratings();
        let rewards: Vec<f64> = self.agents.iter().map(|a| a.last_episode_reward).collect();
        let count = self.agents.len().max(1) as f64;

        PopulationStats {
            mean_rating: ratings.iter().sum::<f64>() / count,
            max_rating: ratings.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            min_rating: ratings.iter().cloned().fold(f64::INFINITY, f64::min),
            mean_reward: rewards.iter().sum::<f64>() / count,
            eligible: self.agents.iter().filter(|a| a.is_eligible(eligibility_frames)).count(),
        }
    }
}

/// Population statistics
#[derive(Debug, Clone, PartialEq)]
pub struct PopulationStats {
    pub mean_rating: f64,
    pub max_rating: f64,
    pub min_rating: f64,
    pub mean_reward: f64,
    pub eligible: usize,
}

#[cfg(test)]
mod tests {
    use tch::Device;

    use super::*;
    use crate::policy::{ConvPolicy, NetworkConfig};

    fn tiny_network() -> NetworkConfig {
        NetworkConfig { height: 8, width: 8, hidden_dim: 8, ..Default::default() }
    }

    fn create_test_population(size: usize) -> Population<ConvPolicy> {
        let config = PbtConfig::default().population_size(size).network(tiny_network());
        let network = config.network.clone();
        Population::new(&config, || ConvPolicy::new(&network, Device::Cpu)).unwrap()
    }

    #[test]
    fn test_population_creation() {
        let pop = create_test_population(4);

        assert_eq!(pop.len(), 4);
        let ids: Vec<usize> = pop.ids().map(AgentId::index).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert!(pop.iter().all(|a| a.rating == 1200.0 && a.frames_processed == 0));
    }

    #[test]
    fn test_learning_rate_by_index() {
        let pop = create_test_population(4);

        let rates: Vec<f64> = pop.iter().map(|a| a.optimizer.learning_rate()).collect();
        assert!((rates[0] - 2e-6).abs() < 1e-12);
        assert!((rates[3] - 5e-6).abs() < 1e-12);
    }

    #[test]
    fn test_target_starts_as_copy() {
        let pop = create_test_population(4);
        let agent = pop.get(AgentId(1)).unwrap();

        assert_eq!(agent.policy.weight_distance(&agent.target_policy), 0.0);
    }

    #[test]
    fn test_eligibility_is_derived() {
        let mut pop = create_test_population(4);
        let agent = pop.get_mut(AgentId(0)).unwrap();

        assert!(!agent.is_eligible(10));
        agent.frames_processed = 10;
        assert!(agent.is_eligible(10));
        agent.frames_processed = 0;
        assert!(!agent.is_eligible(10));
        assert_eq!(pop.eligibility(10), vec![false; 4]);
    }

    #[test]
    fn test_pair_mut() {
        let mut pop = create_test_population(4);

        let (a, b) = pop.pair_mut(AgentId(3), AgentId(1)).unwrap();
        assert_eq!((a.id, b.id), (AgentId(3), AgentId(1)));
        a.rating = 1000.0;
        b.rating = 1400.0;

        assert_eq!(pop.ratings(), vec![1200.0, 1400.0, 1200.0, 1000.0]);
        assert!(pop.pair_mut(AgentId(2), AgentId(2)).is_err());
        assert!(pop.pair_mut(AgentId(0), AgentId(4)).is_err());
    }

    #[test]
    fn test_population_stats() {
        let mut pop = create_test_population(4);
        for (i, agent) in pop.iter_mut().enumerate() {
            agent.rating = 1000.0 + 100.0 * i as f64;
            agent.last_episode_reward = i as f64;
            agent.frames_processed = 5 * i as u64;
        }

        let stats = pop.stats(10);
        assert_eq!(stats.mean_rating, 1150.0);
        assert_eq!(stats.max_rating, 1300.0);
        assert_eq!(stats.min_rating, 1000.0);
        assert_eq!(stats.mean_reward, 1.5);
        assert_eq!(stats.eligible, 2);
    }
}
