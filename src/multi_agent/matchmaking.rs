//! Matchmaking for population generations
//!
//! Determines which agents race together in each episode of a generation.

use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};

use super::population::AgentId;

/// Trait for matchmaking strategies
pub trait Matchmaker: Send {
    /// Create the groups for the next generation
    ///
    /// # Arguments
    ///
    /// * `population_size` - Number of agents in the population
    /// * `agents_per_game` - Number of agents in each group
    ///
    /// # Returns
    ///
    /// Vector of groups, where each group is a vector of agent IDs in the
    /// order of the environment's car slots
    fn create_matches(
        &mut self,
        population_size: usize,
        agents_per_game: usize,
    ) -> Vec<Vec<AgentId>>;
}

/// Random partition matchmaking
///
/// Shuffles the whole population and cuts it into consecutive groups, which is
/// the same as repeatedly drawing `agents_per_game` agents without replacement
/// from the agents not yet assigned. Every agent lands in exactly one group and
/// group composition is independent between generations.
#[derive(Debug)]
pub struct RandomPartitionMatchmaker {
    rng: StdRng,
}

impl RandomPartitionMatchmaker {
    pub fn new() -> Self {
        Self { rng: StdRng::from_entropy() }
    }

    /// Reproducible partitions
    pub fn seeded(seed: u64) -> Self {
        Self { rng: StdRng::seed_from_u64(seed) }
    }
}

impl Default for RandomPartitionMatchmaker {
    fn default() -> Self {
        Self::new()
    }
}

impl Matchmaker for RandomPartitionMatchmaker {
    fn create_matches(
        &mut self,
        population_size: usize,
        agents_per_game: usize,
    ) -> Vec<Vec<AgentId>> {
        if agents_per_game == 0 {
            return Vec::new();
        }

        let mut order: Vec<AgentId> = (0..population_size).map(AgentId).collect();
        order.shuffle(&mut self.rng);

        order.chunks(agents_per_game).map(|group| group.to_vec()).collect()
    }
}
