//! Exploit/explore between generations
//!
//! Each eligible agent is compared with one uniformly chosen peer. When the
//! peer is eligible too and the agent's expected score against it falls below
//! `tselect`, the agent copies the peer's policy, optimizer state and target
//! policy, restarts its frame count, and perturbs the copied policy. The peer
//! is never modified and ratings are left alone.

use anyhow::Result;
use rand::{Rng, SeedableRng, rngs::StdRng};

use super::{
    messages::ExploitEvent,
    population::{AgentId, Population, is_eligible},
    rating::expected_score,
};
use crate::{policy::Policy, train::PbtConfig};

/// Agent's expected score against its peer, compared with `tselect`
pub fn selo(agent_rating: f64, peer_rating: f64) -> f64 {
    expected_score(agent_rating, peer_rating)
}

/// Add `N(0, scale^2)` noise to each element with probability `rate`
pub fn mutate<P: Policy>(policy: &mut P, rate: f64, scale: f64) {
    if rate <= 0.0 || scale <= 0.0 {
        return;
    }
    policy.for_each_parameter(&mut |_, param| {
        let mask = param.rand_like().lt(rate).to_kind(param.kind());
        let noise = param.randn_like() * scale * mask;
        *param += noise;
    });
}

/// EvolutionEngine
#[derive(Debug)]
pub struct EvolutionEngine {
    tselect: f64,
    mutation_rate: f64,
    mutation_scale: f64,
    eligibility_frames: u64,
    rng: StdRng,
}

impl EvolutionEngine {
    pub fn new(config: &PbtConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(2)),
            None => StdRng::from_entropy(),
        };
        Self {
            tselect: config.tselect,
            mutation_rate: config.mutation_rate,
            mutation_scale: config.mutation_scale,
            eligibility_frames: config.eligibility_frames,
            rng,
        }
    }

    /// Uniformly random agent other than `agent`
    fn pick_peer(&mut self, agent: usize, population_size: usize) -> usize {
        let draw = self.rng.gen_range(0..population_size - 1);
        if draw >= agent { draw + 1 } else { draw }
    }

    /// Run one exploit/explore pass over the population, in population order
    pub fn evolve<P: Policy>(
        &mut self,
        population: &mut Population<P>,
    ) -> Result<Vec<ExploitEvent>> {
        let size = population.len();
        let mut events = Vec::new();
        if size < 2 {
            return Ok(events);
        }

        for index in 0..size {
            let agent_id = AgentId(index);
            let (frames, rating) = match population.get(agent_id) {
                Some(agent) => (agent.frames_processed, agent.rating),
                None => continue,
            };
            if !is_eligible(frames, self.eligibility_frames) {
                continue;
            }

            let peer_id = AgentId(self.pick_peer(index, size));
            let (peer_frames, peer_rating) = match population.get(peer_id) {
                Some(peer) => (peer.frames_processed, peer.rating),
                None => continue,
            };
            if !is_eligible(peer_frames, self.eligibility_frames) {
                continue;
            }

            let score = selo(rating, peer_rating);
            if score < self.tselect {
                self.exploit(population, agent_id, peer_id)?;
                tracing::info!(
                    agent = %agent_id,
                    source = %peer_id,
                    selo = score,
                    "agent mutated copying peer"
                );
                events.push(ExploitEvent { agent: agent_id, source: peer_id, selo: score });
            }
        }

        Ok(events)
    }

    /// Copy `source` into `agent`, then perturb the copied policy
    pub fn exploit<P: Policy>(
        &mut self,
        population: &mut Population<P>,
        agent: AgentId,
        source: AgentId,
    ) -> Result<()> {
        let (agent, source) = population.pair_mut(agent, source)?;

        agent.policy.copy_weights_from(&source.policy)?;
        agent.optimizer.copy_from(&source.optimizer);
        agent.target_policy.copy_weights_from(&source.target_policy)?;
        agent.frames_processed = 0;

        // Noise comes from the libtorch generator, seeded once by the trainer
        mutate(&mut agent.policy, self.mutation_rate, self.mutation_scale);
        Ok(())
    }
}
