//! Stochastic Value Gradient SVG(0) update
//!
//! One off-policy actor-critic step for a single agent against the shared
//! critic pair.
//!
//! # Algorithm Overview
//!
//! ```text
//! sample B transitions (s, a, r, s') from the agent's buffer, with replacement
//! y      = r + gamma * Q'(s', pi'(s'))          target critic, target policy
//! L_Q    = mean (Q(s, a) - y)^2                 updates the shared critic
//! L_pi   = -mean Q(s, pi(s)),  pi(s) = f(mu + sigma * eps)
//! theta' = tau * theta + (1 - tau) * theta'     target policy and target critic
//! ```
//!
//! Transitions carry no terminal flag, so targets always bootstrap.
//!
//! # References
//!
//! - [Learning Continuous Control Policies by Stochastic Value Gradients][svg]
//!
//! [svg]: https://arxiv.org/abs/1510.09142

use anyhow::{Result, anyhow};
use rand::{SeedableRng, rngs::StdRng};
use tch::{Device, Kind, Reduction, Tensor, nn};

use crate::{
    multi_agent::{Agent, CriticManager, Transition, UpdateStats},
    policy::{Critic, Network, Policy},
};

/// Blend `online` into `target`: `target = tau * online + (1 - tau) * target`
pub fn soft_update(target: &mut nn::VarStore, online: &nn::VarStore, tau: f64) -> Result<()> {
    let online_variables = online.variables();

    tch::no_grad(|| {
        for (name, mut target_tensor) in target.variables() {
            let online_tensor = online_variables
                .get(&name)
                .ok_or_else(|| anyhow!("variable {name} missing from online network"))?;
            let blended = online_tensor * tau + &target_tensor * (1.0 - tau);
            target_tensor.copy_(&blended);
        }
        Ok(())
    })
}

/// Sampled transitions stacked into device tensors
struct Batch {
    states: Tensor,
    actions: Tensor,
    rewards: Tensor,
    next_states: Tensor,
}

impl Batch {
    fn stack(transitions: &[&Transition], device: Device) -> Self {
        let states: Vec<&Tensor> = transitions.iter().map(|t| &t.state).collect();
        let next_states: Vec<&Tensor> = transitions.iter().map(|t| &t.next_state).collect();
        let actions: Vec<f32> = transitions.iter().flat_map(|t| t.action.to_array()).collect();
        let rewards: Vec<f32> = transitions.iter().map(|t| t.reward).collect();

        Self {
            states: Tensor::stack(&states, 0).to_kind(Kind::Float).to_device(device),
            actions: Tensor::from_slice(&actions).view([-1, 3]).to_device(device),
            rewards: Tensor::from_slice(&rewards).to_device(device),
            next_states: Tensor::stack(&next_states, 0).to_kind(Kind::Float).to_device(device),
        }
    }
}

/// UpdateEngine: runs SVG(0) steps for one agent at a time
#[derive(Debug)]
pub struct Svg0Updater {
    gamma: f64,
    tau: f64,
    batch_size: usize,
    rng: StdRng,
}

impl Svg0Updater {
    /// Create an updater; `seed` makes batch sampling reproducible
    pub fn new(gamma: f64, tau: f64, batch_size: usize, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { gamma, tau, batch_size, rng }
    }

    /// Run one update step for `agent`
    ///
    /// Returns `Ok(None)` without touching any network while the agent's
    /// buffer holds fewer than `batch_size` transitions.
    pub fn update<P: Policy, C: Critic>(
        &mut self,
        agent: &mut Agent<P>,
        critics: &mut CriticManager<C>,
    ) -> Result<Option<UpdateStats>> {
        let device = critics.device();
        let batch = match agent.replay_buffer.sample(self.batch_size, &mut self.rng) {
            Some(sampled) => Batch::stack(&sampled, device),
            None => return Ok(None),
        };

        let targets = tch::no_grad(|| {
            let next_actions = agent.target_policy.forward(&batch.next_states);
            let next_values = critics.target_critic.value(&batch.next_states, &next_actions);
            &batch.rewards + next_values * self.gamma
        });

        // Critic
        let predicted = critics.critic.value(&batch.states, &batch.actions);
        let critic_loss = predicted.mse_loss(&targets, Reduction::Mean);
        critics.optimizer.backward_step(critics.critic.var_store(), &critic_loss);

        // Policy, through the reparameterized action sample
        let actions = agent.policy.forward(&batch.states);
        let policy_loss = -critics.critic.value(&batch.states, &actions).mean(Kind::Float);
        agent.optimizer.backward_step(agent.policy.var_store(), &policy_loss);
        critics.optimizer.zero_grad(critics.critic.var_store());

        soft_update(agent.target_policy.var_store_mut(), agent.policy.var_store(), self.tau)?;
        soft_update(critics.target_critic.var_store_mut(), critics.critic.var_store(), self.tau)?;

        let stats = UpdateStats {
            critic_loss: f64::try_from(&critic_loss)?,
            policy_loss: f64::try_from(&policy_loss)?,
        };
        tracing::debug!(
            agent = %agent.id,
            critic_loss = stats.critic_loss,
            policy_loss = stats.policy_loss,
            "svg0 update"
        );
        Ok(Some(stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        env::Action,
        multi_agent::AgentId,
        policy::{ConvCritic, ConvPolicy, NetworkConfig},
    };

    fn tiny_network() -> NetworkConfig {
        NetworkConfig { height: 8, width: 8, hidden_dim: 8, ..Default::default() }
    }

    fn setup(capacity: usize) -> (Agent<ConvPolicy>, CriticManager<ConvCritic>) {
        let network = tiny_network();
        let agent = Agent::new(
            AgentId(0),
            ConvPolicy::new(&network, Device::Cpu),
            ConvPolicy::new(&network, Device::Cpu),
            1e-3,
            capacity,
            1200.0,
        )
        .unwrap();
        let critics = CriticManager::new(
            ConvCritic::new(&network, Device::Cpu),
            ConvCritic::new(&network, Device::Cpu),
            1e-3,
        )
        .unwrap();
        (agent, critics)
    }

    fn fill(agent: &mut Agent<ConvPolicy>, count: usize) {
        for i in 0..count {
            let state = Tensor::rand([3, 8, 8], (Kind::Float, Device::Cpu));
            let next_state = Tensor::rand([3, 8, 8], (Kind::Float, Device::Cpu));
            let action = Action::new(0.0, 1.0, 0.0);
            agent.replay_buffer.push(Transition::new(state, action, i as f32 * 0.1, next_state));
        }
    }

    #[test]
    fn test_underflow_is_noop() {
        let (mut agent, mut critics) = setup(16);
        fill(&mut agent, 3);
        let before = agent.policy.var_store().variables()["mean.weight"].copy();

        let mut updater = Svg0Updater::new(0.99, 0.005, 4, Some(0));
        let stats = updater.update(&mut agent, &mut critics).unwrap();

        assert!(stats.is_none());
        assert_eq!(agent.optimizer.steps(), 0);
        let after = &agent.policy.var_store().variables()["mean.weight"];
        assert!(before.equal(after));
    }

    #[test]
    fn test_update_changes_networks() {
        let (mut agent, mut critics) = setup(16);
        fill(&mut agent, 8);
        let critic_before = critics.critic.var_store().variables()["out.weight"].copy();
        let target_before = agent.target_policy.var_store().variables()["mean.weight"].copy();

        let mut updater = Svg0Updater::new(0.99, 0.5, 4, Some(0));
        let stats = updater.update(&mut agent, &mut critics).unwrap().unwrap();

        assert!(stats.critic_loss.is_finite());
        assert!(stats.policy_loss.is_finite());
        assert_eq!(agent.optimizer.steps(), 1);
        assert_eq!(critics.optimizer.steps(), 1);

        let critic_after = &critics.critic.var_store().variables()["out.weight"];
        assert!(!critic_before.equal(critic_after));
        let target_after = &agent.target_policy.var_store().variables()["mean.weight"];
        assert!(!target_before.equal(target_after));
    }

    #[test]
    fn test_critic_grads_cleared_after_update() {
        let (mut agent, mut critics) = setup(16);
        fill(&mut agent, 8);

        let mut updater = Svg0Updater::new(0.99, 0.005, 4, Some(1));
        updater.update(&mut agent, &mut critics).unwrap();

        for tensor in critics.critic.var_store().trainable_variables() {
            let grad = tensor.grad();
            if grad.defined() {
                assert_eq!(f64::try_from(grad.abs().sum(Kind::Double)).unwrap(), 0.0);
            }
        }
    }

    #[test]
    fn test_soft_update_blends() {
        let online = nn::VarStore::new(Device::Cpu);
        let x = online.root().var("x", &[2], nn::Init::Const(1.0));
        let mut target = nn::VarStore::new(Device::Cpu);
        let y = target.root().var("x", &[2], nn::Init::Const(0.0));

        soft_update(&mut target, &online, 0.25).unwrap();
        assert_eq!(Vec::<f32>::try_from(&y).unwrap(), vec![0.25, 0.25]);

        soft_update(&mut target, &online, 1.0).unwrap();
        assert!(y.equal(&x));
    }

    #[test]
    fn test_soft_update_rejects_mismatched_stores() {
        let online = nn::VarStore::new(Device::Cpu);
        online.root().var("a", &[1], nn::Init::Const(1.0));
        let mut target = nn::VarStore::new(Device::Cpu);
        target.root().var("b", &[1], nn::Init::Const(0.0));

        assert!(soft_update(&mut target, &online, 0.5).is_err());
    }
}
