//! Match scheduling and episode execution
//!
//! A generation partitions the population into disjoint groups and runs one
//! full episode per group, strictly one group after another. Training
//! episodes record every car's transitions into its own replay buffer and,
//! when updates are enabled, run one update per transition.

use anyhow::{Result, anyhow};
use crossbeam_channel::{Receiver, TryRecvError};
use tch::Tensor;

use super::{
    critic::CriticManager,
    matchmaking::Matchmaker,
    messages::{ControlMessage, Transition, UpdateStats},
    population::{AgentId, Population},
};
use crate::{
    env::{Action, Frame, MultiCarEnvironment},
    error::PbtError,
    policy::{Critic, Network, Policy, encoder::batched},
    train::Svg0Updater,
};

/// Explicit run state handed to the scheduler
///
/// Holds the render toggle and an optional control channel. Messages are
/// drained once per environment step.
#[derive(Debug, Default)]
pub struct RunContext {
    preview: bool,
    shutdown_requested: bool,
    controls: Option<Receiver<ControlMessage>>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context driven by messages from `receiver`
    pub fn with_controls(receiver: Receiver<ControlMessage>) -> Self {
        Self { controls: Some(receiver), ..Self::default() }
    }

    pub fn preview(&self) -> bool {
        self.preview
    }

    pub fn set_preview(&mut self, preview: bool) {
        self.preview = preview;
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    /// Apply every pending control message
    pub fn poll_controls(&mut self) {
        let Some(receiver) = &self.controls else {
            return;
        };

        loop {
            match receiver.try_recv() {
                Ok(message) => {
                    tracing::debug!(?message, "control message");
                    match message {
                        ControlMessage::PreviewOn => self.preview = true,
                        ControlMessage::PreviewOff => self.preview = false,
                        ControlMessage::Shutdown => self.shutdown_requested = true,
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.controls = None;
                    break;
                }
            }
        }
    }
}

/// Result of one group's episode
#[derive(Debug, Clone, Default)]
pub struct EpisodeOutcome {
    /// Agents by car slot
    pub group: Vec<AgentId>,

    /// Cumulative reward per car slot
    pub rewards: Vec<f64>,

    /// Environment steps taken
    pub steps: usize,

    /// Update steps that ran (zero while updates are disabled or buffers fill)
    pub updates: usize,

    critic_loss_sum: f64,
    policy_loss_sum: f64,
}

impl EpisodeOutcome {
    fn record_update(&mut self, stats: UpdateStats) {
        self.updates += 1;
        self.critic_loss_sum += stats.critic_loss;
        self.policy_loss_sum += stats.policy_loss;
    }

    pub fn average_reward(&self) -> f64 {
        if self.rewards.is_empty() {
            return 0.0;
        }
        self.rewards.iter().sum::<f64>() / self.rewards.len() as f64
    }

    /// Mean losses over the episode's updates
    pub fn mean_losses(&self) -> Option<UpdateStats> {
        (self.updates > 0).then(|| UpdateStats {
            critic_loss: self.critic_loss_sum / self.updates as f64,
            policy_loss: self.policy_loss_sum / self.updates as f64,
        })
    }
}

/// Rendered frames of an evaluation episode, one sequence per car slot
pub type SlotFrames = Vec<Vec<Frame>>;

fn check_len(what: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(PbtError::ShapeMismatch { what, expected, actual }.into());
    }
    Ok(())
}

/// Sample one action per car from the given policies
fn select_actions<P: Policy>(
    policies: &[&P],
    observations: &[Tensor],
    deterministic: bool,
) -> Result<Vec<Action>> {
    policies
        .iter()
        .zip(observations)
        .map(|(policy, observation)| {
            let input = batched(observation).to_device(policy.device());
            let output = tch::no_grad(|| {
                if deterministic {
                    policy.act_deterministic(&input)
                } else {
                    policy.forward(&input)
                }
            });
            Action::from_tensor(&output)
        })
        .collect()
}

/// Warm-up step, reset and shape check shared by training and evaluation
fn start_episode<E: MultiCarEnvironment>(env: &mut E, cars: usize) -> Result<Vec<Tensor>> {
    env.step(None).map_err(|e| PbtError::environment("warm-up step", e))?;
    let observations = env.reset().map_err(|e| PbtError::environment("reset", e))?;
    check_len("observations", cars, observations.len())?;
    Ok(observations)
}

/// MatchScheduler
#[derive(Debug)]
pub struct MatchScheduler<M> {
    matchmaker: M,
    agents_per_game: usize,
}

impl<M: Matchmaker> MatchScheduler<M> {
    pub fn new(matchmaker: M, agents_per_game: usize) -> Self {
        Self { matchmaker, agents_per_game }
    }

    /// Groups for the next generation
    ///
    /// Fails unless every agent appears in exactly one full group.
    pub fn schedule(&mut self, population_size: usize) -> Result<Vec<Vec<AgentId>>> {
        let groups = self.matchmaker.create_matches(population_size, self.agents_per_game);

        let mut seen = vec![false; population_size];
        for group in &groups {
            check_len("group size", self.agents_per_game, group.len())?;
            for id in group {
                match seen.get_mut(id.index()) {
                    Some(slot) if !*slot => *slot = true,
                    Some(_) => return Err(anyhow!("{id} scheduled twice in one generation")),
                    None => return Err(anyhow!("{id} is not in the population")),
                }
            }
        }
        if let Some(missing) = seen.iter().position(|s| !s) {
            return Err(anyhow!("{} was not scheduled", AgentId(missing)));
        }

        Ok(groups)
    }

    /// Run one training episode for `group`
    ///
    /// Each step stores one transition per car in the acting agent's buffer,
    /// counts the frame, and runs one update when `updater` is given.
    pub fn play_training_episode<E, P, C>(
        &self,
        env: &mut E,
        population: &mut Population<P>,
        group: &[AgentId],
        critics: &mut CriticManager<C>,
        mut updater: Option<&mut Svg0Updater>,
        context: &mut RunContext,
    ) -> Result<EpisodeOutcome>
    where
        E: MultiCarEnvironment,
        P: Policy,
        C: Critic,
    {
        check_len("group size", env.num_agents(), group.len())?;
        tracing::debug!(?group, "starting training episode");

        let mut outcome = EpisodeOutcome {
            group: group.to_vec(),
            rewards: vec![0.0; group.len()],
            ..Default::default()
        };
        let mut observations = start_episode(env, group.len())?;

        loop {
            context.poll_controls();

            let actions = {
                let policies = group
                    .iter()
                    .map(|&id| {
                        population.get(id).map(|a| &a.policy).ok_or_else(|| anyhow!("unknown {id}"))
                    })
                    .collect::<Result<Vec<_>>>()?;
                select_actions(&policies, &observations, false)?
            };

            let step = env.step(Some(&actions)).map_err(|e| PbtError::environment("step", e))?;
            check_len("rewards", group.len(), step.rewards.len())?;
            check_len("observations", group.len(), step.observations.len())?;

            if context.preview() {
                env.render().map_err(|e| PbtError::environment("render", e))?;
            }

            for (slot, &id) in group.iter().enumerate() {
                let reward = step.rewards[slot];
                outcome.rewards[slot] += f64::from(reward);

                let agent = population.get_mut(id).ok_or_else(|| anyhow!("unknown {id}"))?;
                agent.replay_buffer.push(Transition::new(
                    observations[slot].shallow_clone(),
                    actions[slot],
                    reward,
                    step.observations[slot].shallow_clone(),
                ));
                agent.frames_processed += 1;

                if let Some(updater) = updater.as_deref_mut() {
                    if let Some(stats) = updater.update(agent, critics)? {
                        outcome.record_update(stats);
                    }
                }
            }

            observations = step.observations;
            outcome.steps += 1;
            if step.done {
                break;
            }
        }

        for (slot, &id) in group.iter().enumerate() {
            if let Some(agent) = population.get_mut(id) {
                agent.last_episode_reward = outcome.rewards[slot];
            }
        }

        tracing::debug!(
            ?group,
            steps = outcome.steps,
            updates = outcome.updates,
            average_reward = outcome.average_reward(),
            "finished training episode"
        );
        Ok(outcome)
    }

    /// Run one episode without learning
    ///
    /// Nothing is recorded into buffers. When `record` is set (or preview is
    /// on) the environment is rendered after every step and the frames are
    /// returned per car slot.
    pub fn play_evaluation_episode<E, P>(
        &self,
        env: &mut E,
        policies: &[&P],
        record: bool,
        context: &mut RunContext,
    ) -> Result<(Vec<f64>, SlotFrames)>
    where
        E: MultiCarEnvironment,
        P: Policy,
    {
        check_len("group size", env.num_agents(), policies.len())?;

        let mut rewards = vec![0.0; policies.len()];
        let mut frames: SlotFrames = vec![Vec::new(); policies.len()];
        let mut observations = start_episode(env, policies.len())?;

        loop {
            context.poll_controls();

            let actions = select_actions(policies, &observations, true)?;
            let step = env.step(Some(&actions)).map_err(|e| PbtError::environment("step", e))?;
            check_len("rewards", policies.len(), step.rewards.len())?;
            check_len("observations", policies.len(), step.observations.len())?;

            if record || context.preview() {
                let rendered = env.render().map_err(|e| PbtError::environment("render", e))?;
                check_len("frames", policies.len(), rendered.len())?;
                if record {
                    for (slot, frame) in rendered.into_iter().enumerate() {
                        frames[slot].push(frame);
                    }
                }
            }

            for (total, reward) in rewards.iter_mut().zip(&step.rewards) {
                *total += f64::from(*reward);
            }

            observations = step.observations;
            if step.done {
                break;
            }
        }

        Ok((rewards, frames))
    }
}
