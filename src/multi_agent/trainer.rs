//! Population-based training loop
//!
//! One generation runs, in order:
//!
//! ```text
//! schedule groups -> one episode per group (buffers, updates)
//!   -> best-model bookkeeping -> Elo updates -> exploit/explore
//!   -> checkpoint -> fill countdown
//! ```
//!
//! After a restore, updates stay disabled for `fill_generations`
//! generations so the empty replay buffers refill first.

use std::path::Path;

use anyhow::{Result, anyhow};
use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};
use tch::Device;

use super::{
    critic::CriticManager,
    evolution::EvolutionEngine,
    matchmaking::RandomPartitionMatchmaker,
    messages::{ExploitEvent, UpdateStats},
    population::{AgentId, Population, PopulationStats},
    rating::{RatingSystem, TeamOutcome},
    scheduler::{EpisodeOutcome, MatchScheduler, RunContext, SlotFrames},
};
use crate::{
    checkpoint::{BestEntry, BestModels, CheckpointManager, Manifest},
    env::MultiCarEnvironment,
    error::PbtError,
    policy::{ConvCritic, ConvPolicy, Network},
    telemetry::{
        EVAL_AVERAGE_REWARD, TRAIN_AVERAGE_REWARD, TRAIN_CRITIC_LOSS, TRAIN_EXPLOITS,
        TRAIN_POLICY_LOSS, TelemetrySink, TracingSink,
    },
    train::{PbtConfig, Svg0Updater},
};

/// Directory below the run root holding the best policies
pub const BEST_MODELS_DIR: &str = "best_models";

/// What a run does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Train,
    Evaluate,
}

/// Run selection, mirroring the command-line contract
///
/// | mode     | resume | behaviour                                          |
/// |----------|--------|----------------------------------------------------|
/// | Train    | no     | fresh population, updates from the first step      |
/// | Train    | yes    | restore checkpoint, fill warm-up, keep counting    |
/// | Evaluate | yes    | restore checkpoint, race random agents             |
/// | Evaluate | no     | race best against second best                      |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    pub mode: RunMode,
    pub resume: bool,
}

/// Summary of one generation
#[derive(Debug, Clone)]
pub struct GenerationReport {
    /// Generations completed, including this one
    pub generation: usize,
    pub updates_enabled: bool,
    pub episodes: Vec<EpisodeOutcome>,
    pub team_outcomes: Vec<TeamOutcome>,
    pub exploits: Vec<ExploitEvent>,
    pub average_reward: f64,
    pub losses: Option<UpdateStats>,
    pub stats: PopulationStats,
    pub best: Option<BestEntry>,
    pub second: Option<BestEntry>,
}

/// Where evaluated policies came from
#[derive(Debug, Clone, PartialEq)]
pub enum EvaluationSource {
    /// Randomly chosen agents of the restored population, by car slot
    Checkpoint(Vec<AgentId>),
    /// Best policy on even slots, second best on odd slots
    BestModels { best: BestEntry, second: BestEntry },
}

/// Summary of one evaluation episode
#[derive(Debug, Clone)]
pub struct EvaluationReport {
    pub source: EvaluationSource,
    /// Episode reward per car slot
    pub rewards: Vec<f64>,
    pub outcome: TeamOutcome,
    /// Frames recorded per car slot
    pub frames_per_slot: Vec<usize>,
}

/// Result of [`PbtTrainer::run`]
#[derive(Debug, Clone)]
pub enum RunSummary {
    Trained(Vec<GenerationReport>),
    Evaluated(EvaluationReport),
}

/// Population-based trainer driving one environment
pub struct PbtTrainer<E> {
    config: PbtConfig,
    device: Device,
    env: E,
    population: Population<ConvPolicy>,
    critics: CriticManager<ConvCritic>,
    scheduler: MatchScheduler<RandomPartitionMatchmaker>,
    updater: Svg0Updater,
    ratings: RatingSystem,
    evolution: EvolutionEngine,
    checkpoints: CheckpointManager,
    best: BestModels,
    telemetry: Box<dyn TelemetrySink>,
    context: RunContext,
    generation: usize,
    fill_remaining: usize,
    rng: StdRng,
}

impl<E: MultiCarEnvironment> PbtTrainer<E> {
    /// Create a trainer with a fresh population
    ///
    /// Checkpoints and best models are stored below `root`.
    pub fn new(config: PbtConfig, env: E, root: impl AsRef<Path>) -> Result<Self> {
        config.validate()?;
        if env.num_agents() != config.agents_per_game {
            return Err(PbtError::InvalidConfig(format!(
                "environment simulates {} cars, agents_per_game is {}",
                env.num_agents(),
                config.agents_per_game
            ))
            .into());
        }

        let device = config.device.resolve();
        if let Some(seed) = config.seed {
            tch::manual_seed(seed as i64);
        }

        let network = config.network.clone();
        let population = Population::new(&config, || ConvPolicy::new(&network, device))?;
        let critics = CriticManager::new(
            ConvCritic::new(&network, device),
            ConvCritic::new(&network, device),
            config.critic_learning_rate,
        )?;

        let matchmaker = match config.seed {
            Some(seed) => RandomPartitionMatchmaker::seeded(seed),
            None => RandomPartitionMatchmaker::new(),
        };
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(3)),
            None => StdRng::from_entropy(),
        };
        let root = root.as_ref();

        tracing::info!(
            population = config.population_size,
            agents_per_game = config.agents_per_game,
            ?device,
            parameters = population.iter().next().map(|a| a.policy.num_parameters()).unwrap_or(0),
            "created population"
        );

        Ok(Self {
            scheduler: MatchScheduler::new(matchmaker, config.agents_per_game),
            updater: Svg0Updater::new(
                config.gamma,
                config.tau,
                config.batch_size,
                config.seed.map(|s| s.wrapping_add(1)),
            ),
            ratings: RatingSystem::new(config.k_factor),
            evolution: EvolutionEngine::new(&config),
            checkpoints: CheckpointManager::new(root),
            best: BestModels::new(root.join(BEST_MODELS_DIR)),
            telemetry: Box::new(TracingSink),
            context: RunContext::new(),
            generation: 0,
            fill_remaining: 0,
            config,
            device,
            env,
            population,
            critics,
            rng,
        })
    }

    /// Replace the telemetry sink
    pub fn with_telemetry(mut self, telemetry: Box<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Replace the run context (render toggle, control channel)
    pub fn with_context(mut self, context: RunContext) -> Self {
        self.context = context;
        self
    }

    pub fn config(&self) -> &PbtConfig {
        &self.config
    }

    pub fn population(&self) -> &Population<ConvPolicy> {
        &self.population
    }

    pub fn population_mut(&mut self) -> &mut Population<ConvPolicy> {
        &mut self.population
    }

    pub fn critics(&self) -> &CriticManager<ConvCritic> {
        &self.critics
    }

    pub fn best_models(&self) -> &BestModels {
        &self.best
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    pub fn context_mut(&mut self) -> &mut RunContext {
        &mut self.context
    }

    pub fn env(&self) -> &E {
        &self.env
    }

    /// Generations completed, including those before a restore
    pub fn generation(&self) -> usize {
        self.generation
    }

    /// Generations left in the post-restore warm-up
    pub fn fill_remaining(&self) -> usize {
        self.fill_remaining
    }

    pub fn updates_enabled(&self) -> bool {
        self.fill_remaining == 0
    }

    /// Restore the latest checkpoint and enter the fill warm-up
    pub fn resume(&mut self) -> Result<Manifest> {
        let manifest = self.checkpoints.load(
            &mut self.population,
            &mut self.critics,
            self.config.eligibility_frames,
        )?;
        self.generation = manifest.generation;
        self.fill_remaining = self.config.fill_generations;
        self.best = BestModels::open(self.checkpoints.root().join(BEST_MODELS_DIR))?;

        tracing::info!(
            generation = self.generation,
            fill_generations = self.fill_remaining,
            "resumed from checkpoint"
        );
        Ok(manifest)
    }

    /// Run one full generation and checkpoint it
    pub fn run_generation(&mut self) -> Result<GenerationReport> {
        let updates_enabled = self.updates_enabled();
        let groups = self.scheduler.schedule(self.population.len())?;
        tracing::info!(generation = self.generation + 1, updates_enabled, "starting generation");

        let mut episodes = Vec::with_capacity(groups.len());
        for group in &groups {
            let updater = if updates_enabled { Some(&mut self.updater) } else { None };
            let outcome = self.scheduler.play_training_episode(
                &mut self.env,
                &mut self.population,
                group,
                &mut self.critics,
                updater,
                &mut self.context,
            )?;
            episodes.push(outcome);
        }

        for agent in self.population.iter() {
            self.best.observe(agent.id, agent.last_episode_reward, &agent.policy)?;
        }

        let mut team_outcomes = Vec::with_capacity(episodes.len());
        for episode in &episodes {
            let outcome =
                self.ratings.rate_group(&mut self.population, &episode.group, &episode.rewards)?;
            team_outcomes.push(outcome);
        }

        let exploits = self.evolution.evolve(&mut self.population)?;

        self.generation += 1;
        self.checkpoints.save(
            self.generation,
            &self.population,
            &self.critics,
            self.config.eligibility_frames,
        )?;
        if self.fill_remaining > 0 {
            self.fill_remaining -= 1;
        }

        let report = self.report(updates_enabled, episodes, team_outcomes, exploits);
        self.telemetry.scalar(TRAIN_AVERAGE_REWARD, report.average_reward, report.generation);
        self.telemetry.scalar(TRAIN_EXPLOITS, report.exploits.len() as f64, report.generation);
        if let Some(losses) = report.losses {
            self.telemetry.scalar(TRAIN_CRITIC_LOSS, losses.critic_loss, report.generation);
            self.telemetry.scalar(TRAIN_POLICY_LOSS, losses.policy_loss, report.generation);
        }

        tracing::info!(
            generation = report.generation,
            average_reward = report.average_reward,
            exploits = report.exploits.len(),
            mean_rating = report.stats.mean_rating,
            eligible = report.stats.eligible,
            best_reward = report.best.map(|b| b.reward),
            second_reward = report.second.map(|b| b.reward),
            "generation complete"
        );
        Ok(report)
    }

    fn report(
        &self,
        updates_enabled: bool,
        episodes: Vec<EpisodeOutcome>,
        team_outcomes: Vec<TeamOutcome>,
        exploits: Vec<ExploitEvent>,
    ) -> GenerationReport {
        let rewards: Vec<f64> = episodes.iter().flat_map(|e| e.rewards.iter().copied()).collect();
        let average_reward = if rewards.is_empty() {
            0.0
        } else {
            rewards.iter().sum::<f64>() / rewards.len() as f64
        };

        let updates: usize = episodes.iter().map(|e| e.updates).sum();
        let losses = (updates > 0).then(|| {
            let weighted = |f: fn(&UpdateStats) -> f64| -> f64 {
                episodes
                    .iter()
                    .filter_map(|e| e.mean_losses().map(|l| f(&l) * e.updates as f64))
                    .sum::<f64>()
                    / updates as f64
            };
            UpdateStats {
                critic_loss: weighted(|l| l.critic_loss),
                policy_loss: weighted(|l| l.policy_loss),
            }
        });

        GenerationReport {
            generation: self.generation,
            updates_enabled,
            episodes,
            team_outcomes,
            exploits,
            average_reward,
            losses,
            stats: self.population.stats(self.config.eligibility_frames),
            best: self.best.best(),
            second: self.best.second(),
        }
    }

    /// Run up to `generations` generations
    ///
    /// A shutdown request stops the loop after the running generation's
    /// checkpoint was written.
    pub fn train(&mut self, generations: usize) -> Result<Vec<GenerationReport>> {
        let mut reports = Vec::with_capacity(generations);
        for _ in 0..generations {
            self.context.poll_controls();
            if self.context.shutdown_requested() {
                break;
            }

            reports.push(self.run_generation()?);

            if self.context.shutdown_requested() {
                tracing::info!(generation = self.generation, "shutdown requested, stopping");
                break;
            }
        }
        Ok(reports)
    }

    /// Race randomly chosen agents of the current population without learning
    pub fn evaluate_checkpoint(&mut self) -> Result<EvaluationReport> {
        let ids: Vec<AgentId> = self.population.ids().collect();
        let chosen: Vec<AgentId> =
            ids.choose_multiple(&mut self.rng, self.config.agents_per_game).copied().collect();

        let policies = chosen
            .iter()
            .map(|&id| {
                self.population.get(id).map(|a| &a.policy).ok_or_else(|| anyhow!("unknown {id}"))
            })
            .collect::<Result<Vec<_>>>()?;
        tracing::info!(agents = ?chosen, "evaluating checkpoint agents");

        let (rewards, frames) = self.scheduler.play_evaluation_episode(
            &mut self.env,
            &policies,
            true,
            &mut self.context,
        )?;
        Ok(self.finish_evaluation(EvaluationSource::Checkpoint(chosen), rewards, frames))
    }

    /// Race the best policy (even slots) against the second best (odd slots)
    pub fn evaluate_best(&mut self) -> Result<EvaluationReport> {
        let record = BestModels::open(self.checkpoints.root().join(BEST_MODELS_DIR))?;
        let (Some(best_entry), Some(second_entry)) = (record.best(), record.second()) else {
            return Err(PbtError::CheckpointMissing { path: record.dir().to_path_buf() }.into());
        };
        for path in [record.best_path(), record.second_path()] {
            if !path.is_file() {
                return Err(PbtError::CheckpointMissing { path }.into());
            }
        }

        let mut best = ConvPolicy::new(&self.config.network, self.device);
        best.load(&record.best_path())?;
        let mut second = ConvPolicy::new(&self.config.network, self.device);
        second.load(&record.second_path())?;

        let policies: Vec<&ConvPolicy> = (0..self.config.agents_per_game)
            .map(|slot| if slot % 2 == 0 { &best } else { &second })
            .collect();
        tracing::info!(
            best = best_entry.reward,
            second = second_entry.reward,
            "evaluating best models"
        );

        let (rewards, frames) = self.scheduler.play_evaluation_episode(
            &mut self.env,
            &policies,
            true,
            &mut self.context,
        )?;
        let source = EvaluationSource::BestModels { best: best_entry, second: second_entry };
        Ok(self.finish_evaluation(source, rewards, frames))
    }

    fn finish_evaluation(
        &mut self,
        source: EvaluationSource,
        rewards: Vec<f64>,
        frames: SlotFrames,
    ) -> EvaluationReport {
        let outcome = TeamOutcome::classify(&rewards);
        let average = rewards.iter().sum::<f64>() / rewards.len().max(1) as f64;

        self.telemetry.scalar(EVAL_AVERAGE_REWARD, average, self.generation);
        for (slot, slot_frames) in frames.iter().enumerate() {
            self.telemetry.frames(slot, self.generation, slot_frames);
        }

        match outcome {
            TeamOutcome::Team1Wins => tracing::info!(?rewards, "team 1 won"),
            TeamOutcome::Team2Wins => tracing::info!(?rewards, "team 2 won"),
            TeamOutcome::Draw => tracing::info!(?rewards, "draw"),
        }

        EvaluationReport {
            source,
            rewards,
            outcome,
            frames_per_slot: frames.iter().map(Vec::len).collect(),
        }
    }

    /// Execute a run as selected by `options`
    ///
    /// `generations` bounds training runs and is ignored when evaluating.
    pub fn run(&mut self, options: RunOptions, generations: usize) -> Result<RunSummary> {
        match (options.mode, options.resume) {
            (RunMode::Train, resume) => {
                if resume {
                    self.resume()?;
                }
                Ok(RunSummary::Trained(self.train(generations)?))
            }
            (RunMode::Evaluate, true) => {
                self.resume()?;
                Ok(RunSummary::Evaluated(self.evaluate_checkpoint()?))
            }
            (RunMode::Evaluate, false) => Ok(RunSummary::Evaluated(self.evaluate_best()?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::{
        env::{ScriptedTrack, ScriptedTrackConfig},
        multi_agent::ControlMessage,
        policy::NetworkConfig,
        train::DeviceChoice,
    };

    fn config() -> PbtConfig {
        PbtConfig::default()
            .population_size(8)
            .batch_size(4)
            .replay_capacity(32)
            .eligibility_frames(1_000)
            .device(DeviceChoice::Cpu)
            .seed(9)
            .network(NetworkConfig { height: 8, width: 8, hidden_dim: 8, ..Default::default() })
    }

    fn track() -> ScriptedTrack {
        ScriptedTrack::new(ScriptedTrackConfig {
            episode_length: 4,
            height: 8,
            width: 8,
            ..Default::default()
        })
    }

    #[test]
    fn test_rejects_environment_size_mismatch() {
        let dir = tempdir().unwrap();
        let env = ScriptedTrack::new(ScriptedTrackConfig {
            num_agents: 2,
            height: 8,
            width: 8,
            ..Default::default()
        });

        let err = PbtTrainer::new(config(), env, dir.path()).err().unwrap();
        assert!(matches!(err.downcast_ref::<PbtError>(), Some(PbtError::InvalidConfig(_))));
    }

    #[test]
    fn test_generation_counts_and_checkpoints() {
        let dir = tempdir().unwrap();
        let mut trainer = PbtTrainer::new(config(), track(), dir.path()).unwrap();

        let report = trainer.run_generation().unwrap();

        assert_eq!(report.generation, 1);
        assert!(report.updates_enabled);
        assert_eq!(report.episodes.len(), 2);
        assert!(trainer.population().iter().all(|a| a.frames_processed == 4));
        assert!(trainer.checkpoints().exists());
        assert!(report.best.is_some() && report.second.is_some());
        // four steps with a batch of four: one update per car on the last step
        assert_eq!(report.episodes.iter().map(|e| e.updates).sum::<usize>(), 8);
    }

    #[test]
    fn test_ratings_stay_zero_sum() {
        let dir = tempdir().unwrap();
        let mut trainer = PbtTrainer::new(config(), track(), dir.path()).unwrap();

        trainer.train(2).unwrap();

        let total: f64 = trainer.population().ratings().iter().sum();
        assert!((total - 8.0 * 1200.0).abs() < 1e-6);
    }

    /// Scripted track that sends control messages from inside `step`
    struct SignallingTrack {
        inner: ScriptedTrack,
        sender: crossbeam_channel::Sender<ControlMessage>,
        signals: Vec<(usize, ControlMessage)>,
        steps: usize,
        renders: usize,
    }

    impl MultiCarEnvironment for SignallingTrack {
        fn num_agents(&self) -> usize {
            self.inner.num_agents()
        }

        fn reset(&mut self) -> Result<Vec<tch::Tensor>> {
            self.inner.reset()
        }

        fn step(
            &mut self,
            actions: Option<&[crate::env::Action]>,
        ) -> Result<crate::env::StepResult> {
            if actions.is_some() {
                self.steps += 1;
                for (at, message) in &self.signals {
                    if *at == self.steps {
                        self.sender.send(*message)?;
                    }
                }
            }
            self.inner.step(actions)
        }

        fn render(&mut self) -> Result<Vec<crate::env::Frame>> {
            self.renders += 1;
            self.inner.render()
        }
    }

    fn signalling(signals: Vec<(usize, ControlMessage)>) -> (SignallingTrack, RunContext) {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let env = SignallingTrack { inner: track(), sender, signals, steps: 0, renders: 0 };
        (env, RunContext::with_controls(receiver))
    }

    #[test]
    fn test_shutdown_before_start_runs_nothing() {
        let dir = tempdir().unwrap();
        let (sender, receiver) = crossbeam_channel::unbounded();
        let mut trainer = PbtTrainer::new(config(), track(), dir.path())
            .unwrap()
            .with_context(RunContext::with_controls(receiver));

        sender.send(ControlMessage::Shutdown).unwrap();
        let reports = trainer.train(5).unwrap();

        assert!(reports.is_empty());
        assert_eq!(trainer.generation(), 0);
        assert!(!trainer.checkpoints().exists());
    }

    #[test]
    fn test_shutdown_mid_generation_finishes_and_checkpoints() {
        let dir = tempdir().unwrap();
        let (env, context) = signalling(vec![(2, ControlMessage::Shutdown)]);
        let mut trainer = PbtTrainer::new(config(), env, dir.path()).unwrap().with_context(context);

        let reports = trainer.train(5).unwrap();

        assert_eq!(reports.len(), 1);
        assert_eq!(trainer.generation(), 1);
        assert_eq!(reports[0].episodes.len(), 2);
        assert!(reports[0].episodes.iter().all(|e| e.steps == 4));
        assert!(trainer.checkpoints().exists());
    }

    #[test]
    fn test_preview_renders_training_steps() {
        let dir = tempdir().unwrap();
        let (env, context) = signalling(vec![
            (1, ControlMessage::PreviewOn),
            (6, ControlMessage::PreviewOff),
        ]);
        let mut trainer = PbtTrainer::new(config(), env, dir.path()).unwrap().with_context(context);

        trainer.run_generation().unwrap();

        // Messages are applied before the next step: steps 2 to 6 render
        assert_eq!(trainer.env().renders, 5);
        assert!(!trainer.context_mut().preview());
    }

    #[test]
    fn test_evaluate_best_requires_models() {
        let dir = tempdir().unwrap();
        let mut trainer = PbtTrainer::new(config(), track(), dir.path()).unwrap();

        let err = trainer.evaluate_best().unwrap_err();
        assert!(matches!(err.downcast_ref::<PbtError>(), Some(PbtError::CheckpointMissing { .. })));
    }
}
