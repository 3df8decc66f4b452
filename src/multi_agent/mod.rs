//! Population-based training of competing racing agents
//!
//! This module provides the components that train a population of policies
//! against each other with a shared critic.
//!
//! # Architecture
//!
//! The multi-agent system consists of:
//! - **Population**: agents with their policy, target policy, optimizer,
//!   replay buffer, frame count and Elo rating
//! - **CriticManager**: the critic shared by the whole population
//! - **MatchScheduler**: partitions the population into groups and plays
//!   one episode per group
//! - **RatingSystem**: team Elo updates from episode rewards
//! - **EvolutionEngine**: exploit (copy a stronger peer) and explore (mutate)
//! - **PbtTrainer**: the generation loop tying it together with checkpoints
//!
//! # Example
//!
//! ```rust,no_run
//! use pbt_racing::env::{ScriptedTrack, ScriptedTrackConfig};
//! use pbt_racing::multi_agent::PbtTrainer;
//! use pbt_racing::train::PbtConfig;
//!
//! # fn main() -> anyhow::Result<()> {
//! let env = ScriptedTrack::new(ScriptedTrackConfig::default());
//! let mut trainer = PbtTrainer::new(PbtConfig::default(), env, "runs/scripted")?;
//! trainer.train(10)?;
//! # Ok(())
//! # }
//! ```

pub mod critic;
pub mod evolution;
pub mod matchmaking;
pub mod messages;
pub mod population;
pub mod rating;
pub mod scheduler;
pub mod trainer;

pub use critic::CriticManager;
pub use evolution::{EvolutionEngine, mutate, selo};
pub use matchmaking::{Matchmaker, RandomPartitionMatchmaker};
pub use messages::{ControlMessage, ExploitEvent, Transition, UpdateStats};
pub use population::{Agent, AgentId, Population, PopulationStats, is_eligible};
pub use rating::{MatchResult, RatingSystem, TeamOutcome, expected_score};
pub use scheduler::{EpisodeOutcome, MatchScheduler, RunContext};
pub use trainer::{
    EvaluationReport, EvaluationSource, GenerationReport, PbtTrainer, RunMode, RunOptions,
    RunSummary,
};
