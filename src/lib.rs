//! # PBT Racing
//!
//! Elo-driven population-based training for multi-car racing agents
//!
//! A population of convolutional policies races in groups on a shared
//! simulator. Every agent learns off-policy from its own replay buffer
//! against a critic shared by the whole population; after each generation
//! the group results update Elo ratings, and agents that fall behind a
//! random peer copy it and mutate.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pbt_racing::prelude::*;
//!
//! # fn main() -> anyhow::Result<()> {
//! let env = ScriptedTrack::new(ScriptedTrackConfig::default());
//! let mut trainer = PbtTrainer::new(PbtConfig::default(), env, "runs/scripted")?;
//! let options = RunOptions { mode: RunMode::Train, resume: false };
//! trainer.run(options, 100)?;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

/// Experience storage
pub mod buffer;

/// Atomic training checkpoints and best-model bookkeeping
pub mod checkpoint;

/// Environment traits and implementations
pub mod env;

/// Error types
pub mod error;

/// Population-based training
pub mod multi_agent;

/// Policy and critic networks
pub mod policy;

/// Scalar and frame telemetry sinks
pub mod telemetry;

/// Configuration, optimizer and the SVG(0) update
pub mod train;

/// Prelude module for convenient imports
///
/// This module re-exports commonly used types and traits for convenience.
pub mod prelude {
    pub use crate::{
        env::{Action, MultiCarEnvironment, ScriptedTrack, ScriptedTrackConfig},
        error::PbtError,
        multi_agent::{ControlMessage, PbtTrainer, RunContext, RunMode, RunOptions, RunSummary},
        policy::{ConvCritic, ConvPolicy, Critic, Network, NetworkConfig, Policy},
        telemetry::{JsonlSink, TelemetrySink, TracingSink},
        train::{DeviceChoice, PbtConfig},
    };
}

/// Current version of pbt-racing
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
