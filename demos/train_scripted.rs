//! Population-based training on the scripted track
//!
//! Drives the full train / resume / evaluate contract against the
//! deterministic `ScriptedTrack`, so the loop can be exercised without a
//! racing simulator.
//!
//! While running, type a line on stdin to control the run:
//! `p` toggles rendering, `q` stops after the current generation.
//!
//! # Usage
//!
//! ```bash
//! # Fresh training run
//! cargo run --example train_scripted --release -- --train --generations 50
//!
//! # Continue from the last checkpoint
//! cargo run --example train_scripted --release -- --train -c
//!
//! # Race random agents of the checkpoint, or best against second best
//! cargo run --example train_scripted --release -- --evaluate -c
//! cargo run --example train_scripted --release -- --evaluate
//! ```

use std::{
    io::{self, BufRead},
    path::PathBuf,
    thread,
};

use anyhow::Result;
use clap::Parser;
use crossbeam_channel::Sender;
use pbt_racing::{
    multi_agent::RunSummary,
    policy::NetworkConfig,
    prelude::*,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Train the population
    #[arg(long, conflicts_with = "evaluate")]
    train: bool,

    /// Evaluate without learning
    #[arg(long)]
    evaluate: bool,

    /// Resume from the checkpoint under the run directory
    #[arg(short = 'c', long = "resume")]
    resume: bool,

    /// Generations to train
    #[arg(long, default_value_t = 20)]
    generations: usize,

    /// Directory for checkpoints, best models and telemetry
    #[arg(long, default_value = "runs/scripted")]
    run_dir: PathBuf,

    /// JSON configuration; missing fields take their defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Steps per episode on the scripted track
    #[arg(long, default_value_t = 200)]
    episode_length: usize,

    /// Side length of the square observations
    #[arg(long, default_value_t = 32)]
    observation_size: usize,

    /// Start with rendering on
    #[arg(long)]
    preview: bool,
}

fn spawn_keyboard(sender: Sender<ControlMessage>) {
    thread::spawn(move || {
        let mut preview = false;
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            let message = match line.trim() {
                "p" => {
                    preview = !preview;
                    if preview { ControlMessage::PreviewOn } else { ControlMessage::PreviewOff }
                }
                "q" => ControlMessage::Shutdown,
                _ => continue,
            };
            if sender.send(message).is_err() {
                break;
            }
        }
    });
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();

    let size = args.observation_size;
    let saved = args.run_dir.join("config.json");
    let config = match &args.config {
        Some(path) => PbtConfig::from_json_file(path)?,
        // The networks of a stored run must be rebuilt with their original shape
        None if (args.resume || args.evaluate) && saved.is_file() => {
            PbtConfig::from_json_file(&saved)?
        }
        None => PbtConfig::default().network(NetworkConfig {
            height: size as i64,
            width: size as i64,
            ..Default::default()
        }),
    };

    let env = ScriptedTrack::new(ScriptedTrackConfig {
        num_agents: config.agents_per_game,
        episode_length: args.episode_length,
        height: config.network.height as usize,
        width: config.network.width as usize,
        ..Default::default()
    });

    let (sender, receiver) = crossbeam_channel::unbounded();
    spawn_keyboard(sender);
    let mut context = RunContext::with_controls(receiver);
    context.set_preview(args.preview);

    std::fs::create_dir_all(&args.run_dir)?;
    config.save_json(&saved)?;

    let mut trainer = PbtTrainer::new(config, env, &args.run_dir)?
        .with_telemetry(Box::new(JsonlSink::new(args.run_dir.join("telemetry"))?))
        .with_context(context);

    let mode = if args.evaluate { RunMode::Evaluate } else { RunMode::Train };
    if !args.train && !args.evaluate {
        tracing::info!("no mode given, training");
    }

    match trainer.run(RunOptions { mode, resume: args.resume }, args.generations)? {
        RunSummary::Trained(reports) => {
            if let Some(last) = reports.last() {
                tracing::info!(
                    generations = last.generation,
                    average_reward = last.average_reward,
                    mean_rating = last.stats.mean_rating,
                    best_reward = last.best.map(|b| b.reward),
                    "training finished"
                );
            }
        }
        RunSummary::Evaluated(report) => {
            tracing::info!(
                rewards = ?report.rewards,
                outcome = ?report.outcome,
                "evaluation finished"
            );
        }
    }

    Ok(())
}
