//! Checkpoint, resume and evaluation tests
//!
//! A run is trained for a couple of generations, then a second trainer with
//! freshly initialized networks restores it from disk.

use std::fs;

use pbt_racing::{
    env::{ScriptedTrack, ScriptedTrackConfig},
    error::PbtError,
    multi_agent::{AgentId, EvaluationSource, PbtTrainer, RunMode, RunOptions, RunSummary},
    policy::NetworkConfig,
    train::{DeviceChoice, PbtConfig},
};
use tempfile::{TempDir, tempdir};

const EPISODE_LENGTH: usize = 4;

fn tiny_config() -> PbtConfig {
    PbtConfig::default()
        .population_size(8)
        .batch_size(4)
        .replay_capacity(64)
        .eligibility_frames(1_000)
        .fill_generations(2)
        .device(DeviceChoice::Cpu)
        .seed(23)
        .network(NetworkConfig { height: 8, width: 8, hidden_dim: 8, ..Default::default() })
}

fn track() -> ScriptedTrack {
    ScriptedTrack::new(ScriptedTrackConfig {
        episode_length: EPISODE_LENGTH,
        height: 8,
        width: 8,
        ..Default::default()
    })
}

fn trained_run(generations: usize) -> (TempDir, PbtTrainer<ScriptedTrack>) {
    let dir = tempdir().unwrap();
    let mut trainer = PbtTrainer::new(tiny_config(), track(), dir.path()).unwrap();
    trainer.train(generations).unwrap();
    (dir, trainer)
}

fn fresh(dir: &TempDir) -> PbtTrainer<ScriptedTrack> {
    let config = PbtConfig { seed: Some(99), ..tiny_config() };
    PbtTrainer::new(config, track(), dir.path()).unwrap()
}

#[test]
fn test_resume_restores_population() {
    let (dir, original) = trained_run(2);
    let mut restored = fresh(&dir);

    let manifest = restored.resume().unwrap();

    assert_eq!(manifest.generation, 2);
    assert_eq!(restored.generation(), 2);
    assert_eq!(restored.population().ratings(), original.population().ratings());
    assert_eq!(restored.population().frame_counts(), original.population().frame_counts());
    for (a, b) in restored.population().iter().zip(original.population().iter()) {
        assert_eq!(a.policy.weight_distance(&b.policy), 0.0);
        assert_eq!(a.target_policy.weight_distance(&b.target_policy), 0.0);
        assert_eq!(a.optimizer.steps(), b.optimizer.steps());
        assert_eq!(a.optimizer.learning_rate(), b.optimizer.learning_rate());
        assert!(a.replay_buffer.is_empty());
    }
    assert_eq!(restored.best_models().best(), original.best_models().best());
}

#[test]
fn test_fill_period_disables_updates() {
    let (dir, _) = trained_run(1);
    let mut restored = fresh(&dir);
    restored.resume().unwrap();
    assert_eq!(restored.fill_remaining(), 2);

    let reports = restored.train(3).unwrap();

    let enabled: Vec<bool> = reports.iter().map(|r| r.updates_enabled).collect();
    assert_eq!(enabled, vec![false, false, true]);
    assert!(reports[..2].iter().all(|r| r.episodes.iter().all(|e| e.updates == 0)));
    assert!(reports[2].episodes.iter().map(|e| e.updates).sum::<usize>() > 0);
    assert_eq!(restored.generation(), 4);
}

#[test]
fn test_resume_without_checkpoint_fails() {
    let dir = tempdir().unwrap();
    let mut trainer = PbtTrainer::new(tiny_config(), track(), dir.path()).unwrap();

    let err = trainer.resume().unwrap_err();

    assert!(matches!(err.downcast_ref::<PbtError>(), Some(PbtError::CheckpointMissing { .. })));
}

#[test]
fn test_corrupted_ratings_are_rejected() {
    let (dir, _) = trained_run(1);
    fs::write(dir.path().join("checkpoint").join("ratings.json"), "[1200.0, 1200.0]").unwrap();
    let mut restored = fresh(&dir);
    let before = restored.population().ratings();

    let err = restored.resume().unwrap_err();

    assert!(matches!(err.downcast_ref::<PbtError>(), Some(PbtError::CheckpointCorruption { .. })));
    assert_eq!(restored.population().ratings(), before);
    assert_eq!(restored.generation(), 0);
}

#[test]
fn test_interrupted_swap_falls_back_to_previous() {
    let (dir, original) = trained_run(1);
    fs::rename(dir.path().join("checkpoint"), dir.path().join("checkpoint.previous")).unwrap();
    let mut restored = fresh(&dir);

    let manifest = restored.resume().unwrap();

    assert_eq!(manifest.generation, 1);
    assert_eq!(restored.population().ratings(), original.population().ratings());
}

#[test]
fn test_evaluate_checkpoint_leaves_population_untouched() {
    let (dir, original) = trained_run(1);
    let mut evaluator = fresh(&dir);

    let summary = evaluator.run(RunOptions { mode: RunMode::Evaluate, resume: true }, 0).unwrap();

    let RunSummary::Evaluated(report) = summary else {
        panic!("expected an evaluation summary");
    };
    let EvaluationSource::Checkpoint(mut agents) = report.source.clone() else {
        panic!("expected checkpoint agents");
    };
    assert_eq!(agents.len(), 4);
    agents.sort();
    agents.dedup();
    assert_eq!(agents.len(), 4);
    assert!(agents.iter().all(|&AgentId(i)| i < 8));

    assert_eq!(report.rewards.len(), 4);
    assert_eq!(report.frames_per_slot, vec![EPISODE_LENGTH; 4]);
    assert_eq!(evaluator.population().ratings(), original.population().ratings());
    assert_eq!(evaluator.population().frame_counts(), original.population().frame_counts());
    assert!(evaluator.population().iter().all(|a| a.replay_buffer.is_empty()));
}

#[test]
fn test_evaluate_best_models() {
    let (dir, original) = trained_run(2);
    let mut evaluator = fresh(&dir);

    let summary = evaluator.run(RunOptions { mode: RunMode::Evaluate, resume: false }, 0).unwrap();

    let RunSummary::Evaluated(report) = summary else {
        panic!("expected an evaluation summary");
    };
    let EvaluationSource::BestModels { best, second } = report.source else {
        panic!("expected best models");
    };
    assert_eq!(Some(best), original.best_models().best());
    assert_eq!(Some(second), original.best_models().second());
    assert_eq!(report.rewards.len(), 4);
    assert_eq!(evaluator.generation(), 0);
}

#[test]
fn test_resume_survives_missing_best_policy() {
    let (dir, _) = trained_run(1);
    fs::remove_file(dir.path().join("best_models").join("best_policy_0.safetensors")).unwrap();
    let mut restored = fresh(&dir);

    restored.resume().unwrap();
    let reports = restored.train(2).unwrap();

    assert_eq!(reports.len(), 2);
    assert!(restored.best_models().best().is_some());
    assert!(restored.best_models().best_path().is_file());
}

#[test]
fn test_resume_survives_truncated_best_record() {
    let (dir, _) = trained_run(1);
    let record_path = dir.path().join("best_models").join("best_rewards.json");
    fs::write(&record_path, "{\"best\": {\"rew").unwrap();
    let mut restored = fresh(&dir);

    restored.resume().unwrap();
    restored.train(1).unwrap();

    let record = fs::read_to_string(&record_path).unwrap();
    assert!(serde_json::from_str::<serde_json::Value>(&record).is_ok());
    assert!(restored.best_models().best().is_some());
}
