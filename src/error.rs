//! Error taxonomy for population training
//!
//! Library functions return `anyhow::Result`; the variants below are the
//! domain failures a caller may want to tell apart via `downcast_ref`.

use std::path::PathBuf;

use thiserror::Error;

/// Domain errors raised by the training controller
#[derive(Debug, Error)]
pub enum PbtError {
    /// The environment collaborator failed to reset, step or render
    #[error("environment failure during {stage}: {source}")]
    Environment {
        stage: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// Persisted checkpoint state is missing pieces or inconsistent
    #[error("corrupt checkpoint at {}: {reason}", path.display())]
    CheckpointCorruption { path: PathBuf, reason: String },

    /// No checkpoint directory could be found
    #[error("no checkpoint found at {}", path.display())]
    CheckpointMissing { path: PathBuf },

    /// Configuration rejected by validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Environment returned data that does not match the scheduled group
    #[error("{what}: expected {expected}, got {actual}")]
    ShapeMismatch { what: &'static str, expected: usize, actual: usize },
}

impl PbtError {
    /// Wrap an environment error with the stage it happened in
    pub fn environment(stage: &'static str, source: anyhow::Error) -> Self {
        Self::Environment { stage, source }
    }

    /// Build a corruption error for a checkpoint file
    pub fn corruption(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CheckpointCorruption { path: path.into(), reason: reason.into() }
    }
}
