//! Message types for the population training loop
//!
//! Defines the data flowing between components:
//! - MatchScheduler → ReplayBuffer: transitions
//! - UpdateEngine → trainer: update statistics
//! - EvolutionEngine → trainer: exploit events
//! - outside world → MatchScheduler: control messages (render toggle, shutdown)

use tch::Tensor;

pub use crate::env::Action;

use super::population::AgentId;

/// One recorded step of a single car
///
/// Observations are kept on the CPU as `[channels, height, width]` tensors and
/// moved to the training device when a batch is assembled.
#[derive(Debug)]
pub struct Transition {
    /// Observation before the step
    pub state: Tensor,

    /// Clamped action the agent took
    pub action: Action,

    /// Reward received for the step
    pub reward: f32,

    /// Observation after the step
    pub next_state: Tensor,
}

impl Transition {
    /// Create a new transition
    pub fn new(state: Tensor, action: Action, reward: f32, next_state: Tensor) -> Self {
        Self { state, action, reward, next_state }
    }
}

/// Losses from one off-policy update step
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UpdateStats {
    /// Mean-squared error of the shared critic against the bootstrap target
    pub critic_loss: f64,

    /// Negated mean critic value of the policy's own actions
    pub policy_loss: f64,
}

/// Record of one exploit: `agent` copied `source` and was then mutated
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExploitEvent {
    pub agent: AgentId,
    pub source: AgentId,

    /// Agent's expected score against `source` when the decision was made
    pub selo: f64,
}

/// Control message for a running training loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// Render the environment on every training step
    PreviewOn,

    /// Stop rendering during training
    PreviewOff,

    /// Stop training after the current generation is checkpointed
    Shutdown,
}
