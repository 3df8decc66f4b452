//! Environment traits and implementations
//!
//! The racing simulator is an external collaborator. This module defines the
//! interface the training loop drives it through, plus a scripted track used
//! for tests and demos.

use std::collections::HashMap;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use tch::{Device, Kind, Tensor};

pub mod scripted;

pub use scripted::{ScriptedTrack, ScriptedTrackConfig};

/// Multi-car racing environment
///
/// One instance simulates exactly `num_agents()` cars at a time and is not
/// re-entrant: a scheduled group must finish its episode before the next
/// group resets the environment.
pub trait MultiCarEnvironment {
    /// Number of cars simulated per episode
    fn num_agents(&self) -> usize;

    /// Reset the environment and return one observation per car
    ///
    /// Observations are `[channels, height, width]` float tensors.
    fn reset(&mut self) -> Result<Vec<Tensor>>;

    /// Step the environment
    ///
    /// `None` advances the simulator without applying actions.
    fn step(&mut self, actions: Option<&[Action]>) -> Result<StepResult>;

    /// Render one RGB frame per car
    fn render(&mut self) -> Result<Vec<Frame>>;
}

/// Result of a multi-car environment step
#[derive(Debug)]
pub struct StepResult {
    /// Next observation for each car
    pub observations: Vec<Tensor>,

    /// Reward for each car
    pub rewards: Vec<f32>,

    /// Whether the episode is over for the whole group
    pub done: bool,

    /// Additional information (shared across all cars)
    pub info: HashMap<String, String>,
}

impl StepResult {
    /// Create a step result with empty info
    pub fn new(observations: Vec<Tensor>, rewards: Vec<f32>, done: bool) -> Self {
        Self { observations, rewards, done, info: HashMap::new() }
    }
}

/// Continuous car control
///
/// Steering is in `[-1, 1]`, gas and brake in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub steer: f32,
    pub gas: f32,
    pub brake: f32,
}

impl Action {
    /// Number of action components
    pub const DIM: usize = 3;

    /// Create an action, clamping every component into its range
    pub fn new(steer: f32, gas: f32, brake: f32) -> Self {
        Self { steer, gas, brake }.clamped()
    }

    /// Clamp components into the action space
    pub fn clamped(self) -> Self {
        Self {
            steer: self.steer.clamp(-1.0, 1.0),
            gas: self.gas.clamp(0.0, 1.0),
            brake: self.brake.clamp(0.0, 1.0),
        }
    }

    pub fn to_array(self) -> [f32; 3] {
        [self.steer, self.gas, self.brake]
    }

    /// Build a clamped action from `[steer, gas, brake]`
    pub fn from_slice(values: &[f32]) -> Result<Self> {
        match values {
            [steer, gas, brake] => Ok(Self::new(*steer, *gas, *brake)),
            _ => Err(anyhow!("action needs {} components, got {}", Self::DIM, values.len())),
        }
    }

    /// Build a clamped action from a policy output of shape `[3]` or `[1, 3]`
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let flat = tensor.to_device(Device::Cpu).to_kind(Kind::Float).contiguous().view([-1]);
        let values = Vec::<f32>::try_from(flat)?;
        Self::from_slice(&values)
    }
}

/// A rendered RGB frame
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub width: usize,
    pub height: usize,

    /// Row-major RGB bytes, `width * height * 3` long
    pub rgb: Vec<u8>,
}

impl Frame {
    pub fn new(width: usize, height: usize, rgb: Vec<u8>) -> Result<Self> {
        if rgb.len() != width * height * 3 {
            return Err(anyhow!(
                "frame of {}x{} needs {} bytes, got {}",
                width,
                height,
                width * height * 3,
                rgb.len()
            ));
        }
        Ok(Self { width, height, rgb })
    }
}
