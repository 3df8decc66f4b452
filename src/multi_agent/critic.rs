//! Shared critic
//!
//! One critic and one target critic serve the whole population. They are
//! owned here and lent to each agent's update, never copied per agent.

use anyhow::Result;

use crate::{policy::Critic, train::Adam};

/// Owner of the shared critic pair and its optimizer
#[derive(Debug)]
pub struct CriticManager<C> {
    pub critic: C,
    pub target_critic: C,
    pub optimizer: Adam,
}

impl<C: Critic> CriticManager<C> {
    /// Create the pair; the target starts as a copy of `critic`
    pub fn new(critic: C, mut target_critic: C, learning_rate: f64) -> Result<Self> {
        target_critic.copy_weights_from(&critic)?;
        Ok(Self { critic, target_critic, optimizer: Adam::new(learning_rate) })
    }

    pub fn device(&self) -> tch::Device {
        self.critic.device()
    }
}
