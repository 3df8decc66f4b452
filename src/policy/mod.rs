//! Policy and critic networks
//!
//! The training controller treats networks as opaque handles exposing a small
//! set of capabilities: forward passes, weight persistence, weight copying and
//! a visitor over every learnable parameter. The convolutional networks in
//! this module are the default implementations, built on tch-rs.

use std::path::Path;

use anyhow::Result;
use tch::{Device, Tensor, nn};

pub mod actor;
pub mod critic;
pub mod encoder;

pub use actor::ConvPolicy;
pub use critic::ConvCritic;
pub use encoder::{ConvEncoder, NetworkConfig};

/// Capabilities shared by every network handle
pub trait Network {
    /// Variable store holding the learnable parameters
    fn var_store(&self) -> &nn::VarStore;

    /// Mutable variable store (weight loading and copying)
    fn var_store_mut(&mut self) -> &mut nn::VarStore;

    /// Device the parameters live on
    fn device(&self) -> Device {
        self.var_store().device()
    }

    /// Visit every learnable parameter in name order
    ///
    /// The visitor runs without gradient tracking and may modify the
    /// parameter in place.
    fn for_each_parameter(&mut self, visitor: &mut dyn FnMut(&str, &mut Tensor)) {
        let mut variables: Vec<(String, Tensor)> =
            self.var_store().variables().into_iter().collect();
        variables.sort_by(|a, b| a.0.cmp(&b.0));

        tch::no_grad(|| {
            for (name, mut tensor) in variables {
                visitor(&name, &mut tensor);
            }
        });
    }

    /// Overwrite this network's weights with another network's weights
    fn copy_weights_from(&mut self, other: &Self) -> Result<()>
    where
        Self: Sized,
    {
        self.var_store_mut().copy(other.var_store())?;
        Ok(())
    }

    /// Total number of learnable scalars
    fn num_parameters(&self) -> i64 {
        self.var_store().trainable_variables().iter().map(|t| t.numel() as i64).sum()
    }

    /// Save weights (format chosen from the file extension)
    fn save(&self, path: &Path) -> Result<()> {
        self.var_store().save(path)?;
        Ok(())
    }

    /// Load weights saved by [`Network::save`]
    fn load(&mut self, path: &Path) -> Result<()> {
        self.var_store_mut().load(path)?;
        Ok(())
    }
}

/// Continuous-action policy
pub trait Policy: Network {
    /// Reparameterized action sample `[batch, 3]`, differentiable w.r.t. the
    /// policy parameters, already inside the action ranges
    fn forward(&self, observations: &Tensor) -> Tensor;

    /// Deterministic action `[batch, 3]` (used for evaluation)
    fn act_deterministic(&self, observations: &Tensor) -> Tensor;
}

/// State-action value estimator
pub trait Critic: Network {
    /// Value estimate `[batch]` for observations `[batch, C, H, W]` and
    /// actions `[batch, 3]`
    fn value(&self, observations: &Tensor, actions: &Tensor) -> Tensor;
}
