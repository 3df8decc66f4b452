//! Convolutional observation encoder
//!
//! Shared feature extractor for the policy and critic networks.
//!
//! # Architecture
//!
//! ```text
//! Input [batch, C, H, W]
//!         |
//!   [Conv 5x5, stride 2] -> ReLU
//!         |
//!   [Conv 3x3, stride 2] -> ReLU
//!         |
//!   [AdaptiveAvgPool 4x4]
//!         |
//!   [Dense(hidden)] -> ReLU
//! ```
//!
//! The adaptive pooling keeps the dense layer size independent of the image
//! resolution, so tests can run on tiny observations.

use serde::{Deserialize, Serialize};
use tch::{Tensor, nn, nn::Module};

const POOLED_SIDE: i64 = 4;
const CONV2_CHANNELS: i64 = 32;

/// Network architecture configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Observation channels
    pub channels: i64,
    pub height: i64,
    pub width: i64,

    /// Width of the dense feature layer
    pub hidden_dim: i64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self { channels: 3, height: 96, width: 96, hidden_dim: 64 }
    }
}

/// Convolutional feature extractor
#[derive(Debug)]
pub struct ConvEncoder {
    conv1: nn::Conv2D,
    conv2: nn::Conv2D,
    fc: nn::Linear,
}

impl ConvEncoder {
    /// Create the encoder under `vs`
    pub fn new(vs: &nn::Path, config: &NetworkConfig) -> Self {
        let conv1 = nn::conv2d(
            vs / "conv1",
            config.channels,
            16,
            5,
            nn::ConvConfig { stride: 2, padding: 2, ..Default::default() },
        );
        let conv2 = nn::conv2d(
            vs / "conv2",
            16,
            CONV2_CHANNELS,
            3,
            nn::ConvConfig { stride: 2, padding: 1, ..Default::default() },
        );
        let flat_size = CONV2_CHANNELS * POOLED_SIDE * POOLED_SIDE;
        let fc = nn::linear(vs / "fc", flat_size, config.hidden_dim, Default::default());

        Self { conv1, conv2, fc }
    }
}

impl Module for ConvEncoder {
    fn forward(&self, observations: &Tensor) -> Tensor {
        let x = batched(observations)
            .apply(&self.conv1)
            .relu()
            .apply(&self.conv2)
            .relu()
            .adaptive_avg_pool2d([POOLED_SIDE, POOLED_SIDE]);

        let batch_size = x.size()[0];
        x.view([batch_size, -1]).apply(&self.fc).relu()
    }
}

/// Add a batch dimension to a single `[C, H, W]` observation
pub fn batched(observations: &Tensor) -> Tensor {
    if observations.dim() == 3 {
        observations.unsqueeze(0)
    } else {
        observations.shallow_clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    #[test]
    fn test_feature_shape_independent_of_resolution() {
        let vs = nn::VarStore::new(Device::Cpu);
        let config = NetworkConfig { height: 8, width: 8, hidden_dim: 16, ..Default::default() };
        let encoder = ConvEncoder::new(&vs.root(), &config);

        let small = Tensor::rand([2, 3, 8, 8], (Kind::Float, Device::Cpu));
        let large = Tensor::rand([2, 3, 32, 32], (Kind::Float, Device::Cpu));

        assert_eq!(encoder.forward(&small).size(), vec![2, 16]);
        assert_eq!(encoder.forward(&large).size(), vec![2, 16]);
    }

    #[test]
    fn test_single_observation_is_batched() {
        let obs = Tensor::zeros([3, 8, 8], (Kind::Float, Device::Cpu));
        assert_eq!(batched(&obs).size(), vec![1, 3, 8, 8]);
    }
}
