//! Convolutional state-action critic
//!
//! `Q(s, a)`: the encoded observation is concatenated with the action and
//! passed through a small dense head.

use tch::{Device, Tensor, nn, nn::Module};

use super::{
    Critic, Network,
    encoder::{ConvEncoder, NetworkConfig},
};

const ACTION_DIM: i64 = 3;

/// Shared critic network
#[derive(Debug)]
pub struct ConvCritic {
    vs: nn::VarStore,
    encoder: ConvEncoder,
    fc: nn::Linear,
    out: nn::Linear,
}

impl ConvCritic {
    /// Create a freshly initialized critic on `device`
    pub fn new(config: &NetworkConfig, device: Device) -> Self {
        let vs = nn::VarStore::new(device);
        let root = vs.root();

        let encoder = ConvEncoder::new(&(&root / "encoder"), config);
        let fc = nn::linear(
            &root / "fc",
            config.hidden_dim + ACTION_DIM,
            config.hidden_dim,
            Default::default(),
        );
        let out = nn::linear(&root / "out", config.hidden_dim, 1, Default::default());

        Self { vs, encoder, fc, out }
    }
}

impl Network for ConvCritic {
    fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    fn var_store_mut(&mut self) -> &mut nn::VarStore {
        &mut self.vs
    }
}

impl Critic for ConvCritic {
    fn value(&self, observations: &Tensor, actions: &Tensor) -> Tensor {
        let features = self.encoder.forward(observations);
        let actions =
            if actions.dim() == 1 { actions.unsqueeze(0) } else { actions.shallow_clone() };

        Tensor::cat(&[features, actions], 1)
            .apply(&self.fc)
            .relu()
            .apply(&self.out)
            .squeeze_dim(-1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Kind;

    #[test]
    fn test_value_shape() {
        let config = NetworkConfig { height: 8, width: 8, hidden_dim: 16, ..Default::default() };
        let critic = ConvCritic::new(&config, Device::Cpu);

        let obs = Tensor::rand([5, 3, 8, 8], (Kind::Float, Device::Cpu));
        let actions = Tensor::rand([5, 3], (Kind::Float, Device::Cpu));

        assert_eq!(critic.value(&obs, &actions).size(), vec![5]);
    }

    #[test]
    fn test_single_observation_value() {
        let config = NetworkConfig { height: 8, width: 8, hidden_dim: 16, ..Default::default() };
        let critic = ConvCritic::new(&config, Device::Cpu);

        let obs = Tensor::rand([3, 8, 8], (Kind::Float, Device::Cpu));
        let action = Tensor::from_slice(&[0.0_f32, 1.0, 0.0]);

        assert_eq!(critic.value(&obs, &action).size(), vec![1]);
    }
}
