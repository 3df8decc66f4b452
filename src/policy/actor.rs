//! Convolutional driving policy
//!
//! A Gaussian policy over the raw action, squashed into the action space:
//! steering through `tanh` into `[-1, 1]`, gas and brake through a sigmoid
//! into `[0, 1]`. Sampling uses the reparameterization
//! `raw = mean + exp(log_std) * eps`, so the sampled action stays
//! differentiable with respect to the policy parameters.

use tch::{Device, Kind, Tensor, nn, nn::Init, nn::Module};

use super::{
    Network, Policy,
    encoder::{ConvEncoder, NetworkConfig},
};

const ACTION_DIM: i64 = 3;
const LOG_STD_MIN: f64 = -5.0;
const LOG_STD_MAX: f64 = 2.0;

/// Convolutional Gaussian policy for the three car controls
#[derive(Debug)]
pub struct ConvPolicy {
    vs: nn::VarStore,
    encoder: ConvEncoder,
    mean_head: nn::Linear,
    log_std: Tensor,
}

impl ConvPolicy {
    /// Create a freshly initialized policy on `device`
    pub fn new(config: &NetworkConfig, device: Device) -> Self {
        let vs = nn::VarStore::new(device);
        let root = vs.root();

        let encoder = ConvEncoder::new(&(&root / "encoder"), config);

        let mut output_config = nn::LinearConfig::default();
        output_config.ws_init = Init::Orthogonal { gain: 0.01 };
        let mean_head = nn::linear(&root / "mean", config.hidden_dim, ACTION_DIM, output_config);
        let log_std = root.var("log_std", &[ACTION_DIM], Init::Const(-0.5));

        Self { vs, encoder, mean_head, log_std }
    }

    fn mean(&self, observations: &Tensor) -> Tensor {
        self.encoder.forward(observations).apply(&self.mean_head)
    }
}

/// Map raw actions into `[-1, 1] x [0, 1] x [0, 1]`
fn squash(raw: &Tensor) -> Tensor {
    let steer = raw.narrow(1, 0, 1).tanh();
    let pedals = raw.narrow(1, 1, 2).sigmoid();
    Tensor::cat(&[steer, pedals], 1)
}

impl Network for ConvPolicy {
    fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    fn var_store_mut(&mut self) -> &mut nn::VarStore {
        &mut self.vs
    }
}

impl Policy for ConvPolicy {
    fn forward(&self, observations: &Tensor) -> Tensor {
        let mean = self.mean(observations);
        let std = self.log_std.clamp(LOG_STD_MIN, LOG_STD_MAX).exp();
        let eps = mean.randn_like();
        squash(&(&mean + eps * std))
    }

    fn act_deterministic(&self, observations: &Tensor) -> Tensor {
        squash(&self.mean(observations))
    }
}

impl ConvPolicy {
    /// Mean of `|a - b|` over all parameters, for comparing two policies
    pub fn weight_distance(&self, other: &Self) -> f64 {
        let theirs = other.vs.variables();
        let mut total = 0.0;
        let mut count = 0usize;
        for (name, tensor) in self.vs.variables() {
            if let Some(other_tensor) = theirs.get(&name) {
                let diff = (&tensor - other_tensor.to_device(tensor.device()))
                    .abs()
                    .sum(Kind::Double);
                total += f64::try_from(&diff).unwrap_or(f64::INFINITY);
                count += tensor.numel();
            }
        }
        if count == 0 { 0.0 } else { total / count as f64 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn tiny_config() -> NetworkConfig {
        NetworkConfig { height: 8, width: 8, hidden_dim: 16, ..Default::default() }
    }

    fn observations(batch: i64) -> Tensor {
        Tensor::rand([batch, 3, 8, 8], (Kind::Float, Device::Cpu))
    }

    #[test]
    fn test_forward_shape_and_ranges() {
        let policy = ConvPolicy::new(&tiny_config(), Device::Cpu);
        let actions = policy.forward(&observations(16));

        assert_eq!(actions.size(), vec![16, 3]);
        let values: Vec<f32> = Vec::try_from(actions.contiguous().view([-1])).unwrap();
        for chunk in values.chunks(3) {
            assert!((-1.0..=1.0).contains(&chunk[0]));
            assert!((0.0..=1.0).contains(&chunk[1]));
            assert!((0.0..=1.0).contains(&chunk[2]));
        }
    }

    #[test]
    fn test_forward_is_differentiable() {
        let policy = ConvPolicy::new(&tiny_config(), Device::Cpu);
        let actions = policy.forward(&observations(4));

        actions.sum(Kind::Float).backward();
        let grad = policy.log_std.grad();
        assert!(grad.defined());
    }

    #[test]
    fn test_deterministic_action_repeats() {
        let policy = ConvPolicy::new(&tiny_config(), Device::Cpu);
        let obs = observations(2);

        let a = policy.act_deterministic(&obs);
        let b = policy.act_deterministic(&obs);
        let diff = f64::try_from((a - b).abs().max()).unwrap();
        assert!(diff < 1e-7);
    }

    #[test]
    fn test_copy_weights_and_distance() {
        let source = ConvPolicy::new(&tiny_config(), Device::Cpu);
        let mut target = ConvPolicy::new(&tiny_config(), Device::Cpu);

        assert!(target.weight_distance(&source) > 0.0);
        target.copy_weights_from(&source).unwrap();
        assert_eq!(target.weight_distance(&source), 0.0);
    }

    #[test]
    fn test_for_each_parameter_visits_every_variable() {
        let mut policy = ConvPolicy::new(&tiny_config(), Device::Cpu);
        let expected = policy.var_store().variables().len();

        let mut names = Vec::new();
        policy.for_each_parameter(&mut |name, tensor| {
            names.push(name.to_string());
            let _ = tensor.fill_(0.0);
        });

        assert_eq!(names.len(), expected);
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);

        let total: f64 = policy
            .var_store()
            .variables()
            .values()
            .map(|t| f64::try_from(t.abs().sum(Kind::Double)).unwrap())
            .sum();
        assert_eq!(total, 0.0);
    }

    #[test]
    fn test_save_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("policy.safetensors");
        let policy = ConvPolicy::new(&tiny_config(), Device::Cpu);
        policy.save(&path).unwrap();

        let mut restored = ConvPolicy::new(&tiny_config(), Device::Cpu);
        restored.load(&path).unwrap();

        assert_eq!(restored.weight_distance(&policy), 0.0);
        assert!(policy.num_parameters() > 0);
    }
}
