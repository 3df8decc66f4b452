//! Adam optimizer with inspectable state
//!
//! `tch::nn::Optimizer` keeps its moment estimates inside libtorch and offers
//! no way to read, copy or persist them. Exploit copies a peer's optimizer
//! state verbatim and checkpoints must restore it, so the moments live here
//! as named tensors instead.
//!
//! The learning rate is part of the state: an agent that copies a peer's
//! optimizer also inherits the peer's learning rate.

use std::{collections::BTreeMap, path::Path};

use anyhow::{Result, anyhow};
use tch::{Device, Kind, Tensor, nn};

const META_KEY: &str = "__meta";
const EXP_AVG_PREFIX: &str = "exp_avg/";
const EXP_AVG_SQ_PREFIX: &str = "exp_avg_sq/";

/// Adam optimizer state for one variable store
#[derive(Debug)]
pub struct Adam {
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    step: i64,
    exp_avg: BTreeMap<String, Tensor>,
    exp_avg_sq: BTreeMap<String, Tensor>,
}

impl Adam {
    /// Create an optimizer with the usual Adam betas
    pub fn new(learning_rate: f64) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            step: 0,
            exp_avg: BTreeMap::new(),
            exp_avg_sq: BTreeMap::new(),
        }
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    /// Number of optimizer steps taken
    pub fn steps(&self) -> i64 {
        self.step
    }

    /// Reset gradients of every trainable variable in `vs`
    pub fn zero_grad(&self, vs: &nn::VarStore) {
        for mut tensor in vs.trainable_variables() {
            tensor.zero_grad();
        }
    }

    /// Apply one Adam update using the gradients currently stored in `vs`
    pub fn step(&mut self, vs: &nn::VarStore) {
        self.step += 1;
        let (beta1, beta2, eps, lr) = (self.beta1, self.beta2, self.eps, self.learning_rate);
        let bias1 = 1.0 - beta1.powf(self.step as f64);
        let bias2 = 1.0 - beta2.powf(self.step as f64);

        let mut variables: Vec<(String, Tensor)> = vs.variables().into_iter().collect();
        variables.sort_by(|a, b| a.0.cmp(&b.0));

        tch::no_grad(|| {
            for (name, mut param) in variables {
                if !param.requires_grad() {
                    continue;
                }
                let grad = param.grad();
                if !grad.defined() {
                    continue;
                }

                let m = match self.exp_avg.remove(&name) {
                    Some(m) => m * beta1 + &grad * (1.0 - beta1),
                    None => &grad * (1.0 - beta1),
                };
                let v = match self.exp_avg_sq.remove(&name) {
                    Some(v) => v * beta2 + grad.square() * (1.0 - beta2),
                    None => grad.square() * (1.0 - beta2),
                };

                let update = (&m / bias1) / ((&v / bias2).sqrt() + eps) * lr;
                let _ = param.sub_(&update);

                self.exp_avg.insert(name.clone(), m);
                self.exp_avg_sq.insert(name, v);
            }
        });
    }

    /// Zero gradients, backpropagate `loss` and step
    pub fn backward_step(&mut self, vs: &nn::VarStore, loss: &Tensor) {
        self.zero_grad(vs);
        loss.backward();
        self.step(vs);
    }

    /// Overwrite this state with a deep copy of `other`
    pub fn copy_from(&mut self, other: &Adam) {
        self.learning_rate = other.learning_rate;
        self.beta1 = other.beta1;
        self.beta2 = other.beta2;
        self.eps = other.eps;
        self.step = other.step;
        self.exp_avg = other.exp_avg.iter().map(|(k, t)| (k.clone(), t.copy())).collect();
        self.exp_avg_sq = other.exp_avg_sq.iter().map(|(k, t)| (k.clone(), t.copy())).collect();
    }

    /// Save the state as a safetensors file
    pub fn save(&self, path: &Path) -> Result<()> {
        let meta = Tensor::from_slice(&[
            self.step as f64,
            self.learning_rate,
            self.beta1,
            self.beta2,
            self.eps,
        ]);

        let mut tensors: Vec<(String, Tensor)> = vec![(META_KEY.to_string(), meta)];
        for (name, tensor) in &self.exp_avg {
            tensors.push((format!("{EXP_AVG_PREFIX}{name}"), tensor.to_device(Device::Cpu)));
        }
        for (name, tensor) in &self.exp_avg_sq {
            tensors.push((format!("{EXP_AVG_SQ_PREFIX}{name}"), tensor.to_device(Device::Cpu)));
        }

        Tensor::write_safetensors(tensors.as_slice(), path)?;
        Ok(())
    }

    /// Replace the state with one saved by [`Adam::save`]
    pub fn load(&mut self, path: &Path, device: Device) -> Result<()> {
        let mut meta = None;
        let mut exp_avg = BTreeMap::new();
        let mut exp_avg_sq = BTreeMap::new();

        for (name, tensor) in Tensor::read_safetensors(path)? {
            if name == META_KEY {
                meta = Some(Vec::<f64>::try_from(tensor.to_kind(Kind::Double))?);
            } else if let Some(var) = name.strip_prefix(EXP_AVG_SQ_PREFIX) {
                exp_avg_sq.insert(var.to_string(), tensor.to_device(device));
            } else if let Some(var) = name.strip_prefix(EXP_AVG_PREFIX) {
                exp_avg.insert(var.to_string(), tensor.to_device(device));
            }
        }

        let meta = meta.ok_or_else(|| anyhow!("{} has no optimizer metadata", path.display()))?;
        let &[step, learning_rate, beta1, beta2, eps] = meta.as_slice() else {
            return Err(anyhow!("{} has malformed optimizer metadata", path.display()));
        };

        self.step = step as i64;
        self.learning_rate = learning_rate;
        self.beta1 = beta1;
        self.beta2 = beta2;
        self.eps = eps;
        self.exp_avg = exp_avg;
        self.exp_avg_sq = exp_avg_sq;
        Ok(())
    }
}
