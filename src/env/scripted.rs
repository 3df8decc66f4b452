//! Scripted multi-car track
//!
//! A small deterministic stand-in for the racing simulator. Each car has a
//! speed and a lateral offset from the track centre; gas and brake change the
//! speed, steering moves the car across the track, and a seeded drift pushes
//! it off-centre.
//!
//! # Reward
//!
//! `speed * (1 - |offset|)` per step, with a penalty of `0.1` while the car
//! is off the track (`|offset| > 1`).
//!
//! # Observation
//!
//! A `[3, height, width]` image: channel 0 is filled with the speed, channel 1
//! marks the car's lateral column, channel 2 holds episode progress.

use anyhow::{Result, anyhow};
use rand::{Rng, SeedableRng, rngs::StdRng};
use tch::Tensor;

use super::{Action, Frame, MultiCarEnvironment, StepResult};

/// Configuration for [`ScriptedTrack`]
#[derive(Debug, Clone)]
pub struct ScriptedTrackConfig {
    pub num_agents: usize,
    pub episode_length: usize,
    pub height: usize,
    pub width: usize,
    pub seed: u64,

    /// Make `step` fail once this many steps were taken (failure injection)
    pub fail_at_step: Option<usize>,
}

impl Default for ScriptedTrackConfig {
    fn default() -> Self {
        Self {
            num_agents: 4,
            episode_length: 1000,
            height: 96,
            width: 96,
            seed: 0,
            fail_at_step: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct CarState {
    speed: f32,
    offset: f32,
}

/// Deterministic multi-car track
#[derive(Debug)]
pub struct ScriptedTrack {
    config: ScriptedTrackConfig,
    cars: Vec<CarState>,
    steps: usize,
    rng: StdRng,
    episodes: usize,
}

impl ScriptedTrack {
    pub fn new(config: ScriptedTrackConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        let cars = vec![CarState::default(); config.num_agents];
        Self { config, cars, steps: 0, rng, episodes: 0 }
    }

    /// Number of episodes started with `reset`
    pub fn episodes(&self) -> usize {
        self.episodes
    }

    fn observe(&self, car: &CarState) -> Tensor {
        let (h, w) = (self.config.height, self.config.width);
        let progress = self.steps as f32 / self.config.episode_length.max(1) as f32;
        let lane = (car.offset.clamp(-1.0, 1.0) + 1.0) / 2.0;
        let column = (lane * (w - 1) as f32).round() as usize;

        let mut pixels = vec![0.0_f32; 3 * h * w];
        for y in 0..h {
            for x in 0..w {
                pixels[y * w + x] = car.speed;
                pixels[h * w + y * w + x] = if x == column { 1.0 } else { 0.0 };
                pixels[2 * h * w + y * w + x] = progress;
            }
        }
        Tensor::from_slice(&pixels).view([3, h as i64, w as i64])
    }

    fn observations(&self) -> Vec<Tensor> {
        self.cars.iter().map(|car| self.observe(car)).collect()
    }
}

impl MultiCarEnvironment for ScriptedTrack {
    fn num_agents(&self) -> usize {
        self.config.num_agents
    }

    fn reset(&mut self) -> Result<Vec<Tensor>> {
        self.steps = 0;
        self.episodes += 1;
        for car in &mut self.cars {
            car.speed = 0.0;
            car.offset = self.rng.gen_range(-0.2..0.2);
        }
        Ok(self.observations())
    }

    fn step(&mut self, actions: Option<&[Action]>) -> Result<StepResult> {
        if let Some(limit) = self.config.fail_at_step {
            if self.steps >= limit {
                return Err(anyhow!("scripted track failure at step {}", self.steps));
            }
        }

        let Some(actions) = actions else {
            let rewards = vec![0.0; self.cars.len()];
            return Ok(StepResult::new(self.observations(), rewards, false));
        };
        if actions.len() != self.cars.len() {
            return Err(anyhow!("expected {} actions, got {}", self.cars.len(), actions.len()));
        }

        let mut rewards = Vec::with_capacity(self.cars.len());
        for (car, action) in self.cars.iter_mut().zip(actions) {
            let action = action.clamped();
            let drift: f32 = self.rng.gen_range(-0.05..0.05);

            car.speed = (car.speed + 0.1 * action.gas - 0.15 * action.brake - 0.01).clamp(0.0, 1.0);
            car.offset += 0.1 * action.steer + drift;

            let off_track = car.offset.abs() > 1.0;
            let on_track_reward = car.speed * (1.0 - car.offset.abs().min(1.0));
            rewards.push(if off_track { on_track_reward - 0.1 } else { on_track_reward });
        }

        self.steps += 1;
        let done = self.steps >= self.config.episode_length;
        Ok(StepResult::new(self.observations(), rewards, done))
    }

    fn render(&mut self) -> Result<Vec<Frame>> {
        let (h, w) = (self.config.height, self.config.width);
        self.observations()
            .iter()
            .map(|obs| {
                let chw: Vec<f32> = Vec::try_from(obs.view([-1]))?;
                let mut rgb = Vec::with_capacity(h * w * 3);
                for y in 0..h {
                    for x in 0..w {
                        for c in 0..3 {
                            rgb.push((chw[c * h * w + y * w + x].clamp(0.0, 1.0) * 255.0) as u8);
                        }
                    }
                }
                Frame::new(w, h, rgb)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_track() -> ScriptedTrack {
        ScriptedTrack::new(ScriptedTrackConfig {
            episode_length: 3,
            height: 4,
            width: 4,
            ..Default::default()
        })
    }

    #[test]
    fn test_reset_shapes() {
        let mut env = small_track();
        let obs = env.reset().unwrap();

        assert_eq!(obs.len(), 4);
        assert_eq!(obs[0].size(), vec![3, 4, 4]);
        assert_eq!(env.episodes(), 1);
    }

    #[test]
    fn test_episode_terminates() {
        let mut env = small_track();
        env.reset().unwrap();
        let actions = vec![Action::new(0.0, 1.0, 0.0); 4];

        let mut steps = 0;
        loop {
            let result = env.step(Some(&actions)).unwrap();
            steps += 1;
            assert_eq!(result.rewards.len(), 4);
            if result.done {
                break;
            }
        }
        assert_eq!(steps, 3);
    }

    #[test]
    fn test_gas_earns_more_than_brake() {
        let mut env = small_track();
        env.reset().unwrap();
        let actions = vec![
            Action::new(0.0, 1.0, 0.0),
            Action::new(0.0, 0.0, 1.0),
            Action::new(0.0, 1.0, 0.0),
            Action::new(0.0, 0.0, 1.0),
        ];

        let result = env.step(Some(&actions)).unwrap();
        assert!(result.rewards[0] > result.rewards[1]);
    }

    #[test]
    fn test_step_without_actions() {
        let mut env = small_track();
        env.reset().unwrap();

        let result = env.step(None).unwrap();
        assert!(!result.done);
        assert!(result.rewards.iter().all(|&r| r == 0.0));
    }

    #[test]
    fn test_failure_injection() {
        let mut env = ScriptedTrack::new(ScriptedTrackConfig {
            height: 4,
            width: 4,
            fail_at_step: Some(1),
            ..Default::default()
        });
        env.reset().unwrap();
        let actions = vec![Action::default(); 4];

        assert!(env.step(Some(&actions)).is_ok());
        assert!(env.step(Some(&actions)).is_err());
    }

    #[test]
    fn test_render_frames() {
        let mut env = small_track();
        env.reset().unwrap();

        let frames = env.render().unwrap();
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[0].rgb.len(), 4 * 4 * 3);
    }
}
