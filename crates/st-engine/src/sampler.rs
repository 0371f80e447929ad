use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use st_types::{RolloutError, Trajectory, TuneResult};

use crate::task::Task;

/// Produces training trajectories from a seed.
///
/// `identity` is a stable, serialisable description of everything besides
/// the seed that influences the output; it becomes part of cache keys.
pub trait TrainingDataSampler: Send + Sync {
    fn identity(&self) -> serde_json::Value;

    fn sample(&self, seed: u64) -> TuneResult<Vec<Trajectory>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerConfig {
    /// Number of trajectories per draw
    pub n_trajs: usize,
    /// Controls applied per trajectory
    pub traj_len: usize,
    /// Half-width of the uniform noise added to the task's initial observation
    pub init_noise: f64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            n_trajs: 20,
            traj_len: 40,
            init_noise: 0.5,
        }
    }
}

impl SamplerConfig {
    pub fn with_n_trajs(mut self, n_trajs: usize) -> Self {
        self.n_trajs = n_trajs;
        self
    }

    pub fn with_traj_len(mut self, traj_len: usize) -> Self {
        self.traj_len = traj_len;
        self
    }
}

/// Open-loop excitation of the exact dynamics with uniformly random
/// controls drawn inside the task's control bounds.
#[derive(Debug, Clone)]
pub struct RandomControlSampler {
    task: Task,
    config: SamplerConfig,
}

impl RandomControlSampler {
    pub fn new(task: Task, config: SamplerConfig) -> Self {
        Self { task, config }
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    fn sample_one(&self, rng: &mut ChaCha8Rng) -> Result<Trajectory, RolloutError> {
        let noise = self.config.init_noise;
        let init: Vec<f64> = self
            .task
            .init_obs
            .iter()
            .map(|x| if noise > 0.0 { x + rng.gen_range(-noise..=noise) } else { *x })
            .collect();

        let mut traj = Trajectory::start(&self.task.system, &init)?;
        for step in 0..self.config.traj_len {
            let ctrl: Vec<f64> = self
                .task
                .ctrl_bounds
                .iter()
                .map(|(low, high)| rng.gen_range(*low..=*high))
                .collect();
            let next = self.task.dynamics.step(traj.last_obs(), &ctrl);
            if next.iter().any(|v| !v.is_finite()) {
                return Err(RolloutError::Divergence { step, state: next });
            }
            traj.extend(&ctrl, next)?;
        }
        Ok(traj)
    }
}

impl TrainingDataSampler for RandomControlSampler {
    fn identity(&self) -> serde_json::Value {
        serde_json::json!({
            "sampler": "random_control",
            "system": self.task.system,
            "init_obs": self.task.init_obs,
            "ctrl_bounds": self.task.ctrl_bounds,
            "config": self.config,
        })
    }

    fn sample(&self, seed: u64) -> TuneResult<Vec<Trajectory>> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let trajs = (0..self.config.n_trajs)
            .map(|_| self.sample_one(&mut rng))
            .collect::<Result<Vec<_>, _>>()?;
        debug!(seed, n_trajs = trajs.len(), "sampled training trajectories");
        Ok(trajs)
    }
}
