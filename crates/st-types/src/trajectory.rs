use serde::{Deserialize, Serialize};

use crate::errors::RolloutError;
use crate::system::System;

/// One time step: the observation and the control applied from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryStep {
    pub obs: Vec<f64>,
    pub ctrl: Vec<f64>,
}

/// Ordered (observation, control) pairs of fixed dimensionality.
///
/// A closed-loop trajectory of horizon `H` holds `H + 1` steps; the control
/// of the final step is always zero because nothing was applied from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    obs_dim: usize,
    ctrl_dim: usize,
    steps: Vec<TrajectoryStep>,
}

impl Trajectory {
    /// Single-step trajectory holding `init_obs` and a zero control.
    pub fn start(system: &System, init_obs: &[f64]) -> Result<Self, RolloutError> {
        if init_obs.len() != system.obs_dim() {
            return Err(RolloutError::DimensionMismatch {
                what: "initial observation".to_string(),
                expected: system.obs_dim(),
                actual: init_obs.len(),
            });
        }
        Ok(Self {
            obs_dim: system.obs_dim(),
            ctrl_dim: system.ctrl_dim(),
            steps: vec![TrajectoryStep {
                obs: init_obs.to_vec(),
                ctrl: vec![0.0; system.ctrl_dim()],
            }],
        })
    }

    pub fn obs_dim(&self) -> usize {
        self.obs_dim
    }

    pub fn ctrl_dim(&self) -> usize {
        self.ctrl_dim
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn steps(&self) -> &[TrajectoryStep] {
        &self.steps
    }

    pub fn obs(&self, index: usize) -> Option<&[f64]> {
        self.steps.get(index).map(|s| s.obs.as_slice())
    }

    pub fn ctrl(&self, index: usize) -> Option<&[f64]> {
        self.steps.get(index).map(|s| s.ctrl.as_slice())
    }

    pub fn last_obs(&self) -> &[f64] {
        // `start` guarantees at least one step.
        &self.steps[self.steps.len() - 1].obs
    }

    /// Record `ctrl` as the control applied at the last step, then append
    /// `next_obs` with a zero control.
    pub fn extend(&mut self, ctrl: &[f64], next_obs: Vec<f64>) -> Result<(), RolloutError> {
        if ctrl.len() != self.ctrl_dim {
            return Err(RolloutError::DimensionMismatch {
                what: "control".to_string(),
                expected: self.ctrl_dim,
                actual: ctrl.len(),
            });
        }
        if next_obs.len() != self.obs_dim {
            return Err(RolloutError::DimensionMismatch {
                what: "observation".to_string(),
                expected: self.obs_dim,
                actual: next_obs.len(),
            });
        }
        let last = self.steps.len() - 1;
        self.steps[last].ctrl.copy_from_slice(ctrl);
        self.steps.push(TrajectoryStep {
            obs: next_obs,
            ctrl: vec![0.0; self.ctrl_dim],
        });
        Ok(())
    }

    /// Consecutive `(obs, ctrl, next_obs)` transitions.
    pub fn transitions(&self) -> impl Iterator<Item = (&[f64], &[f64], &[f64])> + '_ {
        self.steps
            .windows(2)
            .map(|w| (w[0].obs.as_slice(), w[0].ctrl.as_slice(), w[1].obs.as_slice()))
    }

    pub fn is_finite(&self) -> bool {
        self.steps
            .iter()
            .all(|s| s.obs.iter().chain(s.ctrl.iter()).all(|v| v.is_finite()))
    }
}
