use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

use st_types::{RolloutError, Trajectory};

use crate::controller::Controller;
use crate::dynamics::Dynamics;
use crate::model::SurrogateModel;
use crate::task::Task;

/// What a rollout advances the state with.
#[derive(Debug, Clone, Copy)]
pub enum DynamicsSource<'a> {
    /// Ground-truth dynamics acting on observations.
    Exact(&'a dyn Dynamics),
    /// A learned model acting on its own state representation.
    Learned(&'a dyn SurrogateModel),
}

impl DynamicsSource<'_> {
    fn label(&self) -> &'static str {
        match self {
            Self::Exact(_) => "exact",
            Self::Learned(_) => "surrogate",
        }
    }
}

/// Counts of completed and attempted rollouts per source.
#[derive(Debug, Default)]
pub struct RolloutStats {
    surrogate: AtomicUsize,
    exact: AtomicUsize,
    diverged: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RolloutCounts {
    pub surrogate: usize,
    pub exact: usize,
    pub diverged: usize,
}

impl RolloutStats {
    pub fn snapshot(&self) -> RolloutCounts {
        RolloutCounts {
            surrogate: self.surrogate.load(Ordering::SeqCst),
            exact: self.exact.load(Ordering::SeqCst),
            diverged: self.diverged.load(Ordering::SeqCst),
        }
    }
}

/// Steps a controller against a dynamics source for a fixed horizon.
#[derive(Debug)]
pub struct RolloutSimulator {
    divergence_limit: f64,
    stats: RolloutStats,
}

impl Default for RolloutSimulator {
    fn default() -> Self {
        Self {
            divergence_limit: 1e8,
            stats: RolloutStats::default(),
        }
    }
}

impl RolloutSimulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// States with any component above this magnitude count as diverged.
    pub fn with_divergence_limit(mut self, limit: f64) -> Self {
        self.divergence_limit = limit;
        self
    }

    pub fn stats(&self) -> RolloutCounts {
        self.stats.snapshot()
    }

    fn check(&self, step: usize, state: &[f64]) -> Result<(), RolloutError> {
        if state.iter().all(|v| v.is_finite() && v.abs() <= self.divergence_limit) {
            Ok(())
        } else {
            Err(RolloutError::Divergence {
                step,
                state: state.to_vec(),
            })
        }
    }

    /// Closed-loop rollout of `horizon` steps from the task's initial
    /// observation. The result holds `horizon + 1` observations; with
    /// `horizon == 0` the controller is never consulted.
    pub fn run(
        &self,
        task: &Task,
        horizon: usize,
        source: DynamicsSource<'_>,
        controller: &dyn Controller,
    ) -> Result<Trajectory, RolloutError> {
        match source {
            DynamicsSource::Exact(_) => self.stats.exact.fetch_add(1, Ordering::SeqCst),
            DynamicsSource::Learned(_) => self.stats.surrogate.fetch_add(1, Ordering::SeqCst),
        };

        let result = self.simulate(task, horizon, source, controller);
        if let Err(RolloutError::Divergence { step, .. }) = &result {
            self.stats.diverged.fetch_add(1, Ordering::SeqCst);
            debug!(source = source.label(), step, "rollout diverged");
        }
        result
    }

    fn simulate(
        &self,
        task: &Task,
        horizon: usize,
        source: DynamicsSource<'_>,
        controller: &dyn Controller,
    ) -> Result<Trajectory, RolloutError> {
        let mut traj = Trajectory::start(&task.system, task.init_obs())?;
        if horizon == 0 {
            return Ok(traj);
        }
        let mut ctrl_state = controller.initial_state(&traj);

        match source {
            DynamicsSource::Exact(dynamics) => {
                for step in 0..horizon {
                    let (ctrl, next_state) = controller.step(&ctrl_state, traj.last_obs());
                    let next_obs = dynamics.step(traj.last_obs(), &ctrl);
                    self.check(step, &next_obs)?;
                    traj.extend(&ctrl, next_obs)?;
                    ctrl_state = next_state;
                }
            }
            DynamicsSource::Learned(model) => {
                let mut state = model.traj_to_state(&traj);
                for step in 0..horizon {
                    let (ctrl, next_state) = controller.step(&ctrl_state, traj.last_obs());
                    state = model.predict(&state, &ctrl);
                    self.check(step, &state)?;
                    traj.extend(&ctrl, model.state_to_obs(&state))?;
                    ctrl_state = next_state;
                }
            }
        }
        Ok(traj)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{ControllerState, ZeroController};
    use std::sync::Arc;
    use st_types::System;

    /// Model that doubles the state every step.
    #[derive(Debug)]
    struct Exploding {
        system: System,
    }

    impl SurrogateModel for Exploding {
        fn system(&self) -> &System {
            &self.system
        }
        fn state_dim(&self) -> usize {
            self.system.obs_dim()
        }
        fn traj_to_state(&self, traj: &Trajectory) -> Vec<f64> {
            traj.last_obs().to_vec()
        }
        fn predict(&self, state: &[f64], _ctrl: &[f64]) -> Vec<f64> {
            state.iter().map(|x| x * 1e6).collect()
        }
        fn state_to_obs(&self, state: &[f64]) -> Vec<f64> {
            state.to_vec()
        }
    }

    /// Counts how often it is asked for a control.
    #[derive(Debug, Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    impl Controller for Counting {
        fn initial_state(&self, _traj: &Trajectory) -> ControllerState {
            ControllerState { step: 0 }
        }
        fn step(&self, state: &ControllerState, _obs: &[f64]) -> (Vec<f64>, ControllerState) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (vec![0.5], ControllerState { step: state.step + 1 })
        }
    }

    #[test]
    fn zero_horizon_yields_single_step() {
        let task = Task::double_integrator();
        let sim = RolloutSimulator::new();
        let controller = Counting::default();
        let traj = sim
            .run(&task, 0, DynamicsSource::Exact(task.dynamics.as_ref()), &controller)
            .unwrap();
        assert_eq!(traj.len(), 1);
        assert_eq!(traj.last_obs(), task.init_obs());
        assert_eq!(controller.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn horizon_h_yields_h_plus_one_steps() {
        let task = Task::double_integrator();
        let sim = RolloutSimulator::new();
        let controller = Counting::default();
        let traj = sim
            .run(&task, 25, DynamicsSource::Exact(task.dynamics.as_ref()), &controller)
            .unwrap();
        assert_eq!(traj.len(), 26);
        assert_eq!(controller.calls.load(Ordering::SeqCst), 25);
        assert_eq!(traj.ctrl(0), Some(&[0.5][..]));
        assert_eq!(traj.ctrl(25), Some(&[0.0][..]));
        assert_eq!(sim.stats().exact, 1);
    }

    #[test]
    fn divergence_is_reported_not_panicked() {
        let task = Task::double_integrator();
        let model = Arc::new(Exploding {
            system: task.system.clone(),
        });
        let sim = RolloutSimulator::new();
        let controller = ZeroController::new(&task.system);
        let err = sim
            .run(&task, 10, DynamicsSource::Learned(model.as_ref()), &controller)
            .unwrap_err();
        assert!(matches!(err, RolloutError::Divergence { step: 1, .. }));

        let counts = sim.stats();
        assert_eq!(counts.surrogate, 1);
        assert_eq!(counts.diverged, 1);
    }
}
