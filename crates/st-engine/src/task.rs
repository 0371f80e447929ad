//! Control tasks: a system, its true dynamics, a start state, control
//! limits, and the quadratic performance metric trials are scored with.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use st_types::{System, Trajectory};

use crate::dynamics::{Dynamics, DoubleIntegrator, Pendulum};

/// Diagonal quadratic cost around a goal state.
///
/// `sum_t (x_t - g)' Q (x_t - g) + u_t' R u_t` over every step except the
/// last, plus `(x_N - g)' F (x_N - g)` on the final observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuadraticCost {
    pub q: Vec<f64>,
    pub r: Vec<f64>,
    pub f: Vec<f64>,
    pub goal: Vec<f64>,
}

impl QuadraticCost {
    fn state_term(weights: &[f64], x: &[f64], goal: &[f64]) -> f64 {
        weights
            .iter()
            .zip(x.iter().zip(goal))
            .map(|(w, (xi, gi))| w * (xi - gi) * (xi - gi))
            .sum()
    }

    pub fn evaluate(&self, traj: &Trajectory) -> f64 {
        let steps = traj.steps();
        let Some((last, running)) = steps.split_last() else {
            return 0.0;
        };

        let mut total = 0.0;
        for step in running {
            total += Self::state_term(&self.q, &step.obs, &self.goal);
            total += self
                .r
                .iter()
                .zip(&step.ctrl)
                .map(|(w, u)| w * u * u)
                .sum::<f64>();
        }
        total + Self::state_term(&self.f, &last.obs, &self.goal)
    }
}

/// A closed-loop control task.
#[derive(Debug, Clone)]
pub struct Task {
    pub system: System,
    pub init_obs: Vec<f64>,
    pub dynamics: Arc<dyn Dynamics>,
    /// Per-control `(low, high)` limits.
    pub ctrl_bounds: Vec<(f64, f64)>,
    pub cost: QuadraticCost,
}

impl Task {
    pub fn double_integrator() -> Self {
        Self {
            system: System::new("double_integrator", &["x", "v"], &["a"]),
            init_obs: vec![1.0, 0.0],
            dynamics: Arc::new(DoubleIntegrator::default()),
            ctrl_bounds: vec![(-1.0, 1.0)],
            cost: QuadraticCost {
                q: vec![1.0, 0.1],
                r: vec![0.01],
                f: vec![10.0, 1.0],
                goal: vec![0.0, 0.0],
            },
        }
    }

    pub fn pendulum() -> Self {
        Self {
            system: System::new("pendulum", &["theta", "omega"], &["torque"]),
            init_obs: vec![0.4, 0.0],
            dynamics: Arc::new(Pendulum::default()),
            ctrl_bounds: vec![(-6.0, 6.0)],
            cost: QuadraticCost {
                q: vec![1.0, 0.1],
                r: vec![0.01],
                f: vec![10.0, 1.0],
                goal: vec![0.0, 0.0],
            },
        }
    }

    pub fn init_obs(&self) -> &[f64] {
        &self.init_obs
    }

    /// Scalar performance of a closed-loop trajectory (lower is better).
    pub fn perf_metric(&self, traj: &Trajectory) -> f64 {
        self.cost.evaluate(traj)
    }
}

/// Built-in tasks selectable from experiment configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Benchmark {
    DoubleIntegrator,
    Pendulum,
}

impl Benchmark {
    pub fn task(self) -> Task {
        match self {
            Self::DoubleIntegrator => Task::double_integrator(),
            Self::Pendulum => Task::pendulum(),
        }
    }
}
