//! Controllers and the cost transformer that shapes their objective.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use st_types::{ConfigSpace, Configuration, ConfigurationError, System, TrainingError, Trajectory};

use crate::model::SurrogateModel;
use crate::task::{QuadraticCost, Task};

/// Per-rollout controller state, threaded through `step`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerState {
    /// Steps taken so far in this rollout
    pub step: usize,
}

/// Feedback policy. Implementations are immutable so one instance can
/// drive many rollouts concurrently.
pub trait Controller: Send + Sync + fmt::Debug {
    fn initial_state(&self, traj: &Trajectory) -> ControllerState;

    fn step(&self, state: &ControllerState, obs: &[f64]) -> (Vec<f64>, ControllerState);
}

/// Always applies zero control.
#[derive(Debug, Clone)]
pub struct ZeroController {
    ctrl_dim: usize,
}

impl ZeroController {
    pub fn new(system: &System) -> Self {
        Self {
            ctrl_dim: system.ctrl_dim(),
        }
    }
}

impl Controller for ZeroController {
    fn initial_state(&self, _traj: &Trajectory) -> ControllerState {
        ControllerState { step: 0 }
    }

    fn step(&self, state: &ControllerState, _obs: &[f64]) -> (Vec<f64>, ControllerState) {
        let next = ControllerState { step: state.step + 1 };
        (vec![0.0; self.ctrl_dim], next)
    }
}

// ---- LQR-based MPC ----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Riccati recursion length
    pub horizon: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self { horizon: 20 }
    }
}

impl ControllerConfig {
    pub fn configuration_space() -> ConfigSpace {
        ConfigSpace::new().add_int("horizon", 5, 50, 20)
    }
}

impl TryFrom<&Configuration> for ControllerConfig {
    type Error = ConfigurationError;

    fn try_from(cfg: &Configuration) -> Result<Self, Self::Error> {
        let horizon = cfg.int("horizon")?;
        if horizon < 1 {
            return Err(ConfigurationError::OutOfRange {
                name: "horizon".to_string(),
                value: horizon as f64,
                low: 1.0,
                high: f64::INFINITY,
            });
        }
        Ok(Self {
            horizon: horizon as usize,
        })
    }
}

/// Finite-horizon LQR on the model linearised at the goal, applied in
/// receding-horizon fashion: the first-stage gain is used at every step.
#[derive(Debug)]
pub struct LqrMpcController {
    goal: Vec<f64>,
    gain: DMatrix<f64>,
    ctrl_bounds: Vec<(f64, f64)>,
}

const LINEARIZATION_EPS: f64 = 1e-4;

fn diagonal(values: &[f64]) -> DMatrix<f64> {
    DMatrix::from_diagonal(&DVector::from_column_slice(values))
}

/// Central-difference Jacobians `(A, B)` of `model.predict` at `(x0, u0)`.
fn linearize(model: &dyn SurrogateModel, x0: &[f64], u0: &[f64]) -> (DMatrix<f64>, DMatrix<f64>) {
    let n = x0.len();
    let m = u0.len();
    let scale = 0.5 / LINEARIZATION_EPS;

    let mut a = DMatrix::<f64>::zeros(n, n);
    for j in 0..n {
        let (mut plus, mut minus) = (x0.to_vec(), x0.to_vec());
        plus[j] += LINEARIZATION_EPS;
        minus[j] -= LINEARIZATION_EPS;
        let (fp, fm) = (model.predict(&plus, u0), model.predict(&minus, u0));
        for i in 0..n {
            a[(i, j)] = (fp[i] - fm[i]) * scale;
        }
    }

    let mut b = DMatrix::<f64>::zeros(n, m);
    for j in 0..m {
        let (mut plus, mut minus) = (u0.to_vec(), u0.to_vec());
        plus[j] += LINEARIZATION_EPS;
        minus[j] -= LINEARIZATION_EPS;
        let (fp, fm) = (model.predict(x0, &plus), model.predict(x0, &minus));
        for i in 0..n {
            b[(i, j)] = (fp[i] - fm[i]) * scale;
        }
    }
    (a, b)
}

impl LqrMpcController {
    pub fn new(
        model: Arc<dyn SurrogateModel>,
        cost: &QuadraticCost,
        ctrl_bounds: Vec<(f64, f64)>,
        config: &ControllerConfig,
    ) -> Result<Self, TrainingError> {
        let m = ctrl_bounds.len();
        let (a, b) = linearize(model.as_ref(), &cost.goal, &vec![0.0; m]);
        let (q, r) = (diagonal(&cost.q), diagonal(&cost.r));

        let mut p = diagonal(&cost.f);
        let mut gain = DMatrix::<f64>::zeros(m, cost.goal.len());
        for _ in 0..config.horizon {
            let bt_p = b.transpose() * &p;
            let s = &r + &bt_p * &b;
            let s_inv = s.try_inverse().ok_or_else(|| TrainingError::SolverFailed {
                message: "Riccati recursion hit a singular control Hessian".to_string(),
            })?;
            gain = s_inv * (&bt_p * &a);
            let next_p = &q + a.transpose() * &p * (&a - &b * &gain);
            p = (&next_p + next_p.transpose()) * 0.5;
        }
        if gain.iter().any(|k| !k.is_finite()) {
            return Err(TrainingError::NonFiniteParameters);
        }

        debug!(horizon = config.horizon, gain = ?gain.as_slice(), "synthesised LQR gain");
        Ok(Self {
            goal: cost.goal.clone(),
            gain,
            ctrl_bounds,
        })
    }

    pub fn gain(&self) -> &DMatrix<f64> {
        &self.gain
    }
}

impl Controller for LqrMpcController {
    fn initial_state(&self, _traj: &Trajectory) -> ControllerState {
        ControllerState { step: 0 }
    }

    fn step(&self, state: &ControllerState, obs: &[f64]) -> (Vec<f64>, ControllerState) {
        let error = DVector::from_iterator(obs.len(), obs.iter().zip(&self.goal).map(|(x, g)| x - g));
        let mut ctrl: Vec<f64> = (-(&self.gain * error)).iter().copied().collect();
        for (u, (low, high)) in ctrl.iter_mut().zip(&self.ctrl_bounds) {
            *u = u.clamp(*low, *high);
        }
        (ctrl, ControllerState { step: state.step + 1 })
    }
}

// ---- cost transformer ----

/// Log10 weights replacing the task cost's diagonal: `{obs}_log10Qgain`,
/// `{obs}_log10Fgain` per observation and `{ctrl}_log10Rgain` per control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostTransformerConfig {
    pub q_log10: Vec<f64>,
    pub f_log10: Vec<f64>,
    pub r_log10: Vec<f64>,
}

const GAIN_RANGE: (f64, f64) = (-3.0, 4.0);

impl CostTransformerConfig {
    pub fn configuration_space(system: &System) -> ConfigSpace {
        let (low, high) = GAIN_RANGE;
        let mut space = ConfigSpace::new();
        for obs in &system.observations {
            space = space
                .add_float(format!("{obs}_log10Qgain"), low, high, 0.0)
                .add_float(format!("{obs}_log10Fgain"), low, high, 0.0);
        }
        for ctrl in &system.controls {
            space = space.add_float(format!("{ctrl}_log10Rgain"), low, high, 0.0);
        }
        space
    }

    pub fn from_configuration(system: &System, cfg: &Configuration) -> Result<Self, ConfigurationError> {
        let read = |names: &[String], suffix: &str| {
            names
                .iter()
                .map(|name| cfg.float(&format!("{name}_{suffix}")))
                .collect::<Result<Vec<_>, _>>()
        };
        Ok(Self {
            q_log10: read(&system.observations, "log10Qgain")?,
            f_log10: read(&system.observations, "log10Fgain")?,
            r_log10: read(&system.controls, "log10Rgain")?,
        })
    }

    /// Controller cost with the same goal as `base` and reweighted diagonals.
    pub fn apply(&self, base: &QuadraticCost) -> QuadraticCost {
        let pow = |gains: &[f64]| -> Vec<f64> { gains.iter().map(|g| 10f64.powf(*g)).collect() };
        QuadraticCost {
            q: pow(&self.q_log10),
            r: pow(&self.r_log10),
            f: pow(&self.f_log10),
            goal: base.goal.clone(),
        }
    }
}

/// Controller for `task` built from the transformed cost and a model.
pub fn lqr_for_task(
    task: &Task,
    model: Arc<dyn SurrogateModel>,
    controller: &ControllerConfig,
    transformer: &CostTransformerConfig,
) -> Result<LqrMpcController, TrainingError> {
    let cost = transformer.apply(&task.cost);
    LqrMpcController::new(model, &cost, task.ctrl_bounds.clone(), controller)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelConfig, RidgeFactory, SurrogateFactory};
    use crate::sampler::{RandomControlSampler, SamplerConfig, TrainingDataSampler};
    use st_types::ParamValue;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Forwards to a trained model and counts predictions.
    #[derive(Debug)]
    struct CountingModel {
        inner: Arc<dyn SurrogateModel>,
        predictions: AtomicUsize,
    }

    impl SurrogateModel for CountingModel {
        fn system(&self) -> &System {
            self.inner.system()
        }
        fn state_dim(&self) -> usize {
            self.inner.state_dim()
        }
        fn traj_to_state(&self, traj: &Trajectory) -> Vec<f64> {
            self.inner.traj_to_state(traj)
        }
        fn predict(&self, state: &[f64], ctrl: &[f64]) -> Vec<f64> {
            self.predictions.fetch_add(1, Ordering::SeqCst);
            self.inner.predict(state, ctrl)
        }
        fn state_to_obs(&self, state: &[f64]) -> Vec<f64> {
            self.inner.state_to_obs(state)
        }
    }

    fn trained_model(task: &Task) -> Arc<dyn SurrogateModel> {
        let sampler = RandomControlSampler::new(task.clone(), SamplerConfig::default());
        let trajs = sampler.sample(11).unwrap();
        let factory = RidgeFactory::new(ModelConfig::default());
        let params = factory.fit(&task.system, &trajs, 0).unwrap();
        factory.restore(&task.system, params).unwrap()
    }

    fn default_transformer(task: &Task) -> CostTransformerConfig {
        let cfg = CostTransformerConfig::configuration_space(&task.system).default_configuration();
        CostTransformerConfig::from_configuration(&task.system, &cfg).unwrap()
    }

    #[test]
    fn lqr_pushes_state_toward_goal() {
        let task = Task::double_integrator();
        let controller = lqr_for_task(
            &task,
            trained_model(&task),
            &ControllerConfig::default(),
            &default_transformer(&task),
        )
        .unwrap();

        let traj = Trajectory::start(&task.system, &[1.0, 0.0]).unwrap();
        let state = controller.initial_state(&traj);
        let (u, next) = controller.step(&state, &[1.0, 0.0]);
        assert!(u[0] < 0.0);
        assert!(u[0] >= -1.0);
        assert_eq!(next.step, 1);
    }

    #[test]
    fn stepping_does_not_query_the_model() {
        let task = Task::double_integrator();
        let model = Arc::new(CountingModel {
            inner: trained_model(&task),
            predictions: AtomicUsize::new(0),
        });
        let controller = lqr_for_task(
            &task,
            Arc::clone(&model) as Arc<dyn SurrogateModel>,
            &ControllerConfig::default(),
            &default_transformer(&task),
        )
        .unwrap();
        // Central differences: two predictions per state and control dimension.
        assert_eq!(model.predictions.load(Ordering::SeqCst), 6);

        let traj = Trajectory::start(&task.system, &task.init_obs).unwrap();
        let mut state = controller.initial_state(&traj);
        for _ in 0..10 {
            state = controller.step(&state, &[0.5, -0.1]).1;
        }
        assert_eq!(state.step, 10);
        assert_eq!(model.predictions.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn transformer_space_names_follow_the_system() {
        let task = Task::pendulum();
        let space = CostTransformerConfig::configuration_space(&task.system);
        assert!(space.get("theta_log10Qgain").is_some());
        assert!(space.get("omega_log10Fgain").is_some());
        assert!(space.get("torque_log10Rgain").is_some());
        assert_eq!(space.len(), 5);

        let cfg = space
            .default_configuration()
            .with("torque_log10Rgain", ParamValue::Float(2.0));
        let transformer = CostTransformerConfig::from_configuration(&task.system, &cfg).unwrap();
        let cost = transformer.apply(&task.cost);
        assert_eq!(cost.q, vec![1.0, 1.0]);
        assert!((cost.r[0] - 100.0).abs() < 1e-9);
        assert_eq!(cost.goal, task.cost.goal);
    }

    #[test]
    fn missing_gain_is_a_configuration_error() {
        let task = Task::double_integrator();
        let cfg = Configuration::new().with("x_log10Qgain", ParamValue::Float(0.0));
        assert!(matches!(
            CostTransformerConfig::from_configuration(&task.system, &cfg),
            Err(ConfigurationError::MissingHyperparameter { .. })
        ));
    }

    #[test]
    fn zero_controller_is_passive() {
        let task = Task::pendulum();
        let controller = ZeroController::new(&task.system);
        let traj = Trajectory::start(&task.system, &task.init_obs).unwrap();
        let (u, _) = controller.step(&controller.initial_state(&traj), &task.init_obs);
        assert_eq!(u, vec![0.0]);
    }
}
