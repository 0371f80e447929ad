//! Learned dynamics models.
//!
//! A [`SurrogateFactory`] fits serialisable parameters from trajectories
//! and restores them into a shareable [`SurrogateModel`]. Splitting the two
//! steps is what lets trained parameters go through the cache layer.

use nalgebra::{DMatrix, DVector};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use st_types::{
    ConfigSpace, Configuration, ConfigurationError, ParamValue, System, TrainingError, Trajectory,
};

/// Trained predictor of the next state.
///
/// Implementations are immutable after training and safe to share across
/// threads for concurrent rollouts.
pub trait SurrogateModel: Send + Sync + fmt::Debug {
    fn system(&self) -> &System;

    fn state_dim(&self) -> usize;

    /// Model state summarising the trajectory so far.
    fn traj_to_state(&self, traj: &Trajectory) -> Vec<f64>;

    fn predict(&self, state: &[f64], ctrl: &[f64]) -> Vec<f64>;

    fn state_to_obs(&self, state: &[f64]) -> Vec<f64>;
}

/// Builds surrogate models of one family.
pub trait SurrogateFactory: Send + Sync {
    type Params: Serialize + DeserializeOwned + Send;

    /// Stable description of the family and its hyperparameters.
    fn identity(&self) -> serde_json::Value;

    fn fit(&self, system: &System, trajs: &[Trajectory], seed: u64) -> Result<Self::Params, TrainingError>;

    fn restore(&self, system: &System, params: Self::Params) -> Result<Arc<dyn SurrogateModel>, TrainingError>;
}

// ---- ridge regression surrogate ----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// 1 for affine features, 2 to add pairwise products
    pub degree: u8,
    /// Ridge penalty is `10^ridge_log10` per sample
    pub ridge_log10: f64,
    /// Fit on a seeded bootstrap resample of the transitions
    pub bootstrap: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            degree: 1,
            ridge_log10: -4.0,
            bootstrap: false,
        }
    }
}

impl ModelConfig {
    pub fn configuration_space() -> ConfigSpace {
        ConfigSpace::new()
            .add_categorical("degree", &["1", "2"], "1")
            .add_float("ridge_log10", -8.0, 2.0, -4.0)
            .add_categorical("bootstrap", &["false", "true"], "false")
    }

    pub fn penalty(&self) -> f64 {
        10f64.powf(self.ridge_log10)
    }

    /// Inverse of the `TryFrom<&Configuration>` parse.
    pub fn to_configuration(&self) -> Configuration {
        Configuration::new()
            .with("degree", ParamValue::Str(self.degree.to_string()))
            .with("ridge_log10", ParamValue::Float(self.ridge_log10))
            .with("bootstrap", ParamValue::Str(self.bootstrap.to_string()))
    }
}

impl TryFrom<&Configuration> for ModelConfig {
    type Error = ConfigurationError;

    fn try_from(cfg: &Configuration) -> Result<Self, Self::Error> {
        let degree = match cfg.string("degree")? {
            "1" => 1,
            "2" => 2,
            other => {
                return Err(ConfigurationError::InvalidChoice {
                    name: "degree".to_string(),
                    value: other.to_string(),
                    choices: vec!["1".to_string(), "2".to_string()],
                })
            }
        };
        let bootstrap = match cfg.string("bootstrap")? {
            "true" => true,
            "false" => false,
            other => {
                return Err(ConfigurationError::InvalidChoice {
                    name: "bootstrap".to_string(),
                    value: other.to_string(),
                    choices: vec!["false".to_string(), "true".to_string()],
                })
            }
        };
        Ok(Self {
            degree,
            ridge_log10: cfg.float("ridge_log10")?,
            bootstrap,
        })
    }
}

/// Fitted ridge weights, one row per predicted state delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RidgeParameters {
    pub degree: u8,
    pub obs_dim: usize,
    pub ctrl_dim: usize,
    pub weights: Vec<Vec<f64>>,
}

fn features(degree: u8, obs: &[f64], ctrl: &[f64]) -> Vec<f64> {
    let mut phi = Vec::with_capacity(1 + obs.len() + ctrl.len());
    phi.push(1.0);
    phi.extend_from_slice(obs);
    phi.extend_from_slice(ctrl);
    if degree >= 2 {
        let z: Vec<f64> = phi[1..].to_vec();
        for i in 0..z.len() {
            for j in i..z.len() {
                phi.push(z[i] * z[j]);
            }
        }
    }
    phi
}

/// Linear-in-features model of `x_{t+1} - x_t`.
#[derive(Debug, Clone)]
pub struct RidgeModel {
    system: System,
    degree: u8,
    weights: DMatrix<f64>,
}

impl SurrogateModel for RidgeModel {
    fn system(&self) -> &System {
        &self.system
    }

    fn state_dim(&self) -> usize {
        self.system.obs_dim()
    }

    fn traj_to_state(&self, traj: &Trajectory) -> Vec<f64> {
        traj.last_obs().to_vec()
    }

    fn predict(&self, state: &[f64], ctrl: &[f64]) -> Vec<f64> {
        let phi = DVector::from_vec(features(self.degree, state, ctrl));
        let delta = &self.weights * phi;
        state.iter().zip(delta.iter()).map(|(x, d)| x + d).collect()
    }

    fn state_to_obs(&self, state: &[f64]) -> Vec<f64> {
        state.to_vec()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RidgeFactory {
    config: ModelConfig,
}

impl RidgeFactory {
    pub fn new(config: ModelConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }
}

impl SurrogateFactory for RidgeFactory {
    type Params = RidgeParameters;

    fn identity(&self) -> serde_json::Value {
        serde_json::json!({ "family": "ridge", "config": self.config })
    }

    fn fit(&self, system: &System, trajs: &[Trajectory], seed: u64) -> Result<RidgeParameters, TrainingError> {
        let (n, m) = (system.obs_dim(), system.ctrl_dim());
        let mut rows: Vec<(Vec<f64>, Vec<f64>)> = trajs
            .iter()
            .flat_map(|traj| traj.transitions())
            .map(|(obs, ctrl, next)| {
                let delta: Vec<f64> = next.iter().zip(obs).map(|(b, a)| b - a).collect();
                (features(self.config.degree, obs, ctrl), delta)
            })
            .collect();

        let n_features = features(self.config.degree, &vec![0.0; n], &vec![0.0; m]).len();
        if rows.len() < n_features {
            return Err(TrainingError::InsufficientData {
                message: format!("{} transitions for {} features", rows.len(), n_features),
            });
        }

        if self.config.bootstrap {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            rows = (0..rows.len())
                .map(|_| rows[rng.gen_range(0..rows.len())].clone())
                .collect();
        }

        let samples = rows.len();
        let phi = DMatrix::from_fn(samples, n_features, |i, j| rows[i].0[j]);
        let targets = DMatrix::from_fn(samples, n, |i, j| rows[i].1[j]);

        let mut gram = phi.transpose() * &phi;
        let lambda = self.config.penalty() * samples as f64;
        for k in 0..n_features {
            gram[(k, k)] += lambda;
        }
        let rhs = phi.transpose() * targets;

        let cholesky = gram.cholesky().ok_or_else(|| TrainingError::SolverFailed {
            message: "normal equations are not positive definite".to_string(),
        })?;
        let solution = cholesky.solve(&rhs);
        if solution.iter().any(|w| !w.is_finite()) {
            return Err(TrainingError::NonFiniteParameters);
        }

        debug!(samples, n_features, seed, "fitted ridge surrogate");
        Ok(RidgeParameters {
            degree: self.config.degree,
            obs_dim: n,
            ctrl_dim: m,
            weights: (0..n)
                .map(|out| solution.column(out).iter().copied().collect())
                .collect(),
        })
    }

    fn restore(&self, system: &System, params: RidgeParameters) -> Result<Arc<dyn SurrogateModel>, TrainingError> {
        if params.obs_dim != system.obs_dim() || params.ctrl_dim != system.ctrl_dim() {
            return Err(TrainingError::Rejected {
                message: format!("parameters were fitted for a different system than {system}"),
            });
        }
        let n_features = features(params.degree, &vec![0.0; params.obs_dim], &vec![0.0; params.ctrl_dim]).len();
        if params.weights.len() != params.obs_dim || params.weights.iter().any(|row| row.len() != n_features) {
            return Err(TrainingError::Rejected {
                message: "weight matrix has the wrong shape".to_string(),
            });
        }
        let weights = DMatrix::from_fn(params.obs_dim, n_features, |i, j| params.weights[i][j]);
        Ok(Arc::new(RidgeModel {
            system: system.clone(),
            degree: params.degree,
            weights,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::{RandomControlSampler, SamplerConfig, TrainingDataSampler};
    use crate::task::Task;

    fn data(seed: u64) -> (Task, Vec<Trajectory>) {
        let task = Task::double_integrator();
        let sampler = RandomControlSampler::new(task.clone(), SamplerConfig::default());
        let trajs = sampler.sample(seed).unwrap();
        (task, trajs)
    }

    #[test]
    fn affine_model_recovers_linear_dynamics() {
        let (task, trajs) = data(3);
        let factory = RidgeFactory::new(ModelConfig {
            ridge_log10: -10.0,
            ..ModelConfig::default()
        });
        let params = factory.fit(&task.system, &trajs, 0).unwrap();
        let model = factory.restore(&task.system, params).unwrap();

        let exact = task.dynamics.step(&[0.3, -0.2], &[0.5]);
        let predicted = model.predict(&[0.3, -0.2], &[0.5]);
        for (a, b) in exact.iter().zip(&predicted) {
            assert!((a - b).abs() < 1e-4, "{exact:?} vs {predicted:?}");
        }
    }

    #[test]
    fn bootstrap_depends_on_seed() {
        let (task, trajs) = data(4);
        let factory = RidgeFactory::new(ModelConfig {
            bootstrap: true,
            ridge_log10: 0.0,
            ..ModelConfig::default()
        });
        let a = factory.fit(&task.system, &trajs, 1).unwrap();
        let b = factory.fit(&task.system, &trajs, 1).unwrap();
        let c = factory.fit(&task.system, &trajs, 2).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn too_little_data_is_a_training_error() {
        let task = Task::double_integrator();
        let factory = RidgeFactory::new(ModelConfig {
            degree: 2,
            ..ModelConfig::default()
        });
        let short = Trajectory::start(&task.system, &[0.0, 0.0]).unwrap();
        assert!(matches!(
            factory.fit(&task.system, &[short], 0),
            Err(TrainingError::InsufficientData { .. })
        ));
    }

    #[test]
    fn restore_rejects_foreign_parameters() {
        let (task, trajs) = data(5);
        let factory = RidgeFactory::default();
        let params = factory.fit(&task.system, &trajs, 0).unwrap();
        let other = System::new("wide", &["a", "b", "c"], &["u"]);
        assert!(factory.restore(&other, params).is_err());
    }

    #[test]
    fn config_round_trips_through_configuration() {
        let space = ModelConfig::configuration_space();
        let cfg = space
            .default_configuration()
            .with("degree", ParamValue::Str("2".into()));
        let parsed = ModelConfig::try_from(&cfg).unwrap();
        assert_eq!(parsed.degree, 2);
        assert_eq!(parsed.ridge_log10, -4.0);
        assert!(!parsed.bootstrap);

        assert_eq!(ModelConfig::try_from(&parsed.to_configuration()).unwrap(), parsed);
        assert!(space.validate(&parsed.to_configuration()).is_ok());

        let broken = cfg.with("degree", ParamValue::Int(2));
        assert!(ModelConfig::try_from(&broken).is_err());
    }
}
