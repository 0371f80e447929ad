//! The MPC pipeline being tuned: a dynamics model, a controller, and one
//! task-cost transformer, each owning a namespace of the configuration.

use std::sync::Arc;
use tracing::info;

use st_data::{CacheKey, CacheLayer};
use st_types::{ConfigSpace, Configuration, ConfigurationError, TuneResult};

use crate::controller::{lqr_for_task, Controller, ControllerConfig, CostTransformerConfig};
use crate::model::{ModelConfig, RidgeFactory, SurrogateFactory, SurrogateModel};
use crate::sampler::TrainingDataSampler;
use crate::task::Task;

pub const MODEL_PREFIX: &str = "_model";
pub const CONTROLLER_PREFIX: &str = "_controller";
pub const TRANSFORMER_PREFIX: &str = "_task_transformer_0";

/// Validated view of a full pipeline configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub model: ModelConfig,
    pub controller: ControllerConfig,
    pub transformer: CostTransformerConfig,
}

#[derive(Debug, Clone)]
pub struct MpcPipeline {
    task: Task,
}

impl MpcPipeline {
    pub fn new(task: Task) -> Self {
        Self { task }
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn configuration_space(&self) -> ConfigSpace {
        ConfigSpace::new()
            .add_subspace(MODEL_PREFIX, ModelConfig::configuration_space(), None)
            .add_subspace(CONTROLLER_PREFIX, ControllerConfig::configuration_space(), None)
            .add_subspace(
                TRANSFORMER_PREFIX,
                CostTransformerConfig::configuration_space(&self.task.system),
                None,
            )
    }

    /// The space searched once the model is frozen: everything but `_model`.
    pub fn configuration_space_fixed_model(&self) -> ConfigSpace {
        self.configuration_space().without_prefix(MODEL_PREFIX)
    }

    /// Merge a fixed-model `candidate` into `root`, keeping the root's model
    /// values. Both the candidate and the merged result are validated.
    pub fn set_configuration_fixed_model(
        &self,
        root: &Configuration,
        candidate: &Configuration,
    ) -> Result<Configuration, ConfigurationError> {
        self.configuration_space_fixed_model().validate(candidate)?;
        let merged = candidate
            .clone()
            .with_subconfiguration(MODEL_PREFIX, &root.subconfiguration(MODEL_PREFIX));
        self.configuration_space().validate(&merged)?;
        Ok(merged)
    }

    pub fn parse(&self, cfg: &Configuration) -> Result<PipelineConfig, ConfigurationError> {
        Ok(PipelineConfig {
            model: self.model_config(cfg)?,
            controller: ControllerConfig::try_from(&cfg.subconfiguration(CONTROLLER_PREFIX))?,
            transformer: CostTransformerConfig::from_configuration(
                &self.task.system,
                &cfg.subconfiguration(TRANSFORMER_PREFIX),
            )?,
        })
    }

    pub fn model_config(&self, cfg: &Configuration) -> Result<ModelConfig, ConfigurationError> {
        ModelConfig::try_from(&cfg.subconfiguration(MODEL_PREFIX))
    }

    /// Train the frozen model described by `root`'s `_model` namespace on
    /// system-identification data drawn with `sysid_seed`. Cached.
    pub fn train_model(
        &self,
        cache: &CacheLayer,
        root: &Configuration,
        sampler: &dyn TrainingDataSampler,
        sysid_seed: u64,
        train_seed: u64,
    ) -> TuneResult<Arc<dyn SurrogateModel>> {
        let factory = RidgeFactory::new(self.model_config(root)?);
        let system = &self.task.system;
        let key = CacheKey::builder("train_model")
            .arg("system", system)
            .arg("model", &factory.identity())
            .arg("sampler", &sampler.identity())
            .seed("sysid_seed", sysid_seed)
            .seed("train_seed", train_seed)
            .build()?;

        let params = cache.get_or_compute(&key, || -> TuneResult<_> {
            info!(system = %system, sysid_seed, "Training frozen pipeline model");
            let trajs = sampler.sample(sysid_seed)?;
            Ok(factory.fit(system, &trajs, train_seed)?)
        })?;
        Ok(factory.restore(system, params)?)
    }

    pub fn build_controller(
        &self,
        cfg: &PipelineConfig,
        model: Arc<dyn SurrogateModel>,
    ) -> TuneResult<Arc<dyn Controller>> {
        let controller = lqr_for_task(&self.task, model, &cfg.controller, &cfg.transformer)?;
        Ok(Arc::new(controller))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::{RandomControlSampler, SamplerConfig};
    use st_types::ParamValue;

    fn pipeline() -> MpcPipeline {
        MpcPipeline::new(Task::double_integrator())
    }

    #[test]
    fn spaces_are_namespaced() {
        let p = pipeline();
        let full = p.configuration_space();
        assert!(full.validate_definition().is_ok());
        assert!(full.get("_model:ridge_log10").is_some());
        assert!(full.get("_controller:horizon").is_some());
        assert!(full.get("_task_transformer_0:x_log10Qgain").is_some());

        let fixed = p.configuration_space_fixed_model();
        assert!(fixed.get("_model:ridge_log10").is_none());
        assert_eq!(fixed.len(), full.len() - 3);
    }

    #[test]
    fn fixed_model_merge_keeps_root_model() {
        let p = pipeline();
        let root = p
            .configuration_space()
            .default_configuration()
            .with("_model:ridge_log10", ParamValue::Float(-2.0));
        let candidate = p
            .configuration_space_fixed_model()
            .default_configuration()
            .with("_controller:horizon", ParamValue::Int(30));

        let merged = p.set_configuration_fixed_model(&root, &candidate).unwrap();
        assert_eq!(merged.float("_model:ridge_log10").unwrap(), -2.0);
        assert_eq!(merged.int("_controller:horizon").unwrap(), 30);

        let parsed = p.parse(&merged).unwrap();
        assert_eq!(parsed.controller.horizon, 30);
        assert_eq!(parsed.model.ridge_log10, -2.0);
    }

    #[test]
    fn bad_candidate_is_a_configuration_error() {
        let p = pipeline();
        let root = p.configuration_space().default_configuration();
        let candidate = p
            .configuration_space_fixed_model()
            .default_configuration()
            .without_prefix(CONTROLLER_PREFIX);
        assert_eq!(
            p.set_configuration_fixed_model(&root, &candidate),
            Err(ConfigurationError::MissingHyperparameter {
                name: "_controller:horizon".to_string()
            })
        );
    }

    #[test]
    fn train_model_goes_through_the_cache() {
        let p = pipeline();
        let cache = CacheLayer::in_memory();
        let root = p.configuration_space().default_configuration();
        let sampler = RandomControlSampler::new(p.task().clone(), SamplerConfig::default());

        let first = p.train_model(&cache, &root, &sampler, 1, 2).unwrap();
        let second = p.train_model(&cache, &root, &sampler, 1, 2).unwrap();
        assert_eq!(cache.get_stats().misses, 1);
        assert_eq!(cache.get_stats().hits, 1);
        assert_eq!(first.predict(&[0.5, 0.1], &[0.2]), second.predict(&[0.5, 0.1], &[0.2]));

        let cfg = p.parse(&root).unwrap();
        assert!(p.build_controller(&cfg, first).is_ok());
    }
}
