//! The ideal-tune experiment: tune a pipeline against a surrogate ensemble
//! with the model frozen, then evaluate the default pipeline as a baseline.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use st_data::{default_cache_dir, CacheLayer};
use st_engine::{
    Benchmark, DiagnosticLog, EvaluatorSettings, ModelConfig, MpcPipeline, RandomControlSampler,
    RidgeFactory, SamplerConfig, TrainingDataSampler, TrialEvaluator, MODEL_PREFIX,
};
use st_types::{config_error, SeedSequence, TuneResult, SEED_BOUND};

use crate::search::StrategyKind;
use crate::trial::TuneConfig;
use crate::tuner::{OptimizationLoop, TuneOutcome};

/// Everything needed to reproduce one experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub name: String,
    pub benchmark: Benchmark,
    pub seed: u64,
    pub budget: usize,
    pub concurrency: usize,
    pub strategy: StrategyKind,
    pub exploration_weight: f64,
    pub evaluator: EvaluatorSettings,
    /// Hyperparameters of the frozen pipeline model
    pub model: ModelConfig,
    /// Hyperparameters of every ensemble member
    pub surrogate: ModelConfig,
    /// Data for the frozen model
    pub sysid_data: SamplerConfig,
    /// Data for each ensemble member
    pub surrogate_data: SamplerConfig,
    /// Persist trained models on disk
    pub persist_cache: bool,
    /// Defaults to the platform cache dir
    pub cache_dir: Option<PathBuf>,
    pub diagnostics_path: Option<PathBuf>,
    pub output_path: Option<PathBuf>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            name: "ideal_tune".to_string(),
            benchmark: Benchmark::Pendulum,
            seed: 0,
            budget: 100,
            concurrency: 1,
            strategy: StrategyKind::Local,
            exploration_weight: 0.3,
            evaluator: EvaluatorSettings::default(),
            model: ModelConfig::default(),
            surrogate: ModelConfig {
                bootstrap: true,
                ..ModelConfig::default()
            },
            sysid_data: SamplerConfig::default().with_n_trajs(100),
            surrogate_data: SamplerConfig::default(),
            persist_cache: true,
            cache_dir: None,
            diagnostics_path: None,
            output_path: None,
        }
    }
}

impl ExperimentConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> TuneResult<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Apply `SURROTUNE_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> TuneResult<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `SURROTUNE_*` overrides looked up through `lookup`.
    pub fn with_overrides<L>(mut self, lookup: L) -> TuneResult<Self>
    where
        L: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, raw: String) -> TuneResult<T> {
            raw.trim()
                .parse()
                .map_err(|_| config_error!("{} has an invalid value: {}", key, raw))
        }

        if let Some(v) = lookup("SURROTUNE_BUDGET") {
            self.budget = parse("SURROTUNE_BUDGET", v)?;
        }
        if let Some(v) = lookup("SURROTUNE_CONCURRENCY") {
            self.concurrency = parse("SURROTUNE_CONCURRENCY", v)?;
        }
        if let Some(v) = lookup("SURROTUNE_SEED") {
            self.seed = parse("SURROTUNE_SEED", v)?;
        }
        if let Some(v) = lookup("SURROTUNE_ENSEMBLE_SIZE") {
            self.evaluator.ensemble_size = parse("SURROTUNE_ENSEMBLE_SIZE", v)?;
        }
        if let Some(v) = lookup("SURROTUNE_POOL_SIZE") {
            self.evaluator.pool_size = parse("SURROTUNE_POOL_SIZE", v)?;
        }
        if let Some(v) = lookup("SURROTUNE_CACHE_DIR") {
            self.cache_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("SURROTUNE_DIAGNOSTICS") {
            self.diagnostics_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("SURROTUNE_OUTPUT") {
            self.output_path = Some(PathBuf::from(v));
        }
        Ok(self)
    }

    fn open_cache(&self) -> TuneResult<CacheLayer> {
        if !self.persist_cache {
            return Ok(CacheLayer::in_memory());
        }
        let dir = self.cache_dir.clone().unwrap_or_else(default_cache_dir);
        CacheLayer::persistent(dir)
    }
}

/// Run the full experiment and write the outcome to `output_path` if set.
pub fn run_ideal_tune(config: &ExperimentConfig) -> TuneResult<TuneOutcome> {
    if config.budget == 0 {
        return Err(config_error!("budget must be at least 1"));
    }
    let task = config.benchmark.task();
    let pipeline = MpcPipeline::new(task.clone());
    let cache = Arc::new(config.open_cache()?);

    let mut rng = SeedSequence::new(config.seed).run_rng();
    let sysid_seed = rng.gen_range(0..SEED_BOUND);
    let model_seed = rng.gen_range(0..SEED_BOUND);
    let optimizer_seed = rng.gen_range(0..SEED_BOUND);

    let root = pipeline
        .configuration_space()
        .default_configuration()
        .with_subconfiguration(MODEL_PREFIX, &config.model.to_configuration());

    let sysid_sampler = RandomControlSampler::new(task.clone(), config.sysid_data.clone());
    let model = pipeline.train_model(&cache, &root, &sysid_sampler, sysid_seed, model_seed)?;
    info!(system = %task.system, sysid_seed, model_seed, "Frozen model ready");

    let sampler: Arc<dyn TrainingDataSampler> =
        Arc::new(RandomControlSampler::new(task, config.surrogate_data.clone()));
    let settings = config.evaluator.clone().with_master_seed(config.seed);
    let mut evaluator = TrialEvaluator::new(
        pipeline,
        root,
        model,
        RidgeFactory::new(config.surrogate.clone()),
        sampler,
        Arc::clone(&cache),
        settings,
    )?;
    if let Some(path) = &config.diagnostics_path {
        evaluator = evaluator.with_diagnostics(DiagnosticLog::open(path)?);
    }

    let tune_config = TuneConfig::new(config.name.clone())
        .with_budget(config.budget)
        .with_concurrency(config.concurrency)
        .with_seed(optimizer_seed)
        .with_strategy(config.strategy)
        .with_exploration_weight(config.exploration_weight);
    let outcome = OptimizationLoop::with_search(tune_config).run(&evaluator)?;

    let stats = cache.get_stats();
    info!(
        hits = stats.hits + stats.disk_hits,
        misses = stats.misses,
        hit_rate = stats.hit_rate(),
        "Cache usage"
    );

    if let Some(path) = &config.output_path {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec_pretty(&outcome)?)?;
        info!("Wrote tuning outcome to {}", path.display());
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn small(dir: &Path) -> ExperimentConfig {
        ExperimentConfig {
            benchmark: Benchmark::DoubleIntegrator,
            seed: 3,
            budget: 4,
            concurrency: 2,
            evaluator: EvaluatorSettings::default()
                .with_ensemble_size(3)
                .with_horizon(40)
                .with_pool_size(2),
            sysid_data: SamplerConfig::default().with_n_trajs(10).with_traj_len(20),
            surrogate_data: SamplerConfig::default().with_n_trajs(5).with_traj_len(20),
            cache_dir: Some(dir.join("cache")),
            diagnostics_path: Some(dir.join("diag.txt")),
            output_path: Some(dir.join("out/outcome.json")),
            ..ExperimentConfig::default()
        }
    }

    #[test]
    fn overrides_replace_file_values() {
        let env: HashMap<&str, &str> = [
            ("SURROTUNE_BUDGET", "7"),
            ("SURROTUNE_ENSEMBLE_SIZE", "5"),
            ("SURROTUNE_SEED", "42"),
            ("SURROTUNE_OUTPUT", "/tmp/out.json"),
        ]
        .into_iter()
        .collect();
        let cfg = ExperimentConfig::default()
            .with_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(cfg.budget, 7);
        assert_eq!(cfg.evaluator.ensemble_size, 5);
        assert_eq!(cfg.seed, 42);
        assert_eq!(cfg.output_path, Some(PathBuf::from("/tmp/out.json")));

        let bad = ExperimentConfig::default()
            .with_overrides(|k| (k == "SURROTUNE_BUDGET").then(|| "lots".to_string()));
        assert!(bad.is_err());
    }

    #[test]
    fn config_file_fills_missing_fields_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("experiment.json");
        fs::write(&path, r#"{"benchmark": "double_integrator", "budget": 9}"#).unwrap();

        let cfg = ExperimentConfig::from_file(&path).unwrap();
        assert_eq!(cfg.benchmark, Benchmark::DoubleIntegrator);
        assert_eq!(cfg.budget, 9);
        assert_eq!(cfg.evaluator, EvaluatorSettings::default());
    }

    #[test]
    fn ideal_tune_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let config = small(dir.path());
        let outcome = run_ideal_tune(&config).unwrap();

        assert_eq!(outcome.history.len(), 4);
        assert!(outcome.incumbent.is_some());
        assert!(!outcome.baseline.is_failed());
        assert!(outcome.baseline.cost.is_finite());
        assert!(outcome.baseline.true_cost().is_some());
        assert_eq!(outcome.baseline.index, 4);
        assert_eq!(outcome.traces.costs.len(), 4);

        let written: TuneOutcome =
            serde_json::from_slice(&fs::read(dir.path().join("out/outcome.json")).unwrap()).unwrap();
        assert_eq!(written.history.costs(), outcome.history.costs());

        // One block per evaluated trial plus the baseline.
        let evaluated = outcome
            .history
            .records()
            .iter()
            .filter(|r| r.outcome.evaluation().is_some())
            .count();
        let diag = fs::read_to_string(dir.path().join("diag.txt")).unwrap();
        assert_eq!(diag.matches("==========\n\n").count(), evaluated + 1);

        // Rerunning against the warm on-disk cache reproduces the run.
        let again = run_ideal_tune(&config).unwrap();
        assert_eq!(again.history.costs(), outcome.history.costs());
        assert_eq!(again.baseline.cost, outcome.baseline.cost);
        assert_eq!(again.baseline.outcome, outcome.baseline.outcome);
    }
}
