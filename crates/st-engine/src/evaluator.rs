//! Turns one candidate configuration into one scalar cost.
//!
//! A trial builds a controller from the candidate and the frozen model,
//! trains (or fetches) a fresh surrogate ensemble from the trial's seed,
//! rolls the controller out once per member and once against the true
//! dynamics, and aggregates the member scores with the median.

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use st_data::CacheLayer;
use st_types::{
    config_error, internal_error, ConfigSpace, Configuration, MemberSeeds, SeedSequence, TuneResult,
};

use crate::diagnostics::DiagnosticLog;
use crate::ensemble::{EnsembleMember, SurrogateEnsembleTrainer};
use crate::model::{RidgeFactory, SurrogateFactory, SurrogateModel};
use crate::pipeline::MpcPipeline;
use crate::sampler::TrainingDataSampler;
use crate::simulator::{DynamicsSource, RolloutCounts, RolloutSimulator};

/// Cost reported for trials that produced no usable score. Strictly worse
/// than any score a successful trial can report.
pub const FAILED_TRIAL_COST: f64 = f64::MAX;

/// Successful rollout scores are capped here, below [`FAILED_TRIAL_COST`].
/// Two capped scores still average to a finite median.
pub const MAX_TRIAL_SCORE: f64 = 1e300;

/// Which score drives the search.
///
/// Both are always computed; only the selected one becomes the primary
/// score. The true-dynamics score is otherwise kept for auditing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectiveSignal {
    /// Median of the surrogate-ensemble rollout scores.
    #[default]
    SurrogateMedian,
    /// Score of the single rollout against the true dynamics.
    TrueDynamics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorSettings {
    pub ensemble_size: usize,
    /// Rollout length in controller steps
    pub horizon: usize,
    /// Worker threads shared by ensemble training and rollouts
    pub pool_size: usize,
    /// Fewer successful members than this fails the trial
    pub min_successful_members: usize,
    pub signal: ObjectiveSignal,
    pub master_seed: u64,
    /// Rollout states with any component above this magnitude count as diverged
    pub divergence_limit: f64,
}

impl Default for EvaluatorSettings {
    fn default() -> Self {
        Self {
            ensemble_size: 10,
            horizon: 200,
            pool_size: 4,
            min_successful_members: 1,
            signal: ObjectiveSignal::SurrogateMedian,
            master_seed: 0,
            divergence_limit: 1e8,
        }
    }
}

impl EvaluatorSettings {
    pub fn with_ensemble_size(mut self, ensemble_size: usize) -> Self {
        self.ensemble_size = ensemble_size;
        self
    }

    pub fn with_horizon(mut self, horizon: usize) -> Self {
        self.horizon = horizon;
        self
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_min_successful_members(mut self, min: usize) -> Self {
        self.min_successful_members = min;
        self
    }

    pub fn with_signal(mut self, signal: ObjectiveSignal) -> Self {
        self.signal = signal;
        self
    }

    pub fn with_master_seed(mut self, master_seed: u64) -> Self {
        self.master_seed = master_seed;
        self
    }

    pub fn with_divergence_limit(mut self, limit: f64) -> Self {
        self.divergence_limit = limit;
        self
    }

    pub fn validate(&self) -> TuneResult<()> {
        if self.ensemble_size == 0 {
            return Err(config_error!("ensemble_size must be at least 1"));
        }
        if self.pool_size == 0 {
            return Err(config_error!("pool_size must be at least 1"));
        }
        if self.min_successful_members == 0 || self.min_successful_members > self.ensemble_size {
            return Err(config_error!(
                "min_successful_members must lie in [1, {}], got {}",
                self.ensemble_size,
                self.min_successful_members
            ));
        }
        if self.divergence_limit.is_nan() || self.divergence_limit <= 0.0 {
            return Err(config_error!(
                "divergence_limit must be positive, got {}",
                self.divergence_limit
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EvaluationStatus {
    Succeeded,
    /// Too few ensemble members produced a score.
    EnsembleFailed { succeeded: usize, required: usize },
    /// The true-dynamics rollout failed while it was the driving signal.
    TrueDynamicsFailed { message: String },
}

/// Everything one trial produced. Failed members appear as `None` scores
/// with the matching entry of `member_errors` set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub trial_index: usize,
    /// Candidate merged into the root configuration
    pub configuration: Configuration,
    pub primary_score: f64,
    pub signal: ObjectiveSignal,
    pub surrogate_median: Option<f64>,
    pub true_dynamics_score: Option<f64>,
    pub surrogate_scores: Vec<Option<f64>>,
    pub member_seeds: Vec<MemberSeeds>,
    pub member_errors: Vec<Option<String>>,
    pub status: EvaluationStatus,
}

impl EvaluationResult {
    pub fn is_success(&self) -> bool {
        self.status == EvaluationStatus::Succeeded
    }

    pub fn successful_members(&self) -> usize {
        self.surrogate_scores.iter().filter(|s| s.is_some()).count()
    }
}

/// Median of `values`; the mean of the two middle values for even counts.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

pub struct TrialEvaluator<F: SurrogateFactory = RidgeFactory> {
    pipeline: MpcPipeline,
    root: Configuration,
    model: Arc<dyn SurrogateModel>,
    trainer: SurrogateEnsembleTrainer<F>,
    sampler: Arc<dyn TrainingDataSampler>,
    pool: Arc<ThreadPool>,
    simulator: RolloutSimulator,
    seeds: SeedSequence,
    settings: EvaluatorSettings,
    diagnostics: Option<DiagnosticLog>,
}

impl<F: SurrogateFactory> TrialEvaluator<F> {
    /// `root` is a full pipeline configuration whose `_model` namespace
    /// describes `model`, which stays frozen for every trial.
    pub fn new(
        pipeline: MpcPipeline,
        root: Configuration,
        model: Arc<dyn SurrogateModel>,
        factory: F,
        sampler: Arc<dyn TrainingDataSampler>,
        cache: Arc<CacheLayer>,
        settings: EvaluatorSettings,
    ) -> TuneResult<Self> {
        settings.validate()?;
        pipeline.configuration_space().validate(&root)?;

        let pool = ThreadPoolBuilder::new()
            .num_threads(settings.pool_size)
            .thread_name(|i| format!("surrotune-worker-{i}"))
            .build()
            .map_err(|e| internal_error!("Failed to build worker pool: {}", e))?;
        let pool = Arc::new(pool);

        info!(
            ensemble_size = settings.ensemble_size,
            horizon = settings.horizon,
            pool_size = settings.pool_size,
            signal = ?settings.signal,
            "Trial evaluator ready"
        );
        Ok(Self {
            trainer: SurrogateEnsembleTrainer::new(Arc::new(factory), cache, Arc::clone(&pool)),
            seeds: SeedSequence::new(settings.master_seed),
            pipeline,
            root,
            model,
            sampler,
            pool,
            simulator: RolloutSimulator::new().with_divergence_limit(settings.divergence_limit),
            settings,
            diagnostics: None,
        })
    }

    pub fn with_diagnostics(mut self, log: DiagnosticLog) -> Self {
        self.diagnostics = Some(log);
        self
    }

    pub fn settings(&self) -> &EvaluatorSettings {
        &self.settings
    }

    pub fn pipeline(&self) -> &MpcPipeline {
        &self.pipeline
    }

    /// The space candidates are drawn from (the model namespace is frozen).
    pub fn configuration_space(&self) -> ConfigSpace {
        self.pipeline.configuration_space_fixed_model()
    }

    pub fn baseline_configuration(&self) -> Configuration {
        self.configuration_space().default_configuration()
    }

    pub fn rollout_counts(&self) -> RolloutCounts {
        self.simulator.stats()
    }

    /// Evaluate `candidate` as trial `trial_index`.
    ///
    /// A candidate that cannot be merged or turned into a controller is an
    /// error. Member failures never are: they are excluded from the median,
    /// and a trial with too few surviving members scores
    /// [`FAILED_TRIAL_COST`].
    pub fn evaluate(&self, trial_index: usize, candidate: &Configuration) -> TuneResult<EvaluationResult> {
        let configuration = self.pipeline.set_configuration_fixed_model(&self.root, candidate)?;
        let parsed = self.pipeline.parse(&configuration)?;
        let controller = self.pipeline.build_controller(&parsed, Arc::clone(&self.model))?;

        let task = self.pipeline.task();
        let horizon = self.settings.horizon;
        let trial_seed = self.seeds.trial_seed(trial_index);
        debug!(trial = trial_index, trial_seed, "evaluating candidate");

        let members = self.trainer.build(
            self.settings.ensemble_size,
            &task.system,
            self.sampler.as_ref(),
            trial_seed,
        );

        let score_member = |member: &EnsembleMember| -> Result<f64, String> {
            let model = member.model.as_ref().map_err(|e| e.to_string())?;
            let traj = self
                .simulator
                .run(task, horizon, DynamicsSource::Learned(model.as_ref()), controller.as_ref())
                .map_err(|e| e.to_string())?;
            finite_score(task.perf_metric(&traj))
        };
        let score_true = || -> Result<f64, String> {
            let traj = self
                .simulator
                .run(task, horizon, DynamicsSource::Exact(task.dynamics.as_ref()), controller.as_ref())
                .map_err(|e| e.to_string())?;
            finite_score(task.perf_metric(&traj))
        };

        // The audit rollout runs alongside the member rollouts on the same pool.
        let (true_score, member_scores) = self.pool.install(|| {
            rayon::join(score_true, || -> Vec<Result<f64, String>> {
                members.par_iter().map(score_member).collect()
            })
        });

        let mut surrogate_scores = Vec::with_capacity(members.len());
        let mut member_errors = Vec::with_capacity(members.len());
        for (member, score) in members.iter().zip(member_scores) {
            match score {
                Ok(score) => {
                    surrogate_scores.push(Some(score));
                    member_errors.push(None);
                }
                Err(e) => {
                    // Training failures were already logged by the trainer.
                    if member.is_ok() {
                        warn!(trial = trial_index, member = member.index, "Member rollout failed: {}", e);
                    }
                    surrogate_scores.push(None);
                    member_errors.push(Some(e));
                }
            }
        }

        let succeeded: Vec<f64> = surrogate_scores.iter().flatten().copied().collect();
        let required = self.settings.min_successful_members;
        let surrogate_median = if succeeded.len() >= required {
            median(&succeeded)
        } else {
            None
        };

        let true_dynamics_score = match true_score {
            Ok(score) => Some(score),
            Err(e) => {
                warn!(trial = trial_index, "True-dynamics rollout failed: {}", e);
                None
            }
        };

        let (primary_score, status) = match self.settings.signal {
            ObjectiveSignal::SurrogateMedian => match surrogate_median {
                Some(score) => (score, EvaluationStatus::Succeeded),
                None => (
                    FAILED_TRIAL_COST,
                    EvaluationStatus::EnsembleFailed {
                        succeeded: succeeded.len(),
                        required,
                    },
                ),
            },
            ObjectiveSignal::TrueDynamics => match true_dynamics_score {
                Some(score) => (score, EvaluationStatus::Succeeded),
                None => (
                    FAILED_TRIAL_COST,
                    EvaluationStatus::TrueDynamicsFailed {
                        message: "true-dynamics rollout produced no score".to_string(),
                    },
                ),
            },
        };

        let result = EvaluationResult {
            trial_index,
            configuration,
            primary_score,
            signal: self.settings.signal,
            surrogate_median,
            true_dynamics_score,
            surrogate_scores,
            member_seeds: members.iter().map(|m| m.seeds).collect(),
            member_errors,
            status,
        };

        if let Some(log) = &self.diagnostics {
            if let Err(e) = log.record(&result) {
                warn!(trial = trial_index, "Failed to write diagnostics: {}", e);
            }
        }

        info!(
            trial = trial_index,
            primary = result.primary_score,
            true_score = ?result.true_dynamics_score,
            members_ok = result.successful_members(),
            "Trial evaluated"
        );
        Ok(result)
    }
}

fn finite_score(score: f64) -> Result<f64, String> {
    if score.is_finite() {
        Ok(score.min(MAX_TRIAL_SCORE))
    } else {
        Err(format!("rollout score {score} is not finite"))
    }
}

impl<F: SurrogateFactory> std::fmt::Debug for TrialEvaluator<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrialEvaluator")
            .field("task", &self.pipeline.task().system)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
