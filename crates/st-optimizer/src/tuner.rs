//! The tuning loop: an objective wrapped around the trial evaluator, a
//! black-box optimizer driving it, and the final baseline evaluation.

use chrono::{DateTime, Utc};
use crossbeam_channel::unbounded;
use serde::{Deserialize, Serialize};
use std::thread;
use tracing::{debug, info, warn};

use st_engine::{EvaluationResult, SurrogateFactory, TrialEvaluator, FAILED_TRIAL_COST};
use st_types::{ConfigSpace, Configuration, SearchError, TuneResult};

use crate::search::StrategyKind;
use crate::trial::{HistoryTraces, OptimizationHistory, TrialOutcome, TrialRecord, TuneConfig, TuneId, TuneStatus};

/// Cost function handed to a black-box optimizer.
///
/// Trial-level failures come back as `Ok` with a worst-case cost and a
/// [`TrialOutcome::Failed`] payload; `Err` is reserved for structural
/// problems that should stop the search.
pub trait Objective: Sync {
    fn evaluate(&self, trial_index: usize, configuration: &Configuration) -> TuneResult<(f64, TrialOutcome)>;
}

/// What the optimization loop needs from a trial evaluator.
pub trait TrialEvaluation: Sync {
    fn configuration_space(&self) -> ConfigSpace;

    fn baseline_configuration(&self) -> Configuration {
        self.configuration_space().default_configuration()
    }

    fn evaluate(&self, trial_index: usize, candidate: &Configuration) -> TuneResult<EvaluationResult>;
}

impl<F: SurrogateFactory> TrialEvaluation for TrialEvaluator<F> {
    fn configuration_space(&self) -> ConfigSpace {
        TrialEvaluator::configuration_space(self)
    }

    fn baseline_configuration(&self) -> Configuration {
        TrialEvaluator::baseline_configuration(self)
    }

    fn evaluate(&self, trial_index: usize, candidate: &Configuration) -> TuneResult<EvaluationResult> {
        TrialEvaluator::evaluate(self, trial_index, candidate)
    }
}

/// Adapts a [`TrialEvaluation`] to the optimizer's objective signature.
pub struct TrialObjective<'a, E: TrialEvaluation> {
    evaluator: &'a E,
}

impl<'a, E: TrialEvaluation> TrialObjective<'a, E> {
    pub fn new(evaluator: &'a E) -> Self {
        Self { evaluator }
    }
}

impl<E: TrialEvaluation> Objective for TrialObjective<'_, E> {
    fn evaluate(&self, trial_index: usize, configuration: &Configuration) -> TuneResult<(f64, TrialOutcome)> {
        match self.evaluator.evaluate(trial_index, configuration) {
            Ok(result) => Ok((result.primary_score, TrialOutcome::Evaluated(result))),
            Err(e) if e.is_trial_local() => {
                warn!(trial = trial_index, "Trial failed: {}", e);
                Ok((FAILED_TRIAL_COST, TrialOutcome::Failed { error: e.to_string() }))
            }
            Err(e) => Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Optimizer
// ---------------------------------------------------------------------------

/// Result of one optimizer run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerRun {
    pub history: OptimizationHistory,
    /// The optimizer's own pick, which need not be the history's incumbent.
    pub best: Option<Configuration>,
}

pub trait BlackBoxOptimizer {
    fn optimize(
        &mut self,
        space: &ConfigSpace,
        objective: &dyn Objective,
        budget: usize,
        seed: u64,
    ) -> TuneResult<OptimizerRun>;
}

struct BatchResult {
    index: usize,
    result: TuneResult<(f64, TrialOutcome)>,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
}

/// Batched optimizer over a [`SearchStrategy`](crate::search::SearchStrategy).
///
/// Each batch of `concurrency` suggestions runs on scoped threads; results
/// are collected through a channel and recorded in trial-index order.
#[derive(Debug, Clone)]
pub struct SearchOptimizer {
    strategy: StrategyKind,
    concurrency: usize,
    exploration_weight: f64,
}

impl SearchOptimizer {
    pub fn new(strategy: StrategyKind, concurrency: usize, exploration_weight: f64) -> Self {
        Self {
            strategy,
            concurrency: concurrency.max(1),
            exploration_weight,
        }
    }

    pub fn from_config(config: &TuneConfig) -> Self {
        Self::new(config.strategy, config.concurrency, config.exploration_weight)
    }

    fn run_batch(
        objective: &dyn Objective,
        first_index: usize,
        batch: &[Configuration],
    ) -> Vec<BatchResult> {
        let (tx, rx) = unbounded();
        thread::scope(|scope| {
            for (offset, cfg) in batch.iter().enumerate() {
                let tx = tx.clone();
                scope.spawn(move || {
                    let started_at = Utc::now();
                    let result = objective.evaluate(first_index + offset, cfg);
                    // The receiver outlives the scope.
                    let _ = tx.send(BatchResult {
                        index: first_index + offset,
                        result,
                        started_at,
                        finished_at: Utc::now(),
                    });
                });
            }
        });
        drop(tx);

        let mut results: Vec<_> = rx.iter().collect();
        results.sort_by_key(|r| r.index);
        results
    }
}

impl BlackBoxOptimizer for SearchOptimizer {
    fn optimize(
        &mut self,
        space: &ConfigSpace,
        objective: &dyn Objective,
        budget: usize,
        seed: u64,
    ) -> TuneResult<OptimizerRun> {
        space.validate_definition()?;
        let mut strategy = self.strategy.build(space.clone(), seed, self.exploration_weight);
        info!(strategy = strategy.name(), budget, concurrency = self.concurrency, "Starting search");

        let mut history = OptimizationHistory::new();
        while history.len() < budget {
            let want = self.concurrency.min(budget - history.len());
            let batch = strategy.suggest(want);
            if batch.is_empty() {
                return Err(SearchError::Exhausted {
                    completed: history.len(),
                }
                .into());
            }

            let first_index = history.len();
            for done in Self::run_batch(objective, first_index, &batch) {
                let index = done.index;
                let (cost, outcome) = done.result?;
                let configuration = batch[index - first_index].clone();
                strategy.report(&configuration, cost);

                let improved = history.record(TrialRecord {
                    index,
                    configuration,
                    cost,
                    outcome,
                    started_at: done.started_at,
                    finished_at: done.finished_at,
                });
                if improved {
                    info!(trial = index, cost, "New incumbent");
                } else {
                    debug!(trial = index, cost, "trial recorded");
                }
            }
        }

        let best = history.incumbent().map(|r| r.configuration.clone());
        Ok(OptimizerRun { history, best })
    }
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

/// Everything a tuning run produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuneOutcome {
    pub id: TuneId,
    pub name: String,
    pub status: TuneStatus,
    pub history: OptimizationHistory,
    pub incumbent: Option<TrialRecord>,
    /// Default configuration, evaluated once after the budget is spent and
    /// never considered for the incumbent. Trial-local failures are recorded
    /// here like any other trial.
    pub baseline: TrialRecord,
    pub traces: HistoryTraces,
}

pub struct OptimizationLoop<O: BlackBoxOptimizer> {
    config: TuneConfig,
    optimizer: O,
    status: TuneStatus,
}

impl OptimizationLoop<SearchOptimizer> {
    pub fn with_search(config: TuneConfig) -> Self {
        let optimizer = SearchOptimizer::from_config(&config);
        Self::new(config, optimizer)
    }
}

impl<O: BlackBoxOptimizer> OptimizationLoop<O> {
    pub fn new(config: TuneConfig, optimizer: O) -> Self {
        let status = TuneStatus::new(config.id);
        Self {
            config,
            optimizer,
            status,
        }
    }

    pub fn status(&self) -> &TuneStatus {
        &self.status
    }

    pub fn run<E: TrialEvaluation>(&mut self, evaluator: &E) -> TuneResult<TuneOutcome> {
        self.status.mark_running();
        match self.run_inner(evaluator) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.status.mark_failed(e.to_string());
                Err(e)
            }
        }
    }

    fn run_inner<E: TrialEvaluation>(&mut self, evaluator: &E) -> TuneResult<TuneOutcome> {
        self.config.validate()?;
        info!(name = %self.config.name, id = %self.config.id, budget = self.config.budget, "Tuning run started");

        let space = evaluator.configuration_space();
        let objective = TrialObjective::new(evaluator);
        let run = self
            .optimizer
            .optimize(&space, &objective, self.config.budget, self.config.seed)?;

        for record in run.history.records() {
            self.status.count(record);
        }

        let configuration = evaluator.baseline_configuration();
        let started_at = Utc::now();
        let (cost, outcome) = objective.evaluate(self.config.budget, &configuration)?;
        let baseline = TrialRecord {
            index: self.config.budget,
            configuration,
            cost,
            outcome,
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            cost = baseline.cost,
            true_cost = ?baseline.true_cost(),
            failed = baseline.is_failed(),
            "Baseline evaluated"
        );

        let incumbent = run.history.incumbent().cloned();
        if let Some(inc) = &incumbent {
            info!(trial = inc.index, cost = inc.cost, true_cost = ?inc.true_cost(), "Tuning run finished");
        }

        self.status.mark_completed();
        Ok(TuneOutcome {
            id: self.config.id,
            name: self.config.name.clone(),
            status: self.status.clone(),
            traces: run.history.traces(),
            history: run.history,
            incumbent,
            baseline,
        })
    }
}
