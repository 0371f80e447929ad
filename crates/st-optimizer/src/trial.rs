//! Trial tracking and tuning run management.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use st_engine::EvaluationResult;
use st_types::{config_error, Configuration, TuneResult};

use crate::search::StrategyKind;

/// Unique tuning run identifier.
pub type TuneId = Uuid;

/// Top-level configuration for a tuning run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuneConfig {
    pub id: TuneId,
    pub name: String,

    /// Number of trials the optimizer may spend.
    pub budget: usize,

    /// How many trials to run in parallel.
    pub concurrency: usize,

    /// Seed for the search strategy.
    pub seed: u64,

    pub strategy: StrategyKind,

    /// Probability of a random draw instead of a local step (local search only).
    pub exploration_weight: f64,

    pub created_at: DateTime<Utc>,
}

impl TuneConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            budget: 100,
            concurrency: 1,
            seed: 0,
            strategy: StrategyKind::Local,
            exploration_weight: 0.3,
            created_at: Utc::now(),
        }
    }

    pub fn with_budget(mut self, n: usize) -> Self {
        self.budget = n;
        self
    }

    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_exploration_weight(mut self, weight: f64) -> Self {
        self.exploration_weight = weight;
        self
    }

    pub fn validate(&self) -> TuneResult<()> {
        if self.concurrency == 0 {
            return Err(config_error!("concurrency must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.exploration_weight) {
            return Err(config_error!(
                "exploration_weight must lie in [0, 1], got {}",
                self.exploration_weight
            ));
        }
        Ok(())
    }
}

/// Lifecycle state for a tuning run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TuneState {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Aggregate status of a tuning run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuneStatus {
    pub id: TuneId,
    pub state: TuneState,
    pub trials_completed: usize,
    pub trials_failed: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl TuneStatus {
    pub fn new(id: TuneId) -> Self {
        Self {
            id,
            state: TuneState::Pending,
            trials_completed: 0,
            trials_failed: 0,
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.state = TuneState::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_completed(&mut self) {
        self.state = TuneState::Completed;
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: String) {
        self.state = TuneState::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(error);
    }

    pub fn count(&mut self, record: &TrialRecord) {
        if record.is_failed() {
            self.trials_failed += 1;
        } else {
            self.trials_completed += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// Individual trial
// ---------------------------------------------------------------------------

/// Auxiliary payload returned by the objective next to the cost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrialOutcome {
    Evaluated(EvaluationResult),
    /// The candidate could not be evaluated at all.
    Failed { error: String },
}

impl TrialOutcome {
    pub fn evaluation(&self) -> Option<&EvaluationResult> {
        match self {
            Self::Evaluated(result) => Some(result),
            Self::Failed { .. } => None,
        }
    }
}

/// One evaluated configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub index: usize,
    pub configuration: Configuration,
    pub cost: f64,
    pub outcome: TrialOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl TrialRecord {
    pub fn true_cost(&self) -> Option<f64> {
        self.outcome.evaluation().and_then(|r| r.true_dynamics_score)
    }

    /// Whether the trial produced no usable score.
    pub fn is_failed(&self) -> bool {
        match &self.outcome {
            TrialOutcome::Evaluated(result) => !result.is_success(),
            TrialOutcome::Failed { .. } => true,
        }
    }
}

/// Per-trial series for auditing convergence after the fact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryTraces {
    pub inc_costs: Vec<f64>,
    pub inc_truedyn_costs: Vec<Option<f64>>,
    pub costs: Vec<f64>,
    pub truedyn_costs: Vec<Option<f64>>,
}

/// Ordered trial records plus the incumbent.
///
/// Records only grow. The incumbent moves only to a trial whose cost is
/// strictly lower, so ties keep the earlier trial.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizationHistory {
    records: Vec<TrialRecord>,
    incumbent: Option<usize>,
    /// Incumbent position after each record
    incumbent_trace: Vec<usize>,
}

impl OptimizationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `record`; returns whether it became the incumbent.
    pub fn record(&mut self, record: TrialRecord) -> bool {
        let improved = match self.incumbent() {
            None => true,
            Some(current) => record.cost < current.cost,
        };
        self.records.push(record);
        if improved {
            self.incumbent = Some(self.records.len() - 1);
        }
        if let Some(pos) = self.incumbent {
            self.incumbent_trace.push(pos);
        }
        improved
    }

    pub fn records(&self) -> &[TrialRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn incumbent(&self) -> Option<&TrialRecord> {
        self.incumbent.map(|pos| &self.records[pos])
    }

    pub fn incumbent_costs(&self) -> Vec<f64> {
        self.incumbent_trace.iter().map(|&pos| self.records[pos].cost).collect()
    }

    pub fn incumbent_true_costs(&self) -> Vec<Option<f64>> {
        self.incumbent_trace
            .iter()
            .map(|&pos| self.records[pos].true_cost())
            .collect()
    }

    pub fn costs(&self) -> Vec<f64> {
        self.records.iter().map(|r| r.cost).collect()
    }

    pub fn true_costs(&self) -> Vec<Option<f64>> {
        self.records.iter().map(|r| r.true_cost()).collect()
    }

    pub fn traces(&self) -> HistoryTraces {
        HistoryTraces {
            inc_costs: self.incumbent_costs(),
            inc_truedyn_costs: self.incumbent_true_costs(),
            costs: self.costs(),
            truedyn_costs: self.true_costs(),
        }
    }
}
