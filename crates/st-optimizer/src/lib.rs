//! # st-optimizer
//!
//! Black-box search over pipeline configurations for surrotune.
//!
//! Provides seeded search strategies, trial records and the optimization
//! history, the batched tuning loop, and the ideal-tune experiment driver.

mod experiment;
mod search;
mod trial;
mod tuner;

pub use experiment::{run_ideal_tune, ExperimentConfig};
pub use search::{LocalSearch, RandomSearch, SearchStrategy, StrategyKind};
pub use trial::{
    HistoryTraces, OptimizationHistory, TrialOutcome, TrialRecord, TuneConfig, TuneId, TuneState,
    TuneStatus,
};
pub use tuner::{
    BlackBoxOptimizer, Objective, OptimizationLoop, OptimizerRun, SearchOptimizer,
    TrialEvaluation, TrialObjective, TuneOutcome,
};
