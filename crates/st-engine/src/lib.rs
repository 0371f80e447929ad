//! # st-engine
//!
//! Closed-loop simulation and trial evaluation for surrotune.
//!
//! Provides the benchmark dynamics and tasks, ridge surrogate models, the
//! LQR-based MPC pipeline, the rollout simulator, surrogate ensembles, and
//! the trial evaluator that scores one candidate configuration.

pub mod controller;
pub mod diagnostics;
pub mod dynamics;
pub mod ensemble;
pub mod evaluator;
pub mod model;
pub mod pipeline;
pub mod sampler;
pub mod simulator;
pub mod task;

pub use controller::{
    Controller, ControllerConfig, ControllerState, CostTransformerConfig, LqrMpcController,
    ZeroController,
};
pub use diagnostics::DiagnosticLog;
pub use dynamics::{DoubleIntegrator, Dynamics, Pendulum};
pub use ensemble::{EnsembleMember, SurrogateEnsembleTrainer};
pub use evaluator::{
    median, EvaluationResult, EvaluationStatus, EvaluatorSettings, ObjectiveSignal, TrialEvaluator,
    FAILED_TRIAL_COST, MAX_TRIAL_SCORE,
};
pub use model::{ModelConfig, RidgeFactory, RidgeModel, RidgeParameters, SurrogateFactory, SurrogateModel};
pub use pipeline::{MpcPipeline, PipelineConfig, CONTROLLER_PREFIX, MODEL_PREFIX, TRANSFORMER_PREFIX};
pub use sampler::{RandomControlSampler, SamplerConfig, TrainingDataSampler};
pub use simulator::{DynamicsSource, RolloutCounts, RolloutSimulator, RolloutStats};
pub use task::{Benchmark, QuadraticCost, Task};
