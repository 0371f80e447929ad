use thiserror::Error;

/// Main error type for surrotune
#[derive(Error, Debug)]
pub enum TuneError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Rollout error: {0}")]
    Rollout(#[from] RolloutError),

    #[error("Training error: {0}")]
    Training(#[from] TrainingError),

    #[error("Search error: {0}")]
    Search(#[from] SearchError),

    #[error("Invalid settings: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TuneError {
    /// Errors that fail a single trial. Anything else is structural and
    /// ends the search.
    pub fn is_trial_local(&self) -> bool {
        matches!(
            self,
            TuneError::Configuration(_) | TuneError::Rollout(_) | TuneError::Training(_)
        )
    }
}

/// A candidate configuration could not be merged or read.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("Missing required hyperparameter: {name}")]
    MissingHyperparameter { name: String },

    #[error("Unknown hyperparameter: {name}")]
    UnknownHyperparameter { name: String },

    #[error("Hyperparameter {name} is inactive under the current configuration")]
    InactiveHyperparameter { name: String },

    #[error("Type mismatch for {name}: expected {expected}, got {actual}")]
    TypeMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("Value {value} for {name} is outside [{low}, {high}]")]
    OutOfRange {
        name: String,
        value: f64,
        low: f64,
        high: f64,
    },

    #[error("Invalid choice {value} for {name}, expected one of {choices:?}")]
    InvalidChoice {
        name: String,
        value: String,
        choices: Vec<String>,
    },
}

/// Simulated state left the valid numeric domain, or shapes disagree.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RolloutError {
    #[error("Rollout diverged at step {step}: state {state:?}")]
    Divergence { step: usize, state: Vec<f64> },

    #[error("Dimension mismatch in {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        what: String,
        expected: usize,
        actual: usize,
    },
}

/// A surrogate failed to produce usable parameters.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrainingError {
    #[error("Insufficient training data: {message}")]
    InsufficientData { message: String },

    #[error("Training produced non-finite parameters")]
    NonFiniteParameters,

    #[error("Solver failed: {message}")]
    SolverFailed { message: String },

    #[error("Training rejected: {message}")]
    Rejected { message: String },
}

/// Structural problems with the search itself. Never retried.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SearchError {
    #[error("Invalid configuration space: {message}")]
    InvalidSpace { message: String },

    #[error("Configuration space has no hyperparameters")]
    EmptySpace,

    #[error("Optimizer exhausted its candidates after {completed} trials")]
    Exhausted { completed: usize },
}

/// Result type alias for surrotune operations
pub type TuneResult<T> = Result<T, TuneError>;

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::TuneError::Internal(format!($($arg)*))
    };
}

/// Macro for creating settings errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::TuneError::Config(format!($($arg)*))
    };
}
