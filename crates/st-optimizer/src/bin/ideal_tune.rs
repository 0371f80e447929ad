//! Tune an MPC pipeline against a surrogate ensemble with the model frozen.
//!
//! Usage: `ideal-tune [experiment.json]`. `SURROTUNE_*` variables override
//! values from the file; `RUST_LOG` controls verbosity.

use anyhow::{Context, Result};
use std::env;
use tracing::info;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

use st_optimizer::{run_ideal_tune, ExperimentConfig, TrialOutcome};

fn enable_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_span_events(FmtSpan::CLOSE)
        .try_init();
}

fn main() -> Result<()> {
    enable_tracing();

    let config = match env::args().nth(1) {
        Some(path) => ExperimentConfig::from_file(&path)
            .with_context(|| format!("failed to load experiment config {path}"))?,
        None => ExperimentConfig::default(),
    };
    let config = config
        .with_env_overrides()
        .context("invalid SURROTUNE_* override")?;
    info!(
        name = %config.name,
        benchmark = ?config.benchmark,
        budget = config.budget,
        ensemble_size = config.evaluator.ensemble_size,
        seed = config.seed,
        "Starting ideal tune"
    );

    let outcome = run_ideal_tune(&config).context("tuning run failed")?;

    println!("Trials: {} ({} failed)", outcome.history.len(), outcome.status.trials_failed);
    if let Some(best) = &outcome.incumbent {
        println!("Incumbent: trial {} with cost {:.6}", best.index, best.cost);
        if let Some(true_cost) = best.true_cost() {
            println!("Incumbent true dynamics cost: {true_cost:.6}");
        }
        println!("{}", best.configuration);
    }
    match &outcome.baseline.outcome {
        TrialOutcome::Failed { error } => println!("Baseline failed: {error}"),
        TrialOutcome::Evaluated(_) => {
            println!("Baseline cost: {:.6}", outcome.baseline.cost);
            if let Some(true_cost) = outcome.baseline.true_cost() {
                println!("Baseline true dynamics cost: {true_cost:.6}");
            }
        }
    }
    if let Some(path) = &config.output_path {
        println!("Full outcome written to {}", path.display());
    }
    Ok(())
}
