use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use st_types::TuneResult;

use crate::evaluator::EvaluationResult;

/// Append-only text log with one block per evaluated trial.
///
/// Each block is formatted in full before the file lock is taken and written
/// with a single call, so concurrent trials never interleave within a block.
#[derive(Debug)]
pub struct DiagnosticLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl DiagnosticLog {
    pub fn open<P: AsRef<Path>>(path: P) -> TuneResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, block: &str) -> TuneResult<()> {
        let mut file = self.file.lock();
        file.write_all(block.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub fn record(&self, result: &EvaluationResult) -> TuneResult<()> {
        self.append(&format_block(result))
    }
}

fn score(value: Option<f64>) -> String {
    value.map_or_else(|| "failed".to_string(), |v| v.to_string())
}

/// Render one trial's diagnostic block, terminated by a blank line.
pub fn format_block(result: &EvaluationResult) -> String {
    let surrogate: Vec<String> = result.surrogate_scores.iter().map(|s| score(*s)).collect();
    format!(
        "Trial {}\n{}Surrogate scores are [{}]\nMedian surrogate score is {}\nTrue dynamics score is {}\n==========\n\n",
        result.trial_index,
        result.configuration,
        surrogate.join(", "),
        score(result.surrogate_median),
        score(result.true_dynamics_score),
    )
}
