use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One summary record, written as a JSON line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepMetrics {
    pub step: usize,
    pub loss: f64,
    pub grad_norm: f64,
    pub lr: f64,
}

pub fn perplexity(loss: f64) -> f64 {
    loss.exp()
}

/// Console report line for one training iteration.
pub fn report(elapsed: Duration, epoch: usize, iteration: usize, lr: f64, loss: f64) {
    tracing::info!(
        "[Train] [Time: {:.1}s] [Epoch: {}] [Iteration: {}] [lr: {}] [Loss: {:.4}] [Perplexity: {:.4}]",
        elapsed.as_secs_f64(),
        epoch,
        iteration,
        lr,
        loss,
        perplexity(loss),
    );
}

/// Appends `StepMetrics` to `<dir>/<model_name>.jsonl`.
pub struct MetricsLogger {
    path: PathBuf,
}

impl MetricsLogger {
    pub fn new(dir: impl AsRef<Path>, model_name: &str) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{model_name}.jsonl"));
        if !path.exists() {
            File::create(&path)?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log(&self, metrics: &StepMetrics) -> Result<()> {
        let mut f = OpenOptions::new().append(true).open(&self.path)?;
        writeln!(f, "{}", serde_json::to_string(metrics)?)?;
        Ok(())
    }

    /// Like `log`, but a failed write is only reported.
    pub fn log_best_effort(&self, metrics: &StepMetrics) {
        if let Err(e) = self.log(metrics) {
            tracing::warn!("skipping summary for step {}: {e}", metrics.step);
        }
    }
}
