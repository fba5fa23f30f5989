//! Training progress: counters, running gradient-norm statistics and
//! validation, persisted as JSON next to the model.

use crate::training::grad_norm::NormStats;
use crate::training::unit::{Batch, ExecutionUnit};
use crate::utils::checkpoint::progress_path;
use crate::utils::error::{Result, TrainingError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// What the coordinator needs from the scheduler.
pub trait TrainingScheduler: Send {
    fn gradient_norm_stats(&self) -> NormStats;

    fn log_gradient_norm_stats(&self) -> NormStats;

    fn number_of_batches(&self) -> usize;

    /// Restore counters saved next to `model`; a missing file keeps a fresh state.
    fn load(&mut self, model: &Path) -> Result<()>;

    fn save(&self, model: &Path) -> Result<()>;

    /// Run all validators against the given units.
    fn validate(&mut self, units: &mut [Box<dyn ExecutionUnit>], is_final: bool) -> Result<()>;

    /// Account one finished update. `grad_norm` is per target word and
    /// without cost scaling; non-finite norms are not folded into the stats.
    fn update(&mut self, loss: f32, batch_size: usize, target_words: usize, grad_norm: Option<f32>);
}

/// Exponentially weighted mean and variance over a window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningStats {
    pub mean: f32,
    pub variance: f32,
}

impl RunningStats {
    /// Fold `value` in with `alpha = 2 / (min(window, seen) + 1)`.
    pub fn push(&mut self, value: f32, window: usize, seen: usize) {
        let alpha = 2.0 / (window.min(seen).max(1) as f32 + 1.0);
        let delta = value - self.mean;
        self.mean += alpha * delta;
        self.variance = (1.0 - alpha) * (self.variance + alpha * delta * delta);
    }
}

/// Serializable progress of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    pub batches: usize,
    pub samples: usize,
    pub labels: usize,
    pub loss_sum: f64,
    pub norm_window: usize,
    pub norms_seen: usize,
    pub gradient_norm: RunningStats,
    pub log_gradient_norm: RunningStats,
    #[serde(default)]
    pub validations: Vec<ValidationRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRecord {
    pub batches: usize,
    pub validator: String,
    pub value: f32,
    pub is_final: bool,
}

/// Scores a unit on held-out data, lower is better.
pub trait Validator: Send {
    fn name(&self) -> &str;

    fn validate(&mut self, unit: &mut dyn ExecutionUnit) -> Result<f32>;
}

/// Average loss per target word over fixed batches.
pub struct LossValidator {
    batches: Vec<Batch>,
}

impl LossValidator {
    pub fn new(batches: Vec<Batch>) -> Self {
        Self { batches }
    }
}

impl Validator for LossValidator {
    fn name(&self) -> &str {
        "ce-mean-words"
    }

    fn validate(&mut self, unit: &mut dyn ExecutionUnit) -> Result<f32> {
        let mut loss = 0.0f64;
        let mut words = 0usize;
        for batch in &self.batches {
            unit.build(batch)?;
            if let Some(l) = unit.forward()? {
                loss += l.to_dtype(candle_core::DType::F32)?.to_scalar::<f32>()? as f64;
                words += batch.target_words;
            }
        }
        unit.clear();
        if words == 0 {
            return Err(TrainingError::Training("validation set is empty".into()));
        }
        Ok((loss / words as f64) as f32)
    }
}

pub struct Scheduler {
    state: TrainingState,
    validators: Vec<Box<dyn Validator>>,
}

impl Scheduler {
    pub fn new(norm_window: usize) -> Self {
        Self {
            state: TrainingState {
                norm_window: norm_window.max(1),
                ..TrainingState::default()
            },
            validators: Vec::new(),
        }
    }

    pub fn with_validator(mut self, validator: Box<dyn Validator>) -> Self {
        self.validators.push(validator);
        self
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    fn stats(&self, running: RunningStats) -> NormStats {
        NormStats {
            window: self.state.norm_window,
            mean: running.mean,
            variance: running.variance,
        }
    }
}

impl TrainingScheduler for Scheduler {
    fn gradient_norm_stats(&self) -> NormStats {
        self.stats(self.state.gradient_norm)
    }

    fn log_gradient_norm_stats(&self) -> NormStats {
        self.stats(self.state.log_gradient_norm)
    }

    fn number_of_batches(&self) -> usize {
        self.state.batches
    }

    fn load(&mut self, model: &Path) -> Result<()> {
        let path = progress_path(model);
        if !path.exists() {
            debug!(progress = %path.display(), "No training progress found, starting fresh");
            return Ok(());
        }
        let content = fs::read_to_string(&path)?;
        let window = self.state.norm_window;
        self.state = serde_json::from_str(&content).map_err(|e| {
            TrainingError::Checkpoint(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        if self.state.norm_window == 0 {
            self.state.norm_window = window;
        }
        info!(
            progress = %path.display(),
            batches = self.state.batches,
            labels = self.state.labels,
            "Restored training progress"
        );
        Ok(())
    }

    fn save(&self, model: &Path) -> Result<()> {
        let path = progress_path(model);
        let json = serde_json::to_string_pretty(&self.state).map_err(|e| {
            TrainingError::Checkpoint(format!("Failed to serialize progress: {}", e))
        })?;
        fs::write(&path, json)?;
        debug!(progress = %path.display(), batches = self.state.batches, "Saved training progress");
        Ok(())
    }

    fn validate(&mut self, units: &mut [Box<dyn ExecutionUnit>], is_final: bool) -> Result<()> {
        let Some(unit) = units.first_mut() else {
            return Ok(());
        };
        for validator in self.validators.iter_mut() {
            let value = validator.validate(unit.as_mut())?;
            info!(
                batches = self.state.batches,
                validator = validator.name(),
                value = value,
                is_final,
                "Validation"
            );
            self.state.validations.push(ValidationRecord {
                batches: self.state.batches,
                validator: validator.name().to_string(),
                value,
                is_final,
            });
        }
        Ok(())
    }

    fn update(&mut self, loss: f32, batch_size: usize, target_words: usize, grad_norm: Option<f32>) {
        let s = &mut self.state;
        s.batches += 1;
        s.samples += batch_size;
        s.labels += target_words;
        if loss.is_finite() {
            s.loss_sum += loss as f64;
        }

        if let Some(g) = grad_norm.filter(|g| g.is_finite() && *g > 0.0) {
            s.norms_seen += 1;
            s.gradient_norm.push(g, s.norm_window, s.norms_seen);
            s.log_gradient_norm.push(g.ln(), s.norm_window, s.norms_seen);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_running_stats_first_value() {
        let mut stats = RunningStats::default();
        stats.push(4.0, 100, 1);
        assert_eq!(stats.mean, 4.0);
        assert_eq!(stats.variance, 0.0);
        stats.push(4.0, 100, 2);
        assert_eq!(stats.mean, 4.0);
    }

    #[test]
    fn test_update_counts() {
        let mut s = Scheduler::new(10);
        s.update(2.0, 4, 40, Some(1.0));
        s.update(f32::NAN, 4, 40, Some(f32::NAN));
        assert_eq!(s.number_of_batches(), 2);
        assert_eq!(s.state().norms_seen, 1);
        assert_eq!(s.gradient_norm_stats().mean, 1.0);
        assert_eq!(s.log_gradient_norm_stats().mean, 0.0);
        assert_eq!(s.gradient_norm_stats().window, 10);
    }

    #[test]
    fn test_progress_round_trip() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let model = dir.path().join("model.safetensors");

        let mut s = Scheduler::new(10);
        s.update(2.0, 4, 40, Some(0.5));
        s.save(&model)?;

        let mut restored = Scheduler::new(10);
        restored.load(&model)?;
        assert_eq!(restored.state(), s.state());

        let mut fresh = Scheduler::new(10);
        fresh.load(&dir.path().join("other.safetensors"))?;
        assert_eq!(fresh.number_of_batches(), 0);
        Ok(())
    }
}
