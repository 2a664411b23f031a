//! Training configuration, progress callbacks and run summaries

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// When to run evaluation during training
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationStrategy {
    /// Never evaluate
    No,

    /// Evaluate at the end of every epoch
    #[default]
    Epoch,
}

/// Learning rate schedule
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LrSchedule {
    /// Decay linearly to zero over the whole run
    #[default]
    Linear,

    /// Keep the initial rate
    Constant,
}

impl LrSchedule {
    /// Learning rate after `step` optimizer steps out of `total_steps`
    pub fn learning_rate(&self, base_lr: f64, step: usize, total_steps: usize) -> f64 {
        match self {
            Self::Constant => base_lr,
            Self::Linear => {
                if total_steps == 0 {
                    return base_lr;
                }
                let remaining = total_steps.saturating_sub(step) as f64;
                base_lr * remaining / total_steps as f64
            }
        }
    }
}

/// Training configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Directory that receives `checkpoint-{step}` folders
    pub output_dir: PathBuf,

    /// When to evaluate
    pub evaluation_strategy: EvaluationStrategy,

    /// Initial learning rate
    pub learning_rate: f64,

    /// Training batch size
    pub per_device_train_batch_size: usize,

    /// Evaluation batch size
    pub per_device_eval_batch_size: usize,

    /// AdamW weight decay
    pub weight_decay: f64,

    /// Number of checkpoints kept on disk
    pub save_total_limit: Option<usize>,

    /// Number of epochs
    pub num_train_epochs: usize,

    /// Generate predictions during evaluation and hand them to the metric function
    pub predict_with_generate: bool,

    /// Push checkpoints to the hub while training
    pub push_to_hub: bool,

    /// Learning rate schedule
    pub lr_schedule: LrSchedule,

    /// Upper bound on generated tokens during evaluation
    pub generation_max_new_tokens: usize,

    /// Seed for shuffling and dropout; `None` draws from the thread rng
    pub seed: Option<u64>,

    /// Log the running loss every N optimizer steps
    pub logging_steps: usize,
}

impl TrainingConfig {
    /// Create a config with the standard fine-tuning values
    pub fn new() -> Self {
        Self {
            output_dir: PathBuf::from("models/"),
            evaluation_strategy: EvaluationStrategy::Epoch,
            learning_rate: 0.01,
            per_device_train_batch_size: 3,
            per_device_eval_batch_size: 3,
            weight_decay: 0.005,
            save_total_limit: Some(3),
            num_train_epochs: 4,
            predict_with_generate: true,
            push_to_hub: false,
            lr_schedule: LrSchedule::Linear,
            generation_max_new_tokens: 128,
            seed: None,
            logging_steps: 10,
        }
    }

    /// Set learning rate
    pub fn with_learning_rate(mut self, lr: f64) -> Self {
        self.learning_rate = lr;
        self
    }

    /// Set both batch sizes
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.per_device_train_batch_size = batch_size;
        self.per_device_eval_batch_size = batch_size;
        self
    }

    /// Set number of epochs
    pub fn with_num_epochs(mut self, num_epochs: usize) -> Self {
        self.num_train_epochs = num_epochs;
        self
    }

    /// Set output directory
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Set checkpoint limit
    pub fn with_save_total_limit(mut self, limit: Option<usize>) -> Self {
        self.save_total_limit = limit;
        self
    }

    /// Set seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Set generation length used during evaluation
    pub fn with_generation_max_new_tokens(mut self, n: usize) -> Self {
        self.generation_max_new_tokens = n;
        self
    }

    /// Set evaluation strategy
    pub fn with_evaluation_strategy(mut self, strategy: EvaluationStrategy) -> Self {
        self.evaluation_strategy = strategy;
        self
    }

    /// Check the configuration
    pub fn validate(&self) -> Result<()> {
        if self.per_device_train_batch_size == 0 || self.per_device_eval_batch_size == 0 {
            return Err(Error::Configuration("batch sizes must be positive".to_string()));
        }
        if self.num_train_epochs == 0 {
            return Err(Error::Configuration("num_train_epochs must be positive".to_string()));
        }
        if self.learning_rate.is_nan() || self.learning_rate <= 0.0 {
            return Err(Error::Configuration(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if self.save_total_limit == Some(0) {
            return Err(Error::Configuration(
                "save_total_limit must be at least 1 when set".to_string(),
            ));
        }
        Ok(())
    }

    /// Load from JSON file
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Save to JSON file
    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), data)?;
        Ok(())
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Metrics for a single epoch
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// Zero-based epoch index
    pub epoch: usize,
    /// Optimizer steps taken so far
    pub global_step: usize,
    /// Mean training loss over the epoch
    pub train_loss: f32,
    /// Mean evaluation loss, if evaluated
    pub eval_loss: Option<f32>,
    /// Metric values returned by the metric function
    pub eval_metrics: BTreeMap<String, f64>,
    /// Learning rate at the end of the epoch
    pub learning_rate: f64,
}

/// Outcome of a training run
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrainingSummary {
    /// Per-epoch metrics, in order
    pub epochs: Vec<EpochMetrics>,
    /// Total optimizer steps
    pub global_step: usize,
    /// Number of training examples
    pub train_samples: usize,
    /// Number of evaluation examples
    pub eval_samples: usize,
    /// Trainable parameter count
    pub trainable_params: usize,
    /// Total parameter count
    pub total_params: usize,
    /// Wall-clock duration
    pub training_duration_secs: f64,
    /// Last checkpoint written, if any
    pub last_checkpoint: Option<PathBuf>,
    /// When the run finished
    pub finished_at: chrono::DateTime<chrono::Utc>,
}

impl TrainingSummary {
    /// Training loss of the last epoch
    pub fn final_train_loss(&self) -> Option<f32> {
        self.epochs.last().map(|e| e.train_loss)
    }

    /// Metrics of the last evaluated epoch
    pub fn final_eval_metrics(&self) -> Option<&BTreeMap<String, f64>> {
        self.epochs
            .iter()
            .rev()
            .find(|e| e.eval_loss.is_some())
            .map(|e| &e.eval_metrics)
    }
}

/// Training progress callback
#[allow(unused_variables)]
pub trait TrainingCallback: Send + Sync {
    /// Called at the start of training
    fn on_train_begin(&self, config: &TrainingConfig, train_samples: usize) {}

    /// Called at the start of each epoch
    fn on_epoch_begin(&self, epoch: usize, total_epochs: usize) {}

    /// Called after each optimizer step
    fn on_step_end(&self, global_step: usize, loss: f32, learning_rate: f64) {}

    /// Called at the end of each epoch, after evaluation
    fn on_epoch_end(&self, metrics: &EpochMetrics) {}

    /// Called after a checkpoint was written
    fn on_save(&self, checkpoint: &Path) {}

    /// Called when training completes
    fn on_train_end(&self, summary: &TrainingSummary) {}
}

/// Logging callback
#[derive(Debug, Clone)]
pub struct LoggingCallback {
    logging_steps: usize,
}

impl LoggingCallback {
    /// Log the loss every `logging_steps` steps
    pub fn new(logging_steps: usize) -> Self {
        Self {
            logging_steps: logging_steps.max(1),
        }
    }
}

impl Default for LoggingCallback {
    fn default() -> Self {
        Self::new(10)
    }
}

impl TrainingCallback for LoggingCallback {
    fn on_train_begin(&self, config: &TrainingConfig, train_samples: usize) {
        tracing::info!(
            train_samples,
            epochs = config.num_train_epochs,
            batch_size = config.per_device_train_batch_size,
            learning_rate = config.learning_rate,
            "Starting training"
        );
    }

    fn on_epoch_begin(&self, epoch: usize, total_epochs: usize) {
        tracing::info!("Starting epoch {}/{}", epoch + 1, total_epochs);
    }

    fn on_step_end(&self, global_step: usize, loss: f32, learning_rate: f64) {
        if global_step % self.logging_steps == 0 {
            tracing::info!(global_step, loss, learning_rate, "step");
        } else {
            tracing::debug!(global_step, loss, learning_rate, "step");
        }
    }

    fn on_epoch_end(&self, metrics: &EpochMetrics) {
        tracing::info!(
            "Epoch {}: loss={:.4}, eval_loss={}, metrics={:?}",
            metrics.epoch + 1,
            metrics.train_loss,
            metrics
                .eval_loss
                .map(|l| format!("{:.4}", l))
                .unwrap_or_else(|| "-".to_string()),
            metrics.eval_metrics
        );
    }

    fn on_save(&self, checkpoint: &Path) {
        tracing::info!("Saved checkpoint to {}", checkpoint.display());
    }

    fn on_train_end(&self, summary: &TrainingSummary) {
        tracing::info!(
            "Training complete after {} steps in {:.1}s. Final loss: {:.4}",
            summary.global_step,
            summary.training_duration_secs,
            summary.final_train_loss().unwrap_or(0.0)
        );
    }
}
