//! Seq2seq training loop with per-epoch evaluation and checkpointing

use crate::collator::{Seq2SeqBatch, Seq2SeqCollator};
use crate::generator::Generator;
use candle_core::DType;
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use sumtune_core::error::{Error, Result};
use sumtune_core::training::{
    EpochMetrics, EvaluationStrategy, TokenizedDataset, TokenizedExample, TrainingCallback,
    TrainingConfig, TrainingSummary,
};
use sumtune_models::{
    masked_cross_entropy, perplexity, GenerationConfig, PeftModel, Seq2SeqLM, ToTuneResult,
};
use sumtune_utils::{ensure_dir, ProgressReporter};

/// Prefix of checkpoint directory names
pub const CHECKPOINT_PREFIX: &str = "checkpoint-";
/// Trainer state written into every checkpoint
pub const TRAINER_STATE_FILE: &str = "trainer_state.json";
/// Training arguments written into every checkpoint
pub const TRAINING_ARGS_FILE: &str = "training_args.json";

/// Metric function over generated ids and padded labels
pub type MetricFn<'a> = Box<dyn Fn(&[Vec<u32>], &[Vec<i64>]) -> Result<BTreeMap<String, f64>> + 'a>;

/// Contents of `trainer_state.json`
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    /// Optimizer steps taken
    pub global_step: usize,
    /// Completed epochs
    pub epoch: usize,
    /// Metrics of every completed epoch
    pub log_history: Vec<EpochMetrics>,
}

/// Result of an evaluation pass
#[derive(Clone, Debug, Default)]
pub struct EvalOutput {
    /// Mean loss over evaluation batches
    pub loss: f32,
    /// Generated ids, one row per example
    pub predictions: Vec<Vec<u32>>,
    /// Labels padded with -100, one row per example
    pub labels: Vec<Vec<i64>>,
    /// Values returned by the metric function
    pub metrics: BTreeMap<String, f64>,
}

/// Trains the adapter of a [`PeftModel`]
pub struct Seq2SeqTrainer<'a> {
    model: PeftModel,
    config: TrainingConfig,
    collator: Seq2SeqCollator,
    generator: Generator,
    train_dataset: TokenizedDataset,
    eval_dataset: Option<TokenizedDataset>,
    compute_metrics: Option<MetricFn<'a>>,
    callbacks: Vec<Box<dyn TrainingCallback + 'a>>,
    state: TrainerState,
}

impl<'a> Seq2SeqTrainer<'a> {
    /// Create a trainer
    pub fn new(
        model: PeftModel,
        config: TrainingConfig,
        collator: Seq2SeqCollator,
        train_dataset: TokenizedDataset,
    ) -> Self {
        let generator = Generator::new(
            &GenerationConfig::from_model_config(model.config())
                .with_max_new_tokens(config.generation_max_new_tokens),
        );
        Self {
            model,
            config,
            collator,
            generator,
            train_dataset,
            eval_dataset: None,
            compute_metrics: None,
            callbacks: Vec::new(),
            state: TrainerState::default(),
        }
    }

    /// Evaluate on `dataset` at the end of every epoch
    pub fn with_eval_dataset(mut self, dataset: TokenizedDataset) -> Self {
        self.eval_dataset = Some(dataset);
        self
    }

    /// Metric function applied to generated predictions
    pub fn with_compute_metrics<F>(mut self, f: F) -> Self
    where
        F: Fn(&[Vec<u32>], &[Vec<i64>]) -> Result<BTreeMap<String, f64>> + 'a,
    {
        self.compute_metrics = Some(Box::new(f));
        self
    }

    /// Register a callback
    pub fn with_callback(mut self, callback: impl TrainingCallback + 'a) -> Self {
        self.callbacks.push(Box::new(callback));
        self
    }

    /// Model being trained
    pub fn model(&self) -> &PeftModel {
        &self.model
    }

    /// Training configuration
    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// State after the last completed epoch
    pub fn state(&self) -> &TrainerState {
        &self.state
    }

    /// Hand back the trained model
    pub fn into_model(self) -> PeftModel {
        self.model
    }

    /// Run the full training loop
    pub fn train(&mut self) -> Result<TrainingSummary> {
        self.config.validate()?;
        if self.train_dataset.is_empty() {
            return Err(Error::Training("training dataset is empty".to_string()));
        }
        if self.config.push_to_hub {
            tracing::warn!("push_to_hub is ignored during training; publish the stored model instead");
        }

        let batch_size = self.config.per_device_train_batch_size;
        let epochs = self.config.num_train_epochs;
        let steps_per_epoch = self.train_dataset.len().div_ceil(batch_size);
        let total_steps = steps_per_epoch * epochs;

        let params = ParamsAdamW {
            lr: self.config.learning_rate,
            weight_decay: self.config.weight_decay,
            ..Default::default()
        };
        let mut optimizer = AdamW::new(self.model.trainable_vars(), params).tune_result()?;
        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        for callback in &self.callbacks {
            callback.on_train_begin(&self.config, self.train_dataset.len());
        }

        let start = Instant::now();
        let mut last_checkpoint = None;
        self.state = TrainerState::default();

        for epoch in 0..epochs {
            for callback in &self.callbacks {
                callback.on_epoch_begin(epoch, epochs);
            }

            let mut order: Vec<usize> = (0..self.train_dataset.len()).collect();
            order.shuffle(&mut rng);

            let mut progress = ProgressReporter::new(format!("epoch {}", epoch + 1), steps_per_epoch)
                .with_interval(self.config.logging_steps);
            let mut loss_sum = 0.0f32;

            for chunk in order.chunks(batch_size) {
                let examples: Vec<&TokenizedExample> =
                    chunk.iter().filter_map(|&i| self.train_dataset.get(i)).collect();
                let batch = self.collator.collate(&examples, self.model.device())?;
                let loss = self.batch_loss(&batch, true)?;
                let loss_value = loss.to_dtype(DType::F32).and_then(|l| l.to_scalar::<f32>()).tune_result()?;
                if !loss_value.is_finite() {
                    return Err(Error::Training(format!(
                        "loss became {} at step {}",
                        loss_value,
                        self.state.global_step + 1
                    )));
                }

                optimizer.backward_step(&loss).tune_result()?;
                self.state.global_step += 1;
                let lr = self.config.lr_schedule.learning_rate(
                    self.config.learning_rate,
                    self.state.global_step,
                    total_steps,
                );
                optimizer.set_learning_rate(lr);
                loss_sum += loss_value;

                for callback in &self.callbacks {
                    callback.on_step_end(self.state.global_step, loss_value, lr);
                }
                progress.inc(1);
            }
            progress.finish();

            let mut metrics = EpochMetrics {
                epoch,
                global_step: self.state.global_step,
                train_loss: loss_sum / steps_per_epoch.max(1) as f32,
                learning_rate: optimizer.learning_rate(),
                ..Default::default()
            };

            if self.config.evaluation_strategy == EvaluationStrategy::Epoch && self.eval_dataset.is_some() {
                let eval = self.evaluate()?;
                metrics.eval_loss = Some(eval.loss);
                metrics.eval_metrics = eval.metrics;
            }

            self.state.epoch = epoch + 1;
            self.state.log_history.push(metrics.clone());
            for callback in &self.callbacks {
                callback.on_epoch_end(&metrics);
            }

            let checkpoint = self.save_checkpoint()?;
            for callback in &self.callbacks {
                callback.on_save(&checkpoint);
            }
            last_checkpoint = Some(checkpoint);
        }

        let summary = TrainingSummary {
            epochs: self.state.log_history.clone(),
            global_step: self.state.global_step,
            train_samples: self.train_dataset.len(),
            eval_samples: self.eval_dataset.as_ref().map(TokenizedDataset::len).unwrap_or(0),
            trainable_params: self.model.trainable_parameters(),
            total_params: self.model.total_parameters(),
            training_duration_secs: start.elapsed().as_secs_f64(),
            last_checkpoint,
            finished_at: chrono::Utc::now(),
        };

        for callback in &self.callbacks {
            callback.on_train_end(&summary);
        }
        Ok(summary)
    }

    /// Loss, predictions and metrics over the evaluation dataset
    pub fn evaluate(&self) -> Result<EvalOutput> {
        let dataset = self
            .eval_dataset
            .as_ref()
            .ok_or_else(|| Error::Training("no evaluation dataset".to_string()))?;
        if dataset.is_empty() {
            return Err(Error::Training("evaluation dataset is empty".to_string()));
        }

        let mut output = EvalOutput::default();
        let mut loss_sum = 0.0f32;
        let mut batches = 0usize;

        let examples: Vec<&TokenizedExample> = dataset.iter().collect();
        for chunk in examples.chunks(self.config.per_device_eval_batch_size.max(1)) {
            let batch = self.collator.collate(chunk, self.model.device())?;
            loss_sum += self
                .batch_loss(&batch, false)?
                .to_dtype(DType::F32)
                .and_then(|l| l.to_scalar::<f32>())
                .tune_result()?;
            batches += 1;

            if self.config.predict_with_generate {
                output.predictions.extend(self.generator.generate(
                    &self.model,
                    &batch.input_ids,
                    &batch.attention_mask,
                )?);
                output.labels.extend(batch.labels.to_vec2::<i64>().tune_result()?);
            }
        }
        output.loss = loss_sum / batches.max(1) as f32;

        if let (true, Some(metric_fn)) = (self.config.predict_with_generate, &self.compute_metrics) {
            output.metrics = metric_fn(&output.predictions, &output.labels)?;
        }
        tracing::info!(
            eval_loss = output.loss,
            perplexity = perplexity(output.loss),
            "Evaluation finished: {:?}",
            output.metrics
        );
        Ok(output)
    }

    fn batch_loss(&self, batch: &Seq2SeqBatch, train: bool) -> Result<candle_core::Tensor> {
        let logits = self
            .model
            .forward(&batch.input_ids, &batch.attention_mask, &batch.decoder_input_ids, train)
            .tune_result()?;
        masked_cross_entropy(&logits, &batch.labels).tune_result()
    }

    fn save_checkpoint(&self) -> Result<PathBuf> {
        let dir = self
            .config
            .output_dir
            .join(format!("{}{}", CHECKPOINT_PREFIX, self.state.global_step));
        ensure_dir(&dir)?;

        self.model.save_pretrained(&dir)?;
        std::fs::write(dir.join(TRAINER_STATE_FILE), serde_json::to_string_pretty(&self.state)?)?;
        self.config.save_json(dir.join(TRAINING_ARGS_FILE))?;
        tracing::info!("Saved checkpoint {}", dir.display());

        if let Some(limit) = self.config.save_total_limit {
            for removed in rotate_checkpoints(&self.config.output_dir, limit)? {
                tracing::debug!("Removed checkpoint {}", removed.display());
            }
        }
        Ok(dir)
    }
}

/// Checkpoint directories under `output_dir`, oldest step first
pub fn list_checkpoints(output_dir: impl AsRef<Path>) -> Result<Vec<(usize, PathBuf)>> {
    let output_dir = output_dir.as_ref();
    if !output_dir.exists() {
        return Ok(Vec::new());
    }

    let mut checkpoints = Vec::new();
    for entry in std::fs::read_dir(output_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let step = name
            .to_str()
            .and_then(|n| n.strip_prefix(CHECKPOINT_PREFIX))
            .and_then(|s| s.parse::<usize>().ok());
        if let Some(step) = step {
            checkpoints.push((step, entry.path()));
        }
    }
    checkpoints.sort();
    Ok(checkpoints)
}

/// Delete the oldest checkpoints so that at most `limit` remain
pub fn rotate_checkpoints(output_dir: impl AsRef<Path>, limit: usize) -> Result<Vec<PathBuf>> {
    let checkpoints = list_checkpoints(output_dir)?;
    let excess = checkpoints.len().saturating_sub(limit);
    let mut removed = Vec::with_capacity(excess);
    for (_, path) in checkpoints.into_iter().take(excess) {
        std::fs::remove_dir_all(&path)?;
        removed.push(path);
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use sumtune_core::training::LoRAConfig;
    use sumtune_models::{get_peft_model, Seq2SeqConfig, Seq2SeqModel};

    fn dataset(n: usize) -> TokenizedDataset {
        (0..n)
            .map(|i| {
                let w = 4 + (i % 10) as u32;
                TokenizedExample::new(vec![0, w, w + 1, 2], vec![0, w.into(), 2])
            })
            .collect()
    }

    fn peft() -> PeftModel {
        let model = Seq2SeqModel::random(Seq2SeqConfig::tiny(16), &Device::Cpu).unwrap();
        get_peft_model(model, LoRAConfig::default().with_dropout(0.0)).unwrap()
    }

    #[derive(Default)]
    struct Counter {
        steps: AtomicUsize,
        saves: AtomicUsize,
    }

    impl TrainingCallback for &Counter {
        fn on_step_end(&self, _global_step: usize, _loss: f32, _learning_rate: f64) {
            self.steps.fetch_add(1, Ordering::SeqCst);
        }

        fn on_save(&self, _checkpoint: &Path) {
            self.saves.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_train_runs_and_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrainingConfig::new()
            .with_output_dir(dir.path())
            .with_num_epochs(2)
            .with_seed(7)
            .with_generation_max_new_tokens(4)
            .with_save_total_limit(Some(1));
        let model = peft();
        let collator = Seq2SeqCollator::from_config(model.config());
        let counter = Counter::default();

        let mut trainer = Seq2SeqTrainer::new(model, config, collator, dataset(7))
            .with_eval_dataset(dataset(2))
            .with_compute_metrics(|preds, labels| {
                assert_eq!(preds.len(), labels.len());
                Ok(BTreeMap::from([("rows".to_string(), preds.len() as f64)]))
            })
            .with_callback(&counter);
        let summary = trainer.train().unwrap();

        assert_eq!(summary.global_step, 6);
        assert_eq!(summary.epochs.len(), 2);
        assert_eq!(counter.steps.load(Ordering::SeqCst), 6);
        assert_eq!(counter.saves.load(Ordering::SeqCst), 2);
        assert_eq!(summary.final_eval_metrics().unwrap()["rows"], 2.0);
        assert!(summary.epochs.iter().all(|e| e.train_loss.is_finite()));

        let remaining = list_checkpoints(dir.path()).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].0, 6);
        assert!(remaining[0].1.join(TRAINER_STATE_FILE).exists());
        assert!(remaining[0].1.join(TRAINING_ARGS_FILE).exists());
        assert_eq!(summary.last_checkpoint.as_deref(), Some(remaining[0].1.as_path()));
    }

    #[test]
    fn test_empty_train_dataset_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let model = peft();
        let collator = Seq2SeqCollator::from_config(model.config());
        let config = TrainingConfig::new().with_output_dir(dir.path());
        let mut trainer = Seq2SeqTrainer::new(model, config, collator, TokenizedDataset::new());
        assert!(trainer.train().is_err());
    }

    #[test]
    fn test_evaluate_without_dataset_is_an_error() {
        let model = peft();
        let collator = Seq2SeqCollator::from_config(model.config());
        let trainer = Seq2SeqTrainer::new(model, TrainingConfig::new(), collator, dataset(3));
        assert!(trainer.evaluate().is_err());
    }

    #[test]
    fn test_rotate_checkpoints_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        for step in [3, 12, 6, 9] {
            std::fs::create_dir_all(dir.path().join(format!("checkpoint-{}", step))).unwrap();
        }
        std::fs::create_dir_all(dir.path().join("logs")).unwrap();

        let removed = rotate_checkpoints(dir.path(), 2).unwrap();
        assert_eq!(removed.len(), 2);

        let steps: Vec<usize> = list_checkpoints(dir.path())
            .unwrap()
            .into_iter()
            .map(|(s, _)| s)
            .collect();
        assert_eq!(steps, vec![9, 12]);
        assert!(dir.path().join("logs").exists());
    }

    #[test]
    fn test_list_checkpoints_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(list_checkpoints(dir.path().join("absent")).unwrap().is_empty());
    }
}
