//! Fine-tuning orchestration: load, preprocess, train, persist and publish

use crate::config::OrchestratorOptions;
use crate::publish::HubPublisher;
use std::collections::BTreeMap;
use std::path::Path;
use sumtune_core::data::{load_table, PromptTemplate, TuningTable, CONTENT, PROMPT, REFERENCE_SUMMARY};
use sumtune_core::error::{Error, Result};
use sumtune_core::hub::{resolve_endpoint, HubCredentials};
use sumtune_core::metrics::compute_summarization_metrics;
use sumtune_core::training::{
    LoRAConfig, LoggingCallback, TokenizedDataset, TrainingConfig, TrainingSummary,
    MAX_SEQUENCE_LENGTH,
};
use sumtune_inference::{Seq2SeqCollator, Seq2SeqTrainer};
use sumtune_models::{
    try_get_peft_model, GenerationConfig, HFTokenizerWrapper, ModelLoader, PeftModel, Seq2SeqLM,
    Seq2SeqModel,
};
use sumtune_utils::{dir_size, format_bytes};

/// Sub-directory receiving the model weights
pub const MODEL_DIR: &str = "model";
/// Sub-directory receiving the generation config
pub const CONFIG_DIR: &str = "config";
/// Sub-directory receiving the tokenizer
pub const TOKENIZER_DIR: &str = "tokenizer";
/// Generation config file name
pub const GEN_CONFIG_FILE: &str = "gen_config.json";

/// The model currently held by an orchestrator
#[derive(Debug)]
pub enum HeldModel {
    /// Pretrained model without adapters
    Base(Seq2SeqModel),
    /// Model wrapped with LoRA adapters
    Adapted(PeftModel),
}

impl HeldModel {
    /// The model as a generic seq2seq LM
    pub fn as_lm(&self) -> &dyn Seq2SeqLM {
        match self {
            Self::Base(model) => model,
            Self::Adapted(model) => model,
        }
    }

    /// Underlying base model
    pub fn base(&self) -> &Seq2SeqModel {
        match self {
            Self::Base(model) => model,
            Self::Adapted(model) => model.base_model(),
        }
    }

    /// Adapter wrapper, once attached
    pub fn adapter(&self) -> Option<&PeftModel> {
        match self {
            Self::Base(_) => None,
            Self::Adapted(model) => Some(model),
        }
    }

    /// Whether adapters are attached
    pub fn is_adapted(&self) -> bool {
        matches!(self, Self::Adapted(_))
    }

    /// Write weights into `dir`: full weights for a base model, adapter files otherwise
    pub fn save_pretrained(&self, dir: impl AsRef<Path>) -> Result<()> {
        match self {
            Self::Base(model) => model.save_pretrained(dir),
            Self::Adapted(model) => model.save_pretrained(dir),
        }
    }
}

/// Holds one model/tokenizer pair and drives it through fine-tuning
#[derive(Debug)]
pub struct FineTuningOrchestrator {
    checkpoint: String,
    model: Option<HeldModel>,
    tokenizer: HFTokenizerWrapper,
    collator: Seq2SeqCollator,
    lora_config: LoRAConfig,
    training_config: TrainingConfig,
    prompt: PromptTemplate,
}

impl FineTuningOrchestrator {
    /// Load `checkpoint` (local directory or hub id) with the standard settings
    pub fn new(checkpoint: &str) -> Result<Self> {
        Self::with_options(checkpoint, OrchestratorOptions::default())
    }

    /// Load `checkpoint` with explicit options
    pub fn with_options(checkpoint: &str, options: OrchestratorOptions) -> Result<Self> {
        let token = match options.token.clone() {
            Some(token) => Some(token),
            None => HubCredentials::from_env().read_token,
        };
        let loader = ModelLoader::new()
            .with_token(token)
            .with_device(&options.device)
            .with_dtype(&options.dtype);

        tracing::info!("Loading {}", checkpoint);
        let (model, tokenizer) = loader.load(checkpoint)?;
        tracing::debug!("{:?}", model.config());
        Ok(Self::assemble(checkpoint, model, tokenizer, options))
    }

    /// Assemble from an already loaded model and tokenizer
    pub fn from_parts(checkpoint: &str, model: Seq2SeqModel, tokenizer: HFTokenizerWrapper) -> Self {
        Self::assemble(checkpoint, model, tokenizer, OrchestratorOptions::default())
    }

    fn assemble(
        checkpoint: &str,
        model: Seq2SeqModel,
        tokenizer: HFTokenizerWrapper,
        options: OrchestratorOptions,
    ) -> Self {
        let collator = Seq2SeqCollator::from_config(model.config());
        let lora_config = options.lora.with_base_model(checkpoint);
        Self {
            checkpoint: checkpoint.to_string(),
            model: Some(HeldModel::Base(model)),
            tokenizer,
            collator,
            lora_config,
            training_config: options.training,
            prompt: options.prompt,
        }
    }

    /// Replace the trainer arguments
    pub fn with_training_config(mut self, config: TrainingConfig) -> Self {
        self.training_config = config;
        self
    }

    /// Replace the adapter configuration
    pub fn with_lora_config(mut self, config: LoRAConfig) -> Self {
        self.lora_config = config.with_base_model(self.checkpoint.clone());
        self
    }

    /// Checkpoint this orchestrator was built from
    pub fn checkpoint(&self) -> &str {
        &self.checkpoint
    }

    /// The held model
    pub fn model(&self) -> Result<&HeldModel> {
        self.model
            .as_ref()
            .ok_or_else(|| Error::ModelLoading("no model is held".to_string()))
    }

    /// The held tokenizer
    pub fn tokenizer(&self) -> &HFTokenizerWrapper {
        &self.tokenizer
    }

    /// Adapter configuration
    pub fn lora_config(&self) -> &LoRAConfig {
        &self.lora_config
    }

    /// Trainer arguments
    pub fn training_config(&self) -> &TrainingConfig {
        &self.training_config
    }

    /// Read tuning data from a spreadsheet, JSON or JSON lines file
    pub fn load_tuning_data(&self, path: impl AsRef<Path>) -> Result<TuningTable> {
        load_table(path)
    }

    /// Longest prompt or label kept after tokenization
    pub fn max_length(&self) -> Result<usize> {
        Ok(MAX_SEQUENCE_LENGTH.min(self.model()?.as_lm().config().max_source_positions()))
    }

    /// Reduce `table` to content, reference summary and prompt, then tokenize it.
    ///
    /// The cleaned table replaces the caller's table before tokenization starts.
    pub fn preprocess(&self, table: &mut TuningTable) -> Result<TokenizedDataset> {
        let mut cleaned = table.select(&[CONTENT, REFERENCE_SUMMARY])?;
        let prompts = cleaned
            .column(CONTENT)?
            .into_iter()
            .map(|content| content.map(|c| self.prompt.render(c)))
            .collect();
        cleaned.set_column(PROMPT, prompts)?;
        *table = cleaned;

        let examples = table.examples()?;
        let prompts = table.column(PROMPT)?;
        let rows = prompts
            .into_iter()
            .zip(&examples)
            .map(|(prompt, example)| {
                prompt
                    .map(|p| (p, example))
                    .ok_or_else(|| Error::Validation("row without a prompt".to_string()))
            })
            .collect::<Result<Vec<_>>>()?;

        let dataset = TokenizedDataset::from_prompts(&self.tokenizer, rows, self.max_length()?)?;
        tracing::info!("Tokenized {} examples", dataset.len());
        Ok(dataset)
    }

    /// ROUGE scores and mean generated length for generated ids against labels
    pub fn compute_metrics(
        &self,
        predictions: &[Vec<u32>],
        labels: &[Vec<i64>],
    ) -> Result<BTreeMap<String, f64>> {
        compute_summarization_metrics(&self.tokenizer, predictions, labels)
    }

    /// Split, attach the adapter and train, evaluating every epoch.
    ///
    /// The trained adapter model replaces the held model, also when training fails.
    /// When the adapter cannot be attached the base model stays in place.
    pub fn split_and_train(&mut self, dataset: &TokenizedDataset, test_size: f64) -> Result<TrainingSummary> {
        let split = dataset.train_test_split(test_size, self.training_config.seed)?;
        tracing::info!("Split into {} train and {} test examples", split.train.len(), split.test.len());

        let peft = self.attach_adapter()?;
        peft.print_trainable_parameters();

        let tokenizer = &self.tokenizer;
        let mut trainer = Seq2SeqTrainer::new(peft, self.training_config.clone(), self.collator, split.train)
            .with_eval_dataset(split.test)
            .with_compute_metrics(move |predictions, labels| {
                compute_summarization_metrics(tokenizer, predictions, labels)
            })
            .with_callback(LoggingCallback::new(self.training_config.logging_steps));

        let result = trainer.train();
        self.model = Some(HeldModel::Adapted(trainer.into_model()));
        result
    }

    /// [`preprocess`](Self::preprocess) followed by [`split_and_train`](Self::split_and_train)
    pub fn perform_fine_tuning(&mut self, table: &mut TuningTable, test_size: f64) -> Result<TrainingSummary> {
        let dataset = self.preprocess(table)?;
        self.split_and_train(&dataset, test_size)
    }

    fn attach_adapter(&mut self) -> Result<PeftModel> {
        match self.model.take() {
            Some(HeldModel::Base(model)) => match try_get_peft_model(model, self.lora_config.clone()) {
                Ok(peft) => Ok(peft),
                Err((e, model)) => {
                    self.model = Some(HeldModel::Base(model));
                    Err(e)
                }
            },
            Some(HeldModel::Adapted(peft)) => {
                tracing::warn!("Adapters already attached, continuing to train them");
                Ok(peft)
            }
            None => Err(Error::ModelLoading("no model is held".to_string())),
        }
    }

    /// Persist the model, generation config and tokenizer under `path`
    pub fn store_fine_tuned_model(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let model = self.model()?;
        model.save_pretrained(path.join(MODEL_DIR))?;
        GenerationConfig::from_model_config(model.as_lm().config())
            .save_pretrained(path.join(CONFIG_DIR), GEN_CONFIG_FILE)?;
        self.tokenizer.save_pretrained(path.join(TOKENIZER_DIR))?;
        tracing::info!(
            "Stored fine-tuned model in {} ({} of weights)",
            path.display(),
            format_bytes(dir_size(path.join(MODEL_DIR))?)
        );
        Ok(())
    }

    /// Publish the model and then the tokenizer to `remote_name` as two commits.
    ///
    /// A failure after the first commit leaves the model files in place.
    pub fn push_to_hub(&self, remote_name: &str, credential: &str) -> Result<()> {
        let publisher = HubPublisher::new(resolve_endpoint(), credential)?;
        self.push_with(&publisher, remote_name)
    }

    /// Publish through an existing publisher
    pub fn push_with(&self, publisher: &HubPublisher, remote_name: &str) -> Result<()> {
        let staging = tempfile::tempdir()?;
        let model_dir = staging.path().join(MODEL_DIR);
        let tokenizer_dir = staging.path().join(TOKENIZER_DIR);
        self.model()?.save_pretrained(&model_dir)?;
        self.tokenizer.save_pretrained(&tokenizer_dir)?;

        publisher.create_repo(remote_name)?;
        let n = publisher.upload_folder(remote_name, &model_dir, "Upload model")?;
        tracing::info!("Pushed {} model files to {}", n, remote_name);
        let n = publisher.upload_folder(remote_name, &tokenizer_dir, "Upload tokenizer")?;
        tracing::info!("Pushed {} tokenizer files to {}", n, remote_name);
        Ok(())
    }
}
