//! Parameter-efficient fine-tuning wrapper

use crate::candle_model::{Seq2SeqLM, ToTuneResult};
use crate::config::Seq2SeqConfig;
use crate::seq2seq::Seq2SeqModel;
use candle_core::{Device, Result as CandleResult, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use std::collections::HashMap;
use std::path::Path;
use sumtune_core::error::{Error, Result};
use sumtune_core::training::LoRAConfig;

/// Adapter weights file
pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";
/// Adapter configuration file
pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";

const ADAPTER_PREFIX: &str = "base_model.model";

/// A base model with LoRA adapters attached to its target projections.
///
/// The base weights stay frozen; only the adapter variables held in the
/// internal [`VarMap`] are trainable.
pub struct PeftModel {
    model: Seq2SeqModel,
    varmap: VarMap,
    config: LoRAConfig,
    adapted_modules: Vec<String>,
}

/// Attach adapters described by `config` to every projection whose module path
/// ends with one of the target names
pub fn get_peft_model(model: Seq2SeqModel, config: LoRAConfig) -> Result<PeftModel> {
    try_get_peft_model(model, config).map_err(|(e, _)| e)
}

/// Like [`get_peft_model`], but hands the base model back, without adapters,
/// when attachment fails
pub fn try_get_peft_model(
    mut model: Seq2SeqModel,
    config: LoRAConfig,
) -> std::result::Result<PeftModel, (Error, Seq2SeqModel)> {
    if let Err(e) = config.validate() {
        return Err((e, model));
    }

    let varmap = VarMap::new();
    let device = model.device().clone();
    let vb = VarBuilder::from_varmap(&varmap, model.dtype(), &device).pp(ADAPTER_PREFIX);

    let mut adapted_modules = Vec::new();
    let mut failure = None;
    for (path, projection) in model.projections_mut() {
        if !config.targets(&path) {
            continue;
        }
        if let Err(e) = projection.attach_adapter(&config, vb.pp(&path)) {
            failure = Some(Error::LoRA(format!("Failed to attach adapter to {}: {}", path, e)));
            break;
        }
        adapted_modules.push(path);
    }

    if failure.is_none() && adapted_modules.is_empty() {
        failure = Some(Error::LoRA(format!(
            "Target modules {:?} not found in the base model",
            config.target_modules
        )));
    }
    if let Some(e) = failure {
        model.detach_adapters();
        return Err((e, model));
    }

    tracing::debug!("Attached LoRA adapters to {} modules", adapted_modules.len());
    Ok(PeftModel {
        model,
        varmap,
        config,
        adapted_modules,
    })
}

impl PeftModel {
    /// Attach the adapter saved in `dir` to `model`
    pub fn from_pretrained(model: Seq2SeqModel, dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let config = LoRAConfig::load_json(dir.join(ADAPTER_CONFIG_FILE))?;
        let mut peft = get_peft_model(model, config)?;
        peft.varmap
            .load(dir.join(ADAPTER_WEIGHTS_FILE))
            .map_err(|e| Error::LoRA(format!("Failed to load adapter from {}: {}", dir.display(), e)))?;
        tracing::info!("Loaded adapter from {}", dir.display());
        Ok(peft)
    }

    /// Write `adapter_model.safetensors` and `adapter_config.json` into `dir`
    pub fn save_pretrained(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        self.varmap
            .save(dir.join(ADAPTER_WEIGHTS_FILE))
            .tune_result()?;
        self.config.save_json(dir.join(ADAPTER_CONFIG_FILE))?;
        tracing::info!("Saved adapter to {}", dir.display());
        Ok(())
    }

    /// Adapter configuration
    pub fn lora_config(&self) -> &LoRAConfig {
        &self.config
    }

    /// Wrapped base model
    pub fn base_model(&self) -> &Seq2SeqModel {
        &self.model
    }

    /// Module paths that carry an adapter
    pub fn adapted_modules(&self) -> &[String] {
        &self.adapted_modules
    }

    /// Trainable variables
    pub fn trainable_vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    /// Current adapter tensors by name
    pub fn adapter_tensors(&self) -> Result<HashMap<String, Tensor>> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|e| Error::LoRA(format!("adapter store poisoned: {}", e)))?;
        Ok(data
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect())
    }

    /// Number of trainable parameters
    pub fn trainable_parameters(&self) -> usize {
        self.trainable_vars().iter().map(|v| v.elem_count()).sum()
    }

    /// Number of parameters, base and adapter
    pub fn total_parameters(&self) -> usize {
        self.model.num_parameters() + self.trainable_parameters()
    }

    /// Log trainable and total parameter counts
    pub fn print_trainable_parameters(&self) {
        let trainable = self.trainable_parameters();
        let total = self.total_parameters();
        tracing::info!(
            "trainable params: {} || all params: {} || trainable%: {:.4}",
            trainable,
            total,
            100.0 * trainable as f64 / total.max(1) as f64
        );
    }
}

impl std::fmt::Debug for PeftModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeftModel")
            .field("config", &self.config)
            .field("adapted_modules", &self.adapted_modules)
            .finish_non_exhaustive()
    }
}

impl Seq2SeqLM for PeftModel {
    fn config(&self) -> &Seq2SeqConfig {
        self.model.config()
    }

    fn device(&self) -> &Device {
        self.model.device()
    }

    fn encode(&self, input_ids: &Tensor, attention_mask: &Tensor, train: bool) -> CandleResult<Tensor> {
        self.model.encode(input_ids, attention_mask, train)
    }

    fn decode(
        &self,
        decoder_input_ids: &Tensor,
        encoder_hidden_states: &Tensor,
        encoder_attention_mask: &Tensor,
        train: bool,
    ) -> CandleResult<Tensor> {
        self.model
            .decode(decoder_input_ids, encoder_hidden_states, encoder_attention_mask, train)
    }
}
