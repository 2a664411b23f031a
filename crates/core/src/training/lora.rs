//! LoRA (Low-Rank Adaptation) configuration

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default adapter rank
pub const DEFAULT_LORA_RANK: usize = 4;
/// Default adapter alpha
pub const DEFAULT_LORA_ALPHA: f32 = 32.0;
/// Default adapter dropout
pub const DEFAULT_LORA_DROPOUT: f32 = 0.01;

/// LoRA configuration.
///
/// Field names on disk follow the `adapter_config.json` layout used by the
/// PEFT ecosystem so that saved adapters can be read by other tooling.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoRAConfig {
    /// Rank of the LoRA matrices
    #[serde(rename = "r")]
    pub rank: usize,

    /// Alpha scaling factor
    #[serde(rename = "lora_alpha")]
    pub alpha: f32,

    /// Dropout probability applied to the adapter input
    #[serde(rename = "lora_dropout")]
    pub dropout: f32,

    /// Module name suffixes that receive an adapter
    pub target_modules: Vec<String>,

    /// Bias training strategy
    pub bias: LoRABias,

    /// Task the adapted model solves
    pub task_type: TaskType,

    /// Adapter family marker
    #[serde(default = "default_peft_type")]
    pub peft_type: String,

    /// Checkpoint the adapter was trained on top of
    #[serde(default)]
    pub base_model_name_or_path: Option<String>,

    /// Whether the adapter is loaded for inference only
    #[serde(default)]
    pub inference_mode: bool,
}

fn default_peft_type() -> String {
    "LORA".to_string()
}

impl LoRAConfig {
    /// Create a new LoRA config
    pub fn new(rank: usize, alpha: f32) -> Self {
        Self {
            rank,
            alpha,
            dropout: DEFAULT_LORA_DROPOUT,
            target_modules: vec!["q_proj".to_string()],
            bias: LoRABias::None,
            task_type: TaskType::Seq2SeqLm,
            peft_type: default_peft_type(),
            base_model_name_or_path: None,
            inference_mode: false,
        }
    }

    /// Set rank
    pub fn with_rank(mut self, rank: usize) -> Self {
        self.rank = rank;
        self
    }

    /// Set alpha
    pub fn with_alpha(mut self, alpha: f32) -> Self {
        self.alpha = alpha;
        self
    }

    /// Set dropout
    pub fn with_dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout.clamp(0.0, 1.0);
        self
    }

    /// Set target modules
    pub fn with_target_modules(mut self, modules: Vec<String>) -> Self {
        self.target_modules = modules;
        self
    }

    /// Set bias strategy
    pub fn with_bias(mut self, bias: LoRABias) -> Self {
        self.bias = bias;
        self
    }

    /// Set task type
    pub fn with_task_type(mut self, task_type: TaskType) -> Self {
        self.task_type = task_type;
        self
    }

    /// Record the base checkpoint
    pub fn with_base_model(mut self, base: impl Into<String>) -> Self {
        self.base_model_name_or_path = Some(base.into());
        self
    }

    /// Get the effective scaling factor
    pub fn scaling(&self) -> f32 {
        self.alpha / self.rank as f32
    }

    /// Whether a module path such as `model.encoder.layers.0.self_attn.q_proj`
    /// receives an adapter
    pub fn targets(&self, module_path: &str) -> bool {
        self.target_modules.iter().any(|target| {
            module_path == target
                || module_path
                    .strip_suffix(target.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }

    /// Check the configuration
    pub fn validate(&self) -> Result<()> {
        if self.rank == 0 {
            return Err(Error::LoRA("rank must be at least 1".to_string()));
        }
        if self.target_modules.is_empty() {
            return Err(Error::LoRA("no target modules configured".to_string()));
        }
        if self.bias != LoRABias::None {
            return Err(Error::LoRA(format!(
                "bias strategy {:?} is not supported, only None",
                self.bias
            )));
        }
        Ok(())
    }

    /// Load from an `adapter_config.json` file
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Save as an `adapter_config.json` file
    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), data)?;
        Ok(())
    }
}

impl Default for LoRAConfig {
    /// Rank 4, alpha 32, dropout 0.01 on the attention query projections
    fn default() -> Self {
        Self::new(DEFAULT_LORA_RANK, DEFAULT_LORA_ALPHA)
    }
}

/// Bias training strategy for LoRA
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoRABias {
    /// Don't train any bias
    None,

    /// Train all biases
    All,

    /// Train only LoRA biases
    LoraOnly,
}

/// Task an adapted model is trained for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskType {
    /// Encoder/decoder language modelling (summarization, translation)
    #[serde(rename = "SEQ_2_SEQ_LM")]
    Seq2SeqLm,

    /// Decoder-only language modelling
    #[serde(rename = "CAUSAL_LM")]
    CausalLm,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lora_config_default() {
        let config = LoRAConfig::default();
        assert_eq!(config.rank, 4);
        assert_eq!(config.alpha, 32.0);
        assert_eq!(config.dropout, 0.01);
        assert_eq!(config.target_modules, vec!["q_proj"]);
        assert_eq!(config.task_type, TaskType::Seq2SeqLm);
        assert_eq!(config.scaling(), 8.0);
    }

    #[test]
    fn test_lora_config_builder() {
        let config = LoRAConfig::default()
            .with_rank(8)
            .with_alpha(16.0)
            .with_dropout(1.5);

        assert_eq!(config.rank, 8);
        assert_eq!(config.scaling(), 2.0);
        assert_eq!(config.dropout, 1.0);
    }

    #[test]
    fn test_targets_match_on_module_boundary() {
        let config = LoRAConfig::default();
        assert!(config.targets("model.encoder.layers.0.self_attn.q_proj"));
        assert!(config.targets("q_proj"));
        assert!(!config.targets("model.encoder.layers.0.self_attn.k_proj"));
        assert!(!config.targets("model.decoder.layers.0.self_attn.xq_proj"));
    }

    #[test]
    fn test_validate() {
        assert!(LoRAConfig::default().validate().is_ok());
        assert!(LoRAConfig::default().with_rank(0).validate().is_err());
        assert!(LoRAConfig::default()
            .with_target_modules(vec![])
            .validate()
            .is_err());
        assert!(LoRAConfig::default()
            .with_bias(LoRABias::All)
            .validate()
            .is_err());
    }

    #[test]
    fn test_adapter_config_json_layout() {
        let config = LoRAConfig::default().with_base_model("facebook/bart-large-cnn");
        let value = serde_json::to_value(&config).unwrap();

        assert_eq!(value["r"], 4);
        assert_eq!(value["lora_alpha"], 32.0);
        assert_eq!(value["task_type"], "SEQ_2_SEQ_LM");
        assert_eq!(value["bias"], "none");
        assert_eq!(value["peft_type"], "LORA");
        assert_eq!(value["base_model_name_or_path"], "facebook/bart-large-cnn");
    }

    #[test]
    fn test_save_and_load_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("adapter_config.json");

        let config = LoRAConfig::default().with_rank(2);
        config.save_json(&path).unwrap();
        let loaded = LoRAConfig::load_json(&path).unwrap();

        assert_eq!(loaded, config);
    }
}
