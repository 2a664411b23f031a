//! Driver and orchestrator configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use sumtune_core::data::PromptTemplate;
use sumtune_core::error::{DType, Device, Error, Result};
use sumtune_core::training::{LoRAConfig, TrainingConfig};

/// Env var naming a JSON file that overrides [`DriverConfig`] defaults
pub const CONFIG_ENV: &str = "SUMTUNE_CONFIG";

/// Parameters of the fine-tuning sweep
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Checkpoints to fine-tune, each as `owner/name` or a local directory
    pub models: Vec<String>,

    /// Number of most recent articles used per run
    pub article_counts: Vec<usize>,

    /// Version tag placed in published repository names
    pub version: String,

    /// Hub organization receiving the fine-tuned models
    pub organization: String,

    /// Fraction of each subset held out for evaluation
    pub test_size: f64,

    /// Tuning data, JSON, JSON lines or a spreadsheet
    pub data_path: PathBuf,

    /// Publish every fine-tuned model to the hub
    pub publish: bool,

    /// Also store each fine-tuned model under this directory
    pub store_dir: Option<PathBuf>,

    /// Orchestrator settings shared by every run
    pub orchestrator: OrchestratorOptions,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            models: vec!["facebook/bart-large-cnn".to_string()],
            article_counts: vec![250, 1000, 1500],
            version: "v4".to_string(),
            organization: "relu-ntnu".to_string(),
            test_size: 0.2,
            data_path: PathBuf::from("summary_1823.json"),
            publish: true,
            store_dir: None,
            orchestrator: OrchestratorOptions::default(),
        }
    }
}

impl DriverConfig {
    /// Defaults, overridden by the file named in `SUMTUNE_CONFIG` when set
    pub fn from_env() -> Result<Self> {
        match std::env::var(CONFIG_ENV) {
            Ok(path) if !path.trim().is_empty() => {
                tracing::info!("Loading driver configuration from {}", path);
                Self::load_json(path)
            }
            _ => Ok(Self::default()),
        }
    }

    /// Load from a JSON file; absent fields keep their defaults
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the sweep parameters
    pub fn validate(&self) -> Result<()> {
        if self.models.is_empty() {
            return Err(Error::Configuration("no models to fine-tune".to_string()));
        }
        if self.article_counts.iter().any(|&c| c == 0) {
            return Err(Error::Configuration("article counts must be positive".to_string()));
        }
        if self.test_size.is_nan() || self.test_size <= 0.0 || self.test_size >= 1.0 {
            return Err(Error::Configuration(format!(
                "test_size must be in (0, 1), got {}",
                self.test_size
            )));
        }
        self.orchestrator.training.validate()?;
        self.orchestrator.lora.validate()
    }
}

/// How an orchestrator loads its model and what it trains with
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorOptions {
    /// Read token for downloads; `None` falls back to `HUGGING_FACE_READ_TOKEN`
    #[serde(skip)]
    pub token: Option<String>,

    /// Device holding the weights
    pub device: Device,

    /// Weight dtype
    pub dtype: DType,

    /// Adapter configuration
    pub lora: LoRAConfig,

    /// Trainer arguments
    pub training: TrainingConfig,

    /// Prompt wrapped around every article
    pub prompt: PromptTemplate,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            token: None,
            device: Device::Cpu,
            dtype: DType::F32,
            lora: LoRAConfig::default(),
            training: TrainingConfig::default(),
            prompt: PromptTemplate::default(),
        }
    }
}

impl OrchestratorOptions {
    /// Set the read token
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    /// Set the device
    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Set the trainer arguments
    pub fn with_training(mut self, training: TrainingConfig) -> Self {
        self.training = training;
        self
    }

    /// Set the adapter configuration
    pub fn with_lora(mut self, lora: LoRAConfig) -> Self {
        self.lora = lora;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DriverConfig::default();
        assert_eq!(config.models, vec!["facebook/bart-large-cnn"]);
        assert_eq!(config.article_counts, vec![250, 1000, 1500]);
        assert_eq!(config.version, "v4");
        assert_eq!(config.organization, "relu-ntnu");
        assert_eq!(config.test_size, 0.2);
        assert!(config.publish);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sweep.json");
        std::fs::write(
            &path,
            r#"{"article_counts": [10], "publish": false, "orchestrator": {"training": {"num_train_epochs": 1}}}"#,
        )
        .unwrap();

        let config = DriverConfig::load_json(&path).unwrap();
        assert_eq!(config.article_counts, vec![10]);
        assert!(!config.publish);
        assert_eq!(config.version, "v4");
        assert_eq!(config.orchestrator.training.num_train_epochs, 1);
        assert_eq!(config.orchestrator.training.learning_rate, 0.01);
        assert_eq!(config.orchestrator.lora.rank, 4);
    }

    #[test]
    fn test_invalid_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{"test_size": 1.5}"#).unwrap();
        assert!(DriverConfig::load_json(&path).is_err());
        assert!(DriverConfig::load_json(dir.path().join("absent.json")).is_err());
    }
}
