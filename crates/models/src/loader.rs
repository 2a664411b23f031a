//! Loading pretrained checkpoints from a local directory or the model hub

use crate::candle_model::{to_candle_device, to_candle_dtype};
use crate::config::Seq2SeqConfig;
use crate::seq2seq::{Seq2SeqModel, CONFIG_FILE, WEIGHTS_FILE};
use crate::tokenizer::{HFTokenizerWrapper, TOKENIZER_FILE};
use candle_core::{DType as CandleDType, Device as CandleDevice};
use hf_hub::api::sync::{Api, ApiBuilder};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use sumtune_core::error::{DType, Device, Error, Result};

/// Index file of a sharded checkpoint
pub const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";

/// Resolved files of a checkpoint
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckpointFiles {
    /// `config.json`
    pub config: PathBuf,
    /// `tokenizer.json`, when the checkpoint ships one
    pub tokenizer: Option<PathBuf>,
    /// Safetensors weight files
    pub weights: Vec<PathBuf>,
}

/// Shard file names listed in a `model.safetensors.index.json`
pub fn shard_files(index: &serde_json::Value) -> Result<Vec<String>> {
    let map = index
        .get("weight_map")
        .and_then(serde_json::Value::as_object)
        .ok_or_else(|| Error::ModelLoading("index file has no weight_map".to_string()))?;
    let files: BTreeSet<String> = map
        .values()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();
    Ok(files.into_iter().collect())
}

/// Model and tokenizer loader
#[derive(Clone, Debug)]
pub struct ModelLoader {
    token: Option<String>,
    device: CandleDevice,
    dtype: CandleDType,
}

impl Default for ModelLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelLoader {
    /// CPU, f32, anonymous hub access
    pub fn new() -> Self {
        Self {
            token: None,
            device: CandleDevice::Cpu,
            dtype: CandleDType::F32,
        }
    }

    /// Use a hub read token
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    /// Set device
    pub fn with_device(mut self, device: &Device) -> Self {
        self.device = to_candle_device(device);
        self
    }

    /// Set dtype
    pub fn with_dtype(mut self, dtype: &DType) -> Self {
        self.dtype = to_candle_dtype(dtype);
        self
    }

    /// Device models are loaded onto
    pub fn device(&self) -> &CandleDevice {
        &self.device
    }

    /// Locate the checkpoint files for a directory path or a hub repository id
    pub fn resolve(&self, identifier: &str) -> Result<CheckpointFiles> {
        let local = Path::new(identifier);
        if local.is_dir() {
            return Self::resolve_local(local);
        }
        if local.exists() {
            return Err(Error::ModelLoading(format!(
                "{} is a file, expected a model directory or a hub repository id",
                identifier
            )));
        }
        self.resolve_hub(identifier)
    }

    fn resolve_local(dir: &Path) -> Result<CheckpointFiles> {
        let config = dir.join(CONFIG_FILE);
        if !config.is_file() {
            return Err(Error::NotFound(format!("{}", config.display())));
        }

        let weights = if dir.join(WEIGHTS_FILE).is_file() {
            vec![dir.join(WEIGHTS_FILE)]
        } else if dir.join(WEIGHTS_INDEX_FILE).is_file() {
            let index: serde_json::Value =
                serde_json::from_str(&std::fs::read_to_string(dir.join(WEIGHTS_INDEX_FILE))?)?;
            shard_files(&index)?.into_iter().map(|f| dir.join(f)).collect()
        } else {
            return Err(Error::NotFound(format!(
                "no {} or {} in {}",
                WEIGHTS_FILE,
                WEIGHTS_INDEX_FILE,
                dir.display()
            )));
        };

        let tokenizer = Some(dir.join(TOKENIZER_FILE)).filter(|p| p.is_file());
        Ok(CheckpointFiles {
            config,
            tokenizer,
            weights,
        })
    }

    fn api(&self) -> Result<Api> {
        ApiBuilder::new()
            .with_token(self.token.clone())
            .build()
            .map_err(|e| Error::ModelLoading(format!("Failed to create HF API: {}", e)))
    }

    fn resolve_hub(&self, repo_id: &str) -> Result<CheckpointFiles> {
        tracing::info!("Fetching {} from the hub", repo_id);
        let repo = self.api()?.model(repo_id.to_string());
        let fetch = |file: &str| {
            repo.get(file)
                .map_err(|e| Error::ModelLoading(format!("Failed to get {} for {}: {}", file, repo_id, e)))
        };

        let config = fetch(CONFIG_FILE)?;
        let weights = match fetch(WEIGHTS_FILE) {
            Ok(path) => vec![path],
            Err(single_err) => {
                let index_path = fetch(WEIGHTS_INDEX_FILE).map_err(|_| single_err)?;
                let index: serde_json::Value =
                    serde_json::from_str(&std::fs::read_to_string(index_path)?)?;
                shard_files(&index)?
                    .iter()
                    .map(|f| fetch(f))
                    .collect::<Result<Vec<_>>>()?
            }
        };
        let tokenizer = fetch(TOKENIZER_FILE).ok();

        Ok(CheckpointFiles {
            config,
            tokenizer,
            weights,
        })
    }

    /// Load only the model
    pub fn load_model(&self, identifier: &str) -> Result<Seq2SeqModel> {
        let files = self.resolve(identifier)?;
        self.load_model_files(&files)
    }

    fn load_model_files(&self, files: &CheckpointFiles) -> Result<Seq2SeqModel> {
        let config = Seq2SeqConfig::load_json(&files.config)?;
        Seq2SeqModel::from_safetensors(config, &files.weights, self.dtype, &self.device)
    }

    /// Load model and tokenizer
    pub fn load(&self, identifier: &str) -> Result<(Seq2SeqModel, HFTokenizerWrapper)> {
        let files = self.resolve(identifier)?;
        let model = self.load_model_files(&files)?;

        let tokenizer_file = files.tokenizer.as_ref().ok_or_else(|| {
            Error::NotFound(format!("{} has no {}", identifier, TOKENIZER_FILE))
        })?;
        let tokenizer = HFTokenizerWrapper::from_file(tokenizer_file)?;

        tracing::info!(
            "Loaded {} ({} parameters, {} weight files)",
            identifier,
            model.num_parameters(),
            files.weights.len()
        );
        Ok((model, tokenizer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::word_level_tokenizer_json;

    #[test]
    fn test_shard_files() {
        let index = serde_json::json!({
            "metadata": {"total_size": 10},
            "weight_map": {
                "a": "model-00002-of-00002.safetensors",
                "b": "model-00001-of-00002.safetensors",
                "c": "model-00001-of-00002.safetensors"
            }
        });
        assert_eq!(
            shard_files(&index).unwrap(),
            vec![
                "model-00001-of-00002.safetensors".to_string(),
                "model-00002-of-00002.safetensors".to_string()
            ]
        );
        assert!(shard_files(&serde_json::json!({})).is_err());
    }

    #[test]
    fn test_resolve_local_missing_config() {
        let dir = tempfile::tempdir().unwrap();
        let loader = ModelLoader::new();
        assert!(matches!(
            loader.resolve(dir.path().to_str().unwrap()),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_load_local_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let model = Seq2SeqModel::random(Seq2SeqConfig::tiny(8), &CandleDevice::Cpu).unwrap();
        model.save_pretrained(dir.path()).unwrap();
        std::fs::write(
            dir.path().join(TOKENIZER_FILE),
            word_level_tokenizer_json(&["a", "b", "c", "d"]),
        )
        .unwrap();

        let (loaded, tokenizer) = ModelLoader::new().load(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(loaded.num_parameters(), model.num_parameters());
        assert_eq!(
            sumtune_core::traits::TokenizerTrait::pad_token_id(&tokenizer),
            1
        );
    }

    #[test]
    fn test_file_identifier_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("config.json");
        std::fs::write(&file, "{}").unwrap();
        assert!(ModelLoader::new().resolve(file.to_str().unwrap()).is_err());
    }
}
