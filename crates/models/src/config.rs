//! Model and generation configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use sumtune_core::error::{Error, Result};

/// Feed-forward activation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    /// Exact (erf) GELU
    #[default]
    Gelu,
    /// Tanh-approximated GELU
    #[serde(alias = "gelu_pytorch_tanh")]
    GeluNew,
    /// ReLU
    Relu,
    /// SiLU / swish
    #[serde(alias = "swish")]
    Silu,
    /// Tanh
    Tanh,
}

impl Activation {
    /// Apply the activation
    pub fn apply(&self, xs: &candle_core::Tensor) -> candle_core::Result<candle_core::Tensor> {
        match self {
            Self::Gelu => xs.gelu_erf(),
            Self::GeluNew => xs.gelu(),
            Self::Relu => xs.relu(),
            Self::Silu => xs.silu(),
            Self::Tanh => xs.tanh(),
        }
    }
}

fn default_model_type() -> String {
    "bart".to_string()
}

fn default_dropout() -> f32 {
    0.1
}

fn default_init_std() -> f64 {
    0.02
}

/// Encoder/decoder configuration, read from a `config.json`.
///
/// Keys this crate does not use are kept in `extra` so that a saved
/// configuration round-trips.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Seq2SeqConfig {
    /// Architecture family
    #[serde(default = "default_model_type")]
    pub model_type: String,
    /// Vocabulary size
    pub vocab_size: usize,
    /// Hidden size
    pub d_model: usize,
    /// Number of encoder layers
    pub encoder_layers: usize,
    /// Number of decoder layers
    pub decoder_layers: usize,
    /// Encoder attention heads
    pub encoder_attention_heads: usize,
    /// Decoder attention heads
    pub decoder_attention_heads: usize,
    /// Encoder feed-forward size
    pub encoder_ffn_dim: usize,
    /// Decoder feed-forward size
    pub decoder_ffn_dim: usize,
    /// Learned position table size
    pub max_position_embeddings: usize,
    /// Feed-forward activation
    #[serde(default)]
    pub activation_function: Activation,
    /// Residual dropout
    #[serde(default = "default_dropout")]
    pub dropout: f32,
    /// Attention probability dropout
    #[serde(default)]
    pub attention_dropout: f32,
    /// Dropout after the feed-forward activation
    #[serde(default)]
    pub activation_dropout: f32,
    /// Multiply token embeddings by `sqrt(d_model)`
    #[serde(default)]
    pub scale_embedding: bool,
    /// Standard deviation used for random initialisation
    #[serde(default = "default_init_std")]
    pub init_std: f64,
    /// Padding token id
    pub pad_token_id: u32,
    /// Beginning-of-sequence token id
    pub bos_token_id: u32,
    /// End-of-sequence token id
    pub eos_token_id: u32,
    /// First token fed to the decoder
    pub decoder_start_token_id: u32,
    /// Token forced right after the decoder start token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forced_bos_token_id: Option<u32>,
    /// Token forced when the length limit is reached
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forced_eos_token_id: Option<u32>,
    /// Remaining keys
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Seq2SeqConfig {
    /// Position ids are offset by this much in the learned position tables
    pub const POSITION_OFFSET: usize = 2;

    /// A very small configuration, useful for tests and smoke runs
    pub fn tiny(vocab_size: usize) -> Self {
        Self {
            model_type: default_model_type(),
            vocab_size,
            d_model: 16,
            encoder_layers: 1,
            decoder_layers: 1,
            encoder_attention_heads: 2,
            decoder_attention_heads: 2,
            encoder_ffn_dim: 32,
            decoder_ffn_dim: 32,
            max_position_embeddings: 64,
            activation_function: Activation::Gelu,
            dropout: 0.0,
            attention_dropout: 0.0,
            activation_dropout: 0.0,
            scale_embedding: false,
            init_std: default_init_std(),
            pad_token_id: 1,
            bos_token_id: 0,
            eos_token_id: 2,
            decoder_start_token_id: 2,
            forced_bos_token_id: Some(0),
            forced_eos_token_id: Some(2),
            extra: serde_json::Map::new(),
        }
    }

    /// Longest input the position tables can address
    pub fn max_source_positions(&self) -> usize {
        self.max_position_embeddings
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<()> {
        if self.d_model % self.encoder_attention_heads != 0
            || self.d_model % self.decoder_attention_heads != 0
        {
            return Err(Error::Configuration(format!(
                "d_model {} is not divisible by the number of attention heads",
                self.d_model
            )));
        }
        for (name, id) in [
            ("pad_token_id", self.pad_token_id),
            ("bos_token_id", self.bos_token_id),
            ("eos_token_id", self.eos_token_id),
            ("decoder_start_token_id", self.decoder_start_token_id),
        ] {
            if id as usize >= self.vocab_size {
                return Err(Error::Configuration(format!(
                    "{} {} is outside the vocabulary of {}",
                    name, id, self.vocab_size
                )));
            }
        }
        Ok(())
    }

    /// Load from a `config.json`
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Save as `config.json`
    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path.as_ref(), serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Decoding parameters derived from a model configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// First token fed to the decoder
    pub decoder_start_token_id: u32,
    /// Beginning-of-sequence token id
    pub bos_token_id: u32,
    /// End-of-sequence token id
    pub eos_token_id: u32,
    /// Padding token id
    pub pad_token_id: u32,
    /// Token forced right after the decoder start token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forced_bos_token_id: Option<u32>,
    /// Token forced when the length limit is reached
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forced_eos_token_id: Option<u32>,
    /// Total length limit, decoder start token included
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    /// Limit on newly generated tokens
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_new_tokens: Option<usize>,
    /// Minimum total length before eos is allowed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    /// Beam count suggested by the checkpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_beams: Option<usize>,
    /// Length penalty suggested by the checkpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length_penalty: Option<f64>,
    /// Repeated n-gram block size suggested by the checkpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub no_repeat_ngram_size: Option<usize>,
    /// Early stopping flag suggested by the checkpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub early_stopping: Option<bool>,
}

impl GenerationConfig {
    /// Copy generation-relevant values out of a model configuration
    pub fn from_model_config(config: &Seq2SeqConfig) -> Self {
        let usize_key = |key: &str| {
            config
                .extra
                .get(key)
                .and_then(serde_json::Value::as_u64)
                .map(|v| v as usize)
        };
        Self {
            decoder_start_token_id: config.decoder_start_token_id,
            bos_token_id: config.bos_token_id,
            eos_token_id: config.eos_token_id,
            pad_token_id: config.pad_token_id,
            forced_bos_token_id: config.forced_bos_token_id,
            forced_eos_token_id: config.forced_eos_token_id,
            max_length: usize_key("max_length"),
            max_new_tokens: None,
            min_length: usize_key("min_length"),
            num_beams: usize_key("num_beams"),
            length_penalty: config
                .extra
                .get("length_penalty")
                .and_then(serde_json::Value::as_f64),
            no_repeat_ngram_size: usize_key("no_repeat_ngram_size"),
            early_stopping: config
                .extra
                .get("early_stopping")
                .and_then(serde_json::Value::as_bool),
        }
    }

    /// Set the new-token limit
    pub fn with_max_new_tokens(mut self, n: usize) -> Self {
        self.max_new_tokens = Some(n);
        self
    }

    /// Number of tokens to generate after the decoder start token
    pub fn new_token_budget(&self) -> usize {
        match (self.max_new_tokens, self.max_length) {
            (Some(n), _) => n,
            (None, Some(len)) => len.saturating_sub(1),
            (None, None) => 20,
        }
    }

    /// Write `{dir}/{file_name}`, creating the directory
    pub fn save_pretrained(&self, dir: impl AsRef<Path>, file_name: &str) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        std::fs::write(dir.join(file_name), serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Read a generation config file
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BART_CNN_CONFIG: &str = r#"{
        "_name_or_path": "facebook/bart-large-cnn",
        "activation_dropout": 0.0,
        "activation_function": "gelu",
        "architectures": ["BartForConditionalGeneration"],
        "attention_dropout": 0.0,
        "bos_token_id": 0,
        "d_model": 1024,
        "decoder_attention_heads": 16,
        "decoder_ffn_dim": 4096,
        "decoder_layers": 12,
        "decoder_start_token_id": 2,
        "dropout": 0.1,
        "early_stopping": true,
        "encoder_attention_heads": 16,
        "encoder_ffn_dim": 4096,
        "encoder_layers": 12,
        "eos_token_id": 2,
        "forced_bos_token_id": 0,
        "forced_eos_token_id": 2,
        "length_penalty": 2.0,
        "max_length": 142,
        "max_position_embeddings": 1024,
        "min_length": 56,
        "model_type": "bart",
        "no_repeat_ngram_size": 3,
        "num_beams": 4,
        "pad_token_id": 1,
        "scale_embedding": false,
        "vocab_size": 50264
    }"#;

    #[test]
    fn test_parse_bart_config() {
        let config: Seq2SeqConfig = serde_json::from_str(BART_CNN_CONFIG).unwrap();
        assert_eq!(config.d_model, 1024);
        assert_eq!(config.activation_function, Activation::Gelu);
        assert_eq!(config.decoder_start_token_id, 2);
        assert_eq!(config.forced_bos_token_id, Some(0));
        assert!(config.extra.contains_key("architectures"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_roundtrip_keeps_extra_keys() {
        let config: Seq2SeqConfig = serde_json::from_str(BART_CNN_CONFIG).unwrap();
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["num_beams"], 4);
        assert_eq!(value["_name_or_path"], "facebook/bart-large-cnn");
    }

    #[test]
    fn test_generation_config_from_model_config() {
        let config: Seq2SeqConfig = serde_json::from_str(BART_CNN_CONFIG).unwrap();
        let gen = GenerationConfig::from_model_config(&config);
        assert_eq!(gen.max_length, Some(142));
        assert_eq!(gen.min_length, Some(56));
        assert_eq!(gen.num_beams, Some(4));
        assert_eq!(gen.length_penalty, Some(2.0));
        assert_eq!(gen.early_stopping, Some(true));
        assert_eq!(gen.new_token_budget(), 141);
        assert_eq!(gen.with_max_new_tokens(8).new_token_budget(), 8);
    }

    #[test]
    fn test_validate_rejects_bad_heads() {
        let mut config = Seq2SeqConfig::tiny(32);
        config.encoder_attention_heads = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_out_of_vocab_ids() {
        let mut config = Seq2SeqConfig::tiny(32);
        config.eos_token_id = 40;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_generation_config_save() {
        let dir = tempfile::tempdir().unwrap();
        let gen = GenerationConfig::from_model_config(&Seq2SeqConfig::tiny(32));
        gen.save_pretrained(dir.path().join("config"), "gen_config.json").unwrap();

        let loaded = GenerationConfig::load_json(dir.path().join("config/gen_config.json")).unwrap();
        assert_eq!(loaded, gen);
    }
}
