//! Core error types for sumtune
use std::path::PathBuf;

/// Result type alias for sumtune
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Device for computation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Device {
    #[default]
    Cpu,
    Gpu(u32),
    Metal,
}

/// Data type for tensors
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum DType {
    #[default]
    F32,
    F16,
    BF16,
}

/// Core error type
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Model loading error: {0}")]
    ModelLoading(String),

    #[error("Tokenization error: {0}")]
    Tokenization(String),

    #[error("Generation error: {0}")]
    Generation(String),

    #[error("Training error: {0}")]
    Training(String),

    #[error("LoRA error: {0}")]
    LoRA(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Failed to load tuning data from {path}: {message}")]
    DataLoading { path: PathBuf, message: String },

    #[error("Hub error: {0}")]
    Hub(String),

    #[error("Metric error: {0}")]
    Metrics(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl Error {
    /// Build a data loading error for `path`
    pub fn data_loading(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Error::DataLoading {
            path: path.into(),
            message: message.into(),
        }
    }
}
