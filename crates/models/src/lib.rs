//! Seq2seq model, LoRA layers and tokenizer integration for sumtune

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod candle_model;
pub mod config;
pub mod loader;
pub mod lora_layer;
pub mod loss;
pub mod peft;
pub mod seq2seq;
pub mod tokenizer;

pub use candle_model::*;
pub use config::*;
pub use loader::*;
pub use lora_layer::*;
pub use loss::*;
pub use peft::*;
pub use seq2seq::*;
pub use tokenizer::*;
