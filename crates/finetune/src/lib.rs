//! sumtune: LoRA fine-tuning of seq2seq summarization models
//!
//! [`FineTuningOrchestrator`] loads a pretrained checkpoint, turns a table of
//! articles and reference summaries into prompts, trains a LoRA adapter with
//! per-epoch ROUGE evaluation, and persists or publishes the result.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod driver;
pub mod orchestrator;
pub mod publish;

pub use config::*;
pub use orchestrator::*;
pub use publish::*;
