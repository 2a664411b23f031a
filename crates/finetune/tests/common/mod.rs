//! Common test utilities

#![allow(dead_code)]

use candle_core::{Device, Tensor, D};
use std::path::Path;
use sumtune::{FineTuningOrchestrator, OrchestratorOptions};
use sumtune_core::data::{TuningTable, CONTENT, REFERENCE_SUMMARY};
use sumtune_core::training::TrainingConfig;
use sumtune_models::{word_level_tokenizer_json, HFTokenizerWrapper, Seq2SeqConfig, Seq2SeqModel};

/// Vocabulary of the test tokenizer, after the four special tokens
pub const WORDS: &[&str] = &[
    "Summarize", "the", "following", "article", ":", "<", ">", "</", ".</", ".", "wind", "solar",
    "hydro", "power", "output", "prices", "grew", "fell", "rose", "in", "norway", "sweden",
    "denmark", "this", "year", "last", "month", "sharply",
];

const SUBJECTS: [&str; 3] = ["wind", "solar", "hydro"];
const VERBS: [&str; 3] = ["grew", "fell", "rose"];
const PLACES: [&str; 3] = ["norway", "sweden", "denmark"];

/// Word-level tokenizer over [`WORDS`]
pub fn tokenizer() -> HFTokenizerWrapper {
    HFTokenizerWrapper::from_bytes(word_level_tokenizer_json(WORDS)).unwrap()
}

/// Model configuration sized for [`tokenizer`]
pub fn tiny_config() -> Seq2SeqConfig {
    Seq2SeqConfig::tiny(4 + WORDS.len())
}

/// Randomly initialised model sized for [`tokenizer`]
pub fn tiny_model() -> Seq2SeqModel {
    Seq2SeqModel::random(tiny_config(), &Device::Cpu).unwrap()
}

/// One article and its summary
pub fn article(i: usize) -> (String, String) {
    let subject = SUBJECTS[i % 3];
    let verb = VERBS[(i / 3) % 3];
    let place = PLACES[(i / 9) % 3];
    (
        format!("{} power output {} sharply in {} this year . prices {} last month .", subject, verb, place, verb),
        format!("{} output {} in {} .", subject, verb, place),
    )
}

/// Table with an extra `url` column and `n` complete rows
pub fn table(n: usize) -> TuningTable {
    let mut table = TuningTable::new(vec![
        "url".to_string(),
        CONTENT.to_string(),
        REFERENCE_SUMMARY.to_string(),
    ]);
    for i in 0..n {
        let (content, summary) = article(i);
        table
            .push_row(vec![Some(format!("https://news.example/{}", i)), Some(content), Some(summary)])
            .unwrap();
    }
    table
}

/// Small, seeded training run writing checkpoints into `output_dir`
pub fn training_config(output_dir: &Path) -> TrainingConfig {
    TrainingConfig::new()
        .with_output_dir(output_dir)
        .with_num_epochs(2)
        .with_seed(11)
        .with_generation_max_new_tokens(6)
        .with_save_total_limit(Some(1))
}

/// Orchestrator around a fresh tiny model
pub fn orchestrator(output_dir: &Path) -> FineTuningOrchestrator {
    FineTuningOrchestrator::from_parts("test/tiny-bart", tiny_model(), tokenizer())
        .with_training_config(training_config(output_dir))
}

/// Options that never consult the environment for a token
pub fn offline_options(output_dir: &Path) -> OrchestratorOptions {
    OrchestratorOptions::default()
        .with_token(Some(String::new()))
        .with_training(training_config(output_dir))
}

/// Fixed batch for comparing model outputs
pub fn fixed_inputs() -> (Tensor, Tensor, Tensor) {
    let device = Device::Cpu;
    let ids = Tensor::new(&[[0u32, 14, 17, 23, 2], [0, 15, 21, 2, 1]], &device).unwrap();
    let mask = Tensor::new(&[[1u32, 1, 1, 1, 1], [1, 1, 1, 1, 0]], &device).unwrap();
    let dec = Tensor::new(&[[2u32, 0, 14, 20], [2, 0, 15, 21]], &device).unwrap();
    (ids, mask, dec)
}

/// Largest absolute element-wise difference
pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .max(D::Minus1)
        .unwrap()
        .to_scalar::<f32>()
        .unwrap()
}
