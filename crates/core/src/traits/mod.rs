//! Core traits

pub mod tokenizer;

pub use tokenizer::*;
