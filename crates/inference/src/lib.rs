//! Batch collation, greedy generation and the seq2seq training loop

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod collator;
pub mod generator;
pub mod training;

pub use collator::*;
pub use generator::*;
pub use training::*;
