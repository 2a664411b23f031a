//! Training configuration and tokenized datasets

pub mod data;
pub mod lora;
pub mod trainer;

pub use data::*;
pub use lora::*;
pub use trainer::*;
