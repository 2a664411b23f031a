//! Summarization metrics

pub mod compute;
pub mod rouge;

pub use compute::*;
pub use rouge::*;
