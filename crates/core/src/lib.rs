//! sumtune core library
//!
//! Data loading, prompt construction, adapter and training configuration,
//! ROUGE metrics and error types shared by the sumtune crates.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod data;
pub mod error;
pub mod hub;
pub mod metrics;
pub mod traits;
pub mod training;

pub use data::*;
pub use error::{DType, Device, Error, Result};
pub use hub::*;
pub use metrics::*;
pub use traits::*;
pub use training::*;
