//! Tabular tuning data: loading, cleaning and prompt construction

pub mod table;
pub mod prompt;
pub mod loader;

pub use table::*;
pub use prompt::*;
pub use loader::*;
