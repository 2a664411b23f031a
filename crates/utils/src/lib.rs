//! Shared utilities for sumtune

pub mod text;
pub mod progress;
pub mod io;

pub use text::*;
pub use progress::*;
pub use io::*;
