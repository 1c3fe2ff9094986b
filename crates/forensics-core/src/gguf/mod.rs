//! GGUF container: types and the speculative reader.

pub mod reader;
pub mod types;

pub use reader::{parse, parse_hypothesis};
pub use types::*;
