pub mod engine;
pub mod error;
pub mod prompt;
pub mod types;

pub use error::{EngineError, Error, Result};
