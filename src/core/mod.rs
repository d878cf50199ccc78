// Public modules
pub mod artifacts;
pub mod config;
pub mod console;
pub mod error;
pub mod logs;
pub mod parallelism;
pub mod pipeline;
pub mod redact;
pub mod runner;
pub mod tools;

// Internal modules - not part of public API
pub(crate) mod paths;

// Re-export common types for convenience
pub use error::{Error, ErrorCode, Result};
