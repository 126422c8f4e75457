pub mod context;
pub mod env;
pub mod error;
pub mod hooks;
pub mod host;
pub mod options;
pub mod pipeline;
pub mod recipe;
pub mod release;
pub mod ssh;
pub mod task;

// Re-export common types for convenience
pub use error::{Error, ErrorCode, Result};
