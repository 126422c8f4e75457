/// Macro for prefixed status logging.
///
/// Usage:
/// ```ignore
/// log_status!("deploy", "Preparing release {} on {}", id, host);
/// log_status!("cleanup", "Removed {} old releases", count);
/// ```
///
/// Events are emitted through `tracing` at info level with the prefix recorded
/// as the `stage` field, so they interleave cleanly when several hosts deploy
/// at once.
#[macro_export]
macro_rules! log_status {
    ($prefix:expr, $($arg:tt)*) => {
        ::tracing::info!(stage = $prefix, $($arg)*)
    };
}

pub mod core;
pub mod utils;

// Re-export everything from core for ergonomic library use
// Users can write `rollout::task` instead of `rollout::core::task`
pub use core::*;
pub use utils::*;
