//! Tracing and logging (shared setup for every binary).

pub use config::{LogFormat, LogSettings};

/// Initialize process-wide observability (tracing/logging).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init(settings: &LogSettings) {
    tracing::init(settings);
}

/// Log settings from the environment.
pub mod config;

/// Tracing configuration (filters, layers).
pub mod tracing;
