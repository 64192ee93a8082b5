//! Tracing/logging setup shared by hosts of the APM core.

/// Tracing configuration (filters, output format).
pub mod tracing;

pub use crate::tracing::{LogFormat, TracingConfig};

/// Initialize process-wide observability from the environment.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init_with(&TracingConfig::from_env());
}

/// Initialize process-wide observability with an explicit configuration.
pub fn init_with(config: &TracingConfig) {
    tracing::init_with(config);
}
