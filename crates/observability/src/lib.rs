//! Tracing and logging setup shared by the ledger binaries.

/// Initialize process-wide tracing with the default options.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init_with(&TracingOptions::default());
}

/// Initialize process-wide tracing with explicit options.
pub fn init_with(options: &TracingOptions) {
    tracing::init_with(options);
}

/// Tracing configuration (filters, layers).
pub mod tracing;

pub use crate::tracing::TracingOptions;
