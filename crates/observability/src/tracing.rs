//! Tracing/logging initialization.
//!
//! JSON lines by default, human-readable output on request. `RUST_LOG`
//! always wins over the configured default directive.

use serde::Deserialize;
use tracing_subscriber::EnvFilter;

/// Subscriber options, usually taken from the `logging` config section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TracingOptions {
    /// Emit JSON lines instead of the pretty formatter.
    pub json: bool,
    /// Filter directive used when `RUST_LOG` is unset (e.g. `info`).
    pub default_directive: String,
}

impl Default for TracingOptions {
    fn default() -> Self {
        Self {
            json: true,
            default_directive: "info".to_string(),
        }
    }
}

impl TracingOptions {
    pub fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.default_directive))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_with(options: &TracingOptions) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(options.filter())
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false);

    let _ = if options.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_twice_is_a_no_op() {
        init_with(&TracingOptions::default());
        init_with(&TracingOptions {
            json: false,
            default_directive: "debug".to_string(),
        });
        ::tracing::info!("still logging");
    }

    #[test]
    fn unparsable_directive_falls_back_to_info() {
        let options = TracingOptions {
            json: true,
            default_directive: "=[".to_string(),
        };
        // Only meaningful when RUST_LOG is unset; must not panic either way.
        let _ = options.filter();
    }
}
