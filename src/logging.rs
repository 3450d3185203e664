//! Logger setup
//!
//! Everything in this crate logs through the `log` facade. Binaries and tests that want to see the output can call
//! [`init_logging`] once, early.

use std::sync::Once;

/// Logger configuration.
///
/// `env_filter` follows the `env_logger` filter syntax (e.g. "info", "nova_memory=trace").
#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    pub env_filter: Option<String>,

    /// Whether the output is captured by the test harness instead of written straight to stderr.
    pub is_test: bool,
}

static INIT: Once = Once::new();

/// Initializes the global logger once.
///
/// This function is idempotent; subsequent calls are ignored. Without an explicit filter, `RUST_LOG` is honoured, and
/// without that everything at `info` and above is shown.
pub fn init_logging(config: LoggingConfig) {
    INIT.call_once(|| {
        let mut builder = env_logger::Builder::new();

        if let Some(filter) = config.env_filter {
            builder.parse_filters(&filter);
        } else if let Ok(filter) = std::env::var("RUST_LOG") {
            builder.parse_filters(&filter);
        } else {
            builder.filter_level(log::LevelFilter::Info);
        }
        builder.is_test(config.is_test);

        // Someone else may have installed a logger already, which is fine.
        if builder.try_init().is_ok() {
            log::debug!("logging initialized");
        }
    });
}
