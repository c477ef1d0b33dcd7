//! Tracing subscriber setup.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::LoggerConfig;

/// Installs the global tracing subscriber per the logger configuration.
///
/// Call once at startup; later calls are ignored.
pub fn init(config: &LoggerConfig) {
    let filter = EnvFilter::try_new(&config.filter)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if config.json {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .try_init();
    }
}
