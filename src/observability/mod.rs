//! Observability
//!
//! Structured logging through `tracing`. Library code only emits events;
//! binaries call `init_tracing` once at startup.

pub mod config;

pub use config::LogConfig;

use tracing_subscriber::EnvFilter;

/// Install the global subscriber. Returns false if one was already set.
pub fn init_tracing(config: &LogConfig) -> bool {
    let filter = EnvFilter::try_new(&config.filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.with_target);

    let installed = if config.json {
        builder.json().try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    };
    if installed {
        tracing::info!(service = %config.service_name, json = config.json, "Tracing initialized");
    }
    installed
}
