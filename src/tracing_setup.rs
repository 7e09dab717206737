//! Tracing initialization for the console binary.
//!
//! Structured, async-aware logging built on `tracing` and
//! `tracing-subscriber`: environment-based filtering through `RUST_LOG`,
//! with the configured level as the fallback.

use crate::config::Settings;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the global tracing subscriber from the application settings.
///
/// `RUST_LOG` takes precedence over the configured level, so a single run
/// can be made more verbose without editing the configuration file.
///
/// Returns an error when a subscriber is already installed.
pub fn init_from_settings(settings: &Settings) -> Result<(), String> {
    let fallback = settings.application.log_level.clone();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&fallback))
        .map_err(|err| format!("invalid log level '{fallback}': {err}"))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()
        .map_err(|err| format!("failed to install tracing subscriber: {err}"))
}
