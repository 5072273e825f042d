//! Tracing bootstrap.
//!
//! Installs an env-filtered `tracing` subscriber with a formatted
//! console layer, a span-trace `ErrorLayer`, and — when `LOG_DIR` is
//! configured — an additional plain-text file writer.

use std::path::PathBuf;

use tracing_error::ErrorLayer;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{GuardianConfig, LOG_DIR};

/// Install the global subscriber; panics if one is already set.
pub fn init(config: &GuardianConfig) {
    try_init(config).expect("tracing subscriber already installed");
}

/// Install the global subscriber, returning an error if one exists.
pub fn try_init(config: &GuardianConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(ErrorLayer::default())
        .with(fmt::layer());

    if config.has(LOG_DIR) {
        let dir = PathBuf::from(config.get_or(LOG_DIR, "."));
        std::fs::create_dir_all(&dir)?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("guardian.log"))?;
        registry
            .with(fmt::layer().with_ansi(false).with_writer(std::sync::Arc::new(file)))
            .try_init()?;
    } else {
        registry.try_init()?;
    }
    Ok(())
}
