//! Logging bootstrap
//!
//! The crate only emits `tracing` events; applications that already install a
//! subscriber need nothing from here. [`init_logging`] is a convenience for
//! binaries and tests.

use crate::config::LoggingConfig;
use crate::error::{CactusError, Result};
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install a global fmt subscriber.
///
/// `RUST_LOG` overrides `config.level`. Returns `false` when a global
/// subscriber was already installed, which is not an error.
pub fn init_logging(config: &LoggingConfig) -> Result<bool> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| CactusError::ConfigError(format!("Invalid log level: {}", e)))?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match &config.file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            registry
                .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
                .try_init()
        }
        None => registry
            .with(fmt::layer().with_ansi(config.ansi).with_writer(std::io::stderr))
            .try_init(),
    };

    Ok(installed.is_ok())
}
