//! Shared CLI helpers for the workspace tools.

use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LogConfig;
use crate::{Error, Result};

/// Installs the global subscriber at `info`, or `debug` when verbose.
pub fn setup_cli_logging(verbose: bool) -> Result<()> {
    let config = if verbose {
        LogConfig::verbose()
    } else {
        LogConfig::default()
    };
    setup_logging(&config)
}

/// Installs the global subscriber from an explicit configuration.
pub fn setup_logging(config: &LogConfig) -> Result<()> {
    let filter = EnvFilter::try_new(config.directive())
        .map_err(|e| Error::Config(format!("Invalid log filter: {e}")))?;

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to initialize logger: {e}")))?;

    Ok(())
}

pub fn load_toml_config<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned,
{
    let content = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read config {}: {e}", path.display())))?;

    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse config {}: {e}", path.display())))
}
