//! Configuration loading and schema definitions for droidshard.
//!
//! This module provides types and functions for loading droidshard configuration
//! from TOML files or strings. The configuration schema defines every setting
//! for chunking, timeouts, retries, test filtering, and artifact collection.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

/// Loads droidshard configuration from a TOML file.
///
/// This is the primary way to load configuration. The file must be valid TOML
/// and conform to the droidshard configuration schema. Module paths are
/// expanded (`~`, `$VAR`) and the result is validated.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
/// - The configuration fails [`Config::validate`]
///
/// # Example
///
/// ```no_run
/// use droidshard::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("droidshard.toml"))?;
/// println!("Chunk size: {}", config.run.chunk_size);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    config
        .expand_paths()
        .with_context(|| format!("Failed to expand paths in {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid config file: {}", path.display()))?;

    Ok(config)
}

/// Loads droidshard configuration from a TOML string.
///
/// Useful for testing, embedding configuration, or generating configuration
/// programmatically. Paths are taken verbatim and no validation is applied.
///
/// # Example
///
/// ```
/// use droidshard::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [run]
///     chunk_size = 4
///
///     [[modules]]
///     test_apk = "app-debug-androidTest.apk"
/// "#)?;
///
/// assert_eq!(config.run.chunk_size, 4);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}
