//! Startup checks module for the video converter
//!
//! Preflight checks run before the worker accepts tasks:
//! - Configuration validation
//! - Encoder availability (`<binary> -version` must succeed)

use crate::config::{Config, ConfigError};
use std::process::Command;
use thiserror::Error;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Encoder not available: {0}")]
    EncoderUnavailable(String),

    #[error("Configuration rejected: {0}")]
    Config(#[from] ConfigError),
}

/// Check that the encoder can be executed by running `<binary> -version`
///
/// Returns the first line of the version output (may be empty for encoders
/// that print nothing).
pub fn check_encoder_available(binary: &str) -> Result<String, StartupError> {
    let output = Command::new(binary)
        .arg("-version")
        .output()
        .map_err(|e| {
            StartupError::EncoderUnavailable(format!(
                "{} -version failed; is it installed and in PATH? Error: {}",
                binary, e
            ))
        })?;

    if !output.status.success() {
        return Err(StartupError::EncoderUnavailable(format!(
            "{} -version exited with {}",
            binary, output.status
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.lines().next().unwrap_or_default().trim().to_string())
}

/// Run all startup checks in order
///
/// 1. Configuration validation
/// 2. Encoder availability
pub fn run_startup_checks(cfg: &Config) -> Result<String, StartupError> {
    cfg.validate()?;
    check_encoder_available(&cfg.encoder.binary)
}
