//! Configuration loading and management
//!
//! This module handles loading configuration from files and environment variables.

use std::path::Path;

use tracing::{debug, info};

use super::types::EngineConfig;
use crate::error::ConfigError;

/// Load configuration from a JSON file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read, parsed or validated.
pub fn load_config(path: impl AsRef<Path>) -> Result<EngineConfig, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;

    let config: EngineConfig = serde_json::from_str(&contents).map_err(|e| {
        ConfigError::ParseError(format!("Failed to parse JSON: {e} at {path:?}"))
    })?;

    config.validate()?;

    info!(
        "Configuration loaded: method={}, mtu={}, max_tcp_sessions={}",
        config.dpi.method, config.tun.mtu, config.limits.max_tcp_sessions
    );

    Ok(config)
}

/// Load configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<EngineConfig, ConfigError> {
    let config: EngineConfig =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.validate()?;

    Ok(config)
}

/// Load configuration with environment variable overrides
///
/// Environment variables:
/// - `DESYNC_TUNNEL_LOG_LEVEL`: Override log level
/// - `DESYNC_TUNNEL_METHOD`: Override desync method
/// - `DESYNC_TUNNEL_MAX_SESSIONS`: Override TCP session limit
/// - `DESYNC_TUNNEL_ROUTING_MARK`: Override SO_MARK for real sockets
///
/// # Errors
///
/// Returns `ConfigError` if loading, parsing or an override fails.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<EngineConfig, ConfigError> {
    let mut config = load_config(path)?;
    apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
    Ok(config)
}

/// Apply overrides from a variable lookup, then re-validate.
///
/// Split out from [`load_config_with_env`] so tests do not have to mutate the
/// process environment.
///
/// # Errors
///
/// Returns `ConfigError::EnvError` for unparsable values and
/// `ConfigError::ValidationError` if the result is invalid.
pub fn apply_env_overrides<F>(config: &mut EngineConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(level) = lookup("DESYNC_TUNNEL_LOG_LEVEL") {
        config.log.level = level;
        debug!("Log level overridden to {}", config.log.level);
    }

    if let Some(method) = lookup("DESYNC_TUNNEL_METHOD") {
        config.dpi.method = method.parse().map_err(|_| ConfigError::EnvError {
            name: "DESYNC_TUNNEL_METHOD".into(),
            reason: format!("Unknown method: {method}"),
        })?;
        debug!("Desync method overridden to {}", config.dpi.method);
    }

    if let Some(max) = lookup("DESYNC_TUNNEL_MAX_SESSIONS") {
        config.limits.max_tcp_sessions = max.parse().map_err(|_| ConfigError::EnvError {
            name: "DESYNC_TUNNEL_MAX_SESSIONS".into(),
            reason: format!("Invalid number: {max}"),
        })?;
        debug!(
            "Max TCP sessions overridden to {}",
            config.limits.max_tcp_sessions
        );
    }

    if let Some(mark) = lookup("DESYNC_TUNNEL_ROUTING_MARK") {
        let mark = mark.parse().map_err(|_| ConfigError::EnvError {
            name: "DESYNC_TUNNEL_ROUTING_MARK".into(),
            reason: format!("Invalid mark: {mark}"),
        })?;
        config.protect.routing_mark = Some(mark);
        debug!("Routing mark overridden to {}", mark);
    }

    config.validate()
}

/// Create a default configuration file at the given path
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be written.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let config = EngineConfig::default();
    let json = serde_json::to_string_pretty(&config)
        .map_err(|e| ConfigError::ParseError(format!("Failed to serialize config: {e}")))?;

    std::fs::write(path, json)?;
    Ok(())
}
