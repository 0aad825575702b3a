//! Configuration loading and saving
//!
//! A missing file is not an error: both binaries run with defaults, matching
//! the behavior a fresh deployment expects. Parse and validation failures
//! are errors.

use std::path::Path;

use tracing::{debug, info};

use super::types::{ClientConfig, ServerConfig};
use crate::error::ConfigError;

/// Load the server configuration from a JSON file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read, parsed, or validated.
pub fn load_server_config(path: impl AsRef<Path>) -> Result<ServerConfig, ConfigError> {
    let path = path.as_ref();

    if !path.exists() {
        info!("config file {:?} not found, using defaults", path);
        return Ok(ServerConfig::default());
    }

    debug!("loading server configuration from {:?}", path);
    let contents = std::fs::read_to_string(path)?;
    let config: ServerConfig = serde_json::from_str(&contents)
        .map_err(|e| ConfigError::Parse(format!("{e} at {path:?}")))?;
    config.validate()?;
    Ok(config)
}

/// Load the server configuration with environment overrides
///
/// Environment variables:
/// - `REVPORT_TCP_PORT`: override the broker port
/// - `REVPORT_PORT_START`: override the lowest allocatable public port
/// - `REVPORT_LOG_LEVEL`: override the log level
///
/// # Errors
///
/// Returns `ConfigError` if loading, parsing, or an override fails.
pub fn load_server_config_with_env(path: impl AsRef<Path>) -> Result<ServerConfig, ConfigError> {
    let mut config = load_server_config(path)?;

    if let Ok(port) = std::env::var("REVPORT_TCP_PORT") {
        config.tcp_port = port.parse().map_err(|_| ConfigError::Env {
            name: "REVPORT_TCP_PORT".into(),
            reason: format!("Invalid port: {port}"),
        })?;
        debug!("tcp_port overridden to {}", config.tcp_port);
    }

    if let Ok(start) = std::env::var("REVPORT_PORT_START") {
        config.port_start = start.parse().map_err(|_| ConfigError::Env {
            name: "REVPORT_PORT_START".into(),
            reason: format!("Invalid port: {start}"),
        })?;
        debug!("port_start overridden to {}", config.port_start);
    }

    if let Ok(level) = std::env::var("REVPORT_LOG_LEVEL") {
        config.log.level = level;
    }

    config.validate()?;
    Ok(config)
}

/// Load the client configuration from a JSON file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read, parsed, or validated.
pub fn load_client_config(path: impl AsRef<Path>) -> Result<ClientConfig, ConfigError> {
    let path = path.as_ref();

    if !path.exists() {
        info!("config file {:?} not found, using defaults", path);
        return Ok(ClientConfig::default());
    }

    debug!("loading client configuration from {:?}", path);
    let contents = std::fs::read_to_string(path)?;
    let config: ClientConfig = serde_json::from_str(&contents)
        .map_err(|e| ConfigError::Parse(format!("{e} at {path:?}")))?;
    config.validate()?;
    Ok(config)
}

/// Load the client configuration with environment overrides
///
/// Environment variables:
/// - `REVPORT_SERVER_ADDR`: override the server address
/// - `REVPORT_LOG_LEVEL`: override the log level
///
/// # Errors
///
/// Returns `ConfigError` if loading, parsing, or an override fails.
pub fn load_client_config_with_env(path: impl AsRef<Path>) -> Result<ClientConfig, ConfigError> {
    let mut config = load_client_config(path)?;

    if let Ok(addr) = std::env::var("REVPORT_SERVER_ADDR") {
        if addr.is_empty() {
            return Err(ConfigError::Env {
                name: "REVPORT_SERVER_ADDR".into(),
                reason: "must not be empty".into(),
            });
        }
        config.server_addr = addr;
        debug!("server_addr overridden to {}", config.server_addr);
    }

    if let Ok(level) = std::env::var("REVPORT_LOG_LEVEL") {
        config.log.level = level;
    }

    config.validate()?;
    Ok(config)
}

/// Write the client configuration back to disk
///
/// Used to persist a generated `client_id` so ports stay stable across
/// restarts.
///
/// # Errors
///
/// Returns `ConfigError` if serialization or the write fails.
pub fn save_client_config(
    path: impl AsRef<Path>,
    config: &ClientConfig,
) -> Result<(), ConfigError> {
    let contents = serde_json::to_string_pretty(config)
        .map_err(|e| ConfigError::Parse(e.to_string()))?;
    std::fs::write(path.as_ref(), contents)?;
    Ok(())
}
