//! Configuration structures for server and client

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::proto::TargetService;

fn default_tcp_port() -> u16 {
    7001
}

fn default_web_port() -> u16 {
    8080
}

fn default_port_start() -> u16 {
    10000
}

fn default_log_level() -> String {
    "info".into()
}

fn default_server_addr() -> String {
    "127.0.0.1:7001".into()
}

/// Logging configuration shared by both binaries
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Port the broker accepts tunnel clients on
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,

    /// Port for the admin web surface (not served by the core)
    #[serde(default = "default_web_port")]
    pub web_port: u16,

    /// Lowest public port considered by the allocator
    #[serde(default = "default_port_start")]
    pub port_start: u16,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tcp_port: default_tcp_port(),
            web_port: default_web_port(),
            port_start: default_port_start(),
            log: LogConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Validation` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tcp_port == 0 {
            return Err(ConfigError::Validation("tcp_port must not be 0".into()));
        }
        if self.port_start == 0 {
            return Err(ConfigError::Validation("port_start must not be 0".into()));
        }
        Ok(())
    }
}

/// Identity fields announced during the handshake
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct UserConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub project_name: String,
    #[serde(default)]
    pub remark: String,
}

/// Client configuration
///
/// `client_id` is persisted: a client that restarts with the same id gets
/// its previous public ports back. An empty id is generated on first load
/// and written back to the file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Address of the tunnel server, `host:port`
    #[serde(default = "default_server_addr")]
    pub server_addr: String,

    /// Persisted client identity, generated when empty
    #[serde(default)]
    pub client_id: String,

    /// Identity fields announced during the handshake
    #[serde(default)]
    pub user: UserConfig,

    /// Services to advertise; ids are generated when empty
    #[serde(default)]
    pub services: Vec<TargetService>,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            client_id: String::new(),
            user: UserConfig::default(),
            services: Vec::new(),
            log: LogConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Validation` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_addr.is_empty() {
            return Err(ConfigError::Validation("server_addr must not be empty".into()));
        }
        for service in &self.services {
            if service.local_ip.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "service '{}' has an empty local_ip",
                    service.id
                )));
            }
            if service.local_port == 0 {
                return Err(ConfigError::Validation(format!(
                    "service '{}' has local_port 0",
                    service.id
                )));
            }
        }
        Ok(())
    }
}
