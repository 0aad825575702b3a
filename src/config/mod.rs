//! Configuration types and loading
//!
//! Server and client each load a small JSON file; a missing file means
//! defaults. Environment variables override individual fields for
//! deployments that cannot ship a file.

mod loader;
mod types;

pub use loader::{
    load_client_config, load_client_config_with_env, load_server_config,
    load_server_config_with_env, save_client_config,
};
pub use types::{ClientConfig, LogConfig, ServerConfig, UserConfig};
