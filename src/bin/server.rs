//! revport-server: the public rendezvous server
//!
//! Accepts tunnel clients on `tcp_port` and binds one public port per
//! advertised service. The admin web surface is a separate component; this
//! binary runs the core only.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use revport::config::{load_server_config_with_env, ServerConfig};
use revport::server::{Broker, CoreState};

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Generate default configuration
    generate_config: bool,
    /// Check configuration only
    check_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("/etc/revport/server.json");
        let mut generate_config = false;
        let mut check_config = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "-g" | "--generate-config" => {
                    generate_config = true;
                }
                "--check" => {
                    check_config = true;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("revport-server v{}", revport::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            generate_config,
            check_config,
        }
    }
}

fn print_help() {
    println!(
        r"revport-server v{}

Reverse TCP tunnel server.

USAGE:
    revport-server [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: /etc/revport/server.json]
    -g, --generate-config   Print default configuration and exit
    --check                 Check configuration and exit
    -h, --help              Print help information
    -v, --version           Print version information

ENVIRONMENT:
    REVPORT_TCP_PORT        Override the broker port
    REVPORT_PORT_START      Override the lowest allocatable public port
    REVPORT_LOG_LEVEL       Override log level (trace, debug, info, warn, error)
",
        revport::VERSION
    );
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_config {
        println!(
            "{}",
            serde_json::to_string_pretty(&ServerConfig::default())
                .context("failed to serialize default configuration")?
        );
        return Ok(());
    }

    let config = load_server_config_with_env(&args.config_path)
        .context("failed to load configuration")?;

    if args.check_config {
        println!("Configuration OK");
        return Ok(());
    }

    init_tracing(&config.log.level);
    info!("revport-server v{} starting", revport::VERSION);

    let state = CoreState::new(config.port_start);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.tcp_port));
    let broker = Broker::bind(addr, state)
        .await
        .with_context(|| format!("failed to bind broker port {}", config.tcp_port))?;
    info!(addr = %broker.local_addr()?, "listening for tunnel clients");

    tokio::select! {
        result = broker.run() => {
            result.context("broker accept loop failed")?;
        }
        _ = signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    Ok(())
}
