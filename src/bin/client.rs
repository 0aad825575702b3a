//! revport-client: headless tunnel client
//!
//! Connects to the configured server, advertises the services from the
//! config file, and keeps reconnecting every five seconds while the session
//! is down. The desktop UI of the full product drives the same library
//! entry points this binary does.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use revport::client::session::{connect_server, run_reconnect_loop, sync_services};
use revport::client::{ClientEvent, ClientState};
use revport::config::{load_client_config_with_env, ClientConfig};

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
        let mut config_path = PathBuf::from("client.json");
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
                    println!("revport-client v{}", revport::VERSION);
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
        r"revport-client v{}

Reverse TCP tunnel client.

USAGE:
    revport-client [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: client.json]
    -g, --generate-config   Print default configuration and exit
    --check                 Check configuration and exit
    -h, --help              Print help information
    -v, --version           Print version information

ENVIRONMENT:
    REVPORT_SERVER_ADDR     Override the server address
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
            serde_json::to_string_pretty(&ClientConfig::default())
                .context("failed to serialize default configuration")?
        );
        return Ok(());
    }

    let config = load_client_config_with_env(&args.config_path)
        .context("failed to load configuration")?;

    if args.check_config {
        println!("Configuration OK");
        return Ok(());
    }

    init_tracing(&config.log.level);
    info!("revport-client v{} starting", revport::VERSION);

    let state = ClientState::new(config, Some(args.config_path.clone()));
    state.set_on_event(|event| match event {
        ClientEvent::Connected => info!("connected to server"),
        ClientEvent::Disconnected => warn!("disconnected from server"),
        ClientEvent::ServicesUpdated => info!("service list updated"),
    });

    // First attempt right away; the ticker takes over on failure.
    match connect_server(state.clone()).await {
        Ok(()) => {
            if let Err(err) = sync_services(&state).await {
                warn!(error = %err, "initial service sync failed");
            }
        }
        Err(err) => {
            warn!(error = %err, "initial connect failed, will keep retrying");
        }
    }

    let reconnect = tokio::spawn(run_reconnect_loop(Arc::clone(&state)));

    signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");
    reconnect.abort();

    Ok(())
}
