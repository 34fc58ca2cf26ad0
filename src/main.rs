//! MQTT TLS Client - Main Entry Point

use clap::{Parser, Subcommand};
use mqtt_tls_client::config::{ClientConfig, ConnectionArgs};
use mqtt_tls_client::error::ClientResult;
use mqtt_tls_client::exit::ExitFlag;
use mqtt_tls_client::observability::init_default_logging;
use mqtt_tls_client::pubsub::{run_publisher, run_subscription_hook};
use mqtt_tls_client::tls::SecurityContext;
use mqtt_tls_client::transport::mqtt::MqttClient;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{debug, error, info, warn};

/// Default config file locations, checked in order
const DEFAULT_CONFIG_PATHS: &[&str] = &["mqtt-tls-client.toml", "config/mqtt-tls-client.toml"];

/// Mutual-TLS MQTT client with periodic publishing
#[derive(Parser)]
#[command(name = "mqtt-tls-client")]
#[command(about = "Mutual-TLS MQTT client that publishes the current time every second")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(flatten)]
    connection: ConnectionArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect, publish and subscribe until reconnects run out (default)
    Run,
    /// Validate configuration
    Config {
        /// Show the resolved configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose > 0 && std::env::var_os("LOG_LEVEL").is_none() {
        let level = if cli.verbose > 1 { "TRACE" } else { "DEBUG" };
        std::env::set_var("LOG_LEVEL", level);
    }
    init_default_logging();

    info!("Starting mqtt-tls-client v{}", env!("CARGO_PKG_VERSION"));

    let config_path = cli.config.clone().or_else(find_default_config);
    let config = match ClientConfig::resolve(config_path.as_deref(), &cli.connection) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_client(config).await,
        Commands::Config { show } => handle_config_command(&config, config_path.as_deref(), show),
    };

    if let Err(e) = result {
        if e.is_setup_error() {
            error!("Setup failed before connecting: {}", e);
        } else {
            error!("{}", e);
        }
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn find_default_config() -> Option<PathBuf> {
    DEFAULT_CONFIG_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|path| path.exists())
}

async fn run_client(config: ClientConfig) -> ClientResult<()> {
    let security = SecurityContext::load(&config.tls)?;
    if security.skipped_certificates() > 0 {
        debug!(
            "Skipped {} unparseable certificates in CA bundle",
            security.skipped_certificates()
        );
    }

    let exit = ExitFlag::new();
    let client = Arc::new(MqttClient::new(&config, security, exit.clone())?);
    let topic = config.mqtt.topic.clone();

    // Must subscribe before connect() to see the first handshake
    let hook = tokio::spawn(run_subscription_hook(
        client.clone(),
        topic.clone(),
        client.lifecycle_events(),
        config.subscribe_ack_timeout(),
    ));

    if let Err(e) = client.connect().await {
        hook.abort();
        return Err(e.into());
    }

    let signal_exit = exit.clone();
    let signals = tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Received interrupt, shutting down");
                signal_exit.raise();
            }
            Err(e) => warn!("Failed to listen for interrupt: {}", e),
        }
    });

    run_publisher(client.as_ref(), &topic, config.publish_interval(), &exit).await;
    signals.abort();

    if let Err(e) = client.disconnect().await {
        warn!("Disconnect failed: {}", e);
    }
    hook.abort();

    Ok(())
}

fn handle_config_command(config: &ClientConfig, path: Option<&Path>, show: bool) -> ClientResult<()> {
    match path {
        Some(path) => info!("Configuration loaded from {}", path.display()),
        None => info!("No configuration file found, using defaults and flags"),
    }
    info!("Configuration is valid, broker {}", config.broker_uri());

    if show {
        let rendered = toml::to_string_pretty(&config.redacted()).map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
        })?;
        println!("{rendered}");
    }

    Ok(())
}
