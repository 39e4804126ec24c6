//! # Switchyard Gateway Binary
//!
//! Entry point for the gateway server: parse CLI arguments, initialize
//! tracing, load and validate configuration, serve.
//!
//! ```bash
//! # Default configuration file (config.toml), falling back to the built-in
//! # development setup when the file does not exist
//! switchyard-gateway
//!
//! # Explicit configuration and bind address
//! switchyard-gateway --config gateway.toml --host 0.0.0.0 --port 8080
//! ```

use clap::Parser;
use std::net::SocketAddr;
use switchyard_gateway::config::{Config, LogFormat};
use switchyard_gateway::server::create_server;

/// Command line arguments for the gateway server.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Host address to bind, overriding the configuration.
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on, overriding the configuration.
    #[arg(short, long)]
    port: Option<u16>,

    /// Log filter, overriding the configuration (tracing env-filter syntax).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = if std::path::Path::new(&args.config).exists() {
        Config::load(&args.config)?
    } else {
        eprintln!(
            "config file {} not found, using the built-in development setup",
            args.config
        );
        Config::development()
    };

    config.apply_env_overrides();
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.clone()));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match config.logging.format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Pretty => subscriber.init(),
        LogFormat::Compact => subscriber.compact().init(),
    }

    config.validate()?;

    let app = create_server(config.clone()).await?;

    let addr = SocketAddr::new(config.server.host.parse()?, config.server.port);
    tracing::info!(%addr, "starting switchyard gateway");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
