use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;

use openai_proxy::config::{apply_env_overrides, load_config, validate_config, ConfigError};
use openai_proxy::observability::{logging, metrics};
use openai_proxy::lifecycle::signals;
use openai_proxy::{HttpServer, ProxyConfig, Shutdown};

#[derive(Parser)]
#[command(name = "openai-proxy")]
#[command(about = "Streaming reverse proxy for the OpenAI API with request capture", long_about = None)]
struct Cli {
    /// TOML configuration file; environment variables override it.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };
    apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
    validate_config(&config).map_err(ConfigError::Validation)?;

    logging::init_logging(&config.observability);

    tracing::info!("openai-proxy v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        bind_address = %config.listener.bind_address,
        base_url = %config.upstream.base_url,
        fallback_credential = !config.upstream.api_key.is_empty(),
        recording = config.recording.enabled,
        sink = ?config.recording.sink,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr)?,
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let shutdown = Shutdown::new();
    let server_shutdown = shutdown.subscribe();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        signals::wait_for_termination().await;
        trigger.trigger();
    });

    let server = HttpServer::new(config)?;
    server.run(listener, server_shutdown).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
