use std::path::Path;

use anyhow::Context;
use clap::Parser;

use tessera_common::config::MetaConfig;
use tessera_server::{observability, Server};

#[derive(Parser, Debug)]
#[command(name = "tesserad", about = "Tessera — cluster metadata coordinator")]
struct Cli {
    /// Config file path.
    #[arg(short, long, default_value = "tessera.toml")]
    config: String,

    /// Admin HTTP listen address (overrides config).
    #[arg(long)]
    http_addr: Option<String>,

    /// Advertised endpoint of this instance (overrides config).
    #[arg(long)]
    advertise_addr: Option<String>,

    /// Metrics listen address (overrides config; empty disables).
    #[arg(long)]
    metrics_addr: Option<String>,

    /// Print the default configuration as TOML and exit.
    #[arg(long)]
    print_default_config: bool,
}

fn load_config(path: &str) -> MetaConfig {
    if !Path::new(path).exists() {
        tracing::info!(path, "config file not found, using defaults");
        return MetaConfig::default();
    }
    match std::fs::read_to_string(path) {
        Ok(text) => match toml::from_str(&text) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(path, error = %e, "config parse failed, using defaults");
                MetaConfig::default()
            }
        },
        Err(e) => {
            tracing::warn!(path, error = %e, "config read failed, using defaults");
            MetaConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.print_default_config {
        let text = toml::to_string_pretty(&MetaConfig::default())
            .unwrap_or_else(|e| format!("# failed to serialize default config: {e}"));
        println!("{text}");
        return Ok(());
    }

    observability::init_tracing();
    tracing::info!("starting tessera...");

    let mut config = load_config(&cli.config);
    if let Some(ref addr) = cli.http_addr {
        config.server.http_listen_addr = addr.clone();
    }
    if let Some(ref addr) = cli.advertise_addr {
        config.server.advertise_addr = addr.clone();
    }
    if let Some(ref addr) = cli.metrics_addr {
        config.server.metrics_listen_addr = addr.clone();
    }

    if !config.server.metrics_listen_addr.is_empty() {
        if let Err(e) = observability::init_metrics(&config.server.metrics_listen_addr) {
            tracing::warn!(error = %e, "failed to initialize metrics");
        }
    }

    let server = Server::build(config).await.context("build server")?;
    let shutdown = server.shutdown_signal();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            shutdown.shutdown();
        }
    });

    server.run().await
}
