//! # Split-Relay Server
//!
//! Main entry point for the split-relay proxy server.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use split_relay_core::metrics::LogSink;
use split_relay_core::proxy::Socks5Proxy;
use split_relay_core::{Config, LoggingConfig};
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = load_config()?;

    // Initialize logging; the guard must outlive main for the
    // non-blocking file writer to flush.
    let _guard = init_logging(&config.logging);

    info!(
        "Starting split-relay proxy server v{}",
        env!("CARGO_PKG_VERSION")
    );

    let socks_addr: SocketAddr = format!("{}:{}", config.server.host, config.server.socks_port)
        .parse()
        .context("Invalid SOCKS5 bind address")?;

    let proxy = Socks5Proxy::bind(socks_addr, config.relay.clone(), Arc::new(LogSink))
        .await
        .context("Failed to bind SOCKS5 listener")?;
    let bound_addr = proxy
        .local_addr()
        .context("Failed to read bound address")?;

    let socks_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!("SOCKS5 proxy error: {}", e);
        }
    });

    info!("Split-relay is running:");
    info!("  SOCKS5 proxy: {}", bound_addr);

    tokio::select! {
        _ = socks_handle => error!("SOCKS5 proxy stopped"),
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Split-relay shutting down");
    Ok(())
}

/// Load configuration from file or use defaults.
fn load_config() -> Result<Config> {
    let config_paths = ["config.toml", "/etc/split-relay/config.toml"];

    for path in config_paths {
        if Path::new(path).exists() {
            let config = Config::load(path)
                .with_context(|| format!("Failed to load config file: {}", path))?;
            println!("Loaded configuration from {}", path);
            return Ok(config);
        }
    }

    println!("No config file found, using defaults");
    Ok(Config::default())
}

/// Initialize logging with the configured level and optional log file.
fn init_logging(logging: &LoggingConfig) -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    match &logging.file {
        Some(file) => {
            let path = Path::new(file);
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("split-relay.log");
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .init();
            None
        }
    }
}
