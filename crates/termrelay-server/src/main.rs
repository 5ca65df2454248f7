//! termrelay-server: persistent terminal sessions over WebSocket.
//!
//! Keeps one long-lived PTY per project so a browser client can navigate
//! away and come back to the same shell, with its recent output replayed.

mod api;
mod config;
mod server;
mod session;
mod transport;

use clap::Parser;
use config::{ConfigOverrides, ServerConfig, DEFAULT_CONFIG_PATH};
use server::RelayServer;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// termrelay-server: persistent PTY sessions for browser terminals
#[derive(Parser, Debug)]
#[command(name = "termrelay-server", version, about = "Persistent terminal session server")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// WebSocket port (management API uses port + 1)
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(long)]
    bind: Option<String>,

    /// Seconds an unbound session may stay idle before it is reclaimed
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Seconds between idle sweeps
    #[arg(long)]
    reap_interval: Option<u64>,

    /// Shell used for sessions
    #[arg(long)]
    shell: Option<String>,

    /// Assistant CLI started in persistent sessions
    #[arg(long)]
    assistant_command: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting termrelay-server");

    let config_path = PathBuf::from(&cli.config);
    let overrides = ConfigOverrides {
        port: cli.port,
        bind: cli.bind,
        idle_timeout: cli.idle_timeout,
        reap_interval: cli.reap_interval,
        shell: cli.shell,
        assistant_command: cli.assistant_command,
    };
    let server_config = match ServerConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let server = match RelayServer::new(server_config) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, "failed to create server");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = server.clone().run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                server.shutdown().await;
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    server.shutdown().await;
    info!("termrelay-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
