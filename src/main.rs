use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tollgate::config::TollgateConfig;
use tollgate::http::{app, AdminState, HttpServer};
use tollgate::ratelimit::{Admission, PolicyTable};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Admission control service.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overriding the configuration
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);
    match args.log_format {
        LogFormat::Text => subscriber.init(),
        LogFormat::Json => subscriber.json().init(),
    }

    info!("Starting Tollgate Admission Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = TollgateConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    info!(
        listen_addr = %config.server.listen_addr,
        trust_proxy_headers = config.server.trust_proxy_headers,
        "Configuration loaded"
    );

    let limits = &config.rate_limiting;
    let policies = Arc::new(PolicyTable::from_config(limits)?);
    let admission = Arc::new(Admission::with_shards(policies, limits.shards));
    info!(shards = limits.shards, "Admission engine initialized");

    let janitors =
        admission.spawn_janitors(limits.janitor.interval(), limits.janitor.idle_after());
    let state = AdminState {
        admission: Arc::clone(&admission),
        janitors: janitors
            .iter()
            .map(|handle| (handle.registry().to_string(), Arc::clone(handle.stats())))
            .collect(),
    };

    let router = app(state, config.server.trust_proxy_headers);
    let server = HttpServer::new(config.server.listen_addr, router);
    server.serve_with_shutdown(shutdown_signal()).await?;

    for janitor in janitors {
        janitor.shutdown().await;
    }

    info!("Tollgate Admission Service stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
