//! The `manifold` binary: CLI parsing, logging setup, config load, serve.

use anyhow::Context;
use clap::Parser;
use manifold_gateway::audit::{AuditSink, JsonlAuditSink, LogAuditSink};
use manifold_gateway::config::{load_config, FileConfigPersister};
use manifold_gateway::upstream::TargetManagerOptions;
use manifold_gateway::Gateway;
use manifold_core::SystemClock;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "manifold", about = "MCP gateway aggregating backend tool servers")]
struct Args {
    /// Path to the configuration document (JSON or YAML)
    #[arg(long, short, env = "MANIFOLD_CONFIG", default_value = "manifold.json")]
    config: PathBuf,

    /// Listen address for the gateway endpoint
    #[arg(long, env = "MANIFOLD_LISTEN", default_value = "127.0.0.1:9100")]
    listen: SocketAddr,

    /// Append audit events to this JSONL file (logs only when unset)
    #[arg(long, env = "MANIFOLD_AUDIT_LOG")]
    audit_log: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let initial = load_config(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;

    let audit: Arc<dyn AuditSink> = match &args.audit_log {
        Some(path) => Arc::new(
            JsonlAuditSink::open(path)
                .with_context(|| format!("failed to open audit log {}", path.display()))?,
        ),
        None => Arc::new(LogAuditSink),
    };

    let gateway = Gateway::build(
        initial,
        Arc::new(FileConfigPersister::new(&args.config)),
        audit,
        Arc::new(SystemClock),
        TargetManagerOptions::default(),
    )
    .await
    .context("failed to build gateway")?;

    let app = manifold_gateway::http::app(gateway.clone());
    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    info!(listen = %args.listen, "manifold gateway listening");

    let shutdown_gateway = gateway.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown_gateway.shutdown().await;
        })
        .await
        .context("server error")?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("shutdown signal received");
}
