use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
};

use anyhow::Context;
use ask_server::{app, state::AppState};
use common::AppConfig;
use tracing::{info, warn};

const DEFAULT_CONFIG_PATH: &str = "sop-rag.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_target(false).json().init();

    let config_path = std::env::var("SOP_RAG_CONFIG")
        .map_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from);
    let config = AppConfig::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    let addr = build_bind_addr(
        &config.server.bind_addr,
        config.server.port,
        config.server.allow_non_local,
    )?;

    let state = AppState::from_config(config)?;
    info!(
        addr = %addr,
        backend = %state.config.vector_backend,
        storage = %state.config.storage_dir,
        "ask-server listening"
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("ask-server stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(err) => {
                warn!(error = %err, "SIGTERM handler unavailable, waiting for ctrl-c only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn build_bind_addr(host: &str, port: u16, allow_non_local: bool) -> anyhow::Result<SocketAddr> {
    let ip = host
        .parse::<IpAddr>()
        .with_context(|| format!("invalid bind address {host}"))?;
    if !ip.is_loopback() && !allow_non_local {
        anyhow::bail!("non-local bind requested for {ip}, set SOP_RAG_ALLOW_NON_LOCAL=true to opt in");
    }
    Ok(SocketAddr::new(ip, port))
}
