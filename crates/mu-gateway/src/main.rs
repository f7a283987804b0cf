use clap::Parser;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tracing::{error, info};

use mu_core::{Clock, MuConfig, SystemClock};
use mu_gateway::app;
use mu_gateway::deliver::ChannelDeliverer;
use mu_gateway::server_meta;
use mu_journal::WriterLock;

#[derive(Debug, Parser)]
#[command(name = "mu-gateway", about = "mu control-plane gateway")]
struct Args {
    /// Path to mu.toml (defaults to ./mu.toml with MU_* env overrides).
    #[arg(long)]
    config: Option<String>,
    /// Override the configured listen port.
    #[arg(long)]
    port: Option<u16>,
    /// Override the configured bind address.
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mu_gateway=info,mu_pipeline=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = match MuConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(error = %e, "config load failed; using defaults");
            MuConfig::default()
        }
    };
    if let Some(port) = args.port {
        config.gateway.port = port;
    }
    if let Some(bind) = args.bind {
        config.gateway.bind = bind;
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store_dir = config.store_path();

    // Single writer per repo — fail fast if another runtime owns the store.
    let lock = match WriterLock::acquire(&store_dir, &config.repo_root, clock.now_ms()) {
        Ok(lock) => lock,
        Err(e) => {
            error!(error = %e, code = e.code(), "could not acquire writer lock");
            anyhow::bail!("writer lock busy for {}", store_dir.display());
        }
    };
    let writer_lock = Arc::new(Mutex::new(Some(lock)));

    let deliverer = Arc::new(ChannelDeliverer::new(
        config
            .adapters
            .telegram
            .as_ref()
            .and_then(|t| t.bot_token.clone()),
    ));

    let bind = config.gateway.bind.clone();
    let port = config.gateway.port;
    let state = app::build_state(
        config,
        args.config.clone(),
        clock,
        writer_lock.clone(),
        deliverer,
    )?;
    let (shutdown_tx, background) = app::spawn_background(&state);

    server_meta::write(&store_dir, port, &bind)?;

    let router = app::build_router(state.clone());
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(
        addr = %addr,
        routes = ?state.generations.current().routes(),
        "mu control plane listening"
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    // Drain loops, release ownership, clean discovery state.
    let _ = shutdown_tx.send(true);
    for handle in background {
        handle.abort();
    }
    if let Some(lock) = writer_lock.lock().unwrap().take() {
        if let Err(e) = lock.release() {
            error!(error = %e, "failed to release writer lock");
        }
    }
    server_meta::remove(&store_dir);
    info!("mu control plane stopped");
    Ok(())
}
