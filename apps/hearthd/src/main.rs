mod config;
mod core;
mod error;
mod features;

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::core::nat::NatTable;
use crate::features::storage::Storage;
use crate::features::vms::alloc::Allocators;
use crate::features::vms::forwarder::ForwarderMap;
use crate::features::vms::repo::VmRepository;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub repo: Arc<VmRepository>,
    pub alloc: Arc<Allocators>,
    pub forwarders: Arc<ForwarderMap>,
    pub nat: Arc<NatTable>,
    pub storage: Arc<Storage>,
    /// Serializes every create/delete/snapshot pipeline.
    pub create_lock: Arc<tokio::sync::Mutex<()>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,hearthd=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Arc::new(Config::from_env()?);
    let storage = Arc::new(Storage::new(config.clone()));
    storage.init().await?;

    let state = AppState {
        repo: Arc::new(VmRepository::new(config.state_path())),
        alloc: Arc::new(Allocators::new(config.port_min, config.port_max)),
        forwarders: Arc::new(ForwarderMap::new()),
        nat: Arc::new(NatTable::new()),
        storage,
        create_lock: Arc::new(tokio::sync::Mutex::new(())),
        config: config.clone(),
    };

    // Re-attach to surviving guests and purge remnants before accepting
    // any request.
    features::reconciler::run(&state).await?;

    let app = features::router(state.clone());
    let bind = format!("0.0.0.0:{}", config.api_port);
    info!(%bind, "hearthd listening");
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Err(err) = state.repo.save().await {
        warn!("could not flush state on shutdown: {err}");
    }
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let ctrl_c = tokio::signal::ctrl_c();
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = ctrl_c.await;
        }
    }
    info!("shutdown signal received, flushing state");
}
