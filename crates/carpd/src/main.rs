//! carpd binary
//!
//! Usage: `carpd [CONFIG]`. Without an argument the default search paths
//! are tried.

use anyhow::Context;
use carp::{CarpHandle, Dispatcher, Network};
use carpd::{AddressWatcher, Config, RouterSettings, SystemNetwork};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args().nth(1).map(PathBuf::from);

    // Tracing is not up yet; config errors go straight to the caller.
    let config = Config::load(path.as_deref()).map_err(common::Error::config)?;

    if config.logging.is_json() {
        common::logging::init_json(config.logging.level());
    } else {
        common::logging::init(config.logging.level());
    }

    info!(routers = config.routers.len(), "carpd starting");

    let (handle, inbox) = carp::channel();
    let net = Arc::new(SystemNetwork::new(handle.clone()));
    let dyn_net: Arc<dyn Network> = net.clone();
    let dispatcher = tokio::spawn(Dispatcher::new(inbox, dyn_net, config.carp_options()).run());

    for router in &config.routers {
        start_router(&handle, router)
            .await
            .with_context(|| format!("failed to configure router {}", router.name))?;
    }

    let watcher = AddressWatcher::new(handle.clone(), net, config.watcher.poll_interval)
        .context("failed to read interface table")?;
    let watcher = tokio::spawn(async move {
        if let Err(e) = watcher.run().await {
            warn!(error = %e, "address watcher failed");
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for shutdown signal")?;
    info!("shutting down");

    watcher.abort();
    let stats = handle.stats().await?;
    handle.shutdown().await?;
    dispatcher.await.context("dispatcher task failed")?;

    let stats = serde_json::to_string(&stats).map_err(common::Error::from)?;
    info!(%stats, "carpd stopped");
    Ok(())
}

async fn start_router(handle: &CarpHandle, settings: &RouterSettings) -> common::Result<()> {
    let id = handle.create_router().await?;
    handle.set_config(id, settings.request()).await?;

    for address in &settings.addresses {
        // Unbacked addresses stay configured and are retried as the host changes.
        if let Err(e) = handle.add_address(id, *address).await {
            warn!(router = %settings.name, %address, error = %e, "address not active");
        }
    }

    if !settings.enabled {
        handle.set_admin_state(id, false).await?;
    }

    let snapshot = handle.get_config(id, false).await?;
    info!(
        router = %settings.name,
        vhid = settings.vhid,
        state = %snapshot.state,
        "router configured"
    );
    Ok(())
}
