// src/server/mod.rs

//! Backend startup: builds the runtime, applies the initial selection, and
//! serves the loopback HTTP facade.

pub mod facade;
pub mod spawner;

use crate::config::Config;
use crate::core::ClusterRuntime;
use crate::core::clients::KubeClientFactory;
use crate::core::refresh::kube::KubeSubsystemFactory;
use crate::core::selection::{ClusterSelection, parse_selection_list};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info};

/// Capacity of the selection intake channel.
const SELECTION_CHANNEL_CAPACITY: usize = 16;

/// Runs the backend until shutdown.
pub async fn run(config: Config) -> Result<()> {
    let initial_selection = parse_selection_list(&config.selection.kubeconfigs)
        .context("Invalid [selection] kubeconfigs in configuration")?;

    let runtime = ClusterRuntime::start(
        config,
        Arc::new(KubeClientFactory::new()),
        Arc::new(KubeSubsystemFactory::new()),
    );

    let (selection_tx, selection_rx) = mpsc::channel::<Vec<ClusterSelection>>(
        SELECTION_CHANNEL_CAPACITY,
    );
    spawner::spawn_all(&runtime, selection_rx);

    // The facade starts once any cluster has a live subsystem, or right away
    // when nothing is selected. If every cluster is auth-failed at startup,
    // the first successful rebuild opens the gate.
    let facade_runtime = Arc::clone(&runtime);
    let facade_task = tokio::spawn(async move {
        if let Err(e) = serve_facade(facade_runtime).await {
            error!("HTTP facade error: {}", e);
        }
    });

    if initial_selection.is_empty() {
        runtime.lifecycle.open_facade_gate();
    } else if selection_tx.send(initial_selection).await.is_err() {
        error!("Selection intake closed before the initial selection was applied.");
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received.");

    runtime.shutdown().await;
    facade_task.abort();
    Ok(())
}

/// Waits for the facade gate, binds the loopback listener on an ephemeral
/// port, records the advertised base URL, and serves until shutdown.
async fn serve_facade(runtime: Arc<ClusterRuntime>) -> Result<()> {
    let mut gate = runtime.lifecycle.facade_gate();
    while !*gate.borrow() {
        tokio::select! {
            _ = runtime.shutdown.cancelled() => return Ok(()),
            changed = gate.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }
        }
    }

    let host = runtime.config.facade.host.clone();
    let port = runtime.config.facade.port;
    let listener = TcpListener::bind((host.as_str(), port))
        .await
        .with_context(|| format!("Failed to bind facade on {host}:{port}"))?;
    let addr = listener.local_addr()?;
    let base_url = format!("http://{addr}");
    runtime.set_refresh_base_url(base_url.clone());
    info!("HTTP facade listening on {}", base_url);

    let app = facade::router(runtime.clone());
    let shutdown = runtime.shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            info!("HTTP facade shutting down.");
        })
        .await
        .context("Facade server failed")?;
    Ok(())
}
