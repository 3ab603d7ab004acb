// src/server/spawner.rs

//! Spawns the backend's long-running background tasks.

use crate::core::ClusterRuntime;
use crate::core::heartbeat::HeartbeatLoop;
use crate::core::selection::ClusterSelection;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Spawns the heartbeat loop and the selection intake consumer.
///
/// `selection_rx` is the stream of selection changes from the kubeconfig
/// watcher collaborator; each message is the full desired selection list.
pub fn spawn_all(
    runtime: &Arc<ClusterRuntime>,
    selection_rx: mpsc::Receiver<Vec<ClusterSelection>>,
) {
    let heartbeat = HeartbeatLoop::new(
        runtime.lifecycle.clone(),
        runtime.ui_bus.clone(),
        &runtime.config.heartbeat,
    );
    let heartbeat_cancel = runtime.shutdown.clone();
    tokio::spawn(async move {
        heartbeat.run(heartbeat_cancel).await;
    });

    let intake_runtime = Arc::clone(runtime);
    tokio::spawn(async move {
        run_selection_intake(intake_runtime, selection_rx).await;
    });

    info!("All background tasks have been spawned.");
}

/// Applies each incoming selection list as a coordinated mutation. Newer
/// lists preempt in-flight applications through the coordinator.
async fn run_selection_intake(
    runtime: Arc<ClusterRuntime>,
    mut rx: mpsc::Receiver<Vec<ClusterSelection>>,
) {
    loop {
        let selections = tokio::select! {
            _ = runtime.shutdown.cancelled() => return,
            next = rx.recv() => match next {
                Some(selections) => selections,
                None => return,
            },
        };
        if let Err(e) = runtime.set_selected_kubeconfigs(selections).await {
            warn!("Selection change failed: {}", e);
        }
    }
}
