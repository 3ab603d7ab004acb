// src/core/refresh/mod.rs

//! The per-cluster refresh subsystem: the bundle of informer-backed services
//! the runtime core starts, stops, swaps, and aggregates.

use crate::core::clients::ClusterClients;
use crate::core::errors::KubedeckError;
use crate::core::selection::ClusterMeta;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub mod events;
pub mod kube;
pub mod queue;
pub mod snapshot;
pub mod stream;

pub use events::{ClusterEventManager, ClusterStreamEvent};
pub use queue::{RefreshHandler, RefreshJobState, RefreshQueue, RefreshWorker};
pub use snapshot::{DomainSnapshot, SnapshotEntry, SnapshotProvider, SnapshotStats};
pub use stream::{ResourceDelta, ResourceFrame, ResourceStreamAdapter};

/// Capacity of each cluster's catalog broadcast channel.
const CATALOG_CHANNEL_CAPACITY: usize = 256;

/// One entry of a cluster's object catalog: an API resource the cluster serves.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogEntry {
    pub kind: String,
    pub group: String,
    pub version: String,
    pub namespaced: bool,
}

/// The per-cluster object catalog: discovery results broadcast to the
/// catalog stream.
#[derive(Debug)]
pub struct CatalogService {
    meta: ClusterMeta,
    sender: broadcast::Sender<CatalogEntry>,
    running: AtomicBool,
}

impl CatalogService {
    pub fn new(meta: ClusterMeta) -> Self {
        let (sender, _) = broadcast::channel(CATALOG_CHANNEL_CAPACITY);
        Self {
            meta,
            sender,
            running: AtomicBool::new(true),
        }
    }

    pub fn meta(&self) -> &ClusterMeta {
        &self.meta
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CatalogEntry> {
        self.sender.subscribe()
    }

    pub fn publish(&self, entry: CatalogEntry) {
        if !self.running.load(Ordering::Relaxed) {
            return;
        }
        let _ = self.sender.send(entry);
    }

    /// Stops the catalog: further publishes are dropped.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

/// The live runtime bundle for one cluster.
pub struct RefreshSubsystem {
    pub meta: ClusterMeta,
    pub snapshots: Arc<dyn SnapshotProvider>,
    pub events: Arc<ClusterEventManager>,
    pub stream: Arc<dyn ResourceStreamAdapter>,
    pub queue: Arc<RefreshQueue>,
    pub catalog: Arc<CatalogService>,
    cancel: CancellationToken,
    revalidation_cancel: CancellationToken,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl RefreshSubsystem {
    pub fn new(
        meta: ClusterMeta,
        snapshots: Arc<dyn SnapshotProvider>,
        events: Arc<ClusterEventManager>,
        stream: Arc<dyn ResourceStreamAdapter>,
        queue: Arc<RefreshQueue>,
        catalog: Arc<CatalogService>,
    ) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let revalidation_cancel = cancel.child_token();
        Arc::new(Self {
            meta,
            snapshots,
            events,
            stream,
            queue,
            catalog,
            cancel,
            revalidation_cancel,
            tasks: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Token cancelled when the subsystem shuts down. Feeder tasks run as its
    /// children.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Token for the permission-revalidation task, stoppable independently of
    /// the subsystem itself.
    pub fn revalidation_token(&self) -> CancellationToken {
        self.revalidation_cancel.clone()
    }

    pub fn stop_permission_revalidation(&self) {
        self.revalidation_cancel.cancel();
    }

    /// Registers a background task for shutdown tracking.
    pub fn track(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stops the subsystem: cancels all tasks and waits up to `timeout` for
    /// them to finish. On timeout the stragglers are abandoned and the
    /// subsystem is considered gone regardless. Returns whether shutdown was
    /// clean.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.cancel.cancel();
        self.queue.cancel_pending();
        self.catalog.stop();

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        if handles.is_empty() {
            return true;
        }

        let deadline = tokio::time::Instant::now() + timeout;
        let mut clean = true;
        for handle in handles {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(
                        "Cluster '{}' subsystem task ended abnormally during shutdown: {}",
                        self.meta.id, e
                    );
                }
                Err(_) => {
                    warn!(
                        "Cluster '{}' subsystem did not stop within {:?}; abandoning task.",
                        self.meta.id, timeout
                    );
                    clean = false;
                }
            }
        }
        clean
    }
}

impl std::fmt::Debug for RefreshSubsystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshSubsystem")
            .field("meta", &self.meta)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

/// Builds the refresh subsystem for one cluster from its client bundle.
#[async_trait]
pub trait SubsystemFactory: Send + Sync {
    async fn build(
        &self,
        clients: &ClusterClients,
    ) -> Result<Arc<RefreshSubsystem>, KubedeckError>;
}
