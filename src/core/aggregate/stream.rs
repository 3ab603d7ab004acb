// src/core/aggregate/stream.rs

//! The multiplexed resource stream: one WebSocket per UI window, many
//! cluster-scoped subscriptions, explicit reset frames on subscription start.

use crate::core::errors::KubedeckError;
use crate::core::refresh::{RefreshSubsystem, ResourceFrame};
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A client request on the resource stream socket.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum StreamRequest {
    Subscribe {
        id: String,
        #[serde(default)]
        clusters: Vec<String>,
        kind: String,
        #[serde(default)]
        namespace: Option<String>,
    },
    Unsubscribe {
        id: String,
    },
}

/// Per-socket subscription bookkeeping.
#[derive(Default)]
pub struct SocketSubscriptions {
    active: HashMap<String, CancellationToken>,
}

impl SocketSubscriptions {
    pub fn cancel_all(&mut self) {
        for (_, cancel) in self.active.drain() {
            cancel.cancel();
        }
    }
}

impl Drop for SocketSubscriptions {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

/// The resource stream multiplexer. `update` rebuilds the target set in place
/// on selection change; running subscriptions keep their captured adapters
/// until the client resubscribes.
pub struct AggregateResourceStream {
    subsystems: RwLock<Vec<Arc<RefreshSubsystem>>>,
}

impl Default for AggregateResourceStream {
    fn default() -> Self {
        Self::new()
    }
}

impl AggregateResourceStream {
    pub fn new() -> Self {
        Self {
            subsystems: RwLock::new(Vec::new()),
        }
    }

    /// Swaps the ordered subsystem set on selection change.
    pub fn update(&self, ordered: Vec<Arc<RefreshSubsystem>>) {
        *self.subsystems.write() = ordered;
    }

    fn resolve(&self, clusters: &[String]) -> Result<Vec<Arc<RefreshSubsystem>>, KubedeckError> {
        let all = self.subsystems.read().clone();
        if clusters.is_empty() {
            if all.is_empty() {
                return Err(KubedeckError::ClusterUnavailable(
                    "no active clusters".to_string(),
                ));
            }
            return Ok(all);
        }
        clusters
            .iter()
            .map(|id| {
                all.iter()
                    .find(|s| s.meta.id == *id)
                    .cloned()
                    .ok_or_else(|| KubedeckError::ClusterUnavailable(id.clone()))
            })
            .collect()
    }

    /// Handles one client request, emitting frames to `out`.
    ///
    /// A subscribe emits one reset frame per target cluster and then forwards
    /// deltas until unsubscribed or the socket closes. Per-cluster failures
    /// surface as error frames; they never take down the socket.
    pub async fn handle_request(
        &self,
        request: StreamRequest,
        out: mpsc::Sender<ResourceFrame>,
        subscriptions: &mut SocketSubscriptions,
    ) {
        match request {
            StreamRequest::Subscribe {
                id,
                clusters,
                kind,
                namespace,
            } => {
                if let Some(stale) = subscriptions.active.remove(&id) {
                    stale.cancel();
                }

                let targets = match self.resolve(&clusters) {
                    Ok(targets) => targets,
                    Err(e) => {
                        let _ = out
                            .send(ResourceFrame::Error {
                                subscription_id: id,
                                message: e.to_string(),
                            })
                            .await;
                        return;
                    }
                };

                let cancel = CancellationToken::new();
                subscriptions.active.insert(id.clone(), cancel.clone());

                for target in targets {
                    self.start_cluster_subscription(
                        id.clone(),
                        kind.clone(),
                        namespace.clone(),
                        target,
                        out.clone(),
                        cancel.clone(),
                    )
                    .await;
                }
            }
            StreamRequest::Unsubscribe { id } => {
                if let Some(cancel) = subscriptions.active.remove(&id) {
                    debug!("Resource stream subscription '{}' ended.", id);
                    cancel.cancel();
                }
            }
        }
    }

    async fn start_cluster_subscription(
        &self,
        subscription_id: String,
        kind: String,
        namespace: Option<String>,
        target: Arc<RefreshSubsystem>,
        out: mpsc::Sender<ResourceFrame>,
        cancel: CancellationToken,
    ) {
        let cluster_id = target.meta.id.clone();

        // The explicit reset frame: current state before any deltas.
        let items = match target.stream.snapshot(&kind, namespace.as_deref()).await {
            Ok(items) => items,
            Err(e) => {
                let _ = out
                    .send(ResourceFrame::Error {
                        subscription_id: subscription_id.clone(),
                        message: format!("Cluster {cluster_id}: {e}"),
                    })
                    .await;
                return;
            }
        };
        if out
            .send(ResourceFrame::Reset {
                subscription_id: subscription_id.clone(),
                cluster_id: cluster_id.clone(),
                kind: kind.clone(),
                items,
            })
            .await
            .is_err()
        {
            return;
        }

        let mut deltas = match target.stream.subscribe(&kind).await {
            Ok(rx) => rx,
            Err(e) => {
                let _ = out
                    .send(ResourceFrame::Error {
                        subscription_id: subscription_id.clone(),
                        message: format!("Cluster {cluster_id}: {e}"),
                    })
                    .await;
                return;
            }
        };

        tokio::spawn(async move {
            loop {
                let delta = tokio::select! {
                    _ = cancel.cancelled() => return,
                    delta = deltas.recv() => match delta {
                        Ok(delta) => delta,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(
                                "Resource stream '{}' lagged by {} deltas on cluster '{}'.",
                                subscription_id, skipped, cluster_id
                            );
                            continue;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    },
                };
                if delta.kind != kind {
                    continue;
                }
                if let Some(ns) = &namespace
                    && delta.namespace.as_deref() != Some(ns.as_str())
                {
                    continue;
                }
                let frame = ResourceFrame::Delta {
                    subscription_id: subscription_id.clone(),
                    cluster_id: cluster_id.clone(),
                    kind: delta.kind,
                    event_type: delta.event_type,
                    item: delta.item,
                };
                if out.send(frame).await.is_err() {
                    return;
                }
            }
        });
    }
}

impl std::fmt::Debug for AggregateResourceStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateResourceStream")
            .field("clusters", &self.subsystems.read().len())
            .finish()
    }
}
