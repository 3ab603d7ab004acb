// src/core/refresh/events.rs

//! The per-cluster event manager: a broadcast hub the cluster's watch feeder
//! publishes into and the aggregate event stream subscribes from.

use crate::core::scope::ScopeSelector;
use crate::core::selection::ClusterMeta;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, Receiver, Sender};
use tracing::debug;

/// Capacity of each cluster's event broadcast channel. Slow subscribers lag
/// and miss entries rather than backpressuring the watch feeder.
const CLUSTER_EVENT_CHANNEL_CAPACITY: usize = 1024;

/// One event observed on a cluster, decorated with cluster attribution before
/// it reaches a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStreamEvent {
    #[serde(rename = "clusterId", skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
    #[serde(rename = "clusterName", skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
    #[serde(rename = "eventType")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
}

impl ClusterStreamEvent {
    /// Fills in cluster attribution when the producer left it empty.
    pub fn decorate(mut self, meta: &ClusterMeta) -> Self {
        if self.cluster_id.is_none() {
            self.cluster_id = Some(meta.id.clone());
        }
        if self.cluster_name.is_none() {
            self.cluster_name = Some(meta.name.clone());
        }
        self
    }

    /// Whether this event falls inside the given scope selector.
    pub fn matches_scope(&self, selector: &ScopeSelector) -> bool {
        match selector {
            ScopeSelector::Cluster | ScopeSelector::Other(_) => true,
            ScopeSelector::Namespace(ns) => self.namespace.as_deref() == Some(ns.as_str()),
            ScopeSelector::Object {
                kind,
                namespace,
                name,
            } => {
                self.kind == *kind
                    && self.namespace.as_deref() == Some(namespace.as_str())
                    && self.name == *name
            }
        }
    }
}

/// The broadcast hub for one cluster's events.
#[derive(Debug)]
pub struct ClusterEventManager {
    meta: ClusterMeta,
    sender: Sender<ClusterStreamEvent>,
}

impl ClusterEventManager {
    pub fn new(meta: ClusterMeta) -> Self {
        let (sender, _) = broadcast::channel(CLUSTER_EVENT_CHANNEL_CAPACITY);
        Self { meta, sender }
    }

    pub fn meta(&self) -> &ClusterMeta {
        &self.meta
    }

    /// Provides a new receiver for an aggregate stream to subscribe to.
    pub fn subscribe(&self) -> Receiver<ClusterStreamEvent> {
        self.sender.subscribe()
    }

    /// Publishes one event to all subscribers, decorating it with this
    /// cluster's identity if the producer left attribution empty.
    pub fn publish(&self, event: ClusterStreamEvent) {
        let event = event.decorate(&self.meta);
        if self.sender.send(event).is_err() {
            debug!(
                "Cluster '{}' published an event with no active subscribers.",
                self.meta.id
            );
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
