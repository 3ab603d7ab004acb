// src/core/refresh/stream.rs

//! The per-cluster resource stream seam feeding the WebSocket multiplexer.

use crate::core::errors::KubedeckError;
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;

/// A live change to one resource, as observed by a cluster's informer.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceDelta {
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(rename = "eventType")]
    pub event_type: String,
    pub item: serde_json::Value,
}

/// A frame on the multiplexed resource WebSocket.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ResourceFrame {
    /// Emitted once when a subscription starts: the full current state.
    Reset {
        #[serde(rename = "subscriptionId")]
        subscription_id: String,
        #[serde(rename = "clusterId")]
        cluster_id: String,
        kind: String,
        items: Vec<serde_json::Value>,
    },
    /// One incremental change on a subscribed kind.
    Delta {
        #[serde(rename = "subscriptionId")]
        subscription_id: String,
        #[serde(rename = "clusterId")]
        cluster_id: String,
        kind: String,
        #[serde(rename = "eventType")]
        event_type: String,
        item: serde_json::Value,
    },
    /// A per-subscription failure that does not tear down the socket.
    Error {
        #[serde(rename = "subscriptionId")]
        subscription_id: String,
        message: String,
    },
}

/// Adapter over one cluster's informer machinery: current-state reads plus a
/// change feed per resource kind.
#[async_trait]
pub trait ResourceStreamAdapter: Send + Sync {
    /// Lists the current state of `kind`, optionally namespace-filtered.
    async fn snapshot(
        &self,
        kind: &str,
        namespace: Option<&str>,
    ) -> Result<Vec<serde_json::Value>, KubedeckError>;

    /// Subscribes to live changes for `kind`. Implementations start their
    /// watch machinery lazily on first subscription.
    async fn subscribe(&self, kind: &str)
    -> Result<broadcast::Receiver<ResourceDelta>, KubedeckError>;
}
