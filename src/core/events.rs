// src/core/events.rs

//! The out-of-band event bus toward the desktop shell. The runtime publishes
//! cluster health/auth transitions and backend errors here; the shell emitter
//! subscribes and forwards them to the UI process.

use crate::core::auth::RecoveryInfo;
use crate::core::selection::ClusterMeta;
use serde_json::json;
use tokio::sync::broadcast::{self, Receiver, Sender};
use tracing::debug;

/// Capacity of the UI event channel. Events are small and the shell drains
/// quickly; lagging receivers simply miss stale notifications.
const UI_EVENT_BUS_CAPACITY: usize = 1024;

/// One event destined for the UI process.
#[derive(Debug, Clone, serde::Serialize)]
pub struct UiEvent {
    pub channel: String,
    pub payload: serde_json::Value,
}

/// The central hub distributing UI-facing events to shell subscribers.
#[derive(Debug)]
pub struct UiEventBus {
    sender: Sender<UiEvent>,
}

impl Default for UiEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl UiEventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(UI_EVENT_BUS_CAPACITY);
        Self { sender }
    }

    /// Provides a new receiver for a shell emitter to subscribe to events.
    pub fn subscribe(&self) -> Receiver<UiEvent> {
        self.sender.subscribe()
    }

    /// Publishes an event. It's okay if there are no active subscribers.
    pub fn emit(&self, channel: &str, payload: serde_json::Value) {
        let event = UiEvent {
            channel: channel.to_string(),
            payload,
        };
        if self.sender.send(event).is_err() {
            debug!("UI event on '{}' had no active subscribers.", channel);
        }
    }

    pub fn emit_cluster_healthy(&self, meta: &ClusterMeta) {
        self.emit(
            "cluster:health:healthy",
            json!({ "clusterId": meta.id, "clusterName": meta.name }),
        );
    }

    pub fn emit_cluster_degraded(&self, meta: &ClusterMeta, reason: &str) {
        self.emit(
            "cluster:health:degraded",
            json!({ "clusterId": meta.id, "clusterName": meta.name, "reason": reason }),
        );
    }

    pub fn emit_auth_recovered(&self, cluster_id: &str) {
        self.emit("cluster:auth:recovered", json!({ "clusterId": cluster_id }));
    }

    pub fn emit_auth_recovering(&self, cluster_id: &str, reason: &str) {
        self.emit(
            "cluster:auth:recovering",
            json!({ "clusterId": cluster_id, "reason": reason }),
        );
    }

    pub fn emit_auth_failed(&self, cluster_id: &str, reason: &str) {
        self.emit(
            "cluster:auth:failed",
            json!({ "clusterId": cluster_id, "reason": reason }),
        );
    }

    pub fn emit_auth_progress(&self, cluster_id: &str, info: &RecoveryInfo) {
        self.emit(
            "cluster:auth:progress",
            json!({
                "clusterId": cluster_id,
                "currentAttempt": info.current_attempt,
                "maxAttempts": info.max_attempts,
                "secondsUntilRetry": info.seconds_until_retry,
            }),
        );
    }

    /// A structured backend error the UI surfaces next to the affected resource.
    pub fn emit_backend_error(
        &self,
        cluster_id: &str,
        resource_kind: &str,
        identifier: &str,
        message: &str,
    ) {
        self.emit(
            "backend-error",
            json!({
                "clusterId": cluster_id,
                "resourceKind": resource_kind,
                "identifier": identifier,
                "message": message,
            }),
        );
    }

    pub fn emit_app_update(&self, payload: serde_json::Value) {
        self.emit("app-update", payload);
    }
}
