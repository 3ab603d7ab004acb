// src/core/transport.rs

//! Per-cluster transport failure accounting: a sliding-window counter that
//! gates cooldown-limited client rebuilds.

use crate::core::errors::KubedeckError;
use crate::core::metrics;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Thresholds gating rebuilds.
#[derive(Debug, Clone)]
pub struct TransportPolicy {
    pub failure_threshold: u32,
    pub failure_window: Duration,
    pub rebuild_cooldown: Duration,
}

impl Default for TransportPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            failure_window: Duration::from_secs(30),
            rebuild_cooldown: Duration::from_secs(60),
        }
    }
}

impl From<&crate::config::TransportConfig> for TransportPolicy {
    fn from(cfg: &crate::config::TransportConfig) -> Self {
        Self {
            failure_threshold: cfg.failure_threshold,
            failure_window: Duration::from_secs(cfg.failure_window_secs),
            rebuild_cooldown: Duration::from_secs(cfg.rebuild_cooldown_secs),
        }
    }
}

#[derive(Debug, Default)]
struct FailureWindow {
    failure_count: u32,
    window_start: Option<Instant>,
    rebuild_in_progress: bool,
    last_rebuild: Option<Instant>,
}

/// Tracks transport failures per cluster and launches rebuilds through the
/// selection coordinator (via the channel handed out at construction).
///
/// The per-cluster lock is held only around counter updates, never across a
/// rebuild; the rebuild itself runs in the consumer of the rebuild channel.
#[derive(Debug)]
pub struct TransportFailureTracker {
    policy: TransportPolicy,
    states: DashMap<String, FailureWindow>,
    rebuild_tx: mpsc::UnboundedSender<String>,
}

impl TransportFailureTracker {
    /// Creates the tracker plus the receiver for rebuild requests. Each
    /// message on the receiver is a cluster id whose clients should be
    /// rebuilt; the consumer must call [`TransportFailureTracker::finish_rebuild`]
    /// when done, success or not.
    pub fn new(policy: TransportPolicy) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (rebuild_tx, rebuild_rx) = mpsc::unbounded_channel();
        (
            Self {
                policy,
                states: DashMap::new(),
                rebuild_tx,
            },
            rebuild_rx,
        )
    }

    /// Records one transport failure. Returns true when this failure crossed
    /// the threshold and a rebuild was launched.
    pub fn record_failure(&self, cluster_id: &str, reason: &str, err: &KubedeckError) -> bool {
        let now = Instant::now();
        let mut entry = self.states.entry(cluster_id.to_string()).or_default();

        match entry.window_start {
            Some(start) if now.duration_since(start) > self.policy.failure_window => {
                entry.failure_count = 0;
                entry.window_start = Some(now);
            }
            None => entry.window_start = Some(now),
            _ => {}
        }

        entry.failure_count += 1;
        debug!(
            "Cluster '{}' transport failure {}/{} ({}): {}",
            cluster_id, entry.failure_count, self.policy.failure_threshold, reason, err
        );

        let cooldown_over = entry
            .last_rebuild
            .map(|t| now.duration_since(t) >= self.policy.rebuild_cooldown)
            .unwrap_or(true);

        if entry.failure_count >= self.policy.failure_threshold
            && !entry.rebuild_in_progress
            && cooldown_over
        {
            entry.rebuild_in_progress = true;
            entry.last_rebuild = Some(now);
            warn!(
                "Cluster '{}' crossed the transport failure threshold; scheduling a client rebuild.",
                cluster_id
            );
            metrics::TRANSPORT_REBUILDS_TOTAL.inc();
            if self.rebuild_tx.send(cluster_id.to_string()).is_err() {
                // No consumer; leave the flag set so we do not spin.
                warn!(
                    "Transport rebuild channel for cluster '{}' is closed; rebuild not launched.",
                    cluster_id
                );
            }
            return true;
        }
        false
    }

    /// Records a successful request, resetting the failure counter.
    pub fn record_success(&self, cluster_id: &str) {
        if let Some(mut entry) = self.states.get_mut(cluster_id) {
            entry.failure_count = 0;
            entry.window_start = None;
        }
    }

    /// Marks a rebuild finished, clearing the window unconditionally so the
    /// next failure starts a fresh count.
    pub fn finish_rebuild(&self, cluster_id: &str) {
        if let Some(mut entry) = self.states.get_mut(cluster_id) {
            entry.failure_count = 0;
            entry.window_start = None;
            entry.rebuild_in_progress = false;
        }
    }

    /// Drops all tracking state for a removed cluster.
    pub fn remove(&self, cluster_id: &str) {
        self.states.remove(cluster_id);
    }

    /// Current `(failure_count, rebuild_in_progress)` for diagnostics.
    pub fn snapshot(&self, cluster_id: &str) -> Option<(u32, bool)> {
        self.states
            .get(cluster_id)
            .map(|e| (e.failure_count, e.rebuild_in_progress))
    }
}
