// src/core/heartbeat.rs

//! The cluster health heartbeat: periodic `/readyz` probes against every
//! selected cluster, classified into health/auth/connectivity outcomes.

use crate::config::HeartbeatConfig;
use crate::core::errors::KubedeckError;
use crate::core::events::UiEventBus;
use crate::core::lifecycle::LifecycleManager;
use crate::core::metrics;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Classification of one probe outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthOutcome {
    Ok,
    AuthFailure,
    ConnectivityFailure,
}

impl HealthOutcome {
    fn label(&self) -> &'static str {
        match self {
            HealthOutcome::Ok => "ok",
            HealthOutcome::AuthFailure => "auth",
            HealthOutcome::ConnectivityFailure => "connectivity",
        }
    }
}

/// Classifies a probe error: 401/403 and exec-credential failures are auth;
/// everything else is connectivity.
pub fn classify_probe_error(err: &KubedeckError) -> HealthOutcome {
    if err.is_auth_failure() {
        HealthOutcome::AuthFailure
    } else {
        HealthOutcome::ConnectivityFailure
    }
}

/// The process-wide heartbeat loop.
pub struct HeartbeatLoop {
    lifecycle: Arc<LifecycleManager>,
    ui_bus: Arc<UiEventBus>,
    interval: Duration,
    request_timeout: Duration,
}

impl HeartbeatLoop {
    pub fn new(
        lifecycle: Arc<LifecycleManager>,
        ui_bus: Arc<UiEventBus>,
        cfg: &HeartbeatConfig,
    ) -> Self {
        Self {
            lifecycle,
            ui_bus,
            interval: cfg.interval(),
            request_timeout: cfg.request_timeout(),
        }
    }

    /// Runs until cancellation. The first sweep fires immediately so the UI
    /// has status before the first interval elapses.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            "Cluster health heartbeat started (interval {:?}, probe timeout {:?}).",
            self.interval, self.request_timeout
        );
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Cluster health heartbeat shutting down.");
                    return;
                }
                _ = ticker.tick() => {
                    self.probe_all().await;
                }
            }
        }
    }

    /// Probes every cluster in the pool once. Clusters whose auth manager is
    /// not valid are skipped entirely; auth recovery owns them until they
    /// recover.
    pub async fn probe_all(&self) {
        let bundles = self.lifecycle.all_clients_in_order();
        let probes = bundles.into_iter().map(|bundle| async move {
            if !bundle.auth.is_valid() {
                debug!(
                    "Cluster '{}' skipped by heartbeat: auth recovery owns it.",
                    bundle.meta.id
                );
                return;
            }

            let result = bundle.api.check_ready(self.request_timeout).await;
            let outcome = match &result {
                Ok(()) => HealthOutcome::Ok,
                Err(e) => classify_probe_error(e),
            };

            metrics::HEARTBEAT_PROBES_TOTAL
                .with_label_values(&[outcome.label()])
                .inc();

            // The degraded notification goes out before the auth manager is
            // told, so the UI sees health change ahead of recovery progress.
            match outcome {
                HealthOutcome::Ok => self.ui_bus.emit_cluster_healthy(&bundle.meta),
                HealthOutcome::AuthFailure => {
                    self.ui_bus.emit_cluster_degraded(&bundle.meta, "auth");
                }
                HealthOutcome::ConnectivityFailure => {
                    self.ui_bus
                        .emit_cluster_degraded(&bundle.meta, "connectivity");
                }
            }

            if let Err(e) = result {
                debug!(
                    "Cluster '{}' heartbeat probe failed ({}): {}",
                    bundle.meta.id,
                    outcome.label(),
                    e
                );
                // Connectivity failures never touch the auth manager.
                if outcome == HealthOutcome::AuthFailure {
                    bundle.auth.report_failure(&e.to_string());
                }
            }
        });
        futures::future::join_all(probes).await;
    }
}
