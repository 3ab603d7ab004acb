// src/core/lifecycle.rs

//! The per-cluster lifecycle manager: builds, tears down, and rebuilds client
//! bundles and refresh subsystems, one cluster at a time, in isolation.

use crate::core::auth::{AuthManager, AuthRetryPolicy, AuthState};
use crate::core::clients::{
    ApiAuthProbe, BuiltApi, ClientFactory, ClusterClients, UnavailableApi,
};
use crate::core::errors::KubedeckError;
use crate::core::events::UiEventBus;
use crate::core::metrics;
use crate::core::refresh::{RefreshSubsystem, SubsystemFactory};
use crate::core::selection::{ClusterMeta, ClusterSelection};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// How long a subsystem gets to stop before it is abandoned.
const SUBSYSTEM_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// One auth state change, handed off from the manager's callback (which runs
/// under the manager's lock) to the runtime consumer task.
#[derive(Debug, Clone)]
pub struct AuthTransition {
    pub cluster_id: String,
    pub state: AuthState,
    pub reason: String,
}

/// Notified whenever the set of live subsystems changes, in configured order.
pub trait SubsystemsListener: Send + Sync {
    fn subsystems_updated(&self, ordered: Vec<Arc<RefreshSubsystem>>);
}

/// Owns the `id → ClusterClients` and `id → RefreshSubsystem` maps.
///
/// Cross-cluster isolation invariant: any failure state in one cluster must
/// never prevent another cluster from being added, kept, or rebuilt.
pub struct LifecycleManager {
    auth_policy: AuthRetryPolicy,
    client_factory: Arc<dyn ClientFactory>,
    subsystem_factory: Arc<dyn SubsystemFactory>,
    ui_bus: Arc<UiEventBus>,
    auth_tx: mpsc::UnboundedSender<AuthTransition>,
    /// Guards the clients map only; never held across I/O.
    clients: RwLock<HashMap<String, Arc<ClusterClients>>>,
    /// Guards the subsystems map only; never held across I/O.
    subsystems: RwLock<HashMap<String, Arc<RefreshSubsystem>>>,
    /// Configured cluster order; auth-failed clusters stay in the order even
    /// without a subsystem.
    order: RwLock<Vec<String>>,
    listener: RwLock<Option<Arc<dyn SubsystemsListener>>>,
    facade_gate_tx: watch::Sender<bool>,
    facade_gate_rx: watch::Receiver<bool>,
}

impl LifecycleManager {
    /// Creates the manager plus the receiver for auth transitions.
    pub fn new(
        auth_policy: AuthRetryPolicy,
        client_factory: Arc<dyn ClientFactory>,
        subsystem_factory: Arc<dyn SubsystemFactory>,
        ui_bus: Arc<UiEventBus>,
    ) -> (Self, mpsc::UnboundedReceiver<AuthTransition>) {
        let (auth_tx, auth_rx) = mpsc::unbounded_channel();
        let (facade_gate_tx, facade_gate_rx) = watch::channel(false);
        (
            Self {
                auth_policy,
                client_factory,
                subsystem_factory,
                ui_bus,
                auth_tx,
                clients: RwLock::new(HashMap::new()),
                subsystems: RwLock::new(HashMap::new()),
                order: RwLock::new(Vec::new()),
                listener: RwLock::new(None),
                facade_gate_tx,
                facade_gate_rx,
            },
            auth_rx,
        )
    }

    /// Wires the aggregate layer's subsystem listener.
    pub fn set_subsystems_listener(&self, listener: Arc<dyn SubsystemsListener>) {
        *self.listener.write() = Some(listener);
    }

    /// A receiver that flips to true once the HTTP facade should start.
    pub fn facade_gate(&self) -> watch::Receiver<bool> {
        self.facade_gate_rx.clone()
    }

    pub fn facade_started(&self) -> bool {
        *self.facade_gate_rx.borrow()
    }

    /// Opens the facade gate (idempotent).
    pub fn open_facade_gate(&self) {
        self.facade_gate_tx.send_replace(true);
    }

    /// Builds the client bundle for one cluster, attaching a fresh
    /// `AuthManager`. Construction failures degrade to an unavailable API
    /// surface with `auth_failed_on_init` set; the cluster stays listed and
    /// retriable.
    pub async fn build_cluster_clients(
        &self,
        selection: &ClusterSelection,
        meta: &ClusterMeta,
    ) -> ClusterClients {
        let auth = AuthManager::new(meta.id.clone(), self.auth_policy.clone());

        let tx = self.auth_tx.clone();
        let callback_id = meta.id.clone();
        auth.on_state_change(Box::new(move |state, reason| {
            // Runs under the manager's lock: hand off through the channel,
            // never do work inline.
            let _ = tx.send(AuthTransition {
                cluster_id: callback_id.clone(),
                state,
                reason: reason.to_string(),
            });
        }));

        let ui_bus = self.ui_bus.clone();
        let progress_id = meta.id.clone();
        auth.on_recovery_progress(Box::new(move |info| {
            ui_bus.emit_auth_progress(&progress_id, &info);
        }));

        let built = match self.client_factory.build(selection, meta).await {
            Ok(built) => built,
            Err(e) => {
                warn!(
                    "Cluster '{}' client construction failed: {}. Keeping the cluster listed as retriable.",
                    meta.id, e
                );
                BuiltApi {
                    api: Arc::new(UnavailableApi::new(e.to_string())),
                    kube: None,
                    preflight_failed: true,
                }
            }
        };

        auth.install_probe(Arc::new(ApiAuthProbe::new(built.api.clone())));

        ClusterClients::new(
            selection.clone(),
            meta.clone(),
            built.kube,
            built.api,
            auth,
            built.preflight_failed,
        )
    }

    /// Diffs the desired selections against the current client pool: builds
    /// bundles for additions, drops and closes removals.
    pub async fn sync_cluster_client_pool(&self, selections: &[ClusterSelection]) {
        let desired: Vec<(ClusterSelection, ClusterMeta)> = selections
            .iter()
            .map(|s| (s.clone(), ClusterMeta::from_selection(s)))
            .collect();
        let desired_ids: HashSet<String> = desired.iter().map(|(_, m)| m.id.clone()).collect();

        let current_ids: HashSet<String> = self.clients.read().keys().cloned().collect();

        // Build additions without holding the map lock.
        let mut built = Vec::new();
        for (selection, meta) in &desired {
            if !current_ids.contains(&meta.id) {
                built.push(Arc::new(self.build_cluster_clients(selection, meta).await));
            }
        }

        // Commit under the lock, collecting removals for cleanup afterwards.
        let removed: Vec<Arc<ClusterClients>> = {
            let mut clients = self.clients.write();
            for bundle in built {
                clients.insert(bundle.meta.id.clone(), bundle);
            }
            let removed_ids: Vec<String> = clients
                .keys()
                .filter(|id| !desired_ids.contains(*id))
                .cloned()
                .collect();
            removed_ids
                .into_iter()
                .filter_map(|id| clients.remove(&id))
                .collect()
        };

        *self.order.write() = desired.iter().map(|(_, m)| m.id.clone()).collect();

        for bundle in removed {
            info!("Cluster '{}' removed from the client pool.", bundle.meta.id);
            bundle.auth.shutdown();
        }
    }

    /// Reconciles refresh subsystems with the desired selection: keeps the
    /// live ones, builds the missing ones (skipping auth-failed clusters but
    /// keeping them in the order), and stops removed ones. The active map is
    /// swapped atomically at the end.
    pub async fn update_refresh_subsystem_selections(&self, selections: &[ClusterSelection]) {
        let desired_ids: Vec<String> = selections.iter().map(ClusterSelection::cluster_id).collect();
        let existing: HashMap<String, Arc<RefreshSubsystem>> = self.subsystems.read().clone();

        let mut next: HashMap<String, Arc<RefreshSubsystem>> = HashMap::new();
        for id in &desired_ids {
            if let Some(subsystem) = existing.get(id) {
                next.insert(id.clone(), subsystem.clone());
                continue;
            }
            let Some(clients) = self.cluster_clients(id) else {
                debug!("Cluster '{}' has no client bundle; skipping subsystem build.", id);
                continue;
            };
            if clients.auth_failed_on_init() || !clients.auth.is_valid() {
                debug!(
                    "Cluster '{}' is auth-degraded; keeping it listed without a subsystem.",
                    id
                );
                continue;
            }
            match self.subsystem_factory.build(&clients).await {
                Ok(subsystem) => {
                    info!("Cluster '{}' refresh subsystem started.", id);
                    next.insert(id.clone(), subsystem);
                }
                Err(e) => {
                    // Isolation: a build failure here must not affect the
                    // other clusters in this reconciliation.
                    warn!("Cluster '{}' subsystem build failed: {}", id, e);
                }
            }
        }

        for (id, subsystem) in &existing {
            if !desired_ids.contains(id) {
                self.stop_subsystem(subsystem).await;
                info!("Cluster '{}' refresh subsystem stopped.", id);
            }
        }

        *self.subsystems.write() = next;
        self.after_subsystems_changed();
    }

    /// Rebuilds the clients and subsystem for a single cluster, preserving
    /// its existing `AuthManager` across the swap.
    pub async fn rebuild_cluster_subsystem(&self, cluster_id: &str) -> Result<(), KubedeckError> {
        let existing = self
            .cluster_clients(cluster_id)
            .ok_or_else(|| KubedeckError::ClusterUnavailable(cluster_id.to_string()))?;

        if let Some(subsystem) = self.subsystem(cluster_id) {
            self.stop_subsystem(&subsystem).await;
            self.subsystems.write().remove(cluster_id);
        }

        let fresh = self
            .build_cluster_clients(&existing.selection, &existing.meta)
            .await;
        // The rebuild keeps the long-lived auth manager; the one the build
        // just created is discarded.
        fresh.auth.shutdown();
        let preserved = existing.auth.clone();
        preserved.install_probe(Arc::new(ApiAuthProbe::new(fresh.api.clone())));

        let bundle = Arc::new(fresh.with_auth(preserved));
        bundle.clear_auth_failed_on_init();
        self.clients
            .write()
            .insert(cluster_id.to_string(), bundle.clone());

        if bundle.auth.is_valid() {
            match self.subsystem_factory.build(&bundle).await {
                Ok(subsystem) => {
                    self.subsystems
                        .write()
                        .insert(cluster_id.to_string(), subsystem);
                    info!("Cluster '{}' rebuilt.", cluster_id);
                }
                Err(e) => {
                    warn!("Cluster '{}' subsystem rebuild failed: {}", cluster_id, e);
                }
            }
        }

        self.after_subsystems_changed();
        Ok(())
    }

    /// Stops one cluster's subsystem and removes it from the map. No effect
    /// on other clusters; the client bundle stays so the cluster remains
    /// listed.
    pub async fn teardown_cluster_subsystem(&self, cluster_id: &str) {
        let Some(subsystem) = self.subsystems.write().remove(cluster_id) else {
            return;
        };
        self.stop_subsystem(&subsystem).await;
        info!("Cluster '{}' subsystem torn down.", cluster_id);
        self.after_subsystems_changed();
    }

    async fn stop_subsystem(&self, subsystem: &Arc<RefreshSubsystem>) {
        subsystem.stop_permission_revalidation();
        if !subsystem.shutdown(SUBSYSTEM_SHUTDOWN_TIMEOUT).await {
            warn!(
                "Cluster '{}' subsystem shutdown timed out; entry dropped regardless.",
                subsystem.meta.id
            );
        }
        subsystem.catalog.stop();
    }

    fn after_subsystems_changed(&self) {
        let ordered = self.subsystems_in_order();
        metrics::LIVE_CLUSTERS.set(ordered.len() as f64);
        if !ordered.is_empty() {
            self.open_facade_gate();
        }
        if let Some(listener) = self.listener.read().clone() {
            listener.subsystems_updated(ordered);
        }
    }

    // --- Accessors ---

    pub fn cluster_clients(&self, cluster_id: &str) -> Option<Arc<ClusterClients>> {
        self.clients.read().get(cluster_id).cloned()
    }

    pub fn all_clients_in_order(&self) -> Vec<Arc<ClusterClients>> {
        let clients = self.clients.read();
        self.order
            .read()
            .iter()
            .filter_map(|id| clients.get(id).cloned())
            .collect()
    }

    pub fn subsystem(&self, cluster_id: &str) -> Option<Arc<RefreshSubsystem>> {
        self.subsystems.read().get(cluster_id).cloned()
    }

    /// Live subsystems in configured cluster order.
    pub fn subsystems_in_order(&self) -> Vec<Arc<RefreshSubsystem>> {
        let subsystems = self.subsystems.read();
        self.order
            .read()
            .iter()
            .filter_map(|id| subsystems.get(id).cloned())
            .collect()
    }

    pub fn active_subsystem_ids(&self) -> Vec<String> {
        self.subsystems_in_order()
            .iter()
            .map(|s| s.meta.id.clone())
            .collect()
    }

    /// The primary cluster: first in configured order with a live subsystem.
    pub fn primary_subsystem(&self) -> Option<Arc<RefreshSubsystem>> {
        self.subsystems_in_order().into_iter().next()
    }

    pub fn cluster_order(&self) -> Vec<String> {
        self.order.read().clone()
    }

    /// Stops everything. Shutdown errors are logged; shutdown always proceeds.
    pub async fn shutdown_all(&self) {
        let subsystems: Vec<Arc<RefreshSubsystem>> =
            self.subsystems.write().drain().map(|(_, s)| s).collect();
        for subsystem in subsystems {
            self.stop_subsystem(&subsystem).await;
        }
        let clients: Vec<Arc<ClusterClients>> =
            self.clients.write().drain().map(|(_, c)| c).collect();
        for bundle in clients {
            bundle.auth.shutdown();
        }
        metrics::LIVE_CLUSTERS.set(0.0);
    }
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("clusters", &self.cluster_order())
            .field("live_subsystems", &self.active_subsystem_ids())
            .finish()
    }
}
