// src/core/runtime.rs

//! The central runtime state: one `ClusterRuntime` per process, wiring the
//! coordinator, lifecycle manager, trackers, caches, and aggregation layer,
//! plus the consumer tasks that turn auth/transport signals into coordinated
//! mutations.

use crate::config::Config;
use crate::core::aggregate::{
    AggregateEventStream, AggregateRefreshQueue, AggregateResourceStream, AggregateSnapshotService,
};
use crate::core::auth::{AuthRetryPolicy, AuthState};
use crate::core::cache::ResponseCache;
use crate::core::clients::ClientFactory;
use crate::core::coordinator::{MutationPhase, SelectionCoordinator, SelectionMutation};
use crate::core::errors::KubedeckError;
use crate::core::events::UiEventBus;
use crate::core::fetch::FetchCoordinator;
use crate::core::lifecycle::{AuthTransition, LifecycleManager, SubsystemsListener};
use crate::core::refresh::{RefreshSubsystem, SubsystemFactory};
use crate::core::selection::ClusterSelection;
use crate::core::transport::{TransportFailureTracker, TransportPolicy};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Routes lifecycle subsystem updates into the resource stream mux.
struct ResourceStreamListener {
    resources: Arc<AggregateResourceStream>,
}

impl SubsystemsListener for ResourceStreamListener {
    fn subsystems_updated(&self, ordered: Vec<Arc<RefreshSubsystem>>) {
        self.resources.update(ordered);
    }
}

/// The process-wide runtime core.
pub struct ClusterRuntime {
    pub config: Arc<Config>,
    pub ui_bus: Arc<UiEventBus>,
    pub coordinator: Arc<SelectionCoordinator>,
    pub lifecycle: Arc<LifecycleManager>,
    pub transport: Arc<TransportFailureTracker>,
    pub response_cache: Arc<ResponseCache>,
    pub fetch: Arc<FetchCoordinator>,
    pub snapshots: Arc<AggregateSnapshotService>,
    pub events: Arc<AggregateEventStream>,
    pub resources: Arc<AggregateResourceStream>,
    pub refresh: Arc<AggregateRefreshQueue>,
    /// The app context every generation token is parented on.
    pub shutdown: CancellationToken,
    /// Clusters with a pending coordinated teardown from auth recovery, to
    /// avoid scheduling it twice for repeated Recovering signals.
    auth_recovery_scheduled: DashMap<String, ()>,
    base_url: parking_lot::RwLock<Option<String>>,
}

impl ClusterRuntime {
    /// Builds the runtime and spawns its consumer tasks (auth transitions and
    /// transport rebuilds). The caller drives selection changes and the
    /// heartbeat loop.
    pub fn start(
        config: Config,
        client_factory: Arc<dyn ClientFactory>,
        subsystem_factory: Arc<dyn SubsystemFactory>,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let shutdown = CancellationToken::new();
        let ui_bus = Arc::new(UiEventBus::new());

        let (lifecycle, auth_rx) = LifecycleManager::new(
            AuthRetryPolicy::from(&config.auth),
            client_factory,
            subsystem_factory,
            ui_bus.clone(),
        );
        let lifecycle = Arc::new(lifecycle);

        let (transport, rebuild_rx) =
            TransportFailureTracker::new(TransportPolicy::from(&config.transport));
        let transport = Arc::new(transport);

        let response_cache = Arc::new(ResponseCache::new(
            config.cache.ttl(),
            config.cache.max_entries,
        ));
        let fetch = Arc::new(
            FetchCoordinator::new(response_cache.clone(), ui_bus.clone(), &config.fetch)
                .with_transport_tracker(transport.clone()),
        );

        let coordinator = Arc::new(SelectionCoordinator::new(shutdown.clone()));
        let snapshots = Arc::new(AggregateSnapshotService::new(lifecycle.clone()));
        let events = Arc::new(AggregateEventStream::new(
            snapshots.clone(),
            config.streams.event_entry_buffer,
            config.streams.event_resume_buffer,
        ));
        let resources = Arc::new(AggregateResourceStream::new());
        let refresh = Arc::new(AggregateRefreshQueue::new(
            lifecycle.clone(),
            snapshots.clone(),
        ));

        lifecycle.set_subsystems_listener(Arc::new(ResourceStreamListener {
            resources: resources.clone(),
        }));

        let runtime = Arc::new(Self {
            config,
            ui_bus,
            coordinator,
            lifecycle,
            transport,
            response_cache,
            fetch,
            snapshots,
            events,
            resources,
            refresh,
            shutdown,
            auth_recovery_scheduled: DashMap::new(),
            base_url: parking_lot::RwLock::new(None),
        });

        tokio::spawn(Arc::clone(&runtime).run_auth_transition_consumer(auth_rx));
        tokio::spawn(Arc::clone(&runtime).run_transport_rebuild_consumer(rebuild_rx));

        runtime
    }

    /// The advertised base URL of the HTTP facade, once it is bound.
    pub fn refresh_base_url(&self) -> Option<String> {
        self.base_url.read().clone()
    }

    pub fn set_refresh_base_url(&self, url: String) {
        *self.base_url.write() = Some(url);
    }

    /// Applies a new cluster selection as a coordinated mutation.
    pub async fn set_selected_kubeconfigs(
        self: &Arc<Self>,
        selections: Vec<ClusterSelection>,
    ) -> Result<(), KubedeckError> {
        let runtime = Arc::clone(self);
        self.coordinator
            .run_selection_mutation("set-selected-kubeconfigs", move |mutation| async move {
                runtime.apply_selection(mutation, selections).await
            })
            .await
    }

    /// The selection mutation body: client pool sync, subsystem
    /// reconciliation, and cache invalidation, checking for preemption
    /// between phases.
    async fn apply_selection(
        &self,
        mutation: SelectionMutation,
        selections: Vec<ClusterSelection>,
    ) -> Result<(), KubedeckError> {
        let intent_started = Instant::now();
        let desired_ids: Vec<String> = selections
            .iter()
            .map(ClusterSelection::cluster_id)
            .collect();
        let previous_ids = self.lifecycle.cluster_order();
        mutation
            .phases
            .record(MutationPhase::Intent, intent_started.elapsed());
        mutation.check_canceled()?;

        let sync_started = Instant::now();
        self.lifecycle.sync_cluster_client_pool(&selections).await;
        mutation
            .phases
            .record(MutationPhase::ClientSync, sync_started.elapsed());
        mutation.check_canceled()?;

        let refresh_started = Instant::now();
        self.lifecycle
            .update_refresh_subsystem_selections(&selections)
            .await;
        mutation
            .phases
            .record(MutationPhase::Refresh, refresh_started.elapsed());

        let commit_started = Instant::now();
        for removed in previous_ids.iter().filter(|id| !desired_ids.contains(id)) {
            self.response_cache.invalidate_selection(removed);
            self.transport.remove(removed);
            self.auth_recovery_scheduled.remove(removed);
        }
        mutation
            .phases
            .record(MutationPhase::Commit, commit_started.elapsed());

        info!(
            "Selection applied (gen {}): {:?}",
            mutation.generation, desired_ids
        );
        Ok(())
    }

    /// Schedules a coordinated rebuild of one cluster.
    pub async fn rebuild_cluster(self: &Arc<Self>, cluster_id: &str) -> Result<(), KubedeckError> {
        let runtime = Arc::clone(self);
        let id = cluster_id.to_string();
        self.coordinator
            .run_selection_mutation("rebuild-cluster", move |mutation| async move {
                mutation.check_canceled()?;
                runtime.lifecycle.rebuild_cluster_subsystem(&id).await
            })
            .await
    }

    /// Schedules a coordinated teardown of one cluster's subsystem.
    pub async fn teardown_cluster(self: &Arc<Self>, cluster_id: &str) -> Result<(), KubedeckError> {
        let runtime = Arc::clone(self);
        let id = cluster_id.to_string();
        self.coordinator
            .run_selection_mutation("teardown-cluster", move |mutation| async move {
                mutation.check_canceled()?;
                runtime.lifecycle.teardown_cluster_subsystem(&id).await;
                Ok(())
            })
            .await
    }

    /// Consumes auth state transitions (handed off from callbacks that run
    /// under the manager's lock) and turns them into coordinated mutations
    /// and UI events.
    async fn run_auth_transition_consumer(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<AuthTransition>,
    ) {
        loop {
            let transition = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                next = rx.recv() => match next {
                    Some(t) => t,
                    None => return,
                },
            };

            let cluster_id = transition.cluster_id.clone();
            match transition.state {
                AuthState::Recovering => {
                    if self
                        .auth_recovery_scheduled
                        .insert(cluster_id.clone(), ())
                        .is_some()
                    {
                        debug!(
                            "Cluster '{}' teardown already scheduled for auth recovery.",
                            cluster_id
                        );
                        continue;
                    }
                    self.ui_bus
                        .emit_auth_recovering(&cluster_id, &transition.reason);
                    let runtime = Arc::clone(&self);
                    self.coordinator.run_selection_mutation_async(
                        format!("auth-teardown:{cluster_id}"),
                        move |mutation| async move {
                            mutation.check_canceled()?;
                            runtime
                                .lifecycle
                                .teardown_cluster_subsystem(&cluster_id)
                                .await;
                            Ok(())
                        },
                    );
                }
                AuthState::Valid => {
                    self.auth_recovery_scheduled.remove(&cluster_id);
                    self.ui_bus.emit_auth_recovered(&cluster_id);
                    let runtime = Arc::clone(&self);
                    self.coordinator.run_selection_mutation_async(
                        format!("rebuild-cluster:{cluster_id}"),
                        move |mutation| async move {
                            mutation.check_canceled()?;
                            runtime
                                .lifecycle
                                .rebuild_cluster_subsystem(&cluster_id)
                                .await
                        },
                    );
                }
                AuthState::Invalid => {
                    self.auth_recovery_scheduled.remove(&cluster_id);
                    self.ui_bus
                        .emit_auth_failed(&cluster_id, &transition.reason);
                    // No rebuild for an invalid cluster, but a subsystem that
                    // is still running against dead credentials comes down.
                    // Usually a no-op: the recovering teardown already ran.
                    let runtime = Arc::clone(&self);
                    self.coordinator.run_selection_mutation_async(
                        format!("auth-teardown:{cluster_id}"),
                        move |mutation| async move {
                            mutation.check_canceled()?;
                            runtime
                                .lifecycle
                                .teardown_cluster_subsystem(&cluster_id)
                                .await;
                            Ok(())
                        },
                    );
                }
            }
        }
    }

    /// Consumes transport rebuild requests. The rebuild runs as a coordinated
    /// mutation so it serializes against other cluster-set work; the tracker
    /// state is cleared on exit regardless of the outcome.
    async fn run_transport_rebuild_consumer(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<String>,
    ) {
        loop {
            let cluster_id = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                next = rx.recv() => match next {
                    Some(id) => id,
                    None => return,
                },
            };

            info!(
                "Cluster '{}' transport rebuild starting after repeated failures.",
                cluster_id
            );
            let result = self.rebuild_cluster(&cluster_id).await;
            self.transport.finish_rebuild(&cluster_id);
            if let Err(e) = result {
                warn!("Cluster '{}' transport rebuild failed: {}", cluster_id, e);
            }
        }
    }

    /// Stops the whole runtime. Shutdown always proceeds; errors are logged.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.lifecycle.shutdown_all().await;
        info!("Cluster runtime stopped.");
    }
}

impl std::fmt::Debug for ClusterRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterRuntime")
            .field("clusters", &self.lifecycle.cluster_order())
            .finish()
    }
}
