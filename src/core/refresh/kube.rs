// src/core/refresh/kube.rs

//! The production refresh subsystem: kube watcher feeders, dynamic-list
//! snapshots, discovery-backed catalog, and a relist-based refresh handler.

use super::events::{ClusterEventManager, ClusterStreamEvent};
use super::queue::{RefreshHandler, RefreshQueue, RefreshWorker};
use super::snapshot::{DomainSnapshot, SnapshotProvider};
use super::stream::{ResourceDelta, ResourceStreamAdapter};
use super::{CatalogService, RefreshSubsystem, SubsystemFactory};
use crate::core::clients::{ClusterApi, ClusterClients, kind_to_gvk};
use crate::core::errors::KubedeckError;
use crate::core::scope::ScopeSelector;
use crate::core::selection::ClusterMeta;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Event as CoreEvent;
use kube::api::{Api, ApiResource, DynamicObject, ListParams};
use kube::runtime::{WatchStreamExt, watcher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capacity of each lazily-started resource watch channel.
const RESOURCE_DELTA_CHANNEL_CAPACITY: usize = 1024;

/// Interval between permission revalidation sweeps.
const PERMISSION_REVALIDATION_INTERVAL: Duration = Duration::from_secs(300);

/// Snapshot provider backed by dynamic API lists.
struct ApiSnapshotProvider {
    meta: ClusterMeta,
    api: Arc<dyn ClusterApi>,
}

#[async_trait]
impl SnapshotProvider for ApiSnapshotProvider {
    async fn build(
        &self,
        domain: &str,
        selector: &ScopeSelector,
    ) -> Result<DomainSnapshot, KubedeckError> {
        let mut snapshot = DomainSnapshot::empty(domain, &selector.as_wire());
        let mut entries = self.api.list_resources(domain, selector.namespace()).await?;
        for entry in &mut entries {
            if entry.cluster_id.is_empty() {
                entry.cluster_id = self.meta.id.clone();
            }
            if entry.cluster_name.is_empty() {
                entry.cluster_name = self.meta.name.clone();
            }
        }
        if let ScopeSelector::Object { kind, name, .. } = selector {
            entries.retain(|e| &e.kind == kind && &e.name == name);
        }
        snapshot.stats.total = entries.len();
        snapshot.entries = entries;
        Ok(snapshot)
    }
}

/// Resource stream adapter that starts one kube watcher per kind, lazily on
/// first subscription. The informer-factory equivalent of the bundle.
struct KubeInformerAdapter {
    meta: ClusterMeta,
    client: kube::Client,
    cancel: CancellationToken,
    channels: DashMap<String, broadcast::Sender<ResourceDelta>>,
}

impl KubeInformerAdapter {
    fn spawn_watcher(&self, kind: &str, sender: broadcast::Sender<ResourceDelta>) {
        let Ok(gvk) = kind_to_gvk(kind) else {
            return;
        };
        let ar = ApiResource::from_gvk(&gvk);
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        let cancel = self.cancel.child_token();
        let kind = kind.to_string();
        let cluster_id = self.meta.id.clone();

        tokio::spawn(async move {
            let mut stream = watcher(api, watcher::Config::default())
                .default_backoff()
                .boxed();
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => return,
                    next = stream.try_next() => next,
                };
                match next {
                    Ok(Some(event)) => {
                        for delta in deltas_from(&kind, event) {
                            // Lagging subscribers miss entries; the watcher
                            // itself never blocks on them.
                            let _ = sender.send(delta);
                        }
                    }
                    Ok(None) => return,
                    Err(e) => {
                        warn!(
                            "Cluster '{}' watch on '{}' errored: {}; backing off.",
                            cluster_id, kind, e
                        );
                    }
                }
            }
        });
    }
}

fn deltas_from(kind: &str, event: watcher::Event<DynamicObject>) -> Vec<ResourceDelta> {
    let make = |event_type: &str, object: DynamicObject| ResourceDelta {
        kind: kind.to_string(),
        namespace: object.metadata.namespace.clone(),
        event_type: event_type.to_string(),
        item: serde_json::to_value(&object).unwrap_or_default(),
    };
    match event {
        watcher::Event::Apply(object) => vec![make("modified", object)],
        watcher::Event::Delete(object) => vec![make("deleted", object)],
        watcher::Event::InitApply(object) => vec![make("added", object)],
        watcher::Event::Init | watcher::Event::InitDone => Vec::new(),
    }
}

#[async_trait]
impl ResourceStreamAdapter for KubeInformerAdapter {
    async fn snapshot(
        &self,
        kind: &str,
        namespace: Option<&str>,
    ) -> Result<Vec<serde_json::Value>, KubedeckError> {
        let gvk = kind_to_gvk(kind)?;
        let ar = ApiResource::from_gvk(&gvk);
        let api: Api<DynamicObject> = match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        };
        let list = api.list(&ListParams::default()).await?;
        list.items
            .into_iter()
            .map(|o| serde_json::to_value(&o).map_err(KubedeckError::from))
            .collect()
    }

    async fn subscribe(
        &self,
        kind: &str,
    ) -> Result<broadcast::Receiver<ResourceDelta>, KubedeckError> {
        kind_to_gvk(kind)?;
        let sender = self
            .channels
            .entry(kind.to_string())
            .or_insert_with(|| {
                let (sender, _) = broadcast::channel(RESOURCE_DELTA_CHANNEL_CAPACITY);
                self.spawn_watcher(kind, sender.clone());
                sender
            })
            .clone();
        Ok(sender.subscribe())
    }
}

/// Refresh handler that forces a fresh list of the domain and republishes the
/// result as a synthetic event, so open streams converge without waiting for
/// the next watch delivery.
struct RelistRefreshHandler {
    meta: ClusterMeta,
    api: Arc<dyn ClusterApi>,
    events: Arc<ClusterEventManager>,
}

#[async_trait]
impl RefreshHandler for RelistRefreshHandler {
    async fn refresh(&self, domain: &str, scope: &str) -> Result<(), KubedeckError> {
        let selector = crate::core::scope::Scope::parse(scope)?.selector;
        let entries = self.api.list_resources(domain, selector.namespace()).await?;
        debug!(
            "Cluster '{}' manual refresh relisted {} entries for domain '{}'.",
            self.meta.id,
            entries.len(),
            domain
        );
        self.events.publish(ClusterStreamEvent {
            cluster_id: None,
            cluster_name: None,
            kind: "Refresh".to_string(),
            namespace: selector.namespace().map(str::to_string),
            name: domain.to_string(),
            event_type: "refreshed".to_string(),
            payload: serde_json::json!({ "domain": domain, "entries": entries.len() }),
        });
        Ok(())
    }
}

/// Builds the production, kube-backed refresh subsystem for one cluster.
#[derive(Debug, Default)]
pub struct KubeSubsystemFactory;

impl KubeSubsystemFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SubsystemFactory for KubeSubsystemFactory {
    async fn build(
        &self,
        clients: &ClusterClients,
    ) -> Result<Arc<RefreshSubsystem>, KubedeckError> {
        let Some(handles) = clients.kube.clone() else {
            return Err(KubedeckError::ClientsUnavailable(format!(
                "cluster '{}' has no kube client handles",
                clients.meta.id
            )));
        };
        let meta = clients.meta.clone();
        let api = clients.api.clone();

        let events = Arc::new(ClusterEventManager::new(meta.clone()));
        let snapshots = Arc::new(ApiSnapshotProvider {
            meta: meta.clone(),
            api: api.clone(),
        });
        let (queue, queue_rx) = RefreshQueue::new(meta.clone());
        let catalog = Arc::new(CatalogService::new(meta.clone()));

        let adapter = Arc::new(KubeInformerAdapter {
            meta: meta.clone(),
            client: handles.client.clone(),
            cancel: CancellationToken::new(),
            channels: DashMap::new(),
        });

        let subsystem = RefreshSubsystem::new(
            meta.clone(),
            snapshots,
            events.clone(),
            adapter.clone(),
            queue.clone(),
            catalog.clone(),
        );

        // Re-parent the adapter's watchers under the subsystem token.
        let adapter_cancel = adapter.cancel.clone();
        let subsystem_cancel = subsystem.cancel_token();
        subsystem.track(tokio::spawn(async move {
            subsystem_cancel.cancelled().await;
            adapter_cancel.cancel();
        }));

        // Cluster event feeder: core/v1 Events into the event manager.
        let event_api: Api<CoreEvent> = Api::all(handles.client.clone());
        let feeder_events = events.clone();
        let feeder_cancel = subsystem.cancel_token();
        let feeder_meta = meta.clone();
        subsystem.track(tokio::spawn(async move {
            run_event_feeder(event_api, feeder_events, feeder_cancel, feeder_meta).await;
        }));

        // Catalog discovery, published once at startup.
        let catalog_api = api.clone();
        let catalog_service = catalog.clone();
        let catalog_cancel = subsystem.cancel_token();
        let catalog_meta = meta.clone();
        subsystem.track(tokio::spawn(async move {
            let discovered = tokio::select! {
                _ = catalog_cancel.cancelled() => return,
                result = catalog_api.discover_catalog() => result,
            };
            match discovered {
                Ok(entries) => {
                    info!(
                        "Cluster '{}' catalog discovered {} resources.",
                        catalog_meta.id,
                        entries.len()
                    );
                    for entry in entries {
                        catalog_service.publish(entry);
                    }
                }
                Err(e) => warn!(
                    "Cluster '{}' catalog discovery failed: {}",
                    catalog_meta.id, e
                ),
            }
        }));

        // Manual refresh worker.
        let handler = Arc::new(RelistRefreshHandler {
            meta: meta.clone(),
            api: api.clone(),
            events: events.clone(),
        });
        let worker = RefreshWorker::new(queue.clone(), handler);
        let worker_cancel = subsystem.cancel_token();
        subsystem.track(tokio::spawn(async move {
            worker.run(queue_rx, worker_cancel).await;
        }));

        // Permission revalidation: periodic pre-flight against the cluster.
        // Failures are logged and surfaced per resource, never a teardown.
        let reval_api = api.clone();
        let reval_cancel = subsystem.revalidation_token();
        let reval_meta = meta;
        subsystem.track(tokio::spawn(async move {
            let mut interval = tokio::time::interval(PERMISSION_REVALIDATION_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = reval_cancel.cancelled() => return,
                    _ = interval.tick() => {
                        if let Err(e) = reval_api.preflight().await {
                            warn!(
                                "Cluster '{}' permission revalidation failed: {}",
                                reval_meta.id, e
                            );
                        }
                    }
                }
            }
        }));

        Ok(subsystem)
    }
}

/// Watches core/v1 Events and publishes them into the cluster event manager.
async fn run_event_feeder(
    api: Api<CoreEvent>,
    events: Arc<ClusterEventManager>,
    cancel: CancellationToken,
    meta: ClusterMeta,
) {
    let mut stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed();
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            next = stream.try_next() => next,
        };
        match next {
            Ok(Some(event)) => {
                let (event_type, object) = match event {
                    watcher::Event::Apply(o) => ("modified", o),
                    watcher::Event::InitApply(o) => ("added", o),
                    watcher::Event::Delete(o) => ("deleted", o),
                    watcher::Event::Init | watcher::Event::InitDone => continue,
                };
                events.publish(ClusterStreamEvent {
                    cluster_id: None,
                    cluster_name: None,
                    kind: "Event".to_string(),
                    namespace: object.metadata.namespace.clone(),
                    name: object.metadata.name.clone().unwrap_or_default(),
                    event_type: event_type.to_string(),
                    payload: serde_json::to_value(&object).unwrap_or_default(),
                });
            }
            Ok(None) => return,
            Err(e) => {
                warn!("Cluster '{}' event watch errored: {}; backing off.", meta.id, e);
            }
        }
    }
}
