// tests/integration/test_helpers.rs

//! Test helpers: an in-memory cluster backend and a full runtime fixture.

// Not every test binary exercises every helper.
#![allow(dead_code)]

use async_trait::async_trait;
use dashmap::DashMap;
use kubedeck::config::Config;
use kubedeck::core::ClusterRuntime;
use kubedeck::core::clients::{BuiltApi, ClientFactory, ClusterApi, ClusterClients};
use kubedeck::core::errors::KubedeckError;
use kubedeck::core::events::UiEvent;
use kubedeck::core::heartbeat::HeartbeatLoop;
use kubedeck::core::refresh::{
    CatalogEntry, CatalogService, ClusterEventManager, ClusterStreamEvent, DomainSnapshot,
    RefreshHandler, RefreshQueue, RefreshSubsystem, RefreshWorker, ResourceDelta,
    ResourceStreamAdapter, SnapshotEntry, SnapshotProvider, SubsystemFactory,
};
use kubedeck::core::scope::ScopeSelector;
use kubedeck::core::selection::{ClusterMeta, ClusterSelection};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, reload};

/// Scripted behavior for one in-memory cluster.
#[derive(Default)]
pub struct ClusterBehavior {
    /// Client construction fails outright.
    pub fail_build: AtomicBool,
    /// Credential pre-flight fails at build time.
    pub fail_preflight: AtomicBool,
    /// Subsystem construction fails.
    pub fail_subsystem: AtomicBool,
    /// Scripted auth-probe results, consumed front to back; empty means Ok
    /// (unless `fail_preflight` is set).
    pub probe_results: Mutex<VecDeque<Result<(), KubedeckError>>>,
    /// Scripted `/readyz` results, consumed front to back; empty means Ok.
    pub ready_results: Mutex<VecDeque<Result<(), KubedeckError>>>,
    /// Number of `/readyz` probes issued against this cluster.
    pub ready_probes: AtomicU64,
    /// Entries served by the snapshot provider.
    pub snapshot_entries: Mutex<Vec<SnapshotEntry>>,
    /// When set, snapshot builds fail with this message.
    pub snapshot_error: Mutex<Option<String>>,
    /// Items served by the resource stream snapshot.
    pub stream_items: Mutex<Vec<serde_json::Value>>,
    /// When set, manual refreshes fail with this message.
    pub refresh_error: Mutex<Option<String>>,
    /// Number of manual refreshes executed.
    pub refreshes: AtomicU64,
    /// Artificial delay per manual refresh.
    pub refresh_delay: Mutex<Duration>,
}

impl ClusterBehavior {
    pub fn push_ready(&self, result: Result<(), KubedeckError>) {
        self.ready_results.lock().push_back(result);
    }

    pub fn push_probe(&self, result: Result<(), KubedeckError>) {
        self.probe_results.lock().push_back(result);
    }

    pub fn set_snapshot_entries(&self, entries: Vec<SnapshotEntry>) {
        *self.snapshot_entries.lock() = entries;
    }

    pub fn set_snapshot_error(&self, message: &str) {
        *self.snapshot_error.lock() = Some(message.to_string());
    }
}

/// The in-memory `ClusterApi`.
pub struct TestApi {
    behavior: Arc<ClusterBehavior>,
}

#[async_trait]
impl ClusterApi for TestApi {
    async fn check_ready(&self, _timeout: Duration) -> Result<(), KubedeckError> {
        self.behavior.ready_probes.fetch_add(1, Ordering::Relaxed);
        self.behavior.ready_results.lock().pop_front().unwrap_or(Ok(()))
    }

    async fn preflight(&self) -> Result<(), KubedeckError> {
        if let Some(result) = self.behavior.probe_results.lock().pop_front() {
            return result;
        }
        if self.behavior.fail_preflight.load(Ordering::Relaxed) {
            return Err(KubedeckError::AuthFailure(
                "scripted pre-flight failure".to_string(),
            ));
        }
        Ok(())
    }

    async fn list_resources(
        &self,
        _domain: &str,
        namespace: Option<&str>,
    ) -> Result<Vec<SnapshotEntry>, KubedeckError> {
        if let Some(message) = self.behavior.snapshot_error.lock().clone() {
            return Err(KubedeckError::Internal(message));
        }
        let entries = self
            .behavior
            .snapshot_entries
            .lock()
            .iter()
            .filter(|e| namespace.is_none() || e.namespace.as_deref() == namespace)
            .cloned()
            .collect();
        Ok(entries)
    }

    async fn discover_catalog(&self) -> Result<Vec<CatalogEntry>, KubedeckError> {
        Ok(vec![CatalogEntry {
            kind: "Pod".to_string(),
            group: String::new(),
            version: "v1".to_string(),
            namespaced: true,
        }])
    }
}

struct TestSnapshotProvider {
    meta: ClusterMeta,
    api: Arc<dyn ClusterApi>,
}

#[async_trait]
impl SnapshotProvider for TestSnapshotProvider {
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
        snapshot.stats.total = entries.len();
        snapshot.entries = entries;
        Ok(snapshot)
    }
}

pub struct TestStreamAdapter {
    behavior: Arc<ClusterBehavior>,
    channels: DashMap<String, broadcast::Sender<ResourceDelta>>,
}

impl TestStreamAdapter {
    pub fn publish(&self, delta: ResourceDelta) {
        if let Some(sender) = self.channels.get(&delta.kind) {
            let _ = sender.send(delta);
        }
    }
}

#[async_trait]
impl ResourceStreamAdapter for TestStreamAdapter {
    async fn snapshot(
        &self,
        _kind: &str,
        _namespace: Option<&str>,
    ) -> Result<Vec<serde_json::Value>, KubedeckError> {
        Ok(self.behavior.stream_items.lock().clone())
    }

    async fn subscribe(
        &self,
        kind: &str,
    ) -> Result<broadcast::Receiver<ResourceDelta>, KubedeckError> {
        let sender = self
            .channels
            .entry(kind.to_string())
            .or_insert_with(|| broadcast::channel(64).0)
            .clone();
        Ok(sender.subscribe())
    }
}

struct TestRefreshHandler {
    behavior: Arc<ClusterBehavior>,
}

#[async_trait]
impl RefreshHandler for TestRefreshHandler {
    async fn refresh(&self, _domain: &str, _scope: &str) -> Result<(), KubedeckError> {
        let delay = *self.behavior.refresh_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.behavior.refreshes.fetch_add(1, Ordering::Relaxed);
        match self.behavior.refresh_error.lock().clone() {
            Some(message) => Err(KubedeckError::Internal(message)),
            None => Ok(()),
        }
    }
}

/// The in-memory backend: both factories in one object, scripted per cluster.
#[derive(Default)]
pub struct TestBackend {
    behaviors: DashMap<String, Arc<ClusterBehavior>>,
    /// Adapters by cluster id, for delta publishing from tests.
    adapters: DashMap<String, Arc<TestStreamAdapter>>,
}

impl TestBackend {
    pub fn behavior(&self, cluster_id: &str) -> Arc<ClusterBehavior> {
        self.behaviors
            .entry(cluster_id.to_string())
            .or_default()
            .clone()
    }

    pub fn adapter(&self, cluster_id: &str) -> Option<Arc<TestStreamAdapter>> {
        self.adapters.get(cluster_id).map(|a| a.clone())
    }
}

#[async_trait]
impl ClientFactory for TestBackend {
    async fn build(
        &self,
        _selection: &ClusterSelection,
        meta: &ClusterMeta,
    ) -> Result<BuiltApi, KubedeckError> {
        let behavior = self.behavior(&meta.id);
        if behavior.fail_build.load(Ordering::Relaxed) {
            return Err(KubedeckError::TransportFailure(
                "scripted client build failure".to_string(),
            ));
        }
        Ok(BuiltApi {
            api: Arc::new(TestApi {
                behavior: behavior.clone(),
            }),
            kube: None,
            preflight_failed: behavior.fail_preflight.load(Ordering::Relaxed),
        })
    }
}

#[async_trait]
impl SubsystemFactory for TestBackend {
    async fn build(
        &self,
        clients: &ClusterClients,
    ) -> Result<Arc<RefreshSubsystem>, KubedeckError> {
        let behavior = self.behavior(&clients.meta.id);
        if behavior.fail_subsystem.load(Ordering::Relaxed) {
            return Err(KubedeckError::Internal(
                "scripted subsystem build failure".to_string(),
            ));
        }
        let meta = clients.meta.clone();
        let events = Arc::new(ClusterEventManager::new(meta.clone()));
        let snapshots = Arc::new(TestSnapshotProvider {
            meta: meta.clone(),
            api: clients.api.clone(),
        });
        let adapter = Arc::new(TestStreamAdapter {
            behavior: behavior.clone(),
            channels: DashMap::new(),
        });
        self.adapters.insert(meta.id.clone(), adapter.clone());
        let (queue, queue_rx) = RefreshQueue::new(meta.clone());
        let catalog = Arc::new(CatalogService::new(meta.clone()));

        let subsystem = RefreshSubsystem::new(
            meta,
            snapshots,
            events,
            adapter,
            queue.clone(),
            catalog,
        );

        let worker = RefreshWorker::new(
            queue,
            Arc::new(TestRefreshHandler {
                behavior: behavior.clone(),
            }),
        );
        let worker_cancel = subsystem.cancel_token();
        subsystem.track(tokio::spawn(worker.run(queue_rx, worker_cancel)));
        Ok(subsystem)
    }
}

/// A complete runtime wired to the in-memory backend.
pub struct TestContext {
    pub runtime: Arc<ClusterRuntime>,
    pub backend: Arc<TestBackend>,
}

impl TestContext {
    /// Fast timings so recovery and retries settle within milliseconds.
    pub fn fast_config() -> Config {
        let mut config = Config::default();
        config.auth.max_attempts = 3;
        config.auth.initial_backoff_ms = 10;
        config.auth.max_backoff_ms = 40;
        config.auth.progress_tick_ms = 5;
        config.fetch.retry_delay_ms = 1;
        config.cache.ttl_ms = 60;
        // Heartbeat sweeps are driven manually in tests.
        config.heartbeat.interval_secs = 3600;
        config
    }

    pub async fn new() -> Self {
        Self::with_config(Self::fast_config()).await
    }

    pub async fn with_config(config: Config) -> Self {
        let env_filter = EnvFilter::new("warn");
        let (filter, _reload_handle) = reload::Layer::new(env_filter);
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .try_init();

        let backend = Arc::new(TestBackend::default());
        let runtime = ClusterRuntime::start(config, backend.clone(), backend.clone());
        Self { runtime, backend }
    }

    /// Applies a selection from raw `"path:context"` strings.
    pub async fn select(&self, raw: &[&str]) -> Result<(), KubedeckError> {
        let selections: Vec<ClusterSelection> = raw
            .iter()
            .map(|r| ClusterSelection::parse(r).expect("test selection must parse"))
            .collect();
        self.runtime.set_selected_kubeconfigs(selections).await
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.runtime.lifecycle.active_subsystem_ids()
    }

    pub fn heartbeat(&self) -> HeartbeatLoop {
        HeartbeatLoop::new(
            self.runtime.lifecycle.clone(),
            self.runtime.ui_bus.clone(),
            &self.runtime.config.heartbeat,
        )
    }

    /// Publishes one event through a cluster's event manager.
    pub fn publish_event(&self, cluster_id: &str, event: ClusterStreamEvent) {
        self.runtime
            .lifecycle
            .subsystem(cluster_id)
            .expect("cluster must have a live subsystem")
            .events
            .publish(event);
    }
}

/// A minimal stream event for tests.
pub fn make_event(name: &str, namespace: Option<&str>) -> ClusterStreamEvent {
    ClusterStreamEvent {
        cluster_id: None,
        cluster_name: None,
        kind: "Event".to_string(),
        namespace: namespace.map(str::to_string),
        name: name.to_string(),
        event_type: "added".to_string(),
        payload: serde_json::Value::Null,
    }
}

/// A minimal snapshot entry for tests.
pub fn make_entry(kind: &str, namespace: &str, name: &str) -> SnapshotEntry {
    SnapshotEntry {
        cluster_id: String::new(),
        cluster_name: String::new(),
        kind: kind.to_string(),
        namespace: Some(namespace.to_string()),
        name: name.to_string(),
        payload: serde_json::Value::Null,
    }
}

/// Polls `condition` until it holds or the timeout elapses.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Waits for the next UI event on `channel`, ignoring others.
pub async fn wait_for_ui_event(
    rx: &mut tokio::sync::broadcast::Receiver<UiEvent>,
    channel: &str,
    timeout: Duration,
) -> Option<UiEvent> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return None;
        }
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Ok(event)) if event.channel == channel => return Some(event),
            Ok(Ok(_)) => continue,
            Ok(Err(_)) | Err(_) => return None,
        }
    }
}
