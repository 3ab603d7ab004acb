// src/core/clients.rs

//! Per-cluster API client bundles: the `ClusterClients` struct owned by the
//! lifecycle manager, the `ClusterApi` seam the core consumes, and the
//! kube-backed production factory.

use crate::core::auth::{AuthManager, AuthProbe};
use crate::core::errors::KubedeckError;
use crate::core::refresh::CatalogEntry;
use crate::core::refresh::snapshot::SnapshotEntry;
use crate::core::selection::{ClusterMeta, ClusterSelection};
use async_trait::async_trait;
use kube::api::{Api, ApiResource, DynamicObject, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::GroupVersionKind;
use kube::discovery::{Discovery, Scope};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// The wrapped Kubernetes API surface the runtime core consumes. The
/// wire-level details live behind this seam.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Probes `/readyz` with the given timeout.
    async fn check_ready(&self, timeout: Duration) -> Result<(), KubedeckError>;

    /// Verifies that the credentials work at all (used at build time and by
    /// auth recovery).
    async fn preflight(&self) -> Result<(), KubedeckError>;

    /// Lists the resources of one domain, optionally namespace-filtered,
    /// already shaped as snapshot entries (without cluster attribution).
    async fn list_resources(
        &self,
        domain: &str,
        namespace: Option<&str>,
    ) -> Result<Vec<SnapshotEntry>, KubedeckError>;

    /// Runs API discovery and returns the cluster's object catalog.
    async fn discover_catalog(&self) -> Result<Vec<CatalogEntry>, KubedeckError>;
}

/// Concrete kube handles carried alongside the `ClusterApi` seam so the
/// production subsystem factory can build watchers. `None` in tests.
#[derive(Clone)]
pub struct KubeHandles {
    pub client: kube::Client,
    pub rest_config: kube::Config,
}

/// The client bundle for one cluster.
///
/// Owned by the lifecycle manager and replaced atomically on rebuild; the
/// `AuthManager` is preserved across the swap — its identity spans the
/// cluster's presence in the runtime, not any single bundle.
pub struct ClusterClients {
    pub meta: ClusterMeta,
    pub selection: ClusterSelection,
    pub kubeconfig_path: String,
    pub kubeconfig_context: Option<String>,
    pub kube: Option<KubeHandles>,
    pub api: Arc<dyn ClusterApi>,
    pub auth: Arc<AuthManager>,
    auth_failed_on_init: AtomicBool,
}

impl ClusterClients {
    pub fn new(
        selection: ClusterSelection,
        meta: ClusterMeta,
        kube: Option<KubeHandles>,
        api: Arc<dyn ClusterApi>,
        auth: Arc<AuthManager>,
        auth_failed_on_init: bool,
    ) -> Self {
        Self {
            kubeconfig_path: selection.path.clone(),
            kubeconfig_context: selection.context.clone(),
            meta,
            selection,
            kube,
            api,
            auth,
            auth_failed_on_init: AtomicBool::new(auth_failed_on_init),
        }
    }

    /// True iff the credential pre-flight failed when this bundle was built.
    /// The cluster remains listed and retriable.
    pub fn auth_failed_on_init(&self) -> bool {
        self.auth_failed_on_init.load(Ordering::Relaxed)
    }

    pub fn clear_auth_failed_on_init(&self) {
        self.auth_failed_on_init.store(false, Ordering::Relaxed);
    }

    /// A bundle identical to this one except for the auth manager. Used on
    /// rebuild to carry the long-lived manager into the fresh bundle.
    pub fn with_auth(self, auth: Arc<AuthManager>) -> Self {
        Self { auth, ..self }
    }
}

impl std::fmt::Debug for ClusterClients {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterClients")
            .field("meta", &self.meta)
            .field("kubeconfig_path", &self.kubeconfig_path)
            .field("auth_failed_on_init", &self.auth_failed_on_init())
            .finish()
    }
}

/// Output of a client factory build.
pub struct BuiltApi {
    pub api: Arc<dyn ClusterApi>,
    pub kube: Option<KubeHandles>,
    pub preflight_failed: bool,
}

/// Builds the API surface for one cluster.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn build(
        &self,
        selection: &ClusterSelection,
        meta: &ClusterMeta,
    ) -> Result<BuiltApi, KubedeckError>;
}

/// An API surface for a cluster whose clients could not be constructed at
/// all. Every call fails with the original build error; auth recovery keeps
/// probing through it until a rebuild succeeds.
pub struct UnavailableApi {
    message: String,
}

impl UnavailableApi {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    fn err(&self) -> KubedeckError {
        KubedeckError::ClientsUnavailable(self.message.clone())
    }
}

#[async_trait]
impl ClusterApi for UnavailableApi {
    async fn check_ready(&self, _timeout: Duration) -> Result<(), KubedeckError> {
        Err(self.err())
    }

    async fn preflight(&self) -> Result<(), KubedeckError> {
        Err(self.err())
    }

    async fn list_resources(
        &self,
        _domain: &str,
        _namespace: Option<&str>,
    ) -> Result<Vec<SnapshotEntry>, KubedeckError> {
        Err(self.err())
    }

    async fn discover_catalog(&self) -> Result<Vec<CatalogEntry>, KubedeckError> {
        Err(self.err())
    }
}

/// Credential probe backed by a bundle's API surface.
pub struct ApiAuthProbe {
    api: Arc<dyn ClusterApi>,
}

impl ApiAuthProbe {
    pub fn new(api: Arc<dyn ClusterApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl AuthProbe for ApiAuthProbe {
    async fn probe(&self) -> Result<(), KubedeckError> {
        self.api.preflight().await
    }
}

/// Maps a snapshot domain to the group-version-kinds it covers.
pub fn domain_targets(domain: &str) -> Result<Vec<GroupVersionKind>, KubedeckError> {
    let gvks = match domain {
        "workloads" => vec![
            GroupVersionKind::gvk("apps", "v1", "Deployment"),
            GroupVersionKind::gvk("apps", "v1", "DaemonSet"),
            GroupVersionKind::gvk("apps", "v1", "StatefulSet"),
        ],
        "pods" => vec![GroupVersionKind::gvk("", "v1", "Pod")],
        "services" => vec![GroupVersionKind::gvk("", "v1", "Service")],
        "namespaces" => vec![GroupVersionKind::gvk("", "v1", "Namespace")],
        "nodes" => vec![GroupVersionKind::gvk("", "v1", "Node")],
        "config" => vec![
            GroupVersionKind::gvk("", "v1", "ConfigMap"),
            GroupVersionKind::gvk("", "v1", "Secret"),
        ],
        "events" => vec![GroupVersionKind::gvk("", "v1", "Event")],
        other => {
            return Err(KubedeckError::InvalidScope(format!(
                "unknown snapshot domain '{other}'"
            )));
        }
    };
    Ok(gvks)
}

/// Maps a resource kind (as used by the resource stream protocol) to its GVK.
pub fn kind_to_gvk(kind: &str) -> Result<GroupVersionKind, KubedeckError> {
    let gvk = match kind {
        "Pod" => GroupVersionKind::gvk("", "v1", "Pod"),
        "Service" => GroupVersionKind::gvk("", "v1", "Service"),
        "ConfigMap" => GroupVersionKind::gvk("", "v1", "ConfigMap"),
        "Secret" => GroupVersionKind::gvk("", "v1", "Secret"),
        "Namespace" => GroupVersionKind::gvk("", "v1", "Namespace"),
        "Node" => GroupVersionKind::gvk("", "v1", "Node"),
        "Event" => GroupVersionKind::gvk("", "v1", "Event"),
        "Deployment" => GroupVersionKind::gvk("apps", "v1", "Deployment"),
        "DaemonSet" => GroupVersionKind::gvk("apps", "v1", "DaemonSet"),
        "StatefulSet" => GroupVersionKind::gvk("apps", "v1", "StatefulSet"),
        "ReplicaSet" => GroupVersionKind::gvk("apps", "v1", "ReplicaSet"),
        "Job" => GroupVersionKind::gvk("batch", "v1", "Job"),
        "CronJob" => GroupVersionKind::gvk("batch", "v1", "CronJob"),
        other => {
            return Err(KubedeckError::InvalidScope(format!(
                "unknown resource kind '{other}'"
            )));
        }
    };
    Ok(gvk)
}

/// The production `ClusterApi`: one kube client serving typed, dynamic, and
/// api-extensions reads against a single cluster.
pub struct KubeClusterApi {
    client: kube::Client,
}

impl KubeClusterApi {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn dynamic_api(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
    ) -> Api<DynamicObject> {
        let ar = ApiResource::from_gvk(gvk);
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        }
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn check_ready(&self, timeout: Duration) -> Result<(), KubedeckError> {
        let request = http::Request::builder()
            .uri("/readyz")
            .body(Vec::new())
            .map_err(|e| KubedeckError::Internal(format!("failed to build probe request: {e}")))?;
        match tokio::time::timeout(timeout, self.client.request_text(request)).await {
            Err(_) => Err(KubedeckError::Timeout("/readyz probe timed out".to_string())),
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
        }
    }

    async fn preflight(&self) -> Result<(), KubedeckError> {
        self.client.apiserver_version().await?;
        Ok(())
    }

    async fn list_resources(
        &self,
        domain: &str,
        namespace: Option<&str>,
    ) -> Result<Vec<SnapshotEntry>, KubedeckError> {
        let targets = domain_targets(domain)?;
        let total = targets.len();
        let mut forbidden = Vec::new();
        let mut entries = Vec::new();
        for gvk in targets {
            let api = self.dynamic_api(&gvk, namespace);
            let list = match api.list(&ListParams::default()).await {
                Ok(list) => list,
                // A forbidden GVR is a per-resource condition, never a reason
                // to treat the cluster's credentials as broken.
                Err(kube::Error::Api(status)) if status.code == 403 => {
                    warn!("Listing {} is forbidden: {}", gvk.kind, status.message);
                    forbidden.push(gvk.kind.clone());
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            for object in list.items {
                let name = object.metadata.name.clone().unwrap_or_default();
                let ns = object.metadata.namespace.clone();
                entries.push(SnapshotEntry {
                    cluster_id: String::new(),
                    cluster_name: String::new(),
                    kind: gvk.kind.clone(),
                    namespace: ns,
                    name,
                    payload: serde_json::to_value(&object)?,
                });
            }
        }
        if entries.is_empty() && !forbidden.is_empty() && forbidden.len() == total {
            return Err(KubedeckError::PermissionIssue {
                resource: forbidden.join(","),
                message: "listing forbidden for every resource in the domain".to_string(),
            });
        }
        Ok(entries)
    }

    async fn discover_catalog(&self) -> Result<Vec<CatalogEntry>, KubedeckError> {
        let discovery = Discovery::new(self.client.clone()).run().await?;
        let mut catalog = Vec::new();
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                catalog.push(CatalogEntry {
                    kind: ar.kind,
                    group: ar.group,
                    version: ar.version,
                    namespaced: caps.scope == Scope::Namespaced,
                });
            }
        }
        Ok(catalog)
    }
}

/// Builds kube clients from a kubeconfig selection.
#[derive(Debug, Default)]
pub struct KubeClientFactory;

impl KubeClientFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ClientFactory for KubeClientFactory {
    async fn build(
        &self,
        selection: &ClusterSelection,
        meta: &ClusterMeta,
    ) -> Result<BuiltApi, KubedeckError> {
        let mut kubeconfig = Kubeconfig::read_from(&selection.path)?;
        wrap_exec_providers(&mut kubeconfig);

        let options = KubeConfigOptions {
            context: selection.context.clone(),
            cluster: None,
            user: None,
        };
        let rest_config = kube::Config::from_custom_kubeconfig(kubeconfig, &options).await?;
        let client = kube::Client::try_from(rest_config.clone())
            .map_err(|e| KubedeckError::Kubeconfig(e.to_string()))?;

        let api: Arc<dyn ClusterApi> = Arc::new(KubeClusterApi::new(client.clone()));

        // Credential pre-flight. A failure does not fail the build; the
        // cluster stays listed with auth_failed_on_init set.
        let preflight_failed = match api.preflight().await {
            Ok(()) => false,
            Err(e) => {
                warn!(
                    "Cluster '{}' credential pre-flight failed: {}",
                    meta.id, e
                );
                true
            }
        };
        if !preflight_failed {
            debug!("Cluster '{}' clients built and verified.", meta.id);
        }

        Ok(BuiltApi {
            api,
            kube: Some(KubeHandles {
                client,
                rest_config,
            }),
            preflight_failed,
        })
    }
}

/// On Windows, exec credential providers must run through the backend's own
/// `--ly-exec-wrapper` mode so the helper gets a hidden console and preserved
/// stdio. Idempotent: already-wrapped entries are left alone.
#[cfg(windows)]
fn wrap_exec_providers(kubeconfig: &mut Kubeconfig) {
    let wrapper = match std::env::current_exe() {
        Ok(path) => path.to_string_lossy().into_owned(),
        Err(e) => {
            warn!("Cannot resolve current executable for exec wrapping: {}", e);
            return;
        }
    };
    for named in &mut kubeconfig.auth_infos {
        let Some(auth_info) = named.auth_info.as_mut() else {
            continue;
        };
        let Some(exec) = auth_info.exec.as_mut() else {
            continue;
        };
        let Some(command) = exec.command.take() else {
            continue;
        };
        if command == wrapper {
            exec.command = Some(command);
            continue;
        }
        let mut args = vec!["--ly-exec-wrapper".to_string(), command];
        args.extend(exec.args.take().unwrap_or_default());
        exec.command = Some(wrapper.clone());
        exec.args = Some(args);
    }
}

#[cfg(not(windows))]
fn wrap_exec_providers(_kubeconfig: &mut Kubeconfig) {}
